//! crates/cv_pipeline_core/src/orchestrator.rs
//!
//! The processing orchestrator: sequences page extraction and analysis for
//! one document, persists every status transition, and funnels all fatal
//! conditions through a single "mark the run as failed" path.
//!
//! Pages are extracted strictly one at a time and in order. A page after the
//! first that yields nothing is logged and skipped; a failing first page ends
//! the run immediately. Clients driving the run page by page must send pages
//! in order; the document's page cursor enforces it.

use crate::aggregator::{ensure_min_text, extraction_progress, PageAggregator};
use crate::config::PipelineConfig;
use crate::domain::{Document, DocumentStatus, PageCursor, StructuredData};
use crate::error::{PageError, PipelineError};
use crate::extractor::StructuredDataExtractor;
use crate::ports::{
    DocumentStore, DocumentUpdate, ImageFetcher, LanguageModelService, OcrService, PortError,
};
use crate::selector::{ExtractionMethod, PageExtraction, TextExtractionSelector};
use std::future::Future;
use std::sync::Arc;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

/// Progress reported once aggregation has been validated.
const ANALYSIS_START_PROGRESS: f64 = 50.0;
const COMPLETED_PROGRESS: f64 = 100.0;

/// The response of the page-extraction stage.
#[derive(Debug, Clone, PartialEq)]
pub struct PageOutcome {
    pub page_number: usize,
    pub extracted_text: String,
    pub method: Option<ExtractionMethod>,
    pub progress: f64,
}

//=========================================================================================
// Run tracking
//=========================================================================================

/// Mirrors the persisted status of one run so every write is a legal
/// transition and progress never goes backwards.
struct RunTracker {
    document_id: Uuid,
    status: DocumentStatus,
    progress: f64,
}

impl RunTracker {
    /// Tracks a brand new run; progress restarts from zero.
    fn fresh(document: &Document) -> Self {
        Self {
            document_id: document.id,
            status: document.status,
            progress: 0.0,
        }
    }

    /// Picks up where a persisted, interrupted run left off.
    fn continuing(document: &Document) -> Self {
        Self {
            document_id: document.id,
            status: document.status,
            progress: document.progress,
        }
    }

    fn advance(
        &mut self,
        next: DocumentStatus,
        progress: Option<f64>,
    ) -> Result<DocumentUpdate, PipelineError> {
        if !self.status.can_transition_to(next) {
            return Err(PipelineError::InvalidTransition {
                document_id: self.document_id,
                from: self.status,
                to: next,
            });
        }
        self.status = next;
        let mut update = DocumentUpdate::status(next);
        if let Some(progress) = progress {
            self.progress = progress.clamp(0.0, 100.0).max(self.progress);
            update = update.with_progress(self.progress);
        }
        Ok(update)
    }
}

//=========================================================================================
// The Orchestrator
//=========================================================================================

pub struct Orchestrator {
    store: Arc<dyn DocumentStore>,
    selector: TextExtractionSelector,
    extractor: StructuredDataExtractor,
    config: PipelineConfig,
}

impl Orchestrator {
    pub fn new(
        store: Arc<dyn DocumentStore>,
        ocr: Arc<dyn OcrService>,
        fetcher: Option<Arc<dyn ImageFetcher>>,
        model: Arc<dyn LanguageModelService>,
        config: PipelineConfig,
    ) -> Self {
        Self {
            selector: TextExtractionSelector::new(ocr, fetcher, config.selector.clone()),
            extractor: StructuredDataExtractor::new(model, config.analysis.clone()),
            store,
            config,
        }
    }

    /// Registers a new document in the `uploading` state.
    pub async fn create_document(&self, page_image_refs: Vec<String>) -> Result<Document, PipelineError> {
        let page_image_refs: Vec<String> = page_image_refs
            .into_iter()
            .map(|r| r.trim().to_string())
            .filter(|r| !r.is_empty())
            .collect();
        if page_image_refs.is_empty() {
            return Err(PipelineError::NoPages);
        }
        let document = self.store.create_document(&page_image_refs).await?;
        info!(document_id = %document.id, pages = page_image_refs.len(), "Document created.");
        Ok(document)
    }

    /// Runs every stage for a document: all pages, then analysis.
    ///
    /// Any fatal condition is persisted on the document before it is returned.
    pub async fn run(&self, document_id: Uuid) -> Result<Document, PipelineError> {
        self.guarded(document_id, self.run_from_first_page(document_id))
            .await
    }

    /// Continues an interrupted run from its persisted state.
    ///
    /// If the stored text already passes the minimum-length check, analysis
    /// runs directly. Otherwise page extraction starts over. Documents that
    /// already reached a terminal state are returned unchanged.
    pub async fn resume(&self, document_id: Uuid) -> Result<Document, PipelineError> {
        self.guarded(document_id, self.resume_from_state(document_id))
            .await
    }

    /// Extracts a single page on behalf of a client that drives the run
    /// page by page, appending its text to the stored aggregation.
    ///
    /// Page 1 starts the aggregation over. Any other page must follow the
    /// last one handled, or repeat it to replace that page's text.
    pub async fn extract_page(
        &self,
        document_id: Uuid,
        page_image_ref: &str,
        page_number: usize,
        total_pages: usize,
    ) -> Result<PageOutcome, PipelineError> {
        if page_number == 0 || page_number > total_pages {
            return Err(PipelineError::PageOutOfRange {
                page_number,
                total_pages,
            });
        }
        self.guarded(
            document_id,
            self.extract_single_page(document_id, page_image_ref, page_number, total_pages),
        )
        .await
    }

    /// Analyzes text aggregated by the client and completes the document.
    pub async fn analyze(
        &self,
        document_id: Uuid,
        aggregated_text: &str,
    ) -> Result<StructuredData, PipelineError> {
        self.guarded(document_id, async {
            let document = self.load(document_id).await?;
            if document.status.is_terminal() {
                return Err(PipelineError::InvalidTransition {
                    document_id,
                    from: document.status,
                    to: DocumentStatus::Processing,
                });
            }
            ensure_min_text(aggregated_text, self.config.thresholds.min_text_chars)?;
            let mut tracker = RunTracker::continuing(&document);
            let completed = self
                .analyze_text(document, aggregated_text.trim().to_string(), &mut tracker)
                .await?;
            completed
                .structured_data
                .ok_or_else(|| PipelineError::Store(PortError::Unexpected(
                    "completed document has no structured data".to_string(),
                )))
        })
        .await
    }

    /// The single failure path: persists `status=error` with a user-facing
    /// message. Store failures here are logged, never retried.
    pub async fn fail(&self, document_id: Uuid, err: &PipelineError) {
        if !err.is_fatal_for_run() {
            warn!(document_id = %document_id, error = %err, "Request rejected; document left unchanged.");
            return;
        }
        error!(document_id = %document_id, error = %err, "Run failed.");
        if let Err(store_err) = self.store.mark_error(document_id, &err.user_message()).await {
            error!(
                document_id = %document_id,
                error = %store_err,
                "Could not record the failure on the document."
            );
        }
    }

    //-------------------------------------------------------------------------------------
    // Stage drivers
    //-------------------------------------------------------------------------------------

    async fn guarded<T, F>(&self, document_id: Uuid, stage: F) -> Result<T, PipelineError>
    where
        F: Future<Output = Result<T, PipelineError>>,
    {
        let outcome = match self.config.run_timeout {
            Some(limit) => match tokio::time::timeout(limit, stage).await {
                Ok(outcome) => outcome,
                Err(_) => Err(PipelineError::TimedOut {
                    secs: limit.as_secs(),
                }),
            },
            None => stage.await,
        };
        if let Err(err) = &outcome {
            self.fail(document_id, err).await;
        }
        outcome
    }

    async fn run_from_first_page(&self, document_id: Uuid) -> Result<Document, PipelineError> {
        let mut document = self.load(document_id).await?;
        if document.page_image_refs.is_empty() {
            return Err(PipelineError::NoPages);
        }

        let mut tracker = RunTracker::fresh(&document);
        let mut begin = tracker
            .advance(DocumentStatus::Extracting, None)?
            .with_page_cursor(PageCursor::default());
        if document.progress > 0.0 {
            begin = begin.with_progress(0.0);
        }
        if !document.aggregated_text.is_empty() {
            begin = begin.with_aggregated_text(String::new());
        }
        self.persist(&mut document, begin).await?;
        info!(
            document_id = %document_id,
            pages = document.page_image_refs.len(),
            "Processing run started."
        );

        let text = self.extract_all_pages(&mut document, &mut tracker).await?;
        self.analyze_text(document, text, &mut tracker).await
    }

    async fn resume_from_state(&self, document_id: Uuid) -> Result<Document, PipelineError> {
        let document = self.load(document_id).await?;
        if document.status.is_terminal() {
            info!(document_id = %document_id, status = %document.status, "Nothing to resume.");
            return Ok(document);
        }

        let text_check = ensure_min_text(
            &document.aggregated_text,
            self.config.thresholds.min_text_chars,
        );
        match (document.status, text_check) {
            (DocumentStatus::Extracting | DocumentStatus::Processing, Ok(())) => {
                info!(document_id = %document_id, "Resuming at analysis with stored text.");
                let mut tracker = RunTracker::continuing(&document);
                let text = document.aggregated_text.trim().to_string();
                self.analyze_text(document, text, &mut tracker).await
            }
            // Analysis had started, so the stored text is all there is.
            (DocumentStatus::Processing, Err(e)) => Err(e),
            _ => {
                info!(document_id = %document_id, "Restarting page extraction.");
                self.run_from_first_page(document_id).await
            }
        }
    }

    async fn extract_all_pages(
        &self,
        document: &mut Document,
        tracker: &mut RunTracker,
    ) -> Result<String, PipelineError> {
        let page_image_refs = document.page_image_refs.clone();
        let total_pages = page_image_refs.len();
        let mut aggregator = PageAggregator::new();

        for (index, page_ref) in page_image_refs.iter().enumerate() {
            let page_number = index + 1;
            let page_start = aggregator.len();
            info!(document_id = %tracker.document_id, page_number, total_pages, "Extracting page.");

            match self.extract_page_text(page_number, page_ref).await {
                Ok(extraction) => aggregator.push(page_number, &extraction.text),
                Err(e) if page_number == 1 => return Err(PipelineError::FirstPageFailed(e)),
                Err(e) => {
                    warn!(document_id = %tracker.document_id, error = %e, "Page skipped.");
                }
            }

            let update = tracker
                .advance(
                    DocumentStatus::Extracting,
                    Some(extraction_progress(page_number, total_pages)),
                )?
                .with_aggregated_text(aggregator.text())
                .with_page_cursor(PageCursor::new(page_number, page_start));
            self.persist(document, update).await?;
        }

        info!(
            document_id = %tracker.document_id,
            contributing_pages = aggregator.contributions(),
            chars = aggregator.text().chars().count(),
            "Page extraction finished."
        );
        aggregator.finish(self.config.thresholds.min_text_chars)
    }

    async fn extract_single_page(
        &self,
        document_id: Uuid,
        page_image_ref: &str,
        page_number: usize,
        total_pages: usize,
    ) -> Result<PageOutcome, PipelineError> {
        let document = self.load(document_id).await?;
        let cursor = document.page_cursor;
        let replaces_last = page_number > 1 && page_number == cursor.page;
        if page_number > 1 && page_number != cursor.next_page() && !replaces_last {
            return Err(PipelineError::PageOutOfOrder {
                page_number,
                expected: cursor.next_page(),
            });
        }

        let mut tracker = if page_number == 1 {
            RunTracker::fresh(&document)
        } else {
            RunTracker::continuing(&document)
        };
        // Validate the transition before spending any OCR calls.
        if !tracker.status.can_transition_to(DocumentStatus::Extracting) {
            return Err(PipelineError::InvalidTransition {
                document_id,
                from: tracker.status,
                to: DocumentStatus::Extracting,
            });
        }
        let progress = extraction_progress(page_number, total_pages);

        let extraction = match self.extract_page_text(page_number, page_image_ref).await {
            Ok(extraction) => extraction,
            Err(e) if page_number == 1 => return Err(PipelineError::FirstPageFailed(e)),
            Err(e) => {
                // The page still counts as attempted. Text already stored stays.
                let mut update = tracker.advance(DocumentStatus::Extracting, Some(progress))?;
                if !replaces_last {
                    update = update.with_page_cursor(PageCursor::new(
                        page_number,
                        document.aggregated_text.len(),
                    ));
                }
                self.store.update_document(document_id, update).await?;
                return Err(PipelineError::PageFailed(e));
            }
        };

        let mut aggregator = if page_number == 1 {
            PageAggregator::new()
        } else {
            PageAggregator::from_text(document.aggregated_text)
        };
        if replaces_last {
            debug!(document_id = %document_id, page_number, "Replacing the last page's text.");
            aggregator.rewind(cursor.offset);
        }
        let page_start = aggregator.len();
        aggregator.push(page_number, &extraction.text);

        let update = tracker
            .advance(DocumentStatus::Extracting, Some(progress))?
            .with_aggregated_text(aggregator.text())
            .with_page_cursor(PageCursor::new(page_number, page_start));
        self.store.update_document(document_id, update).await?;

        Ok(PageOutcome {
            page_number,
            extracted_text: extraction.text,
            method: extraction.method,
            progress: tracker.progress,
        })
    }

    /// `extracting → processing → completed` over already-validated text.
    ///
    /// Returns the completed document as written, without reading it back.
    async fn analyze_text(
        &self,
        mut document: Document,
        text: String,
        tracker: &mut RunTracker,
    ) -> Result<Document, PipelineError> {
        let document_id = document.id;
        let enter = if tracker.status == DocumentStatus::Processing {
            // A resumed analysis is already in `processing`.
            DocumentUpdate::status(DocumentStatus::Processing)
                .with_progress(tracker.progress.max(ANALYSIS_START_PROGRESS))
        } else {
            tracker.advance(DocumentStatus::Processing, Some(ANALYSIS_START_PROGRESS))?
        };
        tracker.progress = tracker.progress.max(ANALYSIS_START_PROGRESS);
        self.persist(&mut document, enter.with_aggregated_text(text.clone()))
            .await?;
        info!(document_id = %document_id, chars = text.chars().count(), "Analysis started.");

        let data = self.extractor.extract(&text).await?;

        let finish = tracker
            .advance(DocumentStatus::Completed, Some(COMPLETED_PROGRESS))?
            .with_structured_data(data);
        self.persist(&mut document, finish).await?;
        info!(document_id = %document_id, "Processing completed.");

        Ok(document)
    }

    //-------------------------------------------------------------------------------------
    // Helpers
    //-------------------------------------------------------------------------------------

    /// Runs the selector under the page retry policy.
    ///
    /// A weak result is retried after the policy's backoff and the longest
    /// result wins. The page only fails when no attempt got any OCR answer.
    async fn extract_page_text(
        &self,
        page_number: usize,
        page_ref: &str,
    ) -> Result<PageExtraction, PageError> {
        let policy = &self.config.retry;
        let max_attempts = policy.max_attempts.max(1);
        let mut best: Option<PageExtraction> = None;
        let mut last_failure = String::new();

        for attempt in 1..=max_attempts {
            if attempt > 1 {
                let delay = policy.delay_for(attempt - 1);
                debug!(page_number, attempt, delay_ms = delay.as_millis() as u64, "Retrying page.");
                tokio::time::sleep(delay).await;
            }

            let extraction = self.selector.extract(page_ref).await;
            if extraction.all_failed() {
                last_failure = extraction.failure_summary();
                warn!(page_number, attempt, failures = %last_failure, "No OCR strategy answered.");
                continue;
            }

            let accepted = policy.accepts(&extraction.text);
            if best.as_ref().map_or(true, |b| extraction.chars() > b.chars()) {
                best = Some(extraction);
            }
            if accepted {
                break;
            }
            debug!(page_number, attempt, "Page text below the acceptance bar.");
        }

        match best {
            Some(extraction) => {
                info!(
                    page_number,
                    chars = extraction.chars(),
                    method = extraction.method.map(|m| m.as_str()).unwrap_or("none"),
                    "Page text selected."
                );
                Ok(extraction)
            }
            None => Err(PageError::AllStrategiesFailed {
                page_number,
                attempts: max_attempts,
                detail: last_failure,
            }),
        }
    }

    /// Writes `update` and mirrors it on the in-memory copy.
    async fn persist(
        &self,
        document: &mut Document,
        update: DocumentUpdate,
    ) -> Result<(), PipelineError> {
        self.store.update_document(document.id, update.clone()).await?;
        update.apply_to(document);
        Ok(())
    }

    async fn load(&self, document_id: Uuid) -> Result<Document, PipelineError> {
        self.store
            .get_document(document_id)
            .await
            .map_err(|e| match e {
                PortError::NotFound(_) => PipelineError::DocumentNotFound(document_id),
                other => PipelineError::Store(other),
            })
    }
}
