//! crates/cv_pipeline_core/src/selector.rs
//!
//! Picks the best transcription of one page image by walking an ordered chain
//! of OCR strategies. Each step only runs while the best text so far is below
//! its quality bar, and a failing step is logged and skipped rather than
//! aborting the chain.
//!
//! 1. Full-document mode (dense paragraphs).
//! 2. Generic text detection with broader language hints, if still weak.
//! 3. Both modes in one combined request, if still short.
//! 4. Download the image ourselves and resubmit it inline, for remote URIs the
//!    OCR service could not dereference.

use crate::config::SelectorConfig;
use crate::ports::{ImageFetcher, ImageSource, OcrFeature, OcrRequest, OcrResponse, OcrService};
use base64::Engine as _;
use once_cell::sync::Lazy;
use regex::Regex;
use std::fmt;
use std::sync::Arc;
use tracing::{debug, warn};

/// Which step of the chain produced a page's text.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ExtractionMethod {
    DocumentText,
    TextDetection,
    CombinedFeatures,
    InlineDocumentText,
}

impl ExtractionMethod {
    pub fn as_str(&self) -> &'static str {
        match self {
            ExtractionMethod::DocumentText => "document_text_detection",
            ExtractionMethod::TextDetection => "text_detection",
            ExtractionMethod::CombinedFeatures => "combined_features",
            ExtractionMethod::InlineDocumentText => "inline_document_text_detection",
        }
    }
}

impl fmt::Display for ExtractionMethod {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum StepOutcome {
    /// The step answered; `chars` is the length of its normalized candidate.
    Answered { chars: usize },
    Failed(String),
}

/// One executed step, kept for diagnostics.
#[derive(Debug, Clone, PartialEq)]
pub struct StrategyAttempt {
    pub method: ExtractionMethod,
    pub outcome: StepOutcome,
}

/// The selector's verdict for one page.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct PageExtraction {
    /// Normalized text; may be empty.
    pub text: String,
    /// The step that produced `text`, `None` when no step answered.
    pub method: Option<ExtractionMethod>,
    pub attempts: Vec<StrategyAttempt>,
}

impl PageExtraction {
    pub fn chars(&self) -> usize {
        self.text.chars().count()
    }

    /// True when steps ran and every one of them failed.
    pub fn all_failed(&self) -> bool {
        !self.attempts.is_empty()
            && self
                .attempts
                .iter()
                .all(|a| matches!(a.outcome, StepOutcome::Failed(_)))
    }

    /// A one-line summary of the step failures.
    pub fn failure_summary(&self) -> String {
        self.attempts
            .iter()
            .filter_map(|a| match &a.outcome {
                StepOutcome::Failed(reason) => Some(format!("{}: {}", a.method, reason)),
                StepOutcome::Answered { .. } => None,
            })
            .collect::<Vec<_>>()
            .join("; ")
    }

    fn record(&mut self, method: ExtractionMethod, outcome: StepOutcome) {
        self.attempts.push(StrategyAttempt { method, outcome });
    }

    /// Adopts `candidate` if nothing has answered yet or it is strictly longer.
    fn offer(&mut self, method: ExtractionMethod, candidate: String) {
        let chars = candidate.chars().count();
        self.record(method, StepOutcome::Answered { chars });
        if self.method.is_none() || chars > self.chars() {
            self.text = candidate;
            self.method = Some(method);
        }
    }
}

//=========================================================================================
// Text normalization
//=========================================================================================

static RE_EXCESS_NEWLINES: Lazy<Regex> = Lazy::new(|| Regex::new(r"\n{3,}").unwrap());
static RE_EXCESS_SPACES: Lazy<Regex> = Lazy::new(|| Regex::new(r" {2,}").unwrap());

/// Collapses 3+ newlines to 2 and 2+ spaces to 1, then trims.
pub fn normalize_ocr_text(text: &str) -> String {
    let text = text.replace("\r\n", "\n");
    let text = RE_EXCESS_NEWLINES.replace_all(&text, "\n\n");
    let text = RE_EXCESS_SPACES.replace_all(&text, " ");
    text.trim().to_string()
}

//=========================================================================================
// Image references
//=========================================================================================

/// Whether the reference points at something we can download over HTTP.
pub fn is_remote_uri(page_ref: &str) -> bool {
    let lower = page_ref.trim_start().to_ascii_lowercase();
    lower.starts_with("http://") || lower.starts_with("https://")
}

/// Turns a page reference into an OCR image source.
/// `data:<mime>;base64,<payload>` references are decoded and sent inline.
pub fn resolve_image_source(page_ref: &str) -> Result<ImageSource, String> {
    let trimmed = page_ref.trim();
    let Some(rest) = trimmed.strip_prefix("data:") else {
        return Ok(ImageSource::Uri(trimmed.to_string()));
    };
    let (meta, payload) = rest
        .split_once(',')
        .ok_or_else(|| "data URI has no payload".to_string())?;
    if !meta.ends_with(";base64") {
        return Err("only base64 data URIs are supported".to_string());
    }
    base64::engine::general_purpose::STANDARD
        .decode(payload.trim())
        .map(ImageSource::Inline)
        .map_err(|e| format!("data URI payload is not valid base64: {e}"))
}

/// The full-text field, or the first region when the full text is empty.
fn primary_text(response: &OcrResponse) -> String {
    match response.full_text.as_deref() {
        Some(text) if !text.trim().is_empty() => text.to_string(),
        _ => response
            .regions
            .first()
            .map(|r| r.description.clone())
            .unwrap_or_default(),
    }
}

/// The longer of the full-text field and the first region.
fn longest_text(response: &OcrResponse) -> String {
    let full = normalize_ocr_text(response.full_text.as_deref().unwrap_or_default());
    let region = normalize_ocr_text(
        response
            .regions
            .first()
            .map(|r| r.description.as_str())
            .unwrap_or_default(),
    );
    if region.chars().count() > full.chars().count() {
        region
    } else {
        full
    }
}

//=========================================================================================
// The selector
//=========================================================================================

pub struct TextExtractionSelector {
    ocr: Arc<dyn OcrService>,
    fetcher: Option<Arc<dyn ImageFetcher>>,
    config: SelectorConfig,
}

impl TextExtractionSelector {
    pub fn new(
        ocr: Arc<dyn OcrService>,
        fetcher: Option<Arc<dyn ImageFetcher>>,
        config: SelectorConfig,
    ) -> Self {
        Self {
            ocr,
            fetcher,
            config,
        }
    }

    /// Runs the fallback chain for one page. Never fails: a page with no
    /// usable text comes back empty, with the step failures in `attempts`.
    pub async fn extract(&self, page_ref: &str) -> PageExtraction {
        let mut result = PageExtraction::default();

        let source = match resolve_image_source(page_ref) {
            Ok(source) => source,
            Err(reason) => {
                warn!(reason = %reason, "Page image reference could not be resolved.");
                result.record(ExtractionMethod::DocumentText, StepOutcome::Failed(reason));
                return result;
            }
        };

        self.run_step(
            &mut result,
            ExtractionMethod::DocumentText,
            source.clone(),
            vec![OcrFeature::DocumentText],
            &self.config.language_hints,
        )
        .await;

        if result.chars() < self.config.weak_text_chars {
            self.run_step(
                &mut result,
                ExtractionMethod::TextDetection,
                source.clone(),
                vec![OcrFeature::TextDetection],
                &self.config.fallback_language_hints,
            )
            .await;
        }

        if result.chars() < self.config.combined_retry_chars {
            self.run_step(
                &mut result,
                ExtractionMethod::CombinedFeatures,
                source.clone(),
                vec![OcrFeature::DocumentText, OcrFeature::TextDetection],
                &self.config.language_hints,
            )
            .await;
        }

        if result.chars() < self.config.weak_text_chars {
            if let (ImageSource::Uri(uri), Some(fetcher)) = (&source, &self.fetcher) {
                if is_remote_uri(uri) {
                    match fetcher.fetch_image(uri).await {
                        Ok(bytes) => {
                            self.run_step(
                                &mut result,
                                ExtractionMethod::InlineDocumentText,
                                ImageSource::Inline(bytes),
                                vec![OcrFeature::DocumentText],
                                &self.config.language_hints,
                            )
                            .await;
                        }
                        Err(e) => {
                            warn!(error = %e, "Raw image download failed.");
                            result.record(
                                ExtractionMethod::InlineDocumentText,
                                StepOutcome::Failed(format!("image download failed: {e}")),
                            );
                        }
                    }
                }
            }
        }

        debug!(
            method = result.method.map(|m| m.as_str()).unwrap_or("none"),
            chars = result.chars(),
            steps = result.attempts.len(),
            "Page extraction finished."
        );
        result
    }

    async fn run_step(
        &self,
        result: &mut PageExtraction,
        method: ExtractionMethod,
        source: ImageSource,
        features: Vec<OcrFeature>,
        hints: &[String],
    ) {
        let request = OcrRequest {
            source,
            features,
            language_hints: hints.to_vec(),
        };
        match self.ocr.annotate(&request).await {
            Ok(response) => {
                let candidate = match method {
                    ExtractionMethod::CombinedFeatures => longest_text(&response),
                    _ => normalize_ocr_text(&primary_text(&response)),
                };
                debug!(method = %method, chars = candidate.chars().count(), "OCR step answered.");
                result.offer(method, candidate);
            }
            Err(e) => {
                warn!(method = %method, error = %e, "OCR step failed, continuing with the next one.");
                result.record(method, StepOutcome::Failed(e.to_string()));
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ports::{PortError, PortResult, TextRegion};
    use async_trait::async_trait;
    use std::sync::Mutex;

    /// Answers each feature set with a fixed text, recording every request.
    struct FeatureOcr {
        document_text: PortResult<String>,
        text_detection: PortResult<String>,
        combined: PortResult<String>,
        inline: PortResult<String>,
        calls: Mutex<Vec<OcrRequest>>,
    }

    impl FeatureOcr {
        fn new(document_text: PortResult<String>, text_detection: PortResult<String>) -> Self {
            Self {
                document_text,
                text_detection,
                combined: Ok(String::new()),
                inline: Ok(String::new()),
                calls: Mutex::new(Vec::new()),
            }
        }

        fn calls(&self) -> Vec<OcrRequest> {
            self.calls.lock().unwrap().clone()
        }
    }

    #[async_trait]
    impl OcrService for FeatureOcr {
        async fn annotate(&self, request: &OcrRequest) -> PortResult<OcrResponse> {
            self.calls.lock().unwrap().push(request.clone());
            let answer = match (&request.source, request.features.as_slice()) {
                (ImageSource::Inline(_), _) => &self.inline,
                (_, [OcrFeature::DocumentText]) => &self.document_text,
                (_, [OcrFeature::TextDetection]) => &self.text_detection,
                _ => &self.combined,
            };
            answer.clone().map(|text| OcrResponse {
                full_text: None,
                regions: vec![TextRegion {
                    description: text,
                    confidence: Some(0.9),
                }],
            })
        }
    }

    struct StaticFetcher(PortResult<Vec<u8>>);

    #[async_trait]
    impl ImageFetcher for StaticFetcher {
        async fn fetch_image(&self, _uri: &str) -> PortResult<Vec<u8>> {
            self.0.clone()
        }
    }

    fn selector(ocr: Arc<FeatureOcr>, fetcher: Option<Arc<dyn ImageFetcher>>) -> TextExtractionSelector {
        TextExtractionSelector::new(ocr, fetcher, SelectorConfig::default())
    }

    #[tokio::test]
    async fn dense_first_result_stops_the_chain() {
        let ocr = Arc::new(FeatureOcr::new(Ok("a".repeat(500)), Ok("unused".into())));
        let result = selector(ocr.clone(), None).extract("https://img/1.png").await;

        assert_eq!(result.chars(), 500);
        assert_eq!(result.method, Some(ExtractionMethod::DocumentText));
        assert_eq!(ocr.calls().len(), 1);
    }

    #[tokio::test]
    async fn weak_first_result_falls_back_to_text_detection() {
        let ocr = Arc::new(FeatureOcr::new(Ok("0123456789".into()), Ok("b".repeat(300))));
        let result = selector(ocr.clone(), None).extract("https://img/1.png").await;

        assert_eq!(result.chars(), 300);
        assert_eq!(result.method, Some(ExtractionMethod::TextDetection));
        let calls = ocr.calls();
        assert_eq!(calls.len(), 2);
        assert_eq!(calls[1].language_hints, SelectorConfig::default().fallback_language_hints);
    }

    #[tokio::test]
    async fn failing_steps_do_not_abort_the_chain() {
        let mut ocr = FeatureOcr::new(
            Err(PortError::Unexpected("timeout".into())),
            Err(PortError::QuotaExceeded("429".into())),
        );
        ocr.combined = Ok("c".repeat(120));
        let ocr = Arc::new(ocr);

        let result = selector(ocr.clone(), None).extract("https://img/1.png").await;

        assert_eq!(result.method, Some(ExtractionMethod::CombinedFeatures));
        assert_eq!(result.chars(), 120);
        assert!(!result.all_failed());
        assert_eq!(result.attempts.len(), 3);
    }

    #[tokio::test]
    async fn remote_uri_is_resubmitted_inline_when_still_weak() {
        let mut ocr = FeatureOcr::new(Ok(String::new()), Ok("tiny".into()));
        ocr.inline = Ok("d".repeat(80));
        let ocr = Arc::new(ocr);
        let fetcher: Arc<dyn ImageFetcher> = Arc::new(StaticFetcher(Ok(vec![0x89, 0x50])));

        let result = selector(ocr.clone(), Some(fetcher)).extract("https://img/1.png").await;

        assert_eq!(result.method, Some(ExtractionMethod::InlineDocumentText));
        assert_eq!(result.chars(), 80);
        assert_eq!(ocr.calls().last().unwrap().source, ImageSource::Inline(vec![0x89, 0x50]));
    }

    #[tokio::test]
    async fn every_step_failing_is_reported_but_not_raised() {
        let mut ocr = FeatureOcr::new(
            Err(PortError::Unauthorized),
            Err(PortError::Unauthorized),
        );
        ocr.combined = Err(PortError::Unauthorized);
        let ocr = Arc::new(ocr);
        let fetcher: Arc<dyn ImageFetcher> =
            Arc::new(StaticFetcher(Err(PortError::NotFound("404".into()))));

        let result = selector(ocr, Some(fetcher)).extract("https://img/1.png").await;

        assert!(result.all_failed());
        assert_eq!(result.text, "");
        assert_eq!(result.method, None);
        assert!(result.failure_summary().contains("image download failed"));
    }

    #[tokio::test]
    async fn data_uris_are_sent_inline_and_never_downloaded() {
        let ocr = Arc::new(FeatureOcr::new(Ok(String::new()), Ok(String::new())));
        let fetcher: Arc<dyn ImageFetcher> = Arc::new(StaticFetcher(Ok(vec![1])));

        let result = selector(ocr.clone(), Some(fetcher))
            .extract("data:image/png;base64,AQID")
            .await;

        // Inline sources skip the download step: three OCR calls, no fourth.
        assert_eq!(ocr.calls().len(), 3);
        assert_eq!(ocr.calls()[0].source, ImageSource::Inline(vec![1, 2, 3]));
        assert_eq!(result.method, Some(ExtractionMethod::DocumentText));
    }

    #[test]
    fn normalization_collapses_runs_and_trims() {
        let raw = "  Jane  Doe\n\n\n\nSenior   Engineer\r\n\r\n\r\nRust  \n";
        assert_eq!(normalize_ocr_text(raw), "Jane Doe\n\nSenior Engineer\n\nRust");
    }

    #[test]
    fn primary_text_prefers_full_text_then_first_region() {
        let response = OcrResponse {
            full_text: Some("  ".into()),
            regions: vec![
                TextRegion {
                    description: "region one".into(),
                    confidence: None,
                },
                TextRegion {
                    description: "region two".into(),
                    confidence: None,
                },
            ],
        };
        assert_eq!(primary_text(&response), "region one");
    }

    #[test]
    fn malformed_data_uri_is_rejected() {
        assert!(resolve_image_source("data:image/png,plain").is_err());
        assert!(resolve_image_source("data:image/png;base64,@@@").is_err());
        assert_eq!(
            resolve_image_source(" https://x/y.png "),
            Ok(ImageSource::Uri("https://x/y.png".into()))
        );
    }
}
