//! crates/cv_pipeline_core/src/ports.rs
//!
//! Defines the service contracts (traits) for the pipeline's collaborators.
//! These traits form the boundary of the hexagonal architecture: the document
//! store, the OCR engine, the raw image fetcher and the language model are all
//! reached through them, so the pipeline never depends on a concrete vendor.

use crate::domain::{Document, DocumentStatus, PageCursor, StructuredData};
use async_trait::async_trait;
use chrono::Utc;
use uuid::Uuid;

//=========================================================================================
// Generic Port Error and Result Types
//=========================================================================================

/// A generic error type for all port operations.
/// Adapters classify vendor failures into these variants so the pipeline can
/// tell credential and quota problems apart from everything else.
#[derive(Debug, Clone, thiserror::Error)]
pub enum PortError {
    #[error("Item not found: {0}")]
    NotFound(String),
    #[error("Unauthorized")]
    Unauthorized,
    #[error("Quota exceeded: {0}")]
    QuotaExceeded(String),
    #[error("An unexpected error occurred: {0}")]
    Unexpected(String),
}

/// A convenience type alias for `Result<T, PortError>`.
pub type PortResult<T> = Result<T, PortError>;

//=========================================================================================
// Document Store
//=========================================================================================

/// A partial write against a stored document. `None` fields are left untouched.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct DocumentUpdate {
    pub status: Option<DocumentStatus>,
    pub progress: Option<f64>,
    pub aggregated_text: Option<String>,
    pub structured_data: Option<StructuredData>,
    pub page_cursor: Option<PageCursor>,
}

impl DocumentUpdate {
    pub fn status(status: DocumentStatus) -> Self {
        Self {
            status: Some(status),
            ..Default::default()
        }
    }

    pub fn with_progress(mut self, progress: f64) -> Self {
        self.progress = Some(progress);
        self
    }

    pub fn with_aggregated_text(mut self, text: impl Into<String>) -> Self {
        self.aggregated_text = Some(text.into());
        self
    }

    pub fn with_structured_data(mut self, data: StructuredData) -> Self {
        self.structured_data = Some(data);
        self
    }

    pub fn with_page_cursor(mut self, cursor: PageCursor) -> Self {
        self.page_cursor = Some(cursor);
        self
    }

    /// Applies the present fields to an in-memory document and stamps `updated_at`.
    pub fn apply_to(self, document: &mut Document) {
        if let Some(status) = self.status {
            document.status = status;
        }
        if let Some(progress) = self.progress {
            document.progress = progress;
        }
        if let Some(text) = self.aggregated_text {
            document.aggregated_text = text;
        }
        if let Some(data) = self.structured_data {
            document.structured_data = Some(data);
        }
        if let Some(cursor) = self.page_cursor {
            document.page_cursor = cursor;
        }
        document.updated_at = Utc::now();
    }
}

#[async_trait]
pub trait DocumentStore: Send + Sync {
    /// Persists a new document in the `uploading` state.
    async fn create_document(&self, page_image_refs: &[String]) -> PortResult<Document>;

    /// Fetches a document, or `PortError::NotFound`.
    async fn get_document(&self, document_id: Uuid) -> PortResult<Document>;

    async fn update_document(&self, document_id: Uuid, update: DocumentUpdate) -> PortResult<()>;

    /// Moves a document to `error` and records the message in one write.
    /// Documents already `completed` or `error` are left as they are.
    async fn mark_error(&self, document_id: Uuid, message: &str) -> PortResult<()>;

    /// All documents, newest first.
    async fn list_documents(&self) -> PortResult<Vec<Document>>;
}

//=========================================================================================
// OCR Service
//=========================================================================================

/// Where the OCR engine should read the page image from.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ImageSource {
    /// A locator the OCR service dereferences itself.
    Uri(String),
    /// Raw image bytes sent along with the request.
    Inline(Vec<u8>),
}

/// The detection modes an OCR request can ask for.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum OcrFeature {
    /// Dense-paragraph, full-document transcription.
    DocumentText,
    /// Generic text detection.
    TextDetection,
}

#[derive(Debug, Clone, PartialEq)]
pub struct OcrRequest {
    pub source: ImageSource,
    pub features: Vec<OcrFeature>,
    pub language_hints: Vec<String>,
}

/// One detected text region. `confidence` is advisory only.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct TextRegion {
    pub description: String,
    pub confidence: Option<f32>,
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct OcrResponse {
    pub full_text: Option<String>,
    pub regions: Vec<TextRegion>,
}

#[async_trait]
pub trait OcrService: Send + Sync {
    /// Runs text detection on one image.
    async fn annotate(&self, request: &OcrRequest) -> PortResult<OcrResponse>;
}

#[async_trait]
pub trait ImageFetcher: Send + Sync {
    /// Downloads the raw bytes behind a remote image locator.
    async fn fetch_image(&self, uri: &str) -> PortResult<Vec<u8>>;
}

//=========================================================================================
// Language Model
//=========================================================================================

#[derive(Debug, Clone, PartialEq)]
pub struct CompletionRequest {
    pub system: String,
    pub user: String,
    pub max_tokens: u32,
    pub temperature: f32,
}

#[async_trait]
pub trait LanguageModelService: Send + Sync {
    /// Returns the raw text of a single completion.
    async fn complete(&self, request: &CompletionRequest) -> PortResult<String>;
}
