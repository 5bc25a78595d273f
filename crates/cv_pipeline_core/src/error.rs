//! crates/cv_pipeline_core/src/error.rs
//!
//! Error types for the CV pipeline.
//!
//! * [`PipelineError`] is fatal for a run: it ends with the document in the
//!   `error` state (or, for caller mistakes, leaves the document untouched).
//! * [`PageError`] is a single page that produced nothing. The orchestrator
//!   decides whether it is fatal (page 1) or just a missing contribution.

use crate::domain::DocumentStatus;
use crate::ports::PortError;
use uuid::Uuid;

#[derive(Debug, thiserror::Error)]
pub enum PipelineError {
    // ── Caller errors (the document is not touched) ───────────────────────
    #[error("Document {0} not found")]
    DocumentNotFound(Uuid),

    #[error("Document {document_id} cannot move from '{from}' to '{to}'")]
    InvalidTransition {
        document_id: Uuid,
        from: DocumentStatus,
        to: DocumentStatus,
    },

    #[error("Page {page_number} is outside 1..={total_pages}")]
    PageOutOfRange { page_number: usize, total_pages: usize },

    #[error("Page {page_number} is out of order, expected page {expected}")]
    PageOutOfOrder { page_number: usize, expected: usize },

    /// A page after the first one produced nothing. The run carries on.
    #[error("Text extraction failed: {0}")]
    PageFailed(#[source] PageError),

    // ── Fatal run conditions ──────────────────────────────────────────────
    #[error("Document has no page images to process")]
    NoPages,

    #[error("Text extraction failed on the first page: {0}")]
    FirstPageFailed(#[source] PageError),

    #[error("Not enough text could be extracted from the images ({chars} characters, at least {minimum} required)")]
    InsufficientText { chars: usize, minimum: usize },

    #[error("Language model request failed: {0}")]
    ModelInvocation(#[source] PortError),

    #[error("Language model returned an empty reply")]
    EmptyReply,

    /// The reply could not be parsed. `raw` is kept for diagnostics and is
    /// never part of the user-facing message.
    #[error("Language model reply is not a valid JSON object: {reason}")]
    MalformedReply { reason: String, raw: String },

    #[error("Language model reply is missing the 'personalInfo' section")]
    MissingPersonalInfo { raw: String },

    #[error("Document store error: {0}")]
    Store(#[source] PortError),

    #[error("Processing timed out after {secs}s")]
    TimedOut { secs: u64 },
}

impl PipelineError {
    /// Whether this condition should move the document to `error`.
    /// Caller mistakes are reported back without touching the record.
    pub fn is_fatal_for_run(&self) -> bool {
        !matches!(
            self,
            PipelineError::DocumentNotFound(_)
                | PipelineError::InvalidTransition { .. }
                | PipelineError::PageOutOfRange { .. }
                | PipelineError::PageOutOfOrder { .. }
                | PipelineError::PageFailed(_)
        )
    }

    /// The message persisted as the document's `errorMessage`.
    pub fn user_message(&self) -> String {
        match self {
            PipelineError::ModelInvocation(PortError::Unauthorized) => {
                "The language model service rejected the configured credentials".to_string()
            }
            PipelineError::ModelInvocation(PortError::QuotaExceeded(_)) => {
                "The language model service quota is exhausted, try again later".to_string()
            }
            PipelineError::ModelInvocation(_) => {
                "The language model service could not be reached".to_string()
            }
            PipelineError::Store(_) => "The document could not be saved".to_string(),
            other => other.to_string(),
        }
    }

    /// The raw model reply attached to parse failures, if any.
    pub fn raw_reply(&self) -> Option<&str> {
        match self {
            PipelineError::MalformedReply { raw, .. } | PipelineError::MissingPersonalInfo { raw } => {
                Some(raw.as_str())
            }
            _ => None,
        }
    }
}

impl From<PortError> for PipelineError {
    fn from(err: PortError) -> Self {
        PipelineError::Store(err)
    }
}

/// A single page that yielded no OCR response at all.
#[derive(Debug, Clone, thiserror::Error)]
pub enum PageError {
    #[error("page {page_number}: every extraction strategy failed ({attempts} attempt(s)): {detail}")]
    AllStrategiesFailed {
        page_number: usize,
        attempts: u32,
        detail: String,
    },
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn model_errors_are_categorized_for_users() {
        let auth = PipelineError::ModelInvocation(PortError::Unauthorized);
        assert!(auth.user_message().contains("credentials"));

        let quota = PipelineError::ModelInvocation(PortError::QuotaExceeded("429".into()));
        assert!(quota.user_message().contains("quota"));

        let other = PipelineError::ModelInvocation(PortError::Unexpected("socket hang up".into()));
        assert!(!other.user_message().contains("socket"));
    }

    #[test]
    fn raw_reply_stays_out_of_the_user_message() {
        let err = PipelineError::MalformedReply {
            reason: "expected value at line 1 column 1".into(),
            raw: "Sure! Here is the candidate...".into(),
        };
        assert!(!err.user_message().contains("Sure!"));
        assert_eq!(err.raw_reply(), Some("Sure! Here is the candidate..."));
    }

    #[test]
    fn caller_errors_do_not_fail_the_run() {
        assert!(!PipelineError::DocumentNotFound(Uuid::nil()).is_fatal_for_run());
        assert!(!PipelineError::PageOutOfOrder { page_number: 3, expected: 2 }.is_fatal_for_run());
        assert!(PipelineError::InsufficientText { chars: 10, minimum: 50 }.is_fatal_for_run());
    }
}
