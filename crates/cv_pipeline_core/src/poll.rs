//! crates/cv_pipeline_core/src/poll.rs
//!
//! Bounded waiting on a document's status, for clients that follow a run by
//! reading the record rather than subscribing to pushes.

use crate::config::PollPolicy;
use crate::domain::{Document, DocumentStatus};
use crate::ports::{DocumentStore, PortError};
use tracing::debug;
use uuid::Uuid;

#[derive(Debug, thiserror::Error)]
pub enum PollError {
    #[error("Document {0} not found")]
    NotFound(Uuid),

    #[error("Document did not finish after {attempts} status checks (last status '{last_status}')")]
    TimedOut {
        attempts: u32,
        last_status: DocumentStatus,
    },

    #[error("Document store error: {0}")]
    Store(#[source] PortError),
}

/// Reads the document every `policy.interval` until it is `completed` or
/// `error`, giving up after `policy.max_attempts` reads.
///
/// A terminal document is returned as is; an `error` outcome is data, not an
/// `Err`.
pub async fn wait_for_terminal(
    store: &dyn DocumentStore,
    document_id: Uuid,
    policy: PollPolicy,
) -> Result<Document, PollError> {
    let attempts = policy.max_attempts.max(1);
    let mut last_status = DocumentStatus::Uploading;

    for attempt in 1..=attempts {
        let document = store.get_document(document_id).await.map_err(|e| match e {
            PortError::NotFound(_) => PollError::NotFound(document_id),
            other => PollError::Store(other),
        })?;
        if document.status.is_terminal() {
            return Ok(document);
        }
        last_status = document.status;
        debug!(
            document_id = %document_id,
            attempt,
            status = %document.status,
            progress = document.progress,
            "Document still running."
        );
        if attempt < attempts {
            tokio::time::sleep(policy.interval).await;
        }
    }

    Err(PollError::TimedOut {
        attempts,
        last_status,
    })
}
