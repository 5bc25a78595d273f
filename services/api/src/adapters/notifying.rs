//! services/api/src/adapters/notifying.rs
//!
//! A `DocumentStore` decorator that publishes a status snapshot on a
//! broadcast channel after every successful write, so WebSocket subscribers
//! see each transition without polling.

use async_trait::async_trait;
use cv_pipeline_core::domain::{Document, DocumentStatus};
use cv_pipeline_core::ports::{DocumentStore, DocumentUpdate, PortResult};
use std::sync::Arc;
use tokio::sync::broadcast;
use tracing::warn;
use uuid::Uuid;

/// The status fields of a document right after a write.
#[derive(Debug, Clone, PartialEq)]
pub struct StatusEvent {
    pub document_id: Uuid,
    pub status: DocumentStatus,
    pub progress: f64,
    pub error_message: Option<String>,
}

impl From<&Document> for StatusEvent {
    fn from(document: &Document) -> Self {
        Self {
            document_id: document.id,
            status: document.status,
            progress: document.progress,
            error_message: document.error_message.clone(),
        }
    }
}

pub struct NotifyingStore {
    inner: Arc<dyn DocumentStore>,
    events: broadcast::Sender<StatusEvent>,
}

impl NotifyingStore {
    pub fn new(inner: Arc<dyn DocumentStore>, events: broadcast::Sender<StatusEvent>) -> Self {
        Self { inner, events }
    }

    async fn publish(&self, document_id: Uuid) {
        // No receivers is the common case; skip the read entirely.
        if self.events.receiver_count() == 0 {
            return;
        }
        match self.inner.get_document(document_id).await {
            Ok(document) => {
                let _ = self.events.send(StatusEvent::from(&document));
            }
            Err(e) => warn!(document_id = %document_id, error = %e, "Could not read back document for notification."),
        }
    }
}

#[async_trait]
impl DocumentStore for NotifyingStore {
    async fn create_document(&self, page_image_refs: &[String]) -> PortResult<Document> {
        self.inner.create_document(page_image_refs).await
    }

    async fn get_document(&self, document_id: Uuid) -> PortResult<Document> {
        self.inner.get_document(document_id).await
    }

    async fn update_document(&self, document_id: Uuid, update: DocumentUpdate) -> PortResult<()> {
        self.inner.update_document(document_id, update).await?;
        self.publish(document_id).await;
        Ok(())
    }

    async fn mark_error(&self, document_id: Uuid, message: &str) -> PortResult<()> {
        self.inner.mark_error(document_id, message).await?;
        self.publish(document_id).await;
        Ok(())
    }

    async fn list_documents(&self) -> PortResult<Vec<Document>> {
        self.inner.list_documents().await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use cv_pipeline_core::InMemoryDocumentStore;

    #[tokio::test]
    async fn writes_are_published_to_subscribers() {
        let (tx, mut rx) = broadcast::channel(8);
        let store = NotifyingStore::new(Arc::new(InMemoryDocumentStore::new()), tx);
        let doc = store.create_document(&["p1".to_string()]).await.unwrap();

        store
            .update_document(doc.id, DocumentUpdate::status(DocumentStatus::Extracting).with_progress(50.0))
            .await
            .unwrap();
        store.mark_error(doc.id, "no text").await.unwrap();

        let first = rx.recv().await.unwrap();
        assert_eq!(first.status, DocumentStatus::Extracting);
        assert_eq!(first.progress, 50.0);
        let second = rx.recv().await.unwrap();
        assert_eq!(second.status, DocumentStatus::Error);
        assert_eq!(second.error_message.as_deref(), Some("no text"));
    }
}
