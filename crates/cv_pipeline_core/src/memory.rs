//! crates/cv_pipeline_core/src/memory.rs
//!
//! A process-local `DocumentStore`, used when no database is configured and
//! throughout the tests.

use crate::domain::{Document, DocumentStatus};
use crate::ports::{DocumentStore, DocumentUpdate, PortError, PortResult};
use async_trait::async_trait;
use chrono::Utc;
use std::collections::HashMap;
use tokio::sync::RwLock;
use uuid::Uuid;

#[derive(Default)]
pub struct InMemoryDocumentStore {
    documents: RwLock<HashMap<Uuid, Document>>,
}

impl InMemoryDocumentStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Stores a document verbatim, replacing any with the same id.
    pub async fn insert(&self, document: Document) {
        self.documents.write().await.insert(document.id, document);
    }
}

#[async_trait]
impl DocumentStore for InMemoryDocumentStore {
    async fn create_document(&self, page_image_refs: &[String]) -> PortResult<Document> {
        let document = Document::new(page_image_refs.to_vec());
        self.insert(document.clone()).await;
        Ok(document)
    }

    async fn get_document(&self, document_id: Uuid) -> PortResult<Document> {
        self.documents
            .read()
            .await
            .get(&document_id)
            .cloned()
            .ok_or_else(|| PortError::NotFound(format!("document {document_id}")))
    }

    async fn update_document(&self, document_id: Uuid, update: DocumentUpdate) -> PortResult<()> {
        let mut documents = self.documents.write().await;
        let document = documents
            .get_mut(&document_id)
            .ok_or_else(|| PortError::NotFound(format!("document {document_id}")))?;
        update.apply_to(document);
        Ok(())
    }

    async fn mark_error(&self, document_id: Uuid, message: &str) -> PortResult<()> {
        let mut documents = self.documents.write().await;
        let document = documents
            .get_mut(&document_id)
            .ok_or_else(|| PortError::NotFound(format!("document {document_id}")))?;
        if document.status.is_terminal() {
            return Ok(());
        }
        document.status = DocumentStatus::Error;
        document.error_message = Some(message.to_string());
        document.updated_at = Utc::now();
        Ok(())
    }

    async fn list_documents(&self) -> PortResult<Vec<Document>> {
        let mut documents: Vec<Document> = self.documents.read().await.values().cloned().collect();
        documents.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        Ok(documents)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn updates_only_touch_present_fields() {
        let store = InMemoryDocumentStore::new();
        let doc = store.create_document(&["a".to_string()]).await.unwrap();

        store
            .update_document(doc.id, DocumentUpdate::status(DocumentStatus::Extracting).with_progress(25.0))
            .await
            .unwrap();
        store
            .update_document(doc.id, DocumentUpdate::default().with_aggregated_text("hello"))
            .await
            .unwrap();

        let stored = store.get_document(doc.id).await.unwrap();
        assert_eq!(stored.status, DocumentStatus::Extracting);
        assert_eq!(stored.progress, 25.0);
        assert_eq!(stored.aggregated_text, "hello");
        assert!(stored.updated_at >= doc.updated_at);
    }

    #[tokio::test]
    async fn missing_documents_are_not_found() {
        let store = InMemoryDocumentStore::new();
        let err = store.mark_error(Uuid::new_v4(), "boom").await.unwrap_err();
        assert!(matches!(err, PortError::NotFound(_)));
    }

    #[tokio::test]
    async fn finished_documents_are_not_marked_as_failed() {
        let store = InMemoryDocumentStore::new();
        let doc = store.create_document(&["a".to_string()]).await.unwrap();
        store
            .update_document(
                doc.id,
                DocumentUpdate::status(DocumentStatus::Completed).with_structured_data(Default::default()),
            )
            .await
            .unwrap();

        store.mark_error(doc.id, "late timeout").await.unwrap();

        let stored = store.get_document(doc.id).await.unwrap();
        assert_eq!(stored.status, DocumentStatus::Completed);
        assert!(stored.structured_data.is_some());
        assert!(stored.error_message.is_none());
    }

    #[tokio::test]
    async fn listing_is_newest_first() {
        let store = InMemoryDocumentStore::new();
        let mut older = Document::new(vec!["a".into()]);
        older.created_at = Utc::now() - chrono::Duration::minutes(5);
        store.insert(older.clone()).await;
        let newer = store.create_document(&["b".to_string()]).await.unwrap();

        let ids: Vec<Uuid> = store.list_documents().await.unwrap().iter().map(|d| d.id).collect();
        assert_eq!(ids, vec![newer.id, older.id]);
    }
}
