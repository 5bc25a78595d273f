//! services/api/src/adapters/db.rs
//!
//! This module contains the database adapter, which is the concrete implementation
//! of the `DocumentStore` port from the `core` crate. It handles all interactions
//! with the PostgreSQL database using `sqlx`.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use cv_pipeline_core::domain::{Document, DocumentStatus, PageCursor, StructuredData};
use cv_pipeline_core::ports::{DocumentStore, DocumentUpdate, PortError, PortResult};
use sqlx::types::Json;
use sqlx::{FromRow, PgPool};
use uuid::Uuid;

//=========================================================================================
// The Main Adapter Struct
//=========================================================================================

/// A database adapter that implements the `DocumentStore` port.
#[derive(Clone)]
pub struct DbAdapter {
    pool: PgPool,
}

impl DbAdapter {
    /// Creates a new `DbAdapter`.
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    /// A helper function to run database migrations at startup.
    pub async fn run_migrations(&self) -> Result<(), sqlx::migrate::MigrateError> {
        sqlx::migrate!("./migrations").run(&self.pool).await
    }
}

//=========================================================================================
// "Impure" Database Record Structs
//=========================================================================================

const DOCUMENT_COLUMNS: &str = "id, page_image_refs, aggregated_text, structured_data, status, \
     progress, error_message, last_page, last_page_offset, created_at, updated_at";

#[derive(FromRow)]
struct DocumentRecord {
    id: Uuid,
    page_image_refs: Vec<String>,
    aggregated_text: String,
    structured_data: Option<Json<StructuredData>>,
    status: String,
    progress: f64,
    error_message: Option<String>,
    last_page: i32,
    last_page_offset: i32,
    created_at: DateTime<Utc>,
    updated_at: DateTime<Utc>,
}

impl DocumentRecord {
    fn to_domain(self) -> PortResult<Document> {
        let status = self
            .status
            .parse::<DocumentStatus>()
            .map_err(|e| PortError::Unexpected(e.to_string()))?;
        let page_cursor = PageCursor::new(
            usize::try_from(self.last_page).map_err(|e| PortError::Unexpected(e.to_string()))?,
            usize::try_from(self.last_page_offset)
                .map_err(|e| PortError::Unexpected(e.to_string()))?,
        );
        Ok(Document {
            id: self.id,
            page_image_refs: self.page_image_refs,
            aggregated_text: self.aggregated_text,
            structured_data: self.structured_data.map(|Json(data)| data),
            status,
            progress: self.progress,
            error_message: self.error_message,
            page_cursor,
            created_at: self.created_at,
            updated_at: self.updated_at,
        })
    }
}

fn not_found(document_id: Uuid) -> PortError {
    PortError::NotFound(format!("Document {} not found", document_id))
}

//=========================================================================================
// `DocumentStore` Trait Implementation
//=========================================================================================

#[async_trait]
impl DocumentStore for DbAdapter {
    async fn create_document(&self, page_image_refs: &[String]) -> PortResult<Document> {
        let document = Document::new(page_image_refs.to_vec());
        let record = sqlx::query_as::<_, DocumentRecord>(&format!(
            "INSERT INTO documents (id, page_image_refs, aggregated_text, status, progress, created_at, updated_at) \
             VALUES ($1, $2, $3, $4, $5, $6, $7) RETURNING {DOCUMENT_COLUMNS}"
        ))
        .bind(document.id)
        .bind(&document.page_image_refs)
        .bind(&document.aggregated_text)
        .bind(document.status.as_str())
        .bind(document.progress)
        .bind(document.created_at)
        .bind(document.updated_at)
        .fetch_one(&self.pool)
        .await
        .map_err(|e| PortError::Unexpected(e.to_string()))?;
        record.to_domain()
    }

    async fn get_document(&self, document_id: Uuid) -> PortResult<Document> {
        let record = sqlx::query_as::<_, DocumentRecord>(&format!(
            "SELECT {DOCUMENT_COLUMNS} FROM documents WHERE id = $1"
        ))
        .bind(document_id)
        .fetch_one(&self.pool)
        .await
        .map_err(|e| match e {
            sqlx::Error::RowNotFound => not_found(document_id),
            _ => PortError::Unexpected(e.to_string()),
        })?;
        record.to_domain()
    }

    async fn update_document(&self, document_id: Uuid, update: DocumentUpdate) -> PortResult<()> {
        let (last_page, last_page_offset) = match update.page_cursor {
            Some(cursor) => (
                Some(i32::try_from(cursor.page).map_err(|e| PortError::Unexpected(e.to_string()))?),
                Some(i32::try_from(cursor.offset).map_err(|e| PortError::Unexpected(e.to_string()))?),
            ),
            None => (None, None),
        };
        let result = sqlx::query(
            "UPDATE documents SET \
                status = COALESCE($2, status), \
                progress = COALESCE($3, progress), \
                aggregated_text = COALESCE($4, aggregated_text), \
                structured_data = COALESCE($5, structured_data), \
                last_page = COALESCE($6, last_page), \
                last_page_offset = COALESCE($7, last_page_offset), \
                updated_at = NOW() \
             WHERE id = $1",
        )
        .bind(document_id)
        .bind(update.status.map(|s| s.as_str()))
        .bind(update.progress)
        .bind(update.aggregated_text)
        .bind(update.structured_data.map(Json))
        .bind(last_page)
        .bind(last_page_offset)
        .execute(&self.pool)
        .await
        .map_err(|e| PortError::Unexpected(e.to_string()))?;

        if result.rows_affected() == 0 {
            return Err(not_found(document_id));
        }
        Ok(())
    }

    async fn mark_error(&self, document_id: Uuid, message: &str) -> PortResult<()> {
        let result = sqlx::query(
            "UPDATE documents SET status = $2, error_message = $3, updated_at = NOW() \
             WHERE id = $1 AND status NOT IN ('completed', 'error')",
        )
        .bind(document_id)
        .bind(DocumentStatus::Error.as_str())
        .bind(message)
        .execute(&self.pool)
        .await
        .map_err(|e| PortError::Unexpected(e.to_string()))?;

        if result.rows_affected() > 0 {
            return Ok(());
        }
        // Nothing changed: either the run already finished, or there is no such document.
        let exists: bool = sqlx::query_scalar("SELECT EXISTS (SELECT 1 FROM documents WHERE id = $1)")
            .bind(document_id)
            .fetch_one(&self.pool)
            .await
            .map_err(|e| PortError::Unexpected(e.to_string()))?;
        if exists {
            Ok(())
        } else {
            Err(not_found(document_id))
        }
    }

    async fn list_documents(&self) -> PortResult<Vec<Document>> {
        let records = sqlx::query_as::<_, DocumentRecord>(&format!(
            "SELECT {DOCUMENT_COLUMNS} FROM documents ORDER BY created_at DESC"
        ))
        .fetch_all(&self.pool)
        .await
        .map_err(|e| PortError::Unexpected(e.to_string()))?;

        records.into_iter().map(|r| r.to_domain()).collect()
    }
}
