//! services/api/src/web/rest.rs
//!
//! Contains the Axum handlers for the REST API endpoints and the master
//! definition for the OpenAPI specification.

use crate::web::state::AppState;
use axum::{
    extract::{Path, State},
    http::StatusCode,
    response::{IntoResponse, Json},
};
use chrono::{DateTime, Utc};
use cv_pipeline_core::{
    wait_for_terminal, Document, PipelineError, PollError, PortError, ProcessingJob,
};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::{error, info, warn};
use utoipa::{OpenApi, ToSchema};
use uuid::Uuid;

//=========================================================================================
// OpenAPI Master Definition
//=========================================================================================

#[derive(OpenApi)]
#[openapi(
    paths(
        create_document_handler,
        list_documents_handler,
        get_document_handler,
        process_document_handler,
        resume_document_handler,
        extract_page_handler,
        analyze_document_handler,
        wait_for_document_handler,
    ),
    components(
        schemas(
            CreateDocumentRequest,
            DocumentResponse,
            AcceptedResponse,
            ExtractPageRequest,
            ExtractPageResponse,
            AnalyzeRequest,
            AnalyzeResponse,
        )
    ),
    tags(
        (name = "CV Pipeline API", description = "Upload scanned CV pages, run OCR and structured extraction, and follow progress.")
    )
)]
pub struct ApiDoc;

//=========================================================================================
// API Response and Payload Structs
//=========================================================================================

#[derive(Deserialize, ToSchema)]
#[serde(rename_all = "camelCase")]
pub struct CreateDocumentRequest {
    /// Ordered page image locators: URLs or `data:` URIs.
    pub page_image_refs: Vec<String>,
}

/// A document as returned by the API.
#[derive(Serialize, Deserialize, ToSchema, Debug)]
#[serde(rename_all = "camelCase")]
pub struct DocumentResponse {
    pub id: Uuid,
    pub page_image_refs: Vec<String>,
    pub aggregated_text: String,
    #[schema(value_type = Option<Object>)]
    pub structured_data: Option<serde_json::Value>,
    pub status: String,
    pub progress: f64,
    pub error_message: Option<String>,
    /// The last page handled by page-by-page extraction; `0` before the first.
    pub last_extracted_page: usize,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl From<Document> for DocumentResponse {
    fn from(document: Document) -> Self {
        Self {
            id: document.id,
            page_image_refs: document.page_image_refs,
            aggregated_text: document.aggregated_text,
            structured_data: document
                .structured_data
                .and_then(|data| serde_json::to_value(data).ok()),
            status: document.status.to_string(),
            progress: document.progress,
            error_message: document.error_message,
            last_extracted_page: document.page_cursor.page,
            created_at: document.created_at,
            updated_at: document.updated_at,
        }
    }
}

#[derive(Serialize, Deserialize, ToSchema, Debug)]
#[serde(rename_all = "camelCase")]
pub struct AcceptedResponse {
    pub accepted: bool,
    pub document_id: Uuid,
}

#[derive(Deserialize, ToSchema)]
#[serde(rename_all = "camelCase")]
pub struct ExtractPageRequest {
    pub page_image_ref: String,
    /// 1-based.
    pub page_number: usize,
    pub total_pages: usize,
}

#[derive(Serialize, Deserialize, ToSchema, Debug)]
#[serde(rename_all = "camelCase")]
pub struct ExtractPageResponse {
    pub extracted_text: String,
    pub progress: f64,
    pub method: Option<String>,
}

#[derive(Deserialize, ToSchema)]
#[serde(rename_all = "camelCase")]
pub struct AnalyzeRequest {
    pub aggregated_text: String,
}

#[derive(Serialize, Deserialize, ToSchema, Debug)]
#[serde(rename_all = "camelCase")]
pub struct AnalyzeResponse {
    #[schema(value_type = Object)]
    pub structured_data: serde_json::Value,
}

//=========================================================================================
// Error mapping
//=========================================================================================

type HandlerError = (StatusCode, String);

fn pipeline_error(err: PipelineError) -> HandlerError {
    let status = match &err {
        PipelineError::DocumentNotFound(_) => StatusCode::NOT_FOUND,
        PipelineError::InvalidTransition { .. } | PipelineError::PageOutOfOrder { .. } => {
            StatusCode::CONFLICT
        }
        PipelineError::PageOutOfRange { .. } | PipelineError::NoPages => StatusCode::BAD_REQUEST,
        PipelineError::PageFailed(_)
        | PipelineError::FirstPageFailed(_)
        | PipelineError::InsufficientText { .. } => StatusCode::UNPROCESSABLE_ENTITY,
        PipelineError::ModelInvocation(_)
        | PipelineError::EmptyReply
        | PipelineError::MalformedReply { .. }
        | PipelineError::MissingPersonalInfo { .. } => StatusCode::BAD_GATEWAY,
        PipelineError::TimedOut { .. } => StatusCode::GATEWAY_TIMEOUT,
        PipelineError::Store(_) => StatusCode::INTERNAL_SERVER_ERROR,
    };
    if status.is_server_error() {
        error!(error = %err, "Request failed.");
    }
    (status, err.user_message())
}

async fn load_document(app_state: &AppState, document_id: Uuid) -> Result<Document, HandlerError> {
    app_state.store.get_document(document_id).await.map_err(|e| match e {
        PortError::NotFound(_) => (
            StatusCode::NOT_FOUND,
            format!("Document {} not found", document_id),
        ),
        other => {
            error!(document_id = %document_id, error = %other, "Failed to load document.");
            (
                StatusCode::INTERNAL_SERVER_ERROR,
                "Failed to load document".to_string(),
            )
        }
    })
}

fn submit(app_state: &AppState, job: ProcessingJob) -> Result<impl IntoResponse, HandlerError> {
    match app_state.queue.submit(job) {
        Ok(()) => Ok((
            StatusCode::ACCEPTED,
            Json(AcceptedResponse {
                accepted: true,
                document_id: job.document_id(),
            }),
        )),
        Err(e) => {
            warn!(document_id = %job.document_id(), error = %e, "Job rejected.");
            Err((StatusCode::SERVICE_UNAVAILABLE, e.to_string()))
        }
    }
}

//=========================================================================================
// REST API Handlers
//=========================================================================================

/// Register a new document from its ordered page images.
#[utoipa::path(
    post,
    path = "/documents",
    request_body = CreateDocumentRequest,
    responses(
        (status = 201, description = "Document created in the 'uploading' state", body = DocumentResponse),
        (status = 400, description = "No page images were given"),
        (status = 500, description = "Internal server error")
    )
)]
pub async fn create_document_handler(
    State(app_state): State<Arc<AppState>>,
    Json(payload): Json<CreateDocumentRequest>,
) -> Result<impl IntoResponse, HandlerError> {
    let document = app_state
        .orchestrator
        .create_document(payload.page_image_refs)
        .await
        .map_err(pipeline_error)?;
    Ok((StatusCode::CREATED, Json(DocumentResponse::from(document))))
}

/// List every document, newest first.
#[utoipa::path(
    get,
    path = "/documents",
    responses(
        (status = 200, description = "All documents", body = [DocumentResponse]),
        (status = 500, description = "Internal server error")
    )
)]
pub async fn list_documents_handler(
    State(app_state): State<Arc<AppState>>,
) -> Result<impl IntoResponse, HandlerError> {
    let documents = app_state.store.list_documents().await.map_err(|e| {
        error!("Failed to list documents: {:?}", e);
        (
            StatusCode::INTERNAL_SERVER_ERROR,
            "Failed to list documents".to_string(),
        )
    })?;
    let body: Vec<DocumentResponse> = documents.into_iter().map(DocumentResponse::from).collect();
    Ok(Json(body))
}

/// Fetch one document, including its status and progress.
#[utoipa::path(
    get,
    path = "/documents/{id}",
    params(("id" = Uuid, Path, description = "Document id")),
    responses(
        (status = 200, description = "The document", body = DocumentResponse),
        (status = 404, description = "Unknown document")
    )
)]
pub async fn get_document_handler(
    State(app_state): State<Arc<AppState>>,
    Path(document_id): Path<Uuid>,
) -> Result<impl IntoResponse, HandlerError> {
    let document = load_document(&app_state, document_id).await?;
    Ok(Json(DocumentResponse::from(document)))
}

/// Start a full processing run in the background.
///
/// Returns as soon as the run is queued; follow it through the document's
/// status, `/wait` or `/events`.
#[utoipa::path(
    post,
    path = "/documents/{id}/process",
    params(("id" = Uuid, Path, description = "Document id")),
    responses(
        (status = 202, description = "Run queued", body = AcceptedResponse),
        (status = 404, description = "Unknown document"),
        (status = 503, description = "The processing queue is full")
    )
)]
pub async fn process_document_handler(
    State(app_state): State<Arc<AppState>>,
    Path(document_id): Path<Uuid>,
) -> Result<impl IntoResponse, HandlerError> {
    load_document(&app_state, document_id).await?;
    info!(document_id = %document_id, "Processing requested.");
    submit(&app_state, ProcessingJob::Process(document_id))
}

/// Continue an interrupted run from its persisted state.
#[utoipa::path(
    post,
    path = "/documents/{id}/resume",
    params(("id" = Uuid, Path, description = "Document id")),
    responses(
        (status = 202, description = "Resume queued", body = AcceptedResponse),
        (status = 404, description = "Unknown document"),
        (status = 503, description = "The processing queue is full")
    )
)]
pub async fn resume_document_handler(
    State(app_state): State<Arc<AppState>>,
    Path(document_id): Path<Uuid>,
) -> Result<impl IntoResponse, HandlerError> {
    load_document(&app_state, document_id).await?;
    info!(document_id = %document_id, "Resume requested.");
    submit(&app_state, ProcessingJob::Resume(document_id))
}

/// Extract the text of one page and append it to the document's text.
///
/// A failing first page fails the document. A failing later page is
/// reported here and the document keeps going.
#[utoipa::path(
    post,
    path = "/documents/{id}/pages",
    params(("id" = Uuid, Path, description = "Document id")),
    request_body = ExtractPageRequest,
    responses(
        (status = 200, description = "Page text extracted", body = ExtractPageResponse),
        (status = 400, description = "Page number out of range"),
        (status = 404, description = "Unknown document"),
        (status = 409, description = "The document is not accepting pages, or the page is out of order"),
        (status = 422, description = "No text could be extracted from the page")
    )
)]
pub async fn extract_page_handler(
    State(app_state): State<Arc<AppState>>,
    Path(document_id): Path<Uuid>,
    Json(payload): Json<ExtractPageRequest>,
) -> Result<impl IntoResponse, HandlerError> {
    let outcome = app_state
        .orchestrator
        .extract_page(
            document_id,
            &payload.page_image_ref,
            payload.page_number,
            payload.total_pages,
        )
        .await
        .map_err(pipeline_error)?;
    Ok(Json(ExtractPageResponse {
        extracted_text: outcome.extracted_text,
        progress: outcome.progress,
        method: outcome.method.map(|m| m.to_string()),
    }))
}

/// Run structured extraction over the aggregated text and complete the document.
#[utoipa::path(
    post,
    path = "/documents/{id}/analysis",
    params(("id" = Uuid, Path, description = "Document id")),
    request_body = AnalyzeRequest,
    responses(
        (status = 200, description = "Structured CV data", body = AnalyzeResponse),
        (status = 404, description = "Unknown document"),
        (status = 422, description = "Not enough text to analyze"),
        (status = 502, description = "The language model failed or replied with unusable output")
    )
)]
pub async fn analyze_document_handler(
    State(app_state): State<Arc<AppState>>,
    Path(document_id): Path<Uuid>,
    Json(payload): Json<AnalyzeRequest>,
) -> Result<impl IntoResponse, HandlerError> {
    let data = app_state
        .orchestrator
        .analyze(document_id, &payload.aggregated_text)
        .await
        .map_err(pipeline_error)?;
    let structured_data = serde_json::to_value(data).map_err(|e| {
        (
            StatusCode::INTERNAL_SERVER_ERROR,
            format!("Failed to encode structured data: {}", e),
        )
    })?;
    Ok(Json(AnalyzeResponse { structured_data }))
}

/// Wait until the document is `completed` or `error`, polling on a bounded schedule.
#[utoipa::path(
    get,
    path = "/documents/{id}/wait",
    params(("id" = Uuid, Path, description = "Document id")),
    responses(
        (status = 200, description = "The document in a terminal state", body = DocumentResponse),
        (status = 404, description = "Unknown document"),
        (status = 504, description = "Still running after the polling budget")
    )
)]
pub async fn wait_for_document_handler(
    State(app_state): State<Arc<AppState>>,
    Path(document_id): Path<Uuid>,
) -> Result<impl IntoResponse, HandlerError> {
    match wait_for_terminal(app_state.store.as_ref(), document_id, app_state.config.poll).await {
        Ok(document) => Ok(Json(DocumentResponse::from(document))),
        Err(e @ PollError::NotFound(_)) => Err((StatusCode::NOT_FOUND, e.to_string())),
        Err(e @ PollError::TimedOut { .. }) => Err((StatusCode::GATEWAY_TIMEOUT, e.to_string())),
        Err(PollError::Store(e)) => {
            error!(document_id = %document_id, error = %e, "Polling failed.");
            Err((
                StatusCode::INTERNAL_SERVER_ERROR,
                "Failed to load document".to_string(),
            ))
        }
    }
}
