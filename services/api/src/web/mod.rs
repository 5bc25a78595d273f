pub mod protocol;
pub mod rest;
pub mod state;
pub mod status_ws;

use axum::{
    routing::{get, post},
    Router,
};
use std::sync::Arc;

pub use rest::ApiDoc;
pub use state::AppState;
pub use status_ws::status_ws_handler;

/// Builds the API routes over the shared state.
pub fn router(app_state: Arc<AppState>) -> Router {
    Router::new()
        .route(
            "/documents",
            post(rest::create_document_handler).get(rest::list_documents_handler),
        )
        .route("/documents/{id}", get(rest::get_document_handler))
        .route("/documents/{id}/process", post(rest::process_document_handler))
        .route("/documents/{id}/resume", post(rest::resume_document_handler))
        .route("/documents/{id}/pages", post(rest::extract_page_handler))
        .route("/documents/{id}/analysis", post(rest::analyze_document_handler))
        .route("/documents/{id}/wait", get(rest::wait_for_document_handler))
        .route("/documents/{id}/events", get(status_ws_handler))
        .with_state(app_state)
}
