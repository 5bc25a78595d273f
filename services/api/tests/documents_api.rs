//! Handler tests that drive the axum router in-process.

use api_lib::adapters::NotifyingStore;
use api_lib::config::Config;
use api_lib::web::rest::{AcceptedResponse, AnalyzeResponse, DocumentResponse, ExtractPageResponse};
use api_lib::web::{router, AppState};
use async_trait::async_trait;
use axum::body::Body;
use axum::http::{Request, StatusCode};
use axum::Router;
use cv_pipeline_core::{
    CompletionRequest, DocumentStore, ImageSource, InMemoryDocumentStore, LanguageModelService,
    OcrRequest, OcrResponse, OcrService, Orchestrator, PipelineConfig, PollPolicy, PortError,
    PortResult, ProcessingQueue, RetryPolicy,
};
use http_body_util::BodyExt;
use serde::de::DeserializeOwned;
use serde_json::json;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast;
use tower::ServiceExt;

/// Returns CV-like text for any URI containing "good"; fails otherwise.
struct UriOcr;

#[async_trait]
impl OcrService for UriOcr {
    async fn annotate(&self, request: &OcrRequest) -> PortResult<OcrResponse> {
        match &request.source {
            ImageSource::Uri(uri) if uri.contains("good") => Ok(OcrResponse {
                full_text: Some(format!("María Pérez\nSoftware Engineer at Initech 2018-2024 {uri}\n{}", "Rust ".repeat(30))),
                regions: vec![],
            }),
            _ => Err(PortError::Unexpected("unreadable image".into())),
        }
    }
}

struct FixedModel(&'static str);

#[async_trait]
impl LanguageModelService for FixedModel {
    async fn complete(&self, _request: &CompletionRequest) -> PortResult<String> {
        Ok(self.0.to_string())
    }
}

const REPLY: &str = r#"{"personalInfo": {"name": "María Pérez"}, "skills": ["Rust"]}"#;

fn test_config() -> Config {
    let mut config = Config::from_lookup(|_| None).unwrap();
    config.pipeline = PipelineConfig {
        retry: RetryPolicy {
            base_delay: Duration::ZERO,
            ..Default::default()
        },
        ..Default::default()
    };
    config.poll = PollPolicy {
        interval: Duration::from_millis(10),
        max_attempts: 300,
    };
    config
}

fn app_with(config: Config, queue_capacity: usize) -> Router {
    let (events, _) = broadcast::channel(64);
    let store: Arc<dyn DocumentStore> = Arc::new(NotifyingStore::new(
        Arc::new(InMemoryDocumentStore::new()),
        events.clone(),
    ));
    let orchestrator = Arc::new(Orchestrator::new(
        store.clone(),
        Arc::new(UriOcr),
        None,
        Arc::new(FixedModel(REPLY)),
        config.pipeline.clone(),
    ));
    let (queue, _worker) = ProcessingQueue::start(orchestrator.clone(), queue_capacity, 2);
    router(Arc::new(AppState {
        orchestrator,
        store,
        queue,
        events,
        config: Arc::new(config),
    }))
}

fn app() -> Router {
    app_with(test_config(), 16)
}

async fn call(app: &Router, method: &str, uri: &str, body: Option<serde_json::Value>) -> (StatusCode, Vec<u8>) {
    let builder = Request::builder().method(method).uri(uri);
    let request = match body {
        Some(body) => builder
            .header("content-type", "application/json")
            .body(Body::from(body.to_string()))
            .unwrap(),
        None => builder.body(Body::empty()).unwrap(),
    };
    let response = app.clone().oneshot(request).await.unwrap();
    let status = response.status();
    let bytes = response.into_body().collect().await.unwrap().to_bytes().to_vec();
    (status, bytes)
}

fn decode<T: DeserializeOwned>(bytes: &[u8]) -> T {
    serde_json::from_slice(bytes).unwrap()
}

async fn create(app: &Router, refs: &[&str]) -> DocumentResponse {
    let (status, body) = call(app, "POST", "/documents", Some(json!({ "pageImageRefs": refs }))).await;
    assert_eq!(status, StatusCode::CREATED);
    decode(&body)
}

#[tokio::test]
async fn create_then_fetch_a_document() {
    let app = app();
    let created = create(&app, &["https://img/good-1.jpg"]).await;
    assert_eq!(created.status, "uploading");
    assert_eq!(created.progress, 0.0);

    let (status, body) = call(&app, "GET", &format!("/documents/{}", created.id), None).await;
    assert_eq!(status, StatusCode::OK);
    let fetched: DocumentResponse = decode(&body);
    assert_eq!(fetched.page_image_refs, vec!["https://img/good-1.jpg"]);

    let (status, body) = call(&app, "GET", "/documents", None).await;
    assert_eq!(status, StatusCode::OK);
    let listed: Vec<DocumentResponse> = decode(&body);
    assert_eq!(listed.len(), 1);
}

#[tokio::test]
async fn empty_page_list_is_a_bad_request() {
    let (status, _) = call(&app(), "POST", "/documents", Some(json!({ "pageImageRefs": [] }))).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
}

#[tokio::test]
async fn unknown_document_is_404() {
    let app = app();
    let missing = uuid::Uuid::new_v4();
    let (status, _) = call(&app, "GET", &format!("/documents/{missing}"), None).await;
    assert_eq!(status, StatusCode::NOT_FOUND);
    let (status, _) = call(&app, "POST", &format!("/documents/{missing}/process"), None).await;
    assert_eq!(status, StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn process_is_accepted_and_wait_returns_the_completed_document() {
    let app = app();
    let created = create(&app, &["https://img/good-1.jpg", "https://img/good-2.jpg"]).await;

    let (status, body) = call(&app, "POST", &format!("/documents/{}/process", created.id), None).await;
    assert_eq!(status, StatusCode::ACCEPTED);
    let accepted: AcceptedResponse = decode(&body);
    assert!(accepted.accepted);
    assert_eq!(accepted.document_id, created.id);

    let (status, body) = call(&app, "GET", &format!("/documents/{}/wait", created.id), None).await;
    assert_eq!(status, StatusCode::OK);
    let done: DocumentResponse = decode(&body);
    assert_eq!(done.status, "completed");
    assert_eq!(done.progress, 100.0);
    assert!(done.aggregated_text.contains("--- PAGE 2 ---"));
    assert_eq!(done.structured_data.unwrap()["personalInfo"]["name"], "María Pérez");
}

#[tokio::test]
async fn failed_run_is_reported_through_the_document() {
    let app = app();
    let created = create(&app, &["https://img/blurry.jpg"]).await;

    let (status, _) = call(&app, "POST", &format!("/documents/{}/process", created.id), None).await;
    assert_eq!(status, StatusCode::ACCEPTED);

    let (status, body) = call(&app, "GET", &format!("/documents/{}/wait", created.id), None).await;
    assert_eq!(status, StatusCode::OK);
    let done: DocumentResponse = decode(&body);
    assert_eq!(done.status, "error");
    assert!(done.error_message.unwrap().contains("first page"));
    assert!(done.structured_data.is_none());
}

#[tokio::test]
async fn wait_times_out_with_504_when_nothing_runs() {
    let mut config = test_config();
    config.poll = PollPolicy {
        interval: Duration::from_millis(1),
        max_attempts: 2,
    };
    let app = app_with(config, 16);
    let created = create(&app, &["https://img/good-1.jpg"]).await;

    let (status, _) = call(&app, "GET", &format!("/documents/{}/wait", created.id), None).await;
    assert_eq!(status, StatusCode::GATEWAY_TIMEOUT);
}

#[tokio::test]
async fn stage_endpoints_drive_a_run_page_by_page() {
    let app = app();
    let created = create(&app, &["https://img/good-1.jpg", "https://img/bad-2.jpg"]).await;
    let pages = format!("/documents/{}/pages", created.id);

    let (status, body) = call(
        &app,
        "POST",
        &pages,
        Some(json!({"pageImageRef": "https://img/good-1.jpg", "pageNumber": 1, "totalPages": 2})),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    let first: ExtractPageResponse = decode(&body);
    assert_eq!(first.progress, 25.0);
    assert_eq!(first.method.as_deref(), Some("document_text_detection"));

    // A later page failing is reported without failing the document.
    let (status, _) = call(
        &app,
        "POST",
        &pages,
        Some(json!({"pageImageRef": "https://img/bad-2.jpg", "pageNumber": 2, "totalPages": 2})),
    )
    .await;
    assert_eq!(status, StatusCode::UNPROCESSABLE_ENTITY);
    let (_, body) = call(&app, "GET", &format!("/documents/{}", created.id), None).await;
    let current: DocumentResponse = decode(&body);
    assert_eq!(current.status, "extracting");

    let (status, body) = call(
        &app,
        "POST",
        &format!("/documents/{}/analysis", created.id),
        Some(json!({"aggregatedText": first.extracted_text})),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    let analysis: AnalyzeResponse = decode(&body);
    assert_eq!(analysis.structured_data["skills"], json!(["Rust"]));
}

#[tokio::test]
async fn page_out_of_range_is_a_bad_request() {
    let app = app();
    let created = create(&app, &["https://img/good-1.jpg"]).await;
    let (status, _) = call(
        &app,
        "POST",
        &format!("/documents/{}/pages", created.id),
        Some(json!({"pageImageRef": "https://img/good-1.jpg", "pageNumber": 3, "totalPages": 1})),
    )
    .await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
}

#[tokio::test]
async fn pages_sent_out_of_order_are_a_conflict() {
    let app = app();
    let created = create(
        &app,
        &["https://img/good-1.jpg", "https://img/good-2.jpg", "https://img/good-3.jpg"],
    )
    .await;
    let pages = format!("/documents/{}/pages", created.id);

    let (status, _) = call(
        &app,
        "POST",
        &pages,
        Some(json!({"pageImageRef": "https://img/good-1.jpg", "pageNumber": 1, "totalPages": 3})),
    )
    .await;
    assert_eq!(status, StatusCode::OK);

    let (status, _) = call(
        &app,
        "POST",
        &pages,
        Some(json!({"pageImageRef": "https://img/good-3.jpg", "pageNumber": 3, "totalPages": 3})),
    )
    .await;
    assert_eq!(status, StatusCode::CONFLICT);

    let (_, body) = call(&app, "GET", &format!("/documents/{}", created.id), None).await;
    let current: DocumentResponse = decode(&body);
    assert_eq!(current.status, "extracting");
    assert_eq!(current.last_extracted_page, 1);
}

#[tokio::test]
async fn short_text_analysis_fails_the_document() {
    let app = app();
    let created = create(&app, &["https://img/good-1.jpg"]).await;
    call(
        &app,
        "POST",
        &format!("/documents/{}/pages", created.id),
        Some(json!({"pageImageRef": "https://img/good-1.jpg", "pageNumber": 1, "totalPages": 1})),
    )
    .await;

    let (status, _) = call(
        &app,
        "POST",
        &format!("/documents/{}/analysis", created.id),
        Some(json!({"aggregatedText": "too short"})),
    )
    .await;
    assert_eq!(status, StatusCode::UNPROCESSABLE_ENTITY);

    let (_, body) = call(&app, "GET", &format!("/documents/{}", created.id), None).await;
    let current: DocumentResponse = decode(&body);
    assert_eq!(current.status, "error");
}
