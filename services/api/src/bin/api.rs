//! services/api/src/bin/api.rs

use api_lib::{
    adapters::{
        vision_ocr::http_client, DbAdapter, GoogleVisionOcr, HttpImageFetcher, NotifyingStore,
        OpenAiAnalysisAdapter,
    },
    config::{Config, ConfigError},
    error::ApiError,
    web::{router, ApiDoc, AppState},
};
use async_openai::{config::OpenAIConfig, Client};
use axum::{
    extract::DefaultBodyLimit,
    http::{header::{ACCEPT, CONTENT_TYPE}, HeaderValue, Method},
    Router,
};
use cv_pipeline_core::{DocumentStore, InMemoryDocumentStore, Orchestrator, ProcessingQueue};
use sqlx::postgres::PgPoolOptions;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast;
use tokio_util::sync::CancellationToken;
use tower_http::cors::CorsLayer;
use tracing::{info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};
use utoipa::OpenApi;
use utoipa_swagger_ui::SwaggerUi;

#[tokio::main]
async fn main() -> Result<(), ApiError> {
    // --- 1. Load Configuration & Set Up Logging ---
    let config = Arc::new(Config::from_env()?);
    tracing_subscriber::registry()
        .with(tracing_subscriber::EnvFilter::new(&config.log_filter))
        .with(tracing_subscriber::fmt::layer())
        .init();
    info!("Configuration loaded. Starting server...");

    // --- 2. Document Store ---
    let base_store: Arc<dyn DocumentStore> = match &config.database_url {
        Some(database_url) => {
            info!("Connecting to database...");
            let db_pool = PgPoolOptions::new()
                .max_connections(5)
                .connect(database_url)
                .await?;
            let db_adapter = DbAdapter::new(db_pool);
            info!("Running database migrations...");
            db_adapter.run_migrations().await?;
            info!("Database migrations complete.");
            Arc::new(db_adapter)
        }
        None => {
            warn!("DATABASE_URL is not set; documents are kept in memory only.");
            Arc::new(InMemoryDocumentStore::new())
        }
    };
    let (events, _) = broadcast::channel(256);
    let store: Arc<dyn DocumentStore> = Arc::new(NotifyingStore::new(base_store, events.clone()));

    // --- 3. Initialize Service Adapters ---
    let http = http_client(Duration::from_secs(60))?;
    let ocr = Arc::new(GoogleVisionOcr::new(
        http.clone(),
        &config.vision_endpoint,
        config.require_vision_api_key()?.to_string(),
    ));
    let fetcher = Arc::new(HttpImageFetcher::new(http));

    let openai_config = OpenAIConfig::new().with_api_key(config.require_openai_api_key()?);
    let openai_client = Client::with_config(openai_config);
    let analysis_adapter = Arc::new(OpenAiAnalysisAdapter::new(
        openai_client,
        config.analysis_model.clone(),
    ));

    // --- 4. Pipeline and Background Queue ---
    let orchestrator = Arc::new(Orchestrator::new(
        store.clone(),
        ocr,
        Some(fetcher),
        analysis_adapter,
        config.pipeline.clone(),
    ));
    let (queue, queue_worker) = ProcessingQueue::start(
        orchestrator.clone(),
        config.queue_capacity,
        config.max_concurrent_runs,
    );

    // --- 5. Build the Shared AppState ---
    let app_state = Arc::new(AppState {
        orchestrator,
        store,
        queue,
        events,
        config: config.clone(),
    });

    let allowed_origin = config.allowed_origin.parse::<HeaderValue>().map_err(|e| {
        ConfigError::InvalidValue("ALLOWED_ORIGIN".to_string(), e.to_string())
    })?;
    let cors = CorsLayer::new()
        .allow_origin(allowed_origin)
        .allow_methods([Method::GET, Method::POST, Method::OPTIONS])
        .allow_headers([CONTENT_TYPE, ACCEPT]);

    // --- 6. Create the Web Router ---
    // Page images may arrive inline as data URIs.
    let api_router = router(app_state)
        .layer(DefaultBodyLimit::max(20 * 1024 * 1024))
        .layer(cors);

    // Merge the API router with the Swagger UI router for a complete application.
    let app = Router::new()
        .merge(api_router)
        .merge(SwaggerUi::new("/swagger-ui").url("/api-docs/openapi.json", ApiDoc::openapi()));

    // --- 7. Start the Server ---
    let shutdown = CancellationToken::new();
    tokio::spawn({
        let shutdown = shutdown.clone();
        async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                info!("Shutdown signal received.");
            }
            shutdown.cancel();
        }
    });

    info!("Starting server on {}", config.bind_address);
    info!(
        "Swagger UI available at http://{}/swagger-ui",
        config.bind_address
    );
    let listener = tokio::net::TcpListener::bind(&config.bind_address).await?;
    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown.cancelled_owned())
        .await?;

    // The router (and with it every queue handle) is gone; let running jobs finish.
    info!("Waiting for in-flight processing runs...");
    queue_worker
        .await
        .map_err(|e| ApiError::Internal(format!("processing queue task failed: {e}")))?;
    info!("Server stopped.");

    Ok(())
}
