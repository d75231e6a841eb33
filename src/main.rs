use axum::http::{header, HeaderValue};
use metrics_exporter_prometheus::PrometheusBuilder;
use std::sync::Arc;
use tower_http::compression::CompressionLayer;
use tower_http::cors::CorsLayer;
use tower_http::limit::RequestBodyLimitLayer;
use tower_http::set_header::SetResponseHeaderLayer;
use tower_http::trace::TraceLayer;
use tracing_subscriber::EnvFilter;

use cutlery_inspect::app_state::AppState;
use cutlery_inspect::config::AppConfig;
use cutlery_inspect::routes::{self, metrics::describe_metrics, metrics::metrics_router};
use cutlery_inspect::services::{
    ingestion::IngestionService,
    queue::JobQueue,
    storage::ArtifactStore,
};

#[tokio::main]
async fn main() {
    // Initialize structured logging
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .json()
        .init();

    let config = AppConfig::from_env().expect("Failed to load configuration from environment");

    tracing::info!("Initializing cutlery-inspect API server");

    let prometheus_handle = PrometheusBuilder::new()
        .install_recorder()
        .expect("Failed to install Prometheus metrics recorder");
    let prometheus_handle = Arc::new(prometheus_handle);
    describe_metrics();

    tracing::info!(endpoint = %config.s3_endpoint, "Initializing artifact store");
    let store: Arc<dyn ArtifactStore> =
        Arc::new(config.build_store().expect("Failed to initialize artifact store"));

    tracing::info!(queue = %config.queue_name, "Connecting to Redis job queue");
    let queue: Arc<dyn JobQueue> =
        Arc::new(config.build_queue().expect("Failed to initialize job queue"));

    let ingestion = IngestionService::new(store.clone(), queue.clone(), config.ingest_settings());
    let state = AppState::new(store, queue, ingestion, config.api_key.clone());

    if state.api_key.is_none() {
        tracing::warn!("API_KEY is not set; ingestion and result endpoints are unauthenticated");
    }

    let app = routes::api_router(state)
        .merge(metrics_router(prometheus_handle))
        .layer(TraceLayer::new_for_http())
        .layer(CompressionLayer::new())
        .layer(CorsLayer::permissive())
        .layer(SetResponseHeaderLayer::overriding(
            header::X_CONTENT_TYPE_OPTIONS,
            HeaderValue::from_static("nosniff"),
        ))
        .layer(SetResponseHeaderLayer::overriding(
            header::X_FRAME_OPTIONS,
            HeaderValue::from_static("DENY"),
        ))
        .layer(RequestBodyLimitLayer::new(routes::request_body_limit(
            config.max_image_bytes,
        )));

    let listener = tokio::net::TcpListener::bind(&config.bind_addr)
        .await
        .expect("Failed to bind to address");

    tracing::info!("Server listening on {}", config.bind_addr);

    axum::serve(listener, app)
        .with_graceful_shutdown(cutlery_inspect::shutdown_signal())
        .await
        .expect("Server error");

    tracing::info!("Server stopped");
}
