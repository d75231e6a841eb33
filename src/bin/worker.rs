use cutlery_inspect::{
    config::AppConfig,
    routes::metrics::{describe_metrics, metrics_router},
    services::{processor::Processor, queue::JobQueue, storage::ArtifactStore},
};
use metrics_exporter_prometheus::PrometheusBuilder;
use std::sync::Arc;
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() {
    // Initialize structured logging
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .json()
        .init();

    tracing::info!("Starting defect inspection worker");

    let config = AppConfig::from_env().expect("Failed to load configuration");

    let prometheus_handle = PrometheusBuilder::new()
        .install_recorder()
        .expect("Failed to install Prometheus metrics recorder");
    describe_metrics();

    if let Some(addr) = config.worker_metrics_addr.clone() {
        let listener = tokio::net::TcpListener::bind(&addr)
            .await
            .expect("Failed to bind worker metrics address");
        tracing::info!("Worker metrics listening on {addr}");
        let app = metrics_router(Arc::new(prometheus_handle));
        tokio::spawn(async move {
            if let Err(e) = axum::serve(listener, app).await {
                tracing::error!(error = %e, "Metrics listener stopped");
            }
        });
    }

    tracing::info!("Initializing services");
    let store: Arc<dyn ArtifactStore> =
        Arc::new(config.build_store().expect("Failed to initialize artifact store"));
    let queue: Arc<dyn JobQueue> =
        Arc::new(config.build_queue().expect("Failed to initialize job queue"));
    let inference = config
        .build_inference_client()
        .expect("Failed to initialize inference client");

    let options = config.run_options();
    tracing::info!(
        provider = ?config.inference_provider,
        model = inference.model_version(),
        queue = %config.queue_name,
        max_in_flight = options.max_in_flight,
        max_delivery_attempts = config.worker_max_delivery_attempts,
        "Worker ready, starting message loop"
    );

    let processor = Processor::new(store, queue, inference, config.processor_settings());
    let summary = processor
        .run(&options, cutlery_inspect::shutdown_signal())
        .await;

    tracing::info!(
        received = summary.received,
        completed = summary.completed,
        skipped = summary.skipped,
        released = summary.released,
        dead_lettered = summary.dead_lettered,
        errors = summary.errors,
        "Worker stopped"
    );
}
