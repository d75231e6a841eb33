use axum::extract::State;
use axum::routing::get;
use axum::Router;
use metrics_exporter_prometheus::PrometheusHandle;
use std::sync::Arc;

/// Prometheus scrape endpoint, text exposition format.
pub async fn prometheus_metrics(State(handle): State<Arc<PrometheusHandle>>) -> String {
    handle.render()
}

/// Standalone `/metrics` router, used by the API server and the worker.
pub fn metrics_router(handle: Arc<PrometheusHandle>) -> Router {
    Router::new()
        .route("/metrics", get(prometheus_metrics))
        .with_state(handle)
}

/// Register descriptions for every metric the pipeline emits.
pub fn describe_metrics() {
    metrics::describe_counter!("ingest_accepted_total", "Images stored and queued for analysis");
    metrics::describe_counter!("ingest_rejected_total", "Uploads rejected by validation");
    metrics::describe_counter!(
        "worker_messages_total",
        "Queue messages settled by the worker, labelled by disposition"
    );
    metrics::describe_counter!(
        "worker_dead_lettered_total",
        "Messages dead-lettered by the worker, labelled by reason"
    );
    metrics::describe_histogram!(
        "worker_processing_seconds",
        "Time to process and settle one queue message"
    );
    metrics::describe_histogram!(
        "inference_duration_seconds",
        "Vision model call latency, labelled by outcome"
    );
    metrics::describe_gauge!("queue_pending_messages", "Messages waiting to be received");
    metrics::describe_gauge!("queue_in_flight_messages", "Messages currently leased by a worker");
    metrics::describe_gauge!("queue_dead_letter_messages", "Messages in the dead-letter sink");
}
