use axum::extract::State;
use axum::http::StatusCode;
use axum::Json;
use serde::Serialize;
use std::future::Future;
use std::time::Instant;

use crate::app_state::AppState;
use crate::services::queue::QueueDepth;

#[derive(Serialize)]
pub struct HealthResponse {
    pub status: &'static str,
    pub version: &'static str,
    pub queue: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub queue_depth: Option<QueueDepth>,
    pub checks: DependencyChecks,
}

#[derive(Serialize)]
pub struct DependencyChecks {
    pub storage: ComponentHealth,
    pub queue: ComponentHealth,
}

#[derive(Serialize)]
pub struct ComponentHealth {
    pub status: &'static str,
    pub latency_ms: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl ComponentHealth {
    fn healthy(&self) -> bool {
        self.error.is_none()
    }
}

async fn timed_check<F, E>(check: F) -> ComponentHealth
where
    F: Future<Output = Result<(), E>>,
    E: std::fmt::Display,
{
    let started = Instant::now();
    match check.await {
        Ok(()) => ComponentHealth {
            status: "ok",
            latency_ms: Some(started.elapsed().as_millis() as u64),
            error: None,
        },
        Err(e) => ComponentHealth {
            status: "error",
            latency_ms: None,
            error: Some(e.to_string()),
        },
    }
}

/// GET /health — artifact store and queue reachability, plus queue depth.
pub async fn health_check(State(state): State<AppState>) -> (StatusCode, Json<HealthResponse>) {
    let (storage, queue) = tokio::join!(
        timed_check(state.store.health_check()),
        timed_check(state.queue.health_check()),
    );

    let queue_depth = if queue.healthy() {
        state.queue.depth().await.ok()
    } else {
        None
    };

    let healthy = storage.healthy() && queue.healthy();
    if !healthy {
        tracing::warn!(
            storage = storage.error.as_deref().unwrap_or("ok"),
            queue = queue.error.as_deref().unwrap_or("ok"),
            "Health check degraded"
        );
    }

    let response = HealthResponse {
        status: if healthy { "ok" } else { "degraded" },
        version: env!("CARGO_PKG_VERSION"),
        queue: state.queue.name().to_string(),
        queue_depth,
        checks: DependencyChecks { storage, queue },
    };
    let code = if healthy {
        StatusCode::OK
    } else {
        StatusCode::SERVICE_UNAVAILABLE
    };

    (code, Json(response))
}
