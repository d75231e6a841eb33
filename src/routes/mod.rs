pub mod health;
pub mod ingest;
pub mod metrics;
pub mod results;

use axum::extract::{DefaultBodyLimit, Request, State};
use axum::http::StatusCode;
use axum::middleware::{self, Next};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use serde::Serialize;

use crate::app_state::AppState;

/// JSON error body: `{"error": "..."}`.
#[derive(Debug, Serialize)]
pub struct ApiError {
    #[serde(skip)]
    pub status: StatusCode,
    pub error: String,
}

impl ApiError {
    pub fn new(status: StatusCode, error: impl Into<String>) -> Self {
        Self {
            status,
            error: error.into(),
        }
    }

    pub fn bad_request(error: impl Into<String>) -> Self {
        Self::new(StatusCode::BAD_REQUEST, error)
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        (self.status, Json(self)).into_response()
    }
}

async fn require_api_key(State(state): State<AppState>, req: Request, next: Next) -> Response {
    let Some(expected) = state.api_key.as_deref() else {
        return next.run(req).await;
    };

    let provided = req
        .headers()
        .get("x-api-key")
        .and_then(|value| value.to_str().ok());
    if provided == Some(expected) {
        next.run(req).await
    } else {
        tracing::warn!(path = %req.uri().path(), "Rejected request with missing or invalid API key");
        ApiError::new(StatusCode::UNAUTHORIZED, "missing or invalid X-API-Key header").into_response()
    }
}

/// Largest request body accepted for an image of `max_image_bytes`, leaving
/// room for base64 expansion and form fields.
pub fn request_body_limit(max_image_bytes: usize) -> usize {
    max_image_bytes.saturating_mul(2).saturating_add(64 * 1024)
}

/// Ingestion, read and health routes. `/metrics` is mounted by the binary.
pub fn api_router(state: AppState) -> Router {
    let body_limit = request_body_limit(state.ingestion.settings().rules.max_image_bytes);
    let protected = Router::new()
        .route("/ingest", post(ingest::ingest_image))
        .route("/api/v1/results/{image_id}", get(results::get_result))
        .route("/api/v1/dead-letters", get(results::list_dead_letters))
        .route_layer(middleware::from_fn_with_state(state.clone(), require_api_key));

    Router::new()
        .merge(protected)
        .route("/api/v1/defect-types", get(results::defect_types))
        .route("/api/v1/facilities", get(results::facilities))
        .route("/health", get(health::health_check))
        .layer(DefaultBodyLimit::max(body_limit))
        .with_state(state)
}
