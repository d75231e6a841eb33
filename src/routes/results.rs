use axum::extract::{Path, Query, State};
use axum::http::StatusCode;
use axum::Json;
use serde::Deserialize;
use serde_json::{json, Value};
use strum::IntoEnumIterator;
use uuid::Uuid;

use crate::app_state::AppState;
use crate::models::defect::{DefectType, Severity};
use crate::models::ingest::ResultStatusResponse;
use crate::models::job::{processed_blob_name, BlobLocation};
use crate::routes::ApiError;
use crate::services::queue::DeadLetterRecord;
use crate::services::storage::StoreError;

const DEFAULT_DEAD_LETTER_LIMIT: usize = 50;
const MAX_DEAD_LETTER_LIMIT: usize = 500;

/// GET /api/v1/results/{image_id} — processed result, or `pending` if none yet.
pub async fn get_result(
    State(state): State<AppState>,
    Path(image_id): Path<Uuid>,
) -> Result<Json<ResultStatusResponse>, ApiError> {
    let settings = state.ingestion.settings();
    let location = BlobLocation::new(&settings.processed_container, processed_blob_name(image_id));

    match state.store.get(&location).await {
        Ok(bytes) => {
            let result: Value = serde_json::from_slice(&bytes).map_err(|e| {
                tracing::error!(image_id = %image_id, error = %e, "Stored result is not valid JSON");
                ApiError::new(StatusCode::INTERNAL_SERVER_ERROR, "stored result is corrupt")
            })?;
            Ok(Json(ResultStatusResponse {
                image_id,
                status: "completed".to_string(),
                result: Some(result),
            }))
        }
        Err(StoreError::NotFound(_)) => Ok(Json(ResultStatusResponse {
            image_id,
            status: "pending".to_string(),
            result: None,
        })),
        Err(e) => {
            tracing::error!(image_id = %image_id, error = %e, "Result lookup failed");
            Err(ApiError::new(StatusCode::SERVICE_UNAVAILABLE, e.to_string()))
        }
    }
}

/// GET /api/v1/defect-types — the taxonomy the model grades against.
pub async fn defect_types() -> Json<Value> {
    let defect_types: Vec<Value> = DefectType::iter()
        .map(|t| json!({ "name": t.to_string(), "description": t.guidance() }))
        .collect();
    let severities: Vec<Value> = Severity::iter()
        .map(|s| json!({ "name": s.to_string(), "description": s.guidance() }))
        .collect();

    Json(json!({ "defect_types": defect_types, "severities": severities }))
}

/// GET /api/v1/facilities
pub async fn facilities(State(state): State<AppState>) -> Json<Value> {
    let rules = &state.ingestion.settings().rules;
    Json(json!({
        "facilities": rules.allowed_facilities,
        "product_skus": rules.allowed_product_skus,
    }))
}

#[derive(Debug, Deserialize)]
pub struct DeadLetterQuery {
    pub limit: Option<usize>,
}

/// GET /api/v1/dead-letters?limit=N — newest dead-letter records first.
pub async fn list_dead_letters(
    State(state): State<AppState>,
    Query(query): Query<DeadLetterQuery>,
) -> Result<Json<Vec<DeadLetterRecord>>, ApiError> {
    let limit = query
        .limit
        .unwrap_or(DEFAULT_DEAD_LETTER_LIMIT)
        .min(MAX_DEAD_LETTER_LIMIT);

    state
        .queue
        .dead_letters(limit)
        .await
        .map(Json)
        .map_err(|e| ApiError::new(StatusCode::SERVICE_UNAVAILABLE, e.to_string()))
}
