use axum::extract::{FromRequest, Multipart, Request, State};
use axum::http::{header, StatusCode};
use axum::Json;
use base64::Engine;

use crate::app_state::AppState;
use crate::models::ingest::{IngestJsonRequest, IngestResponse};
use crate::routes::ApiError;
use crate::services::ingestion::{IngestError, UploadRequest};

/// POST /ingest — accept an image for defect analysis.
///
/// Accepts `multipart/form-data` (an `image` file part plus `product_sku`,
/// `facility` and an optional JSON `metadata` field) or a JSON body with a
/// base64 `image`. Returns 202 once the raw image is stored and the job is
/// queued; analysis happens later in the worker.
///
/// Malformed bodies and failed validation are 400. A request larger than
/// [`request_body_limit`](crate::routes::request_body_limit) (twice
/// `MAX_IMAGE_BYTES` plus room for form fields) is cut off by the body limit
/// with 413 before any validation runs; an image over `MAX_IMAGE_BYTES` that
/// still fits under that ceiling is a 400.
pub async fn ingest_image(
    State(state): State<AppState>,
    request: Request,
) -> Result<(StatusCode, Json<IngestResponse>), ApiError> {
    let content_type = request
        .headers()
        .get(header::CONTENT_TYPE)
        .and_then(|value| value.to_str().ok())
        .unwrap_or_default()
        .to_ascii_lowercase();

    let upload = if content_type.starts_with("multipart/form-data") {
        let multipart = Multipart::from_request(request, &state)
            .await
            .map_err(|e| rejected(e.status(), e.body_text()))?;
        read_multipart(multipart).await?
    } else if content_type.starts_with("application/json") {
        let Json(body) = Json::<IngestJsonRequest>::from_request(request, &state)
            .await
            .map_err(|e| rejected(e.status(), e.body_text()))?;
        decode_json(body)?
    } else {
        return Err(ApiError::new(
            StatusCode::UNSUPPORTED_MEDIA_TYPE,
            "expected multipart/form-data or application/json",
        ));
    };

    let receipt = state.ingestion.ingest(upload).await.map_err(|e| match e {
        IngestError::InvalidInput(reason) => ApiError::bad_request(reason.to_string()),
        IngestError::DependencyUnavailable(reason) => {
            ApiError::new(StatusCode::SERVICE_UNAVAILABLE, reason.to_string())
        }
    })?;

    Ok((
        StatusCode::ACCEPTED,
        Json(IngestResponse {
            image_id: receipt.image_id,
            blob_name: receipt.raw_location.blob_name,
            raw_container: receipt.raw_location.container,
            queue: receipt.queue,
            enqueued_at: receipt.enqueued_at,
        }),
    ))
}

/// Extractor rejections are client errors; only the body limit keeps its 413.
fn rejected(status: StatusCode, body: String) -> ApiError {
    if status == StatusCode::PAYLOAD_TOO_LARGE {
        ApiError::new(status, body)
    } else {
        ApiError::bad_request(body)
    }
}

async fn read_multipart(mut multipart: Multipart) -> Result<UploadRequest, ApiError> {
    let mut upload = UploadRequest::default();
    let mut saw_image = false;

    while let Some(field) = multipart
        .next_field()
        .await
        .map_err(|e| rejected(e.status(), e.body_text()))?
    {
        let name = field.name().unwrap_or_default().to_string();
        match name.as_str() {
            "image" | "file" => {
                upload.filename = field.file_name().map(str::to_string);
                upload.content_type = field.content_type().map(str::to_string);
                upload.image = field
                    .bytes()
                    .await
                    .map_err(|e| rejected(e.status(), e.body_text()))?
                    .to_vec();
                saw_image = true;
            }
            "product_sku" | "facility" | "metadata" => {
                let text = field
                    .text()
                    .await
                    .map_err(|e| rejected(e.status(), e.body_text()))?;
                match name.as_str() {
                    "product_sku" => upload.product_sku = text,
                    "facility" => upload.facility = text,
                    _ if text.trim().is_empty() => {}
                    _ => {
                        let value = serde_json::from_str(&text).map_err(|e| {
                            ApiError::bad_request(format!("metadata is not valid JSON: {e}"))
                        })?;
                        upload.metadata = Some(value);
                    }
                }
            }
            other => tracing::debug!(field = other, "Ignoring unknown multipart field"),
        }
    }

    if !saw_image {
        return Err(ApiError::bad_request("multipart body has no `image` part"));
    }
    Ok(upload)
}

/// Decode a base64 image, accepting a `data:<mime>;base64,` prefix.
fn decode_json(body: IngestJsonRequest) -> Result<UploadRequest, ApiError> {
    let (data_url_type, encoded) = match body.image.strip_prefix("data:") {
        Some(rest) => {
            let (meta, data) = rest
                .split_once(',')
                .ok_or_else(|| ApiError::bad_request("malformed data URL in `image`"))?;
            let mime = meta.strip_suffix(";base64").ok_or_else(|| {
                ApiError::bad_request("data URL in `image` must be base64 encoded")
            })?;
            (Some(mime.to_string()), data)
        }
        None => (None, body.image.as_str()),
    };

    let image = base64::engine::general_purpose::STANDARD
        .decode(encoded.trim())
        .map_err(|e| ApiError::bad_request(format!("`image` is not valid base64: {e}")))?;

    Ok(UploadRequest {
        image,
        filename: body.filename,
        content_type: body.content_type.or(data_url_type),
        product_sku: body.product_sku,
        facility: body.facility,
        metadata: body.metadata,
    })
}
