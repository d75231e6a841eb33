use async_trait::async_trait;
use reqwest::StatusCode;
use serde::Deserialize;
use serde_json::{Map, Value};
use std::str::FromStr;
use std::time::Duration;
use strum::IntoEnumIterator;

use crate::models::defect::{BoundingBox, DefectFindings, DefectType, Severity};
use crate::services::extraction::{extract_json_object, Extraction};

/// One image plus the product context sent to the vision model.
#[derive(Debug, Clone, Copy)]
pub struct InferenceRequest<'a> {
    pub image: &'a [u8],
    pub media_type: &'a str,
    pub product_sku: &'a str,
    pub facility: &'a str,
    pub metadata: &'a Map<String, Value>,
}

/// A hosted vision model that grades one image per call.
#[async_trait]
pub trait InferenceClient: Send + Sync {
    async fn analyze(&self, request: &InferenceRequest<'_>) -> Result<DefectFindings, InferenceError>;

    /// Identifier recorded as `model_version` in processed results.
    fn model_version(&self) -> &str;
}

#[derive(Debug, Clone, thiserror::Error, PartialEq)]
pub enum InferenceError {
    #[error("inference timed out after {0:?}")]
    Timeout(Duration),

    #[error("inference service timed out (HTTP {0})")]
    ProviderTimeout(u16),

    #[error("inference service rate limited the request")]
    RateLimited,

    #[error("model response is malformed: {0}")]
    MalformedResponse(String),

    #[error("inference service rejected credentials (HTTP {0})")]
    AuthFailure(u16),

    #[error("inference service unavailable: {0}")]
    Unavailable(String),

    #[error("inference service rejected the request (HTTP {status}): {message}")]
    Rejected { status: u16, message: String },
}

impl InferenceError {
    /// Stable label used in logs and metrics.
    pub fn kind(&self) -> &'static str {
        match self {
            InferenceError::Timeout(_) | InferenceError::ProviderTimeout(_) => "timeout",
            InferenceError::RateLimited => "rate_limited",
            InferenceError::MalformedResponse(_) => "malformed_response",
            InferenceError::AuthFailure(_) => "auth_failure",
            InferenceError::Unavailable(_) => "unavailable",
            InferenceError::Rejected { .. } => "rejected",
        }
    }

    /// Map an HTTP error status from a provider to a failure kind.
    pub fn from_status(status: StatusCode, body: &str) -> Self {
        let message: String = body.chars().take(300).collect();
        match status.as_u16() {
            401 | 403 => InferenceError::AuthFailure(status.as_u16()),
            429 => InferenceError::RateLimited,
            408 | 504 => InferenceError::ProviderTimeout(status.as_u16()),
            code if status.is_server_error() => {
                InferenceError::Unavailable(format!("HTTP {code}: {message}"))
            }
            code => InferenceError::Rejected { status: code, message },
        }
    }

    /// Map a transport failure (no HTTP response) to a failure kind.
    pub fn from_transport(err: reqwest::Error, timeout: Duration) -> Self {
        if err.is_timeout() {
            InferenceError::Timeout(timeout)
        } else {
            InferenceError::Unavailable(err.to_string())
        }
    }
}

/// Instruction template sent with every image.
pub fn build_prompt(product_sku: &str, facility: &str, metadata: &Map<String, Value>) -> String {
    let defect_types: Vec<&'static str> = DefectType::iter().map(<&'static str>::from).collect();
    let severities: Vec<&'static str> = Severity::iter().map(<&'static str>::from).collect();

    let mut prompt = String::from(
        "You are an expert quality inspector for Wiko Cutlery. \
         Analyze this product image for manufacturing defects.\n\n\
         Output ONLY valid JSON with no markdown, no code blocks and no explanatory text.\n\n",
    );
    prompt.push_str(&format!("Product SKU: {product_sku}\nFacility: {facility}\n"));
    if !metadata.is_empty() {
        prompt.push_str(&format!(
            "Production data: {}\n",
            Value::Object(metadata.clone())
        ));
    }

    prompt.push_str(&format!(
        "\nRequired JSON structure:\n{{\n  \"defect_detected\": boolean,\n  \
         \"defect_type\": \"{}\" or null,\n  \
         \"severity\": \"{}\" or null,\n  \
         \"description\": \"2-3 sentence technical description\",\n  \
         \"confidence\": number between 0.0 and 1.0,\n  \
         \"bounding_boxes\": [{{\"x\": int, \"y\": int, \"width\": int, \"height\": int}}]\n}}\n",
        defect_types.join("|"),
        severities.join("|"),
    ));

    prompt.push_str("\nDefect types:\n");
    for defect_type in DefectType::iter() {
        prompt.push_str(&format!("- {}: {}\n", defect_type, defect_type.guidance()));
    }

    prompt.push_str("\nSeverity rules:\n");
    for severity in Severity::iter() {
        prompt.push_str(&format!("- {}: {}\n", severity, severity.guidance()));
    }

    prompt.push_str(
        "\nWhen the product passes, use defect_detected false with null defect_type and severity, \
         for example:\n\
         {\"defect_detected\": false, \"defect_type\": null, \"severity\": null, \
         \"description\": \"Blade is clean with consistent finish, edge is uniform, handle shows no defects.\", \
         \"confidence\": 0.95, \"bounding_boxes\": []}\n\n\
         Analyze the image and output ONLY the JSON.",
    );
    prompt
}

#[derive(Debug, Deserialize)]
struct RawBox {
    x: f64,
    y: f64,
    width: f64,
    height: f64,
}

impl RawBox {
    fn round(&self) -> BoundingBox {
        BoundingBox {
            x: self.x.round() as i64,
            y: self.y.round() as i64,
            width: self.width.round() as i64,
            height: self.height.round() as i64,
        }
    }
}

#[derive(Debug, Deserialize)]
struct RawLocation {
    #[serde(default)]
    bounding_box: Option<RawBox>,
}

/// Loose view of what models actually return.
#[derive(Debug, Deserialize)]
struct RawFindings {
    #[serde(alias = "has_defect")]
    defect_detected: bool,
    #[serde(default)]
    defect_type: Option<String>,
    #[serde(default)]
    severity: Option<String>,
    #[serde(default)]
    description: Option<String>,
    confidence: f64,
    #[serde(default)]
    bounding_boxes: Option<Vec<RawBox>>,
    #[serde(default)]
    bounding_box: Option<RawBox>,
    #[serde(default)]
    location: Option<RawLocation>,
}

fn parse_label<T: FromStr>(field: &str, raw: Option<&str>, null_words: &[&str]) -> Result<Option<T>, InferenceError> {
    let Some(value) = raw.map(str::trim).filter(|v| !v.is_empty()) else {
        return Ok(None);
    };
    if null_words.iter().any(|word| value.eq_ignore_ascii_case(word)) {
        return Ok(None);
    }
    T::from_str(value)
        .map(Some)
        .map_err(|_| InferenceError::MalformedResponse(format!("unknown {field} `{value}`")))
}

/// Turn raw model text into schema-valid findings.
///
/// Every failure, from extraction to cross-field checks, is reported as
/// `MalformedResponse`.
pub fn parse_model_output(text: &str) -> Result<DefectFindings, InferenceError> {
    let object = match extract_json_object(text) {
        Extraction::Parsed(object) => object,
        Extraction::Malformed(reason) => return Err(InferenceError::MalformedResponse(reason)),
    };

    let raw: RawFindings = serde_json::from_value(Value::Object(object))
        .map_err(|e| InferenceError::MalformedResponse(e.to_string()))?;

    let defect_type = parse_label::<DefectType>("defect_type", raw.defect_type.as_deref(), &["none", "null"])?;
    let severity = parse_label::<Severity>("severity", raw.severity.as_deref(), &["pass", "none", "null"])?;

    let bounding_boxes = match (&raw.bounding_boxes, &raw.bounding_box, &raw.location) {
        (Some(boxes), _, _) => boxes.iter().map(RawBox::round).collect(),
        (None, Some(single), _) => vec![single.round()],
        (None, None, Some(RawLocation { bounding_box: Some(single) })) => vec![single.round()],
        _ => Vec::new(),
    };

    let findings = DefectFindings {
        defect_detected: raw.defect_detected,
        defect_type,
        severity,
        description: raw.description.unwrap_or_default().trim().to_string(),
        confidence: raw.confidence,
        bounding_boxes,
    };

    findings
        .check_schema()
        .map_err(InferenceError::MalformedResponse)?;
    Ok(findings)
}
