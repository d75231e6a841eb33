use async_trait::async_trait;
use base64::Engine;
use reqwest::{Client, Url};
use serde::Deserialize;
use std::time::Duration;

use crate::models::defect::DefectFindings;
use crate::services::inference::{
    build_prompt, parse_model_output, InferenceClient, InferenceError, InferenceRequest,
};

/// Client for an Anthropic model hosted on Amazon Bedrock (InvokeModel API).
///
/// Authenticates with a Bedrock API key sent as a bearer token.
pub struct BedrockClient {
    http: Client,
    url: Url,
    model_id: String,
    api_key: String,
    timeout: Duration,
}

#[derive(Deserialize)]
struct InvokeResponse {
    #[serde(default)]
    content: Vec<ContentBlock>,
}

#[derive(Deserialize)]
struct ContentBlock {
    #[serde(rename = "type")]
    kind: String,
    #[serde(default)]
    text: Option<String>,
}

#[derive(Debug, thiserror::Error)]
pub enum BedrockConfigError {
    #[error("HTTP client error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("invalid Bedrock endpoint: {0}")]
    Url(String),
}

impl BedrockClient {
    pub fn new(
        region: &str,
        model_id: &str,
        api_key: &str,
        timeout: Duration,
    ) -> Result<Self, BedrockConfigError> {
        let base = format!("https://bedrock-runtime.{region}.amazonaws.com/");
        Self::with_base_url(&base, model_id, api_key, timeout)
    }

    /// Point the client at a non-default runtime endpoint.
    pub fn with_base_url(
        base_url: &str,
        model_id: &str,
        api_key: &str,
        timeout: Duration,
    ) -> Result<Self, BedrockConfigError> {
        let mut url = Url::parse(base_url).map_err(|e| BedrockConfigError::Url(e.to_string()))?;
        // Model ids contain ':' and must be a single encoded segment
        url.path_segments_mut()
            .map_err(|_| BedrockConfigError::Url(format!("{base_url} cannot be a base")))?
            .pop_if_empty()
            .extend(["model", model_id, "invoke"]);

        let http = Client::builder().timeout(timeout).build()?;
        Ok(Self {
            http,
            url,
            model_id: model_id.to_string(),
            api_key: api_key.to_string(),
            timeout,
        })
    }
}

fn request_body(request: &InferenceRequest<'_>) -> serde_json::Value {
    serde_json::json!({
        "anthropic_version": "bedrock-2023-05-31",
        "max_tokens": 4096,
        "messages": [{
            "role": "user",
            "content": [
                {
                    "type": "image",
                    "source": {
                        "type": "base64",
                        "media_type": request.media_type,
                        "data": base64::engine::general_purpose::STANDARD.encode(request.image)
                    }
                },
                {
                    "type": "text",
                    "text": build_prompt(request.product_sku, request.facility, request.metadata)
                }
            ]
        }]
    })
}

fn response_text(body: &str) -> Result<String, InferenceError> {
    let response: InvokeResponse = serde_json::from_str(body)
        .map_err(|e| InferenceError::MalformedResponse(format!("invalid invoke envelope: {e}")))?;

    let text: Vec<String> = response
        .content
        .into_iter()
        .filter(|block| block.kind == "text")
        .filter_map(|block| block.text)
        .collect();

    if text.is_empty() {
        return Err(InferenceError::MalformedResponse(
            "response has no text content".to_string(),
        ));
    }
    Ok(text.join("\n"))
}

#[async_trait]
impl InferenceClient for BedrockClient {
    async fn analyze(&self, request: &InferenceRequest<'_>) -> Result<DefectFindings, InferenceError> {
        let response = self
            .http
            .post(self.url.clone())
            .bearer_auth(&self.api_key)
            .json(&request_body(request))
            .send()
            .await
            .map_err(|e| InferenceError::from_transport(e, self.timeout))?;

        let status = response.status();
        let body = response
            .text()
            .await
            .map_err(|e| InferenceError::from_transport(e, self.timeout))?;

        if !status.is_success() {
            return Err(InferenceError::from_status(status, &body));
        }

        parse_model_output(&response_text(&body)?)
    }

    fn model_version(&self) -> &str {
        &self.model_id
    }
}
