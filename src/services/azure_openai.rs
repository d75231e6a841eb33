use async_trait::async_trait;
use base64::Engine;
use reqwest::Client;
use serde::Deserialize;
use std::time::Duration;

use crate::models::defect::DefectFindings;
use crate::services::inference::{
    build_prompt, parse_model_output, InferenceClient, InferenceError, InferenceRequest,
};

const SYSTEM_PROMPT: &str =
    "You are a manufacturing quality inspector. Respond with a single JSON object only.";

/// Client for an Azure OpenAI vision deployment (chat completions API).
pub struct AzureOpenAiClient {
    http: Client,
    endpoint: String,
    deployment: String,
    api_version: String,
    api_key: String,
    timeout: Duration,
}

#[derive(Deserialize)]
struct ChatCompletion {
    #[serde(default)]
    choices: Vec<ChatChoice>,
}

#[derive(Deserialize)]
struct ChatChoice {
    message: ChatMessage,
}

#[derive(Deserialize)]
struct ChatMessage {
    #[serde(default)]
    content: Option<String>,
}

impl AzureOpenAiClient {
    pub fn new(
        endpoint: &str,
        deployment: &str,
        api_version: &str,
        api_key: &str,
        timeout: Duration,
    ) -> Result<Self, reqwest::Error> {
        let http = Client::builder().timeout(timeout).build()?;
        Ok(Self {
            http,
            endpoint: endpoint.trim_end_matches('/').to_string(),
            deployment: deployment.to_string(),
            api_version: api_version.to_string(),
            api_key: api_key.to_string(),
            timeout,
        })
    }

    fn url(&self) -> String {
        format!(
            "{}/openai/deployments/{}/chat/completions?api-version={}",
            self.endpoint, self.deployment, self.api_version
        )
    }
}

fn request_body(request: &InferenceRequest<'_>) -> serde_json::Value {
    let data_url = format!(
        "data:{};base64,{}",
        request.media_type,
        base64::engine::general_purpose::STANDARD.encode(request.image)
    );

    serde_json::json!({
        "messages": [
            { "role": "system", "content": SYSTEM_PROMPT },
            {
                "role": "user",
                "content": [
                    {
                        "type": "text",
                        "text": build_prompt(request.product_sku, request.facility, request.metadata)
                    },
                    { "type": "image_url", "image_url": { "url": data_url, "detail": "high" } }
                ]
            }
        ],
        "response_format": { "type": "json_object" },
        "max_completion_tokens": 4096
    })
}

/// First choice's message text, or `MalformedResponse` when there is none.
fn completion_text(body: &str) -> Result<String, InferenceError> {
    let completion: ChatCompletion = serde_json::from_str(body)
        .map_err(|e| InferenceError::MalformedResponse(format!("invalid completion envelope: {e}")))?;

    completion
        .choices
        .into_iter()
        .next()
        .and_then(|choice| choice.message.content)
        .filter(|content| !content.trim().is_empty())
        .ok_or_else(|| InferenceError::MalformedResponse("completion has no message content".to_string()))
}

#[async_trait]
impl InferenceClient for AzureOpenAiClient {
    async fn analyze(&self, request: &InferenceRequest<'_>) -> Result<DefectFindings, InferenceError> {
        let response = self
            .http
            .post(self.url())
            .header("api-key", &self.api_key)
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

        parse_model_output(&completion_text(&body)?)
    }

    fn model_version(&self) -> &str {
        &self.deployment
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::Map;

    #[test]
    fn test_url_includes_deployment_and_version() {
        let client = AzureOpenAiClient::new(
            "https://wiko.openai.azure.com/",
            "gpt-4o-vision",
            "2024-10-21",
            "key",
            Duration::from_secs(5),
        )
        .unwrap();
        assert_eq!(
            client.url(),
            "https://wiko.openai.azure.com/openai/deployments/gpt-4o-vision/chat/completions?api-version=2024-10-21"
        );
        assert_eq!(client.model_version(), "gpt-4o-vision");
    }

    #[test]
    fn test_request_body_carries_image_as_data_url() {
        let metadata = Map::new();
        let request = InferenceRequest {
            image: &[0xFF, 0xD8, 0xFF],
            media_type: "image/jpeg",
            product_sku: "WK-KN-150",
            facility: "hongkong",
            metadata: &metadata,
        };
        let body = request_body(&request);
        let url = body["messages"][1]["content"][1]["image_url"]["url"].as_str().unwrap();
        assert_eq!(url, "data:image/jpeg;base64,/9j/");
        assert_eq!(body["response_format"]["type"], "json_object");
    }

    #[test]
    fn test_completion_text_extracts_first_choice() {
        let body = r#"{"choices": [{"message": {"role": "assistant", "content": "{\"defect_detected\": false, \"confidence\": 0.9}"}}]}"#;
        let findings = parse_model_output(&completion_text(body).unwrap()).unwrap();
        assert!(!findings.defect_detected);
    }

    #[test]
    fn test_empty_choices_are_malformed() {
        let err = completion_text(r#"{"choices": []}"#).unwrap_err();
        assert_eq!(err.kind(), "malformed_response");

        let err = completion_text(r#"{"choices": [{"message": {"content": null}}]}"#).unwrap_err();
        assert_eq!(err.kind(), "malformed_response");
    }
}
