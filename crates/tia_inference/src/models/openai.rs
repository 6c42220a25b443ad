use async_trait::async_trait;
use reqwest::{Client, StatusCode};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fmt;
use std::sync::Arc;
use tia_core::config::AnalysisConfig;
use tia_core::{Error, Result};
use tracing::{debug, warn};

use super::{LlmCallError, LlmClient, LlmRequest, LlmResponse, ResponseStatus, Usage};

#[derive(Serialize)]
struct InputMessage<'a> {
    role: &'a str,
    content: &'a str,
}

#[derive(Serialize)]
struct SchemaFormat<'a> {
    #[serde(rename = "type")]
    kind: &'a str,
    name: &'a str,
    schema: &'a Value,
    strict: bool,
}

#[derive(Serialize)]
struct TextOptions<'a> {
    format: SchemaFormat<'a>,
}

#[derive(Serialize)]
struct ResponsesRequest<'a> {
    model: &'a str,
    input: Vec<InputMessage<'a>>,
    temperature: f32,
    #[serde(skip_serializing_if = "Option::is_none")]
    seed: Option<u64>,
    max_output_tokens: u32,
    text: TextOptions<'a>,
}

#[derive(Deserialize)]
struct ResponsesBody {
    #[serde(default)]
    model: Option<String>,
    #[serde(default)]
    status: Option<String>,
    #[serde(default)]
    incomplete_details: Option<IncompleteDetails>,
    #[serde(default)]
    output: Vec<OutputItem>,
    #[serde(default)]
    usage: Option<UsageBody>,
}

#[derive(Deserialize)]
struct IncompleteDetails {
    #[serde(default)]
    reason: Option<String>,
}

#[derive(Deserialize)]
struct OutputItem {
    #[serde(default)]
    content: Vec<ContentPart>,
}

#[derive(Deserialize)]
struct ContentPart {
    #[serde(rename = "type", default)]
    kind: String,
    #[serde(default)]
    text: Option<String>,
    #[serde(default)]
    refusal: Option<String>,
}

#[derive(Deserialize)]
struct UsageBody {
    #[serde(default)]
    input_tokens: u64,
    #[serde(default)]
    output_tokens: u64,
    #[serde(default)]
    input_tokens_details: Option<InputTokenDetails>,
}

#[derive(Deserialize)]
struct InputTokenDetails {
    #[serde(default)]
    cached_tokens: u64,
}

#[derive(Deserialize)]
struct ErrorBody {
    error: ErrorDetail,
}

#[derive(Deserialize)]
struct ErrorDetail {
    #[serde(default)]
    message: String,
}

/// Client for the OpenAI Responses API with strict JSON-schema output.
pub struct OpenAiModel {
    client: Arc<Client>,
    api_key: String,
    base_url: String,
}

impl OpenAiModel {
    pub fn new(config: &AnalysisConfig) -> Result<Self> {
        let api_key = config
            .api_key
            .clone()
            .filter(|key| !key.trim().is_empty())
            .ok_or_else(|| Error::Config("OpenAI API key is required".to_string()))?;

        let client = Client::builder().timeout(config.timeout()).build()?;
        Ok(Self {
            client: Arc::new(client),
            api_key,
            base_url: config.base_url.trim_end_matches('/').to_string(),
        })
    }
}

impl fmt::Debug for OpenAiModel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("OpenAiModel")
            .field("client", &"<reqwest::Client>")
            .field("api_key", &"<redacted>")
            .field("base_url", &self.base_url)
            .finish()
    }
}

#[async_trait]
impl LlmClient for OpenAiModel {
    fn name(&self) -> &str {
        "OpenAI"
    }

    async fn respond(&self, request: &LlmRequest) -> std::result::Result<LlmResponse, LlmCallError> {
        let body = ResponsesRequest {
            model: &request.model,
            input: vec![
                InputMessage { role: "system", content: &request.system_prompt },
                InputMessage { role: "user", content: &request.user_content },
            ],
            temperature: request.temperature,
            seed: request.seed,
            max_output_tokens: request.max_output_tokens,
            text: TextOptions {
                format: SchemaFormat {
                    kind: "json_schema",
                    name: &request.schema_name,
                    schema: &request.schema,
                    strict: true,
                },
            },
        };

        debug!(
            "POST {}/responses model={} temperature={} max_output_tokens={} content_chars={}",
            self.base_url,
            request.model,
            request.temperature,
            request.max_output_tokens,
            request.user_content.len()
        );

        let response = self
            .client
            .post(format!("{}/responses", self.base_url))
            .header("Authorization", format!("Bearer {}", self.api_key))
            .json(&body)
            .send()
            .await
            .map_err(transport_error)?;

        let status = response.status();
        let text = response.text().await.map_err(transport_error)?;
        if !status.is_success() {
            return Err(classify_status(status, &text));
        }

        let body: ResponsesBody = serde_json::from_str(&text).map_err(|e| LlmCallError::Decode(e.to_string()))?;
        Ok(interpret_body(body, &request.model))
    }
}

fn transport_error(e: reqwest::Error) -> LlmCallError {
    if e.is_timeout() {
        LlmCallError::Timeout(e.to_string())
    } else {
        LlmCallError::Network(e.to_string())
    }
}

fn classify_status(status: StatusCode, body: &str) -> LlmCallError {
    let message = serde_json::from_str::<ErrorBody>(body)
        .map(|b| b.error.message)
        .unwrap_or_else(|_| body.chars().take(200).collect());

    match status.as_u16() {
        401 | 403 => LlmCallError::Auth(message),
        408 => LlmCallError::Timeout(message),
        429 => LlmCallError::RateLimited(message),
        code if status.is_server_error() => LlmCallError::Server { status: code, message },
        _ => LlmCallError::InvalidRequest(format!("HTTP {}: {}", status.as_u16(), message)),
    }
}

fn interpret_body(body: ResponsesBody, requested_model: &str) -> LlmResponse {
    let model = body
        .model
        .filter(|m| !m.is_empty())
        .unwrap_or_else(|| requested_model.to_string());

    let usage = body.usage.map(|u| Usage {
        input_tokens: u.input_tokens,
        output_tokens: u.output_tokens,
        cached_input_tokens: u.input_tokens_details.map_or(0, |d| d.cached_tokens),
    });

    if body.status.as_deref() == Some("incomplete") {
        let reason = body.incomplete_details.and_then(|d| d.reason).unwrap_or_default();
        let status = match reason.as_str() {
            "content_filter" => ResponseStatus::ContentFiltered,
            "max_output_tokens" => ResponseStatus::Truncated,
            other => {
                warn!("Incomplete response with unrecognised reason '{}'", other);
                ResponseStatus::Truncated
            }
        };
        return LlmResponse::with_status(model, status, usage);
    }

    let mut output_text = String::new();
    for part in body.output.iter().flat_map(|item| item.content.iter()) {
        match part.kind.as_str() {
            "refusal" => {
                let message = part.refusal.clone().unwrap_or_default();
                return LlmResponse::with_status(model, ResponseStatus::Refused(message), usage);
            }
            "output_text" => {
                if let Some(text) = &part.text {
                    output_text.push_str(text);
                }
            }
            _ => {}
        }
    }

    LlmResponse::completed(model, output_text, usage)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn body(value: Value) -> ResponsesBody {
        serde_json::from_value(value).unwrap()
    }

    #[test]
    fn test_model_requires_api_key() {
        let result = OpenAiModel::new(&AnalysisConfig::default());
        assert_eq!(result.unwrap_err().to_string(), "Configuration error: OpenAI API key is required");

        let blank = AnalysisConfig {
            api_key: Some("   ".to_string()),
            ..AnalysisConfig::default()
        };
        assert!(OpenAiModel::new(&blank).is_err());
    }

    #[test]
    fn test_debug_redacts_key() {
        let config = AnalysisConfig {
            api_key: Some("sk-very-secret".to_string()),
            ..AnalysisConfig::default()
        };
        let model = OpenAiModel::new(&config).unwrap();
        let printed = format!("{:?}", model);
        assert!(!printed.contains("sk-very-secret"));
        assert!(printed.contains("api.openai.com"));
    }

    #[test]
    fn test_request_body_carries_strict_schema() {
        let schema = json!({"type": "object"});
        let request = ResponsesRequest {
            model: "gpt-4o",
            input: vec![InputMessage { role: "system", content: "sys" }],
            temperature: 0.1,
            seed: None,
            max_output_tokens: 4000,
            text: TextOptions {
                format: SchemaFormat { kind: "json_schema", name: "threat_intelligence_report", schema: &schema, strict: true },
            },
        };
        let value = serde_json::to_value(&request).unwrap();
        assert_eq!(value["text"]["format"]["type"], "json_schema");
        assert_eq!(value["text"]["format"]["strict"], true);
        assert_eq!(value["max_output_tokens"], 4000);
        assert!(value.get("seed").is_none());
    }

    #[test]
    fn test_completed_body_collects_text_and_usage() {
        let response = interpret_body(
            body(json!({
                "model": "gpt-4o-2024-08-06",
                "status": "completed",
                "output": [{
                    "type": "message",
                    "content": [{"type": "output_text", "text": "{\"summary\":\"ok\"}"}]
                }],
                "usage": {
                    "input_tokens": 1200,
                    "output_tokens": 300,
                    "input_tokens_details": {"cached_tokens": 1024}
                }
            })),
            "gpt-4o",
        );
        assert_eq!(response.status, ResponseStatus::Completed);
        assert_eq!(response.model, "gpt-4o-2024-08-06");
        assert_eq!(response.output_text, "{\"summary\":\"ok\"}");
        assert_eq!(
            response.usage,
            Some(Usage { input_tokens: 1200, cached_input_tokens: 1024, output_tokens: 300 })
        );
    }

    #[test]
    fn test_refusal_and_incomplete_statuses() {
        let refused = interpret_body(
            body(json!({
                "status": "completed",
                "output": [{"content": [{"type": "refusal", "refusal": "I can't help with that."}]}],
                "usage": {"input_tokens": 50, "output_tokens": 8}
            })),
            "gpt-4o",
        );
        assert_eq!(refused.status, ResponseStatus::Refused("I can't help with that.".to_string()));
        assert_eq!(refused.model, "gpt-4o");
        assert!(refused.usage.is_some());

        let filtered = interpret_body(
            body(json!({"status": "incomplete", "incomplete_details": {"reason": "content_filter"}})),
            "gpt-4o",
        );
        assert_eq!(filtered.status, ResponseStatus::ContentFiltered);

        let truncated = interpret_body(
            body(json!({"status": "incomplete", "incomplete_details": {"reason": "max_output_tokens"}})),
            "gpt-4o",
        );
        assert_eq!(truncated.status, ResponseStatus::Truncated);
    }

    #[test]
    fn test_http_status_classification() {
        let body = r#"{"error": {"message": "Incorrect API key provided"}}"#;
        assert_eq!(
            classify_status(StatusCode::UNAUTHORIZED, body),
            LlmCallError::Auth("Incorrect API key provided".to_string())
        );
        assert!(classify_status(StatusCode::TOO_MANY_REQUESTS, "{}").is_transient());
        assert!(classify_status(StatusCode::BAD_GATEWAY, "upstream").is_transient());
        assert!(matches!(
            classify_status(StatusCode::BAD_REQUEST, body),
            LlmCallError::InvalidRequest(_)
        ));
    }
}
