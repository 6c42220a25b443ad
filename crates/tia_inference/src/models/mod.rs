use async_trait::async_trait;
use serde_json::Value;
use std::fmt;
use std::sync::Arc;
use thiserror::Error;
use tia_core::config::AnalysisConfig;
use tia_core::Result;

pub mod openai;
pub mod scripted;

pub use openai::OpenAiModel;
pub use scripted::ScriptedModel;

/// One schema-constrained completion request.
#[derive(Debug, Clone, PartialEq)]
pub struct LlmRequest {
    pub model: String,
    pub system_prompt: String,
    pub user_content: String,
    pub temperature: f32,
    pub seed: Option<u64>,
    pub max_output_tokens: u32,
    pub schema_name: String,
    pub schema: Value,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ResponseStatus {
    Completed,
    Refused(String),
    ContentFiltered,
    Truncated,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Usage {
    pub input_tokens: u64,
    pub cached_input_tokens: u64,
    pub output_tokens: u64,
}

#[derive(Debug, Clone, PartialEq)]
pub struct LlmResponse {
    /// Model id reported by the provider, which may carry a date suffix.
    pub model: String,
    pub status: ResponseStatus,
    pub output_text: String,
    pub usage: Option<Usage>,
}

impl LlmResponse {
    pub fn completed(model: impl Into<String>, output_text: impl Into<String>, usage: Option<Usage>) -> Self {
        Self {
            model: model.into(),
            status: ResponseStatus::Completed,
            output_text: output_text.into(),
            usage,
        }
    }

    pub fn with_status(model: impl Into<String>, status: ResponseStatus, usage: Option<Usage>) -> Self {
        Self {
            model: model.into(),
            status,
            output_text: String::new(),
            usage,
        }
    }
}

/// Failures of a single API call, before any retry decision.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum LlmCallError {
    #[error("Rate limited: {0}")]
    RateLimited(String),

    #[error("Request timed out: {0}")]
    Timeout(String),

    #[error("Server error {status}: {message}")]
    Server { status: u16, message: String },

    #[error("Network error: {0}")]
    Network(String),

    #[error("Authentication rejected: {0}")]
    Auth(String),

    #[error("Request rejected: {0}")]
    InvalidRequest(String),

    #[error("Could not decode API response: {0}")]
    Decode(String),
}

impl LlmCallError {
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            Self::RateLimited(_) | Self::Timeout(_) | Self::Server { .. } | Self::Network(_)
        )
    }
}

#[async_trait]
pub trait LlmClient: Send + Sync + fmt::Debug {
    fn name(&self) -> &str;

    async fn respond(&self, request: &LlmRequest) -> std::result::Result<LlmResponse, LlmCallError>;
}

/// Builds the production client. Fails when no API key is configured.
pub fn create_model(config: &AnalysisConfig) -> Result<Arc<dyn LlmClient>> {
    let model = OpenAiModel::new(config)?;
    tracing::debug!("Created {} client for {}", model.name(), config.base_url);
    Ok(Arc::new(model))
}

#[cfg(test)]
mod tests {
    use super::*;
    use tia_core::Error;

    #[test]
    fn test_transient_classification() {
        assert!(LlmCallError::RateLimited("slow down".to_string()).is_transient());
        assert!(LlmCallError::Server { status: 503, message: "busy".to_string() }.is_transient());
        assert!(LlmCallError::Timeout("120s".to_string()).is_transient());
        assert!(!LlmCallError::Auth("bad key".to_string()).is_transient());
        assert!(!LlmCallError::InvalidRequest("unknown model".to_string()).is_transient());
        assert!(!LlmCallError::Decode("eof".to_string()).is_transient());
    }

    #[test]
    fn test_create_model_requires_api_key() {
        let config = AnalysisConfig::default();
        assert!(matches!(create_model(&config), Err(Error::Config(_))));

        let config = AnalysisConfig {
            api_key: Some("sk-test".to_string()),
            ..AnalysisConfig::default()
        };
        let model = create_model(&config).unwrap();
        assert_eq!(model.name(), "OpenAI");
    }
}
