use std::sync::Arc;
use std::time::Duration;
use tia_core::config::AnalysisConfig;
use tia_core::{AnalysisError, ThreatReport, TokenLedger, TokenUsage};
use tracing::{debug, error, info, warn};

use crate::models::{LlmCallError, LlmClient, LlmRequest, LlmResponse, ResponseStatus, Usage};
use crate::prompt::{self, SYSTEM_PROMPT};
use crate::schema::{self, SCHEMA_NAME};

/// Text handed to the engine after extraction.
#[derive(Debug, Clone, Copy)]
pub struct ArticleInput<'a> {
    pub url: &'a str,
    pub title: Option<&'a str>,
    pub text: &'a str,
}

#[derive(Debug, Clone, PartialEq)]
pub struct AnalysisOutcome {
    /// Model id as reported by the provider.
    pub model: String,
    pub raw_text: String,
    pub report: ThreatReport,
    pub usage: Option<Usage>,
    pub attempts: u32,
    pub truncated: bool,
}

pub struct AnalysisEngine {
    client: Arc<dyn LlmClient>,
    ledger: Arc<dyn TokenLedger>,
    config: AnalysisConfig,
}

impl AnalysisEngine {
    pub fn new(client: Arc<dyn LlmClient>, ledger: Arc<dyn TokenLedger>, config: &AnalysisConfig) -> Self {
        Self {
            client,
            ledger,
            config: config.clone(),
        }
    }

    pub fn model(&self) -> &str {
        &self.config.model
    }

    fn build_request(&self, input: &ArticleInput<'_>) -> (LlmRequest, bool) {
        let prepared = prompt::fit_to_budget(input.text, self.config.max_input_tokens);
        let request = LlmRequest {
            model: self.config.model.clone(),
            system_prompt: SYSTEM_PROMPT.to_string(),
            user_content: prompt::user_content(input.url, input.title, &prepared.text),
            temperature: self.config.temperature,
            seed: self.config.seed,
            max_output_tokens: self.config.max_output_tokens,
            schema_name: SCHEMA_NAME.to_string(),
            schema: schema::report_schema(),
        };
        (request, prepared.truncated)
    }

    /// Runs one analysis: request, retries, usage accounting, status
    /// classification and report normalization.
    pub async fn analyze(&self, input: &ArticleInput<'_>) -> Result<AnalysisOutcome, AnalysisError> {
        if input.text.trim().is_empty() {
            return Err(AnalysisError::InvalidRequest("no content to analyze".to_string()));
        }

        let (request, truncated) = self.build_request(input);
        let (response, attempts) = self.call_with_retry(&request).await?;
        info!(
            "Received response from {} using model {} after {} attempt(s)",
            self.client.name(),
            response.model,
            attempts
        );
        self.record_usage(&response).await;

        match &response.status {
            ResponseStatus::Completed => {}
            ResponseStatus::Refused(message) => {
                error!("Model refused to analyze {}: {}", input.url, message);
                return Err(AnalysisError::Refusal(message.clone()));
            }
            ResponseStatus::ContentFiltered => {
                error!("Content filter triggered for {}", input.url);
                return Err(AnalysisError::ContentFiltered);
            }
            ResponseStatus::Truncated => {
                error!("Response for {} hit the output token limit", input.url);
                return Err(AnalysisError::TokenLimitExceeded);
            }
        }

        if response.output_text.trim().is_empty() {
            return Err(AnalysisError::SchemaViolation("empty response".to_string()));
        }

        let report = schema::parse_report(&response.output_text)?;
        debug!(
            "Parsed report: {} actors, {} techniques, {} sectors",
            report.threat_actors.len(),
            report.mitre_techniques.len(),
            report.critical_sectors.len()
        );

        Ok(AnalysisOutcome {
            model: response.model,
            raw_text: response.output_text,
            report,
            usage: response.usage,
            attempts,
            truncated,
        })
    }

    async fn call_with_retry(&self, request: &LlmRequest) -> Result<(LlmResponse, u32), AnalysisError> {
        let max_delay = Duration::from_millis(self.config.max_backoff_ms);
        let mut delay = Duration::from_millis(self.config.initial_backoff_ms).min(max_delay);
        let mut attempt = 0;

        loop {
            attempt += 1;
            info!(
                "Sending request to {} with model {} (attempt {})",
                self.client.name(),
                request.model,
                attempt
            );

            let err = match self.client.respond(request).await {
                Ok(response) => return Ok((response, attempt)),
                Err(err) => err,
            };

            if err.is_transient() && attempt <= self.config.max_retries {
                warn!(
                    "API error (attempt {}/{}): {}. Retrying in {:?}",
                    attempt,
                    self.config.max_retries + 1,
                    err,
                    delay
                );
                tokio::time::sleep(delay).await;
                delay = next_delay(delay, self.config.backoff_factor, max_delay);
                continue;
            }

            error!("API request failed after {} attempt(s): {}", attempt, err);
            return Err(classify(err, attempt));
        }
    }

    async fn record_usage(&self, response: &LlmResponse) {
        let Some(usage) = response.usage else {
            debug!("Response carried no usage counters");
            return;
        };
        let record = TokenUsage::new(
            response.model.clone(),
            usage.input_tokens,
            usage.output_tokens,
            usage.cached_input_tokens,
        );
        debug!(
            "API usage: {} input ({} cached), {} output tokens",
            usage.input_tokens, usage.cached_input_tokens, usage.output_tokens
        );
        if let Err(e) = self.ledger.record_token_usage(&record).await {
            warn!("Failed to record token usage: {}", e);
        }
    }
}

fn classify(err: LlmCallError, attempts: u32) -> AnalysisError {
    match err {
        LlmCallError::Auth(message) => AnalysisError::AuthError(message),
        LlmCallError::InvalidRequest(message) => AnalysisError::InvalidRequest(message),
        LlmCallError::Decode(message) => AnalysisError::SchemaViolation(format!("unreadable API response: {}", message)),
        transient => AnalysisError::TransientApiError {
            attempts,
            message: transient.to_string(),
        },
    }
}

/// Multiplies the delay by `factor` plus up to 10% jitter, capped at `max`.
fn next_delay(current: Duration, factor: f64, max: Duration) -> Duration {
    let jitter = 1.0 + 0.1 * rand::random::<f64>();
    current.mul_f64(factor * jitter).min(max)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::ScriptedModel;
    use async_trait::async_trait;
    use serde_json::json;
    use std::sync::Mutex;

    #[derive(Default)]
    struct RecordingLedger {
        rows: Mutex<Vec<TokenUsage>>,
    }

    impl RecordingLedger {
        fn rows(&self) -> Vec<TokenUsage> {
            self.rows.lock().unwrap().clone()
        }
    }

    #[async_trait]
    impl TokenLedger for RecordingLedger {
        async fn record_token_usage(&self, usage: &TokenUsage) -> tia_core::Result<()> {
            self.rows.lock().unwrap().push(usage.clone());
            Ok(())
        }
    }

    fn config() -> AnalysisConfig {
        AnalysisConfig {
            api_key: Some("sk-test".to_string()),
            initial_backoff_ms: 1,
            max_backoff_ms: 5,
            ..AnalysisConfig::default()
        }
    }

    fn usage() -> Usage {
        Usage { input_tokens: 900, cached_input_tokens: 0, output_tokens: 250 }
    }

    fn engine(model: &Arc<ScriptedModel>, ledger: &Arc<RecordingLedger>, config: &AnalysisConfig) -> AnalysisEngine {
        AnalysisEngine::new(model.clone(), ledger.clone(), config)
    }

    fn input() -> ArticleInput<'static> {
        ArticleInput {
            url: "https://research.example.com/loader",
            title: Some("New loader"),
            text: "The actor delivered a loader through phishing emails targeting banks.",
        }
    }

    fn report_json() -> serde_json::Value {
        json!({
            "summary": "A loader campaign.",
            "source_evaluation": {
                "reliability": {"level": "High", "justification": "Vendor"},
                "credibility": {"level": "High", "justification": "Samples shared"},
                "source_type": "Cybersecurity Vendor"
            },
            "threat_actors": [],
            "mitre_techniques": [{"id": "T1566", "name": "Phishing", "description": "Emails"}],
            "key_insights": ["Banks targeted"],
            "potential_issues": [],
            "intelligence_gaps": [],
            "critical_sectors": [{"name": "Financial Services Sector", "score": 4, "justification": "Banks"}]
        })
    }

    #[tokio::test]
    async fn test_successful_analysis_records_usage() {
        let model = Arc::new(ScriptedModel::new());
        model.push_json("gpt-4o-2024-08-06", &report_json(), usage());
        let ledger = Arc::new(RecordingLedger::default());

        let outcome = engine(&model, &ledger, &config()).analyze(&input()).await.unwrap();
        assert_eq!(outcome.model, "gpt-4o-2024-08-06");
        assert_eq!(outcome.attempts, 1);
        assert!(!outcome.truncated);
        assert_eq!(outcome.report.critical_sectors[0].score, 4);

        let rows = ledger.rows();
        assert_eq!(rows.len(), 1);
        assert_eq!((rows[0].input_tokens, rows[0].output_tokens), (900, 250));

        let request = &model.requests()[0];
        assert_eq!(request.schema_name, "threat_intelligence_report");
        assert_eq!(request.model, "gpt-4o");
        assert_eq!(request.max_output_tokens, 4000);
        assert!(request.user_content.contains("Title: New loader"));
    }

    #[tokio::test]
    async fn test_transient_failure_is_retried() {
        let model = Arc::new(ScriptedModel::new());
        model
            .push_error(LlmCallError::RateLimited("429".to_string()))
            .push_error(LlmCallError::Server { status: 502, message: "bad gateway".to_string() })
            .push_json("gpt-4o", &report_json(), usage());
        let ledger = Arc::new(RecordingLedger::default());

        let outcome = engine(&model, &ledger, &config()).analyze(&input()).await.unwrap();
        assert_eq!(outcome.attempts, 3);
        assert_eq!(model.calls(), 3);
        assert_eq!(ledger.rows().len(), 1);
    }

    #[tokio::test]
    async fn test_retries_are_bounded() {
        let model = Arc::new(ScriptedModel::new());
        for _ in 0..5 {
            model.push_error(LlmCallError::Timeout("deadline".to_string()));
        }
        let ledger = Arc::new(RecordingLedger::default());
        let config = AnalysisConfig { max_retries: 2, ..config() };

        let err = engine(&model, &ledger, &config).analyze(&input()).await.unwrap_err();
        assert!(matches!(err, AnalysisError::TransientApiError { attempts: 3, .. }));
        assert_eq!(model.calls(), 3);
        assert!(ledger.rows().is_empty());
    }

    #[tokio::test]
    async fn test_terminal_errors_are_not_retried() {
        let model = Arc::new(ScriptedModel::new());
        model.push_error(LlmCallError::Auth("invalid key".to_string()));
        let ledger = Arc::new(RecordingLedger::default());

        let err = engine(&model, &ledger, &config()).analyze(&input()).await.unwrap_err();
        assert_eq!(err, AnalysisError::AuthError("invalid key".to_string()));
        assert_eq!(model.calls(), 1);
    }

    #[tokio::test]
    async fn test_refusal_still_records_usage() {
        let model = Arc::new(ScriptedModel::new());
        model.push(Ok(LlmResponse::with_status(
            "gpt-4o",
            ResponseStatus::Refused("I can't assist with that.".to_string()),
            Some(usage()),
        )));
        let ledger = Arc::new(RecordingLedger::default());

        let err = engine(&model, &ledger, &config()).analyze(&input()).await.unwrap_err();
        assert_eq!(err, AnalysisError::Refusal("I can't assist with that.".to_string()));
        assert!(!err.is_retryable());
        assert_eq!(ledger.rows().len(), 1);
    }

    #[tokio::test]
    async fn test_incomplete_statuses_are_classified() {
        let model = Arc::new(ScriptedModel::new());
        model
            .push(Ok(LlmResponse::with_status("gpt-4o", ResponseStatus::ContentFiltered, None)))
            .push(Ok(LlmResponse::with_status("gpt-4o", ResponseStatus::Truncated, Some(usage()))));
        let ledger = Arc::new(RecordingLedger::default());
        let engine = engine(&model, &ledger, &config());

        assert_eq!(engine.analyze(&input()).await.unwrap_err(), AnalysisError::ContentFiltered);
        assert_eq!(engine.analyze(&input()).await.unwrap_err(), AnalysisError::TokenLimitExceeded);
        assert_eq!(ledger.rows().len(), 1);
    }

    #[tokio::test]
    async fn test_unparseable_output_is_schema_violation() {
        let model = Arc::new(ScriptedModel::new());
        model.push(Ok(LlmResponse::completed("gpt-4o", "Sorry, here is prose instead.", Some(usage()))));
        let ledger = Arc::new(RecordingLedger::default());

        let err = engine(&model, &ledger, &config()).analyze(&input()).await.unwrap_err();
        assert!(matches!(err, AnalysisError::SchemaViolation(_)));
        assert_eq!(ledger.rows().len(), 1);
    }

    #[tokio::test]
    async fn test_empty_content_never_reaches_the_api() {
        let model = Arc::new(ScriptedModel::new());
        let ledger = Arc::new(RecordingLedger::default());
        let blank = ArticleInput { text: "  \n ", ..input() };

        let err = engine(&model, &ledger, &config()).analyze(&blank).await.unwrap_err();
        assert!(matches!(err, AnalysisError::InvalidRequest(_)));
        assert_eq!(model.calls(), 0);
    }

    #[tokio::test]
    async fn test_oversized_content_is_truncated() {
        let model = Arc::new(ScriptedModel::new());
        model.push_json("gpt-4o", &report_json(), usage());
        let ledger = Arc::new(RecordingLedger::default());
        let config = AnalysisConfig { max_input_tokens: 500, ..config() };
        let long_text = vec!["ransomware"; 3000].join(" ");
        let long = ArticleInput { text: &long_text, ..input() };

        let outcome = engine(&model, &ledger, &config).analyze(&long).await.unwrap();
        assert!(outcome.truncated);
        assert!(model.requests()[0].user_content.contains("[Note: This article was truncated"));
    }

    #[test]
    fn test_backoff_grows_with_jitter_and_is_capped() {
        let max = Duration::from_secs(60);
        let next = next_delay(Duration::from_secs(3), 1.5, max);
        assert!(next >= Duration::from_millis(4500) && next <= Duration::from_millis(4950));
        assert_eq!(next_delay(Duration::from_secs(50), 1.5, max), max);
    }
}
