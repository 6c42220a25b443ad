use async_trait::async_trait;
use std::collections::VecDeque;
use std::fmt;
use std::sync::{Mutex, MutexGuard};

use super::{LlmCallError, LlmClient, LlmRequest, LlmResponse, Usage};

type Scripted = std::result::Result<LlmResponse, LlmCallError>;

/// Offline client that replays queued outcomes in order and remembers every
/// request it was given. Used to drive the engine and the pipeline without
/// network access.
#[derive(Default)]
pub struct ScriptedModel {
    queue: Mutex<VecDeque<Scripted>>,
    requests: Mutex<Vec<LlmRequest>>,
}

impl fmt::Debug for ScriptedModel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ScriptedModel")
            .field("pending", &lock(&self.queue).len())
            .finish()
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

impl ScriptedModel {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&self, outcome: Scripted) -> &Self {
        lock(&self.queue).push_back(outcome);
        self
    }

    /// Queues a completed response whose text is `json` serialized.
    pub fn push_json(&self, model: &str, json: &serde_json::Value, usage: Usage) -> &Self {
        self.push(Ok(LlmResponse::completed(model, json.to_string(), Some(usage))))
    }

    pub fn push_error(&self, error: LlmCallError) -> &Self {
        self.push(Err(error))
    }

    pub fn calls(&self) -> usize {
        lock(&self.requests).len()
    }

    pub fn requests(&self) -> Vec<LlmRequest> {
        lock(&self.requests).clone()
    }

    pub fn pending(&self) -> usize {
        lock(&self.queue).len()
    }
}

#[async_trait]
impl LlmClient for ScriptedModel {
    fn name(&self) -> &str {
        "Scripted"
    }

    async fn respond(&self, request: &LlmRequest) -> std::result::Result<LlmResponse, LlmCallError> {
        lock(&self.requests).push(request.clone());
        lock(&self.queue)
            .pop_front()
            .unwrap_or_else(|| Err(LlmCallError::InvalidRequest("scripted model has no responses left".to_string())))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::ResponseStatus;
    use serde_json::json;

    fn request() -> LlmRequest {
        LlmRequest {
            model: "gpt-4o".to_string(),
            system_prompt: "system".to_string(),
            user_content: "user".to_string(),
            temperature: 0.1,
            seed: None,
            max_output_tokens: 100,
            schema_name: "test".to_string(),
            schema: json!({}),
        }
    }

    #[tokio::test]
    async fn test_scripted_model_replays_in_order() {
        let model = ScriptedModel::new();
        model
            .push_error(LlmCallError::RateLimited("429".to_string()))
            .push_json("gpt-4o", &json!({"summary": "ok"}), Usage::default());

        assert!(model.respond(&request()).await.is_err());
        let response = model.respond(&request()).await.unwrap();
        assert_eq!(response.status, ResponseStatus::Completed);
        assert_eq!(response.output_text, r#"{"summary":"ok"}"#);

        assert!(matches!(
            model.respond(&request()).await,
            Err(LlmCallError::InvalidRequest(_))
        ));
        assert_eq!(model.calls(), 3);
        assert_eq!(model.pending(), 0);
    }
}
