use async_trait::async_trait;
use crate::types::TokenUsage;
use crate::Result;

/// Append-only sink for per-call token accounting.
#[async_trait]
pub trait TokenLedger: Send + Sync {
    async fn record_token_usage(&self, usage: &TokenUsage) -> Result<()>;
}
