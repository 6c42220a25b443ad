pub mod engine;
pub mod models;
pub mod prompt;
pub mod schema;

pub use engine::{AnalysisEngine, AnalysisOutcome, ArticleInput};
pub use models::{create_model, LlmCallError, LlmClient, LlmRequest, LlmResponse, ResponseStatus, Usage};

pub mod prelude {
    pub use super::engine::{AnalysisEngine, AnalysisOutcome, ArticleInput};
    pub use super::models::{create_model, LlmClient};
    pub use tia_core::{AnalysisError, Error, Result, ThreatReport};
}
