pub mod config;
pub mod error;
pub mod storage;
pub mod types;

pub use config::Config;
pub use error::{AnalysisError, Error, ExtractionError, PersistenceError, Result, ValidationError};
pub use storage::TokenLedger;
pub use types::*;
