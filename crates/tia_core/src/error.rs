use thiserror::Error;

/// Rejections raised before any network fetch of the target happens.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ValidationError {
    #[error("Malformed URL: {0}")]
    Malformed(String),

    #[error("Invalid protocol '{0}': only http and https are allowed")]
    InvalidProtocol(String),

    #[error("URL has no host: {0}")]
    MissingHost(String),

    #[error("Top-level domain of '{0}' is not allowed")]
    DisallowedTld(String),

    #[error("Domain '{0}' is blocked")]
    BlockedDomain(String),

    #[error("URL is unreachable: {0}")]
    Unreachable(String),
}

impl ValidationError {
    pub fn reason_code(&self) -> &'static str {
        match self {
            Self::Malformed(_) => "malformed_url",
            Self::InvalidProtocol(_) => "invalid_protocol",
            Self::MissingHost(_) => "missing_host",
            Self::DisallowedTld(_) => "disallowed_tld",
            Self::BlockedDomain(_) => "blocked_domain",
            Self::Unreachable(_) => "unreachable",
        }
    }
}

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ExtractionError {
    #[error("Failed to fetch page: {0}")]
    FetchFailed(String),

    #[error("No article content found at {0}")]
    NoContentFound(String),

    #[error("Extracted content too short ({length} chars, need at least {minimum})")]
    ContentTooShort { length: usize, minimum: usize },
}

impl ExtractionError {
    pub fn reason_code(&self) -> &'static str {
        match self {
            Self::FetchFailed(_) => "fetch_failed",
            Self::NoContentFound(_) => "no_content_found",
            Self::ContentTooShort { .. } => "content_too_short",
        }
    }
}

/// Terminal outcomes of an analysis attempt. Transient API failures are
/// retried inside the engine and only surface here once retries run out.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum AnalysisError {
    #[error("Model refused to analyze the article: {0}")]
    Refusal(String),

    #[error("Response blocked by the content filter")]
    ContentFiltered,

    #[error("Response truncated at the output token limit")]
    TokenLimitExceeded,

    #[error("Response does not match the report schema: {0}")]
    SchemaViolation(String),

    #[error("API still failing after {attempts} attempts: {message}")]
    TransientApiError { attempts: u32, message: String },

    #[error("API authentication failed: {0}")]
    AuthError(String),

    #[error("Invalid analysis request: {0}")]
    InvalidRequest(String),
}

impl AnalysisError {
    pub fn reason_code(&self) -> &'static str {
        match self {
            Self::Refusal(_) => "refusal",
            Self::ContentFiltered => "content_filtered",
            Self::TokenLimitExceeded => "token_limit_exceeded",
            Self::SchemaViolation(_) => "schema_violation",
            Self::TransientApiError { .. } => "transient_api_error",
            Self::AuthError(_) => "auth_error",
            Self::InvalidRequest(_) => "invalid_request",
        }
    }

    /// Whether a caller may reasonably try the same request again later.
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::TransientApiError { .. })
    }
}

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum PersistenceError {
    #[error("Query failed: {0}")]
    Query(String),

    #[error("Migration to schema version {version} failed: {message}")]
    Migration { version: i64, message: String },

    #[error("Stored data could not be (de)serialized: {0}")]
    Serialization(String),

    #[error("Not found: {0}")]
    NotFound(String),
}

#[derive(Error, Debug)]
pub enum Error {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Validation error: {0}")]
    Validation(#[from] ValidationError),

    #[error("Extraction error: {0}")]
    Extraction(#[from] ExtractionError),

    #[error("Analysis error: {0}")]
    Analysis(#[from] AnalysisError),

    #[error("Persistence error: {0}")]
    Persistence(#[from] PersistenceError),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("External error: {0}")]
    External(#[from] anyhow::Error),
}

impl Error {
    /// Stable code reported at the request boundary.
    pub fn reason_code(&self) -> &'static str {
        match self {
            Self::Validation(e) => e.reason_code(),
            Self::Extraction(e) => e.reason_code(),
            Self::Analysis(e) => e.reason_code(),
            Self::Persistence(_) => "persistence_error",
            Self::Config(_) => "config_error",
            Self::Io(_) | Self::Serialization(_) | Self::Http(_) | Self::External(_) => "internal_error",
        }
    }
}

pub type Result<T> = std::result::Result<T, Error>;
