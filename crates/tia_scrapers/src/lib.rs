pub mod extractor;
pub mod indicators;
pub mod manager;
pub mod strategies;
pub mod validator;

#[cfg(test)]
mod testing;

pub use extractor::{ArticleSource, ContentExtractor, ExtractedArticle};
pub use indicators::extract_indicators;
pub use manager::{AnalysisManager, AnalysisRecord, AnalyzeOptions};
pub use validator::{normalize_url, UrlValidator};

pub mod prelude {
    pub use super::extractor::{ArticleSource, ContentExtractor};
    pub use super::manager::{AnalysisManager, AnalyzeOptions};
    pub use super::validator::UrlValidator;
    pub use tia_core::{Error, Result};
}
