use async_trait::async_trait;
use reqwest::header::{HeaderMap, HeaderName, HeaderValue, ACCEPT, ACCEPT_LANGUAGE, USER_AGENT};
use reqwest::Client;
use scraper::Html;
use std::time::{Duration, Instant};
use tia_core::config::ExtractionConfig;
use tia_core::{ExtractionError, Result};
use tracing::{debug, info, warn};
use url::Url;

use crate::strategies::{self, ExtractionStrategy};

const ACCEPT_HTML: &str = "text/html,application/xhtml+xml,application/xml";
const ACCEPT_LANGUAGE_EN: &str = "en-US,en;q=0.9";

#[derive(Debug, Clone, PartialEq)]
pub struct ExtractedArticle {
    pub url: String,
    pub title: Option<String>,
    /// Cleaned article body chosen by the first successful strategy.
    pub text: String,
    /// All visible page text, used for indicator extraction.
    pub raw_text: String,
    pub strategy: &'static str,
    pub duration: Duration,
}

/// Anything that can turn a validated URL into article text.
#[async_trait]
pub trait ArticleSource: Send + Sync {
    async fn extract(&self, url: &Url) -> std::result::Result<ExtractedArticle, ExtractionError>;
}

/// Parsed page content before timing is attached.
#[derive(Debug, Clone, PartialEq)]
pub struct PageContent {
    pub title: Option<String>,
    pub text: String,
    pub raw_text: String,
    pub strategy: &'static str,
}

pub struct ContentExtractor {
    client: Client,
    config: ExtractionConfig,
    strategies: Vec<Box<dyn ExtractionStrategy>>,
}

impl ContentExtractor {
    pub fn new(config: &ExtractionConfig) -> Result<Self> {
        let client = Client::builder().timeout(config.timeout()).build()?;
        Ok(Self {
            client,
            config: config.clone(),
            strategies: strategies::default_chain(),
        })
    }

    pub fn with_strategies(mut self, strategies: Vec<Box<dyn ExtractionStrategy>>) -> Self {
        self.strategies = strategies;
        self
    }

    /// Default browser-like headers, with per-host overrides replacing them.
    fn headers_for(&self, host: &str) -> HeaderMap {
        let mut headers = HeaderMap::new();
        headers.insert(ACCEPT, HeaderValue::from_static(ACCEPT_HTML));
        headers.insert(ACCEPT_LANGUAGE, HeaderValue::from_static(ACCEPT_LANGUAGE_EN));
        if let Ok(agent) = HeaderValue::from_str(&self.config.user_agent) {
            headers.insert(USER_AGENT, agent);
        }

        if let Some(overrides) = self.config.domain_headers.get(host) {
            debug!("Using {} custom headers for {}", overrides.len(), host);
            for (name, value) in overrides {
                match (HeaderName::from_bytes(name.as_bytes()), HeaderValue::from_str(value)) {
                    (Ok(name), Ok(value)) => {
                        headers.insert(name, value);
                    }
                    _ => warn!("Ignoring invalid header {} configured for {}", name, host),
                }
            }
        }
        headers
    }

    async fn fetch(&self, url: &Url) -> std::result::Result<String, ExtractionError> {
        let request = self
            .client
            .get(url.as_str())
            .headers(self.headers_for(url.host_str().unwrap_or_default()));

        let response = request.send().await.map_err(|e| {
            if e.is_timeout() {
                ExtractionError::FetchFailed(format!(
                    "{} timed out after {}s",
                    url, self.config.timeout_secs
                ))
            } else {
                ExtractionError::FetchFailed(format!("{}: {}", url, e))
            }
        })?;

        let status = response.status();
        if !status.is_success() {
            return Err(ExtractionError::FetchFailed(format!(
                "{} answered HTTP {}",
                url,
                status.as_u16()
            )));
        }

        response
            .text()
            .await
            .map_err(|e| ExtractionError::FetchFailed(format!("{}: {}", url, e)))
    }

    /// Runs the strategy chain over an already fetched page. The first
    /// candidate whose cleaned text reaches the minimum length wins.
    pub fn extract_from_html(&self, url: &str, html: &str) -> std::result::Result<PageContent, ExtractionError> {
        let document = Html::parse_document(html);
        let minimum = self.config.min_content_length;
        let mut longest: Option<usize> = None;

        for strategy in &self.strategies {
            let Some(candidate) = strategy.extract(&document) else {
                debug!("Strategy {} found nothing on {}", strategy.name(), url);
                continue;
            };
            let text = strategies::clean_text(&candidate);
            let length = text.chars().count();
            if length >= minimum {
                return Ok(PageContent {
                    title: strategies::page_title(&document),
                    text,
                    raw_text: strategies::page_text(&document),
                    strategy: strategy.name(),
                });
            }
            debug!("Strategy {} produced only {} chars on {}", strategy.name(), length, url);
            longest = Some(longest.map_or(length, |l| l.max(length)));
        }

        match longest {
            Some(length) => Err(ExtractionError::ContentTooShort { length, minimum }),
            None => Err(ExtractionError::NoContentFound(url.to_string())),
        }
    }
}

#[async_trait]
impl ArticleSource for ContentExtractor {
    async fn extract(&self, url: &Url) -> std::result::Result<ExtractedArticle, ExtractionError> {
        let started = Instant::now();
        info!("🌐 Fetching {}", url);
        let html = self.fetch(url).await?;

        let page = self.extract_from_html(url.as_str(), &html).map_err(|e| {
            warn!("Extraction failed for {}: {}", url, e);
            e
        })?;
        let duration = started.elapsed();
        info!(
            "📄 Extracted {} chars from {} via {} in {:.2}s",
            page.text.chars().count(),
            url,
            page.strategy,
            duration.as_secs_f64()
        );

        Ok(ExtractedArticle {
            url: url.to_string(),
            title: page.title,
            text: page.text,
            raw_text: page.raw_text,
            strategy: page.strategy,
            duration,
        })
    }
}
