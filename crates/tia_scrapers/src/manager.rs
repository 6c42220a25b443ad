use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Instant;
use tia_core::{IndicatorMap, Result, ThreatReport, TokenUsage};
use tia_inference::{AnalysisEngine, ArticleInput};
use tia_storage::{NewAnalysis, NewArticle, SqliteStore};
use tokio::sync::Mutex as TokioMutex;
use tracing::{debug, info, warn};
use url::Url;

use crate::extractor::ArticleSource;
use crate::indicators::extract_indicators;
use crate::validator::UrlValidator;

const MAX_TITLE_CHARS: usize = 100;
const MIN_TITLE_SENTENCE_CHARS: usize = 10;

#[derive(Debug, Clone, Copy, Default)]
pub struct AnalyzeOptions {
    /// Ignore any stored result and analyze again.
    pub refresh: bool,
}

/// What one `analyze_url` call produced, whether fresh or from the store.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AnalysisRecord {
    pub article_id: i64,
    pub url: String,
    pub title: String,
    pub model: String,
    pub report: ThreatReport,
    pub raw_text: String,
    pub indicators: IndicatorMap,
    pub extraction_secs: f64,
    pub analysis_secs: f64,
    pub cached: bool,
}

/// Runs the validate → extract → analyze → store pipeline for single URLs.
pub struct AnalysisManager {
    validator: UrlValidator,
    source: Arc<dyn ArticleSource>,
    engine: AnalysisEngine,
    store: Arc<SqliteStore>,
    url_locks: TokioMutex<HashMap<String, Arc<TokioMutex<()>>>>,
}

/// Title for an article: the extracted one, else the first sentence of the
/// summary when it says anything, else the URL itself.
pub fn resolve_title(extracted: Option<&str>, summary: &str, url: &str) -> String {
    if let Some(title) = extracted.map(str::trim).filter(|t| !t.is_empty()) {
        return title.to_string();
    }

    let first_sentence = summary.split('.').next().unwrap_or_default().trim();
    if first_sentence.chars().count() > MIN_TITLE_SENTENCE_CHARS {
        let mut title: String = first_sentence.chars().take(MAX_TITLE_CHARS).collect();
        if first_sentence.chars().count() > MAX_TITLE_CHARS {
            title.push_str("...");
        }
        return title;
    }

    url.to_string()
}

impl AnalysisManager {
    pub fn new(
        validator: UrlValidator,
        source: Arc<dyn ArticleSource>,
        engine: AnalysisEngine,
        store: Arc<SqliteStore>,
    ) -> Self {
        Self {
            validator,
            source,
            engine,
            store,
            url_locks: TokioMutex::new(HashMap::new()),
        }
    }

    pub fn store(&self) -> &Arc<SqliteStore> {
        &self.store
    }

    async fn url_lock(&self, url: &str) -> Arc<TokioMutex<()>> {
        let mut locks = self.url_locks.lock().await;
        locks.entry(url.to_string()).or_default().clone()
    }

    /// Drops the map entry for `url` once no other caller holds or waits on it.
    async fn release_url_lock(&self, url: &str, lock: Arc<TokioMutex<()>>) {
        let mut locks = self.url_locks.lock().await;
        drop(lock);
        // Handles are cloned and dropped only under the map lock.
        if locks.get(url).map_or(false, |l| Arc::strong_count(l) == 1) {
            locks.remove(url);
        }
    }

    /// Stored result for `url`, recording the estimated tokens a cache hit saved.
    async fn cached(&self, url: &str) -> Result<Option<AnalysisRecord>> {
        let Some(stored) = self.store.get_analysis_by_url(url).await? else {
            return Ok(None);
        };
        info!("♻️ Using stored analysis for {} ({})", url, stored.article.model);

        let estimated = (stored.raw_text.chars().count() / 4) as u64;
        let usage = TokenUsage::new(stored.article.model.clone(), estimated, 0, estimated);
        if let Err(e) = self.store.record_token_usage(&usage).await {
            warn!("Failed to record cached token usage for {}: {}", url, e);
        }

        let indicators = self.store.get_indicators_by_article_id(stored.article.id).await?;
        Ok(Some(AnalysisRecord {
            article_id: stored.article.id,
            url: stored.article.url,
            title: stored.article.title,
            model: stored.article.model,
            report: stored.report,
            raw_text: stored.raw_text,
            indicators,
            extraction_secs: stored.article.extraction_time,
            analysis_secs: stored.article.analysis_time,
            cached: true,
        }))
    }

    pub async fn analyze_url(&self, raw_url: &str, options: AnalyzeOptions) -> Result<AnalysisRecord> {
        let url = self.validator.validate(raw_url).await?;
        let key = url.to_string();

        let lock = self.url_lock(&key).await;
        let result = {
            let _guard = lock.lock().await;
            self.analyze_locked(&url, key.clone(), options).await
        };
        self.release_url_lock(&key, lock).await;
        result
    }

    async fn analyze_locked(&self, url: &Url, key: String, options: AnalyzeOptions) -> Result<AnalysisRecord> {
        if !options.refresh {
            if let Some(record) = self.cached(&key).await? {
                return Ok(record);
            }
        }

        info!("🔍 Analyzing {}", key);
        let article = self.source.extract(url).await?;
        let extraction_secs = article.duration.as_secs_f64();
        let indicators = extract_indicators(&article.raw_text, Some(key.as_str()));
        debug!("Found {} indicators on {}", indicators.total(), key);

        let started = Instant::now();
        let outcome = self
            .engine
            .analyze(&ArticleInput {
                url: &key,
                title: article.title.as_deref(),
                text: &article.text,
            })
            .await?;
        let analysis_secs = started.elapsed().as_secs_f64();

        let title = resolve_title(article.title.as_deref(), &outcome.report.summary, &key);
        let analysis = NewAnalysis {
            article: NewArticle {
                url: key.clone(),
                title: title.clone(),
                content_length: article.text.chars().count(),
                extraction_secs,
                analysis_secs,
                model: outcome.model.clone(),
            },
            raw_text: outcome.raw_text,
            report: outcome.report,
            indicators,
        };
        let article_id = self.store.save_analysis(&analysis).await?;
        info!(
            "✅ Analysis of {} stored as article {} ({:.2}s extraction, {:.2}s analysis)",
            key, article_id, extraction_secs, analysis_secs
        );

        Ok(AnalysisRecord {
            article_id,
            url: key,
            title,
            model: analysis.article.model,
            report: analysis.report,
            raw_text: analysis.raw_text,
            indicators: analysis.indicators,
            extraction_secs,
            analysis_secs,
            cached: false,
        })
    }
}
