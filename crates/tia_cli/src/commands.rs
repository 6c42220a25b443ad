use serde_json::{json, Value};
use std::path::Path;
use std::sync::Arc;
use tia_core::{Config, Error, PersistenceError, Result};
use tia_inference::{create_model, AnalysisEngine};
use tia_scrapers::{
    extract_indicators, normalize_url, AnalysisManager, AnalyzeOptions, ContentExtractor, UrlValidator,
};
use tia_storage::SqliteStore;
use tokio::io::AsyncReadExt;
use tracing::info;

pub const PURGE_CONFIRMATION: &str = "DELETE";

async fn open_store(config: &Config) -> Result<Arc<SqliteStore>> {
    let store = SqliteStore::open(&config.database_path).await?;
    info!("💾 Using database {}", store.get_db_path().display());
    Ok(Arc::new(store))
}

pub async fn analyze(config: &Config, url: &str, refresh: bool) -> Result<Value> {
    let store = open_store(config).await?;
    let client = create_model(&config.analysis)?;
    info!("🧠 Inference model initialized (using {} / {})", client.name(), config.analysis.model);

    let engine = AnalysisEngine::new(client, store.clone(), &config.analysis);
    let validator = UrlValidator::new(&config.validation, &config.extraction)?;
    let extractor = Arc::new(ContentExtractor::new(&config.extraction)?);
    let manager = AnalysisManager::new(validator, extractor, engine, store);

    let record = manager.analyze_url(url, AnalyzeOptions { refresh }).await?;
    let display = record.indicators.display_groups();
    let mut value = serde_json::to_value(&record)?;
    value["indicator_display"] = serde_json::to_value(display)?;
    Ok(value)
}

pub async fn recent(config: &Config, limit: Option<u32>) -> Result<Value> {
    let store = open_store(config).await?;
    let articles = store.get_recent_analyses(limit).await?;
    Ok(serde_json::to_value(articles)?)
}

pub async fn show(config: &Config, url: &str) -> Result<Value> {
    let store = open_store(config).await?;
    let key = normalize_url(url);
    let analysis = store
        .get_analysis_by_url(&key)
        .await?
        .ok_or_else(|| PersistenceError::NotFound(format!("no analysis stored for {}", url)))?;
    let indicators = store.get_indicators_by_article_id(analysis.article.id).await?;

    let mut value = serde_json::to_value(&analysis)?;
    value["indicators"] = serde_json::to_value(&indicators)?;
    Ok(value)
}

pub async fn indicators(config: &Config, url: &str) -> Result<Value> {
    let store = open_store(config).await?;
    let indicators = store.get_indicators_by_url(&normalize_url(url)).await?;
    Ok(serde_json::to_value(indicators.display_groups())?)
}

/// Indicator extraction over a local file, or stdin when no file is given.
/// Needs neither the database nor the model.
pub async fn scan(file: Option<&Path>, source_url: Option<&str>) -> Result<Value> {
    let text = match file {
        Some(path) => tokio::fs::read_to_string(path).await?,
        None => {
            let mut text = String::new();
            tokio::io::stdin().read_to_string(&mut text).await?;
            text
        }
    };
    let indicators = extract_indicators(&text, source_url);
    info!("🔎 Found {} indicators", indicators.total());
    Ok(serde_json::to_value(indicators.display_groups())?)
}

pub async fn stats(config: &Config) -> Result<Value> {
    let store = open_store(config).await?;
    let usage = store.get_token_usage_stats().await?;
    let cost = usage.estimated_cost(&config.model_prices);
    let indicators = store.get_indicator_stats().await?;
    let counts = store.table_counts().await?;

    Ok(json!({
        "token_usage": usage,
        "estimated_cost_usd": cost,
        "indicators": indicators,
        "tables": counts,
    }))
}

pub async fn migrate(config: &Config) -> Result<Value> {
    let store = open_store(config).await?;
    let version = store.migrate().await?;
    Ok(json!({ "schema_version": version }))
}

pub async fn purge(config: &Config, confirm: Option<&str>) -> Result<Value> {
    if confirm != Some(PURGE_CONFIRMATION) {
        return Err(Error::Config(format!(
            "purge deletes every stored analysis; pass --confirm {} to proceed",
            PURGE_CONFIRMATION
        )));
    }
    let store = open_store(config).await?;
    let removed = store.purge().await?;
    info!("🗑️ Purged {} articles", removed.articles);
    Ok(json!({ "removed": removed }))
}
