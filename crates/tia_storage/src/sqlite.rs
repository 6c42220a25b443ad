use async_trait::async_trait;
use chrono::{DateTime, SecondsFormat, Utc};
use sqlx::sqlite::{SqliteConnectOptions, SqliteConnection, SqlitePool, SqlitePoolOptions, SqliteRow};
use sqlx::Row;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tia_core::{
    ArticleRecord, Error, IndicatorMap, IndicatorStats, IndicatorType, ModelUsage, OverallUsage,
    PersistenceError, Result, StoredAnalysis, TableCounts, ThreatReport, TokenLedger, TokenUsage,
    TokenUsageStats,
};
use tracing::{debug, info, warn};

use crate::migrations::{baseline, Migration, MIGRATIONS, SCHEMA_VERSION, SCHEMA_VERSION_TABLE};

/// Article metadata written on every successful analysis.
#[derive(Debug, Clone)]
pub struct NewArticle {
    pub url: String,
    pub title: String,
    pub content_length: usize,
    pub extraction_secs: f64,
    pub analysis_secs: f64,
    pub model: String,
}

/// Everything one analysis run persists, written as a unit.
#[derive(Debug, Clone)]
pub struct NewAnalysis {
    pub article: NewArticle,
    pub raw_text: String,
    pub report: ThreatReport,
    pub indicators: IndicatorMap,
}

pub struct SqliteStore {
    pool: Arc<SqlitePool>,
    db_path: PathBuf,
}

fn query_error(context: &str, e: sqlx::Error) -> Error {
    PersistenceError::Query(format!("Failed to {}: {}", context, e)).into()
}

fn now_timestamp() -> String {
    Utc::now().to_rfc3339_opts(SecondsFormat::Micros, true)
}

fn to_db_timestamp(ts: &DateTime<Utc>) -> String {
    ts.to_rfc3339_opts(SecondsFormat::Micros, true)
}

fn parse_timestamp(raw: &str) -> Result<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(raw)
        .map(|ts| ts.with_timezone(&Utc))
        .map_err(|e| PersistenceError::Serialization(format!("Failed to parse date '{}': {}", raw, e)).into())
}

fn article_from_row(row: &SqliteRow) -> Result<ArticleRecord> {
    let created_at: String = row.try_get("created_at").map_err(|e| query_error("read created_at", e))?;
    Ok(ArticleRecord {
        id: row.try_get("id").map_err(|e| query_error("read id", e))?,
        url: row.try_get("url").map_err(|e| query_error("read url", e))?,
        title: row.try_get("title").map_err(|e| query_error("read title", e))?,
        content_length: row.try_get("content_length").map_err(|e| query_error("read content_length", e))?,
        extraction_time: row.try_get("extraction_time").map_err(|e| query_error("read extraction_time", e))?,
        analysis_time: row.try_get("analysis_time").map_err(|e| query_error("read analysis_time", e))?,
        model: row.try_get("model").map_err(|e| query_error("read model", e))?,
        created_at: parse_timestamp(&created_at)?,
    })
}

fn indicators_from_rows(rows: &[SqliteRow]) -> Result<IndicatorMap> {
    let mut indicators = IndicatorMap::new();
    for row in rows {
        let kind: String = row.try_get("indicator_type").map_err(|e| query_error("read indicator_type", e))?;
        let value: String = row.try_get("value").map_err(|e| query_error("read indicator value", e))?;
        match kind.parse::<IndicatorType>() {
            Ok(kind) => {
                indicators.insert(kind, value);
            }
            Err(e) => warn!("Skipping stored indicator: {}", e),
        }
    }
    Ok(indicators)
}

async fn upsert_article_on(conn: &mut SqliteConnection, article: &NewArticle) -> Result<i64> {
    sqlx::query(
        r#"
        INSERT INTO articles
        (url, title, content_length, extraction_time, analysis_time, model, created_at)
        VALUES (?, ?, ?, ?, ?, ?, ?)
        ON CONFLICT (url) DO UPDATE SET
            title = excluded.title,
            content_length = excluded.content_length,
            extraction_time = excluded.extraction_time,
            analysis_time = excluded.analysis_time,
            model = excluded.model,
            created_at = excluded.created_at
        "#,
    )
    .bind(&article.url)
    .bind(&article.title)
    .bind(article.content_length as i64)
    .bind(article.extraction_secs)
    .bind(article.analysis_secs)
    .bind(&article.model)
    .bind(now_timestamp())
    .execute(&mut *conn)
    .await
    .map_err(|e| query_error("upsert article", e))?;

    let row = sqlx::query("SELECT id FROM articles WHERE url = ?")
        .bind(&article.url)
        .fetch_one(&mut *conn)
        .await
        .map_err(|e| query_error("look up article id", e))?;
    row.try_get("id").map_err(|e| query_error("read article id", e))
}

async fn store_analysis_on(conn: &mut SqliteConnection, article_id: i64, raw_text: &str, report: &ThreatReport) -> Result<()> {
    let structured = serde_json::to_string(report).map_err(|e| PersistenceError::Serialization(e.to_string()))?;

    sqlx::query("DELETE FROM analysis_results WHERE article_id = ?")
        .bind(article_id)
        .execute(&mut *conn)
        .await
        .map_err(|e| query_error("clear previous analysis", e))?;

    sqlx::query("INSERT INTO analysis_results (article_id, raw_text, structured_data) VALUES (?, ?, ?)")
        .bind(article_id)
        .bind(raw_text)
        .bind(structured)
        .execute(&mut *conn)
        .await
        .map_err(|e| query_error("store analysis", e))?;
    Ok(())
}

async fn insert_indicators_on(conn: &mut SqliteConnection, article_id: i64, indicators: &IndicatorMap) -> Result<u64> {
    let created_at = now_timestamp();
    let mut inserted = 0;
    for (kind, value) in indicators.pairs() {
        let result = sqlx::query(
            "INSERT OR IGNORE INTO indicators (article_id, indicator_type, value, created_at) VALUES (?, ?, ?, ?)",
        )
        .bind(article_id)
        .bind(kind.as_str())
        .bind(value)
        .bind(&created_at)
        .execute(&mut *conn)
        .await
        .map_err(|e| query_error("store indicator", e))?;
        inserted += result.rows_affected();
    }
    Ok(inserted)
}

async fn clear_indicators_on(conn: &mut SqliteConnection, article_id: i64) -> Result<()> {
    sqlx::query("DELETE FROM indicators WHERE article_id = ?")
        .bind(article_id)
        .execute(&mut *conn)
        .await
        .map_err(|e| query_error("clear indicators", e))?;
    Ok(())
}

impl SqliteStore {
    /// Opens (creating if needed) the database file and brings its schema up to date.
    pub async fn open(db_path: &Path) -> Result<Self> {
        if let Some(parent) = db_path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)?;
            }
        }

        let options = SqliteConnectOptions::new()
            .filename(db_path)
            .create_if_missing(true)
            .foreign_keys(true);
        let pool = SqlitePoolOptions::new()
            .max_connections(4)
            .connect_with(options)
            .await
            .map_err(|e| query_error("connect to database", e))?;

        let store = Self {
            pool: Arc::new(pool),
            db_path: db_path.to_path_buf(),
        };
        store.initialize().await?;
        store.migrate().await?;
        info!("💾 Database ready at {}", db_path.display());
        Ok(store)
    }

    pub fn get_db_path(&self) -> &Path {
        &self.db_path
    }

    /// Creates the version marker and baseline tables when absent. Safe to
    /// call on every start-up.
    pub async fn initialize(&self) -> Result<()> {
        let mut tx = self.pool.begin().await.map_err(|e| query_error("begin transaction", e))?;

        sqlx::query(SCHEMA_VERSION_TABLE)
            .execute(&mut *tx)
            .await
            .map_err(|e| query_error("create schema_version table", e))?;

        let baseline = baseline();
        for statement in baseline.statements {
            sqlx::query(statement)
                .execute(&mut *tx)
                .await
                .map_err(|e| query_error("create baseline tables", e))?;
        }

        sqlx::query("INSERT OR IGNORE INTO schema_version (id, version, updated_at) VALUES (1, ?, ?)")
            .bind(baseline.version)
            .bind(now_timestamp())
            .execute(&mut *tx)
            .await
            .map_err(|e| query_error("record baseline version", e))?;

        tx.commit().await.map_err(|e| query_error("commit initialization", e))?;
        debug!("Database initialized");
        Ok(())
    }

    pub async fn schema_version(&self) -> Result<i64> {
        let row = sqlx::query("SELECT version FROM schema_version WHERE id = 1")
            .fetch_optional(&*self.pool)
            .await
            .map_err(|e| query_error("read schema version", e))?;
        match row {
            Some(row) => row.try_get("version").map_err(|e| query_error("read schema version", e)),
            None => Ok(0),
        }
    }

    /// Applies every pending step up to [`SCHEMA_VERSION`] and returns the
    /// resulting version.
    pub async fn migrate(&self) -> Result<i64> {
        self.apply_migrations(MIGRATIONS, SCHEMA_VERSION).await
    }

    /// All pending steps run in a single transaction: either the database
    /// reaches `target` or it stays exactly where it was.
    pub(crate) async fn apply_migrations(&self, migrations: &[Migration], target: i64) -> Result<i64> {
        let current = self.schema_version().await?;
        if current > target {
            return Err(PersistenceError::Migration {
                version: current,
                message: format!("database schema version {} is newer than supported version {}", current, target),
            }
            .into());
        }
        if current == target {
            debug!("Schema already at version {}", current);
            return Ok(current);
        }

        let mut tx = self.pool.begin().await.map_err(|e| query_error("begin transaction", e))?;
        let mut applied = current;
        for migration in migrations.iter().filter(|m| m.version > current && m.version <= target) {
            info!("Applying migration {}: {}", migration.version, migration.description);
            for statement in migration.statements {
                sqlx::query(statement).execute(&mut *tx).await.map_err(|e| PersistenceError::Migration {
                    version: migration.version,
                    message: e.to_string(),
                })?;
            }
            applied = migration.version;
        }

        if applied != target {
            return Err(PersistenceError::Migration {
                version: target,
                message: format!("no migration step reaches version {} (stopped at {})", target, applied),
            }
            .into());
        }

        sqlx::query("UPDATE schema_version SET version = ?, updated_at = ? WHERE id = 1")
            .bind(applied)
            .bind(now_timestamp())
            .execute(&mut *tx)
            .await
            .map_err(|e| PersistenceError::Migration { version: applied, message: e.to_string() })?;

        tx.commit()
            .await
            .map_err(|e| PersistenceError::Migration { version: applied, message: e.to_string() })?;
        info!("Schema migrated from version {} to {}", current, applied);
        Ok(applied)
    }

    /// Inserts the article or, when the URL is already known, overwrites its
    /// metadata in place. Returns the article id.
    pub async fn upsert_article(&self, article: &NewArticle) -> Result<i64> {
        let mut tx = self.pool.begin().await.map_err(|e| query_error("begin transaction", e))?;
        let id = upsert_article_on(&mut tx, article).await?;
        tx.commit().await.map_err(|e| query_error("commit article", e))?;
        debug!("Upserted article {} ({})", id, article.url);
        Ok(id)
    }

    /// Replaces whatever analysis the article had; only the latest is kept.
    pub async fn store_analysis(&self, article_id: i64, raw_text: &str, report: &ThreatReport) -> Result<()> {
        let mut tx = self.pool.begin().await.map_err(|e| query_error("begin transaction", e))?;
        store_analysis_on(&mut tx, article_id, raw_text, report).await?;
        tx.commit().await.map_err(|e| query_error("commit analysis", e))?;
        Ok(())
    }

    pub async fn record_token_usage(&self, usage: &TokenUsage) -> Result<i64> {
        let result = sqlx::query(
            r#"
            INSERT INTO token_usage
            (model, input_tokens, output_tokens, cached, cached_input_tokens, timestamp)
            VALUES (?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(&usage.model)
        .bind(usage.input_tokens as i64)
        .bind(usage.output_tokens as i64)
        .bind(usage.cached_input_tokens > 0)
        .bind(usage.cached_input_tokens as i64)
        .bind(to_db_timestamp(&usage.timestamp))
        .execute(&*self.pool)
        .await
        .map_err(|e| query_error("record token usage", e))?;
        Ok(result.last_insert_rowid())
    }

    /// Adds indicator rows, skipping `(article, type, value)` triples already
    /// present. Returns how many rows were new.
    pub async fn store_indicators(&self, article_id: i64, indicators: &IndicatorMap) -> Result<u64> {
        let mut tx = self.pool.begin().await.map_err(|e| query_error("begin transaction", e))?;
        let inserted = insert_indicators_on(&mut tx, article_id, indicators).await?;
        tx.commit().await.map_err(|e| query_error("commit indicators", e))?;
        debug!("Stored {} new indicators for article {}", inserted, article_id);
        Ok(inserted)
    }

    /// Writes the article, its analysis and its indicators in one
    /// transaction; nothing is kept if any step fails.
    pub async fn save_analysis(&self, analysis: &NewAnalysis) -> Result<i64> {
        let mut tx = self.pool.begin().await.map_err(|e| query_error("begin transaction", e))?;
        let article_id = upsert_article_on(&mut tx, &analysis.article).await?;
        store_analysis_on(&mut tx, article_id, &analysis.raw_text, &analysis.report).await?;
        clear_indicators_on(&mut tx, article_id).await?;
        let inserted = insert_indicators_on(&mut tx, article_id, &analysis.indicators).await?;
        tx.commit().await.map_err(|e| query_error("commit analysis", e))?;
        info!(
            "Stored analysis for {} (article {}, {} indicators)",
            analysis.article.url, article_id, inserted
        );
        Ok(article_id)
    }

    pub async fn get_article_by_url(&self, url: &str) -> Result<Option<ArticleRecord>> {
        let row = sqlx::query(
            r#"
            SELECT id, url, title, content_length, extraction_time, analysis_time, model, created_at
            FROM articles
            WHERE url = ?
            "#,
        )
        .bind(url)
        .fetch_optional(&*self.pool)
        .await
        .map_err(|e| query_error("look up article", e))?;
        row.as_ref().map(article_from_row).transpose()
    }

    pub async fn get_analysis_by_url(&self, url: &str) -> Result<Option<StoredAnalysis>> {
        let row = sqlx::query(
            r#"
            SELECT a.id, a.url, a.title, a.content_length, a.extraction_time, a.analysis_time,
                   a.model, a.created_at, r.raw_text, r.structured_data
            FROM articles a
            JOIN analysis_results r ON a.id = r.article_id
            WHERE a.url = ?
            "#,
        )
        .bind(url)
        .fetch_optional(&*self.pool)
        .await
        .map_err(|e| query_error("look up analysis", e))?;

        let Some(row) = row else {
            debug!("No analysis found for URL: {}", url);
            return Ok(None);
        };

        let structured: String = row.try_get("structured_data").map_err(|e| query_error("read structured_data", e))?;
        let report: ThreatReport = serde_json::from_str(&structured)
            .map_err(|e| PersistenceError::Serialization(format!("Stored report for {} is unreadable: {}", url, e)))?;

        Ok(Some(StoredAnalysis {
            article: article_from_row(&row)?,
            raw_text: row.try_get("raw_text").map_err(|e| query_error("read raw_text", e))?,
            report,
        }))
    }

    /// Newest first. `None` returns every row rather than none.
    pub async fn get_recent_analyses(&self, limit: Option<u32>) -> Result<Vec<ArticleRecord>> {
        // SQLite treats a negative LIMIT as "no limit".
        let limit = limit.map(i64::from).unwrap_or(-1);
        let rows = sqlx::query(
            r#"
            SELECT id, url, title, content_length, extraction_time, analysis_time, model, created_at
            FROM articles
            ORDER BY created_at DESC, id DESC
            LIMIT ?
            "#,
        )
        .bind(limit)
        .fetch_all(&*self.pool)
        .await
        .map_err(|e| query_error("list recent analyses", e))?;

        rows.iter().map(article_from_row).collect()
    }

    pub async fn get_token_usage_stats(&self) -> Result<TokenUsageStats> {
        let rows = sqlx::query(
            r#"
            SELECT model,
                   SUM(input_tokens) AS total_input,
                   SUM(output_tokens) AS total_output,
                   SUM(cached_input_tokens) AS cached_input
            FROM token_usage
            GROUP BY model
            "#,
        )
        .fetch_all(&*self.pool)
        .await
        .map_err(|e| query_error("aggregate token usage", e))?;

        let mut stats = TokenUsageStats::default();
        for row in rows {
            let model: String = row.try_get("model").map_err(|e| query_error("read model", e))?;
            let total_input = sum_column(&row, "total_input")?;
            let cached_input = sum_column(&row, "cached_input")?;
            stats.models.insert(
                model,
                ModelUsage {
                    total_input,
                    total_output: sum_column(&row, "total_output")?,
                    cached_input,
                    regular_input: total_input.saturating_sub(cached_input),
                },
            );
        }

        let row = sqlx::query(
            r#"
            SELECT SUM(input_tokens) AS total_input,
                   SUM(output_tokens) AS total_output,
                   SUM(cached_input_tokens) AS cached_input,
                   COUNT(DISTINCT model) AS model_count
            FROM token_usage
            "#,
        )
        .fetch_one(&*self.pool)
        .await
        .map_err(|e| query_error("aggregate token usage", e))?;

        let total_input = sum_column(&row, "total_input")?;
        let total_output = sum_column(&row, "total_output")?;
        let cached_input = sum_column(&row, "cached_input")?;
        stats.overall = OverallUsage {
            total_input,
            total_output,
            cached_input,
            regular_input: total_input.saturating_sub(cached_input),
            total_tokens: total_input + total_output,
            model_count: sum_column(&row, "model_count")?,
        };

        debug!(
            "Token usage: {} tokens across {} models",
            stats.overall.total_tokens, stats.overall.model_count
        );
        Ok(stats)
    }

    pub async fn get_indicators_by_article_id(&self, article_id: i64) -> Result<IndicatorMap> {
        let rows = sqlx::query(
            r#"
            SELECT indicator_type, value
            FROM indicators
            WHERE article_id = ?
            ORDER BY indicator_type, value
            "#,
        )
        .bind(article_id)
        .fetch_all(&*self.pool)
        .await
        .map_err(|e| query_error("list indicators", e))?;
        indicators_from_rows(&rows)
    }

    pub async fn get_indicators_by_url(&self, url: &str) -> Result<IndicatorMap> {
        let rows = sqlx::query(
            r#"
            SELECT i.indicator_type, i.value
            FROM indicators i
            JOIN articles a ON i.article_id = a.id
            WHERE a.url = ?
            ORDER BY i.indicator_type, i.value
            "#,
        )
        .bind(url)
        .fetch_all(&*self.pool)
        .await
        .map_err(|e| query_error("list indicators", e))?;
        indicators_from_rows(&rows)
    }

    pub async fn get_indicator_stats(&self) -> Result<IndicatorStats> {
        let rows = sqlx::query(
            r#"
            SELECT indicator_type, COUNT(*) AS count
            FROM indicators
            GROUP BY indicator_type
            "#,
        )
        .fetch_all(&*self.pool)
        .await
        .map_err(|e| query_error("count indicators", e))?;

        let mut stats = IndicatorStats::default();
        for row in rows {
            let kind: String = row.try_get("indicator_type").map_err(|e| query_error("read indicator_type", e))?;
            let count: i64 = row.try_get("count").map_err(|e| query_error("read count", e))?;
            stats.total_indicators += count;
            stats.type_counts.insert(kind, count);
        }

        let row = sqlx::query("SELECT COUNT(DISTINCT article_id) AS article_count FROM indicators")
            .fetch_one(&*self.pool)
            .await
            .map_err(|e| query_error("count indicator articles", e))?;
        stats.articles_with_indicators = row.try_get("article_count").map_err(|e| query_error("read article_count", e))?;
        Ok(stats)
    }

    pub async fn table_counts(&self) -> Result<TableCounts> {
        Ok(TableCounts {
            articles: self.count_rows("SELECT COUNT(*) AS n FROM articles").await?,
            analysis_results: self.count_rows("SELECT COUNT(*) AS n FROM analysis_results").await?,
            token_usage: self.count_rows("SELECT COUNT(*) AS n FROM token_usage").await?,
            indicators: self.count_rows("SELECT COUNT(*) AS n FROM indicators").await?,
        })
    }

    async fn count_rows(&self, sql: &'static str) -> Result<i64> {
        let row = sqlx::query(sql)
            .fetch_one(&*self.pool)
            .await
            .map_err(|e| query_error("count rows", e))?;
        row.try_get("n").map_err(|e| query_error("read row count", e))
    }

    /// Deletes every row from every data table. Irreversible; callers are
    /// expected to have asked for confirmation. Returns what was removed.
    pub async fn purge(&self) -> Result<TableCounts> {
        let before = self.table_counts().await?;
        let mut tx = self.pool.begin().await.map_err(|e| query_error("begin transaction", e))?;
        for statement in [
            "DELETE FROM indicators",
            "DELETE FROM analysis_results",
            "DELETE FROM articles",
            "DELETE FROM token_usage",
            "DELETE FROM sqlite_sequence WHERE name IN ('indicators', 'analysis_results', 'articles', 'token_usage')",
        ] {
            sqlx::query(statement)
                .execute(&mut *tx)
                .await
                .map_err(|e| query_error("purge database", e))?;
        }
        tx.commit().await.map_err(|e| query_error("commit purge", e))?;
        warn!(
            "Database purged: {} articles, {} analyses, {} token usage rows, {} indicators",
            before.articles, before.analysis_results, before.token_usage, before.indicators
        );
        Ok(before)
    }
}

fn sum_column(row: &SqliteRow, column: &str) -> Result<u64> {
    let value: Option<i64> = row
        .try_get(column)
        .map_err(|e| query_error(&format!("read {}", column), e))?;
    Ok(value.unwrap_or(0).max(0) as u64)
}

#[async_trait]
impl TokenLedger for SqliteStore {
    async fn record_token_usage(&self, usage: &TokenUsage) -> Result<()> {
        SqliteStore::record_token_usage(self, usage).await.map(|_| ())
    }
}
