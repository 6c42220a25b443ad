/// One schema step. Steps only ever add tables, columns or indexes so that
/// existing rows survive an upgrade.
#[derive(Debug, Clone, Copy)]
pub struct Migration {
    pub version: i64,
    pub description: &'static str,
    pub statements: &'static [&'static str],
}

pub const SCHEMA_VERSION_TABLE: &str = r#"
    CREATE TABLE IF NOT EXISTS schema_version (
        id INTEGER PRIMARY KEY CHECK (id = 1),
        version INTEGER NOT NULL,
        updated_at TEXT NOT NULL
    )
"#;

pub const MIGRATIONS: &[Migration] = &[
    Migration {
        version: 1,
        description: "baseline articles, analysis results and token usage",
        statements: &[
            r#"
            CREATE TABLE IF NOT EXISTS articles (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                url TEXT NOT NULL UNIQUE,
                title TEXT NOT NULL DEFAULT '',
                content_length INTEGER NOT NULL DEFAULT 0,
                extraction_time REAL NOT NULL DEFAULT 0,
                analysis_time REAL NOT NULL DEFAULT 0,
                model TEXT NOT NULL DEFAULT '',
                created_at TIMESTAMP NOT NULL
            )
            "#,
            r#"
            CREATE TABLE IF NOT EXISTS analysis_results (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                article_id INTEGER NOT NULL,
                raw_text TEXT NOT NULL,
                structured_data TEXT NOT NULL,
                FOREIGN KEY (article_id) REFERENCES articles (id)
            )
            "#,
            r#"
            CREATE TABLE IF NOT EXISTS token_usage (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                model TEXT NOT NULL,
                input_tokens INTEGER NOT NULL DEFAULT 0,
                output_tokens INTEGER NOT NULL DEFAULT 0,
                cached BOOLEAN NOT NULL DEFAULT 0,
                timestamp TIMESTAMP NOT NULL
            )
            "#,
        ],
    },
    Migration {
        version: 2,
        description: "indicators of compromise per article",
        statements: &[r#"
            CREATE TABLE IF NOT EXISTS indicators (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                article_id INTEGER NOT NULL,
                indicator_type TEXT NOT NULL,
                value TEXT NOT NULL,
                created_at TIMESTAMP NOT NULL,
                FOREIGN KEY (article_id) REFERENCES articles (id),
                UNIQUE (article_id, indicator_type, value)
            )
            "#],
    },
    Migration {
        version: 3,
        description: "cached input token counts",
        statements: &["ALTER TABLE token_usage ADD COLUMN cached_input_tokens INTEGER NOT NULL DEFAULT 0"],
    },
    Migration {
        version: 4,
        description: "lookup indexes",
        statements: &[
            "CREATE INDEX IF NOT EXISTS idx_articles_created_at ON articles (created_at)",
            "CREATE INDEX IF NOT EXISTS idx_analysis_results_article_id ON analysis_results (article_id)",
            "CREATE INDEX IF NOT EXISTS idx_indicators_article_id ON indicators (article_id)",
            "CREATE INDEX IF NOT EXISTS idx_token_usage_model ON token_usage (model)",
        ],
    },
    // Add future migrations here
];

/// Version the running binary expects.
pub const SCHEMA_VERSION: i64 = 4;

pub fn baseline() -> &'static Migration {
    &MIGRATIONS[0]
}
