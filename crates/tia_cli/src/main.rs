use anyhow::Context;
use clap::{Parser, Subcommand};
use serde_json::{json, Value};
use std::path::PathBuf;
use std::process::ExitCode;
use tia_core::{Config, Result};
use tracing::{error, info};

mod commands;
mod logging;

#[derive(Parser, Debug)]
#[command(author, version, about = "Threat-intelligence article analyzer", long_about = None)]
pub struct Cli {
    /// JSON configuration file; absent keys keep their defaults
    #[arg(long, global = true)]
    config: Option<PathBuf>,
    /// SQLite database path
    #[arg(long, global = true)]
    db: Option<PathBuf>,
    /// Model used for analysis (e.g. gpt-4o, gpt-4o-mini)
    #[arg(long, global = true)]
    model: Option<String>,
    #[arg(long, env = "OPENAI_API_KEY", hide_env_values = true, global = true)]
    api_key: Option<String>,
    #[arg(short, long, global = true)]
    verbose: bool,
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Analyze an article and store the report
    Analyze {
        url: String,
        /// Re-analyze even when a stored report exists
        #[arg(long)]
        refresh: bool,
    },
    /// List stored analyses, newest first
    Recent {
        #[arg(long)]
        limit: Option<u32>,
    },
    /// Print the stored report for a URL
    Show { url: String },
    /// Print the stored indicators for a URL, grouped by category
    Indicators { url: String },
    /// Extract indicators from a file, or stdin, without analysis
    Scan {
        file: Option<PathBuf>,
        /// Article URL whose own host should be ignored
        #[arg(long)]
        source_url: Option<String>,
    },
    /// Token usage, estimated cost and indicator totals
    Stats,
    /// Bring the database schema up to date
    Migrate,
    /// Delete every stored article, report, indicator and usage row
    Purge {
        /// Must be DELETE
        #[arg(long)]
        confirm: Option<String>,
    },
}

fn load_config(cli: &Cli) -> Result<Config> {
    let mut config = match &cli.config {
        Some(path) => Config::from_file(path)?,
        None => Config::default(),
    };
    if let Some(db) = &cli.db {
        config.database_path = db.clone();
    }
    if let Some(model) = &cli.model {
        config.analysis.model = model.clone();
    }
    if let Some(key) = cli.api_key.as_deref().filter(|k| !k.trim().is_empty()) {
        config.analysis.api_key = Some(key.to_string());
    }
    config.check()?;
    Ok(config)
}

async fn run(cli: Cli) -> Result<Value> {
    let config = load_config(&cli)?;
    match cli.command {
        Commands::Analyze { url, refresh } => {
            info!("🔍 Analyzing {}{}", url, if refresh { " (refresh)" } else { "" });
            commands::analyze(&config, &url, refresh).await
        }
        Commands::Recent { limit } => commands::recent(&config, limit).await,
        Commands::Show { url } => commands::show(&config, &url).await,
        Commands::Indicators { url } => commands::indicators(&config, &url).await,
        Commands::Scan { file, source_url } => commands::scan(file.as_deref(), source_url.as_deref()).await,
        Commands::Stats => commands::stats(&config).await,
        Commands::Migrate => commands::migrate(&config).await,
        Commands::Purge { confirm } => commands::purge(&config, confirm.as_deref()).await,
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<ExitCode> {
    let cli = Cli::parse();
    logging::init_logging(cli.verbose);

    match run(cli).await {
        Ok(value) => {
            let out = serde_json::to_string_pretty(&value).context("Failed to render output")?;
            println!("{}", out);
            Ok(ExitCode::SUCCESS)
        }
        Err(e) => {
            error!("❌ {}", e);
            let body = json!({ "error": { "code": e.reason_code(), "message": e.to_string() } });
            let out = serde_json::to_string_pretty(&body).context("Failed to render error")?;
            eprintln!("{}", out);
            Ok(ExitCode::FAILURE)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::CommandFactory;

    #[test]
    fn test_cli_definition_is_consistent() {
        Cli::command().debug_assert();
    }

    #[test]
    fn test_parses_subcommands_with_global_flags() {
        let cli = Cli::try_parse_from([
            "tia",
            "analyze",
            "https://www.securenews.com/a",
            "--refresh",
            "--db",
            "/tmp/x.db",
            "--model",
            "gpt-4o-mini",
        ])
        .unwrap();
        assert!(matches!(cli.command, Commands::Analyze { refresh: true, .. }));

        let config = load_config(&cli).unwrap();
        assert_eq!(config.database_path, PathBuf::from("/tmp/x.db"));
        assert_eq!(config.analysis.model, "gpt-4o-mini");

        let cli = Cli::try_parse_from(["tia", "purge", "--confirm", "DELETE"]).unwrap();
        assert!(matches!(cli.command, Commands::Purge { confirm: Some(ref c) } if c == "DELETE"));

        let cli = Cli::try_parse_from(["tia", "recent", "--limit", "5"]).unwrap();
        assert!(matches!(cli.command, Commands::Recent { limit: Some(5) }));
    }

    #[test]
    fn test_rejects_missing_url() {
        assert!(Cli::try_parse_from(["tia", "show"]).is_err());
    }

    #[test]
    fn test_api_key_flag_overrides_config() {
        let cli = Cli::try_parse_from(["tia", "--api-key", "sk-test", "stats"]).unwrap();
        let config = load_config(&cli).unwrap();
        assert_eq!(config.analysis.api_key.as_deref(), Some("sk-test"));
    }
}
