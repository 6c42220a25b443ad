use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::{Error, Result};

/// Top-level configuration, built once at start-up and handed to each
/// component constructor by reference.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub database_path: PathBuf,
    pub analysis: AnalysisConfig,
    pub extraction: ExtractionConfig,
    pub validation: ValidationConfig,
    pub model_prices: BTreeMap<String, ModelPrice>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            database_path: PathBuf::from("data/article_analysis.db"),
            analysis: AnalysisConfig::default(),
            extraction: ExtractionConfig::default(),
            validation: ValidationConfig::default(),
            model_prices: default_model_prices(),
        }
    }
}

impl Config {
    /// Reads a JSON config file; absent keys keep their defaults.
    pub fn from_file(path: &Path) -> Result<Self> {
        let raw = std::fs::read_to_string(path)?;
        let config: Config = serde_json::from_str(&raw)
            .map_err(|e| Error::Config(format!("Failed to parse {}: {}", path.display(), e)))?;
        config.check()?;
        Ok(config)
    }

    pub fn check(&self) -> Result<()> {
        let analysis = &self.analysis;
        if !(0.0..=2.0).contains(&analysis.temperature) {
            return Err(Error::Config(format!(
                "temperature must be between 0 and 2, got {}",
                analysis.temperature
            )));
        }
        if analysis.max_output_tokens == 0 {
            return Err(Error::Config("max_output_tokens must be positive".to_string()));
        }
        if analysis.backoff_factor < 1.0 {
            return Err(Error::Config("backoff_factor must be at least 1.0".to_string()));
        }
        if analysis.model.trim().is_empty() {
            return Err(Error::Config("model must not be empty".to_string()));
        }
        Ok(())
    }
}

#[derive(Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AnalysisConfig {
    #[serde(skip_serializing)]
    pub api_key: Option<String>,
    pub base_url: String,
    pub model: String,
    pub temperature: f32,
    pub seed: Option<u64>,
    pub max_output_tokens: u32,
    pub max_input_tokens: u32,
    pub timeout_secs: u64,
    pub max_retries: u32,
    pub initial_backoff_ms: u64,
    pub backoff_factor: f64,
    pub max_backoff_ms: u64,
}

impl fmt::Debug for AnalysisConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AnalysisConfig")
            .field("api_key", &self.api_key.as_deref().map(|_| "<redacted>"))
            .field("base_url", &self.base_url)
            .field("model", &self.model)
            .field("temperature", &self.temperature)
            .field("seed", &self.seed)
            .field("max_output_tokens", &self.max_output_tokens)
            .field("max_input_tokens", &self.max_input_tokens)
            .field("timeout_secs", &self.timeout_secs)
            .field("max_retries", &self.max_retries)
            .finish()
    }
}

impl Default for AnalysisConfig {
    fn default() -> Self {
        Self {
            api_key: None,
            base_url: "https://api.openai.com/v1".to_string(),
            model: "gpt-4o".to_string(),
            temperature: 0.1,
            seed: None,
            max_output_tokens: 4000,
            max_input_tokens: 100_000,
            timeout_secs: 120,
            max_retries: 3,
            initial_backoff_ms: 3000,
            backoff_factor: 1.5,
            max_backoff_ms: 60_000,
        }
    }
}

impl AnalysisConfig {
    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ExtractionConfig {
    pub min_content_length: usize,
    pub timeout_secs: u64,
    pub user_agent: String,
    /// Extra request headers keyed by host, for sites that reject the default client.
    pub domain_headers: BTreeMap<String, BTreeMap<String, String>>,
}

impl Default for ExtractionConfig {
    fn default() -> Self {
        let mut domain_headers = BTreeMap::new();
        for host in ["www.cybersecurity-insiders.com", "www.bleepingcomputer.com"] {
            let mut headers = BTreeMap::new();
            headers.insert("Referer".to_string(), "https://www.google.com/".to_string());
            domain_headers.insert(host.to_string(), headers);
        }

        Self {
            min_content_length: 200,
            timeout_secs: 20,
            user_agent: "Mozilla/5.0 (Windows NT 10.0; Win64; x64) AppleWebKit/537.36 (KHTML, like Gecko) Chrome/118.0.0.0 Safari/537.36".to_string(),
            domain_headers,
        }
    }
}

impl ExtractionConfig {
    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ValidationConfig {
    /// Empty means any top-level domain is accepted.
    pub allowed_tlds: Vec<String>,
    pub blocked_domains: Vec<String>,
    pub probe_reachability: bool,
    pub probe_timeout_secs: u64,
}

impl Default for ValidationConfig {
    fn default() -> Self {
        Self {
            allowed_tlds: DEFAULT_ALLOWED_TLDS.iter().map(|t| t.to_string()).collect(),
            blocked_domains: vec!["localhost".to_string()],
            probe_reachability: false,
            probe_timeout_secs: 10,
        }
    }
}

pub const DEFAULT_ALLOWED_TLDS: &[&str] = &[
    "com", "net", "org", "edu", "gov", "mil", "int", "info", "biz", "name", "pro", "mobi", "app", "io",
    "ai", "dev", "cloud", "news", "blog", "tech", "security", "us", "uk", "ca", "au", "de", "fr", "jp",
    "cn", "ru", "br", "in", "it", "nl", "es", "ch", "se", "no", "fi", "dk", "ie", "at", "be", "nz", "sg",
    "ae", "il", "kr", "pl", "eu",
];

/// USD per million tokens.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct ModelPrice {
    pub input: f64,
    pub cached: f64,
    pub output: f64,
}

pub fn default_model_prices() -> BTreeMap<String, ModelPrice> {
    let mut prices = BTreeMap::new();
    prices.insert("gpt-4o-mini".to_string(), ModelPrice { input: 0.15, cached: 0.075, output: 0.6 });
    prices.insert("gpt-4o".to_string(), ModelPrice { input: 0.5, cached: 0.25, output: 1.5 });
    prices.insert("gpt-4-turbo".to_string(), ModelPrice { input: 10.0, cached: 5.0, output: 30.0 });
    prices
}
