use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::str::FromStr;

use crate::config::ModelPrice;

/// Indicator of compromise categories. Hash algorithms are kept apart on
/// purpose so consumers can tell an MD5 from a SHA256 without re-parsing.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum IndicatorType {
    Ipv4,
    Ipv6,
    Domain,
    Url,
    Email,
    Md5,
    Sha1,
    Sha256,
    Cve,
    MitreTechnique,
}

impl IndicatorType {
    pub const ALL: [IndicatorType; 10] = [
        IndicatorType::Ipv4,
        IndicatorType::Ipv6,
        IndicatorType::Domain,
        IndicatorType::Url,
        IndicatorType::Email,
        IndicatorType::Md5,
        IndicatorType::Sha1,
        IndicatorType::Sha256,
        IndicatorType::Cve,
        IndicatorType::MitreTechnique,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            IndicatorType::Ipv4 => "ipv4",
            IndicatorType::Ipv6 => "ipv6",
            IndicatorType::Domain => "domain",
            IndicatorType::Url => "url",
            IndicatorType::Email => "email",
            IndicatorType::Md5 => "md5",
            IndicatorType::Sha1 => "sha1",
            IndicatorType::Sha256 => "sha256",
            IndicatorType::Cve => "cve",
            IndicatorType::MitreTechnique => "mitre_technique",
        }
    }

    pub fn label(&self) -> &'static str {
        match self {
            IndicatorType::Ipv4 => "IPv4 Addresses",
            IndicatorType::Ipv6 => "IPv6 Addresses",
            IndicatorType::Domain => "Domains",
            IndicatorType::Url => "URLs",
            IndicatorType::Email => "Email Addresses",
            IndicatorType::Md5 => "MD5 Hashes",
            IndicatorType::Sha1 => "SHA1 Hashes",
            IndicatorType::Sha256 => "SHA256 Hashes",
            IndicatorType::Cve => "CVE IDs",
            IndicatorType::MitreTechnique => "MITRE ATT&CK Techniques",
        }
    }
}

impl fmt::Display for IndicatorType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for IndicatorType {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        IndicatorType::ALL
            .iter()
            .copied()
            .find(|t| t.as_str() == s)
            .ok_or_else(|| format!("Unknown indicator type: {}", s))
    }
}

/// Indicator values grouped by type. Ordered containers keep the output of
/// repeated extractions byte-for-byte identical.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct IndicatorMap(BTreeMap<IndicatorType, BTreeSet<String>>);

impl IndicatorMap {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, kind: IndicatorType, value: impl Into<String>) -> bool {
        self.0.entry(kind).or_default().insert(value.into())
    }

    pub fn get(&self, kind: IndicatorType) -> Option<&BTreeSet<String>> {
        self.0.get(&kind)
    }

    pub fn contains(&self, kind: IndicatorType, value: &str) -> bool {
        self.0.get(&kind).map_or(false, |values| values.contains(value))
    }

    pub fn count(&self, kind: IndicatorType) -> usize {
        self.0.get(&kind).map_or(0, BTreeSet::len)
    }

    pub fn total(&self) -> usize {
        self.0.values().map(BTreeSet::len).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.total() == 0
    }

    /// Flattened `(type, value)` pairs in a stable order.
    pub fn pairs(&self) -> impl Iterator<Item = (IndicatorType, &str)> + '_ {
        self.0
            .iter()
            .flat_map(|(kind, values)| values.iter().map(move |v| (*kind, v.as_str())))
    }

    /// Groups the indicators the way the report view lists them.
    pub fn display_groups(&self) -> IndicatorDisplay {
        const GROUPS: [(&str, &[IndicatorType]); 3] = [
            (
                "Network Indicators",
                &[IndicatorType::Ipv4, IndicatorType::Ipv6, IndicatorType::Domain, IndicatorType::Url],
            ),
            (
                "File Indicators",
                &[IndicatorType::Md5, IndicatorType::Sha1, IndicatorType::Sha256],
            ),
            (
                "Other Indicators",
                &[IndicatorType::Email, IndicatorType::Cve, IndicatorType::MitreTechnique],
            ),
        ];

        let categories = GROUPS
            .iter()
            .map(|(name, kinds)| IndicatorCategory {
                name: name.to_string(),
                types: kinds
                    .iter()
                    .map(|kind| {
                        let values: Vec<String> = self
                            .get(*kind)
                            .map(|set| set.iter().cloned().collect())
                            .unwrap_or_default();
                        IndicatorGroup {
                            kind: *kind,
                            label: kind.label().to_string(),
                            count: values.len(),
                            values,
                        }
                    })
                    .collect(),
            })
            .collect();

        IndicatorDisplay {
            categories,
            total_count: self.total(),
        }
    }
}

impl FromIterator<(IndicatorType, String)> for IndicatorMap {
    fn from_iter<I: IntoIterator<Item = (IndicatorType, String)>>(iter: I) -> Self {
        let mut map = IndicatorMap::new();
        for (kind, value) in iter {
            map.insert(kind, value);
        }
        map
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IndicatorDisplay {
    pub categories: Vec<IndicatorCategory>,
    pub total_count: usize,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IndicatorCategory {
    pub name: String,
    pub types: Vec<IndicatorGroup>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IndicatorGroup {
    pub kind: IndicatorType,
    pub label: String,
    pub values: Vec<String>,
    pub count: usize,
}

/// Assessment level used for reliability, credibility and attribution confidence.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum Level {
    High,
    Medium,
    Low,
    #[default]
    Unknown,
}

impl Level {
    /// Lenient parse: case-insensitive, "moderate" counts as medium, anything
    /// else is `Unknown`.
    pub fn parse(s: &str) -> Self {
        match s.trim().to_ascii_lowercase().as_str() {
            "high" => Level::High,
            "medium" | "moderate" => Level::Medium,
            "low" => Level::Low,
            _ => Level::Unknown,
        }
    }
}

pub const NO_SUMMARY: &str = "No summary available.";
pub const NO_JUSTIFICATION: &str = "No justification provided.";
pub const UNKNOWN_SOURCE_TYPE: &str = "Unknown";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Assessment {
    pub level: Level,
    pub justification: String,
}

impl Default for Assessment {
    fn default() -> Self {
        Self {
            level: Level::Unknown,
            justification: NO_JUSTIFICATION.to_string(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SourceEvaluation {
    pub reliability: Assessment,
    pub credibility: Assessment,
    pub source_type: String,
}

impl Default for SourceEvaluation {
    fn default() -> Self {
        Self {
            reliability: Assessment::default(),
            credibility: Assessment::default(),
            source_type: UNKNOWN_SOURCE_TYPE.to_string(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ThreatActor {
    pub name: String,
    pub description: String,
    pub confidence: Level,
    pub aliases: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MitreTechnique {
    pub id: String,
    pub name: String,
    pub description: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CriticalSector {
    pub name: String,
    /// Relevance from 1 (minimal) to 5 (critical).
    pub score: u8,
    pub justification: String,
}

/// Normalized threat-intelligence report. Every field is always present;
/// the analysis engine fills gaps in model output with defaults.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ThreatReport {
    pub summary: String,
    pub source_evaluation: SourceEvaluation,
    pub threat_actors: Vec<ThreatActor>,
    pub mitre_techniques: Vec<MitreTechnique>,
    pub key_insights: Vec<String>,
    pub potential_issues: Vec<String>,
    pub intelligence_gaps: Vec<String>,
    pub critical_sectors: Vec<CriticalSector>,
}

impl Default for ThreatReport {
    fn default() -> Self {
        Self {
            summary: NO_SUMMARY.to_string(),
            source_evaluation: SourceEvaluation::default(),
            threat_actors: Vec::new(),
            mitre_techniques: Vec::new(),
            key_insights: Vec::new(),
            potential_issues: Vec::new(),
            intelligence_gaps: Vec::new(),
            critical_sectors: Vec::new(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TokenUsage {
    pub model: String,
    pub input_tokens: u64,
    pub output_tokens: u64,
    pub cached_input_tokens: u64,
    pub timestamp: DateTime<Utc>,
}

impl TokenUsage {
    pub fn new(model: impl Into<String>, input_tokens: u64, output_tokens: u64, cached_input_tokens: u64) -> Self {
        Self {
            model: model.into(),
            input_tokens,
            output_tokens,
            cached_input_tokens,
            timestamp: Utc::now(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ArticleRecord {
    pub id: i64,
    pub url: String,
    pub title: String,
    pub content_length: i64,
    pub extraction_time: f64,
    pub analysis_time: f64,
    pub model: String,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StoredAnalysis {
    pub article: ArticleRecord,
    pub raw_text: String,
    pub report: ThreatReport,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ModelUsage {
    pub total_input: u64,
    pub total_output: u64,
    pub cached_input: u64,
    pub regular_input: u64,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct OverallUsage {
    pub total_input: u64,
    pub total_output: u64,
    pub cached_input: u64,
    pub regular_input: u64,
    pub total_tokens: u64,
    pub model_count: u64,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct TokenUsageStats {
    pub models: BTreeMap<String, ModelUsage>,
    pub overall: OverallUsage,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct CostEstimate {
    pub per_model: BTreeMap<String, f64>,
    pub total: f64,
}

impl TokenUsageStats {
    /// USD estimate from per-million-token prices. Model ids carry date
    /// suffixes (`gpt-4o-2024-08-06`), so each id is matched to the longest
    /// price-table key it contains; unpriced models are skipped.
    pub fn estimated_cost(&self, prices: &BTreeMap<String, ModelPrice>) -> CostEstimate {
        let mut estimate = CostEstimate::default();
        for (model, usage) in &self.models {
            let Some(price) = price_for(model, prices) else {
                continue;
            };
            let cost = usage.regular_input as f64 * price.input / 1_000_000.0
                + usage.cached_input as f64 * price.cached / 1_000_000.0
                + usage.total_output as f64 * price.output / 1_000_000.0;
            estimate.total += cost;
            estimate.per_model.insert(model.clone(), cost);
        }
        estimate
    }
}

fn price_for<'a>(model: &str, prices: &'a BTreeMap<String, ModelPrice>) -> Option<&'a ModelPrice> {
    prices
        .iter()
        .filter(|(key, _)| model.contains(key.as_str()))
        .max_by_key(|(key, _)| key.len())
        .map(|(_, price)| price)
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct IndicatorStats {
    pub total_indicators: i64,
    pub articles_with_indicators: i64,
    pub type_counts: BTreeMap<String, i64>,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TableCounts {
    pub articles: i64,
    pub analysis_results: i64,
    pub token_usage: i64,
    pub indicators: i64,
}

impl TableCounts {
    pub fn is_empty(&self) -> bool {
        self.articles == 0 && self.analysis_results == 0 && self.token_usage == 0 && self.indicators == 0
    }
}
