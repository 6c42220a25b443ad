use serde::de::DeserializeOwned;
use serde::{Deserialize, Deserializer};
use serde_json::{json, Value};
use tia_core::{
    AnalysisError, Assessment, CriticalSector, Level, MitreTechnique, SourceEvaluation, ThreatActor,
    ThreatReport, NO_JUSTIFICATION, NO_SUMMARY, UNKNOWN_SOURCE_TYPE,
};
use tracing::{debug, warn};

pub const SCHEMA_NAME: &str = "threat_intelligence_report";

const UNKNOWN_ACTOR: &str = "Unknown Actor";
const UNKNOWN_TECHNIQUE_ID: &str = "Unknown";
const UNKNOWN_TECHNIQUE: &str = "Unknown Technique";
const UNKNOWN_SECTOR: &str = "Unknown Sector";
const NO_DESCRIPTION: &str = "No description available.";

fn assessment_schema(subject: &str) -> Value {
    json!({
        "type": "object",
        "additionalProperties": false,
        "properties": {
            "level": {
                "type": "string",
                "enum": ["High", "Medium", "Low"],
                "description": format!("The {} level of the source", subject)
            },
            "justification": {
                "type": "string",
                "description": format!("Brief justification for the {} assessment", subject)
            }
        },
        "required": ["level", "justification"]
    })
}

fn string_list(description: &str) -> Value {
    json!({
        "type": "array",
        "items": {"type": "string"},
        "description": description
    })
}

/// JSON schema the model output is constrained to. Every property is
/// required and no extra keys are allowed, as strict mode demands.
pub fn report_schema() -> Value {
    json!({
        "type": "object",
        "additionalProperties": false,
        "properties": {
            "summary": {
                "type": "string",
                "description": "A concise summary of the main points in a single paragraph."
            },
            "source_evaluation": {
                "type": "object",
                "additionalProperties": false,
                "properties": {
                    "reliability": assessment_schema("reliability"),
                    "credibility": assessment_schema("credibility"),
                    "source_type": {
                        "type": "string",
                        "description": "The type of source (e.g., Blog, Cybersecurity Vendor, Government Agency, etc.)"
                    }
                },
                "required": ["reliability", "credibility", "source_type"]
            },
            "threat_actors": {
                "type": "array",
                "items": {
                    "type": "object",
                    "additionalProperties": false,
                    "properties": {
                        "name": {"type": "string", "description": "The name of the threat actor or group"},
                        "description": {"type": "string", "description": "Brief description of the actor's role in the article"},
                        "confidence": {
                            "type": "string",
                            "enum": ["High", "Medium", "Low"],
                            "description": "Confidence level in the attribution"
                        },
                        "aliases": string_list("Alternative names for the threat actor")
                    },
                    "required": ["name", "description", "confidence", "aliases"]
                },
                "description": "List of threat actors mentioned in the article"
            },
            "mitre_techniques": {
                "type": "array",
                "items": {
                    "type": "object",
                    "additionalProperties": false,
                    "properties": {
                        "id": {"type": "string", "description": "The MITRE ATT&CK technique ID (e.g., T1234)"},
                        "name": {"type": "string", "description": "The name of the technique"},
                        "description": {"type": "string", "description": "Brief description of how this technique appears in the article"}
                    },
                    "required": ["id", "name", "description"]
                },
                "description": "MITRE ATT&CK techniques mentioned in the article"
            },
            "key_insights": string_list("Key threat intelligence insights from the article"),
            "potential_issues": string_list("Potential biases or issues with the source or analysis"),
            "intelligence_gaps": string_list("Missing intelligence elements or unanswered questions"),
            "critical_sectors": {
                "type": "array",
                "items": {
                    "type": "object",
                    "additionalProperties": false,
                    "properties": {
                        "name": {"type": "string", "description": "Name of the critical infrastructure sector"},
                        "score": {"type": "integer", "description": "Relevance score (1-5, where 1=Minimal, 5=Critical)"},
                        "justification": {"type": "string", "description": "Justification for the relevance score"}
                    },
                    "required": ["name", "score", "justification"]
                },
                "description": "Critical infrastructure sectors relevant to the threat"
            }
        },
        "required": [
            "summary", "source_evaluation", "threat_actors", "mitre_techniques",
            "key_insights", "potential_issues", "intelligence_gaps", "critical_sectors"
        ]
    })
}

/// Any value of the wrong shape becomes `None` instead of failing the
/// whole document.
fn lenient<'de, D, T>(deserializer: D) -> std::result::Result<Option<T>, D::Error>
where
    D: Deserializer<'de>,
    T: DeserializeOwned,
{
    let value = Value::deserialize(deserializer)?;
    Ok(serde_json::from_value(value).ok())
}

#[derive(Debug, Default, Deserialize)]
pub struct AssessmentDraft {
    #[serde(default, deserialize_with = "lenient")]
    pub level: Option<String>,
    #[serde(default, deserialize_with = "lenient")]
    pub justification: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
pub struct SourceEvaluationDraft {
    #[serde(default, deserialize_with = "lenient")]
    pub reliability: Option<AssessmentDraft>,
    #[serde(default, deserialize_with = "lenient")]
    pub credibility: Option<AssessmentDraft>,
    #[serde(default, deserialize_with = "lenient")]
    pub source_type: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
pub struct ThreatActorDraft {
    #[serde(default, deserialize_with = "lenient")]
    pub name: Option<String>,
    #[serde(default, deserialize_with = "lenient")]
    pub description: Option<String>,
    #[serde(default, deserialize_with = "lenient")]
    pub confidence: Option<String>,
    #[serde(default, deserialize_with = "lenient")]
    pub aliases: Option<Vec<String>>,
}

#[derive(Debug, Default, Deserialize)]
pub struct MitreTechniqueDraft {
    #[serde(default, deserialize_with = "lenient")]
    pub id: Option<String>,
    #[serde(default, deserialize_with = "lenient")]
    pub name: Option<String>,
    #[serde(default, deserialize_with = "lenient")]
    pub description: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
pub struct CriticalSectorDraft {
    #[serde(default, deserialize_with = "lenient")]
    pub name: Option<String>,
    #[serde(default)]
    pub score: Option<Value>,
    #[serde(default, deserialize_with = "lenient")]
    pub justification: Option<String>,
}

/// Model output as received: every field optional, nothing trusted.
#[derive(Debug, Default, Deserialize)]
pub struct ReportDraft {
    #[serde(default, deserialize_with = "lenient")]
    pub summary: Option<String>,
    #[serde(default, deserialize_with = "lenient")]
    pub source_evaluation: Option<SourceEvaluationDraft>,
    #[serde(default, deserialize_with = "lenient")]
    pub threat_actors: Option<Vec<ThreatActorDraft>>,
    #[serde(default, deserialize_with = "lenient")]
    pub mitre_techniques: Option<Vec<MitreTechniqueDraft>>,
    #[serde(default, deserialize_with = "lenient")]
    pub key_insights: Option<Vec<String>>,
    #[serde(default, deserialize_with = "lenient")]
    pub potential_issues: Option<Vec<String>>,
    #[serde(default, deserialize_with = "lenient")]
    pub intelligence_gaps: Option<Vec<String>>,
    #[serde(default, deserialize_with = "lenient")]
    pub critical_sectors: Option<Vec<CriticalSectorDraft>>,
}

fn text_or(value: Option<String>, default: &str) -> String {
    value
        .map(|v| v.trim().to_string())
        .filter(|v| !v.is_empty())
        .unwrap_or_else(|| default.to_string())
}

fn clean_list(values: Option<Vec<String>>) -> Vec<String> {
    values
        .unwrap_or_default()
        .into_iter()
        .map(|v| v.trim().to_string())
        .filter(|v| !v.is_empty())
        .collect()
}

fn sector_score(value: Option<&Value>) -> u8 {
    let raw = match value {
        Some(Value::Number(n)) => n.as_i64().or_else(|| n.as_f64().map(|f| f.round() as i64)),
        Some(Value::String(s)) => s.trim().parse::<i64>().ok(),
        _ => None,
    };
    raw.map_or(1, |score| score.clamp(1, 5) as u8)
}

impl AssessmentDraft {
    fn normalize(self) -> Assessment {
        Assessment {
            level: self.level.as_deref().map_or(Level::Unknown, Level::parse),
            justification: text_or(self.justification, NO_JUSTIFICATION),
        }
    }
}

impl ReportDraft {
    /// Fills every gap with its documented default and clamps sector scores.
    pub fn normalize(self) -> ThreatReport {
        let source = self.source_evaluation.unwrap_or_default();
        let source_evaluation = SourceEvaluation {
            reliability: source.reliability.unwrap_or_default().normalize(),
            credibility: source.credibility.unwrap_or_default().normalize(),
            source_type: text_or(source.source_type, UNKNOWN_SOURCE_TYPE),
        };

        let threat_actors = self
            .threat_actors
            .unwrap_or_default()
            .into_iter()
            .map(|actor| ThreatActor {
                name: text_or(actor.name, UNKNOWN_ACTOR),
                description: text_or(actor.description, NO_DESCRIPTION),
                confidence: actor.confidence.as_deref().map_or(Level::Unknown, Level::parse),
                aliases: clean_list(actor.aliases),
            })
            .collect();

        let mitre_techniques = self
            .mitre_techniques
            .unwrap_or_default()
            .into_iter()
            .map(|technique| MitreTechnique {
                id: text_or(technique.id, UNKNOWN_TECHNIQUE_ID),
                name: text_or(technique.name, UNKNOWN_TECHNIQUE),
                description: text_or(technique.description, NO_DESCRIPTION),
            })
            .collect();

        let critical_sectors = self
            .critical_sectors
            .unwrap_or_default()
            .into_iter()
            .map(|sector| CriticalSector {
                score: sector_score(sector.score.as_ref()),
                name: text_or(sector.name, UNKNOWN_SECTOR),
                justification: text_or(sector.justification, NO_JUSTIFICATION),
            })
            .collect();

        ThreatReport {
            summary: text_or(self.summary, NO_SUMMARY),
            source_evaluation,
            threat_actors,
            mitre_techniques,
            key_insights: clean_list(self.key_insights),
            potential_issues: clean_list(self.potential_issues),
            intelligence_gaps: clean_list(self.intelligence_gaps),
            critical_sectors,
        }
    }
}

fn strip_code_fences(text: &str) -> &str {
    let trimmed = text.trim();
    let Some(rest) = trimmed.strip_prefix("```") else {
        return trimmed;
    };
    // Drop the info string (```json) up to the first newline.
    let body = rest.split_once('\n').map_or("", |(_, body)| body);
    body.trim_end().strip_suffix("```").unwrap_or(body).trim()
}

fn as_object(text: &str) -> Option<Value> {
    match serde_json::from_str::<Value>(text) {
        Ok(value @ Value::Object(_)) => Some(value),
        _ => None,
    }
}

fn preview(text: &str) -> String {
    let head: String = text.chars().take(80).collect();
    if head.len() < text.len() {
        format!("{}...", head)
    } else {
        head
    }
}

/// Parses model output into a normalized report. Falls back to stripping
/// Markdown fences and then to the outermost `{...}` span before giving up.
pub fn parse_report(text: &str) -> std::result::Result<ThreatReport, AnalysisError> {
    let value = as_object(text.trim())
        .or_else(|| {
            debug!("Response is not bare JSON, trying without code fences");
            as_object(strip_code_fences(text))
        })
        .or_else(|| {
            let start = text.find('{')?;
            let end = text.rfind('}')?;
            if start >= end {
                return None;
            }
            debug!("Trying outermost brace span {}..={}", start, end);
            as_object(&text[start..=end])
        })
        .ok_or_else(|| {
            warn!("Model output is not a JSON object: {}", preview(text));
            AnalysisError::SchemaViolation(format!("response is not a JSON object: {}", preview(text)))
        })?;

    let draft: ReportDraft =
        serde_json::from_value(value).map_err(|e| AnalysisError::SchemaViolation(e.to_string()))?;
    Ok(draft.normalize())
}
