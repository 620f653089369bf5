// src/escalation.rs
//
// Escalation judge: given the current description, the recent alert history
// for the same track, and the captured frame, an external generative model
// returns severity / confidence / refined description. The call is
// best-effort: the baseline alert already exists before the judge runs,
// and any failure here collapses to "refinement unavailable".

use crate::types::JudgeConfig;
use anyhow::{Context, Result};
use base64::Engine;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::sync::Mutex;
use std::time::Duration;
use tracing::{debug, warn};

const GEMINI_BASE_URL: &str = "https://generativelanguage.googleapis.com/v1beta/models";

// ============================================================================
// API KEY POOL
// ============================================================================

/// Round-robin pool over the configured API keys. The cursor is
/// mutex-guarded so control and worker threads can share the pool.
pub struct ApiKeyPool {
    keys: Vec<String>,
    cursor: Mutex<usize>,
}

impl ApiKeyPool {
    pub fn new(keys: Vec<String>) -> Result<Self> {
        let keys: Vec<String> = keys
            .into_iter()
            .map(|k| k.trim().to_string())
            .filter(|k| !k.is_empty())
            .collect();
        if keys.is_empty() {
            anyhow::bail!("No judge API keys configured");
        }
        Ok(Self {
            keys,
            cursor: Mutex::new(0),
        })
    }

    pub fn next(&self) -> String {
        let mut cursor = self.cursor.lock().unwrap();
        let key = self.keys[*cursor].clone();
        *cursor = (*cursor + 1) % self.keys.len();
        key
    }
}

/// Comma-separated keys from GEMINI_API_KEYS, if set.
pub fn api_keys_from_env() -> Option<Vec<String>> {
    std::env::var("GEMINI_API_KEYS")
        .ok()
        .map(|raw| raw.split(',').map(|k| k.to_string()).collect())
}

// ============================================================================
// REQUEST / VERDICT TYPES
// ============================================================================

pub struct JudgeRequest {
    /// Current (translated) description of the threat.
    pub descripcion: String,
    pub detector_confidence: f32,
    /// Prior alert descriptions for the same track, oldest first.
    pub history: Vec<String>,
    /// The captured frame, JPEG-encoded.
    pub frame_jpeg: Vec<u8>,
    pub frame_path: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JudgeVerdict {
    pub threat_severity: String,
    /// 0-100 scale.
    pub confidence_level: u32,
    pub refined_description: Option<String>,
    pub image_path: String,
    pub timestamp: String,
}

/// Tagged outcome: downstream code pattern-matches instead of probing a
/// dynamic response for keys.
#[derive(Debug, Clone, PartialEq)]
pub enum JudgeOutcome {
    Verdict(JudgeVerdict),
    Unparseable,
}

pub trait EscalationJudge: Send + Sync {
    fn assess(&self, request: &JudgeRequest) -> JudgeOutcome;
}

// ============================================================================
// VERDICT PARSING
// ============================================================================

/// The model frequently wraps its JSON in markdown code fences. Strip a
/// leading fence (with optional language tag) and a trailing fence before
/// structural parsing.
pub fn strip_fences(raw: &str) -> &str {
    let mut text = raw.trim();
    if let Some(rest) = text.strip_prefix("```") {
        text = match rest.split_once('\n') {
            Some((_, body)) => body,
            None => rest,
        };
    }
    if let Some(rest) = text.strip_suffix("```") {
        text = rest;
    }
    text.trim()
}

#[derive(Debug, Deserialize)]
struct RawVerdict {
    #[serde(default)]
    threat_severity: Option<String>,
    #[serde(default)]
    confidence_level: Option<f64>,
    #[serde(default)]
    refined_description: Option<String>,
}

/// Parse the judge's response text into a verdict. `image_path` and
/// `timestamp` are stamped locally; the model is not trusted with them.
pub fn parse_verdict(raw: &str, image_path: &str, timestamp: DateTime<Utc>) -> JudgeOutcome {
    let cleaned = strip_fences(raw);

    match serde_json::from_str::<RawVerdict>(cleaned) {
        Ok(v) => JudgeOutcome::Verdict(JudgeVerdict {
            threat_severity: v
                .threat_severity
                .unwrap_or_else(|| "desconocida".to_string()),
            confidence_level: v.confidence_level.map(|c| c.round() as u32).unwrap_or(0),
            refined_description: v.refined_description,
            image_path: image_path.to_string(),
            timestamp: timestamp.to_rfc3339(),
        }),
        Err(e) => {
            warn!("⚠️  Judge verdict is not valid JSON: {e}");
            JudgeOutcome::Unparseable
        }
    }
}

// ============================================================================
// GEMINI CLIENT
// ============================================================================

#[derive(Debug, Serialize)]
struct GenerateRequest {
    contents: Vec<Content>,
}

#[derive(Debug, Serialize)]
struct Content {
    parts: Vec<Part>,
}

#[derive(Debug, Serialize)]
#[serde(untagged)]
enum Part {
    Text { text: String },
    Image { inline_data: InlineData },
}

#[derive(Debug, Serialize)]
struct InlineData {
    mime_type: String,
    data: String,
}

#[derive(Debug, Deserialize)]
struct GenerateResponse {
    #[serde(default)]
    candidates: Vec<Candidate>,
}

#[derive(Debug, Deserialize)]
struct Candidate {
    content: CandidateContent,
}

#[derive(Debug, Deserialize)]
struct CandidateContent {
    #[serde(default)]
    parts: Vec<CandidatePart>,
}

#[derive(Debug, Deserialize)]
struct CandidatePart {
    #[serde(default)]
    text: Option<String>,
}

pub struct GeminiJudge {
    http_client: reqwest::blocking::Client,
    keys: ApiKeyPool,
    model: String,
}

impl GeminiJudge {
    pub fn new(config: &JudgeConfig, keys: ApiKeyPool) -> Result<Self> {
        let http_client = reqwest::blocking::Client::builder()
            .timeout(Duration::from_secs(config.timeout_secs))
            .build()
            .context("Failed to build judge HTTP client")?;

        Ok(Self {
            http_client,
            keys,
            model: config.model.clone(),
        })
    }

    fn build_prompt(request: &JudgeRequest) -> String {
        let previous = request.history.join("\n");
        format!(
            "Descripción actual de la amenaza: {}.\n\
             Confianza del detector: {:.1}%.\n\
             Descripción de amenazas previas: {}.\n\n\
             Basado en la descripción actual y las amenazas previas, proporcione un análisis \
             detallado sobre si la situación ha escalado y requiere intervención inmediata.\n\
             Califique la gravedad de la amenaza: grave, leve o crítico.\n\
             Evalúe si hay intención de usar el arma y el nivel de confianza de que la amenaza \
             es real (0-100).\n\
             Devuelva la respuesta en formato JSON con los campos:\n\
             - threat_severity\n\
             - confidence_level\n\
             - refined_description",
            request.descripcion,
            request.detector_confidence * 100.0,
            previous,
        )
    }

    fn generate(&self, request: &JudgeRequest) -> Result<String> {
        let body = GenerateRequest {
            contents: vec![Content {
                parts: vec![
                    Part::Text {
                        text: Self::build_prompt(request),
                    },
                    Part::Image {
                        inline_data: InlineData {
                            mime_type: "image/jpeg".to_string(),
                            data: base64::engine::general_purpose::STANDARD
                                .encode(&request.frame_jpeg),
                        },
                    },
                ],
            }],
        };

        let url = format!(
            "{}/{}:generateContent?key={}",
            GEMINI_BASE_URL,
            self.model,
            self.keys.next()
        );

        let response = self
            .http_client
            .post(&url)
            .json(&body)
            .send()
            .context("Judge request failed")?;

        if !response.status().is_success() {
            anyhow::bail!("Judge returned {}", response.status());
        }

        let parsed: GenerateResponse = response
            .json()
            .context("Failed to decode judge response body")?;

        let text: String = parsed
            .candidates
            .first()
            .map(|c| {
                c.content
                    .parts
                    .iter()
                    .filter_map(|p| p.text.as_deref())
                    .collect::<Vec<_>>()
                    .join("")
            })
            .unwrap_or_default();

        if text.is_empty() {
            anyhow::bail!("Judge returned no text candidates");
        }

        debug!("Judge raw response: {text}");
        Ok(text)
    }
}

impl EscalationJudge for GeminiJudge {
    fn assess(&self, request: &JudgeRequest) -> JudgeOutcome {
        match self.generate(request) {
            Ok(text) => parse_verdict(&text, &request.frame_path, Utc::now()),
            Err(e) => {
                warn!("❌ Judge call failed: {e:#}");
                JudgeOutcome::Unparseable
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn ts() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2025, 6, 1, 12, 0, 0).unwrap()
    }

    const VERDICT_JSON: &str = r#"{
        "threat_severity": "grave",
        "confidence_level": 85,
        "refined_description": "Sujeto apuntando con arma corta"
    }"#;

    #[test]
    fn test_fenced_and_bare_verdicts_parse_identically() {
        let bare = parse_verdict(VERDICT_JSON, "frame.jpg", ts());
        let fenced = parse_verdict(&format!("```json\n{VERDICT_JSON}\n```"), "frame.jpg", ts());
        assert_eq!(bare, fenced);

        match bare {
            JudgeOutcome::Verdict(v) => {
                assert_eq!(v.threat_severity, "grave");
                assert_eq!(v.confidence_level, 85);
                assert_eq!(
                    v.refined_description.as_deref(),
                    Some("Sujeto apuntando con arma corta")
                );
                assert_eq!(v.image_path, "frame.jpg");
            }
            JudgeOutcome::Unparseable => panic!("expected a verdict"),
        }
    }

    #[test]
    fn test_fence_without_language_tag() {
        let wrapped = format!("```\n{VERDICT_JSON}\n```");
        assert_eq!(
            parse_verdict(&wrapped, "f.jpg", ts()),
            parse_verdict(VERDICT_JSON, "f.jpg", ts()),
        );
    }

    #[test]
    fn test_prose_response_is_unparseable() {
        let outcome = parse_verdict("No puedo evaluar esta imagen.", "f.jpg", ts());
        assert_eq!(outcome, JudgeOutcome::Unparseable);
    }

    #[test]
    fn test_missing_fields_fall_back_to_defaults() {
        let outcome = parse_verdict(r#"{"refined_description": "algo"}"#, "f.jpg", ts());
        match outcome {
            JudgeOutcome::Verdict(v) => {
                assert_eq!(v.threat_severity, "desconocida");
                assert_eq!(v.confidence_level, 0);
            }
            JudgeOutcome::Unparseable => panic!("expected a verdict"),
        }
    }

    #[test]
    fn test_fractional_confidence_is_rounded() {
        let outcome = parse_verdict(r#"{"confidence_level": 12.6}"#, "f.jpg", ts());
        match outcome {
            JudgeOutcome::Verdict(v) => assert_eq!(v.confidence_level, 13),
            JudgeOutcome::Unparseable => panic!("expected a verdict"),
        }
    }

    #[test]
    fn test_verdict_round_trips_through_serde() {
        let verdict = JudgeVerdict {
            threat_severity: "crítico".to_string(),
            confidence_level: 92,
            refined_description: Some("arma levantada".to_string()),
            image_path: "data/frames/alerta_7.jpg".to_string(),
            timestamp: ts().to_rfc3339(),
        };
        let json = serde_json::to_string(&verdict).unwrap();
        let back: JudgeVerdict = serde_json::from_str(&json).unwrap();
        assert_eq!(verdict, back);
    }

    #[test]
    fn test_key_pool_rotates_in_order() {
        let pool = ApiKeyPool::new(vec!["a".into(), "b".into(), "c".into()]).unwrap();
        let drawn: Vec<String> = (0..5).map(|_| pool.next()).collect();
        assert_eq!(drawn, vec!["a", "b", "c", "a", "b"]);
    }

    #[test]
    fn test_key_pool_rejects_empty() {
        assert!(ApiKeyPool::new(vec![]).is_err());
        assert!(ApiKeyPool::new(vec!["  ".into()]).is_err());
    }
}
