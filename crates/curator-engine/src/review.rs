use std::path::PathBuf;

use curator_contracts::catalog::AssetDescriptor;
use image::RgbaImage;
use serde::{Deserialize, Serialize};
use serde_json::{json, Map, Value};

use crate::ledger::{BudgetExceeded, CostLedger};
use crate::map_object;
use crate::pacing::{CallKind, CallPacer};
use crate::providers::{ImageReviewer, ReviewRequest};

pub const APPROVAL_THRESHOLD: u8 = 7;
pub const MALFORMED_SCORE: u8 = 5;

const STYLE_WEIGHT: f64 = 0.35;
const PALETTE_WEIGHT: f64 = 0.25;
const MOOD_WEIGHT: f64 = 0.15;
const TECHNICAL_WEIGHT: f64 = 0.25;
const MAX_LIST_ITEMS: usize = 8;
const MAX_LIST_CHARS: usize = 240;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct CriterionScores {
    pub style: u8,
    pub palette: u8,
    pub mood: u8,
    pub technical: u8,
}

impl CriterionScores {
    pub fn weighted_overall(&self) -> u8 {
        let weighted = STYLE_WEIGHT * f64::from(self.style)
            + PALETTE_WEIGHT * f64::from(self.palette)
            + MOOD_WEIGHT * f64::from(self.mood)
            + TECHNICAL_WEIGHT * f64::from(self.technical);
        (weighted.round() as u8).clamp(1, 10)
    }
}

/// Outcome of reading the scorer's text.
#[derive(Debug, Clone, PartialEq)]
pub enum ParsedReview {
    Parsed {
        scores: Option<CriterionScores>,
        overall_score: u8,
        issues: Vec<String>,
        suggestions: Vec<String>,
        suggested_prompt: Option<String>,
    },
    Malformed {
        reason: String,
    },
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ReviewResult {
    pub scores: Option<CriterionScores>,
    pub overall_score: u8,
    pub passed: bool,
    pub issues: Vec<String>,
    pub suggestions: Vec<String>,
    pub suggested_prompt: Option<String>,
    pub malformed: bool,
    pub malformed_reason: Option<String>,
    pub cost_usd: f64,
}

impl ReviewResult {
    pub fn malformed(reason: impl Into<String>) -> Self {
        Self {
            scores: None,
            overall_score: MALFORMED_SCORE,
            passed: false,
            issues: Vec::new(),
            suggestions: Vec::new(),
            suggested_prompt: None,
            malformed: true,
            malformed_reason: Some(reason.into()),
            cost_usd: 0.0,
        }
    }

    pub fn from_parsed(parsed: ParsedReview) -> Self {
        match parsed {
            ParsedReview::Parsed {
                scores,
                overall_score,
                issues,
                suggestions,
                suggested_prompt,
            } => Self {
                scores,
                overall_score,
                passed: overall_score >= APPROVAL_THRESHOLD,
                issues,
                suggestions,
                suggested_prompt,
                malformed: false,
                malformed_reason: None,
                cost_usd: 0.0,
            },
            ParsedReview::Malformed { reason } => Self::malformed(reason),
        }
    }

    pub fn to_payload(&self) -> Map<String, Value> {
        match serde_json::to_value(self) {
            Ok(Value::Object(map)) => map,
            _ => Map::new(),
        }
    }
}

/// Extracts the judgment from free text: code fences are stripped, then the
/// first `{` to the last `}` is tried.
pub fn parse_review(text: &str) -> ParsedReview {
    let Some(payload) = extract_json_object_from_text(text) else {
        return ParsedReview::Malformed {
            reason: if text.trim().is_empty() {
                "empty review response".to_string()
            } else {
                "no JSON object in review response".to_string()
            },
        };
    };

    let criteria = payload
        .get("scores")
        .and_then(Value::as_object)
        .unwrap_or(&payload);
    let scores = match (
        first_score(criteria, &["style", "style_match", "style_score"]),
        first_score(criteria, &["palette", "color_palette", "palette_score"]),
        first_score(criteria, &["mood", "mood_score"]),
        first_score(criteria, &["technical", "technical_quality", "technical_score"]),
    ) {
        (Some(style), Some(palette), Some(mood), Some(technical)) => Some(CriterionScores {
            style,
            palette,
            mood,
            technical,
        }),
        _ => None,
    };
    // The claimed overall only stands in when the criteria are incomplete.
    let claimed = || first_score(&payload, &["overall_score", "overallScore", "overall", "score"]);
    let Some(overall_score) = scores
        .map(|scores| scores.weighted_overall())
        .or_else(claimed)
    else {
        return ParsedReview::Malformed {
            reason: "review carried neither an overall score nor all criterion scores".to_string(),
        };
    };

    let suggested_prompt = ["suggested_prompt", "suggestedPrompt", "revised_prompt"]
        .iter()
        .find_map(|key| payload.get(*key).and_then(Value::as_str))
        .map(str::trim)
        .filter(|text| !text.is_empty())
        .map(str::to_string);

    ParsedReview::Parsed {
        scores,
        overall_score,
        issues: coerce_text_list(payload.get("issues"), MAX_LIST_ITEMS, MAX_LIST_CHARS),
        suggestions: coerce_text_list(payload.get("suggestions"), MAX_LIST_ITEMS, MAX_LIST_CHARS),
        suggested_prompt,
    }
}

/// One billed scoring call per [`review`](Self::review) against the fixed
/// reference set and rubric.
pub struct ReviewClient<'a> {
    ledger: &'a CostLedger,
    pacer: &'a CallPacer,
    reviewer: &'a dyn ImageReviewer,
    model: String,
    unit_cost_usd: f64,
    references: Vec<PathBuf>,
    style_guide: Option<String>,
}

impl<'a> ReviewClient<'a> {
    pub fn new(
        ledger: &'a CostLedger,
        pacer: &'a CallPacer,
        reviewer: &'a dyn ImageReviewer,
        model: impl Into<String>,
        unit_cost_usd: f64,
    ) -> Self {
        Self {
            ledger,
            pacer,
            reviewer,
            model: model.into(),
            unit_cost_usd,
            references: Vec::new(),
            style_guide: None,
        }
    }

    pub fn with_references(mut self, references: Vec<PathBuf>) -> Self {
        self.references = references;
        self
    }

    pub fn with_style_guide(mut self, style_guide: Option<String>) -> Self {
        self.style_guide = style_guide;
        self
    }

    pub fn model(&self) -> &str {
        &self.model
    }

    pub fn unit_cost_usd(&self) -> f64 {
        self.unit_cost_usd
    }

    pub fn rubric(&self, asset: &AssetDescriptor) -> String {
        let style_guide = self
            .style_guide
            .as_deref()
            .map(str::trim)
            .filter(|text| !text.is_empty())
            .unwrap_or("Match the reference images.");
        format!(
            "You are the art director for a game's asset library. Judge whether the candidate \
asset fits the established style.\n\
Style guide: {style_guide}\n\
Asset: {id} ({category})\n\
Generation prompt: {prompt}\n\n\
Score each criterion from 1 to 10:\n\
- style ({style_w}%): line work, rendering, and shape language match the references\n\
- palette ({palette_w}%): colours sit inside the reference palette\n\
- mood ({mood_w}%): tone and atmosphere match the references\n\
- technical ({technical_w}%): clean edges, no artifacts, readable at small sizes\n\
An overall score of {threshold} or more approves the asset.\n\n\
Reply with JSON only:\n\
{{\"overall_score\": 1-10, \"scores\": {{\"style\": n, \"palette\": n, \"mood\": n, \"technical\": n}}, \
\"issues\": [..], \"suggestions\": [..], \"suggested_prompt\": \"full revised prompt or null\"}}",
            id = asset.id,
            category = asset.category,
            prompt = asset.prompt,
            style_w = (STYLE_WEIGHT * 100.0).round(),
            palette_w = (PALETTE_WEIGHT * 100.0).round(),
            mood_w = (MOOD_WEIGHT * 100.0).round(),
            technical_w = (TECHNICAL_WEIGHT * 100.0).round(),
            threshold = APPROVAL_THRESHOLD,
        )
    }

    /// Failed calls and unreadable replies come back as a malformed result;
    /// only the ledger can stop a review.
    pub fn review(
        &self,
        candidate: &RgbaImage,
        asset: &AssetDescriptor,
    ) -> Result<ReviewResult, BudgetExceeded> {
        let reservation = self.ledger.try_reserve(self.unit_cost_usd)?;
        let rubric = self.rubric(asset);
        let request = ReviewRequest {
            asset_id: &asset.id,
            category: asset.category,
            prompt: &asset.prompt,
            candidate,
            references: &self.references,
            rubric: &rubric,
            model: &self.model,
        };

        self.pacer.wait(CallKind::Review);
        match self.reviewer.review(&request) {
            Ok(text) => {
                let cost_usd = reservation.commit();
                let mut result = ReviewResult::from_parsed(parse_review(&text));
                result.cost_usd = cost_usd;
                Ok(result)
            }
            Err(failure) => {
                let cost_usd = if failure.charged {
                    reservation.commit()
                } else {
                    reservation.release();
                    0.0
                };
                let mut result = ReviewResult::malformed(format!("review call failed: {failure}"));
                result.cost_usd = cost_usd;
                Ok(result)
            }
        }
    }
}

fn first_score(payload: &Map<String, Value>, keys: &[&str]) -> Option<u8> {
    keys.iter()
        .find_map(|key| payload.get(*key).and_then(score_value))
}

/// Numbers or numeric strings, rounded and clamped to 1..=10.
fn score_value(value: &Value) -> Option<u8> {
    let raw = match value {
        Value::Number(number) => number.as_f64(),
        Value::String(text) => text
            .trim()
            .trim_end_matches("/10")
            .trim()
            .parse::<f64>()
            .ok(),
        _ => None,
    }?;
    if !raw.is_finite() {
        return None;
    }
    Some(raw.round().clamp(1.0, 10.0) as u8)
}

fn strip_code_fence(text: &str) -> String {
    let raw = text.trim();
    if !(raw.starts_with("```") && raw.ends_with("```")) {
        return raw.to_string();
    }
    let lines: Vec<&str> = raw.lines().collect();
    if lines.len() < 2 {
        return raw.to_string();
    }
    let mut body = lines[1..lines.len() - 1].join("\n").trim().to_string();
    if body.to_ascii_lowercase().starts_with("json") {
        body = body[4..].trim().to_string();
    }
    body
}

fn extract_json_object_from_text(text: &str) -> Option<Map<String, Value>> {
    let raw = strip_code_fence(text);
    if raw.trim().is_empty() {
        return None;
    }
    let mut candidates = vec![raw.clone()];
    if let (Some(start), Some(end)) = (raw.find('{'), raw.rfind('}')) {
        if end > start {
            candidates.push(raw[start..=end].to_string());
        }
    }
    for candidate in candidates {
        if let Ok(parsed) = serde_json::from_str::<Value>(&candidate) {
            if let Some(object) = parsed.as_object() {
                return Some(object.clone());
            }
        }
    }
    None
}

fn coerce_text_list(value: Option<&Value>, max_items: usize, max_chars: usize) -> Vec<String> {
    let Some(value) = value else {
        return Vec::new();
    };
    let raw_items: Vec<String> = match value {
        Value::Array(rows) => rows
            .iter()
            .filter_map(Value::as_str)
            .map(str::to_string)
            .collect(),
        Value::String(text) => text.split(';').map(str::to_string).collect(),
        _ => Vec::new(),
    };

    let mut cleaned: Vec<String> = Vec::new();
    for row in raw_items {
        let text = row.split_whitespace().collect::<Vec<&str>>().join(" ");
        if text.is_empty() || cleaned.iter().any(|existing| existing == &text) {
            continue;
        }
        cleaned.push(text.chars().take(max_chars).collect());
        if cleaned.len() >= max_items {
            break;
        }
    }
    cleaned
}

/// Review payload for events, without the raw lists.
pub fn review_event_payload(result: &ReviewResult) -> Map<String, Value> {
    map_object(json!({
        "overall_score": result.overall_score,
        "passed": result.passed,
        "malformed": result.malformed,
        "scores": result.scores,
        "has_suggested_prompt": result.suggested_prompt.is_some(),
        "cost_usd": result.cost_usd,
    }))
}
