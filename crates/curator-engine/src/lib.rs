pub mod config;
pub mod generation;
pub mod ledger;
pub mod pacing;
pub mod pricing;
pub mod providers;
pub mod refine;
pub mod review;
pub mod runner;
pub mod segment;
pub mod store;

use serde_json::{Map, Value};

pub use config::{BudgetPolicy, Quality, RunConfig};
pub use ledger::{BudgetExceeded, CostLedger};
pub use refine::{RefinementController, RefinementSession, SessionState};
pub use runner::{AssetPlan, CurationEngine, ModelChoice, RunPlan};
pub use segment::{segment, segment_rgb, BackgroundKind, SegmentationOptions};

pub(crate) fn map_object(value: Value) -> Map<String, Value> {
    value.as_object().cloned().unwrap_or_default()
}

pub(crate) fn now_utc_iso() -> String {
    chrono::Utc::now().to_rfc3339_opts(chrono::SecondsFormat::Micros, false)
}

pub fn error_chain_text(err: &anyhow::Error, max_chars: usize) -> String {
    let mut parts = Vec::new();
    for cause in err.chain() {
        let text = cause.to_string();
        let trimmed = text.trim();
        if trimmed.is_empty() {
            continue;
        }
        if parts
            .last()
            .map(|existing: &String| existing == trimmed)
            .unwrap_or(false)
        {
            continue;
        }
        parts.push(trimmed.to_string());
    }
    if parts.is_empty() {
        return truncate_text(&err.to_string(), max_chars);
    }
    truncate_text(&parts.join(" | caused by: "), max_chars)
}

pub(crate) fn truncate_text(value: &str, max_chars: usize) -> String {
    if value.chars().count() <= max_chars {
        return value.to_string();
    }
    value.chars().take(max_chars).collect::<String>() + "…"
}
