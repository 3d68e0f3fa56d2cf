use std::collections::BTreeMap;
use std::env;
use std::fs;
use std::path::PathBuf;

use serde_json::{Map, Value};

use crate::config::Quality;

const DEFAULT_PRICING_TABLES_JSON: &str = include_str!("../resources/default_pricing.json");

/// Per-model unit prices keyed by a model's pricing key.
#[derive(Debug, Clone, Default)]
pub struct PricingTables {
    rows: BTreeMap<String, Map<String, Value>>,
}

impl PricingTables {
    /// Embedded defaults merged with `~/.curator/pricing_overrides.json`.
    pub fn load() -> Self {
        let mut tables = Self::from_json(DEFAULT_PRICING_TABLES_JSON);
        if let Some(path) = pricing_override_path() {
            if let Ok(raw) = fs::read_to_string(path) {
                tables.merge_json(&raw);
            }
        }
        tables
    }

    pub fn from_json(raw: &str) -> Self {
        let mut tables = Self::default();
        tables.merge_json(raw);
        tables
    }

    /// Field-level merge; malformed input is ignored.
    pub fn merge_json(&mut self, raw: &str) {
        let Ok(payload) = serde_json::from_str::<Value>(raw) else {
            return;
        };
        let Some(table) = payload.as_object() else {
            return;
        };
        for (pricing_key, row_value) in table {
            let Some(row) = row_value.as_object() else {
                continue;
            };
            let entry = self.rows.entry(pricing_key.to_string()).or_default();
            for (field, field_value) in row {
                entry.insert(field.to_string(), field_value.clone());
            }
        }
    }

    pub fn row(&self, pricing_key: &str) -> Option<&Map<String, Value>> {
        self.rows.get(pricing_key)
    }

    pub fn generation_cost(&self, pricing_key: Option<&str>, quality: Quality) -> Option<f64> {
        let row = self.row(pricing_key.map(str::trim).filter(|key| !key.is_empty())?)?;
        if let Some(cost) = row
            .get("cost_per_image_usd_by_quality")
            .and_then(Value::as_object)
            .and_then(|tiers| tiers.get(quality.as_str()))
            .and_then(parse_value_to_f64)
        {
            return Some(cost);
        }
        row.get("cost_per_image_usd").and_then(parse_value_to_f64)
    }

    pub fn review_cost(&self, pricing_key: Option<&str>) -> Option<f64> {
        let row = self.row(pricing_key.map(str::trim).filter(|key| !key.is_empty())?)?;
        row.get("cost_per_call_usd").and_then(parse_value_to_f64)
    }
}

fn pricing_override_path() -> Option<PathBuf> {
    env::var_os("HOME")
        .map(PathBuf::from)
        .map(|home| home.join(".curator").join("pricing_overrides.json"))
}

fn parse_value_to_f64(value: &Value) -> Option<f64> {
    match value {
        Value::Number(number) => number.as_f64(),
        Value::String(text) => text.trim().parse::<f64>().ok(),
        _ => None,
    }
    .filter(|cost| cost.is_finite() && *cost >= 0.0)
}
