use std::path::Path;

use chrono::{SecondsFormat, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunSummary {
    pub run_id: String,
    pub started_at: String,
    pub finished_at: String,
    pub approved: u64,
    pub exhausted: u64,
    pub failed: u64,
    pub spent_usd: f64,
    pub limit_usd: f64,
    pub budget_exceeded: bool,
    pub assets: Vec<Map<String, Value>>,
}

impl RunSummary {
    pub fn total(&self) -> u64 {
        self.approved + self.exhausted + self.failed
    }

    /// One-line human summary for the CLI.
    pub fn headline(&self) -> String {
        format!(
            "{} approved, {} needs work, {} failed; spent ${:.2} of ${:.2}",
            self.approved, self.exhausted, self.failed, self.spent_usd, self.limit_usd
        )
    }
}

pub fn write_summary(
    path: &Path,
    summary: &RunSummary,
    extra: Option<&Map<String, Value>>,
) -> anyhow::Result<()> {
    let mut payload = match serde_json::to_value(summary)? {
        Value::Object(map) => map,
        _ => Map::new(),
    };
    payload.insert("total".to_string(), Value::Number(summary.total().into()));
    payload.insert("ts".to_string(), Value::String(now_utc_iso()));
    if let Some(extra) = extra {
        for (key, value) in extra {
            payload.insert(key.clone(), value.clone());
        }
    }

    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    std::fs::write(path, serde_json::to_string_pretty(&Value::Object(payload))?)?;
    Ok(())
}

fn now_utc_iso() -> String {
    Utc::now().to_rfc3339_opts(SecondsFormat::Micros, false)
}

#[cfg(test)]
mod tests {
    use serde_json::{json, Map, Value};

    use super::{write_summary, RunSummary};

    #[test]
    fn write_summary_generates_expected_payload() -> anyhow::Result<()> {
        let temp = tempfile::tempdir()?;
        let path = temp.path().join("summary.json");

        let mut asset = Map::new();
        asset.insert("asset_id".to_string(), json!("coin"));
        asset.insert("state".to_string(), json!("approved"));
        let summary = RunSummary {
            run_id: "run-123".to_string(),
            started_at: "2026-02-19T00:00:00+00:00".to_string(),
            finished_at: "2026-02-19T00:10:00+00:00".to_string(),
            approved: 1,
            exhausted: 2,
            failed: 0,
            spent_usd: 0.5,
            limit_usd: 5.0,
            budget_exceeded: false,
            assets: vec![asset],
        };
        let mut extra = Map::new();
        extra.insert("extra_key".to_string(), Value::String("extra".to_string()));
        write_summary(&path, &summary, Some(&extra))?;

        let parsed: Value = serde_json::from_str(&std::fs::read_to_string(path)?)?;
        assert_eq!(parsed["run_id"], json!("run-123"));
        assert_eq!(parsed["approved"], json!(1));
        assert_eq!(parsed["total"], json!(3));
        assert_eq!(parsed["assets"][0]["asset_id"], json!("coin"));
        assert_eq!(parsed["extra_key"], json!("extra"));
        assert!(parsed.get("ts").and_then(Value::as_str).is_some());
        assert_eq!(
            summary.headline(),
            "1 approved, 2 needs work, 0 failed; spent $0.50 of $5.00"
        );
        Ok(())
    }
}
