use std::path::{Path, PathBuf};

use chrono::{SecondsFormat, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use similar::TextDiff;
use uuid::Uuid;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AttemptEntry {
    pub iteration: u32,
    pub prompt: String,
    pub prompt_diff: Option<Vec<String>>,
    pub generation: Map<String, Value>,
    pub review: Option<Map<String, Value>>,
    pub artifact_path: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TransitionEntry {
    pub iteration: u32,
    pub from: String,
    pub to: String,
    pub note: Option<String>,
    pub at: String,
}

/// Per-asset audit trail, persisted as `sessions/<asset_id>.json`.
#[derive(Debug, Clone, PartialEq)]
pub struct SessionLog {
    pub path: PathBuf,
    pub schema_version: u64,
    pub session_id: String,
    pub asset_id: String,
    pub created_at: String,
    pub attempts: Vec<AttemptEntry>,
    pub transitions: Vec<TransitionEntry>,
    pub terminal_state: Option<String>,
    pub terminal_reason: Option<String>,
}

impl SessionLog {
    pub fn new(path: impl Into<PathBuf>, asset_id: impl Into<String>) -> Self {
        Self {
            path: path.into(),
            schema_version: 1,
            session_id: Uuid::new_v4().to_string(),
            asset_id: asset_id.into(),
            created_at: now_utc_iso(),
            attempts: Vec::new(),
            transitions: Vec::new(),
            terminal_state: None,
            terminal_reason: None,
        }
    }

    pub fn load(path: impl Into<PathBuf>) -> Self {
        let path = path.into();
        let mut log = Self::new(path.clone(), "");
        let payload = read_json(&path).unwrap_or(Value::Object(Map::new()));
        let Some(obj) = payload.as_object() else {
            return log;
        };

        log.schema_version = obj
            .get("schema_version")
            .and_then(Value::as_u64)
            .unwrap_or(log.schema_version);
        let text = |key: &str| obj.get(key).and_then(Value::as_str).map(str::to_string);
        log.session_id = text("session_id").unwrap_or(log.session_id);
        log.asset_id = text("asset_id").unwrap_or_default();
        log.created_at = text("created_at").unwrap_or(log.created_at);
        log.terminal_state = text("terminal_state");
        log.terminal_reason = text("terminal_reason");

        if let Some(rows) = obj.get("attempts").and_then(Value::as_array) {
            log.attempts = rows
                .iter()
                .filter_map(|row| serde_json::from_value::<AttemptEntry>(row.clone()).ok())
                .collect();
        }
        if let Some(rows) = obj.get("transitions").and_then(Value::as_array) {
            log.transitions = rows
                .iter()
                .filter_map(|row| serde_json::from_value::<TransitionEntry>(row.clone()).ok())
                .collect();
        }
        log
    }

    /// Appends an attempt; the prompt diff is taken against the previous attempt.
    pub fn record_attempt(
        &mut self,
        iteration: u32,
        prompt: &str,
        generation: Map<String, Value>,
        review: Option<Map<String, Value>>,
        artifact_path: Option<&Path>,
    ) -> &AttemptEntry {
        let prev = self.attempts.last().map(|entry| entry.prompt.as_str());
        let prompt_diff = prompt_diff(prev, prompt);
        self.attempts.push(AttemptEntry {
            iteration,
            prompt: prompt.to_string(),
            prompt_diff,
            generation,
            review,
            artifact_path: artifact_path.map(|path| path.to_string_lossy().to_string()),
        });
        &self.attempts[self.attempts.len() - 1]
    }

    pub fn record_transition(&mut self, iteration: u32, from: &str, to: &str, note: Option<&str>) {
        self.transitions.push(TransitionEntry {
            iteration,
            from: from.to_string(),
            to: to.to_string(),
            note: note.map(str::to_string),
            at: now_utc_iso(),
        });
    }

    pub fn finish(&mut self, state: &str, reason: Option<&str>) {
        self.terminal_state = Some(state.to_string());
        self.terminal_reason = reason.map(str::to_string);
    }

    pub fn save(&self) -> anyhow::Result<()> {
        let mut payload = Map::new();
        payload.insert(
            "schema_version".to_string(),
            Value::Number(self.schema_version.into()),
        );
        payload.insert(
            "session_id".to_string(),
            Value::String(self.session_id.clone()),
        );
        payload.insert("asset_id".to_string(), Value::String(self.asset_id.clone()));
        payload.insert(
            "created_at".to_string(),
            Value::String(self.created_at.clone()),
        );
        payload.insert("attempts".to_string(), serde_json::to_value(&self.attempts)?);
        payload.insert(
            "transitions".to_string(),
            serde_json::to_value(&self.transitions)?,
        );
        let optional = |value: &Option<String>| {
            value
                .as_ref()
                .map(|text| Value::String(text.clone()))
                .unwrap_or(Value::Null)
        };
        payload.insert(
            "terminal_state".to_string(),
            optional(&self.terminal_state),
        );
        payload.insert(
            "terminal_reason".to_string(),
            optional(&self.terminal_reason),
        );

        write_json(&self.path, Value::Object(payload))
    }
}

fn prompt_diff(prev: Option<&str>, curr: &str) -> Option<Vec<String>> {
    let prev = prev?;
    if prev == curr {
        return None;
    }
    let diff = TextDiff::from_words(prev, curr);
    let rendered = diff.unified_diff().header("prev", "curr").to_string();
    let lines = rendered
        .lines()
        .map(str::to_string)
        .collect::<Vec<String>>();
    Some(lines)
}

fn now_utc_iso() -> String {
    Utc::now().to_rfc3339_opts(SecondsFormat::Micros, false)
}

fn read_json(path: &Path) -> anyhow::Result<Value> {
    let raw = std::fs::read_to_string(path)?;
    Ok(serde_json::from_str(&raw)?)
}

fn write_json(path: &Path, payload: Value) -> anyhow::Result<()> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    std::fs::write(path, serde_json::to_string_pretty(&payload)?)?;
    Ok(())
}
