use std::fs::OpenOptions;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

use chrono::{SecondsFormat, Utc};
use serde_json::{Map, Value};

pub type EventPayload = Map<String, Value>;

pub const RUN_STARTED: &str = "run_started";
pub const ASSET_STARTED: &str = "asset_started";
pub const GENERATION_COMPLETED: &str = "generation_completed";
pub const GENERATION_FAILED: &str = "generation_failed";
pub const SEGMENTATION_SKIPPED: &str = "segmentation_skipped";
pub const REVIEW_COMPLETED: &str = "review_completed";
pub const PROMPT_REVISED: &str = "prompt_revised";
pub const BUDGET_EXCEEDED: &str = "budget_exceeded";
pub const ASSET_FINISHED: &str = "asset_finished";
pub const RUN_FINISHED: &str = "run_finished";

/// Append-only writer for `events.jsonl`.
///
/// - default fields are `type`, `run_id`, `ts`
/// - caller payload is merged last and can override defaults
/// - one compact JSON object per line
///
/// Clones share one file lock, so sessions running on worker threads can emit
/// through the same writer without interleaving partial lines.
#[derive(Debug, Clone)]
pub struct EventWriter {
    inner: Arc<EventWriterInner>,
}

#[derive(Debug)]
struct EventWriterInner {
    path: PathBuf,
    run_id: String,
    lock: Mutex<()>,
}

impl EventWriter {
    pub fn new(path: impl Into<PathBuf>, run_id: impl Into<String>) -> Self {
        Self {
            inner: Arc::new(EventWriterInner {
                path: path.into(),
                run_id: run_id.into(),
                lock: Mutex::new(()),
            }),
        }
    }

    pub fn path(&self) -> &Path {
        &self.inner.path
    }

    pub fn run_id(&self) -> &str {
        &self.inner.run_id
    }

    pub fn emit(&self, event_type: &str, payload: EventPayload) -> anyhow::Result<Value> {
        let mut event = Map::new();
        event.insert("type".to_string(), Value::String(event_type.to_string()));
        event.insert(
            "run_id".to_string(),
            Value::String(self.inner.run_id.clone()),
        );
        event.insert("ts".to_string(), Value::String(now_utc_iso()));
        for (key, value) in payload {
            event.insert(key, value);
        }

        if let Some(parent) = self.inner.path.parent() {
            std::fs::create_dir_all(parent)?;
        }

        let line = serde_json::to_string(&event)?;
        let _guard = self
            .inner
            .lock
            .lock()
            .map_err(|_| anyhow::anyhow!("event writer lock poisoned"))?;
        let mut file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.inner.path)?;
        file.write_all(line.as_bytes())?;
        file.write_all(b"\n")?;

        Ok(Value::Object(event))
    }

    /// Emits an event tagged with `asset_id` and `iteration`.
    pub fn emit_for_asset(
        &self,
        event_type: &str,
        asset_id: &str,
        iteration: u32,
        mut payload: EventPayload,
    ) -> anyhow::Result<Value> {
        payload
            .entry("asset_id")
            .or_insert_with(|| Value::String(asset_id.to_string()));
        payload
            .entry("iteration")
            .or_insert_with(|| Value::Number(iteration.into()));
        self.emit(event_type, payload)
    }

    /// Reads back every event type in file order. Unparseable lines are skipped.
    pub fn read_types(&self) -> anyhow::Result<Vec<String>> {
        let raw = match std::fs::read_to_string(&self.inner.path) {
            Ok(raw) => raw,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(err) => return Err(err.into()),
        };
        Ok(raw
            .lines()
            .filter_map(|line| serde_json::from_str::<Value>(line).ok())
            .filter_map(|row| row.get("type").and_then(Value::as_str).map(str::to_string))
            .collect())
    }
}

fn now_utc_iso() -> String {
    Utc::now().to_rfc3339_opts(SecondsFormat::Micros, false)
}
