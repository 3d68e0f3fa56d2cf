use std::path::PathBuf;
use std::time::Duration;

use anyhow::{bail, Result};
use serde::{Deserialize, Serialize};
use serde_json::{json, Map, Value};

use crate::map_object;
use crate::segment::SegmentationOptions;

pub const DEFAULT_MAX_ITERATIONS: u32 = 3;
pub const DEFAULT_BUDGET_LIMIT_USD: f64 = 5.0;
pub const DEFAULT_CALL_DELAY: Duration = Duration::from_secs(2);
pub const DEFAULT_REQUEST_TIMEOUT: Duration = Duration::from_secs(120);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Quality {
    Low,
    #[default]
    Medium,
    High,
}

impl Quality {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Low => "low",
            Self::Medium => "medium",
            Self::High => "high",
        }
    }

    pub fn parse(raw: &str) -> Option<Self> {
        match raw.trim().to_ascii_lowercase().as_str() {
            "low" | "draft" | "fast" => Some(Self::Low),
            "medium" | "standard" => Some(Self::Medium),
            "high" | "hd" | "quality" => Some(Self::High),
            _ => None,
        }
    }
}

/// What happens to the rest of the batch once the ledger refuses a call.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BudgetPolicy {
    /// Stop scheduling new sessions.
    #[default]
    Run,
    /// End only the session that hit the limit.
    Session,
}

impl BudgetPolicy {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Run => "run",
            Self::Session => "session",
        }
    }

    pub fn parse(raw: &str) -> Option<Self> {
        match raw.trim().to_ascii_lowercase().as_str() {
            "run" | "abort" | "abort-run" => Some(Self::Run),
            "session" | "asset" => Some(Self::Session),
            _ => None,
        }
    }
}

#[derive(Debug, Clone)]
pub struct RunConfig {
    pub out_dir: PathBuf,
    pub max_iterations: u32,
    pub budget_limit_usd: f64,
    pub quality: Quality,
    pub call_delay: Duration,
    pub request_timeout: Duration,
    pub budget_policy: BudgetPolicy,
    pub workers: usize,
    pub segmentation: SegmentationOptions,
    pub image_model: Option<String>,
    pub vision_model: Option<String>,
    pub generation_cost_usd: Option<f64>,
    pub review_cost_usd: Option<f64>,
}

impl RunConfig {
    pub fn new(out_dir: impl Into<PathBuf>) -> Self {
        Self {
            out_dir: out_dir.into(),
            max_iterations: DEFAULT_MAX_ITERATIONS,
            budget_limit_usd: DEFAULT_BUDGET_LIMIT_USD,
            quality: Quality::default(),
            call_delay: DEFAULT_CALL_DELAY,
            request_timeout: DEFAULT_REQUEST_TIMEOUT,
            budget_policy: BudgetPolicy::default(),
            workers: 1,
            segmentation: SegmentationOptions::default(),
            image_model: None,
            vision_model: None,
            generation_cost_usd: None,
            review_cost_usd: None,
        }
    }

    pub fn validate(&self) -> Result<()> {
        if self.max_iterations == 0 {
            bail!("max iterations must be at least 1");
        }
        if !self.budget_limit_usd.is_finite() || self.budget_limit_usd < 0.0 {
            bail!("budget limit must be a non-negative amount");
        }
        if self.workers == 0 {
            bail!("workers must be at least 1");
        }
        if self.request_timeout.is_zero() {
            bail!("request timeout must be greater than zero");
        }
        for (label, cost) in [
            ("generation cost", self.generation_cost_usd),
            ("review cost", self.review_cost_usd),
        ] {
            if let Some(cost) = cost {
                if !cost.is_finite() || cost < 0.0 {
                    bail!("{label} must be a non-negative amount");
                }
            }
        }
        Ok(())
    }

    pub fn to_payload(&self) -> Map<String, Value> {
        map_object(json!({
            "out_dir": self.out_dir.to_string_lossy().to_string(),
            "max_iterations": self.max_iterations,
            "budget_limit_usd": self.budget_limit_usd,
            "quality": self.quality.as_str(),
            "call_delay_s": self.call_delay.as_secs_f64(),
            "request_timeout_s": self.request_timeout.as_secs_f64(),
            "budget_policy": self.budget_policy.as_str(),
            "workers": self.workers,
            "segmentation": {
                "tolerance": self.segmentation.tolerance,
                "force": self.segmentation.force,
                "seed_stride": self.segmentation.seed_stride,
                "trim": self.segmentation.trim,
                "margin": self.segmentation.margin,
                "hint": self.segmentation.hint.map(|kind| kind.as_str()),
            },
        }))
    }
}
