use std::env;
use std::fmt;
use std::path::PathBuf;
use std::time::Duration;

use anyhow::{bail, Result};
use curator_contracts::catalog::AssetCategory;
use curator_contracts::models::ModelSpec;
use image::RgbaImage;
use reqwest::blocking::Response as HttpResponse;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use thiserror::Error;

use crate::config::Quality;
use crate::{error_chain_text, truncate_text};

pub mod dryrun;
pub mod openai;
#[cfg(test)]
pub(crate) mod scripted;

pub use dryrun::{DryrunGenerator, DryrunReviewer};
pub use openai::{OpenAiGenerator, OpenAiReviewer};

#[derive(Debug, Clone, PartialEq)]
pub struct ImageRequest {
    pub asset_id: String,
    pub category: AssetCategory,
    pub prompt: String,
    pub size: String,
    pub quality: Quality,
    pub model: String,
}

#[derive(Debug, Clone)]
pub struct ProviderImage {
    pub bytes: Vec<u8>,
    pub revised_prompt: Option<String>,
    pub provider_request: Map<String, Value>,
    pub provider_response: Map<String, Value>,
    pub warnings: Vec<String>,
}

#[derive(Debug, Clone)]
pub struct ReviewRequest<'a> {
    pub asset_id: &'a str,
    pub category: AssetCategory,
    pub prompt: &'a str,
    pub candidate: &'a RgbaImage,
    pub references: &'a [PathBuf],
    pub rubric: &'a str,
    pub model: &'a str,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureKind {
    Timeout,
    Transport,
    RateLimited,
    Server,
    ContentPolicy,
    Auth,
    Rejected,
    MalformedResponse,
}

impl FailureKind {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Timeout => "timeout",
            Self::Transport => "transport",
            Self::RateLimited => "rate_limited",
            Self::Server => "server",
            Self::ContentPolicy => "content_policy",
            Self::Auth => "auth",
            Self::Rejected => "rejected",
            Self::MalformedResponse => "malformed_response",
        }
    }

    /// Transient failures worth another iteration with the same prompt.
    pub fn is_retryable(self) -> bool {
        matches!(
            self,
            Self::Timeout
                | Self::Transport
                | Self::RateLimited
                | Self::Server
                | Self::MalformedResponse
        )
    }

    /// Maps a non-success HTTP status and its body.
    pub fn from_status(code: u16, body: &str) -> Self {
        let lowered = body.to_ascii_lowercase();
        match code {
            408 => Self::Timeout,
            429 => Self::RateLimited,
            401 | 403 => Self::Auth,
            400 if ["content_policy", "safety", "moderation"]
                .iter()
                .any(|marker| lowered.contains(marker)) =>
            {
                Self::ContentPolicy
            }
            500..=599 => Self::Server,
            _ => Self::Rejected,
        }
    }
}

impl fmt::Display for FailureKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A provider call that did not yield a usable result.
///
/// `charged` marks failures the service billed for (for example an accepted
/// request whose image bytes could not be decoded).
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("{kind}: {message}")]
pub struct ProviderFailure {
    pub kind: FailureKind,
    pub message: String,
    pub charged: bool,
}

impl ProviderFailure {
    pub fn new(kind: FailureKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
            charged: false,
        }
    }

    pub fn charged(mut self) -> Self {
        self.charged = true;
        self
    }

    pub fn from_status(provider: &str, code: u16, body: &str) -> Self {
        Self::new(
            FailureKind::from_status(code, body),
            format!(
                "{provider} request failed ({code}): {}",
                truncate_text(body, 512)
            ),
        )
    }

    pub fn from_transport(provider: &str, err: &anyhow::Error) -> Self {
        let timed_out = err.chain().any(|cause| {
            cause
                .downcast_ref::<reqwest::Error>()
                .map(reqwest::Error::is_timeout)
                .unwrap_or(false)
        });
        let kind = if timed_out {
            FailureKind::Timeout
        } else {
            FailureKind::Transport
        };
        Self::new(
            kind,
            format!("{provider}: {}", error_chain_text(err, 512)),
        )
    }
}

pub trait ImageGenerator: Send + Sync {
    fn name(&self) -> &str;
    fn generate(&self, request: &ImageRequest) -> Result<ProviderImage, ProviderFailure>;
}

pub trait ImageReviewer: Send + Sync {
    fn name(&self) -> &str;
    /// Returns the scorer's raw text; parsing is the caller's concern.
    fn review(&self, request: &ReviewRequest<'_>) -> Result<String, ProviderFailure>;
}

pub fn build_generator(model: &ModelSpec, timeout: Duration) -> Result<Box<dyn ImageGenerator>> {
    match model.provider.as_str() {
        "dryrun" => Ok(Box::new(DryrunGenerator)),
        "openai" => Ok(Box::new(OpenAiGenerator::from_env(timeout)?)),
        other => bail!("no image generator for provider '{other}'"),
    }
}

pub fn build_reviewer(model: &ModelSpec, timeout: Duration) -> Result<Box<dyn ImageReviewer>> {
    match model.provider.as_str() {
        "dryrun" => Ok(Box::new(DryrunReviewer)),
        "openai" => Ok(Box::new(OpenAiReviewer::from_env(timeout)?)),
        other => bail!("no image reviewer for provider '{other}'"),
    }
}

/// Reads the body of a JSON response, classifying non-success statuses.
pub(crate) fn response_json_or_failure(
    provider: &str,
    response: HttpResponse,
) -> Result<(u16, Value), ProviderFailure> {
    let status = response.status();
    let code = status.as_u16();
    let body = response.text().map_err(|err| {
        ProviderFailure::from_transport(provider, &anyhow::Error::new(err))
    })?;
    if !status.is_success() {
        return Err(ProviderFailure::from_status(provider, code, &body));
    }
    let parsed = serde_json::from_str::<Value>(&body).map_err(|err| {
        ProviderFailure::new(
            FailureKind::MalformedResponse,
            format!("{provider} returned invalid JSON payload: {err}"),
        )
        .charged()
    })?;
    Ok((code, parsed))
}

pub(crate) fn non_empty_env(key: &str) -> Option<String> {
    env::var(key)
        .ok()
        .map(|value| value.trim().to_string())
        .filter(|value| !value.is_empty())
}
