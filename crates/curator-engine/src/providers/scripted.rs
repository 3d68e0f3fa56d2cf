use std::collections::VecDeque;
use std::io::Cursor;
use std::sync::Mutex;

use image::{DynamicImage, ImageFormat, Rgb, RgbImage};
use serde_json::Map;

use super::{
    FailureKind, ImageGenerator, ImageRequest, ImageReviewer, ProviderFailure, ProviderImage,
    ReviewRequest,
};

/// White canvas with a centred dark square of side `square` (0 for none).
pub(crate) fn png_bytes(width: u32, height: u32, square: u32) -> Vec<u8> {
    let left = width.saturating_sub(square) / 2;
    let top = height.saturating_sub(square) / 2;
    let image = RgbImage::from_fn(width, height, |x, y| {
        let inside = (left..left + square).contains(&x) && (top..top + square).contains(&y);
        Rgb(if inside { [40, 60, 160] } else { [255, 255, 255] })
    });
    let mut bytes = Vec::new();
    let _ = DynamicImage::ImageRgb8(image).write_to(&mut Cursor::new(&mut bytes), ImageFormat::Png);
    bytes
}

/// Review text in the shape the scorer is asked to return.
pub(crate) fn review_text(overall: u8, suggested_prompt: Option<&str>) -> String {
    let payload = serde_json::json!({
        "overall_score": overall,
        "scores": {"style": overall, "palette": overall, "mood": overall, "technical": overall},
        "issues": ["edges are soft"],
        "suggestions": ["sharpen outline"],
        "suggested_prompt": suggested_prompt,
    });
    format!("```json\n{payload}\n```")
}

/// Replays a fixed script of responses and records every prompt it saw.
pub(crate) struct ScriptedGenerator {
    script: Mutex<VecDeque<Result<Vec<u8>, ProviderFailure>>>,
    prompts: Mutex<Vec<String>>,
}

impl ScriptedGenerator {
    pub(crate) fn new(script: Vec<Result<Vec<u8>, ProviderFailure>>) -> Self {
        Self {
            script: Mutex::new(script.into()),
            prompts: Mutex::new(Vec::new()),
        }
    }

    pub(crate) fn prompts(&self) -> Vec<String> {
        self.prompts.lock().map(|rows| rows.clone()).unwrap_or_default()
    }

    pub(crate) fn calls(&self) -> usize {
        self.prompts().len()
    }
}

impl ImageGenerator for ScriptedGenerator {
    fn name(&self) -> &str {
        "scripted"
    }

    fn generate(&self, request: &ImageRequest) -> Result<ProviderImage, ProviderFailure> {
        if let Ok(mut prompts) = self.prompts.lock() {
            prompts.push(request.prompt.clone());
        }
        let next = self
            .script
            .lock()
            .ok()
            .and_then(|mut script| script.pop_front())
            .unwrap_or_else(|| {
                Err(ProviderFailure::new(
                    FailureKind::Rejected,
                    "script exhausted",
                ))
            })?;
        Ok(ProviderImage {
            bytes: next,
            revised_prompt: None,
            provider_request: Map::new(),
            provider_response: Map::new(),
            warnings: Vec::new(),
        })
    }
}

pub(crate) struct ScriptedReviewer {
    script: Mutex<VecDeque<Result<String, ProviderFailure>>>,
    prompts: Mutex<Vec<String>>,
}

impl ScriptedReviewer {
    pub(crate) fn new(script: Vec<Result<String, ProviderFailure>>) -> Self {
        Self {
            script: Mutex::new(script.into()),
            prompts: Mutex::new(Vec::new()),
        }
    }

    pub(crate) fn calls(&self) -> usize {
        self.prompts.lock().map(|rows| rows.len()).unwrap_or_default()
    }
}

impl ImageReviewer for ScriptedReviewer {
    fn name(&self) -> &str {
        "scripted"
    }

    fn review(&self, request: &ReviewRequest<'_>) -> Result<String, ProviderFailure> {
        if let Ok(mut prompts) = self.prompts.lock() {
            prompts.push(request.prompt.to_string());
        }
        self.script
            .lock()
            .ok()
            .and_then(|mut script| script.pop_front())
            .unwrap_or_else(|| Ok(review_text(8, None)))
    }
}
