use curator_contracts::catalog::{AssetCategory, AssetDescriptor};
use image::{DynamicImage, RgbImage, RgbaImage};
use serde_json::{json, Map, Value};

use crate::config::Quality;
use crate::ledger::{BudgetExceeded, CostLedger};
use crate::map_object;
use crate::pacing::{CallKind, CallPacer};
use crate::providers::{FailureKind, ImageGenerator, ImageRequest, ProviderFailure};
use crate::segment::{segment_rgb, SegmentationError, SegmentationOptions, SegmentationResult};

pub const WIDE_SIZE: &str = "1536x1024";
pub const SQUARE_SIZE: &str = "1024x1024";

/// Category size policy; a descriptor override always wins.
pub fn resolve_size(asset: &AssetDescriptor) -> String {
    if let Some(size) = asset
        .target_size
        .as_deref()
        .map(str::trim)
        .filter(|size| !size.is_empty())
    {
        return size.to_ascii_lowercase();
    }
    match asset.category {
        AssetCategory::Background | AssetCategory::Button | AssetCategory::TextOverlay => {
            WIDE_SIZE.to_string()
        }
        AssetCategory::Icon | AssetCategory::Frame | AssetCategory::CosmeticPreview => {
            SQUARE_SIZE.to_string()
        }
    }
}

pub fn compose_prompt(asset: &AssetDescriptor) -> String {
    match asset
        .negative_prompt
        .as_deref()
        .map(str::trim)
        .filter(|negative| !negative.is_empty())
    {
        Some(negative) => format!("{}\n\nAvoid: {negative}", asset.prompt.trim()),
        None => asset.prompt.trim().to_string(),
    }
}

#[derive(Debug, Clone)]
pub enum SegmentationOutcome {
    /// Category keeps its opaque frame.
    NotApplicable,
    Segmented(SegmentationResult),
    /// Segmentation failed; the opaque bitmap is used as-is.
    Skipped(SegmentationError),
}

#[derive(Debug, Clone)]
pub struct GeneratedAsset {
    pub bitmap: RgbImage,
    pub segmentation: SegmentationOutcome,
}

impl GeneratedAsset {
    /// The image to persist and review.
    pub fn final_image(&self) -> RgbaImage {
        match &self.segmentation {
            SegmentationOutcome::Segmented(result) => result.image.clone(),
            SegmentationOutcome::NotApplicable | SegmentationOutcome::Skipped(_) => {
                DynamicImage::ImageRgb8(self.bitmap.clone()).to_rgba8()
            }
        }
    }

    pub fn segmentation_payload(&self) -> Value {
        match &self.segmentation {
            SegmentationOutcome::NotApplicable => json!({"status": "not_applicable"}),
            SegmentationOutcome::Segmented(result) => {
                let mut payload = result.diagnostics();
                payload.insert("status".to_string(), json!("segmented"));
                Value::Object(payload)
            }
            SegmentationOutcome::Skipped(err) => json!({
                "status": "skipped",
                "reason": err.to_string(),
            }),
        }
    }
}

#[derive(Debug, Clone)]
pub struct GenerationResult {
    pub prompt_sent: String,
    pub revised_prompt: Option<String>,
    pub size: String,
    pub cost_usd: f64,
    pub outcome: Result<GeneratedAsset, ProviderFailure>,
    pub provider_request: Map<String, Value>,
    pub provider_response: Map<String, Value>,
    pub warnings: Vec<String>,
}

impl GenerationResult {
    /// Compact record for events and session logs.
    pub fn summary(&self) -> Map<String, Value> {
        let mut summary = map_object(json!({
            "prompt_sent": self.prompt_sent,
            "size": self.size,
            "cost_usd": self.cost_usd,
        }));
        if let Some(revised) = self.revised_prompt.as_ref() {
            summary.insert("revised_prompt".to_string(), json!(revised));
        }
        match &self.outcome {
            Ok(asset) => {
                summary.insert("status".to_string(), json!("ok"));
                summary.insert(
                    "bitmap_size".to_string(),
                    json!(format!("{}x{}", asset.bitmap.width(), asset.bitmap.height())),
                );
                summary.insert("segmentation".to_string(), asset.segmentation_payload());
            }
            Err(failure) => {
                summary.insert("status".to_string(), json!("failed"));
                summary.insert("error_kind".to_string(), json!(failure.kind.as_str()));
                summary.insert("error".to_string(), json!(failure.message));
                summary.insert("charged".to_string(), json!(failure.charged));
            }
        }
        summary
    }
}

/// One billed generation call per [`generate`](Self::generate), gated by the
/// ledger and spaced by the pacer.
pub struct GenerationClient<'a> {
    ledger: &'a CostLedger,
    pacer: &'a CallPacer,
    generator: &'a dyn ImageGenerator,
    model: String,
    quality: Quality,
    unit_cost_usd: f64,
    segmentation: SegmentationOptions,
}

impl<'a> GenerationClient<'a> {
    pub fn new(
        ledger: &'a CostLedger,
        pacer: &'a CallPacer,
        generator: &'a dyn ImageGenerator,
        model: impl Into<String>,
        unit_cost_usd: f64,
    ) -> Self {
        Self {
            ledger,
            pacer,
            generator,
            model: model.into(),
            quality: Quality::default(),
            unit_cost_usd,
            segmentation: SegmentationOptions::default(),
        }
    }

    pub fn with_quality(mut self, quality: Quality) -> Self {
        self.quality = quality;
        self
    }

    pub fn with_segmentation(mut self, options: SegmentationOptions) -> Self {
        self.segmentation = options;
        self
    }

    pub fn model(&self) -> &str {
        &self.model
    }

    pub fn quality(&self) -> Quality {
        self.quality
    }

    pub fn unit_cost_usd(&self) -> f64 {
        self.unit_cost_usd
    }

    pub fn generate(&self, asset: &AssetDescriptor) -> Result<GenerationResult, BudgetExceeded> {
        let reservation = self.ledger.try_reserve(self.unit_cost_usd)?;
        let size = resolve_size(asset);
        let prompt_sent = compose_prompt(asset);
        let request = ImageRequest {
            asset_id: asset.id.clone(),
            category: asset.category,
            prompt: prompt_sent.clone(),
            size: size.clone(),
            quality: self.quality,
            model: self.model.clone(),
        };

        self.pacer.wait(CallKind::Generation);
        let image = match self.generator.generate(&request) {
            Ok(image) => image,
            Err(failure) => {
                let cost_usd = if failure.charged {
                    reservation.commit()
                } else {
                    reservation.release();
                    0.0
                };
                return Ok(GenerationResult {
                    prompt_sent,
                    revised_prompt: None,
                    size: size.clone(),
                    cost_usd,
                    outcome: Err(failure),
                    provider_request: map_object(json!({
                        "provider": self.generator.name(),
                        "model": self.model,
                        "size": size,
                        "quality": self.quality.as_str(),
                    })),
                    provider_response: Map::new(),
                    warnings: Vec::new(),
                });
            }
        };
        let cost_usd = reservation.commit();

        let outcome = match image::load_from_memory(&image.bytes) {
            Ok(decoded) => {
                let bitmap = decoded.to_rgb8();
                let segmentation = if asset.category.requires_transparency() {
                    match segment_rgb(&bitmap, &self.segmentation) {
                        Ok(result) => SegmentationOutcome::Segmented(result),
                        Err(err) => SegmentationOutcome::Skipped(err),
                    }
                } else {
                    SegmentationOutcome::NotApplicable
                };
                Ok(GeneratedAsset {
                    bitmap,
                    segmentation,
                })
            }
            Err(err) => Err(ProviderFailure::new(
                FailureKind::MalformedResponse,
                format!("undecodable image bytes: {err}"),
            )
            .charged()),
        };

        Ok(GenerationResult {
            prompt_sent,
            revised_prompt: image.revised_prompt,
            size,
            cost_usd,
            outcome,
            provider_request: image.provider_request,
            provider_response: image.provider_response,
            warnings: image.warnings,
        })
    }
}
