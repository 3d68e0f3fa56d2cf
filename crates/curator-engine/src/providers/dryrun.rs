use std::io::Cursor;

use curator_contracts::catalog::{parse_size, AssetCategory};
use image::{DynamicImage, ImageFormat, Rgb, RgbImage};
use serde_json::json;
use sha2::{Digest, Sha256};

use super::{
    FailureKind, ImageGenerator, ImageRequest, ImageReviewer, ProviderFailure, ProviderImage,
    ReviewRequest,
};
use crate::map_object;

/// Clause the dry-run reviewer asks for; prompts carrying it score as approved.
pub const DRYRUN_REFINEMENT: &str = "clean silhouette, consistent palette";

/// Deterministic offline generator: a prompt-coloured ellipse on white, or a
/// full-frame gradient for backgrounds.
pub struct DryrunGenerator;

impl ImageGenerator for DryrunGenerator {
    fn name(&self) -> &str {
        "dryrun"
    }

    fn generate(&self, request: &ImageRequest) -> Result<ProviderImage, ProviderFailure> {
        let (width, height) = parse_size(&request.size).unwrap_or((1024, 1024));
        let color = color_from_prompt(&request.prompt);
        let image = if request.category == AssetCategory::Background {
            render_gradient(width, height, color)
        } else {
            render_ellipse(width, height, color)
        };

        let mut bytes = Vec::new();
        DynamicImage::ImageRgb8(image)
            .write_to(&mut Cursor::new(&mut bytes), ImageFormat::Png)
            .map_err(|err| {
                ProviderFailure::new(
                    FailureKind::MalformedResponse,
                    format!("dryrun encode failed: {err}"),
                )
            })?;

        Ok(ProviderImage {
            bytes,
            revised_prompt: None,
            provider_request: map_object(json!({
                "endpoint": "dryrun-native",
                "payload": {
                    "model": request.model,
                    "prompt": request.prompt,
                    "size": request.size,
                    "quality": request.quality.as_str(),
                }
            })),
            provider_response: map_object(json!({
                "status": "ok",
                "model": request.model,
                "color": color,
            })),
            warnings: Vec::new(),
        })
    }
}

/// Offline scorer driven by simple image statistics and the prompt text.
pub struct DryrunReviewer;

impl ImageReviewer for DryrunReviewer {
    fn name(&self) -> &str {
        "dryrun"
    }

    fn review(&self, request: &ReviewRequest<'_>) -> Result<String, ProviderFailure> {
        let total = (request.candidate.width() as usize) * (request.candidate.height() as usize);
        let visible = request
            .candidate
            .pixels()
            .filter(|pixel| pixel[3] > 0)
            .count();
        let coverage = if total == 0 {
            0.0
        } else {
            visible as f64 / total as f64
        };
        let refined = request.prompt.contains(DRYRUN_REFINEMENT);

        let technical = if coverage > 0.05 { 8 } else { 4 };
        let (style, palette) = if refined { (8, 7) } else { (5, 6) };
        let mut issues = Vec::new();
        if !refined {
            issues.push("silhouette reads soft against the style guide");
        }
        if coverage <= 0.05 {
            issues.push("subject is too small in frame");
        }
        let suggested_prompt = (!refined).then(|| format!("{}, {DRYRUN_REFINEMENT}", request.prompt));

        let payload = json!({
            "scores": {
                "style": style,
                "palette": palette,
                "mood": 7,
                "technical": technical,
            },
            "issues": issues,
            "suggestions": ["tighten outline", "match reference palette"],
            "suggested_prompt": suggested_prompt,
            "coverage": coverage,
            "references_seen": request.references.len(),
        });
        let body = serde_json::to_string_pretty(&payload).map_err(|err| {
            ProviderFailure::new(FailureKind::MalformedResponse, err.to_string())
        })?;
        Ok(format!("```json\n{body}\n```"))
    }
}

/// Keeps every channel at or below 200 so the subject never blends into a
/// white canvas.
fn color_from_prompt(prompt: &str) -> [u8; 3] {
    let mut hasher = Sha256::new();
    hasher.update(prompt.as_bytes());
    let digest = hasher.finalize();
    [digest[0] % 200, digest[1] % 200, digest[2] % 200]
}

fn render_ellipse(width: u32, height: u32, color: [u8; 3]) -> RgbImage {
    let cx = width as f64 / 2.0;
    let cy = height as f64 / 2.0;
    let rx = (width as f64 * 0.3).max(1.0);
    let ry = (height as f64 * 0.3).max(1.0);
    RgbImage::from_fn(width, height, |x, y| {
        let dx = (x as f64 + 0.5 - cx) / rx;
        let dy = (y as f64 + 0.5 - cy) / ry;
        if dx * dx + dy * dy <= 1.0 {
            Rgb(color)
        } else {
            Rgb([255, 255, 255])
        }
    })
}

fn render_gradient(width: u32, height: u32, color: [u8; 3]) -> RgbImage {
    let span = height.max(1) as f64;
    RgbImage::from_fn(width, height, |_, y| {
        let shade = 1.0 - 0.6 * (y as f64 / span);
        Rgb(color.map(|channel| (channel as f64 * shade).round() as u8))
    })
}

#[cfg(test)]
mod tests {
    use std::path::PathBuf;

    use curator_contracts::catalog::AssetCategory;
    use image::RgbaImage;

    use super::{DryrunGenerator, DryrunReviewer, DRYRUN_REFINEMENT};
    use crate::config::Quality;
    use crate::providers::{ImageGenerator, ImageRequest, ImageReviewer, ReviewRequest};

    fn request(category: AssetCategory, prompt: &str) -> ImageRequest {
        ImageRequest {
            asset_id: "coin".to_string(),
            category,
            prompt: prompt.to_string(),
            size: "64x48".to_string(),
            quality: Quality::Low,
            model: "dryrun-image-1".to_string(),
        }
    }

    #[test]
    fn generator_is_deterministic_and_sized() -> anyhow::Result<()> {
        let first = DryrunGenerator.generate(&request(AssetCategory::Icon, "gold coin"))?;
        let second = DryrunGenerator.generate(&request(AssetCategory::Icon, "gold coin"))?;
        assert_eq!(first.bytes, second.bytes);

        let decoded = image::load_from_memory(&first.bytes)?.to_rgb8();
        assert_eq!(decoded.dimensions(), (64, 48));
        assert_eq!(decoded.get_pixel(0, 0).0, [255, 255, 255]);
        assert_ne!(decoded.get_pixel(32, 24).0, [255, 255, 255]);
        Ok(())
    }

    #[test]
    fn background_category_fills_the_frame() -> anyhow::Result<()> {
        let image = DryrunGenerator.generate(&request(AssetCategory::Background, "dusk sky"))?;
        let decoded = image::load_from_memory(&image.bytes)?.to_rgb8();
        assert_ne!(decoded.get_pixel(0, 0).0, [255, 255, 255]);
        Ok(())
    }

    #[test]
    fn reviewer_suggests_refinement_once() -> anyhow::Result<()> {
        let candidate = RgbaImage::from_pixel(10, 10, image::Rgba([1, 2, 3, 255]));
        let references: Vec<PathBuf> = Vec::new();
        let review = |prompt: &str| {
            DryrunReviewer.review(&ReviewRequest {
                asset_id: "coin",
                category: AssetCategory::Icon,
                prompt,
                candidate: &candidate,
                references: &references,
                rubric: "rubric",
                model: "dryrun-vision-1",
            })
        };

        let first = review("gold coin")?;
        assert!(first.starts_with("```json"));
        assert!(first.contains(DRYRUN_REFINEMENT));

        let refined = review(&format!("gold coin, {DRYRUN_REFINEMENT}"))?;
        assert!(refined.contains("\"suggested_prompt\": null"));
        Ok(())
    }
}
