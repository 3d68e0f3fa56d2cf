use std::fs;
use std::path::Path;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine as _;
use curator_contracts::catalog::parse_size;
use image::codecs::jpeg::JpegEncoder;
use image::imageops::FilterType;
use image::{DynamicImage, Rgba, RgbaImage};
use reqwest::blocking::Client as HttpClient;
use reqwest::header::CONTENT_TYPE;
use serde_json::{json, Value};

use super::{
    non_empty_env, response_json_or_failure, FailureKind, ImageGenerator, ImageRequest,
    ImageReviewer, ProviderFailure, ProviderImage, ReviewRequest,
};
use crate::config::Quality;
use crate::{map_object, truncate_text};

const DEFAULT_API_BASE: &str = "https://api.openai.com/v1";
const REVIEW_MAX_OUTPUT_TOKENS: u64 = 800;
const CANDIDATE_MAX_DIM: u32 = 1024;
const REFERENCE_MAX_DIM: u32 = 512;

fn api_base() -> String {
    non_empty_env("OPENAI_API_BASE")
        .map(|value| value.trim_end_matches('/').to_string())
        .unwrap_or_else(|| DEFAULT_API_BASE.to_string())
}

fn api_key() -> Option<String> {
    non_empty_env("OPENAI_API_KEY").or_else(|| non_empty_env("OPENAI_API_KEY_BACKUP"))
}

fn http_client(timeout: Duration) -> Result<HttpClient> {
    HttpClient::builder()
        .timeout(timeout)
        .build()
        .context("failed to build HTTP client")
}

pub struct OpenAiGenerator {
    api_base: String,
    api_key: String,
    http: HttpClient,
}

impl OpenAiGenerator {
    pub fn from_env(timeout: Duration) -> Result<Self> {
        let Some(api_key) = api_key() else {
            bail!("OPENAI_API_KEY or OPENAI_API_KEY_BACKUP not set");
        };
        Ok(Self {
            api_base: api_base(),
            api_key,
            http: http_client(timeout)?,
        })
    }

    fn extract_image(
        &self,
        response_payload: &Value,
    ) -> Result<(Vec<u8>, Option<String>), ProviderFailure> {
        let Some(row) = response_payload
            .get("data")
            .and_then(Value::as_array)
            .and_then(|rows| rows.first())
            .and_then(Value::as_object)
        else {
            return Err(ProviderFailure::new(
                FailureKind::MalformedResponse,
                "OpenAI response returned no images",
            )
            .charged());
        };
        let revised_prompt = row
            .get("revised_prompt")
            .and_then(Value::as_str)
            .map(str::trim)
            .filter(|text| !text.is_empty())
            .map(str::to_string);

        if let Some(b64) = row.get("b64_json").and_then(Value::as_str) {
            let bytes = BASE64.decode(b64.as_bytes()).map_err(|err| {
                ProviderFailure::new(
                    FailureKind::MalformedResponse,
                    format!("OpenAI image base64 decode failed: {err}"),
                )
                .charged()
            })?;
            return Ok((bytes, revised_prompt));
        }
        if let Some(url) = row.get("url").and_then(Value::as_str) {
            return Ok((self.download_image(url)?, revised_prompt));
        }
        Err(ProviderFailure::new(
            FailureKind::MalformedResponse,
            "OpenAI image entry carried neither b64_json nor url",
        )
        .charged())
    }

    /// The generation already succeeded, so download failures are charged.
    fn download_image(&self, url: &str) -> Result<Vec<u8>, ProviderFailure> {
        let response = self
            .http
            .get(url)
            .send()
            .with_context(|| format!("failed downloading provider image ({url})"))
            .map_err(|err| ProviderFailure::from_transport("OpenAI", &err).charged())?;
        if !response.status().is_success() {
            let code = response.status().as_u16();
            let body = response.text().unwrap_or_default();
            return Err(ProviderFailure::new(
                FailureKind::Transport,
                format!(
                    "provider image download failed ({code}): {}",
                    truncate_text(&body, 512)
                ),
            )
            .charged());
        }
        response
            .bytes()
            .map(|bytes| bytes.to_vec())
            .map_err(|err| {
                ProviderFailure::from_transport("OpenAI", &anyhow::Error::new(err)).charged()
            })
    }
}

impl ImageGenerator for OpenAiGenerator {
    fn name(&self) -> &str {
        "openai"
    }

    fn generate(&self, request: &ImageRequest) -> Result<ProviderImage, ProviderFailure> {
        let endpoint = format!("{}/images/generations", self.api_base);
        let mut warnings = Vec::new();
        let size = normalize_openai_size(&request.model, &request.size, &mut warnings);
        let mut payload = map_object(json!({
            "model": request.model,
            "prompt": request.prompt,
            "n": 1,
            "size": size,
            "quality": openai_quality(&request.model, request.quality),
        }));
        if is_openai_gpt_image_model(&request.model) {
            payload.insert("moderation".to_string(), Value::String("low".to_string()));
        } else {
            payload.insert(
                "response_format".to_string(),
                Value::String("b64_json".to_string()),
            );
        }

        let response = self
            .http
            .post(&endpoint)
            .bearer_auth(&self.api_key)
            .json(&Value::Object(payload.clone()))
            .send()
            .with_context(|| format!("OpenAI request failed ({endpoint})"))
            .map_err(|err| ProviderFailure::from_transport("OpenAI", &err))?;
        let (status_code, response_payload) = response_json_or_failure("OpenAI", response)?;
        let (bytes, revised_prompt) = self.extract_image(&response_payload)?;

        let mut provider_response = map_object(json!({
            "status_code": status_code,
            "created": response_payload.get("created").cloned().unwrap_or(Value::Null),
        }));
        if let Some(usage) = response_payload.get("usage").cloned() {
            provider_response.insert("usage".to_string(), usage);
        }

        Ok(ProviderImage {
            bytes,
            revised_prompt,
            provider_request: map_object(json!({
                "endpoint": endpoint,
                "payload": payload,
            })),
            provider_response,
            warnings,
        })
    }
}

/// Vision scorer over the Responses API.
pub struct OpenAiReviewer {
    api_base: String,
    api_key: String,
    http: HttpClient,
}

impl OpenAiReviewer {
    pub fn from_env(timeout: Duration) -> Result<Self> {
        let Some(api_key) = api_key() else {
            bail!("OPENAI_API_KEY or OPENAI_API_KEY_BACKUP not set");
        };
        Ok(Self {
            api_base: api_base(),
            api_key,
            http: http_client(timeout)?,
        })
    }
}

impl ImageReviewer for OpenAiReviewer {
    fn name(&self) -> &str {
        "openai"
    }

    fn review(&self, request: &ReviewRequest<'_>) -> Result<String, ProviderFailure> {
        let mut content = vec![json!({"type": "input_text", "text": request.rubric})];
        for (idx, reference) in request.references.iter().enumerate() {
            let Some(data_url) = prepare_vision_image_data_url(reference, REFERENCE_MAX_DIM) else {
                continue;
            };
            content.push(json!({"type": "input_text", "text": format!("Reference image {}:", idx + 1)}));
            content.push(json!({"type": "input_image", "image_url": data_url}));
        }
        let candidate = encode_candidate_data_url(request.candidate, CANDIDATE_MAX_DIM)
            .map_err(|err| ProviderFailure::new(FailureKind::Rejected, err.to_string()))?;
        content.push(json!({"type": "input_text", "text": "Candidate asset:"}));
        content.push(json!({"type": "input_image", "image_url": candidate}));

        let endpoint = format!("{}/responses", self.api_base);
        let payload = json!({
            "model": request.model,
            "input": [{
                "role": "user",
                "content": content,
            }],
            "max_output_tokens": REVIEW_MAX_OUTPUT_TOKENS,
        });
        let response = self
            .http
            .post(&endpoint)
            .bearer_auth(&self.api_key)
            .header(CONTENT_TYPE, "application/json")
            .json(&payload)
            .send()
            .with_context(|| format!("OpenAI vision request failed ({endpoint})"))
            .map_err(|err| ProviderFailure::from_transport("OpenAI vision", &err))?;
        let (_, parsed) = response_json_or_failure("OpenAI vision", response)?;
        Ok(extract_openai_output_text(&parsed))
    }
}

fn is_openai_gpt_image_model(model: &str) -> bool {
    model.trim().to_ascii_lowercase().starts_with("gpt-image")
}

fn openai_quality(model: &str, quality: Quality) -> &'static str {
    if is_openai_gpt_image_model(model) {
        return quality.as_str();
    }
    match quality {
        Quality::High => "hd",
        Quality::Low | Quality::Medium => "standard",
    }
}

/// gpt-image models take 1024/1536 sizes; dall-e-3 uses 1792 for wide frames.
fn normalize_openai_size(model: &str, size: &str, warnings: &mut Vec<String>) -> String {
    let requested = size.trim().to_ascii_lowercase();
    let allowed: &[&str] = if is_openai_gpt_image_model(model) {
        &["1024x1024", "1536x1024", "1024x1536", "auto"]
    } else {
        &["1024x1024", "1792x1024", "1024x1792"]
    };
    if allowed.contains(&requested.as_str()) {
        return requested;
    }
    let (width, height) = parse_size(&requested).unwrap_or((1, 1));
    let snapped = if width > height {
        allowed[1]
    } else if height > width {
        allowed[2]
    } else {
        allowed[0]
    };
    warnings.push(format!("size '{size}' unsupported by {model}; using {snapped}"));
    snapped.to_string()
}

fn prepare_vision_image_data_url(path: &Path, max_dim: u32) -> Option<String> {
    match image::open(path) {
        Ok(image) => encode_candidate_data_url(&image.to_rgba8(), max_dim).ok(),
        Err(_) => {
            let bytes = fs::read(path).ok()?;
            let mime = guess_image_mime(path);
            Some(format!("data:{mime};base64,{}", BASE64.encode(bytes)))
        }
    }
}

/// Flattens transparency onto white, bounds the size, and JPEG-encodes.
fn encode_candidate_data_url(image: &RgbaImage, max_dim: u32) -> Result<String> {
    let dim = max_dim.max(128);
    let mut flattened = RgbaImage::new(image.width(), image.height());
    for (x, y, pixel) in image.enumerate_pixels() {
        let alpha = u16::from(pixel[3]);
        let blend = |channel: u8| -> u8 {
            (((u16::from(channel) * alpha) + (255 * (255 - alpha))) / 255) as u8
        };
        flattened.put_pixel(
            x,
            y,
            Rgba([blend(pixel[0]), blend(pixel[1]), blend(pixel[2]), 255]),
        );
    }
    let mut rgba = DynamicImage::ImageRgba8(flattened);
    if rgba.width() > dim || rgba.height() > dim {
        rgba = rgba.resize(dim, dim, FilterType::Triangle);
    }
    let resized = rgba.to_rgb8();
    let mut bytes = Vec::new();
    {
        let mut encoder = JpegEncoder::new_with_quality(&mut bytes, 90);
        encoder
            .encode_image(&DynamicImage::ImageRgb8(resized))
            .context("candidate JPEG encode failed")?;
    }
    Ok(format!("data:image/jpeg;base64,{}", BASE64.encode(bytes)))
}

fn guess_image_mime(path: &Path) -> &'static str {
    let ext = path
        .extension()
        .and_then(|value| value.to_str())
        .map(|value| value.to_ascii_lowercase())
        .unwrap_or_default();
    match ext.as_str() {
        "jpg" | "jpeg" => "image/jpeg",
        "webp" => "image/webp",
        _ => "image/png",
    }
}

pub(crate) fn extract_openai_output_text(response: &Value) -> String {
    if let Some(text) = response.get("output_text").and_then(Value::as_str) {
        if !text.trim().is_empty() {
            return text.trim().to_string();
        }
    }

    let mut parts: Vec<String> = Vec::new();
    let rows = response
        .get("output")
        .and_then(Value::as_array)
        .cloned()
        .unwrap_or_default();
    for row in rows {
        let Some(obj) = row.as_object() else {
            continue;
        };
        if let Some(kind) = obj.get("type").and_then(Value::as_str) {
            if matches!(kind, "output_text" | "text") {
                if let Some(text) = obj.get("text").and_then(Value::as_str) {
                    if !text.trim().is_empty() {
                        parts.push(text.trim().to_string());
                    }
                }
                continue;
            }
            if kind != "message" {
                continue;
            }
        }
        let content = obj
            .get("content")
            .and_then(Value::as_array)
            .cloned()
            .unwrap_or_default();
        for item in content {
            let Some(text) = item.get("text").and_then(Value::as_str) else {
                continue;
            };
            if !text.trim().is_empty() {
                parts.push(text.trim().to_string());
            }
        }
    }
    parts.join("\n").trim().to_string()
}

#[cfg(test)]
mod tests {
    use image::{Rgba, RgbaImage};
    use serde_json::json;

    use super::{
        encode_candidate_data_url, extract_openai_output_text, normalize_openai_size,
        openai_quality,
    };
    use crate::config::Quality;

    #[test]
    fn output_text_prefers_top_level_then_message_parts() {
        assert_eq!(
            extract_openai_output_text(&json!({"output_text": "  {\"a\":1} "})),
            "{\"a\":1}"
        );
        let nested = json!({
            "output": [
                {"type": "reasoning", "summary": []},
                {"type": "message", "content": [
                    {"type": "output_text", "text": "first"},
                    {"type": "output_text", "text": "second"}
                ]}
            ]
        });
        assert_eq!(extract_openai_output_text(&nested), "first\nsecond");
        assert_eq!(extract_openai_output_text(&json!({})), "");
    }

    #[test]
    fn sizes_snap_to_model_supported_values() {
        let mut warnings = Vec::new();
        assert_eq!(
            normalize_openai_size("gpt-image-1", "1536x1024", &mut warnings),
            "1536x1024"
        );
        assert!(warnings.is_empty());
        assert_eq!(
            normalize_openai_size("dall-e-3", "1536x1024", &mut warnings),
            "1792x1024"
        );
        assert_eq!(
            normalize_openai_size("gpt-image-1", "300x300", &mut warnings),
            "1024x1024"
        );
        assert_eq!(warnings.len(), 2);
    }

    #[test]
    fn quality_maps_per_model_family() {
        assert_eq!(openai_quality("gpt-image-1-mini", Quality::Low), "low");
        assert_eq!(openai_quality("dall-e-3", Quality::High), "hd");
        assert_eq!(openai_quality("dall-e-3", Quality::Medium), "standard");
    }

    #[test]
    fn candidate_is_flattened_to_jpeg_data_url() -> anyhow::Result<()> {
        let mut image = RgbaImage::from_pixel(300, 200, Rgba([0, 0, 0, 0]));
        image.put_pixel(10, 10, Rgba([255, 0, 0, 255]));
        let url = encode_candidate_data_url(&image, 128)?;
        assert!(url.starts_with("data:image/jpeg;base64,"));
        Ok(())
    }
}
