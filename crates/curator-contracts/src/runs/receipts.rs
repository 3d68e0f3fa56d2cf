use std::path::Path;

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

pub const RECEIPT_SCHEMA_VERSION: u64 = 1;

/// What the run asked the generation service for on one iteration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AttemptRequest {
    pub asset_id: String,
    pub category: String,
    pub iteration: u32,
    pub prompt: String,
    pub negative_prompt: Option<String>,
    pub prompt_sent: String,
    pub size: String,
    pub quality: String,
    pub image_model: String,
    pub vision_model: String,
}

pub fn build_receipt(
    request: &AttemptRequest,
    provider_request: &Map<String, Value>,
    provider_response: &Map<String, Value>,
    warnings: &[String],
    image_path: Option<&Path>,
    receipt_path: &Path,
    result_metadata: &Map<String, Value>,
) -> Value {
    let mut root = Map::new();
    root.insert(
        "schema_version".to_string(),
        Value::Number(RECEIPT_SCHEMA_VERSION.into()),
    );
    root.insert(
        "request".to_string(),
        sanitize_payload(&serde_json::to_value(request).unwrap_or(Value::Null)),
    );
    root.insert(
        "provider_request".to_string(),
        sanitize_payload(&Value::Object(provider_request.clone())),
    );
    root.insert(
        "provider_response".to_string(),
        sanitize_payload(&Value::Object(provider_response.clone())),
    );
    root.insert(
        "warnings".to_string(),
        Value::Array(warnings.iter().cloned().map(Value::String).collect()),
    );

    let mut artifacts = Map::new();
    artifacts.insert(
        "image_path".to_string(),
        image_path
            .map(|path| Value::String(path.to_string_lossy().to_string()))
            .unwrap_or(Value::Null),
    );
    artifacts.insert(
        "receipt_path".to_string(),
        Value::String(receipt_path.to_string_lossy().to_string()),
    );
    root.insert("artifacts".to_string(), Value::Object(artifacts));
    root.insert(
        "result_metadata".to_string(),
        sanitize_payload(&Value::Object(result_metadata.clone())),
    );
    Value::Object(root)
}

pub fn write_receipt(path: &Path, payload: &Value) -> anyhow::Result<()> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    std::fs::write(path, serde_json::to_string_pretty(payload)?)?;
    Ok(())
}

/// Replaces inline image payloads so receipts stay small and diffable.
fn sanitize_payload(value: &Value) -> Value {
    match value {
        Value::Null => Value::Null,
        Value::Bool(_) | Value::Number(_) | Value::String(_) => value.clone(),
        Value::Array(rows) => Value::Array(rows.iter().map(sanitize_payload).collect()),
        Value::Object(map) => {
            let mut out = Map::new();
            for (key, row) in map {
                let lowered = key.to_ascii_lowercase();
                if matches!(
                    lowered.as_str(),
                    "b64_json" | "image" | "image_url" | "image_bytes" | "data"
                ) {
                    out.insert(key.clone(), Value::String("<omitted>".to_string()));
                    continue;
                }
                out.insert(key.clone(), sanitize_payload(row));
            }
            Value::Object(out)
        }
    }
}

#[cfg(test)]
mod tests {
    use serde_json::{json, Map, Value};

    use super::{build_receipt, write_receipt, AttemptRequest, RECEIPT_SCHEMA_VERSION};

    fn request() -> AttemptRequest {
        AttemptRequest {
            asset_id: "coin".to_string(),
            category: "icon".to_string(),
            iteration: 2,
            prompt: "gold coin".to_string(),
            negative_prompt: Some("text".to_string()),
            prompt_sent: "gold coin\n\nAvoid: text".to_string(),
            size: "1024x1024".to_string(),
            quality: "medium".to_string(),
            image_model: "dryrun-image-1".to_string(),
            vision_model: "dryrun-vision-1".to_string(),
        }
    }

    #[test]
    fn receipt_builder_writes_expected_shape() -> anyhow::Result<()> {
        let temp = tempfile::tempdir()?;
        let receipt_path = temp.path().join("receipts").join("coin-iter-2.json");
        let image_path = temp.path().join("coin.png");

        let mut provider_request = Map::new();
        provider_request.insert("endpoint".to_string(), json!("dryrun"));
        let mut provider_response = Map::new();
        provider_response.insert(
            "data".to_string(),
            json!([{"b64_json": "aGVsbG8=", "revised_prompt": "shiny gold coin"}]),
        );
        let mut metadata = Map::new();
        metadata.insert("generation_cost_usd".to_string(), json!(0.04));
        metadata.insert("review".to_string(), json!({"overall_score": 8, "passed": true}));

        let payload = build_receipt(
            &request(),
            &provider_request,
            &provider_response,
            &["size normalized".to_string()],
            Some(&image_path),
            &receipt_path,
            &metadata,
        );
        write_receipt(&receipt_path, &payload)?;

        let parsed: Value = serde_json::from_str(&std::fs::read_to_string(&receipt_path)?)?;
        assert_eq!(parsed["schema_version"], json!(RECEIPT_SCHEMA_VERSION));
        assert_eq!(parsed["request"]["asset_id"], json!("coin"));
        assert_eq!(parsed["request"]["iteration"], json!(2));
        assert_eq!(parsed["provider_response"]["data"], json!("<omitted>"));
        assert_eq!(
            parsed["artifacts"]["image_path"],
            json!(image_path.to_string_lossy())
        );
        assert_eq!(parsed["result_metadata"]["review"]["overall_score"], json!(8));
        assert_eq!(parsed["warnings"][0], json!("size normalized"));
        Ok(())
    }

    #[test]
    fn receipt_without_image_records_null_path() {
        let payload = build_receipt(
            &request(),
            &Map::new(),
            &Map::new(),
            &[],
            None,
            std::path::Path::new("r.json"),
            &Map::new(),
        );
        assert_eq!(payload["artifacts"]["image_path"], Value::Null);
    }
}
