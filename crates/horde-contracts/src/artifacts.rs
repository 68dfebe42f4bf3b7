use std::path::{Path, PathBuf};

use anyhow::Context;
use serde_json::{Map, Value};

use crate::events::now_utc_iso;
use crate::request::{GenerationRequest, ResolvedRequest};
use crate::status::DownloadedImage;

pub const METADATA_SCHEMA_VERSION: u64 = 1;

/// Sidecar path for an image: `<image>.json`.
pub fn metadata_path_for(image_path: &Path) -> PathBuf {
    let mut raw = image_path.as_os_str().to_os_string();
    raw.push(".json");
    PathBuf::from(raw)
}

pub fn build_artifact_metadata(
    request: &GenerationRequest,
    resolved: &ResolvedRequest,
    job_id: &str,
    image: &DownloadedImage,
    warnings: &[String],
) -> Value {
    let mut root = Map::new();
    root.insert(
        "schema_version".to_string(),
        Value::Number(METADATA_SCHEMA_VERSION.into()),
    );
    root.insert("job_id".to_string(), Value::String(job_id.to_string()));
    root.insert("created_at".to_string(), Value::String(now_utc_iso()));
    root.insert(
        "request".to_string(),
        sanitize_payload(&serde_json::to_value(request).unwrap_or(Value::Null)),
    );
    root.insert(
        "resolved".to_string(),
        sanitize_payload(&serde_json::to_value(resolved).unwrap_or(Value::Null)),
    );
    root.insert(
        "warnings".to_string(),
        Value::Array(warnings.iter().cloned().map(Value::String).collect()),
    );

    let mut result = Map::new();
    result.insert(
        "image_path".to_string(),
        Value::String(image.path.to_string_lossy().to_string()),
    );
    result.insert("bytes".to_string(), Value::Number(image.bytes.into()));
    result.insert("sha256".to_string(), Value::String(image.sha256.clone()));
    let mut optional = |key: &str, value: &Option<String>| {
        result.insert(
            key.to_string(),
            value.clone().map(Value::String).unwrap_or(Value::Null),
        );
    };
    optional("seed", &image.seed);
    optional("model", &image.model);
    optional("worker_name", &image.worker_name);
    root.insert("result".to_string(), Value::Object(result));
    Value::Object(root)
}

pub fn write_artifact_metadata(path: &Path, payload: &Value) -> anyhow::Result<()> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)
            .with_context(|| format!("failed to create {}", parent.display()))?;
    }
    std::fs::write(path, serde_json::to_string_pretty(payload)?)
        .with_context(|| format!("failed to write metadata {}", path.display()))?;
    Ok(())
}

fn sanitize_payload(value: &Value) -> Value {
    match value {
        Value::Null => Value::Null,
        Value::Bool(_) | Value::Number(_) | Value::String(_) => value.clone(),
        Value::Array(rows) => Value::Array(rows.iter().map(sanitize_payload).collect()),
        Value::Object(map) => {
            let mut out = Map::new();
            for (key, row) in map {
                let lowered = key.to_ascii_lowercase();
                if matches!(lowered.as_str(), "apikey" | "api_key" | "credential") {
                    continue;
                }
                if matches!(lowered.as_str(), "data" | "img" | "source_image") && row.is_string()
                {
                    out.insert(key.clone(), Value::String("<omitted>".to_string()));
                    continue;
                }
                out.insert(key.clone(), sanitize_payload(row));
            }
            Value::Object(out)
        }
    }
}
