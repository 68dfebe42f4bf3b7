use std::path::PathBuf;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// Snapshot of a queued job as reported by the check endpoint.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JobStatus {
    pub finished_count: u32,
    pub processing: u32,
    pub restarted: u32,
    pub waiting: u32,
    pub queue_position: u32,
    pub wait_time_secs: u64,
    pub kudos: f64,
    pub finished: bool,
    pub possible: bool,
    pub faulted: bool,
    #[serde(default)]
    pub warnings: Vec<String>,
}

impl Default for JobStatus {
    fn default() -> Self {
        Self {
            finished_count: 0,
            processing: 0,
            restarted: 0,
            waiting: 0,
            queue_position: 0,
            wait_time_secs: 0,
            kudos: 0.0,
            finished: false,
            possible: true,
            faulted: false,
            warnings: Vec::new(),
        }
    }
}

impl JobStatus {
    /// Decodes a check payload. `done` wins when present; older payloads
    /// without it are finished once nothing is waiting or processing.
    pub fn from_check_payload(payload: &Value) -> Result<Self, String> {
        let Some(obj) = payload.as_object() else {
            return Err("job status payload is not a JSON object".to_string());
        };
        let finished_count = count_field(obj, "finished");
        let processing = count_field(obj, "processing");
        let waiting = count_field(obj, "waiting");
        let finished = match obj.get("done").and_then(Value::as_bool) {
            Some(done) => done,
            None => finished_count > 0 && processing == 0 && waiting == 0,
        };
        Ok(Self {
            finished_count,
            processing,
            restarted: count_field(obj, "restarted"),
            waiting,
            queue_position: count_field(obj, "queue_position"),
            wait_time_secs: obj
                .get("wait_time")
                .and_then(as_non_negative)
                .map(|value| value.round() as u64)
                .unwrap_or(0),
            kudos: obj.get("kudos").and_then(Value::as_f64).unwrap_or(0.0),
            finished,
            possible: obj
                .get("is_possible")
                .and_then(Value::as_bool)
                .unwrap_or(true),
            faulted: obj.get("faulted").and_then(Value::as_bool).unwrap_or(false),
            warnings: warning_messages(obj.get("warnings")),
        })
    }

    pub fn describe(&self) -> String {
        if self.finished {
            return "Done".to_string();
        }
        if self.processing > 0 {
            return "Generating...".to_string();
        }
        format!(
            "Queue position: {}, Wait time: {}s",
            self.queue_position, self.wait_time_secs
        )
    }

    /// Progress in percent, capped at 99 until the job is done.
    /// `since_check` is the time spent since this status was received.
    pub fn progress_percent(&self, elapsed: Duration, since_check: Duration) -> u8 {
        if self.finished {
            return 100;
        }
        let elapsed = elapsed.as_secs_f64();
        let remaining = Duration::from_secs(self.wait_time_secs)
            .saturating_sub(since_check)
            .as_secs_f64();
        let total = elapsed + remaining;
        if total <= 0.0 {
            return 0;
        }
        ((elapsed / total) * 99.0).floor().clamp(0.0, 99.0) as u8
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", content = "value", rename_all = "snake_case")]
pub enum ImagePayload {
    Inline(String),
    Remote(String),
}

impl ImagePayload {
    pub fn from_wire(raw: &str) -> Self {
        let trimmed = raw.trim();
        if trimmed.starts_with("http://") || trimmed.starts_with("https://") {
            Self::Remote(trimmed.to_string())
        } else {
            Self::Inline(trimmed.to_string())
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GeneratedImage {
    pub payload: ImagePayload,
    pub censored: bool,
    pub seed: Option<String>,
    pub model: Option<String>,
    pub worker_id: Option<String>,
    pub worker_name: Option<String>,
}

impl GeneratedImage {
    pub fn list_from_status_payload(payload: &Value) -> Result<Vec<Self>, String> {
        let Some(generations) = payload.get("generations").and_then(Value::as_array) else {
            return Err("status payload is missing 'generations'".to_string());
        };
        let mut images = Vec::with_capacity(generations.len());
        for (idx, generation) in generations.iter().enumerate() {
            let Some(raw) = generation.get("img").and_then(Value::as_str) else {
                return Err(format!("generation {} has no image data", idx + 1));
            };
            images.push(Self {
                payload: ImagePayload::from_wire(raw),
                censored: generation
                    .get("censored")
                    .and_then(Value::as_bool)
                    .unwrap_or(false),
                seed: generation.get("seed").and_then(scalar_string),
                model: generation.get("model").and_then(scalar_string),
                worker_id: generation.get("worker_id").and_then(scalar_string),
                worker_name: generation.get("worker_name").and_then(scalar_string),
            });
        }
        Ok(images)
    }
}

/// An image written to disk.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DownloadedImage {
    pub path: PathBuf,
    pub bytes: u64,
    pub sha256: String,
    pub seed: Option<String>,
    pub model: Option<String>,
    pub worker_name: Option<String>,
    pub metadata_path: Option<PathBuf>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UserInfo {
    pub username: String,
    pub id: Option<u64>,
    pub kudos: f64,
    pub trusted: bool,
    pub concurrency: Option<u64>,
}

impl UserInfo {
    pub fn from_payload(payload: &Value) -> Result<Self, String> {
        let Some(username) = payload
            .get("username")
            .and_then(Value::as_str)
            .map(str::trim)
            .filter(|value| !value.is_empty())
        else {
            return Err("user payload is missing 'username'".to_string());
        };
        Ok(Self {
            username: username.to_string(),
            id: payload.get("id").and_then(Value::as_u64),
            kudos: payload.get("kudos").and_then(Value::as_f64).unwrap_or(0.0),
            trusted: payload
                .get("trusted")
                .and_then(Value::as_bool)
                .unwrap_or(false),
            concurrency: payload.get("concurrency").and_then(Value::as_u64),
        })
    }
}

fn warning_messages(raw: Option<&Value>) -> Vec<String> {
    let Some(rows) = raw.and_then(Value::as_array) else {
        return Vec::new();
    };
    let mut messages: Vec<String> = Vec::new();
    for row in rows {
        let text = row
            .get("message")
            .and_then(Value::as_str)
            .or_else(|| row.as_str())
            .map(str::trim)
            .unwrap_or_default();
        if !text.is_empty() && !messages.iter().any(|existing| existing == text) {
            messages.push(text.to_string());
        }
    }
    messages
}

fn count_field(obj: &Map<String, Value>, key: &str) -> u32 {
    obj.get(key)
        .and_then(as_non_negative)
        .map(|value| value.min(f64::from(u32::MAX)) as u32)
        .unwrap_or(0)
}

fn as_non_negative(value: &Value) -> Option<f64> {
    value
        .as_f64()
        .filter(|value| value.is_finite())
        .map(|value| value.max(0.0))
}

fn scalar_string(value: &Value) -> Option<String> {
    match value {
        Value::String(text) => {
            let text = text.trim();
            (!text.is_empty()).then(|| text.to_string())
        }
        Value::Number(number) => Some(number.to_string()),
        _ => None,
    }
}
