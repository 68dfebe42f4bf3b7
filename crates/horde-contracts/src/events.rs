use std::fs::OpenOptions;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

use anyhow::Context;
use chrono::{SecondsFormat, Utc};
use serde_json::{Map, Value};

/// Lifecycle events written to the job log.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JobEvent {
    Submitted,
    Status,
    Warning,
    Failed,
    Finished,
    ArtifactWritten,
    CatalogRefreshed,
}

impl JobEvent {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Submitted => "job_submitted",
            Self::Status => "job_status",
            Self::Warning => "job_warning",
            Self::Failed => "job_failed",
            Self::Finished => "job_finished",
            Self::ArtifactWritten => "artifact_written",
            Self::CatalogRefreshed => "catalog_refreshed",
        }
    }

    pub fn parse(raw: &str) -> Option<Self> {
        [
            Self::Submitted,
            Self::Status,
            Self::Warning,
            Self::Failed,
            Self::Finished,
            Self::ArtifactWritten,
            Self::CatalogRefreshed,
        ]
        .into_iter()
        .find(|event| event.as_str() == raw)
    }
}

const RESERVED_FIELDS: [&str; 4] = ["type", "session_id", "ts", "job_id"];

/// Append-only JSONL log shared by every job of one CLI session.
///
/// Each line carries `type`, `session_id`, `ts` and, for job events, the
/// `job_id`. Those fields always come from the log itself; payload keys
/// with the same names are dropped.
#[derive(Debug, Clone)]
pub struct EventWriter {
    inner: Arc<EventLogInner>,
}

#[derive(Debug)]
struct EventLogInner {
    path: PathBuf,
    session_id: String,
    lock: Mutex<()>,
}

impl EventWriter {
    pub fn new(path: impl Into<PathBuf>, session_id: impl Into<String>) -> Self {
        Self {
            inner: Arc::new(EventLogInner {
                path: path.into(),
                session_id: session_id.into(),
                lock: Mutex::new(()),
            }),
        }
    }

    pub fn new_session(path: impl Into<PathBuf>) -> Self {
        Self::new(path, uuid::Uuid::new_v4().to_string())
    }

    pub fn path(&self) -> &Path {
        &self.inner.path
    }

    pub fn session_id(&self) -> &str {
        &self.inner.session_id
    }

    /// Writes one line. `fields` must be a JSON object (or null).
    pub fn emit(&self, event: JobEvent, job_id: Option<&str>, fields: Value) -> anyhow::Result<Value> {
        let fields = match fields {
            Value::Object(map) => map,
            Value::Null => Map::new(),
            other => anyhow::bail!("{} fields must be a JSON object, got {other}", event.as_str()),
        };

        let mut line = Map::new();
        line.insert("type".to_string(), Value::String(event.as_str().to_string()));
        line.insert(
            "session_id".to_string(),
            Value::String(self.inner.session_id.clone()),
        );
        line.insert("ts".to_string(), Value::String(now_utc_iso()));
        if let Some(job_id) = job_id {
            line.insert("job_id".to_string(), Value::String(job_id.to_string()));
        }
        for (key, value) in fields {
            if !RESERVED_FIELDS.contains(&key.as_str()) {
                line.insert(key, value);
            }
        }
        let line = Value::Object(line);
        self.append(&line)?;
        Ok(line)
    }

    fn append(&self, line: &Value) -> anyhow::Result<()> {
        let path = &self.inner.path;
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)
                .with_context(|| format!("failed to create {}", parent.display()))?;
        }
        let mut text = serde_json::to_string(line)?;
        text.push('\n');

        let _guard = self
            .inner
            .lock
            .lock()
            .map_err(|_| anyhow::anyhow!("event log lock poisoned"))?;
        let mut file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(path)
            .with_context(|| format!("failed to open event log {}", path.display()))?;
        file.write_all(text.as_bytes())
            .with_context(|| format!("failed to append to {}", path.display()))?;
        Ok(())
    }
}

pub fn now_utc_iso() -> String {
    Utc::now().to_rfc3339_opts(SecondsFormat::Micros, false)
}
