use std::io::Write;
use std::path::{Path, PathBuf};

use anyhow::Context;
use chrono::NaiveDate;
use serde_json::{Map, Value};

use crate::request::{Credential, MAX_WAIT_MINUTES};

pub const KEY_API_KEY: &str = "api_key";
pub const KEY_MODELS: &str = "models";
pub const KEY_INPAINTING_MODELS: &str = "inpainting_models";
pub const KEY_MODELS_CHECKED: &str = "models_checked";
pub const KEY_MAX_WAIT_MINUTES: &str = "max_wait_minutes";

const DATE_FORMAT: &str = "%Y-%m-%d";

/// JSON key/value file holding the API key, cached model lists and
/// preferences. Writes merge only the keys this instance changed, so two
/// stores sharing a path do not clobber each other.
#[derive(Debug, Clone)]
pub struct SettingsStore {
    path: PathBuf,
    payload: Option<Map<String, Value>>,
    dirty_keys: Vec<String>,
}

impl SettingsStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            payload: None,
            dirty_keys: Vec::new(),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn get(&mut self, key: &str) -> Option<Value> {
        self.ensure_loaded(true).get(key).cloned()
    }

    pub fn set(&mut self, key: &str, value: Value) -> anyhow::Result<()> {
        let payload = self.ensure_loaded(true);
        if payload.get(key) == Some(&value) {
            return Ok(());
        }
        payload.insert(key.to_string(), value);
        if !self.dirty_keys.iter().any(|dirty| dirty == key) {
            self.dirty_keys.push(key.to_string());
        }
        self.flush()
    }

    pub fn remove(&mut self, key: &str) -> anyhow::Result<()> {
        self.set(key, Value::Null)
    }

    pub fn flush(&mut self) -> anyhow::Result<()> {
        let Some(payload) = &self.payload else {
            return Ok(());
        };
        if self.dirty_keys.is_empty() {
            return Ok(());
        }

        let mut on_disk = read_json_object(&self.path).unwrap_or_default();
        for key in &self.dirty_keys {
            match payload.get(key) {
                Some(Value::Null) | None => {
                    on_disk.remove(key);
                }
                Some(value) => {
                    on_disk.insert(key.clone(), value.clone());
                }
            }
        }
        write_json_object(&self.path, &on_disk)?;
        self.payload = Some(on_disk);
        self.dirty_keys.clear();
        Ok(())
    }

    pub fn credential(&mut self) -> Credential {
        let stored = self.get(KEY_API_KEY);
        Credential::from_optional(stored.as_ref().and_then(Value::as_str))
    }

    pub fn set_api_key(&mut self, key: Option<&str>) -> anyhow::Result<()> {
        match Credential::from_optional(key) {
            Credential::ApiKey(key) => self.set(KEY_API_KEY, Value::String(key)),
            Credential::Anonymous => self.remove(KEY_API_KEY),
        }
    }

    pub fn models(&mut self) -> Vec<String> {
        self.string_list(KEY_MODELS)
    }

    pub fn inpainting_models(&mut self) -> Vec<String> {
        self.string_list(KEY_INPAINTING_MODELS)
    }

    pub fn set_models(&mut self, generic: &[String], inpainting: &[String]) -> anyhow::Result<()> {
        self.set(KEY_MODELS, string_array(generic))?;
        self.set(KEY_INPAINTING_MODELS, string_array(inpainting))
    }

    pub fn models_checked(&mut self) -> Option<NaiveDate> {
        let raw = self.get(KEY_MODELS_CHECKED)?;
        NaiveDate::parse_from_str(raw.as_str()?.trim(), DATE_FORMAT).ok()
    }

    pub fn set_models_checked(&mut self, date: NaiveDate) -> anyhow::Result<()> {
        self.set(
            KEY_MODELS_CHECKED,
            Value::String(date.format(DATE_FORMAT).to_string()),
        )
    }

    /// Stored preference, clamped to the accepted range.
    pub fn max_wait_minutes(&mut self) -> Option<u32> {
        let raw = self.get(KEY_MAX_WAIT_MINUTES)?.as_u64()?;
        Some(raw.clamp(1, u64::from(MAX_WAIT_MINUTES)) as u32)
    }

    pub fn set_max_wait_minutes(&mut self, minutes: u32) -> anyhow::Result<()> {
        let minutes = minutes.clamp(1, MAX_WAIT_MINUTES);
        self.set(KEY_MAX_WAIT_MINUTES, Value::from(minutes))
    }

    fn string_list(&mut self, key: &str) -> Vec<String> {
        self.get(key)
            .as_ref()
            .and_then(Value::as_array)
            .map(|rows| {
                rows.iter()
                    .filter_map(Value::as_str)
                    .map(str::trim)
                    .filter(|name| !name.is_empty())
                    .map(str::to_string)
                    .collect()
            })
            .unwrap_or_default()
    }

    fn ensure_loaded(&mut self, refresh: bool) -> &mut Map<String, Value> {
        if refresh || self.payload.is_none() {
            let mut fresh = read_json_object(&self.path).unwrap_or_default();
            // Unflushed local edits survive a refresh.
            if let Some(previous) = &self.payload {
                for key in &self.dirty_keys {
                    if let Some(value) = previous.get(key) {
                        fresh.insert(key.clone(), value.clone());
                    }
                }
            }
            self.payload = Some(fresh);
        }
        self.payload.get_or_insert_with(Map::new)
    }
}

fn string_array(values: &[String]) -> Value {
    Value::Array(values.iter().cloned().map(Value::String).collect())
}

fn read_json_object(path: &Path) -> Option<Map<String, Value>> {
    let raw = std::fs::read_to_string(path).ok()?;
    let parsed: Value = serde_json::from_str(&raw).ok()?;
    parsed.as_object().cloned()
}

// The file holds the API key. Named temp files are created 0600 and the
// rename replaces the old file in one step.
fn write_json_object(path: &Path, payload: &Map<String, Value>) -> anyhow::Result<()> {
    let parent = match path.parent() {
        Some(parent) if !parent.as_os_str().is_empty() => parent,
        _ => Path::new("."),
    };
    std::fs::create_dir_all(parent)
        .with_context(|| format!("failed to create {}", parent.display()))?;
    let body = serde_json::to_string_pretty(&Value::Object(payload.clone()))?;
    let mut staged = tempfile::NamedTempFile::new_in(parent)
        .with_context(|| format!("failed to stage settings in {}", parent.display()))?;
    staged
        .write_all(body.as_bytes())
        .with_context(|| format!("failed to write settings {}", path.display()))?;
    staged
        .persist(path)
        .with_context(|| format!("failed to replace settings {}", path.display()))?;
    Ok(())
}
