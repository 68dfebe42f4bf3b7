use std::sync::Arc;

use chrono::NaiveDate;
use horde_contracts::events::{EventWriter, JobEvent};
use horde_contracts::models::{ModelCatalog, ModelRequirements};
use horde_contracts::request::{Credential, GenerationMode, GenerationRequest};
use horde_contracts::settings::SettingsStore;
use serde_json::{json, Map, Value};
use tracing::{info, warn};

use crate::client::HordeClient;
use crate::config::HordeConfig;
use crate::error::{HordeError, Result};
use crate::transport::Transport;
use crate::truncate_text;

/// How many of the most used models are kept after a refresh.
pub const POPULAR_MODEL_LIMIT: usize = 50;
pub const DEFAULT_MAX_AGE_DAYS: i64 = 5;

#[derive(Debug, Clone, PartialEq)]
pub struct RefreshOutcome {
    pub refreshed: bool,
    pub new_models: Vec<String>,
    pub checked_on: Option<NaiveDate>,
}

/// Model whitelist backed by the settings store, refreshed from the
/// service's usage statistics at most every few days.
pub struct ModelCatalogCache {
    config: HordeConfig,
    transport: Arc<dyn Transport>,
    settings: SettingsStore,
    catalog: ModelCatalog,
    reference: Option<Map<String, Value>>,
    events: Option<EventWriter>,
}

impl ModelCatalogCache {
    pub fn new(client: &HordeClient, mut settings: SettingsStore) -> Self {
        let catalog =
            ModelCatalog::from_names(&settings.models(), &settings.inpainting_models());
        Self {
            config: client.config().clone(),
            transport: client.transport(),
            settings,
            catalog,
            reference: None,
            events: None,
        }
    }

    pub fn with_events(mut self, events: EventWriter) -> Self {
        self.events = Some(events);
        self
    }

    pub fn catalog(&self) -> &ModelCatalog {
        &self.catalog
    }

    pub fn into_parts(self) -> (ModelCatalog, SettingsStore) {
        (self.catalog, self.settings)
    }

    pub fn refresh_if_stale(&mut self, max_age_days: i64, today: NaiveDate) -> Result<RefreshOutcome> {
        let last_checked = self.settings.models_checked();
        if let Some(last) = last_checked {
            let age = today.signed_duration_since(last).num_days();
            if (0..max_age_days).contains(&age) {
                return Ok(RefreshOutcome {
                    refreshed: false,
                    new_models: Vec::new(),
                    checked_on: Some(last),
                });
            }
        }
        self.refresh(today)
    }

    pub fn refresh(&mut self, today: NaiveDate) -> Result<RefreshOutcome> {
        let credential = self.settings.credential();
        let url = self.config.endpoint("stats/img/models?model_state=known");
        let reply = self.transport.get(&url, &self.headers(&credential))?;
        if !reply.is_success() {
            return Err(HordeError::ServiceRejected {
                status: reply.status,
                message: format!(
                    "model statistics unavailable: {}",
                    truncate_text(&reply.text(), 200)
                ),
                rc: None,
                help_url: None,
            });
        }
        let body = reply.parse_json().ok_or_else(|| {
            HordeError::Decode("model statistics response is not JSON".to_string())
        })?;
        let counts = popular_models(&body)?;

        let new_models = self.catalog.merge_popularity(&counts);
        let generic = self.catalog.names_for(GenerationMode::TextToImage);
        let inpainting = self.catalog.names_for(GenerationMode::Inpainting);
        self.settings
            .set_models(&generic, &inpainting)
            .map_err(HordeError::storage)?;
        self.settings
            .set_models_checked(today)
            .map_err(HordeError::storage)?;

        info!(
            models = self.catalog.len(),
            new_models = new_models.len(),
            "model catalog refreshed"
        );
        self.emit(
            JobEvent::CatalogRefreshed,
            json!({
                "models": generic,
                "inpainting_models": inpainting,
                "new_models": new_models,
                "checked_on": today.format("%Y-%m-%d").to_string(),
            }),
        );
        Ok(RefreshOutcome {
            refreshed: true,
            new_models,
            checked_on: Some(today),
        })
    }

    /// Requirements for `model` from the reference document, fetched once
    /// per cache instance.
    pub fn requirements(&mut self, model: &str) -> Result<Option<ModelRequirements>> {
        if let Some(requirements) = self
            .catalog
            .get(model)
            .and_then(|entry| entry.requirements.clone())
        {
            return Ok(Some(requirements));
        }
        let reference = self.reference()?;
        let Some(raw) = reference
            .get(model)
            .and_then(|entry| entry.get("requirements"))
            .and_then(Value::as_object)
        else {
            return Ok(None);
        };
        let requirements = ModelRequirements::from_reference(raw);
        if requirements.is_empty() {
            return Ok(None);
        }
        self.catalog.set_requirements(model, requirements.clone());
        Ok(Some(requirements))
    }

    /// Forces the request's parameters into its model's requirements.
    /// An unreachable reference document is reported as a note, not an error.
    pub fn normalize(&mut self, request: &mut GenerationRequest) -> Vec<String> {
        let model = match request
            .model
            .as_deref()
            .map(str::trim)
            .filter(|name| !name.is_empty())
        {
            Some(name) if self.catalog.ensure(name, request.mode).is_some() => name.to_string(),
            _ => match self.catalog.names_for(request.mode).into_iter().next() {
                Some(name) => name,
                None => return Vec::new(),
            },
        };
        match self.requirements(&model) {
            Ok(Some(requirements)) => requirements.apply(&mut request.params),
            Ok(None) => Vec::new(),
            Err(err) => {
                warn!(model = %model, error = %err, "model requirements unavailable");
                vec![format!("Requirements for '{model}' unavailable: {err}")]
            }
        }
    }

    fn reference(&mut self) -> Result<&Map<String, Value>> {
        if self.reference.is_none() {
            let url = self.config.model_reference_url.clone();
            let reply = self.transport.get(&url, &[])?;
            if !reply.is_success() {
                return Err(HordeError::Transport {
                    url,
                    message: format!("model reference download failed ({})", reply.status),
                });
            }
            let parsed = reply
                .parse_json()
                .and_then(|value| value.as_object().cloned())
                .ok_or_else(|| HordeError::Decode("model reference is not a JSON object".to_string()))?;
            self.reference = Some(parsed);
        }
        self.reference
            .as_ref()
            .ok_or_else(|| HordeError::Decode("model reference missing".to_string()))
    }

    fn headers<'a>(&'a self, credential: &'a Credential) -> [(&'static str, &'a str); 2] {
        [
            ("apikey", credential.header_value()),
            ("Client-Agent", self.config.client_agent.as_str()),
        ]
    }

    fn emit(&self, event: JobEvent, fields: Value) {
        let Some(events) = &self.events else {
            return;
        };
        if let Err(err) = events.emit(event, None, fields) {
            warn!(event = event.as_str(), error = %err, "failed to write event");
        }
    }
}

/// Monthly usage counts, most used first, capped at [`POPULAR_MODEL_LIMIT`].
fn popular_models(body: &Value) -> Result<Vec<(String, u64)>> {
    let Some(month) = body.get("month").and_then(Value::as_object) else {
        return Err(HordeError::Decode(
            "model statistics have no 'month' counts".to_string(),
        ));
    };
    let mut counts: Vec<(String, u64)> = month
        .iter()
        .filter_map(|(name, count)| {
            let name = name.trim();
            if name.is_empty() {
                return None;
            }
            Some((name.to_string(), count.as_u64().unwrap_or(0)))
        })
        .collect();
    counts.sort_by(|a, b| b.1.cmp(&a.1).then_with(|| a.0.cmp(&b.0)));
    counts.truncate(POPULAR_MODEL_LIMIT);
    Ok(counts)
}
