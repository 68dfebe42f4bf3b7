use super::registry::{ModelCatalog, ModelEntry};
use crate::request::GenerationMode;

#[derive(Debug, Clone, PartialEq)]
pub struct ModelSelection {
    pub model: ModelEntry,
    pub requested: Option<String>,
    pub fallback_reason: Option<String>,
}

#[derive(Debug, Clone)]
pub struct ModelSelector {
    pub catalog: ModelCatalog,
}

impl ModelSelector {
    pub fn new(catalog: Option<ModelCatalog>) -> Self {
        Self {
            catalog: catalog.unwrap_or_else(|| ModelCatalog::new(None)),
        }
    }

    pub fn select(
        &self,
        requested: Option<&str>,
        mode: GenerationMode,
    ) -> Result<ModelSelection, String> {
        let requested = requested.map(str::trim).filter(|value| !value.is_empty());
        let (fallback_reason, requested_text) = if let Some(requested_value) = requested {
            if let Some(model) = self.catalog.ensure(requested_value, mode) {
                return Ok(ModelSelection {
                    model,
                    requested: Some(requested_value.to_string()),
                    fallback_reason: None,
                });
            }
            (
                Some(format!(
                    "Requested model '{requested_value}' unavailable for mode '{}'.",
                    mode.as_str()
                )),
                Some(requested_value.to_string()),
            )
        } else {
            (Some("No model specified; using default.".to_string()), None)
        };

        let candidates = self.catalog.by_mode(mode);
        let Some(model) = candidates.first().cloned() else {
            return Err(format!(
                "No models available for mode '{}'.",
                mode.as_str()
            ));
        };
        Ok(ModelSelection {
            model,
            requested: requested_text,
            fallback_reason,
        })
    }
}
