use indexmap::IndexMap;

use super::requirements::ModelRequirements;
use crate::request::GenerationMode;

#[derive(Debug, Clone, PartialEq)]
pub struct ModelEntry {
    pub name: String,
    pub popularity: u64,
    pub inpainting: bool,
    pub requirements: Option<ModelRequirements>,
}

impl ModelEntry {
    fn new(name: &str) -> Self {
        Self {
            name: name.to_string(),
            popularity: 0,
            inpainting: is_inpainting_name(name),
            requirements: None,
        }
    }

    pub fn suits(&self, mode: GenerationMode) -> bool {
        match mode {
            GenerationMode::Inpainting => self.inpainting,
            GenerationMode::TextToImage | GenerationMode::ImageToImage => !self.inpainting,
        }
    }
}

pub fn is_inpainting_name(name: &str) -> bool {
    name.to_ascii_lowercase().contains("inpainting")
}

/// Whitelist of model names the client will submit.
#[derive(Debug, Clone)]
pub struct ModelCatalog {
    models: IndexMap<String, ModelEntry>,
}

impl ModelCatalog {
    pub fn new(models: Option<IndexMap<String, ModelEntry>>) -> Self {
        Self {
            models: models.unwrap_or_else(default_models),
        }
    }

    /// Catalog rebuilt from persisted name lists; empty lists keep the defaults.
    pub fn from_names(generic: &[String], inpainting: &[String]) -> Self {
        let mut catalog = Self::new(None);
        let total = generic.len() + inpainting.len();
        if total == 0 {
            return catalog;
        }
        catalog.models.clear();
        for (rank, name) in generic.iter().chain(inpainting.iter()).enumerate() {
            let name = name.trim();
            if name.is_empty() || catalog.models.contains_key(name) {
                continue;
            }
            let mut entry = ModelEntry::new(name);
            entry.popularity = (total - rank) as u64;
            catalog.models.insert(name.to_string(), entry);
        }
        catalog
    }

    pub fn get(&self, name: &str) -> Option<&ModelEntry> {
        self.models.get(name)
    }

    pub fn contains(&self, name: &str) -> bool {
        self.models.contains_key(name)
    }

    pub fn list(&self) -> impl Iterator<Item = &ModelEntry> {
        self.models.values()
    }

    pub fn len(&self) -> usize {
        self.models.len()
    }

    pub fn is_empty(&self) -> bool {
        self.models.is_empty()
    }

    /// Entries suited to `mode`, most popular first. Ties keep insertion order.
    pub fn by_mode(&self, mode: GenerationMode) -> Vec<ModelEntry> {
        let mut entries: Vec<ModelEntry> = self
            .list()
            .filter(|entry| entry.suits(mode))
            .cloned()
            .collect();
        entries.sort_by(|a, b| b.popularity.cmp(&a.popularity));
        entries
    }

    pub fn names_for(&self, mode: GenerationMode) -> Vec<String> {
        self.by_mode(mode)
            .into_iter()
            .map(|entry| entry.name)
            .collect()
    }

    pub fn ensure(&self, name: &str, mode: GenerationMode) -> Option<ModelEntry> {
        let entry = self.get(name)?;
        if entry.suits(mode) {
            return Some(entry.clone());
        }
        None
    }

    /// Merges observed usage counts. Returns names the catalog had not seen
    /// before, in observation order.
    pub fn merge_popularity(&mut self, counts: &[(String, u64)]) -> Vec<String> {
        let mut discovered = Vec::new();
        for (name, count) in counts {
            let name = name.trim();
            if name.is_empty() {
                continue;
            }
            match self.models.get_mut(name) {
                Some(entry) => entry.popularity = *count,
                None => {
                    let mut entry = ModelEntry::new(name);
                    entry.popularity = *count;
                    self.models.insert(name.to_string(), entry);
                    discovered.push(name.to_string());
                }
            }
        }
        discovered
    }

    pub fn set_requirements(&mut self, name: &str, requirements: ModelRequirements) -> bool {
        match self.models.get_mut(name) {
            Some(entry) => {
                entry.requirements = Some(requirements);
                true
            }
            None => false,
        }
    }
}

fn default_models() -> IndexMap<String, ModelEntry> {
    let mut map = IndexMap::new();
    let mut insert = |name: &str| {
        map.insert(name.to_string(), ModelEntry::new(name));
    };

    insert("stable_diffusion");
    insert("stable_diffusion_2.1");
    insert("Deliberate");
    insert("Dreamshaper");
    insert("SDXL 1.0");
    insert("Realistic Vision");
    insert("stable_diffusion_inpainting");
    insert("Deliberate Inpainting");
    insert("Realistic Vision Inpainting");

    map
}
