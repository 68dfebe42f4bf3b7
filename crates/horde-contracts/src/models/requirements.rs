use std::collections::BTreeMap;

use serde_json::{Map, Value};

use crate::request::GenerationParams;

#[derive(Debug, Clone, PartialEq)]
pub enum Requirement {
    Fixed(Value),
    Range { min: f64, max: f64 },
    /// Any listed value is accepted; the first one is the fallback.
    OneOf(Vec<Value>),
}

/// Per-model parameter constraints taken from the model reference document.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ModelRequirements {
    entries: BTreeMap<String, Requirement>,
}

impl ModelRequirements {
    /// Builds requirements from a reference `requirements` object.
    /// `min_x`/`max_x` pairs become ranges, lists become allowed sets.
    pub fn from_reference(raw: &Map<String, Value>) -> Self {
        let mut entries = BTreeMap::new();
        let mut bounds: BTreeMap<String, (Option<f64>, Option<f64>)> = BTreeMap::new();

        for (key, value) in raw {
            if let Some(param) = key.strip_prefix("min_") {
                if let Some(number) = value.as_f64() {
                    bounds.entry(param_name(param)).or_default().0 = Some(number);
                }
                continue;
            }
            if let Some(param) = key.strip_prefix("max_") {
                if let Some(number) = value.as_f64() {
                    bounds.entry(param_name(param)).or_default().1 = Some(number);
                }
                continue;
            }
            let requirement = match value {
                Value::Array(items) if items.is_empty() => continue,
                Value::Array(items) => Requirement::OneOf(items.clone()),
                Value::Null => continue,
                other => Requirement::Fixed(other.clone()),
            };
            entries.insert(param_name(key), requirement);
        }

        for (param, (min, max)) in bounds {
            if entries.contains_key(&param) {
                continue;
            }
            let min = min.unwrap_or(f64::MIN);
            let max = max.unwrap_or(f64::MAX);
            if min <= max {
                entries.insert(param, Requirement::Range { min, max });
            }
        }
        Self { entries }
    }

    pub fn get(&self, param: &str) -> Option<&Requirement> {
        self.entries.get(param)
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn insert(&mut self, param: &str, requirement: Requirement) {
        self.entries.insert(param.to_string(), requirement);
    }

    /// Forces `params` into the constraints. Returns one note per change.
    pub fn apply(&self, params: &mut GenerationParams) -> Vec<String> {
        let mut notes = Vec::new();
        for (param, requirement) in &self.entries {
            match param.as_str() {
                "steps" => {
                    let current = f64::from(params.steps);
                    if let Some(next) = constrain_number(requirement, current) {
                        let next = next.round().clamp(1.0, 150.0) as u32;
                        if next != params.steps {
                            notes.push(describe(param, requirement, &params.steps.to_string()));
                            params.steps = next;
                        }
                    }
                }
                "cfg_scale" => {
                    if let Some(next) = constrain_number(requirement, params.cfg_scale) {
                        let next = next.clamp(0.0, 20.0);
                        if (next - params.cfg_scale).abs() > f64::EPSILON {
                            notes.push(describe(param, requirement, &params.cfg_scale.to_string()));
                            params.cfg_scale = next;
                        }
                    }
                }
                "sampler_name" => {
                    let current = Value::String(params.sampler_name.clone());
                    if let Some(Value::String(sampler)) = constrain_value(requirement, &current) {
                        if sampler != params.sampler_name {
                            notes.push(describe(param, requirement, &params.sampler_name));
                            params.sampler_name = sampler;
                        }
                    }
                }
                "karras" => {
                    let current = Value::Bool(params.karras);
                    if let Some(Value::Bool(karras)) = constrain_value(requirement, &current) {
                        if karras != params.karras {
                            notes.push(describe(param, requirement, &params.karras.to_string()));
                            params.karras = karras;
                        }
                    }
                }
                _ => {}
            }
        }
        notes
    }
}

fn param_name(key: &str) -> String {
    match key {
        "samplers" | "sampler" => "sampler_name".to_string(),
        "cfg" => "cfg_scale".to_string(),
        other => other.to_string(),
    }
}

fn constrain_number(requirement: &Requirement, current: f64) -> Option<f64> {
    match requirement {
        Requirement::Fixed(value) => value.as_f64(),
        Requirement::Range { min, max } => Some(current.clamp(*min, *max)),
        Requirement::OneOf(allowed) => {
            let numbers: Vec<f64> = allowed.iter().filter_map(Value::as_f64).collect();
            if numbers
                .iter()
                .any(|number| (number - current).abs() <= f64::EPSILON)
            {
                Some(current)
            } else {
                numbers.first().copied()
            }
        }
    }
}

/// Value `current` must become; `None` when the requirement does not apply.
fn constrain_value(requirement: &Requirement, current: &Value) -> Option<Value> {
    match requirement {
        Requirement::Fixed(value) => Some(value.clone()),
        Requirement::Range { .. } => None,
        Requirement::OneOf(allowed) => {
            if allowed.contains(current) {
                Some(current.clone())
            } else {
                allowed.first().cloned()
            }
        }
    }
}

fn describe(param: &str, requirement: &Requirement, previous: &str) -> String {
    match requirement {
        Requirement::Fixed(value) => format!(
            "{param} fixed to {} by model requirements (was {previous}).",
            plain_text(value)
        ),
        Requirement::Range { min, max } => {
            format!("{param} clamped to {min}..{max} by model requirements (was {previous}).")
        }
        Requirement::OneOf(allowed) => {
            let allowed: Vec<String> = allowed.iter().map(plain_text).collect();
            format!(
                "{param} must be one of {} by model requirements (was {previous}).",
                allowed.join(", ")
            )
        }
    }
}

fn plain_text(value: &Value) -> String {
    match value {
        Value::String(text) => text.clone(),
        other => other.to_string(),
    }
}
