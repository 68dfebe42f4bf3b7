pub mod catalog;
pub mod client;
pub mod config;
pub mod error;
pub mod jobs;
pub mod progress;
pub mod transport;

#[cfg(test)]
mod testing;

pub use catalog::{ModelCatalogCache, RefreshOutcome};
pub use client::{FetchOutcome, GenerationOutcome, HordeClient, JobHandle, PreparedSubmission};
pub use config::HordeConfig;
pub use error::{HordeError, Result};
pub use jobs::{spawn_generation, CancelToken, JobThread};
pub use progress::{EventReporter, MultiReporter, NullReporter, ProgressGuard, ProgressReporter};

fn truncate_text(value: &str, max_chars: usize) -> String {
    if value.chars().count() <= max_chars {
        return value.to_string();
    }
    value.chars().take(max_chars).collect::<String>() + "…"
}

fn push_unique_warning(warnings: &mut Vec<String>, message: String) {
    if message.trim().is_empty() {
        return;
    }
    if warnings.iter().any(|existing| existing == &message) {
        return;
    }
    warnings.push(message);
}
