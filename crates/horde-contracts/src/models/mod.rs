mod registry;
mod requirements;
mod selectors;

pub use registry::{is_inpainting_name, ModelCatalog, ModelEntry};
pub use requirements::{ModelRequirements, Requirement};
pub use selectors::{ModelSelection, ModelSelector};
