pub mod artifacts;
pub mod events;
pub mod models;
pub mod request;
pub mod settings;
pub mod status;
