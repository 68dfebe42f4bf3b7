use std::time::Duration;

use horde_contracts::status::JobStatus;
use thiserror::Error;

pub type Result<T> = std::result::Result<T, HordeError>;

/// Every way a generation can end without images.
#[derive(Debug, Error)]
pub enum HordeError {
    #[error("network request failed ({url}): {message}")]
    Transport { url: String, message: String },

    #[error("service rejected the request ({status}): {message}")]
    ServiceRejected {
        status: u16,
        message: String,
        rc: Option<String>,
        help_url: Option<String>,
    },

    #[error("no active worker can serve this request; try another model or size")]
    NoWorkerAvailable { status: Box<JobStatus> },

    #[error("job did not finish within {}s", .budget.as_secs())]
    Timeout {
        budget: Duration,
        status: Box<JobStatus>,
        status_url: String,
    },

    #[error("invalid request: {0}")]
    InvalidRequest(String),

    #[error("job abandoned; results remain available at {status_url}")]
    Abandoned { status_url: String },

    #[error("unexpected response: {0}")]
    Decode(String),

    #[error("file write failed: {0}")]
    Io(#[from] std::io::Error),

    #[error("storage failed: {0}")]
    Storage(String),
}

impl HordeError {
    /// Link worth showing next to the message, if any.
    pub fn help_url(&self) -> Option<&str> {
        match self {
            Self::ServiceRejected { help_url, .. } => help_url.as_deref(),
            _ => None,
        }
    }

    /// Status endpoint that still holds the job's results, if it may finish later.
    pub fn status_url(&self) -> Option<&str> {
        match self {
            Self::Timeout { status_url, .. } | Self::Abandoned { status_url } => {
                Some(status_url.as_str())
            }
            _ => None,
        }
    }

    pub fn kind(&self) -> &'static str {
        match self {
            Self::Transport { .. } => "transport",
            Self::ServiceRejected { .. } => "service_rejected",
            Self::NoWorkerAvailable { .. } => "no_worker_available",
            Self::Timeout { .. } => "timeout",
            Self::InvalidRequest(_) => "invalid_request",
            Self::Abandoned { .. } => "abandoned",
            Self::Decode(_) => "decode",
            Self::Io(_) => "io",
            Self::Storage(_) => "storage",
        }
    }

    pub(crate) fn storage(err: anyhow::Error) -> Self {
        Self::Storage(format!("{err:#}"))
    }
}
