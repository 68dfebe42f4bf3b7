use std::env;
use std::time::Duration;

use horde_contracts::request::DimensionPolicy;
use tracing::warn;

pub const DEFAULT_API_BASE: &str = "https://stablehorde.net/api/v2";
pub const DEFAULT_MODEL_REFERENCE_URL: &str =
    "https://raw.githubusercontent.com/Haidra-Org/AI-Horde-image-model-reference/main/stable_diffusion.json";
pub const REGISTER_URL: &str = "https://stablehorde.net/register";

/// Shortest pause between two status checks.
pub const CHECK_WAIT: Duration = Duration::from_secs(5);
/// Longest pause between two status checks.
pub const MAX_TIME_REFRESH: Duration = Duration::from_secs(15);
pub const PROGRESS_TICK: Duration = Duration::from_millis(500);
pub const REQUEST_TIMEOUT: Duration = Duration::from_secs(30);

#[derive(Debug, Clone, PartialEq)]
pub struct HordeConfig {
    pub api_base: String,
    pub client_agent: String,
    pub model_reference_url: String,
    pub request_timeout: Duration,
    pub check_wait: Duration,
    pub max_time_refresh: Duration,
    pub tick: Duration,
    pub dimensions: DimensionPolicy,
}

impl Default for HordeConfig {
    fn default() -> Self {
        Self {
            api_base: DEFAULT_API_BASE.to_string(),
            client_agent: default_client_agent(),
            model_reference_url: DEFAULT_MODEL_REFERENCE_URL.to_string(),
            request_timeout: REQUEST_TIMEOUT,
            check_wait: CHECK_WAIT,
            max_time_refresh: MAX_TIME_REFRESH,
            tick: PROGRESS_TICK,
            dimensions: DimensionPolicy::default(),
        }
    }
}

impl HordeConfig {
    /// Defaults overridden by `HORDE_*` environment variables.
    pub fn from_env() -> Self {
        let mut config = Self::default();
        if let Some(base) = non_empty_env("HORDE_API_BASE") {
            config.api_base = base.trim_end_matches('/').to_string();
        }
        if let Some(agent) = non_empty_env("HORDE_CLIENT_AGENT") {
            config.client_agent = agent;
        }
        if let Some(url) = non_empty_env("HORDE_MODEL_REFERENCE_URL") {
            config.model_reference_url = url;
        }
        if let Some(secs) = non_empty_env("HORDE_REQUEST_TIMEOUT")
            .and_then(|value| value.parse::<f64>().ok())
            .filter(|value| value.is_finite() && *value > 0.0)
        {
            config.request_timeout = Duration::from_secs_f64(secs.clamp(1.0, 600.0));
        }
        if let Some(pixels) = max_pixels_override(
            non_empty_env("HORDE_MAX_PIXELS").as_deref(),
            &config.dimensions,
        ) {
            config.dimensions.max_pixels = pixels;
        }
        config
    }

    pub fn with_api_base(mut self, api_base: impl Into<String>) -> Self {
        self.api_base = api_base.into().trim().trim_end_matches('/').to_string();
        self
    }

    /// Overrides poll pacing. Zero durations are bumped to one millisecond
    /// and the refresh ceiling never drops below the floor.
    pub fn with_poll_timings(
        mut self,
        check_wait: Duration,
        max_time_refresh: Duration,
        tick: Duration,
    ) -> Self {
        let floor = Duration::from_millis(1);
        self.check_wait = check_wait.max(floor);
        self.max_time_refresh = max_time_refresh.max(self.check_wait);
        self.tick = tick.max(floor);
        self
    }

    pub fn endpoint(&self, path: &str) -> String {
        format!("{}/{}", self.api_base, path.trim_start_matches('/'))
    }

    pub fn status_url(&self, job_id: &str) -> String {
        self.endpoint(&format!("generate/status/{job_id}"))
    }
}

fn default_client_agent() -> String {
    format!("horde-rs:{}:github.com/horde-rs", env!("CARGO_PKG_VERSION"))
}

/// Parses a pixel budget; budgets below one minimum-size image are ignored.
fn max_pixels_override(raw: Option<&str>, policy: &DimensionPolicy) -> Option<u64> {
    let raw = raw?;
    let Ok(pixels) = raw.parse::<u64>() else {
        warn!(value = raw, "ignoring HORDE_MAX_PIXELS: not a whole number");
        return None;
    };
    let floor = policy.min_pixels();
    if pixels < floor {
        warn!(
            value = pixels,
            minimum = floor,
            "ignoring HORDE_MAX_PIXELS: smaller than one minimum-size image"
        );
        return None;
    }
    Some(pixels)
}

fn non_empty_env(key: &str) -> Option<String> {
    env::var(key)
        .ok()
        .map(|value| value.trim().to_string())
        .filter(|value| !value.is_empty())
}
