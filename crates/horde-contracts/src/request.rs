use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Key the service accepts for unregistered, lowest-priority users.
pub const ANONYMOUS_API_KEY: &str = "0000000000";
pub const MAX_PROMPT_CHARS: usize = 1000;
pub const NEGATIVE_PROMPT_SEPARATOR: &str = " ### ";
pub const SOURCE_MIN_SIDE: u32 = 384;
pub const SOURCE_MAX_SIDE: u32 = 1024;
pub const MAX_WAIT_MINUTES: u32 = 60;
pub const MAX_IMAGES_PER_REQUEST: u32 = 10;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum GenerationMode {
    #[default]
    TextToImage,
    ImageToImage,
    Inpainting,
}

impl GenerationMode {
    pub fn parse(raw: &str) -> Option<Self> {
        match raw.trim().to_ascii_lowercase().as_str() {
            "text2img" | "txt2img" | "t2i" | "text" | "text_to_image" => Some(Self::TextToImage),
            "img2img" | "i2i" | "image" | "image_to_image" => Some(Self::ImageToImage),
            "inpainting" | "inpaint" => Some(Self::Inpainting),
            _ => None,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::TextToImage => "text2img",
            Self::ImageToImage => "img2img",
            Self::Inpainting => "inpainting",
        }
    }

    pub fn source_processing(self) -> Option<&'static str> {
        match self {
            Self::TextToImage => None,
            Self::ImageToImage => Some("img2img"),
            Self::Inpainting => Some("inpainting"),
        }
    }

    pub fn needs_source(self) -> bool {
        self.source_processing().is_some()
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub enum Credential {
    ApiKey(String),
    #[default]
    Anonymous,
}

impl Credential {
    /// Blank values and the anonymous sentinel both resolve to `Anonymous`.
    pub fn from_optional(raw: Option<&str>) -> Self {
        match raw.map(str::trim).filter(|value| !value.is_empty()) {
            Some(value) if value != ANONYMOUS_API_KEY => Self::ApiKey(value.to_string()),
            _ => Self::Anonymous,
        }
    }

    pub fn header_value(&self) -> &str {
        match self {
            Self::ApiKey(key) => key.as_str(),
            Self::Anonymous => ANONYMOUS_API_KEY,
        }
    }

    pub fn is_anonymous(&self) -> bool {
        matches!(self, Self::Anonymous)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GenerationParams {
    pub cfg_scale: f64,
    pub steps: u32,
    pub width: u32,
    pub height: u32,
    pub sampler_name: String,
    pub init_strength: f64,
    pub seed: Option<String>,
    pub n: u32,
    pub karras: bool,
}

impl Default for GenerationParams {
    fn default() -> Self {
        Self {
            cfg_scale: 8.0,
            steps: 25,
            width: 512,
            height: 512,
            sampler_name: "k_euler".to_string(),
            init_strength: 0.3,
            seed: None,
            n: 1,
            karras: false,
        }
    }
}

/// Source bitmap for img2img and inpainting, already base64 encoded.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SourceImage {
    pub data: String,
    pub width: u32,
    pub height: u32,
    pub has_alpha: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GenerationRequest {
    pub prompt: String,
    #[serde(default)]
    pub negative_prompt: Option<String>,
    #[serde(default)]
    pub mode: GenerationMode,
    #[serde(default)]
    pub model: Option<String>,
    #[serde(default)]
    pub params: GenerationParams,
    #[serde(default)]
    pub source_image: Option<SourceImage>,
    #[serde(default)]
    pub nsfw: bool,
    #[serde(default)]
    pub censor_nsfw: bool,
    #[serde(skip)]
    pub credential: Credential,
    #[serde(default = "default_max_wait_minutes")]
    pub max_wait_minutes: u32,
}

impl GenerationRequest {
    pub fn new(prompt: impl Into<String>) -> Self {
        Self {
            prompt: prompt.into(),
            negative_prompt: None,
            mode: GenerationMode::TextToImage,
            model: None,
            params: GenerationParams::default(),
            source_image: None,
            nsfw: false,
            censor_nsfw: false,
            credential: Credential::Anonymous,
            max_wait_minutes: default_max_wait_minutes(),
        }
    }

    /// Prompt as sent on the wire, with the negative prompt folded in.
    pub fn full_prompt(&self) -> String {
        let prompt = self.prompt.trim();
        match self
            .negative_prompt
            .as_deref()
            .map(str::trim)
            .filter(|value| !value.is_empty())
        {
            Some(negative) => format!("{prompt}{NEGATIVE_PROMPT_SEPARATOR}{negative}"),
            None => prompt.to_string(),
        }
    }

    pub fn wait_budget(&self) -> Duration {
        Duration::from_secs(u64::from(self.max_wait_minutes) * 60)
    }

    pub fn validate(&self) -> Result<(), String> {
        let prompt = self.prompt.trim();
        if prompt.is_empty() {
            return Err("Please enter a prompt.".to_string());
        }
        if self.full_prompt().chars().count() > MAX_PROMPT_CHARS {
            return Err(format!(
                "Prompt exceeds {MAX_PROMPT_CHARS} characters."
            ));
        }

        let params = &self.params;
        if !params.cfg_scale.is_finite() || !(0.0..=20.0).contains(&params.cfg_scale) {
            return Err(format!(
                "cfg_scale must be between 0 and 20 (got {}).",
                params.cfg_scale
            ));
        }
        if !(1..=150).contains(&params.steps) {
            return Err(format!(
                "steps must be between 1 and 150 (got {}).",
                params.steps
            ));
        }
        if !(1..=MAX_IMAGES_PER_REQUEST).contains(&params.n) {
            return Err(format!(
                "Image count must be between 1 and {MAX_IMAGES_PER_REQUEST} (got {}).",
                params.n
            ));
        }
        if !params.init_strength.is_finite() || !(0.0..=1.0).contains(&params.init_strength) {
            return Err(format!(
                "init_strength must be between 0 and 1 (got {}).",
                params.init_strength
            ));
        }
        if params.width == 0 || params.height == 0 {
            return Err("Requested width and height must be positive.".to_string());
        }
        if params.sampler_name.trim().is_empty() {
            return Err("sampler_name must not be empty.".to_string());
        }
        if !(1..=MAX_WAIT_MINUTES).contains(&self.max_wait_minutes) {
            return Err(format!(
                "Max wait must be between 1 and {MAX_WAIT_MINUTES} minutes (got {}).",
                self.max_wait_minutes
            ));
        }

        if self.mode.needs_source() {
            let Some(source) = self.source_image.as_ref() else {
                return Err(format!(
                    "Mode '{}' requires a source image.",
                    self.mode.as_str()
                ));
            };
            if source.data.trim().is_empty() {
                return Err("Source image payload is empty.".to_string());
            }
            let in_bounds = |side: u32| (SOURCE_MIN_SIDE..=SOURCE_MAX_SIDE).contains(&side);
            if !in_bounds(source.width) || !in_bounds(source.height) {
                return Err(format!(
                    "Your image needs to be between {SOURCE_MIN_SIDE}x{SOURCE_MIN_SIDE} and {SOURCE_MAX_SIDE}x{SOURCE_MAX_SIDE} (got {}x{}).",
                    source.width, source.height
                ));
            }
            if self.mode == GenerationMode::Inpainting && !source.has_alpha {
                return Err(
                    "When inpainting, the image must have an alpha channel.".to_string(),
                );
            }
        }
        Ok(())
    }
}

/// What actually goes on the wire after model selection and size fitting.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResolvedRequest {
    pub model: String,
    pub width: u32,
    pub height: u32,
    pub fallback_reason: Option<String>,
    #[serde(default)]
    pub warnings: Vec<String>,
}

/// Grid of sizes the service accepts.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DimensionPolicy {
    pub grid: u32,
    pub min_side: u32,
    pub max_side: u32,
    pub max_pixels: u64,
}

impl Default for DimensionPolicy {
    fn default() -> Self {
        Self {
            grid: 64,
            min_side: 64,
            max_side: 3072,
            max_pixels: 1024 * 1024,
        }
    }
}

impl DimensionPolicy {
    /// Fits a requested size onto the grid, scaling proportionally when the
    /// pixel budget is exceeded. Both sides come back as positive multiples
    /// of `grid` and their product never exceeds the (effective) budget.
    pub fn fit(&self, width: u32, height: u32) -> (u32, u32) {
        let grid = self.grid.max(1);
        let min_side = round_up(self.min_side.max(grid), grid);
        let max_side = round_down(self.max_side, grid).max(min_side);
        let max_pixels = self.effective_max_pixels();

        let mut w = f64::from(width.max(1));
        let mut h = f64::from(height.max(1));
        let pixels = w * h;
        if pixels > max_pixels as f64 {
            let scale = (max_pixels as f64 / pixels).sqrt();
            w *= scale;
            h *= scale;
        }

        let mut w = round_down(w.floor() as u32, grid).clamp(min_side, max_side);
        let mut h = round_down(h.floor() as u32, grid).clamp(min_side, max_side);
        while u64::from(w) * u64::from(h) > max_pixels && (w > min_side || h > min_side) {
            if w >= h {
                w -= grid;
            } else {
                h -= grid;
            }
        }
        (w, h)
    }

    /// Budget actually enforced: never below one minimum-size tile.
    pub fn effective_max_pixels(&self) -> u64 {
        self.max_pixels.max(self.min_pixels())
    }

    /// Area of the smallest image the grid allows.
    pub fn min_pixels(&self) -> u64 {
        let grid = self.grid.max(1);
        let min_side = u64::from(round_up(self.min_side.max(grid), grid));
        min_side * min_side
    }
}

fn round_down(value: u32, grid: u32) -> u32 {
    (value / grid) * grid
}

fn round_up(value: u32, grid: u32) -> u32 {
    value.div_ceil(grid) * grid
}

fn default_max_wait_minutes() -> u32 {
    10
}
