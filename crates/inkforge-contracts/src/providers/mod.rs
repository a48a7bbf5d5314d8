use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::request::Mode;

/// The closed set of image backends the plugin can talk to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ProviderKind {
    #[serde(rename = "openai")]
    OpenAi,
    Stability,
    Replicate,
    Local,
}

impl ProviderKind {
    pub const ALL: [ProviderKind; 4] = [
        ProviderKind::OpenAi,
        ProviderKind::Stability,
        ProviderKind::Replicate,
        ProviderKind::Local,
    ];

    pub fn name(self) -> &'static str {
        self.config().name
    }

    pub fn config(self) -> &'static ProviderConfig {
        match self {
            ProviderKind::OpenAi => &OPENAI,
            ProviderKind::Stability => &STABILITY,
            ProviderKind::Replicate => &REPLICATE,
            ProviderKind::Local => &LOCAL,
        }
    }
}

impl fmt::Display for ProviderKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

impl FromStr for ProviderKind {
    type Err = String;

    fn from_str(raw: &str) -> Result<Self, Self::Err> {
        let normalized = raw.trim().to_ascii_lowercase();
        ProviderKind::ALL
            .into_iter()
            .find(|kind| kind.name() == normalized)
            .ok_or_else(|| {
                format!(
                    "Unknown provider '{}'. Expected one of: {}.",
                    raw.trim(),
                    ProviderKind::ALL.map(ProviderKind::name).join(", ")
                )
            })
    }
}

/// Static description of one provider's HTTP surface and capabilities.
#[derive(Debug, PartialEq, Eq)]
pub struct ProviderConfig {
    pub name: &'static str,
    pub display_name: &'static str,
    pub generate_endpoint: &'static str,
    pub edit_endpoint: Option<&'static str>,
    pub variation_endpoint: Option<&'static str>,
    pub img2img_endpoint: Option<&'static str>,
    pub env_key_name: Option<&'static str>,
    pub config_key_name: Option<&'static str>,
    pub supported_models: &'static [&'static str],
    pub supported_sizes: &'static [&'static str],
    /// Modes the provider can serve, natively or by img2img fallback.
    pub modes: &'static [Mode],
}

impl ProviderConfig {
    pub fn supports(&self, mode: Mode) -> bool {
        self.modes.contains(&mode)
    }

    pub fn supports_model(&self, model: &str) -> bool {
        self.supported_models.iter().any(|item| *item == model)
    }

    pub fn supports_size(&self, size: &str) -> bool {
        self.supported_sizes.iter().any(|item| *item == size)
    }

    pub fn requires_api_key(&self) -> bool {
        self.env_key_name.is_some() || self.config_key_name.is_some()
    }

    pub fn default_model(&self) -> &'static str {
        self.supported_models.first().copied().unwrap_or("default")
    }
}

pub static OPENAI: ProviderConfig = ProviderConfig {
    name: "openai",
    display_name: "OpenAI DALL-E",
    generate_endpoint: "https://api.openai.com/v1/images/generations",
    edit_endpoint: Some("https://api.openai.com/v1/images/edits"),
    variation_endpoint: Some("https://api.openai.com/v1/images/variations"),
    img2img_endpoint: None,
    env_key_name: Some("OPENAI_API_KEY"),
    config_key_name: Some("openai_api_key"),
    supported_models: &["dall-e-3", "dall-e-2", "gpt-image-1"],
    supported_sizes: &["1024x1024", "1024x1792", "1792x1024", "512x512", "256x256"],
    modes: &[Mode::Generate, Mode::Edit, Mode::Variation],
};

pub static STABILITY: ProviderConfig = ProviderConfig {
    name: "stability",
    display_name: "Stability AI",
    generate_endpoint: "https://api.stability.ai/v1/generation/{engine}/text-to-image",
    edit_endpoint: Some("https://api.stability.ai/v1/generation/{engine}/image-to-image/masking"),
    variation_endpoint: None,
    img2img_endpoint: Some("https://api.stability.ai/v1/generation/{engine}/image-to-image"),
    env_key_name: Some("STABILITY_API_KEY"),
    config_key_name: Some("stability_api_key"),
    supported_models: &[
        "stable-diffusion-xl-1024-v1-0",
        "stable-diffusion-v1-6",
        "stable-diffusion-xl-beta-v2-2-2",
    ],
    supported_sizes: &["1024x1024", "1152x896", "896x1152", "1216x832", "832x1216", "512x512"],
    modes: &[Mode::Generate, Mode::Edit, Mode::Variation, Mode::Img2Img],
};

pub static REPLICATE: ProviderConfig = ProviderConfig {
    name: "replicate",
    display_name: "Replicate",
    generate_endpoint: "https://api.replicate.com/v1/predictions",
    edit_endpoint: None,
    variation_endpoint: None,
    img2img_endpoint: None,
    env_key_name: Some("REPLICATE_API_TOKEN"),
    config_key_name: Some("replicate_api_key"),
    supported_models: &[
        "stability-ai/sdxl",
        "black-forest-labs/flux-schnell",
        "black-forest-labs/flux-pro",
    ],
    supported_sizes: &["1024x1024", "1024x768", "768x1024", "512x512"],
    modes: &[Mode::Generate],
};

pub static LOCAL: ProviderConfig = ProviderConfig {
    name: "local",
    display_name: "Local (Automatic1111/ComfyUI)",
    generate_endpoint: "http://127.0.0.1:7860/sdapi/v1/txt2img",
    edit_endpoint: Some("http://127.0.0.1:7860/sdapi/v1/img2img"),
    variation_endpoint: None,
    img2img_endpoint: Some("http://127.0.0.1:7860/sdapi/v1/img2img"),
    env_key_name: None,
    config_key_name: None,
    supported_models: &["default"],
    supported_sizes: &["1024x1024", "768x768", "512x512", "768x512", "512x768"],
    modes: &[Mode::Generate, Mode::Edit, Mode::Variation, Mode::Img2Img],
};
