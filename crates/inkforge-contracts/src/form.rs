use std::fmt;
use std::path::PathBuf;
use std::str::FromStr;

use serde::{Deserialize, Deserializer};

use crate::config::{Config, KeyInput};
use crate::placement::{EmbedMode, Placement, PositionPreset, ScaleMode};
use crate::providers::ProviderKind;
use crate::request::{GenerationRequest, ImageSize, MaskMode, Mode, Preset};

/// Settings submitted by the host editor's dialog, keyed by the dialog's field names.
///
/// Every field is optional; blanks fall back to presets, then `config.json`, then
/// built-in defaults.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct RequestForm {
    #[serde(deserialize_with = "blank_as_none")]
    pub operation_mode: Option<Mode>,
    #[serde(deserialize_with = "blank_as_none")]
    pub provider: Option<ProviderKind>,
    pub model: Option<String>,
    pub prompt: String,
    pub negative_prompt: Option<String>,
    pub edit_instruction: String,
    #[serde(deserialize_with = "blank_as_none")]
    pub preset: Option<Preset>,

    pub image_size: Option<String>,
    pub use_custom_size: bool,
    pub custom_width: Option<u32>,
    pub custom_height: Option<u32>,
    pub quality: Option<String>,
    pub style: Option<String>,
    /// `-1` asks for a random seed.
    pub seed: Option<i64>,
    pub batch_count: Option<u32>,
    pub cfg_scale: Option<f64>,
    pub steps: Option<u32>,
    pub img2img_strength: Option<f64>,

    #[serde(deserialize_with = "blank_as_none")]
    pub mask_mode: Option<MaskMode>,
    pub mask_feather: u32,
    pub use_selection_as_mask: bool,

    pub api_endpoint: Option<String>,
    pub api_key: Option<String>,
    pub use_env_key: Option<bool>,
    pub use_config_key: Option<bool>,
    pub save_history: Option<bool>,

    #[serde(deserialize_with = "blank_as_none")]
    pub position_mode: Option<PositionPreset>,
    #[serde(deserialize_with = "blank_as_none")]
    pub scale_mode: Option<ScaleMode>,
    pub placement_width: Option<f64>,
    pub placement_height: Option<f64>,
    pub embed_in_svg: Option<bool>,
    pub save_to_disk: Option<bool>,
    pub save_directory: Option<String>,
    pub filename_prefix: Option<String>,
}

impl RequestForm {
    pub fn key_input(&self) -> KeyInput {
        KeyInput {
            direct: non_blank(self.api_key.as_deref()),
            use_env: self.use_env_key.unwrap_or(true),
            use_config: self.use_config_key.unwrap_or(true),
        }
    }

    pub fn records_history(&self) -> bool {
        self.save_history.unwrap_or(true)
    }

    pub fn placement(&self, config: &Config) -> Placement {
        let defaults = Placement::default();
        Placement {
            position: self.position_mode.unwrap_or_default(),
            scale: self.scale_mode.unwrap_or_default(),
            custom_width: self.placement_width.unwrap_or(defaults.custom_width),
            custom_height: self.placement_height.unwrap_or(defaults.custom_height),
            embed: if self.embed_in_svg.unwrap_or(true) {
                EmbedMode::Embedded
            } else {
                EmbedMode::Linked
            },
            auto_save: self.save_to_disk.unwrap_or(true),
            save_directory: non_blank(self.save_directory.as_deref())
                .map(PathBuf::from)
                .unwrap_or_else(|| config.default_save_directory.clone()),
            filename_prefix: non_blank(self.filename_prefix.as_deref())
                .unwrap_or(defaults.filename_prefix),
        }
    }

    /// Builds the unified request. Range checks are left to the dispatcher.
    pub fn to_request(&self, config: &Config) -> Result<GenerationRequest, String> {
        let provider = self.provider.unwrap_or(config.default_provider);
        let provider_config = provider.config();
        let mode = self.operation_mode.unwrap_or(Mode::Generate);

        let mut style = self.style.clone();
        let mut quality = self.quality.clone();
        let mut negative_prompt = self.negative_prompt.clone();
        if let Some(preset) = self.preset {
            preset.apply(&mut style, &mut quality, &mut negative_prompt);
        }

        let model = non_blank(self.model.as_deref()).or_else(|| {
            provider_config
                .supports_model(&config.default_model)
                .then(|| config.default_model.clone())
        });

        let (size, custom_size) = if self.use_custom_size {
            (
                ImageSize::new(
                    self.custom_width.unwrap_or(1024),
                    self.custom_height.unwrap_or(1024),
                ),
                true,
            )
        } else {
            let raw = non_blank(self.image_size.as_deref()).unwrap_or_else(|| {
                if provider_config.supports_size(&config.default_size) {
                    config.default_size.clone()
                } else {
                    provider_config
                        .supported_sizes
                        .first()
                        .copied()
                        .unwrap_or("1024x1024")
                        .to_string()
                }
            });
            (raw.parse::<ImageSize>()?, false)
        };

        let prompt = if mode == Mode::Edit && !self.edit_instruction.trim().is_empty() {
            self.edit_instruction.trim().to_string()
        } else {
            self.prompt.trim().to_string()
        };

        let mut request = GenerationRequest::new(mode, provider, prompt);
        request.model = model;
        request.negative_prompt = negative_prompt.unwrap_or_default().trim().to_string();
        request.size = size;
        request.custom_size = custom_size;
        request.quality =
            non_blank(quality.as_deref()).unwrap_or_else(|| config.default_quality.clone());
        request.style = non_blank(style.as_deref()).unwrap_or_else(|| "vivid".to_string());
        request.seed = self.seed.filter(|seed| *seed >= 0);
        request.batch_count = self.batch_count.unwrap_or(1);
        request.cfg_scale = self.cfg_scale.unwrap_or(request.cfg_scale);
        request.steps = self.steps.unwrap_or(request.steps);
        request.img2img_strength = self.img2img_strength.unwrap_or(request.img2img_strength);
        request.mask_mode = self
            .mask_mode
            .or_else(|| (mode == Mode::Edit).then_some(MaskMode::Full));
        request.mask_feather = self.mask_feather;
        request.api_endpoint = non_blank(self.api_endpoint.as_deref()).or_else(|| {
            (provider == ProviderKind::Local).then(|| config.local_endpoint.clone())
        });
        Ok(request)
    }
}

impl FromStr for Preset {
    type Err = String;

    fn from_str(raw: &str) -> Result<Self, Self::Err> {
        match raw.trim().to_ascii_lowercase().as_str() {
            "photorealistic" => Ok(Preset::Photorealistic),
            "artistic" => Ok(Preset::Artistic),
            "quick_draft" => Ok(Preset::QuickDraft),
            "high_quality" => Ok(Preset::HighQuality),
            other => Err(format!("Unknown preset '{other}'.")),
        }
    }
}

fn non_blank(value: Option<&str>) -> Option<String> {
    value
        .map(str::trim)
        .filter(|value| !value.is_empty())
        .map(str::to_string)
}

/// Host dialogs send `""` for untouched choice fields.
fn blank_as_none<'de, D, T>(deserializer: D) -> Result<Option<T>, D::Error>
where
    D: Deserializer<'de>,
    T: FromStr,
    T::Err: fmt::Display,
{
    let raw = Option::<String>::deserialize(deserializer)?;
    match raw.as_deref().map(str::trim) {
        None | Some("") => Ok(None),
        Some(value) => value.parse().map(Some).map_err(serde::de::Error::custom),
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::RequestForm;
    use crate::config::Config;
    use crate::placement::{EmbedMode, PositionPreset, ScaleMode};
    use crate::providers::ProviderKind;
    use crate::request::{ImageSize, MaskMode, Mode};

    fn form(value: serde_json::Value) -> RequestForm {
        serde_json::from_value(value).unwrap_or_default()
    }

    #[test]
    fn blank_choice_fields_fall_back_to_config() -> anyhow::Result<()> {
        let parsed: RequestForm = serde_json::from_value(json!({
            "operation_mode": "",
            "provider": "",
            "preset": "",
            "prompt": "A red circle",
        }))?;
        let mut config = Config::default();
        config.default_provider = ProviderKind::Stability;
        config.default_quality = "hd".to_string();

        let request = parsed.to_request(&config).map_err(anyhow::Error::msg)?;
        assert_eq!(request.mode, Mode::Generate);
        assert_eq!(request.provider, ProviderKind::Stability);
        assert_eq!(request.quality, "hd");
        // dall-e-3 is not a Stability engine, so the provider default applies later.
        assert_eq!(request.model, None);
        assert_eq!(request.size, ImageSize::new(1024, 1024));
        Ok(())
    }

    #[test]
    fn form_values_carry_into_request() -> anyhow::Result<()> {
        let parsed = form(json!({
            "operation_mode": "generate",
            "provider": "openai",
            "prompt": "  A red circle ",
            "image_size": "512x512",
            "seed": 1234567890123_i64,
            "batch_count": 2,
            "preset": "artistic",
        }));
        let request = parsed.to_request(&Config::default()).map_err(anyhow::Error::msg)?;
        assert_eq!(request.prompt, "A red circle");
        assert_eq!(request.size.to_string(), "512x512");
        assert_eq!(request.seed, Some(1_234_567_890_123));
        assert_eq!(request.batch_count, 2);
        assert_eq!(request.model.as_deref(), Some("dall-e-3"));
        assert_eq!(request.quality, "hd");
        assert_eq!(request.negative_prompt, "photo, realistic, photograph");
        Ok(())
    }

    #[test]
    fn random_seed_and_edit_instruction() -> anyhow::Result<()> {
        let parsed = form(json!({
            "operation_mode": "edit",
            "provider": "openai",
            "prompt": "ignored",
            "edit_instruction": "add a hat",
            "seed": -1,
        }));
        let request = parsed.to_request(&Config::default()).map_err(anyhow::Error::msg)?;
        assert_eq!(request.prompt, "add a hat");
        assert_eq!(request.seed, None);
        assert_eq!(request.mask_mode, Some(MaskMode::Full));
        Ok(())
    }

    #[test]
    fn custom_size_bypasses_size_list() -> anyhow::Result<()> {
        let parsed = form(json!({
            "provider": "local",
            "use_custom_size": true,
            "custom_width": 640,
            "custom_height": 480,
        }));
        let request = parsed.to_request(&Config::default()).map_err(anyhow::Error::msg)?;
        assert!(request.custom_size);
        assert_eq!(request.size, ImageSize::new(640, 480));
        assert_eq!(request.api_endpoint.as_deref(), Some("http://127.0.0.1:7860"));
        Ok(())
    }

    #[test]
    fn invalid_choice_is_rejected() {
        let parsed: Result<RequestForm, _> =
            serde_json::from_value(json!({"mask_mode": "diagonal"}));
        assert!(parsed.is_err());
    }

    #[test]
    fn placement_and_key_input_from_form() {
        let parsed = form(json!({
            "position_mode": "cursor",
            "scale_mode": "fit_canvas",
            "embed_in_svg": false,
            "save_directory": "",
            "api_key": "  ",
            "use_env_key": false,
        }));
        let config = Config::default();
        let placement = parsed.placement(&config);
        assert_eq!(placement.position, PositionPreset::Selection);
        assert_eq!(placement.scale, ScaleMode::Fit);
        assert_eq!(placement.embed, EmbedMode::Linked);
        assert_eq!(placement.save_directory, config.default_save_directory);

        let keys = parsed.key_input();
        assert_eq!(keys.direct, None);
        assert!(!keys.use_env);
        assert!(keys.use_config);
    }
}
