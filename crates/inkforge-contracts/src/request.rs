use std::fmt;
use std::path::PathBuf;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use serde_json::{json, Map, Value};

use crate::providers::ProviderKind;

pub const MAX_BATCH_COUNT: u32 = 4;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Mode {
    Generate,
    Edit,
    Variation,
    #[serde(rename = "img2img")]
    Img2Img,
}

impl Mode {
    pub const ALL: [Mode; 4] = [Mode::Generate, Mode::Edit, Mode::Variation, Mode::Img2Img];

    pub fn as_str(self) -> &'static str {
        match self {
            Mode::Generate => "generate",
            Mode::Edit => "edit",
            Mode::Variation => "variation",
            Mode::Img2Img => "img2img",
        }
    }

    pub fn needs_source_image(self) -> bool {
        !matches!(self, Mode::Generate)
    }
}

impl fmt::Display for Mode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Mode {
    type Err = String;

    fn from_str(raw: &str) -> Result<Self, Self::Err> {
        let normalized = raw.trim().to_ascii_lowercase();
        Mode::ALL
            .into_iter()
            .find(|mode| mode.as_str() == normalized)
            .ok_or_else(|| format!("Unknown operation mode '{}'.", raw.trim()))
    }
}

/// Named geometric region selector for edit operations.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MaskMode {
    Full,
    Center,
    Edges,
    TopHalf,
    BottomHalf,
    LeftHalf,
    RightHalf,
}

impl MaskMode {
    pub const ALL: [MaskMode; 7] = [
        MaskMode::Full,
        MaskMode::Center,
        MaskMode::Edges,
        MaskMode::TopHalf,
        MaskMode::BottomHalf,
        MaskMode::LeftHalf,
        MaskMode::RightHalf,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            MaskMode::Full => "full",
            MaskMode::Center => "center",
            MaskMode::Edges => "edges",
            MaskMode::TopHalf => "top_half",
            MaskMode::BottomHalf => "bottom_half",
            MaskMode::LeftHalf => "left_half",
            MaskMode::RightHalf => "right_half",
        }
    }
}

impl FromStr for MaskMode {
    type Err = String;

    fn from_str(raw: &str) -> Result<Self, Self::Err> {
        let normalized = raw.trim().to_ascii_lowercase();
        MaskMode::ALL
            .into_iter()
            .find(|mode| mode.as_str() == normalized)
            .ok_or_else(|| format!("Unknown mask mode '{}'.", raw.trim()))
    }
}

/// Pixel dimensions in the `WIDTHxHEIGHT` notation every provider uses.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct ImageSize {
    pub width: u32,
    pub height: u32,
}

impl ImageSize {
    pub const fn new(width: u32, height: u32) -> Self {
        Self { width, height }
    }

    pub fn is_square(&self) -> bool {
        self.width == self.height
    }
}

impl Default for ImageSize {
    fn default() -> Self {
        Self::new(1024, 1024)
    }
}

impl fmt::Display for ImageSize {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}x{}", self.width, self.height)
    }
}

impl FromStr for ImageSize {
    type Err = String;

    fn from_str(raw: &str) -> Result<Self, Self::Err> {
        let trimmed = raw.trim();
        let (w, h) = trimmed
            .split_once(['x', 'X'])
            .ok_or_else(|| format!("Invalid image size '{trimmed}'; expected WIDTHxHEIGHT."))?;
        let width = w
            .trim()
            .parse::<u32>()
            .map_err(|_| format!("Invalid image width in '{trimmed}'."))?;
        let height = h
            .trim()
            .parse::<u32>()
            .map_err(|_| format!("Invalid image height in '{trimmed}'."))?;
        if width == 0 || height == 0 {
            return Err(format!("Image size '{trimmed}' must be non-zero."));
        }
        Ok(Self { width, height })
    }
}

impl TryFrom<String> for ImageSize {
    type Error = String;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

impl From<ImageSize> for String {
    fn from(value: ImageSize) -> Self {
        value.to_string()
    }
}

/// Axis-aligned bounding box in document units.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Rect {
    pub left: f64,
    pub top: f64,
    pub right: f64,
    pub bottom: f64,
}

impl Rect {
    pub fn new(left: f64, top: f64, right: f64, bottom: f64) -> Self {
        Self {
            left,
            top,
            right,
            bottom,
        }
    }

    pub fn width(&self) -> f64 {
        (self.right - self.left).max(0.0)
    }

    pub fn height(&self) -> f64 {
        (self.bottom - self.top).max(0.0)
    }

    pub fn center(&self) -> (f64, f64) {
        (
            (self.left + self.right) / 2.0,
            (self.top + self.bottom) / 2.0,
        )
    }
}

impl FromStr for Rect {
    type Err = String;

    /// Parses `left,top,right,bottom`.
    fn from_str(raw: &str) -> Result<Self, Self::Err> {
        let values = raw
            .split(',')
            .map(|part| part.trim().parse::<f64>())
            .collect::<Result<Vec<f64>, _>>()
            .map_err(|_| format!("Invalid rectangle '{}'; expected l,t,r,b.", raw.trim()))?;
        match values.as_slice() {
            [left, top, right, bottom] => Ok(Rect::new(*left, *top, *right, *bottom)),
            _ => Err(format!(
                "Invalid rectangle '{}'; expected 4 comma-separated numbers.",
                raw.trim()
            )),
        }
    }
}

/// User-drawn regions from the host document, used instead of a named mask mode.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CustomShape {
    pub regions: Vec<Rect>,
    pub viewport_width: f64,
    pub viewport_height: f64,
}

#[derive(Clone, PartialEq)]
pub enum SourceImage {
    Bytes(Vec<u8>),
    /// A host `href`: `data:` URI, `file://` URI, or filesystem path.
    Reference(String),
}

impl SourceImage {
    pub fn from_path(path: impl Into<PathBuf>) -> Self {
        SourceImage::Reference(path.into().to_string_lossy().to_string())
    }
}

impl fmt::Debug for SourceImage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SourceImage::Bytes(bytes) => write!(f, "Bytes({} bytes)", bytes.len()),
            SourceImage::Reference(href) if href.starts_with("data:") => {
                write!(f, "Reference(data URI, {} chars)", href.len())
            }
            SourceImage::Reference(href) => write!(f, "Reference({href:?})"),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct GenerationRequest {
    pub mode: Mode,
    pub provider: ProviderKind,
    /// `None` means the provider default.
    pub model: Option<String>,
    pub prompt: String,
    pub negative_prompt: String,
    pub size: ImageSize,
    /// Skips the provider's size whitelist.
    pub custom_size: bool,
    pub quality: String,
    pub style: String,
    pub seed: Option<i64>,
    pub batch_count: u32,
    pub cfg_scale: f64,
    pub steps: u32,
    pub img2img_strength: f64,
    pub mask_mode: Option<MaskMode>,
    pub mask_feather: u32,
    pub mask_shape: Option<CustomShape>,
    pub source_image: Option<SourceImage>,
    /// Overrides the base URL of self-hosted providers.
    pub api_endpoint: Option<String>,
}

impl GenerationRequest {
    pub fn new(mode: Mode, provider: ProviderKind, prompt: impl Into<String>) -> Self {
        Self {
            mode,
            provider,
            model: None,
            prompt: prompt.into(),
            negative_prompt: String::new(),
            size: ImageSize::default(),
            custom_size: false,
            quality: "standard".to_string(),
            style: "vivid".to_string(),
            seed: None,
            batch_count: 1,
            cfg_scale: 7.0,
            steps: 30,
            img2img_strength: 0.75,
            mask_mode: None,
            mask_feather: 0,
            mask_shape: None,
            source_image: None,
            api_endpoint: None,
        }
    }

    /// Settings recorded alongside each history entry. Never includes image bytes.
    pub fn settings_snapshot(&self) -> Map<String, Value> {
        let snapshot = json!({
            "model": self.model,
            "negative_prompt": self.negative_prompt,
            "size": self.size.to_string(),
            "quality": self.quality,
            "style": self.style,
            "seed": self.seed.map(Value::from).unwrap_or_else(|| Value::from("random")),
            "batch_count": self.batch_count,
            "cfg_scale": self.cfg_scale,
            "steps": self.steps,
            "img2img_strength": self.img2img_strength,
            "mask_mode": self.mask_mode.map(MaskMode::as_str),
            "mask_shape_count": self.mask_shape.as_ref().map(|shape| shape.regions.len()),
        });
        snapshot.as_object().cloned().unwrap_or_default()
    }
}

/// Named bundles of style, quality and negative prompt.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Preset {
    Photorealistic,
    Artistic,
    QuickDraft,
    HighQuality,
}

impl Preset {
    fn values(self) -> (&'static str, &'static str, &'static str) {
        match self {
            Preset::Photorealistic => (
                "natural",
                "hd",
                "cartoon, illustration, painting, drawing, art, anime",
            ),
            Preset::Artistic => ("vivid", "hd", "photo, realistic, photograph"),
            Preset::QuickDraft => ("natural", "standard", ""),
            Preset::HighQuality => ("vivid", "hd", "low quality, blurry, distorted"),
        }
    }

    /// Fills only the fields the user left empty.
    pub fn apply(
        self,
        style: &mut Option<String>,
        quality: &mut Option<String>,
        negative_prompt: &mut Option<String>,
    ) {
        let (preset_style, preset_quality, preset_negative) = self.values();
        fill_if_empty(style, preset_style);
        fill_if_empty(quality, preset_quality);
        fill_if_empty(negative_prompt, preset_negative);
    }
}

fn fill_if_empty(slot: &mut Option<String>, value: &str) {
    let empty = slot
        .as_deref()
        .map(|current| current.trim().is_empty())
        .unwrap_or(true);
    if empty {
        *slot = Some(value.to_string());
    }
}

#[cfg(test)]
mod tests {
    use super::{GenerationRequest, ImageSize, MaskMode, Mode, Preset, Rect};
    use crate::providers::ProviderKind;

    #[test]
    fn image_size_parses_and_formats_provider_notation() -> anyhow::Result<()> {
        let size: ImageSize = "1024x1792".parse().map_err(anyhow::Error::msg)?;
        assert_eq!(size, ImageSize::new(1024, 1792));
        assert_eq!(size.to_string(), "1024x1792");
        assert_eq!(serde_json::to_string(&size)?, "\"1024x1792\"");
        assert!("1024".parse::<ImageSize>().is_err());
        assert!("0x512".parse::<ImageSize>().is_err());
        Ok(())
    }

    #[test]
    fn mode_and_mask_mode_parse_plugin_names() {
        assert_eq!("img2img".parse::<Mode>(), Ok(Mode::Img2Img));
        assert_eq!("Variation".parse::<Mode>(), Ok(Mode::Variation));
        assert_eq!("top_half".parse::<MaskMode>(), Ok(MaskMode::TopHalf));
        assert!("diagonal".parse::<MaskMode>().is_err());
    }

    #[test]
    fn rect_parses_bounding_box() {
        let rect: Rect = "10, 20, 110, 70".parse().unwrap_or(Rect::new(0.0, 0.0, 0.0, 0.0));
        assert_eq!(rect.width(), 100.0);
        assert_eq!(rect.height(), 50.0);
        assert_eq!(rect.center(), (60.0, 45.0));
        assert!("1,2,3".parse::<Rect>().is_err());
    }

    #[test]
    fn preset_fills_only_empty_fields() {
        let mut style = Some("vivid".to_string());
        let mut quality = None;
        let mut negative = Some("  ".to_string());
        Preset::Photorealistic.apply(&mut style, &mut quality, &mut negative);
        assert_eq!(style.as_deref(), Some("vivid"));
        assert_eq!(quality.as_deref(), Some("hd"));
        assert_eq!(
            negative.as_deref(),
            Some("cartoon, illustration, painting, drawing, art, anime")
        );
    }

    #[test]
    fn settings_snapshot_reports_random_seed_and_omits_source() {
        let request = GenerationRequest::new(Mode::Generate, ProviderKind::OpenAi, "a red circle");
        let snapshot = request.settings_snapshot();
        assert_eq!(snapshot["seed"], "random");
        assert_eq!(snapshot["size"], "1024x1024");
        assert!(!snapshot.contains_key("source_image"));
    }
}
