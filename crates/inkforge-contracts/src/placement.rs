use std::path::PathBuf;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PositionPreset {
    #[default]
    Center,
    TopLeft,
    TopCenter,
    TopRight,
    MiddleLeft,
    MiddleRight,
    BottomLeft,
    BottomCenter,
    BottomRight,
    /// Centred on the current selection's bounding box.
    #[serde(alias = "cursor")]
    Selection,
}

impl FromStr for PositionPreset {
    type Err = String;

    fn from_str(raw: &str) -> Result<Self, Self::Err> {
        let preset = match raw.trim().to_ascii_lowercase().as_str() {
            "center" => PositionPreset::Center,
            "top_left" => PositionPreset::TopLeft,
            "top_center" => PositionPreset::TopCenter,
            "top_right" => PositionPreset::TopRight,
            "middle_left" => PositionPreset::MiddleLeft,
            "middle_right" => PositionPreset::MiddleRight,
            "bottom_left" => PositionPreset::BottomLeft,
            "bottom_center" => PositionPreset::BottomCenter,
            "bottom_right" => PositionPreset::BottomRight,
            "selection" | "cursor" => PositionPreset::Selection,
            other => return Err(format!("Unknown position mode '{other}'.")),
        };
        Ok(preset)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ScaleMode {
    #[default]
    Original,
    /// Largest size that fits the canvas, aspect preserved.
    #[serde(alias = "fit_canvas")]
    Fit,
    FitWidth,
    FitHeight,
    Custom,
}

impl FromStr for ScaleMode {
    type Err = String;

    fn from_str(raw: &str) -> Result<Self, Self::Err> {
        let mode = match raw.trim().to_ascii_lowercase().as_str() {
            "original" => ScaleMode::Original,
            "fit" | "fit_canvas" => ScaleMode::Fit,
            "fit_width" => ScaleMode::FitWidth,
            "fit_height" => ScaleMode::FitHeight,
            "custom" => ScaleMode::Custom,
            other => return Err(format!("Unknown scale mode '{other}'.")),
        };
        Ok(mode)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EmbedMode {
    #[default]
    Embedded,
    Linked,
}

/// Where and how results land in the host document.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Placement {
    pub position: PositionPreset,
    pub scale: ScaleMode,
    pub custom_width: f64,
    pub custom_height: f64,
    pub embed: EmbedMode,
    /// Write images to `save_directory` even when embedding.
    pub auto_save: bool,
    pub save_directory: PathBuf,
    pub filename_prefix: String,
}

impl Default for Placement {
    fn default() -> Self {
        Self {
            position: PositionPreset::Center,
            scale: ScaleMode::Original,
            custom_width: 800.0,
            custom_height: 600.0,
            embed: EmbedMode::Embedded,
            auto_save: true,
            save_directory: PathBuf::from("."),
            filename_prefix: "ai_image".to_string(),
        }
    }
}

impl Placement {
    pub fn writes_files(&self) -> bool {
        self.auto_save || self.embed == EmbedMode::Linked
    }
}
