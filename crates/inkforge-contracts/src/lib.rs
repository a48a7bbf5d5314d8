pub mod config;
pub mod form;
pub mod history;
pub mod placement;
pub mod providers;
pub mod request;
mod store;

pub use config::{Config, ConfigReadError, ConfigStore, KeyInput};
pub use form::RequestForm;
pub use history::{HistoryEntry, HistoryLog};
pub use placement::{EmbedMode, Placement, PositionPreset, ScaleMode};
pub use providers::{ProviderConfig, ProviderKind};
pub use request::{
    CustomShape, GenerationRequest, ImageSize, MaskMode, Mode, Preset, Rect, SourceImage,
};
