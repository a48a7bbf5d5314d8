//! Placement of generated images in the host document.

use std::fs;
use std::io::Cursor;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use image::ImageReader;
use inkforge_contracts::{EmbedMode, Placement, PositionPreset, Rect, ScaleMode};
use serde::Serialize;
use sha2::{Digest, Sha256};

use crate::dispatcher::GenerationResult;
use crate::source;

/// Document units between consecutive images of a batch, on both axes.
pub const BATCH_OFFSET: f64 = 50.0;

/// What the host tells us about the document being edited.
#[derive(Debug, Clone, PartialEq)]
pub struct DocumentContext {
    pub viewport_width: f64,
    pub viewport_height: f64,
    /// Bounding box of the current selection, in document units.
    pub selection: Option<Rect>,
    /// Image element an edit result is written back into.
    pub replace: Option<ReplaceTarget>,
}

impl DocumentContext {
    pub fn new(viewport_width: f64, viewport_height: f64) -> Self {
        Self {
            viewport_width,
            viewport_height,
            selection: None,
            replace: None,
        }
    }
}

/// An existing `<image>` element, by host id and document bounds.
#[derive(Debug, Clone, PartialEq)]
pub struct ReplaceTarget {
    pub id: String,
    pub bounds: Rect,
}

/// One `<image>` element for the host to insert.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct PlacedImage {
    /// `data:` URI when embedded, file path when linked.
    pub href: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub saved_path: Option<PathBuf>,
    pub x: f64,
    pub y: f64,
    pub width: f64,
    pub height: f64,
    pub pixel_width: u32,
    pub pixel_height: u32,
    /// Host id of the element whose href this image replaces, keeping its geometry.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub replaces: Option<String>,
}

pub struct CanvasInserter;

impl CanvasInserter {
    pub fn place(
        result: &GenerationResult,
        placement: &Placement,
        document: &DocumentContext,
    ) -> Result<Vec<PlacedImage>> {
        let mut placed = Vec::with_capacity(result.images.len());
        for (idx, bytes) in result.images.iter().enumerate() {
            let (pixel_width, pixel_height) = pixel_dimensions(bytes)
                .with_context(|| format!("image {} from {} is unreadable", idx + 1, result.provider))?;
            let saved_path = if placement.writes_files() {
                save_image(bytes, placement, result.seed_used)?
            } else {
                None
            };
            let href = match (placement.embed, &saved_path) {
                (EmbedMode::Linked, Some(path)) => path.to_string_lossy().to_string(),
                (EmbedMode::Linked, None) => {
                    anyhow::bail!("linked placement needs the image saved to disk")
                }
                (EmbedMode::Embedded, _) => source::data_uri(bytes),
            };

            let offset = if result.images.len() > 1 {
                BATCH_OFFSET * idx as f64
            } else {
                0.0
            };
            // The first image takes over the target element; the rest of a batch
            // is stacked on top of it as new elements.
            let (x, y, width, height, replaces) = match &document.replace {
                Some(target) => (
                    target.bounds.left,
                    target.bounds.top,
                    target.bounds.width(),
                    target.bounds.height(),
                    (idx == 0).then(|| target.id.clone()),
                ),
                None => {
                    let (width, height) =
                        scaled_size(placement, document, pixel_width, pixel_height);
                    let (x, y) = position(placement.position, document, width, height);
                    (x, y, width, height, None)
                }
            };
            placed.push(PlacedImage {
                href,
                saved_path,
                x: x + offset,
                y: y + offset,
                width,
                height,
                pixel_width,
                pixel_height,
                replaces,
            });
        }
        tracing::debug!(count = placed.len(), "images placed");
        Ok(placed)
    }
}

fn pixel_dimensions(bytes: &[u8]) -> Result<(u32, u32)> {
    let reader = ImageReader::new(Cursor::new(bytes))
        .with_guessed_format()
        .context("failed to sniff image format")?;
    reader
        .into_dimensions()
        .context("failed to read image dimensions")
}

/// Display size in document units.
pub fn scaled_size(
    placement: &Placement,
    document: &DocumentContext,
    pixel_width: u32,
    pixel_height: u32,
) -> (f64, f64) {
    let width = f64::from(pixel_width.max(1));
    let height = f64::from(pixel_height.max(1));
    let doc_w = document.viewport_width;
    let doc_h = document.viewport_height;
    match placement.scale {
        ScaleMode::Original => (width, height),
        ScaleMode::FitWidth => (doc_w, height * doc_w / width),
        ScaleMode::FitHeight => (width * doc_h / height, doc_h),
        ScaleMode::Fit => {
            let scale = (doc_w / width).min(doc_h / height);
            (width * scale, height * scale)
        }
        ScaleMode::Custom => (placement.custom_width, placement.custom_height),
    }
}

/// Top-left corner for an image of `width` x `height` under `preset`.
pub fn position(
    preset: PositionPreset,
    document: &DocumentContext,
    width: f64,
    height: f64,
) -> (f64, f64) {
    let free_x = document.viewport_width - width;
    let free_y = document.viewport_height - height;
    match preset {
        PositionPreset::Center => (free_x / 2.0, free_y / 2.0),
        PositionPreset::TopLeft => (0.0, 0.0),
        PositionPreset::TopCenter => (free_x / 2.0, 0.0),
        PositionPreset::TopRight => (free_x, 0.0),
        PositionPreset::MiddleLeft => (0.0, free_y / 2.0),
        PositionPreset::MiddleRight => (free_x, free_y / 2.0),
        PositionPreset::BottomLeft => (0.0, free_y),
        PositionPreset::BottomCenter => (free_x / 2.0, free_y),
        PositionPreset::BottomRight => (free_x, free_y),
        PositionPreset::Selection => match document.selection {
            Some(bbox) => {
                let (cx, cy) = bbox.center();
                (cx - width / 2.0, cy - height / 2.0)
            }
            None => (free_x / 2.0, free_y / 2.0),
        },
    }
}

/// `<prefix>_<YYYYmmdd_HHMMSS>[_seed<N>]_<hash8>.png`
pub fn image_file_name(prefix: &str, timestamp: &str, seed: Option<i64>, bytes: &[u8]) -> String {
    let prefix = match prefix.trim() {
        "" => "ai_image",
        value => value,
    };
    let seed = seed.map(|seed| format!("_seed{seed}")).unwrap_or_default();
    format!("{prefix}_{timestamp}{seed}_{}.png", content_hash8(bytes))
}

fn content_hash8(bytes: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(bytes);
    let digest = hasher.finalize();
    hex::encode(&digest[..4])
}

/// Writes into the save directory. Failures only matter for linked images.
fn save_image(bytes: &[u8], placement: &Placement, seed: Option<i64>) -> Result<Option<PathBuf>> {
    match write_image(bytes, &placement.save_directory, &placement.filename_prefix, seed) {
        Ok(path) => Ok(Some(path)),
        Err(err) if placement.embed == EmbedMode::Embedded => {
            tracing::warn!(
                dir = %placement.save_directory.display(),
                error = %format!("{err:#}"),
                "could not save generated image"
            );
            Ok(None)
        }
        Err(err) => Err(err),
    }
}

fn write_image(bytes: &[u8], dir: &Path, prefix: &str, seed: Option<i64>) -> Result<PathBuf> {
    fs::create_dir_all(dir).with_context(|| format!("failed to create {}", dir.display()))?;
    let timestamp = chrono::Local::now().format("%Y%m%d_%H%M%S").to_string();
    let path = dir.join(image_file_name(prefix, &timestamp, seed, bytes));
    fs::write(&path, bytes).with_context(|| format!("failed to write {}", path.display()))?;
    tracing::info!(path = %path.display(), "saved generated image");
    Ok(path)
}
