//! Loading the host's selected image and converting it for upload.

use std::io::Cursor;
use std::path::Path;

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine as _;
use image::imageops::FilterType;
use image::{DynamicImage, ImageFormat, Rgba, RgbaImage};
use inkforge_contracts::SourceImage;

use crate::error::{GenerationError, Result};

/// PNG-encoded upload plus its pixel dimensions.
#[derive(Clone, PartialEq)]
pub struct PreparedImage {
    pub png: Vec<u8>,
    pub width: u32,
    pub height: u32,
}

impl std::fmt::Debug for PreparedImage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PreparedImage")
            .field("png_bytes", &self.png.len())
            .field("width", &self.width)
            .field("height", &self.height)
            .finish()
    }
}

impl PreparedImage {
    pub fn dimensions(&self) -> (u32, u32) {
        (self.width, self.height)
    }
}

/// Reads raw bytes for a host image reference.
pub fn load_source(source: &SourceImage) -> Result<Vec<u8>> {
    match source {
        SourceImage::Bytes(bytes) if bytes.is_empty() => {
            Err(GenerationError::Validation("selected image is empty".to_string()))
        }
        SourceImage::Bytes(bytes) => Ok(bytes.clone()),
        SourceImage::Reference(href) => load_href(href),
    }
}

fn load_href(href: &str) -> Result<Vec<u8>> {
    let href = href.trim();
    if href.starts_with("data:") {
        return decode_data_uri(href);
    }
    let path = href.strip_prefix("file://").unwrap_or(href);
    read_path(Path::new(path))
}

fn read_path(path: &Path) -> Result<Vec<u8>> {
    std::fs::read(path).map_err(|err| {
        GenerationError::Validation(format!(
            "could not read image data from {}: {err}",
            path.display()
        ))
    })
}

/// Decodes `data:<mime>;base64,<payload>`.
pub fn decode_data_uri(href: &str) -> Result<Vec<u8>> {
    let (header, payload) = href
        .split_once(',')
        .ok_or_else(|| GenerationError::Validation("malformed data URI".to_string()))?;
    if !header.ends_with(";base64") {
        return Err(GenerationError::Validation(
            "only base64 data URIs are supported".to_string(),
        ));
    }
    let cleaned: String = payload.chars().filter(|ch| !ch.is_whitespace()).collect();
    BASE64
        .decode(cleaned.as_bytes())
        .map_err(|err| GenerationError::Validation(format!("invalid data URI payload: {err}")))
}

pub fn data_uri(bytes: &[u8]) -> String {
    let mime = image::guess_format(bytes)
        .map(|format| format.to_mime_type())
        .unwrap_or("image/png");
    format!("data:{mime};base64,{}", BASE64.encode(bytes))
}

fn decode_image(bytes: &[u8]) -> Result<DynamicImage> {
    image::load_from_memory(bytes)
        .map_err(|err| GenerationError::Validation(format!("selected image is not decodable: {err}")))
}

/// Re-encodes as RGBA PNG at the original dimensions.
pub fn rgba_png(bytes: &[u8]) -> Result<PreparedImage> {
    let image = decode_image(bytes)?.to_rgba8();
    encode(&image)
}

/// Fits the image inside a `side`-pixel square and pads with transparency.
pub fn square_rgba_png(bytes: &[u8], side: u32) -> Result<PreparedImage> {
    let decoded = decode_image(bytes)?;
    if decoded.width() == side && decoded.height() == side {
        return encode(&decoded.to_rgba8());
    }
    let fitted = decoded.resize(side, side, FilterType::Lanczos3).to_rgba8();
    let mut canvas = RgbaImage::from_pixel(side, side, Rgba([0, 0, 0, 0]));
    let x = (side - fitted.width()) / 2;
    let y = (side - fitted.height()) / 2;
    image::imageops::overlay(&mut canvas, &fitted, x as i64, y as i64);
    encode(&canvas)
}

fn encode(image: &RgbaImage) -> Result<PreparedImage> {
    let mut png = Vec::new();
    image
        .write_to(&mut Cursor::new(&mut png), ImageFormat::Png)
        .map_err(|err| GenerationError::Validation(format!("PNG encoding failed: {err}")))?;
    Ok(PreparedImage {
        png,
        width: image.width(),
        height: image.height(),
    })
}

#[cfg(test)]
mod tests {
    use std::io::Cursor;

    use base64::engine::general_purpose::STANDARD as BASE64;
    use base64::Engine as _;
    use image::{ImageFormat, Rgb, RgbImage};
    use inkforge_contracts::SourceImage;

    use super::*;

    fn jpeg_bytes(width: u32, height: u32) -> anyhow::Result<Vec<u8>> {
        let image = RgbImage::from_pixel(width, height, Rgb([200, 10, 10]));
        let mut out = Vec::new();
        image.write_to(&mut Cursor::new(&mut out), ImageFormat::Jpeg)?;
        Ok(out)
    }

    #[test]
    fn loads_data_uri_file_uri_and_plain_path() -> anyhow::Result<()> {
        let bytes = jpeg_bytes(4, 4)?;
        let uri = format!("data:image/jpeg;base64,{}", BASE64.encode(&bytes));
        assert_eq!(load_source(&SourceImage::Reference(uri))?, bytes);

        let temp = tempfile::tempdir()?;
        let path = temp.path().join("selected.jpg");
        std::fs::write(&path, &bytes)?;
        let file_uri = format!("file://{}", path.display());
        assert_eq!(load_source(&SourceImage::Reference(file_uri))?, bytes);
        assert_eq!(load_source(&SourceImage::from_path(&path))?, bytes);
        Ok(())
    }

    #[test]
    fn unreadable_sources_are_validation_errors() {
        let missing = SourceImage::Reference("/definitely/not/here.png".to_string());
        assert!(matches!(
            load_source(&missing),
            Err(GenerationError::Validation(_))
        ));
        assert!(matches!(
            decode_data_uri("data:image/png,plain"),
            Err(GenerationError::Validation(_))
        ));
        assert!(load_source(&SourceImage::Bytes(Vec::new())).is_err());
    }

    #[test]
    fn rgba_conversion_keeps_dimensions() -> anyhow::Result<()> {
        let prepared = rgba_png(&jpeg_bytes(30, 20)?)?;
        assert_eq!(prepared.dimensions(), (30, 20));
        let decoded = image::load_from_memory(&prepared.png)?;
        assert!(decoded.color().has_alpha());
        Ok(())
    }

    #[test]
    fn square_conversion_pads_with_transparency() -> anyhow::Result<()> {
        let prepared = square_rgba_png(&jpeg_bytes(40, 20)?, 16)?;
        assert_eq!(prepared.dimensions(), (16, 16));
        let decoded = image::load_from_memory(&prepared.png)?.to_rgba8();
        assert_eq!(decoded.get_pixel(8, 0)[3], 0);
        assert_eq!(decoded.get_pixel(8, 8)[3], 255);
        Ok(())
    }

    #[test]
    fn data_uri_uses_detected_mime() -> anyhow::Result<()> {
        let uri = data_uri(&jpeg_bytes(2, 2)?);
        assert!(uri.starts_with("data:image/jpeg;base64,"));
        Ok(())
    }
}
