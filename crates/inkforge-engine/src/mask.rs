//! Edit masks.
//!
//! Polarity is fixed for the whole crate: alpha 0 marks pixels the provider may
//! repaint, alpha 255 marks protected pixels. Adapters that expect a different
//! encoding convert at their boundary with [`Mask::to_luma_png`].

use std::io::Cursor;

use image::{imageops, GrayImage, ImageFormat, Luma, Rgba, RgbaImage};
use inkforge_contracts::{CustomShape, MaskMode};

use crate::error::{GenerationError, Result};

const EDITABLE: Rgba<u8> = Rgba([0, 0, 0, 0]);
const PROTECTED: Rgba<u8> = Rgba([0, 0, 0, 255]);

#[derive(Debug, Clone, PartialEq)]
pub struct Mask {
    image: RgbaImage,
}

impl Mask {
    pub fn width(&self) -> u32 {
        self.image.width()
    }

    pub fn height(&self) -> u32 {
        self.image.height()
    }

    pub fn dimensions(&self) -> (u32, u32) {
        self.image.dimensions()
    }

    pub fn image(&self) -> &RgbaImage {
        &self.image
    }

    pub fn is_editable(&self, x: u32, y: u32) -> bool {
        self.image.get_pixel(x, y)[3] < 128
    }

    pub fn editable_pixels(&self) -> u64 {
        self.image.pixels().filter(|pixel| pixel[3] < 128).count() as u64
    }

    /// RGBA PNG, transparent where editable.
    pub fn to_alpha_png(&self) -> Result<Vec<u8>> {
        encode_png(|cursor| self.image.write_to(cursor, ImageFormat::Png))
    }

    /// Grayscale PNG, white where editable.
    pub fn to_luma_png(&self) -> Result<Vec<u8>> {
        let (width, height) = self.dimensions();
        let luma = GrayImage::from_fn(width, height, |x, y| {
            Luma([255 - self.image.get_pixel(x, y)[3]])
        });
        encode_png(|cursor| luma.write_to(cursor, ImageFormat::Png))
    }
}

pub struct MaskBuilder;

impl MaskBuilder {
    /// A custom shape, when present, wins over `mode`.
    pub fn build(
        mode: MaskMode,
        (width, height): (u32, u32),
        shape: Option<&CustomShape>,
    ) -> Result<Mask> {
        if width == 0 || height == 0 {
            return Err(GenerationError::UnsupportedMask(format!(
                "image dimensions {width}x{height} must be positive"
            )));
        }
        match shape {
            Some(shape) => Self::from_shape(shape, (width, height)),
            None => Self::from_mode(mode, (width, height)),
        }
    }

    /// Blurs the alpha channel with the given sigma in pixels.
    pub fn feather(mask: Mask, radius: u32) -> Mask {
        if radius == 0 {
            return mask;
        }
        let (width, height) = mask.dimensions();
        let alpha = GrayImage::from_fn(width, height, |x, y| Luma([mask.image.get_pixel(x, y)[3]]));
        let blurred = imageops::blur(&alpha, radius as f32);
        let image = RgbaImage::from_fn(width, height, |x, y| {
            Rgba([0, 0, 0, blurred.get_pixel(x, y)[0]])
        });
        Mask { image }
    }

    fn from_mode(mode: MaskMode, (width, height): (u32, u32)) -> Result<Mask> {
        let margin_x = width / 4;
        let margin_y = height / 4;
        let too_small = match mode {
            MaskMode::Full => false,
            MaskMode::Center | MaskMode::Edges => margin_x == 0 || margin_y == 0,
            MaskMode::TopHalf | MaskMode::BottomHalf => height < 2,
            MaskMode::LeftHalf | MaskMode::RightHalf => width < 2,
        };
        if too_small {
            return Err(GenerationError::UnsupportedMask(format!(
                "{width}x{height} image is too small for a {mode:?} mask"
            )));
        }
        let center = (margin_x, margin_y, width - margin_x, height - margin_y);

        let (background, region, fill) = match mode {
            MaskMode::Full => (EDITABLE, None, EDITABLE),
            MaskMode::Center => (PROTECTED, Some(center), EDITABLE),
            MaskMode::Edges => (EDITABLE, Some(center), PROTECTED),
            MaskMode::TopHalf => (PROTECTED, Some((0, 0, width, height / 2)), EDITABLE),
            MaskMode::BottomHalf => (PROTECTED, Some((0, height / 2, width, height)), EDITABLE),
            MaskMode::LeftHalf => (PROTECTED, Some((0, 0, width / 2, height)), EDITABLE),
            MaskMode::RightHalf => (PROTECTED, Some((width / 2, 0, width, height)), EDITABLE),
        };

        let mut image = RgbaImage::from_pixel(width, height, background);
        if let Some(region) = region {
            fill_region(&mut image, region, fill);
        }
        Ok(Mask { image })
    }

    fn from_shape(shape: &CustomShape, (width, height): (u32, u32)) -> Result<Mask> {
        if !(shape.viewport_width > 0.0 && shape.viewport_height > 0.0) {
            return Err(GenerationError::UnsupportedMask(
                "document viewport must be positive".to_string(),
            ));
        }
        let scale_x = width as f64 / shape.viewport_width;
        let scale_y = height as f64 / shape.viewport_height;
        let clamp_px = |value: f64, limit: u32| -> u32 { value.clamp(0.0, limit as f64) as u32 };

        let mut image = RgbaImage::from_pixel(width, height, PROTECTED);
        let mut painted = false;
        for rect in &shape.regions {
            if rect.width() <= 0.0 || rect.height() <= 0.0 {
                continue;
            }
            let x0 = clamp_px((rect.left * scale_x).floor(), width);
            let y0 = clamp_px((rect.top * scale_y).floor(), height);
            let x1 = clamp_px((rect.right * scale_x).ceil(), width);
            let y1 = clamp_px((rect.bottom * scale_y).ceil(), height);
            if x1 <= x0 || y1 <= y0 {
                continue;
            }
            fill_region(&mut image, (x0, y0, x1, y1), EDITABLE);
            painted = true;
        }
        if !painted {
            return Err(GenerationError::UnsupportedMask(
                "selected shapes cover no part of the image".to_string(),
            ));
        }
        Ok(Mask { image })
    }
}

/// Fills the half-open pixel rectangle `[x0, x1) x [y0, y1)`.
fn fill_region(image: &mut RgbaImage, (x0, y0, x1, y1): (u32, u32, u32, u32), pixel: Rgba<u8>) {
    for y in y0..y1.min(image.height()) {
        for x in x0..x1.min(image.width()) {
            image.put_pixel(x, y, pixel);
        }
    }
}

fn encode_png<F>(write: F) -> Result<Vec<u8>>
where
    F: FnOnce(&mut Cursor<&mut Vec<u8>>) -> image::ImageResult<()>,
{
    let mut buffer = Vec::new();
    write(&mut Cursor::new(&mut buffer))
        .map_err(|err| GenerationError::UnsupportedMask(format!("PNG encoding failed: {err}")))?;
    Ok(buffer)
}

#[cfg(test)]
mod tests {
    use inkforge_contracts::{CustomShape, MaskMode, Rect};

    use super::{Mask, MaskBuilder};
    use crate::error::GenerationError;

    fn fraction(mask: &Mask) -> f64 {
        mask.editable_pixels() as f64 / (mask.width() as f64 * mask.height() as f64)
    }

    #[test]
    fn every_mode_matches_source_dimensions() -> anyhow::Result<()> {
        for (width, height) in [(4, 4), (1024, 1024), (1792, 1024), (7, 13)] {
            for mode in MaskMode::ALL {
                let mask = MaskBuilder::build(mode, (width, height), None)?;
                assert_eq!(mask.dimensions(), (width, height), "{mode:?}");
            }
        }
        Ok(())
    }

    #[test]
    fn area_fractions_follow_mode_geometry() -> anyhow::Result<()> {
        let dims = (1024, 768);
        let expect = [
            (MaskMode::Full, 1.0),
            (MaskMode::Center, 0.25),
            (MaskMode::Edges, 0.75),
            (MaskMode::TopHalf, 0.5),
            (MaskMode::BottomHalf, 0.5),
            (MaskMode::LeftHalf, 0.5),
            (MaskMode::RightHalf, 0.5),
        ];
        for (mode, expected) in expect {
            let mask = MaskBuilder::build(mode, dims, None)?;
            assert!(
                (fraction(&mask) - expected).abs() < 0.01,
                "{mode:?}: {}",
                fraction(&mask)
            );
        }
        Ok(())
    }

    #[test]
    fn center_mask_on_4x4_is_transparent_inside_opaque_outside() -> anyhow::Result<()> {
        let mask = MaskBuilder::build(MaskMode::Center, (4, 4), None)?;
        for y in 0..4 {
            for x in 0..4 {
                let inside = (1..3).contains(&x) && (1..3).contains(&y);
                let alpha = mask.image().get_pixel(x, y)[3];
                assert_eq!(alpha, if inside { 0 } else { 255 }, "pixel ({x},{y})");
            }
        }
        Ok(())
    }

    #[test]
    fn half_modes_split_on_named_axis() -> anyhow::Result<()> {
        let top = MaskBuilder::build(MaskMode::TopHalf, (10, 10), None)?;
        assert!(top.is_editable(5, 4));
        assert!(!top.is_editable(5, 5));
        let right = MaskBuilder::build(MaskMode::RightHalf, (10, 10), None)?;
        assert!(!right.is_editable(4, 0));
        assert!(right.is_editable(5, 9));
        Ok(())
    }

    #[test]
    fn custom_shape_overrides_mode_and_scales_to_image() -> anyhow::Result<()> {
        let shape = CustomShape {
            regions: vec![Rect::new(0.0, 0.0, 50.0, 50.0)],
            viewport_width: 200.0,
            viewport_height: 200.0,
        };
        let mask = MaskBuilder::build(MaskMode::Full, (100, 100), Some(&shape))?;
        assert_eq!(mask.editable_pixels(), 25 * 25);
        assert!(mask.is_editable(0, 0));
        assert!(!mask.is_editable(30, 30));
        Ok(())
    }

    #[test]
    fn degenerate_inputs_are_rejected() {
        assert!(matches!(
            MaskBuilder::build(MaskMode::Center, (0, 10), None),
            Err(GenerationError::UnsupportedMask(_))
        ));

        let flat = CustomShape {
            regions: vec![Rect::new(10.0, 10.0, 10.0, 40.0)],
            viewport_width: 100.0,
            viewport_height: 100.0,
        };
        assert!(matches!(
            MaskBuilder::build(MaskMode::Full, (64, 64), Some(&flat)),
            Err(GenerationError::UnsupportedMask(_))
        ));

        let outside = CustomShape {
            regions: vec![Rect::new(150.0, 150.0, 190.0, 190.0)],
            viewport_width: 100.0,
            viewport_height: 100.0,
        };
        assert!(MaskBuilder::build(MaskMode::Full, (64, 64), Some(&outside)).is_err());
    }

    #[test]
    fn named_modes_need_room_for_both_areas() -> anyhow::Result<()> {
        for (mode, dims) in [
            (MaskMode::Center, (1, 1)),
            (MaskMode::Edges, (1, 64)),
            (MaskMode::Center, (64, 3)),
            (MaskMode::TopHalf, (64, 1)),
            (MaskMode::LeftHalf, (1, 64)),
        ] {
            assert!(
                matches!(
                    MaskBuilder::build(mode, dims, None),
                    Err(GenerationError::UnsupportedMask(_))
                ),
                "{mode:?} {dims:?}"
            );
        }
        assert_eq!(MaskBuilder::build(MaskMode::Full, (1, 1), None)?.editable_pixels(), 1);
        let top = MaskBuilder::build(MaskMode::TopHalf, (1, 2), None)?;
        assert_eq!(top.editable_pixels(), 1);
        Ok(())
    }

    #[test]
    fn luma_encoding_inverts_alpha() -> anyhow::Result<()> {
        let mask = MaskBuilder::build(MaskMode::Center, (8, 8), None)?;
        let decoded = image::load_from_memory(&mask.to_luma_png()?)?.to_luma8();
        assert_eq!(decoded.get_pixel(4, 4)[0], 255);
        assert_eq!(decoded.get_pixel(0, 0)[0], 0);

        let alpha = image::load_from_memory(&mask.to_alpha_png()?)?.to_rgba8();
        assert_eq!(alpha.get_pixel(4, 4)[3], 0);
        assert_eq!(alpha.get_pixel(0, 0)[3], 255);
        Ok(())
    }

    #[test]
    fn feathering_softens_the_boundary() -> anyhow::Result<()> {
        let mask = MaskBuilder::build(MaskMode::LeftHalf, (32, 32), None)?;
        let soft = MaskBuilder::feather(mask.clone(), 3);
        assert_eq!(soft.dimensions(), mask.dimensions());
        let edge_alpha = soft.image().get_pixel(16, 16)[3];
        assert!(edge_alpha > 0 && edge_alpha < 255, "alpha {edge_alpha}");
        assert_eq!(MaskBuilder::feather(mask.clone(), 0), mask);
        Ok(())
    }
}
