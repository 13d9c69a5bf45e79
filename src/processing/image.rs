//! Image decode/resize/encode primitives shared by the pipeline activities.

use anyhow::{Context, Result, anyhow, bail};
use image::imageops::FilterType;
use image::{DynamicImage, ImageFormat};
use std::io::Cursor;

/// Decode raw bytes into a `DynamicImage`, trying the fast JPEG path first
/// and falling back to the generic decoder.
pub fn decode_image(data: &[u8]) -> Result<DynamicImage> {
    let decoders: &[fn(&[u8]) -> Result<DynamicImage>] =
        &[zune_jpeg_decoder, image_crate_decoder];

    for decoder in decoders {
        match decoder(data) {
            Ok(decoded) => return Ok(decoded),
            Err(_) => continue,
        }
    }

    bail!("all decoders failed for image data ({} bytes)", data.len());
}

fn zune_jpeg_decoder(data: &[u8]) -> Result<DynamicImage> {
    use zune_jpeg::JpegDecoder;
    use zune_jpeg::zune_core::colorspace::ColorSpace;

    let mut decoder = JpegDecoder::new(data);
    let pixels = decoder
        .decode()
        .map_err(|err| anyhow!("zune-jpeg failed to decode: {err:?}"))?;
    let (width, height) = decoder
        .dimensions()
        .ok_or_else(|| anyhow!("zune-jpeg produced no dimensions"))?;

    match decoder.get_output_colorspace() {
        Some(ColorSpace::RGB) => {
            image::RgbImage::from_raw(width as u32, height as u32, pixels)
                .map(DynamicImage::ImageRgb8)
                .ok_or_else(|| anyhow!("jpeg RGB buffer does not match dimensions"))
        }
        Some(ColorSpace::Luma) => {
            image::GrayImage::from_raw(width as u32, height as u32, pixels)
                .map(DynamicImage::ImageLuma8)
                .ok_or_else(|| anyhow!("jpeg luma buffer does not match dimensions"))
        }
        other => bail!("unsupported jpeg output colorspace: {other:?}"),
    }
}

fn image_crate_decoder(data: &[u8]) -> Result<DynamicImage> {
    image::load_from_memory(data).context("image crate failed to decode image from memory")
}

/// Height that preserves the aspect ratio at `target_width`, rounded to the
/// nearest pixel, never zero.
pub fn scaled_height(width: u32, height: u32, target_width: u32) -> u32 {
    let scaled = (height as u64 * target_width as u64 + width as u64 / 2) / width as u64;
    scaled.max(1) as u32
}

/// Resize to the target width with Lanczos3, preserving aspect ratio.
pub fn resize_to_width(image: &DynamicImage, target_width: u32) -> DynamicImage {
    let target_height = scaled_height(image.width(), image.height(), target_width);
    image.resize_exact(target_width, target_height, FilterType::Lanczos3)
}

pub fn encode_jpeg(image: &DynamicImage) -> Result<Vec<u8>> {
    let rgb = image.to_rgb8();
    let mut buffer = Cursor::new(Vec::new());
    rgb.write_to(&mut buffer, ImageFormat::Jpeg)
        .context("Failed to encode JPEG")?;
    Ok(buffer.into_inner())
}
