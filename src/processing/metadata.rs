//! Blur-hash and camera-metadata extraction for the metadata activity.
//!
//! Everything here is best-effort by contract: a photo without EXIF, or with
//! EXIF we cannot parse, still flows through the pipeline with empty fields.

use std::io::Cursor;
use std::sync::LazyLock;

use anyhow::{Result, anyhow};
use exif::{Exif, In, Tag, Value};
use image::DynamicImage;
use log::info;
use regex::Regex;

use crate::models::photo::CameraMetadata;
use crate::processing::image::resize_to_width;

/// Width of the throwaway derivative used for the blur hash. Anything this
/// small encodes in microseconds and the 4×3 component grid cannot resolve
/// more detail anyway.
const BLUR_HASH_WIDTH: u32 = 32;

const BLUR_COMPONENTS_X: u32 = 4;
const BLUR_COMPONENTS_Y: u32 = 3;

/// Compact placeholder encoding of the image, suitable for progressive
/// loading. Computed from a ~32px derivative.
pub fn blur_hash(image: &DynamicImage) -> Result<String> {
    let tiny = resize_to_width(image, BLUR_HASH_WIDTH);
    let rgba = tiny.to_rgba8();
    let (width, height) = (rgba.width(), rgba.height());
    blurhash::encode(BLUR_COMPONENTS_X, BLUR_COMPONENTS_Y, width, height, &rgba)
        .map_err(|err| anyhow!("Failed to encode blur hash: {err:?}"))
}

/// Parse embedded camera metadata out of the original bytes. Never fails:
/// absent or malformed EXIF degrades to empty fields.
pub fn extract_camera_metadata(data: &[u8]) -> CameraMetadata {
    let exif = match exif::Reader::new().read_from_container(&mut Cursor::new(data)) {
        Ok(exif) => exif,
        Err(err) => {
            info!("No EXIF data available for image: {err}");
            return CameraMetadata::default();
        }
    };

    let mut camera = CameraMetadata::default();

    if let Some(focal) = rational_value(&exif, Tag::FocalLength) {
        camera.focal_length = format!("{}mm", focal.trunc() as u32);
    }
    if let Some(mm) = int_value(&exif, Tag::FocalLengthIn35mmFilm) {
        camera.focal_length_35mm = format!("{mm}mm");
    }
    if let Some(model) = ascii_value(&exif, Tag::LensModel) {
        camera.lens = clean_lens_model(&model, ascii_value(&exif, Tag::LensMake).as_deref());
    }
    if let Some(apex) = rational_value(&exif, Tag::ApertureValue) {
        camera.aperture = format_aperture(apex);
    }
    if let Some(apex) = rational_value(&exif, Tag::ShutterSpeedValue) {
        camera.shutter_speed = format_shutter_speed(apex);
    }
    if let Some(iso) = int_value(&exif, Tag::PhotographicSensitivity) {
        camera.iso = iso.to_string();
    }

    camera
}

fn rational_value(exif: &Exif, tag: Tag) -> Option<f64> {
    let field = exif.get_field(tag, In::PRIMARY)?;
    let value = match &field.value {
        Value::Rational(values) => values.first().map(|r| r.to_f64()),
        Value::SRational(values) => values.first().map(|r| r.to_f64()),
        _ => None,
    }?;
    value.is_finite().then_some(value)
}

fn int_value(exif: &Exif, tag: Tag) -> Option<i64> {
    let field = exif.get_field(tag, In::PRIMARY)?;
    match &field.value {
        Value::Byte(values) => values.first().map(|v| *v as i64),
        Value::Short(values) => values.first().map(|v| *v as i64),
        Value::Long(values) => values.first().map(|v| *v as i64),
        _ => None,
    }
}

fn ascii_value(exif: &Exif, tag: Tag) -> Option<String> {
    let field = exif.get_field(tag, In::PRIMARY)?;
    match &field.value {
        Value::Ascii(values) => values
            .first()
            .map(|bytes| String::from_utf8_lossy(bytes).trim().to_string()),
        _ => None,
    }
}

// Trailing internal product codes some vendors append to the lens model,
// e.g. "Tamron 28-75mm F2.8 B061".
static LENS_TECH_CODE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"\s+[A-Z]\d{3,4}$").expect("valid lens code pattern"));

fn clean_lens_model(model: &str, make: Option<&str>) -> String {
    let mut lens = model.trim().trim_matches('"').trim().to_string();
    lens = LENS_TECH_CODE.replace(&lens, "").trim().to_string();

    if let Some(make) = make {
        let make = make.trim().trim_matches('"').trim();
        if !make.is_empty() && !lens.to_lowercase().contains(&make.to_lowercase()) {
            lens = format!("{make} {lens}");
        }
    }

    lens
}

/// APEX aperture to an f-number: f = 2^(value / 2).
pub fn format_aperture(apex: f64) -> String {
    format!("f/{:.1}", 2f64.powf(apex / 2.0))
}

/// APEX shutter speed to exposure time: t = 2^(-value). Whole seconds as
/// "Ns", slow fractional speeds as "N.Ns", fast speeds as "1/N" with the
/// denominator rounded to the nearest integer.
pub fn format_shutter_speed(apex: f64) -> String {
    let seconds = 2f64.powf(-apex);
    if seconds >= 1.0 {
        if seconds.fract() == 0.0 {
            format!("{}s", seconds as u64)
        } else {
            format!("{seconds:.1}s")
        }
    } else {
        format!("1/{}", (1.0 / seconds).round() as u64)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use image::{Rgb, RgbImage};

    #[test]
    fn aperture_follows_apex_conversion() {
        assert_eq!(format_aperture(4.0), "f/4.0");
        assert_eq!(format_aperture(2.0), "f/2.0");
        assert_eq!(format_aperture(5.0), "f/5.7");
    }

    #[test]
    fn shutter_speed_covers_all_three_formats() {
        assert_eq!(format_shutter_speed(0.0), "1s");
        assert_eq!(format_shutter_speed(-1.0), "2s");
        assert_eq!(format_shutter_speed(3.0), "1/8");
        assert_eq!(format_shutter_speed(6.643856), "1/100");
        // Between one and two seconds: fractional formatting.
        assert_eq!(format_shutter_speed(-0.584963), "1.5s");
    }

    #[test]
    fn lens_model_is_trimmed_and_prefixed_with_make() {
        assert_eq!(
            clean_lens_model("28-75mm F/2.8 Di III VXD B061", Some("Tamron")),
            "Tamron 28-75mm F/2.8 Di III VXD"
        );
        // Make already present: no double prefix.
        assert_eq!(
            clean_lens_model("\"Sony FE 55mm F1.8\"", Some("Sony")),
            "Sony FE 55mm F1.8"
        );
        assert_eq!(clean_lens_model("  RF 35mm F1.8  ", None), "RF 35mm F1.8");
    }

    #[test]
    fn missing_exif_degrades_to_empty_fields() {
        let camera = extract_camera_metadata(b"not an image at all");
        assert_eq!(camera, CameraMetadata::default());
    }

    #[test]
    fn blur_hash_is_non_empty_for_a_plain_image() {
        let image = DynamicImage::ImageRgb8(RgbImage::from_pixel(120, 80, Rgb([200, 64, 32])));
        let hash = blur_hash(&image).unwrap();
        assert!(!hash.is_empty());
    }
}
