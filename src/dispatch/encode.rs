//! Upload encoding: decode, resize, JPEG, base64.

use std::io::Cursor;
use std::path::Path;

use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use image::codecs::jpeg::JpegEncoder as JpegWriter;
use image::imageops::FilterType;
use image::DynamicImage;
use serde::{Deserialize, Serialize};

use crate::classify::ClassifyError;

const JPEG_QUALITY: u8 = 85;
const SIDE_STEP: u32 = 32;

/// How an image is resized before upload.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EncodeMode {
    /// Crop the centered square and resize to `size x size`.
    CenterSquare,
    /// Keep the aspect ratio at roughly `size²` pixels.
    #[default]
    PreserveAspect,
}

/// Output dimensions for a `width x height` source.
///
/// For [`EncodeMode::PreserveAspect`] the shorter side is snapped to a
/// multiple of 32 (at least 32) and the longer side follows the aspect ratio.
#[must_use]
pub fn target_dimensions(width: u32, height: u32, size: u32, mode: EncodeMode) -> (u32, u32) {
    if mode == EncodeMode::CenterSquare || width == 0 || height == 0 {
        return (size, size);
    }

    let (w, h) = (f64::from(width), f64::from(height));
    let short_ratio = w.min(h) / w.max(h);
    let long_ratio = w.max(h) / w.min(h);
    // Sides at size² pixels with the source aspect.
    let short = f64::from(size) * short_ratio.sqrt();
    let snapped = ((short / f64::from(SIDE_STEP)).round() as u32 * SIDE_STEP).max(SIDE_STEP);
    let long = (f64::from(snapped) * long_ratio).round() as u32;

    if width <= height {
        (snapped, long)
    } else {
        (long, snapped)
    }
}

/// Turns an image file into the base64 payload sent to a provider.
///
/// Runs on the blocking pool; implementations may do heavy CPU work.
pub trait ImageEncoder: Send + Sync {
    /// Encode `path` at `size` using `mode`.
    ///
    /// # Errors
    ///
    /// Returns [`ClassifyError::LocalEncoding`] if the image cannot be
    /// decoded or re-encoded.
    fn encode(&self, path: &Path, size: u32, mode: EncodeMode) -> Result<String, ClassifyError>;
}

/// Default encoder backed by the `image` crate.
#[derive(Debug, Clone, Copy, Default)]
pub struct JpegEncoder;

impl JpegEncoder {
    fn resize(img: &DynamicImage, size: u32, mode: EncodeMode) -> DynamicImage {
        let (w, h) = (img.width(), img.height());
        match mode {
            EncodeMode::CenterSquare => {
                let side = w.min(h);
                img.crop_imm((w - side) / 2, (h - side) / 2, side, side)
                    .resize_exact(size, size, FilterType::Lanczos3)
            }
            EncodeMode::PreserveAspect => {
                let (tw, th) = target_dimensions(w, h, size, mode);
                img.resize_exact(tw, th, FilterType::Lanczos3)
            }
        }
    }
}

impl ImageEncoder for JpegEncoder {
    fn encode(&self, path: &Path, size: u32, mode: EncodeMode) -> Result<String, ClassifyError> {
        let failed = |message: String| ClassifyError::LocalEncoding {
            path: path.to_path_buf(),
            message,
        };

        let img = image::open(path).map_err(|e| failed(e.to_string()))?;
        let rgb = DynamicImage::ImageRgb8(Self::resize(&img, size, mode).to_rgb8());

        let mut buf = Cursor::new(Vec::new());
        rgb.write_with_encoder(JpegWriter::new_with_quality(&mut buf, JPEG_QUALITY))
            .map_err(|e| failed(e.to_string()))?;
        Ok(STANDARD.encode(buf.into_inner()))
    }
}
