//! Image preprocessing ahead of OCR
//!
//! Pure transformation from request bytes to worker input bytes: decode,
//! grayscale, binarize, re-encode in the detected input format. Only JPEG,
//! PNG and GIF are accepted. The grayscale step normalises 16-bit channels
//! by integer division with 256 before the Rec.601 combination; keep that
//! order, downstream consumers depend on bit-identical output.

use std::io::Cursor;

use image::{DynamicImage, GrayImage, ImageFormat};
use thiserror::Error;

/// Binarization mode
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ThresholdMode {
    /// Fixed threshold value
    Binary,
    /// Threshold computed with Otsu's method
    Otsu,
}

#[derive(Error, Debug)]
pub enum ImageProcError {
    #[error("unsupported image format: only jpeg, png and gif are accepted")]
    UnsupportedFormat,

    #[error("failed to decode image: {0}")]
    Decode(String),

    #[error("failed to encode image: {0}")]
    Encode(String),
}

/// Detect the image format of `data`, accepting only JPEG, PNG and GIF.
pub fn detect_format(data: &[u8]) -> Result<ImageFormat, ImageProcError> {
    match image::guess_format(data) {
        Ok(format @ (ImageFormat::Jpeg | ImageFormat::Png | ImageFormat::Gif)) => Ok(format),
        _ => Err(ImageProcError::UnsupportedFormat),
    }
}

/// Decode `data`, grayscale and threshold it, and re-encode it in its
/// original format. The output image holds only the pixel values 0 and 255,
/// which makes the transformation idempotent on its own output.
pub fn binarize(
    data: &[u8],
    mode: ThresholdMode,
    threshold: u8,
) -> Result<Vec<u8>, ImageProcError> {
    let format = detect_format(data)?;
    let img = image::load_from_memory_with_format(data, format)
        .map_err(|e| ImageProcError::Decode(e.to_string()))?;

    let gray = to_grayscale(&img);
    let threshold = match mode {
        ThresholdMode::Binary => threshold,
        ThresholdMode::Otsu => otsu_threshold(&gray),
    };
    let binary = apply_threshold(&gray, threshold);

    let mut buf = Vec::new();
    DynamicImage::ImageLuma8(binary)
        .write_to(&mut Cursor::new(&mut buf), format)
        .map_err(|e| ImageProcError::Encode(e.to_string()))?;
    Ok(buf)
}

/// Convert to 8-bit grayscale with Rec.601 luma.
///
/// Channels come in as 16-bit and are truncated to 8-bit individually
/// before the weighted combination.
fn to_grayscale(img: &DynamicImage) -> GrayImage {
    let rgba = img.to_rgba16();
    GrayImage::from_fn(rgba.width(), rgba.height(), |x, y| {
        let p = rgba.get_pixel(x, y);
        let r = (p[0] / 256) as f64;
        let g = (p[1] / 256) as f64;
        let b = (p[2] / 256) as f64;
        let luma = 0.299 * r + 0.587 * g + 0.114 * b;
        image::Luma([luma as u8])
    })
}

/// Compute the threshold maximising between-class variance over the
/// 256-bin histogram. Ties keep the first maximum.
fn otsu_threshold(img: &GrayImage) -> u8 {
    let mut histogram = [0u64; 256];
    for pixel in img.pixels() {
        histogram[pixel[0] as usize] += 1;
    }
    let total_pixels = (img.width() as u64) * (img.height() as u64);

    let sum: u64 = histogram
        .iter()
        .enumerate()
        .map(|(i, &count)| i as u64 * count)
        .sum();

    let mut sum_background = 0u64;
    let mut weight_background = 0u64;
    let mut var_max = 0.0f64;
    let mut threshold = 0u8;

    for i in 0..256 {
        weight_background += histogram[i];
        if weight_background == 0 {
            continue;
        }
        let weight_foreground = total_pixels - weight_background;
        if weight_foreground == 0 {
            break;
        }
        sum_background += i as u64 * histogram[i];

        let mean_background = sum_background as f64 / weight_background as f64;
        let mean_foreground = (sum - sum_background) as f64 / weight_foreground as f64;
        let diff = mean_background - mean_foreground;
        let var_between = weight_background as f64 * weight_foreground as f64 * diff * diff;

        if var_between > var_max {
            var_max = var_between;
            threshold = i as u8;
        }
    }

    threshold
}

fn apply_threshold(img: &GrayImage, threshold: u8) -> GrayImage {
    GrayImage::from_fn(img.width(), img.height(), |x, y| {
        if img.get_pixel(x, y)[0] > threshold {
            image::Luma([255u8])
        } else {
            image::Luma([0u8])
        }
    })
}
