//! Face alignment via margin crop and prewhitening.
//!
//! Expands the detected box by a fixed margin, clamps it to the frame,
//! crops and resizes to the FaceNet input size. Prewhitening (per-image
//! mean/stddev normalization) happens separately so aligned crops can be
//! written to disk as ordinary images by the training pipeline.

use crate::types::FaceBox;
use image::{imageops, RgbImage};
use ndarray::Array3;
use thiserror::Error;

/// Total margin added around a detected box (half per side, per axis).
const ALIGN_MARGIN: f32 = 32.0;
/// FaceNet expects 160x160 inputs.
pub const ALIGNED_SIZE: u32 = 160;

#[derive(Error, Debug)]
pub enum AlignmentError {
    #[error("crop region collapsed to {width}x{height} after clamping to the frame")]
    DegenerateCrop { width: i64, height: i64 },
}

/// Expand, clamp, crop and resize a detected face to the FaceNet input size.
///
/// A box touching the frame edge can collapse to an empty region after
/// clamping; that case is rejected rather than silently producing an empty
/// crop.
pub fn align_crop(frame: &RgbImage, face: &FaceBox) -> Result<RgbImage, AlignmentError> {
    let (fw, fh) = frame.dimensions();

    let x1 = (face.x1 - ALIGN_MARGIN / 2.0).max(0.0) as i64;
    let y1 = (face.y1 - ALIGN_MARGIN / 2.0).max(0.0) as i64;
    let x2 = ((face.x2 + ALIGN_MARGIN / 2.0).min(fw as f32)) as i64;
    let y2 = ((face.y2 + ALIGN_MARGIN / 2.0).min(fh as f32)) as i64;

    let width = x2 - x1;
    let height = y2 - y1;
    if width < 1 || height < 1 {
        return Err(AlignmentError::DegenerateCrop { width, height });
    }

    let cropped = imageops::crop_imm(frame, x1 as u32, y1 as u32, width as u32, height as u32)
        .to_image();
    Ok(imageops::resize(
        &cropped,
        ALIGNED_SIZE,
        ALIGNED_SIZE,
        imageops::FilterType::Triangle,
    ))
}

/// Whiten an aligned crop: subtract the per-image mean and divide by the
/// standard deviation, floored at 1/sqrt(pixel_count) to avoid dividing by
/// zero on flat images.
pub fn prewhiten(crop: &RgbImage) -> Array3<f32> {
    let (w, h) = crop.dimensions();
    let count = (w * h * 3) as f32;

    let mut sum = 0.0f64;
    for pixel in crop.pixels() {
        for c in 0..3 {
            sum += pixel.0[c] as f64;
        }
    }
    let mean = (sum / count as f64) as f32;

    let mut var_sum = 0.0f64;
    for pixel in crop.pixels() {
        for c in 0..3 {
            let d = pixel.0[c] as f32 - mean;
            var_sum += (d * d) as f64;
        }
    }
    let std = ((var_sum / count as f64) as f32).sqrt();
    let std_adj = std.max(1.0 / count.sqrt());

    let mut out = Array3::<f32>::zeros((h as usize, w as usize, 3));
    for (x, y, pixel) in crop.enumerate_pixels() {
        for c in 0..3 {
            out[[y as usize, x as usize, c]] = (pixel.0[c] as f32 - mean) / std_adj;
        }
    }
    out
}
