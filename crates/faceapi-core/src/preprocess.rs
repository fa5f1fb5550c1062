//! Crop, resize and tensor conversion shared by the recognizer and the
//! attribute classifiers.

use crate::catalog::{ColorOrder, InputSpec, Layout};
use crate::types::FacialArea;
use image::imageops::{self, FilterType};
use image::{Rgb, RgbImage};
use ndarray::Array4;

/// ITU-R BT.601 luma weights, as used by common BGR→gray conversions.
const LUMA_R: f32 = 0.299;
const LUMA_G: f32 = 0.587;
const LUMA_B: f32 = 0.114;

/// Crop a facial area out of an image.
///
/// Degenerate areas (zero width or height after clipping) fall back to the
/// whole image.
pub fn crop(image: &RgbImage, area: &FacialArea) -> RgbImage {
    let x = area.x.max(0) as u32;
    let y = area.y.max(0) as u32;
    let w = (area.w.max(0) as u32).min(image.width().saturating_sub(x));
    let h = (area.h.max(0) as u32).min(image.height().saturating_sub(y));

    if w == 0 || h == 0 {
        return image.clone();
    }
    imageops::crop_imm(image, x, y, w, h).to_image()
}

/// Resize into a `size × size` square, preserving aspect ratio and padding
/// the remainder with black.
pub fn fit_square(image: &RgbImage, size: usize) -> RgbImage {
    let size = size as u32;
    let (w, h) = (image.width().max(1), image.height().max(1));
    let scale = (size as f32 / w as f32).min(size as f32 / h as f32);
    let new_w = ((w as f32 * scale).round() as u32).clamp(1, size);
    let new_h = ((h as f32 * scale).round() as u32).clamp(1, size);

    let resized = imageops::resize(image, new_w, new_h, FilterType::Triangle);

    let mut canvas = RgbImage::from_pixel(size, size, Rgb([0, 0, 0]));
    let off_x = (size - new_w) / 2;
    let off_y = (size - new_h) / 2;
    imageops::replace(&mut canvas, &resized, off_x as i64, off_y as i64);
    canvas
}

/// Convert a square image into a normalized float tensor laid out as `input` describes.
///
/// Pixels outside the image (if it is smaller than `input.size`) read as black.
pub fn to_tensor(image: &RgbImage, input: &InputSpec) -> Array4<f32> {
    let size = input.size;
    let channels = input.color.channels();
    let shape = match input.layout {
        Layout::Nchw => (1, channels, size, size),
        Layout::Nhwc => (1, size, size, channels),
    };
    let mut tensor = Array4::<f32>::zeros(shape);

    for y in 0..size {
        for x in 0..size {
            let [r, g, b] = image
                .get_pixel_checked(x as u32, y as u32)
                .map(|p| p.0)
                .unwrap_or([0, 0, 0]);
            let (r, g, b) = (r as f32, g as f32, b as f32);

            let values = match input.color {
                ColorOrder::Rgb => [r, g, b],
                ColorOrder::Bgr => [b, g, r],
                ColorOrder::Gray => [LUMA_R * r + LUMA_G * g + LUMA_B * b, 0.0, 0.0],
            };

            for (c, &v) in values.iter().take(channels).enumerate() {
                let normalized = (v - input.mean) / input.std;
                match input.layout {
                    Layout::Nchw => tensor[[0, c, y, x]] = normalized,
                    Layout::Nhwc => tensor[[0, y, x, c]] = normalized,
                }
            }
        }
    }

    tensor
}

/// Numerically stable softmax. Used when a graph emits logits.
pub fn softmax(logits: &[f32]) -> Vec<f32> {
    let max = logits.iter().copied().fold(f32::NEG_INFINITY, f32::max);
    let exps: Vec<f32> = logits.iter().map(|&l| (l - max).exp()).collect();
    let sum: f32 = exps.iter().sum();
    if sum > 0.0 {
        exps.into_iter().map(|e| e / sum).collect()
    } else {
        exps
    }
}

/// Treat `values` as probabilities if they already look like a distribution,
/// otherwise apply softmax.
pub fn as_probabilities(values: &[f32]) -> Vec<f32> {
    let sum: f32 = values.iter().sum();
    let in_range = values.iter().all(|v| (0.0..=1.0).contains(v));
    if in_range && (sum - 1.0).abs() < 1e-3 {
        values.to_vec()
    } else {
        softmax(values)
    }
}
