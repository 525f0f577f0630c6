//! Stateless image algebra used after inference: region color transfer with a
//! radial feathered mask, global strength mixing, and the paste-back of model
//! crops into the full frame.

use thiserror::Error;

use crate::alignment::{invert_affine, sample_bilinear, transform_point, Affine};
use crate::filters::gaussian;
use crate::image_buffer::ImageBuffer;
use crate::types::FaceBox;

/// Added to the swapped region's standard deviation before dividing.
const STD_EPSILON: f32 = 1e-6;
const COLOR_MASK_KERNEL: usize = 21;
const COLOR_MASK_SIGMA: f64 = 11.0;
/// Bilinear coverage above this (out of 255) counts as inside the crop.
const COVERAGE_THRESHOLD: f32 = 20.0;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum CompositeError {
    #[error("image dimensions differ: {left_width}x{left_height} vs {right_width}x{right_height}")]
    DimensionMismatch {
        left_width: u32,
        left_height: u32,
        right_width: u32,
        right_height: u32,
    },
}

fn check_dimensions(left: &ImageBuffer, right: &ImageBuffer) -> Result<(), CompositeError> {
    if left.same_dimensions(right) {
        Ok(())
    } else {
        Err(CompositeError::DimensionMismatch {
            left_width: left.width(),
            left_height: left.height(),
            right_width: right.width(),
            right_height: right.height(),
        })
    }
}

/// `original * (1 - strength) + result * strength`, strength clamped to `[0, 1]`.
///
/// The endpoints return exact copies of `original` / `result`.
pub fn mix(
    original: &ImageBuffer,
    result: &ImageBuffer,
    strength: f32,
) -> Result<ImageBuffer, CompositeError> {
    check_dimensions(original, result)?;
    let s = strength.clamp(0.0, 1.0);
    if s <= 0.0 {
        return Ok(original.clone());
    }
    if s >= 1.0 {
        return Ok(result.clone());
    }

    let mut out = original.clone();
    for (o, &r) in out.data_mut().iter_mut().zip(result.data()) {
        let v = *o as f32 * (1.0 - s) + r as f32 * s;
        *o = v.round().clamp(0.0, 255.0) as u8;
    }
    Ok(out)
}

/// Radial weight `max(0, 1 - d / d_max)` around the integer center of a
/// `width × height` region, feathered with a 21×21 Gaussian (σ = 11).
pub fn radial_mask(width: usize, height: usize) -> Vec<f32> {
    let cx = (width / 2) as f32;
    let cy = (height / 2) as f32;
    let max_dist = (cx * cx + cy * cy).sqrt();

    let mut mask = Vec::with_capacity(width * height);
    for y in 0..height {
        for x in 0..width {
            let weight = if max_dist > 0.0 {
                let dx = x as f32 - cx;
                let dy = y as f32 - cy;
                (1.0 - (dx * dx + dy * dy).sqrt() / max_dist).max(0.0)
            } else {
                1.0
            };
            mask.push(weight);
        }
    }

    let kernel = gaussian::gaussian_kernel_1d(COLOR_MASK_KERNEL, COLOR_MASK_SIGMA);
    gaussian::blur_f32(&mut mask, width, height, &kernel);
    mask
}

fn region_stats(image: &ImageBuffer, region: &FaceBox) -> ([f32; 3], [f32; 3]) {
    let mut sum = [0.0f64; 3];
    let mut sum_sq = [0.0f64; 3];
    let n = (region.width() * region.height()) as f64;

    for y in region.y1..region.y2 {
        for x in region.x1..region.x2 {
            let px = image.pixel(x as u32, y as u32);
            for c in 0..3 {
                let v = px[c] as f64;
                sum[c] += v;
                sum_sq[c] += v * v;
            }
        }
    }

    let mut mean = [0.0f32; 3];
    let mut std = [0.0f32; 3];
    for c in 0..3 {
        let m = sum[c] / n;
        mean[c] = m as f32;
        std[c] = (sum_sq[c] / n - m * m).max(0.0).sqrt() as f32;
    }
    (mean, std)
}

/// Match the swapped region's per-channel statistics to the original's and
/// blend the corrected pixels into `result` through [`radial_mask`].
///
/// Statistics and corrected pixels come from `swapped`, so other faces
/// already blended into `result` do not leak into this one. Returns
/// `Ok(false)` without touching `result` when the box has no area inside
/// the image.
pub fn color_transfer(
    result: &mut ImageBuffer,
    swapped: &ImageBuffer,
    original: &ImageBuffer,
    face_box: &FaceBox,
) -> Result<bool, CompositeError> {
    check_dimensions(original, result)?;
    check_dimensions(swapped, result)?;
    let Some(region) = face_box.clip(result.width(), result.height()) else {
        return Ok(false);
    };

    let (mean_s, std_s) = region_stats(swapped, &region);
    let (mean_o, std_o) = region_stats(original, &region);
    let (rw, rh) = (region.width() as usize, region.height() as usize);
    let mask = radial_mask(rw, rh);

    for ry in 0..rh {
        for rx in 0..rw {
            let (x, y) = ((region.x1 as usize + rx) as u32, (region.y1 as usize + ry) as u32);
            let src = swapped.pixel(x, y);
            let current = result.pixel(x, y);
            let m = mask[ry * rw + rx];
            let mut out = [0u8; 3];
            for c in 0..3 {
                let corrected = ((src[c] as f32 - mean_s[c]) * (std_o[c] / (std_s[c] + STD_EPSILON))
                    + mean_o[c])
                    .clamp(0.0, 255.0);
                out[c] = (corrected * m + current[c] as f32 * (1.0 - m))
                    .round()
                    .clamp(0.0, 255.0) as u8;
            }
            result.put_pixel(x, y, out);
        }
    }
    Ok(true)
}

/// Run [`color_transfer`] for every box against a snapshot of the swapped
/// image, best-effort: a failing face keeps its uncorrected pixels and is
/// logged. Returns how many faces were corrected.
pub fn color_correct_faces(
    result: &mut ImageBuffer,
    original: &ImageBuffer,
    boxes: &[FaceBox],
) -> usize {
    let swapped = result.clone();
    let mut corrected = 0;
    for (face_index, face_box) in boxes.iter().enumerate() {
        match color_transfer(result, &swapped, original, face_box) {
            Ok(true) => corrected += 1,
            Ok(false) => {
                tracing::debug!(face_index, ?face_box, "color correction skipped: empty region");
            }
            Err(e) => {
                tracing::warn!(face_index, error = %e, "color correction failed, keeping swap");
            }
        }
    }
    corrected
}

/// Rectangular erosion (min filter) with a `k × k` kernel anchored at `k / 2`.
/// Samples outside the plane do not erode.
fn erode(plane: &mut [u8], width: usize, height: usize, k: usize) {
    if k <= 1 {
        return;
    }
    let before = k / 2;
    let after = k - 1 - before;
    let mut temp = vec![0u8; plane.len()];

    for y in 0..height {
        for x in 0..width {
            let lo = x.saturating_sub(before);
            let hi = (x + after).min(width - 1);
            temp[y * width + x] = plane[y * width + lo..=y * width + hi]
                .iter()
                .copied()
                .min()
                .unwrap_or(0);
        }
    }
    for y in 0..height {
        let lo = y.saturating_sub(before);
        let hi = (y + after).min(height - 1);
        for x in 0..width {
            plane[y * width + x] = (lo..=hi).map(|sy| temp[sy * width + x]).min().unwrap_or(0);
        }
    }
}

/// Warp a model output crop back into `frame` and alpha-merge it.
///
/// `frame_to_crop` is the alignment matrix that produced the crop. The crop's
/// coverage is thresholded to a binary mask, eroded by `max(size/10, 10)` and
/// feathered with a Gaussian of size `2*max(size/20, 5)+1`, where `size` is the
/// geometric mean of the mask's extent. Returns `false` when the crop does not
/// land inside the frame.
pub fn paste_back(frame: &mut ImageBuffer, crop: &ImageBuffer, frame_to_crop: &Affine) -> bool {
    let crop_to_frame = invert_affine(frame_to_crop);
    let (fw, fh) = (frame.width() as i64, frame.height() as i64);
    let (cw, ch) = (crop.width() as usize, crop.height() as usize);
    if fw == 0 || fh == 0 || cw == 0 || ch == 0 {
        return false;
    }

    // Frame-space window around the crop, padded by one crop pixel's reach.
    let scale = (crop_to_frame[0] * crop_to_frame[4] - crop_to_frame[1] * crop_to_frame[3])
        .abs()
        .sqrt();
    let pad = scale.ceil() as i64 + 2;
    let corners = [
        (0.0, 0.0),
        (cw as f32, 0.0),
        (0.0, ch as f32),
        (cw as f32, ch as f32),
    ]
    .map(|p| transform_point(&crop_to_frame, p));
    let min_x = corners.iter().map(|p| p.0).fold(f32::INFINITY, f32::min).floor() as i64 - pad;
    let max_x = corners.iter().map(|p| p.0).fold(f32::NEG_INFINITY, f32::max).ceil() as i64 + pad;
    let min_y = corners.iter().map(|p| p.1).fold(f32::INFINITY, f32::min).floor() as i64 - pad;
    let max_y = corners.iter().map(|p| p.1).fold(f32::NEG_INFINITY, f32::max).ceil() as i64 + pad;

    let (x0, x1) = (min_x.max(0), max_x.min(fw));
    let (y0, y1) = (min_y.max(0), max_y.min(fh));
    if x1 <= x0 || y1 <= y0 {
        return false;
    }
    let (ww, wh) = ((x1 - x0) as usize, (y1 - y0) as usize);

    let white = vec![255u8; cw * ch];
    let mut fake = vec![0.0f32; ww * wh * 3];
    let mut mask = vec![0u8; ww * wh];
    let (mut mx0, mut mx1, mut my0, mut my1) = (usize::MAX, 0usize, usize::MAX, 0usize);

    for wy in 0..wh {
        for wx in 0..ww {
            let fx = (x0 as usize + wx) as f32;
            let fy = (y0 as usize + wy) as f32;
            let (sx, sy) = transform_point(frame_to_crop, (fx, fy));
            let i = wy * ww + wx;
            for c in 0..3 {
                fake[i * 3 + c] = sample_bilinear(crop.data(), cw, ch, 3, sx, sy, c);
            }
            if sample_bilinear(&white, cw, ch, 1, sx, sy, 0) > COVERAGE_THRESHOLD {
                mask[i] = 255;
                mx0 = mx0.min(wx);
                mx1 = mx1.max(wx);
                my0 = my0.min(wy);
                my1 = my1.max(wy);
            }
        }
    }
    if mx0 == usize::MAX {
        return false;
    }

    let mask_size = (((my1 - my0) * (mx1 - mx0)) as f64).sqrt() as usize;
    let erode_k = (mask_size / 10).max(10);
    erode(&mut mask, ww, wh, erode_k);

    let blur_k = 2 * (mask_size / 20).max(5) + 1;
    let kernel = gaussian::gaussian_kernel_1d(blur_k, 0.0);
    let mut alpha: Vec<f32> = mask.iter().map(|&m| m as f32 / 255.0).collect();
    gaussian::blur_f32(&mut alpha, ww, wh, &kernel);

    for wy in 0..wh {
        for wx in 0..ww {
            let i = wy * ww + wx;
            let a = alpha[i];
            if a <= 0.0 {
                continue;
            }
            let (px, py) = ((x0 as usize + wx) as u32, (y0 as usize + wy) as u32);
            let orig = frame.pixel(px, py);
            let mut out = [0u8; 3];
            for c in 0..3 {
                let v = fake[i * 3 + c] * a + orig[c] as f32 * (1.0 - a);
                out[c] = v.round().clamp(0.0, 255.0) as u8;
            }
            frame.put_pixel(px, py, out);
        }
    }
    true
}
