use super::gaussian::reflect_101;

/// Neighborhood radius (7x7 window).
const RADIUS: usize = 3;
const SIGMA_SPACE: f32 = 2.0;
/// Range sigma per unit of filter strength.
const SIGMA_COLOR_PER_STRENGTH: f32 = 2.5;
const MAX_DIST_SQ: usize = 3 * 255 * 255;
const RANGE_BUCKET: usize = 16;

/// Filter strength for a `[0, 1]` denoise level: `floor(level * 10)`.
pub fn strength_for_level(level: f32) -> u32 {
    (level.clamp(0.0, 1.0) * 10.0) as u32
}

/// Edge-preserving bilateral denoise of an interleaved RGB buffer.
///
/// `strength` scales the range kernel: small intensity differences are
/// averaged away while edges (large differences) survive. A strength of 0
/// leaves the buffer unchanged.
pub fn bilateral_denoise(data: &mut [u8], width: usize, height: usize, strength: u32) {
    if strength == 0 || width == 0 || height == 0 {
        return;
    }
    let sigma_color = strength as f32 * SIGMA_COLOR_PER_STRENGTH;
    let inv_color = -1.0 / (2.0 * sigma_color * sigma_color);
    let inv_space = -1.0 / (2.0 * SIGMA_SPACE * SIGMA_SPACE);

    let side = 2 * RADIUS + 1;
    let spatial: Vec<f32> = (0..side * side)
        .map(|i| {
            let dy = (i / side) as f32 - RADIUS as f32;
            let dx = (i % side) as f32 - RADIUS as f32;
            ((dx * dx + dy * dy) * inv_space).exp()
        })
        .collect();

    // Range weight only depends on the squared color distance; tabulate it
    // in buckets of RANGE_BUCKET.
    let range_table: Vec<f32> = (0..=MAX_DIST_SQ / RANGE_BUCKET)
        .map(|bucket| ((bucket * RANGE_BUCKET) as f32 * inv_color).exp())
        .collect();

    let src = data.to_vec();
    for y in 0..height {
        for x in 0..width {
            let center = (y * width + x) * 3;
            let (cr, cg, cb) = (
                src[center] as i32,
                src[center + 1] as i32,
                src[center + 2] as i32,
            );

            let mut acc = [0.0f32; 3];
            let mut total = 0.0f32;
            for ky in 0..side {
                let sy = reflect_101(y as isize + ky as isize - RADIUS as isize, height);
                for kx in 0..side {
                    let sx = reflect_101(x as isize + kx as isize - RADIUS as isize, width);
                    let i = (sy * width + sx) * 3;
                    let dr = src[i] as i32 - cr;
                    let dg = src[i + 1] as i32 - cg;
                    let db = src[i + 2] as i32 - cb;
                    let dist_sq = (dr * dr + dg * dg + db * db) as usize;

                    let w = spatial[ky * side + kx] * range_table[dist_sq / RANGE_BUCKET];
                    acc[0] += src[i] as f32 * w;
                    acc[1] += src[i + 1] as f32 * w;
                    acc[2] += src[i + 2] as f32 * w;
                    total += w;
                }
            }

            for c in 0..3 {
                data[center + c] = (acc[c] / total).round().clamp(0.0, 255.0) as u8;
            }
        }
    }
}
