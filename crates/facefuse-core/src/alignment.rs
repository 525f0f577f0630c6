//! Face alignment via 4-DOF similarity transform.
//!
//! Maps the five detected landmarks onto a canonical template (ArcFace for
//! recognition and inswapper, FFHQ for GFPGAN) with a least-squares similarity
//! transform, and warps RGB crops in both directions.

use crate::image_buffer::ImageBuffer;

/// ArcFace reference landmarks for a 112×112 crop.
pub const ARCFACE_TEMPLATE_112: [(f32, f32); 5] = [
    (38.2946, 51.6963), // left eye
    (73.5318, 51.5014), // right eye
    (56.0252, 71.7366), // nose
    (41.5493, 92.3655), // left mouth
    (70.7299, 92.2041), // right mouth
];

/// FFHQ reference landmarks for the 512×512 GFPGAN input.
pub const FFHQ_TEMPLATE_512: [(f32, f32); 5] = [
    (192.98138, 239.94708),
    (318.90277, 240.1936),
    (256.63416, 314.01935),
    (201.26117, 371.41043),
    (313.08905, 371.15118),
];

/// 2×3 affine matrix `[a, -b, tx, b, a, ty]`, row-major, mapping source
/// coordinates to destination coordinates.
pub type Affine = [f32; 6];

/// ArcFace template scaled for a square crop of `size` pixels.
///
/// Sizes divisible by 112 scale the template directly; other sizes (the
/// 128 px inswapper crop) scale by `size / 128` and shift right by 8 px at
/// that scale.
pub fn arcface_template(size: usize) -> [(f32, f32); 5] {
    let (ratio, diff_x) = if size % 112 == 0 {
        (size as f32 / 112.0, 0.0)
    } else {
        let ratio = size as f32 / 128.0;
        (ratio, 8.0 * ratio)
    };
    ARCFACE_TEMPLATE_112.map(|(x, y)| (x * ratio + diff_x, y * ratio))
}

/// Estimate the similarity transform (scale, rotation, translation) taking
/// `src` landmarks to `dst` landmarks, in the least-squares sense.
pub fn estimate_similarity_transform(src: &[(f32, f32); 5], dst: &[(f32, f32); 5]) -> Affine {
    // Overdetermined system A * [a, b, tx, ty]^T = B, one row pair per point:
    //   sx * a - sy * b + tx = dx
    //   sy * a + sx * b + ty = dy
    let mut ata = [0.0f32; 16];
    let mut atb = [0.0f32; 4];

    for i in 0..5 {
        let (sx, sy) = src[i];
        let (dx, dy) = dst[i];
        let r1 = [sx, -sy, 1.0, 0.0];
        let r2 = [sy, sx, 0.0, 1.0];

        for j in 0..4 {
            for k in 0..4 {
                ata[j * 4 + k] += r1[j] * r1[k] + r2[j] * r2[k];
            }
            atb[j] += r1[j] * dx + r2[j] * dy;
        }
    }

    let x = solve_4x4(&ata, &atb);
    let (a, b, tx, ty) = (x[0], x[1], x[2], x[3]);
    [a, -b, tx, b, a, ty]
}

/// Invert a general 2×3 affine matrix. Singular matrices yield all zeros.
pub fn invert_affine(m: &Affine) -> Affine {
    let det = m[0] * m[4] - m[1] * m[3];
    if det.abs() < 1e-12 {
        return [0.0; 6];
    }
    let inv = 1.0 / det;
    let a = m[4] * inv;
    let b = -m[1] * inv;
    let d = -m[3] * inv;
    let e = m[0] * inv;
    [a, b, -(a * m[2] + b * m[5]), d, e, -(d * m[2] + e * m[5])]
}

/// Apply an affine matrix to a point.
pub fn transform_point(m: &Affine, (x, y): (f32, f32)) -> (f32, f32) {
    (m[0] * x + m[1] * y + m[2], m[3] * x + m[4] * y + m[5])
}

/// Solve a 4×4 linear system via Gaussian elimination with partial pivoting.
#[allow(clippy::needless_range_loop)]
fn solve_4x4(ata: &[f32; 16], atb: &[f32; 4]) -> [f32; 4] {
    let mut m = [[0.0f32; 5]; 4];
    for i in 0..4 {
        for j in 0..4 {
            m[i][j] = ata[i * 4 + j];
        }
        m[i][4] = atb[i];
    }

    for col in 0..4 {
        let mut max_row = col;
        let mut max_val = m[col][col].abs();
        for row in (col + 1)..4 {
            if m[row][col].abs() > max_val {
                max_val = m[row][col].abs();
                max_row = row;
            }
        }
        m.swap(col, max_row);

        let pivot = m[col][col];
        if pivot.abs() < 1e-12 {
            return [1.0, 0.0, 0.0, 0.0];
        }

        for row in (col + 1)..4 {
            let factor = m[row][col] / pivot;
            for j in col..5 {
                m[row][j] -= factor * m[col][j];
            }
        }
    }

    let mut x = [0.0f32; 4];
    for i in (0..4).rev() {
        x[i] = m[i][4];
        for j in (i + 1)..4 {
            x[i] -= m[i][j] * x[j];
        }
        x[i] /= m[i][i];
    }
    x
}

/// Bilinear sample of channel `c` at `(x, y)`; outside pixels read as 0.
pub fn sample_bilinear(
    data: &[u8],
    width: usize,
    height: usize,
    channels: usize,
    x: f32,
    y: f32,
    c: usize,
) -> f32 {
    let x0 = x.floor() as i32;
    let y0 = y.floor() as i32;
    let fx = x - x0 as f32;
    let fy = y - y0 as f32;

    let at = |px: i32, py: i32| -> f32 {
        if px >= 0 && px < width as i32 && py >= 0 && py < height as i32 {
            data[(py as usize * width + px as usize) * channels + c] as f32
        } else {
            0.0
        }
    };

    at(x0, y0) * (1.0 - fx) * (1.0 - fy)
        + at(x0 + 1, y0) * fx * (1.0 - fy)
        + at(x0, y0 + 1) * (1.0 - fx) * fy
        + at(x0 + 1, y0 + 1) * fx * fy
}

/// Warp `src` through `m` (source → destination) into a `out_w × out_h`
/// image, bilinear, black outside the source.
pub fn warp_affine(src: &ImageBuffer, m: &Affine, out_w: u32, out_h: u32) -> ImageBuffer {
    let inv = invert_affine(m);
    let (sw, sh) = (src.width() as usize, src.height() as usize);
    let mut out = ImageBuffer::filled(out_w, out_h, [0, 0, 0]);
    let data = out.data_mut();

    for oy in 0..out_h as usize {
        for ox in 0..out_w as usize {
            let (sx, sy) = transform_point(&inv, (ox as f32, oy as f32));
            let base = (oy * out_w as usize + ox) * 3;
            for c in 0..3 {
                let v = sample_bilinear(src.data(), sw, sh, 3, sx, sy, c);
                data[base + c] = v.round().clamp(0.0, 255.0) as u8;
            }
        }
    }
    out
}

/// Align a face to a canonical `size × size` crop using `template`.
///
/// Returns the crop and the frame → crop matrix.
pub fn align_face(
    frame: &ImageBuffer,
    landmarks: &[(f32, f32); 5],
    template: &[(f32, f32); 5],
    size: u32,
) -> (ImageBuffer, Affine) {
    let matrix = estimate_similarity_transform(landmarks, template);
    (warp_affine(frame, &matrix, size, size), matrix)
}
