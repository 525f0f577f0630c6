/// Sigma OpenCV derives when a kernel size is given with `sigma <= 0`.
pub fn default_sigma(kernel_size: usize) -> f64 {
    0.3 * ((kernel_size as f64 - 1.0) * 0.5 - 1.0) + 0.8
}

/// Kernel size OpenCV picks for an 8-bit image when only sigma is given.
pub fn size_for_sigma(sigma: f64) -> usize {
    ((sigma * 6.0 + 1.0).round() as usize) | 1
}

/// Normalized 1D Gaussian kernel.
///
/// `kernel_size` must be odd and >= 1. A non-positive `sigma` falls back to
/// [`default_sigma`].
pub fn gaussian_kernel_1d(kernel_size: usize, sigma: f64) -> Vec<f32> {
    debug_assert!(kernel_size >= 1 && kernel_size % 2 == 1);
    let sigma = if sigma > 0.0 {
        sigma
    } else {
        default_sigma(kernel_size)
    };
    let half = (kernel_size / 2) as f64;
    let mut kernel_f64: Vec<f64> = (0..kernel_size)
        .map(|i| {
            let x = i as f64 - half;
            (-x * x / (2.0 * sigma * sigma)).exp()
        })
        .collect();
    let sum: f64 = kernel_f64.iter().sum();
    for v in &mut kernel_f64 {
        *v /= sum;
    }
    kernel_f64.iter().map(|&v| v as f32).collect()
}

/// Separable Gaussian blur over interleaved `u8` data with reflect-101 borders.
///
/// `temp` is resized as needed so callers can reuse it across calls.
pub fn blur_u8(
    data: &mut [u8],
    width: usize,
    height: usize,
    channels: usize,
    kernel: &[f32],
    temp: &mut Vec<f32>,
) {
    let kernel_size = kernel.len();
    if kernel_size <= 1 || width == 0 || height == 0 {
        return;
    }
    let half = kernel_size / 2;
    temp.resize(width * height * channels, 0.0);

    // Horizontal pass: data → temp
    for y in 0..height {
        for x in 0..width {
            for c in 0..channels {
                let mut sum = 0.0f32;
                for (k, &w) in kernel.iter().enumerate() {
                    let sx = clamp_index(x, k, half, width);
                    sum += data[(y * width + sx) * channels + c] as f32 * w;
                }
                temp[(y * width + x) * channels + c] = sum;
            }
        }
    }

    // Vertical pass: temp → data
    for y in 0..height {
        for x in 0..width {
            for c in 0..channels {
                let mut sum = 0.0f32;
                for (k, &w) in kernel.iter().enumerate() {
                    let sy = clamp_index(y, k, half, height);
                    sum += temp[(sy * width + x) * channels + c] * w;
                }
                data[(y * width + x) * channels + c] = sum.round().clamp(0.0, 255.0) as u8;
            }
        }
    }
}

/// Separable Gaussian blur over a single `f32` plane with reflect-101 borders.
pub fn blur_f32(data: &mut [f32], width: usize, height: usize, kernel: &[f32]) {
    let kernel_size = kernel.len();
    if kernel_size <= 1 || width == 0 || height == 0 {
        return;
    }
    let half = kernel_size / 2;
    let mut temp = vec![0.0f32; width * height];

    for y in 0..height {
        for x in 0..width {
            let mut sum = 0.0f32;
            for (k, &w) in kernel.iter().enumerate() {
                sum += data[y * width + clamp_index(x, k, half, width)] * w;
            }
            temp[y * width + x] = sum;
        }
    }

    for y in 0..height {
        for x in 0..width {
            let mut sum = 0.0f32;
            for (k, &w) in kernel.iter().enumerate() {
                sum += temp[clamp_index(y, k, half, height) * width + x] * w;
            }
            data[y * width + x] = sum;
        }
    }
}

fn clamp_index(pos: usize, k: usize, half: usize, len: usize) -> usize {
    reflect_101(pos as isize + k as isize - half as isize, len)
}

/// Mirror an out-of-range index about the edge pixel without repeating it
/// (`dcb|abcd|cba`), the OpenCV default border.
pub(crate) fn reflect_101(mut i: isize, len: usize) -> usize {
    let last = len as isize - 1;
    if last <= 0 {
        return 0;
    }
    while i < 0 || i > last {
        i = if i < 0 { -i } else { 2 * last - i };
    }
    i as usize
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_kernel_sums_to_one() {
        let k = gaussian_kernel_1d(21, 11.0);
        let sum: f32 = k.iter().sum();
        assert!((sum - 1.0).abs() < 1e-5);
    }

    #[test]
    fn test_kernel_is_symmetric_with_peak_at_center() {
        let k = gaussian_kernel_1d(7, 0.0);
        for i in 0..k.len() / 2 {
            assert!((k[i] - k[k.len() - 1 - i]).abs() < 1e-6);
            assert!(k[3] >= k[i]);
        }
    }

    #[test]
    fn test_default_sigma_matches_opencv() {
        // ksize 21 → 0.3 * (10 - 1) + 0.8 = 3.5
        assert!((default_sigma(21) - 3.5).abs() < 1e-9);
    }

    #[test]
    fn test_size_for_sigma_is_odd() {
        assert_eq!(size_for_sigma(2.0), 13);
        assert_eq!(size_for_sigma(1.0) % 2, 1);
    }

    #[test]
    fn test_blur_uniform_image_unchanged() {
        let mut data = vec![128u8; 10 * 10 * 3];
        let mut temp = Vec::new();
        blur_u8(&mut data, 10, 10, 3, &gaussian_kernel_1d(5, 0.0), &mut temp);
        assert!(data.iter().all(|&v| (v as i32 - 128).abs() <= 1));
    }

    #[test]
    fn test_blur_spreads_bright_pixel() {
        let mut data = vec![0u8; 10 * 10 * 3];
        let center = (5 * 10 + 5) * 3;
        data[center..center + 3].copy_from_slice(&[255, 255, 255]);
        let mut temp = Vec::new();
        blur_u8(&mut data, 10, 10, 3, &gaussian_kernel_1d(5, 0.0), &mut temp);
        assert!(data[center] < 255);
        assert!(data[(5 * 10 + 6) * 3] > 0);
    }

    #[test]
    fn test_kernel_size_1_is_identity() {
        let mut data = vec![42u8; 5 * 5 * 3];
        let original = data.clone();
        let mut temp = Vec::new();
        blur_u8(&mut data, 5, 5, 3, &gaussian_kernel_1d(1, 0.0), &mut temp);
        assert_eq!(data, original);
    }

    #[test]
    fn test_reflect_101_border() {
        let idx: Vec<usize> = (-3..8).map(|i| reflect_101(i, 5)).collect();
        assert_eq!(idx, vec![3, 2, 1, 0, 1, 2, 3, 4, 3, 2, 1]);
        // Windows wider than the image keep bouncing.
        assert_eq!(reflect_101(-5, 3), 1);
        assert_eq!(reflect_101(4, 1), 0);
    }

    #[test]
    fn test_blur_at_edge_reads_mirrored_neighbors() {
        // Row [0, 90, 0]: the left edge mirrors onto 90, not onto itself.
        let mut plane = vec![0.0f32, 90.0, 0.0];
        blur_f32(&mut plane, 3, 1, &[0.25, 0.5, 0.25]);
        assert!((plane[0] - 45.0).abs() < 1e-4, "{plane:?}");
        assert!((plane[1] - 45.0).abs() < 1e-4, "{plane:?}");
    }

    #[test]
    fn test_blur_f32_preserves_mass_in_interior() {
        let mut plane = vec![0.0f32; 21 * 21];
        plane[10 * 21 + 10] = 1.0;
        blur_f32(&mut plane, 21, 21, &gaussian_kernel_1d(5, 0.0));
        let total: f32 = plane.iter().sum();
        assert!((total - 1.0).abs() < 1e-4);
        assert!(plane[10 * 21 + 10] < 1.0);
    }
}
