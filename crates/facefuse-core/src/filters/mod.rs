//! Classical (non-ML) image enhancement used when no restoration model is
//! available, plus the Gaussian kernels shared with the compositor.

pub mod clahe;
pub mod color;
pub mod denoise;
pub mod gaussian;

use crate::image_buffer::ImageBuffer;

const CLAHE_TILES: usize = 8;
const CLAHE_CLIP_LIMIT: f32 = 2.0;
const UNSHARP_SIGMA: f64 = 2.0;

/// Edge-preserving denoise scaled by `level` in `[0, 1]`.
///
/// Returns `false` (buffer untouched) when the level rounds down to zero
/// strength.
pub fn denoise(image: &mut ImageBuffer, level: f32) -> bool {
    let strength = denoise::strength_for_level(level);
    if strength < 1 {
        return false;
    }
    let (w, h) = (image.width() as usize, image.height() as usize);
    denoise::bilateral_denoise(image.data_mut(), w, h, strength);
    true
}

/// Local contrast equalization on the CIELAB lightness channel.
pub fn enhance_details(image: &mut ImageBuffer) {
    let (w, h) = (image.width() as usize, image.height() as usize);
    color::map_lightness(image.data_mut(), w, h, |plane| {
        clahe::clahe_enhance(plane, w, h, CLAHE_TILES, CLAHE_CLIP_LIMIT)
    });
}

/// Unsharp mask: `image * (1 + amount) - gaussian(image) * amount`.
pub fn unsharp_mask(image: &mut ImageBuffer, amount: f32) {
    if amount <= 0.0 {
        return;
    }
    let (w, h) = (image.width() as usize, image.height() as usize);
    let kernel = gaussian::gaussian_kernel_1d(gaussian::size_for_sigma(UNSHARP_SIGMA), UNSHARP_SIGMA);
    let mut blurred = image.data().to_vec();
    let mut temp = Vec::new();
    gaussian::blur_u8(&mut blurred, w, h, ImageBuffer::CHANNELS, &kernel, &mut temp);

    for (px, &b) in image.data_mut().iter_mut().zip(blurred.iter()) {
        let v = *px as f32 * (1.0 + amount) - b as f32 * amount;
        *px = v.round().clamp(0.0, 255.0) as u8;
    }
}
