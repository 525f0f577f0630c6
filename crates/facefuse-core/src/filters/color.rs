//! sRGB ↔ CIELAB (D65) conversion for luminance-only processing.

const XN: f32 = 0.950_456;
const ZN: f32 = 1.088_754;
const EPSILON: f32 = 0.008_856;
const KAPPA: f32 = 903.3;

fn srgb_to_linear(c: u8) -> f32 {
    let c = c as f32 / 255.0;
    if c <= 0.04045 {
        c / 12.92
    } else {
        ((c + 0.055) / 1.055).powf(2.4)
    }
}

fn linear_to_srgb(c: f32) -> u8 {
    let c = c.clamp(0.0, 1.0);
    let v = if c <= 0.003_130_8 {
        c * 12.92
    } else {
        1.055 * c.powf(1.0 / 2.4) - 0.055
    };
    (v * 255.0).round().clamp(0.0, 255.0) as u8
}

fn f(t: f32) -> f32 {
    if t > EPSILON {
        t.cbrt()
    } else {
        (KAPPA * t + 16.0) / 116.0
    }
}

fn f_inv(t: f32) -> f32 {
    let t3 = t * t * t;
    if t3 > EPSILON {
        t3
    } else {
        (116.0 * t - 16.0) / KAPPA
    }
}

/// Convert one RGB pixel to `(L, a, b)` with `L` in `[0, 100]`.
pub fn rgb_to_lab(rgb: [u8; 3]) -> [f32; 3] {
    let r = srgb_to_linear(rgb[0]);
    let g = srgb_to_linear(rgb[1]);
    let b = srgb_to_linear(rgb[2]);

    let x = (0.412_453 * r + 0.357_580 * g + 0.180_423 * b) / XN;
    let y = 0.212_671 * r + 0.715_160 * g + 0.072_169 * b;
    let z = (0.019_334 * r + 0.119_193 * g + 0.950_227 * b) / ZN;

    let fx = f(x);
    let fy = f(y);
    let fz = f(z);

    [116.0 * fy - 16.0, 500.0 * (fx - fy), 200.0 * (fy - fz)]
}

/// Convert `(L, a, b)` back to an RGB pixel, clamping out-of-gamut values.
pub fn lab_to_rgb(lab: [f32; 3]) -> [u8; 3] {
    let fy = (lab[0] + 16.0) / 116.0;
    let fx = fy + lab[1] / 500.0;
    let fz = fy - lab[2] / 200.0;

    let x = f_inv(fx) * XN;
    let y = f_inv(fy);
    let z = f_inv(fz) * ZN;

    let r = 3.240_479 * x - 1.537_150 * y - 0.498_535 * z;
    let g = -0.969_256 * x + 1.875_992 * y + 0.041_556 * z;
    let b = 0.055_648 * x - 0.204_043 * y + 1.057_311 * z;

    [linear_to_srgb(r), linear_to_srgb(g), linear_to_srgb(b)]
}

/// Apply `op` to the 8-bit lightness plane (`L * 255 / 100`) of an RGB buffer,
/// keeping chroma untouched.
pub fn map_lightness(data: &mut [u8], width: usize, height: usize, op: impl FnOnce(&mut [u8])) {
    let pixels = width * height;
    let mut lab = Vec::with_capacity(pixels);
    let mut lightness = Vec::with_capacity(pixels);

    for px in data.chunks_exact(3).take(pixels) {
        let v = rgb_to_lab([px[0], px[1], px[2]]);
        lightness.push((v[0] * 255.0 / 100.0).round().clamp(0.0, 255.0) as u8);
        lab.push(v);
    }

    op(&mut lightness);

    for ((px, v), &l) in data.chunks_exact_mut(3).zip(lab.iter()).zip(lightness.iter()) {
        let rgb = lab_to_rgb([l as f32 * 100.0 / 255.0, v[1], v[2]]);
        px.copy_from_slice(&rgb);
    }
}
