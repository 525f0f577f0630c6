//! RealESRGAN x2 background enhancement.
//!
//! The model runs tile by tile with a small overlap and its 2x output is
//! folded back with a 2x2 box filter, so the enhanced background keeps the
//! input resolution and faces can be pasted onto it directly.

use std::path::Path;
use std::sync::Mutex;

use ort::session::Session;
use ort::value::TensorRef;

use super::OnnxLoadError;
use crate::device::ExecutionProvider;
use crate::image_buffer::ImageBuffer;
use crate::operators::OperatorError;

const SCALE: usize = 2;
const TILE: u32 = 400;
const TILE_PAD: u32 = 10;

/// Half-open pixel rectangle `[x0, x1) x [y0, y1)`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct Rect {
    x0: u32,
    y0: u32,
    x1: u32,
    y1: u32,
}

impl Rect {
    fn width(&self) -> u32 {
        self.x1 - self.x0
    }

    fn height(&self) -> u32 {
        self.y1 - self.y0
    }

    fn padded(&self, pad: u32, width: u32, height: u32) -> Rect {
        Rect {
            x0: self.x0.saturating_sub(pad),
            y0: self.y0.saturating_sub(pad),
            x1: (self.x1 + pad).min(width),
            y1: (self.y1 + pad).min(height),
        }
    }
}

pub struct RealEsrganUpsampler {
    session: Mutex<Session>,
}

impl RealEsrganUpsampler {
    pub fn load(
        path: &Path,
        providers: &[ExecutionProvider],
        intra_threads: usize,
    ) -> Result<Self, OnnxLoadError> {
        let session = super::load_session(path, providers, intra_threads)?;
        Ok(Self {
            session: Mutex::new(session),
        })
    }

    /// Enhance `image` at its own resolution.
    pub fn enhance(&self, image: &ImageBuffer) -> Result<ImageBuffer, OperatorError> {
        let (w, h) = (image.width(), image.height());
        let mut out = image.clone();
        for tile in tiles(w, h, TILE) {
            let padded = tile.padded(TILE_PAD, w, h);
            let upscaled = self.upscale(&crop(image, padded))?;
            fold_into(&mut out, &upscaled, tile, padded);
        }
        tracing::debug!(width = w, height = h, "background enhanced");
        Ok(out)
    }

    fn upscale(&self, tile: &ImageBuffer) -> Result<ImageBuffer, OperatorError> {
        let (w, h) = (tile.width() as usize, tile.height() as usize);
        let input = super::to_nchw(tile, 1.0 / 255.0, 0.0);

        let mut session = self.session.lock().map_err(|_| OperatorError::Poisoned)?;
        let outputs = session.run(ort::inputs![TensorRef::from_array_view(input.view())?])?;
        let (_, data) = outputs[0]
            .try_extract_tensor::<f32>()
            .map_err(|e| OperatorError::InferenceFailed(format!("upsampler output: {e}")))?;

        super::from_nchw(data, w * SCALE, h * SCALE, 255.0, 0.0).ok_or_else(|| {
            OperatorError::InferenceFailed(format!(
                "upsampler output has {} values, expected 3x{}x{}",
                data.len(),
                h * SCALE,
                w * SCALE
            ))
        })
    }
}

/// Row-major grid of `tile`-sized rectangles covering `width x height`.
fn tiles(width: u32, height: u32, tile: u32) -> Vec<Rect> {
    let tile = tile.max(1);
    let mut out = Vec::new();
    for y0 in (0..height).step_by(tile as usize) {
        for x0 in (0..width).step_by(tile as usize) {
            out.push(Rect {
                x0,
                y0,
                x1: (x0 + tile).min(width),
                y1: (y0 + tile).min(height),
            });
        }
    }
    out
}

fn crop(image: &ImageBuffer, rect: Rect) -> ImageBuffer {
    let mut out = ImageBuffer::filled(rect.width(), rect.height(), [0, 0, 0]);
    for y in 0..rect.height() {
        for x in 0..rect.width() {
            out.put_pixel(x, y, image.pixel(rect.x0 + x, rect.y0 + y));
        }
    }
    out
}

/// Write the 2x2 box average of the `tile` region of `upscaled` (which
/// covers `padded` at twice the resolution) into `out`.
fn fold_into(out: &mut ImageBuffer, upscaled: &ImageBuffer, tile: Rect, padded: Rect) {
    let scale = SCALE as u32;
    for y in tile.y0..tile.y1 {
        for x in tile.x0..tile.x1 {
            let (ux, uy) = ((x - padded.x0) * scale, (y - padded.y0) * scale);
            let mut sum = [0u32; 3];
            for (dx, dy) in [(0, 0), (1, 0), (0, 1), (1, 1)] {
                let p = upscaled.pixel(ux + dx, uy + dy);
                for c in 0..3 {
                    sum[c] += p[c] as u32;
                }
            }
            out.put_pixel(x, y, sum.map(|s| ((s + 2) / 4) as u8));
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn nearest_x2(image: &ImageBuffer) -> ImageBuffer {
        let mut out = ImageBuffer::filled(image.width() * 2, image.height() * 2, [0, 0, 0]);
        for y in 0..out.height() {
            for x in 0..out.width() {
                out.put_pixel(x, y, image.pixel(x / 2, y / 2));
            }
        }
        out
    }

    #[test]
    fn test_tiles_cover_image_once() {
        let grid = tiles(950, 410, TILE);
        assert_eq!(grid.len(), 6);
        assert_eq!(grid[2], Rect { x0: 800, y0: 0, x1: 950, y1: 400 });
        assert_eq!(grid[5], Rect { x0: 800, y0: 400, x1: 950, y1: 410 });
        let area: u32 = grid.iter().map(|r| r.width() * r.height()).sum();
        assert_eq!(area, 950 * 410);
    }

    #[test]
    fn test_padding_stays_inside_image() {
        let r = Rect { x0: 0, y0: 400, x1: 400, y1: 410 };
        assert_eq!(r.padded(TILE_PAD, 950, 410), Rect { x0: 0, y0: 390, x1: 410, y1: 410 });
    }

    #[test]
    fn test_fold_of_nearest_upscale_is_identity() {
        let mut image = ImageBuffer::filled(23, 17, [0, 0, 0]);
        for y in 0..17 {
            for x in 0..23 {
                image.put_pixel(x, y, [(x * 11) as u8, (y * 13) as u8, ((x + y) * 5) as u8]);
            }
        }

        let mut out = ImageBuffer::filled(23, 17, [9, 9, 9]);
        for tile in tiles(23, 17, 8) {
            let padded = tile.padded(3, 23, 17);
            fold_into(&mut out, &nearest_x2(&crop(&image, padded)), tile, padded);
        }
        assert_eq!(out, image);
    }

    #[test]
    fn test_fold_averages_each_block() {
        let mut up = ImageBuffer::filled(2, 2, [0, 0, 0]);
        up.put_pixel(1, 0, [100, 40, 3]);
        up.put_pixel(0, 1, [100, 40, 3]);
        let rect = Rect { x0: 0, y0: 0, x1: 1, y1: 1 };
        let mut out = ImageBuffer::filled(1, 1, [0, 0, 0]);
        fold_into(&mut out, &up, rect, rect);
        assert_eq!(out.pixel(0, 0), [50, 20, 2]);
    }
}
