/// Contrast-Limited Adaptive Histogram Equalization on one 8-bit plane, in place.
///
/// Divides the plane into a `tiles x tiles` grid, clips each tile histogram at
/// `clip_limit` times the uniform bin height (OpenCV's `clipLimit` convention),
/// redistributes the excess, and maps every pixel through a bilinear blend of
/// the four nearest tile CDFs. Planes smaller than the grid are left untouched.
pub fn clahe_enhance(plane: &mut [u8], width: usize, height: usize, tiles: usize, clip_limit: f32) {
    if width == 0 || height == 0 || tiles == 0 || plane.len() < width * height {
        return;
    }

    let tile_w = width / tiles;
    let tile_h = height / tiles;
    if tile_w == 0 || tile_h == 0 {
        return;
    }
    let tile_pixels = tile_w * tile_h;
    let clip = ((clip_limit * tile_pixels as f32 / 256.0) as u32).max(1);

    let mut luts: Vec<[f32; 256]> = Vec::with_capacity(tiles * tiles);

    for row in 0..tiles {
        for col in 0..tiles {
            let mut hist = [0u32; 256];
            let y0 = row * tile_h;
            let x0 = col * tile_w;

            for y in y0..y0 + tile_h {
                for x in x0..x0 + tile_w {
                    hist[plane[y * width + x] as usize] += 1;
                }
            }

            let mut excess = 0u32;
            for bin in hist.iter_mut() {
                if *bin > clip {
                    excess += *bin - clip;
                    *bin = clip;
                }
            }
            let redist = excess / 256;
            let leftover = (excess % 256) as usize;
            for (i, bin) in hist.iter_mut().enumerate() {
                *bin += redist;
                if i < leftover {
                    *bin += 1;
                }
            }

            let scale = 255.0 / tile_pixels as f32;
            let mut lut = [0f32; 256];
            let mut running = 0u32;
            for (i, &count) in hist.iter().enumerate() {
                running += count;
                lut[i] = (running as f32 * scale).clamp(0.0, 255.0);
            }
            luts.push(lut);
        }
    }

    for y in 0..height {
        let fy = ((y as f32 / tile_h as f32) - 0.5).clamp(0.0, (tiles - 1) as f32);
        let r0 = fy as usize;
        let r1 = (r0 + 1).min(tiles - 1);
        let dy = fy - r0 as f32;

        for x in 0..width {
            let fx = ((x as f32 / tile_w as f32) - 0.5).clamp(0.0, (tiles - 1) as f32);
            let c0 = fx as usize;
            let c1 = (c0 + 1).min(tiles - 1);
            let dx = fx - c0 as f32;

            let pixel = plane[y * width + x] as usize;
            let tl = luts[r0 * tiles + c0][pixel];
            let tr = luts[r0 * tiles + c1][pixel];
            let bl = luts[r1 * tiles + c0][pixel];
            let br = luts[r1 * tiles + c1][pixel];

            let top = tl * (1.0 - dx) + tr * dx;
            let bot = bl * (1.0 - dx) + br * dx;
            let val = top * (1.0 - dy) + bot * dy;

            plane[y * width + x] = val.round().clamp(0.0, 255.0) as u8;
        }
    }
}
