// src/contrast.rs
//
// Grayscale conversion, contrast-limited adaptive histogram equalisation and
// the vertical Sobel response used to snap caliper endpoints onto vessel walls.

use image::{GrayImage, Luma, RgbImage};

const HIST_BINS: usize = 256;

/// Rec.601 luma, matching the usual BGR/RGB -> gray conversion.
pub fn to_gray(image: &RgbImage) -> GrayImage {
    GrayImage::from_fn(image.width(), image.height(), |x, y| {
        let p = image.get_pixel(x, y).0;
        let v = 0.299 * p[0] as f32 + 0.587 * p[1] as f32 + 0.114 * p[2] as f32;
        Luma([v.round().clamp(0.0, 255.0) as u8])
    })
}

/// Contrast-limited adaptive histogram equalisation.
#[derive(Debug, Clone, Copy)]
pub struct Clahe {
    clip_limit: f32,
    grid: (usize, usize),
}

impl Default for Clahe {
    fn default() -> Self {
        Self::new(4.0, (16, 16))
    }
}

impl Clahe {
    pub fn new(clip_limit: f32, grid: (usize, usize)) -> Self {
        Self {
            clip_limit: clip_limit.max(0.0),
            grid: (grid.0.max(1), grid.1.max(1)),
        }
    }

    pub fn apply(&self, src: &GrayImage) -> GrayImage {
        let w = src.width() as usize;
        let h = src.height() as usize;
        if w == 0 || h == 0 {
            return src.clone();
        }

        // Never more tiles than pixels along an axis
        let tiles_x = self.grid.0.min(w);
        let tiles_y = self.grid.1.min(h);
        let luts = self.tile_luts(src, tiles_x, tiles_y);

        let tile_w = w as f32 / tiles_x as f32;
        let tile_h = h as f32 / tiles_y as f32;
        let raw = src.as_raw();
        let mut out = GrayImage::new(w as u32, h as u32);

        for y in 0..h {
            let tyf = y as f32 / tile_h - 0.5;
            let ty0 = tyf.floor() as i64;
            let ya = tyf - ty0 as f32;
            let ty1 = (ty0 + 1).clamp(0, tiles_y as i64 - 1) as usize;
            let ty0 = ty0.clamp(0, tiles_y as i64 - 1) as usize;

            for x in 0..w {
                let txf = x as f32 / tile_w - 0.5;
                let tx0 = txf.floor() as i64;
                let xa = txf - tx0 as f32;
                let tx1 = (tx0 + 1).clamp(0, tiles_x as i64 - 1) as usize;
                let tx0 = tx0.clamp(0, tiles_x as i64 - 1) as usize;

                let v = raw[y * w + x] as usize;
                let lut = |tx: usize, ty: usize| luts[ty * tiles_x + tx][v] as f32;

                let top = lut(tx0, ty0) * (1.0 - xa) + lut(tx1, ty0) * xa;
                let bottom = lut(tx0, ty1) * (1.0 - xa) + lut(tx1, ty1) * xa;
                let res = top * (1.0 - ya) + bottom * ya;

                out.put_pixel(x as u32, y as u32, Luma([res.round().clamp(0.0, 255.0) as u8]));
            }
        }

        out
    }

    fn tile_luts(&self, src: &GrayImage, tiles_x: usize, tiles_y: usize) -> Vec<[u8; HIST_BINS]> {
        let w = src.width() as usize;
        let h = src.height() as usize;
        let raw = src.as_raw();
        let mut luts = Vec::with_capacity(tiles_x * tiles_y);

        for ty in 0..tiles_y {
            let y0 = ty * h / tiles_y;
            let y1 = (ty + 1) * h / tiles_y;
            for tx in 0..tiles_x {
                let x0 = tx * w / tiles_x;
                let x1 = (tx + 1) * w / tiles_x;

                let mut hist = [0u32; HIST_BINS];
                for y in y0..y1 {
                    for &v in &raw[y * w + x0..y * w + x1] {
                        hist[v as usize] += 1;
                    }
                }

                let area = ((x1 - x0) * (y1 - y0)).max(1) as u32;
                if self.clip_limit > 0.0 {
                    let clip = ((self.clip_limit * area as f32 / HIST_BINS as f32) as u32).max(1);
                    clip_histogram(&mut hist, clip);
                }

                let scale = 255.0 / area as f32;
                let mut lut = [0u8; HIST_BINS];
                let mut cdf = 0u32;
                for (i, count) in hist.iter().enumerate() {
                    cdf += count;
                    lut[i] = (cdf as f32 * scale).round().clamp(0.0, 255.0) as u8;
                }
                luts.push(lut);
            }
        }

        luts
    }
}

/// Clips every bin at `clip` and spreads the excess evenly, remainder in strides.
fn clip_histogram(hist: &mut [u32; HIST_BINS], clip: u32) {
    let mut excess = 0u32;
    for bin in hist.iter_mut() {
        if *bin > clip {
            excess += *bin - clip;
            *bin = clip;
        }
    }

    let per_bin = excess / HIST_BINS as u32;
    let mut residual = excess % HIST_BINS as u32;
    for bin in hist.iter_mut() {
        *bin += per_bin;
    }

    if residual > 0 {
        let step = (HIST_BINS / residual as usize).max(1);
        let mut i = 0;
        while i < HIST_BINS && residual > 0 {
            hist[i] += 1;
            residual -= 1;
            i += step;
        }
    }
}

/// `|dI/dy|` from a 3x3 Sobel kernel, row-major. Borders mirror without
/// repeating the edge pixel, so the first and last rows read zero.
pub fn sobel_y_abs(gray: &GrayImage) -> Vec<f32> {
    let w = gray.width() as usize;
    let h = gray.height() as usize;
    let mut out = vec![0.0f32; w * h];
    if w == 0 || h == 0 {
        return out;
    }

    let raw = gray.as_raw();
    let px = |x: usize, y: usize| raw[y * w + x] as f32;

    for y in 0..h {
        let (up, down) = neighbours(y, h);
        for x in 0..w {
            let (left, right) = neighbours(x, w);
            let gy = (px(left, down) + 2.0 * px(x, down) + px(right, down))
                - (px(left, up) + 2.0 * px(x, up) + px(right, up));
            out[y * w + x] = gy.abs();
        }
    }

    out
}

/// Previous and next index with reflect-101 borders. A length of one has
/// nothing to mirror and maps both to itself.
fn neighbours(i: usize, n: usize) -> (usize, usize) {
    if n < 2 {
        return (i, i);
    }
    let prev = if i == 0 { 1 } else { i - 1 };
    let next = if i + 1 == n { n - 2 } else { i + 1 };
    (prev, next)
}

#[cfg(test)]
mod tests {
    use super::*;
    use image::Rgb;

    #[test]
    fn test_to_gray_weights() {
        let img = RgbImage::from_pixel(2, 2, Rgb([255, 0, 0]));
        assert_eq!(to_gray(&img).get_pixel(0, 0).0[0], 76);
        let img = RgbImage::from_pixel(2, 2, Rgb([90, 90, 90]));
        assert_eq!(to_gray(&img).get_pixel(1, 1).0[0], 90);
    }

    #[test]
    fn test_clip_preserves_mass() {
        let mut hist = [0u32; HIST_BINS];
        hist[10] = 1000;
        hist[200] = 37;
        clip_histogram(&mut hist, 20);
        assert_eq!(hist.iter().sum::<u32>(), 1037);
        assert!(hist.iter().all(|&b| b <= 20 + 5));
    }

    #[test]
    fn test_clahe_stretches_low_contrast() {
        let src = GrayImage::from_fn(64, 64, |x, _| Luma([100 + (x / 8) as u8]));
        let out = Clahe::new(4.0, (4, 4)).apply(&src);
        let (lo, hi) = out
            .iter()
            .fold((255u8, 0u8), |(lo, hi), &v| (lo.min(v), hi.max(v)));
        assert_eq!(out.dimensions(), (64, 64));
        assert!(hi - lo > 7, "range {}..{}", lo, hi);
    }

    #[test]
    fn test_clahe_keeps_white_white() {
        let src = GrayImage::from_fn(32, 32, |_, y| Luma([if y >= 10 { 255 } else { 0 }]));
        let out = Clahe::default().apply(&src);
        assert!(out.enumerate_pixels().filter(|p| p.1 >= 10).all(|p| p.2 .0[0] == 255));
        assert!(out.enumerate_pixels().filter(|p| p.1 < 10).all(|p| p.2 .0[0] <= 128));
    }

    #[test]
    fn test_sobel_peaks_at_horizontal_edge() {
        let src = GrayImage::from_fn(8, 16, |_, y| Luma([if y >= 8 { 200 } else { 10 }]));
        let gy = sobel_y_abs(&src);
        let at = |y: usize| gy[y * 8 + 4];
        assert_eq!(at(3), 0.0);
        assert_eq!(at(7), 4.0 * 190.0);
        assert_eq!(at(8), 4.0 * 190.0);
        assert_eq!(at(12), 0.0);
    }

    #[test]
    fn test_sobel_border_rows_are_zero() {
        // A ramp has a gradient everywhere except where the border mirrors
        let src = GrayImage::from_fn(5, 6, |_, y| Luma([(y * 40) as u8]));
        let gy = sobel_y_abs(&src);
        let at = |y: usize| gy[y * 5 + 2];
        assert_eq!(at(0), 0.0);
        assert_eq!(at(5), 0.0);
        assert_eq!(at(1), 4.0 * 80.0);
        assert_eq!(at(4), 4.0 * 80.0);
    }

    #[test]
    fn test_sobel_single_row_is_flat() {
        let src = GrayImage::from_pixel(4, 1, Luma([120]));
        assert!(sobel_y_abs(&src).iter().all(|&g| g == 0.0));
    }
}
