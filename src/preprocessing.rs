// src/preprocessing.rs
//
// Aspect-preserving letterbox onto a fixed canvas. Every frame of a batch is
// resized independently; the scale and padding are kept so that coordinates
// (ROI rectangles, detections) can be mapped between the two spaces.

use crate::types::Rect;
use image::{Rgb, RgbImage};
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ResizeBackend {
    #[default]
    Cpu,
    Gpu,
}

/// Placement of a scaled source image inside the target canvas.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct LetterboxGeometry {
    pub scale: f64,
    pub new_w: u32,
    pub new_h: u32,
    pub pad_left: i32,
    pub pad_top: i32,
    pub target_w: u32,
    pub target_h: u32,
}

impl LetterboxGeometry {
    pub fn compute(src_w: u32, src_h: u32, target: (u32, u32)) -> Self {
        let (tw, th) = target;
        let scale = (tw as f64 / src_w.max(1) as f64).min(th as f64 / src_h.max(1) as f64);
        let new_w = ((src_w as f64 * scale).round() as u32).clamp(1, tw.max(1));
        let new_h = ((src_h as f64 * scale).round() as u32).clamp(1, th.max(1));
        // Odd leftover goes to the right/bottom border
        let pad_left = ((tw - new_w) / 2) as i32;
        let pad_top = ((th - new_h) / 2) as i32;

        Self {
            scale,
            new_w,
            new_h,
            pad_left,
            pad_top,
            target_w: tw,
            target_h: th,
        }
    }
}

#[derive(Debug, Clone)]
pub struct LetterboxResult {
    pub image: RgbImage,
    pub scale: f64,
    pub pad_left: i32,
    pub pad_top: i32,
}

impl LetterboxResult {
    /// Original-image point -> canvas point.
    pub fn to_letterbox(&self, x: f64, y: f64) -> (f64, f64) {
        (
            x * self.scale + self.pad_left as f64,
            y * self.scale + self.pad_top as f64,
        )
    }

    /// Canvas point -> original-image point.
    pub fn to_original(&self, x: f64, y: f64) -> (f64, f64) {
        if self.scale <= 0.0 {
            return (0.0, 0.0);
        }
        (
            (x - self.pad_left as f64) / self.scale,
            (y - self.pad_top as f64) / self.scale,
        )
    }
}

/// Letterbox a single frame onto a black `target` canvas (width, height).
pub fn letterbox(image: &RgbImage, target: (u32, u32)) -> LetterboxResult {
    let geom = LetterboxGeometry::compute(image.width(), image.height(), target);
    let mut canvas = RgbImage::from_pixel(geom.target_w, geom.target_h, Rgb([0, 0, 0]));

    if image.width() > 0 && image.height() > 0 {
        resize_bilinear_into(image, &mut canvas, &geom);
    }

    LetterboxResult {
        image: canvas,
        scale: geom.scale,
        pad_left: geom.pad_left,
        pad_top: geom.pad_top,
    }
}

/// CPU letterbox of a whole batch, order preserved.
pub fn resize_batch(frames: &[RgbImage], target: (u32, u32)) -> Vec<LetterboxResult> {
    frames.iter().map(|f| letterbox(f, target)).collect()
}

/// Maps an original-image ROI into letterbox space and clips it to the canvas.
pub fn map_region_to_letterbox(region: Rect, geom: &LetterboxGeometry) -> Rect {
    let x = (region.x as f64 * geom.scale) as i32 + geom.pad_left;
    let y = (region.y as f64 * geom.scale) as i32 + geom.pad_top;
    let w = (region.w as f64 * geom.scale) as i32;
    let h = (region.h as f64 * geom.scale) as i32;
    Rect::new(x, y, w, h).clip_to(geom.target_w, geom.target_h)
}

/// Bilinear resample (half-pixel centres) of `src` into the scaled window of `dst`.
fn resize_bilinear_into(src: &RgbImage, dst: &mut RgbImage, geom: &LetterboxGeometry) {
    let src_w = src.width() as usize;
    let src_h = src.height() as usize;
    let x_ratio = src_w as f32 / geom.new_w as f32;
    let y_ratio = src_h as f32 / geom.new_h as f32;
    let src_raw = src.as_raw();

    for dy in 0..geom.new_h {
        let sy = ((dy as f32 + 0.5) * y_ratio - 0.5).max(0.0);
        let sy0 = (sy.floor() as usize).min(src_h - 1);
        let sy1 = (sy0 + 1).min(src_h - 1);
        let fy = sy - sy0 as f32;

        for dx in 0..geom.new_w {
            let sx = ((dx as f32 + 0.5) * x_ratio - 0.5).max(0.0);
            let sx0 = (sx.floor() as usize).min(src_w - 1);
            let sx1 = (sx0 + 1).min(src_w - 1);
            let fx = sx - sx0 as f32;

            let mut px = [0u8; 3];
            for (c, out) in px.iter_mut().enumerate() {
                let p00 = src_raw[(sy0 * src_w + sx0) * 3 + c] as f32;
                let p10 = src_raw[(sy0 * src_w + sx1) * 3 + c] as f32;
                let p01 = src_raw[(sy1 * src_w + sx0) * 3 + c] as f32;
                let p11 = src_raw[(sy1 * src_w + sx1) * 3 + c] as f32;

                let val = p00 * (1.0 - fx) * (1.0 - fy)
                    + p10 * fx * (1.0 - fy)
                    + p01 * (1.0 - fx) * fy
                    + p11 * fx * fy;

                *out = val.round().clamp(0.0, 255.0) as u8;
            }

            dst.put_pixel(
                dx + geom.pad_left as u32,
                dy + geom.pad_top as u32,
                Rgb(px),
            );
        }
    }
}

/// Batch letterboxer that prefers the GPU path when it was requested and
/// could be initialised, falling back to the CPU path otherwise.
pub struct Letterboxer {
    target: (u32, u32),
    #[cfg(feature = "gpu")]
    gpu: Option<crate::gpu::GpuLetterbox>,
}

impl Letterboxer {
    pub fn new(target: (u32, u32), backend: ResizeBackend) -> Self {
        #[cfg(feature = "gpu")]
        {
            let gpu = match backend {
                ResizeBackend::Gpu => match crate::gpu::GpuLetterbox::new() {
                    Ok(g) => {
                        debug!("GPU letterbox ready on {}", g.device_name());
                        Some(g)
                    }
                    Err(e) => {
                        warn!("GPU letterbox unavailable ({}), using CPU path", e);
                        None
                    }
                },
                ResizeBackend::Cpu => None,
            };
            Self { target, gpu }
        }

        #[cfg(not(feature = "gpu"))]
        {
            if backend == ResizeBackend::Gpu {
                warn!("Built without the `gpu` feature, using CPU letterbox");
            } else {
                debug!("CPU letterbox to {}x{}", target.0, target.1);
            }
            Self { target }
        }
    }

    pub fn target(&self) -> (u32, u32) {
        self.target
    }

    pub fn uses_gpu(&self) -> bool {
        #[cfg(feature = "gpu")]
        {
            self.gpu.is_some()
        }
        #[cfg(not(feature = "gpu"))]
        {
            false
        }
    }

    pub fn geometry(&self, src_w: u32, src_h: u32) -> LetterboxGeometry {
        LetterboxGeometry::compute(src_w, src_h, self.target)
    }

    pub fn resize_batch(&self, frames: &[RgbImage]) -> Vec<LetterboxResult> {
        #[cfg(feature = "gpu")]
        if let Some(gpu) = &self.gpu {
            match gpu.letterbox_batch(frames, self.target) {
                Ok(out) => return out,
                Err(e) => warn!("GPU letterbox failed ({}), retrying batch on CPU", e),
            }
        }
        resize_batch(frames, self.target)
    }
}
