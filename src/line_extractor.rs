// src/line_extractor.rs
//
// Turns a vessel mask into vertical calipers: one line per sampled column,
// from the first to the last mask row, with both ends snapped to the
// strongest horizontal edge of the contrast-enhanced frame.

use crate::contrast::{sobel_y_abs, to_gray, Clahe};
use crate::error::PipelineError;
use crate::segmentation::Mask;
use crate::types::{LineSegment, Rect};
use anyhow::Result;
use image::{imageops, RgbImage};
use serde::{Deserialize, Serialize};
use tracing::debug;

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LineParams {
    /// Column stride between calipers, in pixels.
    pub sample_interval: usize,
    /// Rows searched below the rough top edge.
    pub gradient_search_top: usize,
    /// Rows searched above the rough bottom edge.
    pub gradient_search_bottom: usize,
    /// Central fraction of the width to sample. Ignored when a region is given.
    pub keep_ratio: Option<f64>,
    pub smoothing: Option<SmoothingParams>,
    pub clahe_clip_limit: f32,
    pub clahe_grid: usize,
}

impl Default for LineParams {
    fn default() -> Self {
        Self {
            sample_interval: 5,
            gradient_search_top: 20,
            gradient_search_bottom: 20,
            keep_ratio: Some(0.25),
            smoothing: Some(SmoothingParams::default()),
            clahe_clip_limit: 4.0,
            clahe_grid: 16,
        }
    }
}

impl LineParams {
    pub fn validate(&self) -> Result<(), PipelineError> {
        if self.sample_interval == 0 {
            return Err(PipelineError::invalid("line.sample_interval must be > 0"));
        }
        if let Some(k) = self.keep_ratio {
            if !(k > 0.0 && k <= 1.0) {
                return Err(PipelineError::invalid(format!(
                    "line.keep_ratio must lie in (0, 1], got {}",
                    k
                )));
            }
        }
        if let Some(s) = &self.smoothing {
            if !(s.threshold >= 0.0) {
                return Err(PipelineError::invalid("line.smoothing.threshold must be >= 0"));
            }
        }
        if self.clahe_grid == 0 {
            return Err(PipelineError::invalid("line.clahe_grid must be > 0"));
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
#[serde(default)]
pub struct SmoothingParams {
    pub window_size: usize,
    /// Maximum relative deviation from the local moving average.
    pub threshold: f64,
}

impl Default for SmoothingParams {
    fn default() -> Self {
        Self {
            window_size: 5,
            threshold: 0.1,
        }
    }
}

pub struct LineExtractor;

impl LineExtractor {
    /// Calipers for one frame, ascending by x, in full-frame coordinates.
    pub fn extract(
        image: &RgbImage,
        mask: &Mask,
        params: &LineParams,
        region: Option<Rect>,
    ) -> Result<Vec<LineSegment>> {
        params.validate()?;

        let (w, h) = image.dimensions();
        if (mask.width, mask.height) != (w, h) {
            return Err(PipelineError::mismatch((w, h), (mask.width, mask.height)).into());
        }

        let roi = match region {
            Some(r) => r.clip_to(w, h),
            None => Rect::new(0, 0, w as i32, h as i32),
        };
        if roi.is_empty() {
            return Ok(Vec::new());
        }
        let (ox, oy) = (roi.x as u32, roi.y as u32);
        let (cw, ch) = (roi.w as usize, roi.h as usize);

        let binary = mask.binarize();
        if binary.is_empty() {
            return Ok(Vec::new());
        }

        let crop = imageops::crop_imm(image, ox, oy, cw as u32, ch as u32).to_image();
        let clahe = Clahe::new(params.clahe_clip_limit, (params.clahe_grid, params.clahe_grid));
        let enhanced = clahe.apply(&to_gray(&crop));
        let grad = sobel_y_abs(&enhanced);

        let (x_start, x_end) = match (region, params.keep_ratio) {
            (None, Some(keep)) => {
                let border = ((1.0 - keep) / 2.0 * cw as f64) as usize;
                (border, cw.saturating_sub(border))
            }
            _ => (0, cw),
        };

        let mut lines = Vec::new();
        for x in (x_start..x_end).step_by(params.sample_interval) {
            let in_mask = |y: usize| binary.get(ox + x as u32, oy + y as u32);
            let Some(rough_top) = (0..ch).find(|&y| in_mask(y)) else {
                continue;
            };
            let rough_bottom = (0..ch).rev().find(|&y| in_mask(y)).unwrap_or(rough_top);

            let column = |y: usize| grad[y * cw + x];
            let top = strongest_edge(rough_top, params.gradient_search_top, ch, true, &column);
            let bottom =
                strongest_edge(rough_bottom, params.gradient_search_bottom, ch, false, &column);

            lines.push(LineSegment::new(
                x as i32 + roi.x,
                top as i32 + roi.y,
                bottom as i32 + roi.y,
            ));
        }

        let raw_count = lines.len();
        if let Some(smoothing) = &params.smoothing {
            lines = filter_with_smoothing(lines, smoothing.window_size, smoothing.threshold);
        }
        debug!("Extracted {} lines ({} before smoothing)", lines.len(), raw_count);

        Ok(lines)
    }
}

/// Row with the largest gradient among `start` and the next `search - 1` rows
/// in the given direction, clamped to `[0, rows)`. The first maximum wins.
fn strongest_edge(
    start: usize,
    search: usize,
    rows: usize,
    downward: bool,
    column: &impl Fn(usize) -> f32,
) -> usize {
    let mut best_row = start;
    let mut best_val = f32::NEG_INFINITY;
    for off in 0..search.max(1) {
        let row = if downward {
            (start + off).min(rows - 1)
        } else {
            start.saturating_sub(off)
        };
        let v = column(row);
        if v > best_val {
            best_val = v;
            best_row = row;
        }
    }
    best_row
}

/// Drops lines whose height deviates from the local moving average by more
/// than `threshold` (relative). Edges reuse the first/last full-window mean.
pub fn filter_with_smoothing(
    lines: Vec<LineSegment>,
    window_size: usize,
    threshold: f64,
) -> Vec<LineSegment> {
    let n = lines.len();
    if window_size <= 1 || n <= window_size {
        return lines;
    }

    let heights: Vec<f64> = lines.iter().map(|l| l.height_px() as f64).collect();
    let full: Vec<f64> = heights
        .windows(window_size)
        .map(|win| win.iter().sum::<f64>() / window_size as f64)
        .collect();

    let pad_left = window_size / 2;
    let first = full[0];
    let last = full[full.len() - 1];
    let moving_avg = std::iter::repeat(first)
        .take(pad_left)
        .chain(full.iter().copied())
        .chain(std::iter::repeat(last))
        .take(n);

    lines
        .into_iter()
        .zip(heights)
        .zip(moving_avg)
        .filter(|((_, h), ma)| (h - ma).abs() / ma.max(1e-6) <= threshold)
        .map(|((line, _), _)| line)
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use image::Rgb;

    /// White band over rows `top..=bottom`, columns `left..right`, on black.
    fn band(w: u32, h: u32, left: u32, right: u32, top: u32, bottom: u32) -> (RgbImage, Mask) {
        let inside = move |x: u32, y: u32| x >= left && x < right && y >= top && y <= bottom;
        let image = RgbImage::from_fn(w, h, |x, y| {
            if inside(x, y) {
                Rgb([255, 255, 255])
            } else {
                Rgb([0, 0, 0])
            }
        });
        (image, Mask::from_fn(w, h, inside))
    }

    fn heights(values: &[i32]) -> Vec<LineSegment> {
        values
            .iter()
            .enumerate()
            .map(|(i, &h)| LineSegment::new(i as i32 * 5, 0, h))
            .collect()
    }

    #[test]
    fn test_band_height_is_exact() {
        let (image, mask) = band(64, 64, 8, 56, 20, 44);
        let params = LineParams {
            keep_ratio: None,
            smoothing: None,
            ..Default::default()
        };
        let lines = LineExtractor::extract(&image, &mask, &params, None).unwrap();
        assert!(!lines.is_empty());
        for l in &lines {
            assert!(l.x >= 8 && l.x < 56);
            assert_eq!((l.top_y, l.bottom_y), (20, 44), "column {}", l.x);
        }
        assert!(lines.windows(2).all(|p| p[0].x < p[1].x));
    }

    #[test]
    fn test_keep_ratio_limits_columns() {
        let (image, mask) = band(64, 64, 0, 64, 20, 44);
        let params = LineParams {
            keep_ratio: Some(0.5),
            sample_interval: 4,
            smoothing: None,
            ..Default::default()
        };
        let lines = LineExtractor::extract(&image, &mask, &params, None).unwrap();
        let xs: Vec<i32> = lines.iter().map(|l| l.x).collect();
        assert_eq!(xs, vec![16, 20, 24, 28, 32, 36, 40, 44]);
    }

    #[test]
    fn test_region_offsets_and_disables_keep_ratio() {
        let (image, mask) = band(64, 64, 8, 56, 20, 44);
        let params = LineParams {
            keep_ratio: Some(0.25),
            smoothing: None,
            ..Default::default()
        };
        let region = Rect::new(10, 10, 40, 40);
        let lines = LineExtractor::extract(&image, &mask, &params, Some(region)).unwrap();
        let xs: Vec<i32> = lines.iter().map(|l| l.x).collect();
        assert_eq!(xs, vec![10, 15, 20, 25, 30, 35, 40, 45]);
        assert!(lines.iter().all(|l| l.height_px() == 24));
    }

    #[test]
    fn test_empty_mask_gives_no_lines() {
        let image = RgbImage::new(32, 32);
        let mask = Mask::from_fn(32, 32, |_, _| false);
        let lines = LineExtractor::extract(&image, &mask, &LineParams::default(), None).unwrap();
        assert!(lines.is_empty());
    }

    #[test]
    fn test_mismatched_mask_is_error() {
        let image = RgbImage::new(32, 32);
        let mask = Mask::from_fn(16, 32, |_, _| true);
        let err = LineExtractor::extract(&image, &mask, &LineParams::default(), None).unwrap_err();
        assert!(matches!(
            err.downcast_ref::<PipelineError>(),
            Some(PipelineError::DimensionMismatch { .. })
        ));
    }

    #[test]
    fn test_zero_sample_interval_rejected() {
        let image = RgbImage::new(8, 8);
        let mask = Mask::from_fn(8, 8, |_, _| true);
        let params = LineParams {
            sample_interval: 0,
            ..Default::default()
        };
        assert!(LineExtractor::extract(&image, &mask, &params, None).is_err());
    }

    #[test]
    fn test_smoothing_drops_spike() {
        let mut h = vec![10; 12];
        h[4] = 15;
        let kept = filter_with_smoothing(heights(&h), 5, 0.1);
        assert_eq!(kept.len(), 11);
        assert!(kept.iter().all(|l| l.height_px() == 10));
    }

    #[test]
    fn test_smoothing_keeps_spike_below_threshold() {
        let mut h = vec![10; 12];
        h[4] = 15;
        assert_eq!(filter_with_smoothing(heights(&h), 5, 0.5).len(), 12);
    }

    #[test]
    fn test_smoothing_short_input_untouched() {
        let h = [10, 40, 10, 10, 10];
        assert_eq!(filter_with_smoothing(heights(&h), 5, 0.1).len(), 5);
        assert_eq!(filter_with_smoothing(heights(&[10, 40, 10, 10, 10, 10]), 1, 0.1).len(), 6);
    }
}
