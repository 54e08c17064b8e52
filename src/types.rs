// src/types.rs

use crate::encoder::EncoderSettings;
use crate::error::PipelineError;
use crate::line_extractor::LineParams;
use crate::preprocessing::ResizeBackend;
use crate::stability::StabilityConfig;
use crate::visualizer::VisualizationParams;
use serde::{Deserialize, Serialize};
use std::path::PathBuf;

/// Value reported for interval aggregates when no frame was accepted.
pub const NO_DATA: f64 = -1.0;

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub model: ModelConfig,
    pub inference: InferenceConfig,
    pub line: LineParams,
    pub stability: StabilityConfig,
    pub visualization: VisualizationParams,
    pub video: VideoConfig,
    pub encoder: EncoderSettings,
    pub logging: LoggingConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ModelConfig {
    pub path: String,
    /// Square input edge of the segmentation network.
    pub input_size: usize,
    pub num_threads: usize,
    pub use_cuda: bool,
}

impl Default for ModelConfig {
    fn default() -> Self {
        Self {
            path: "models/vessel_seg.onnx".to_string(),
            input_size: 640,
            num_threads: 4,
            use_cuda: true,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct InferenceConfig {
    pub confidence_threshold: f32,
    pub batch_size: usize,
    /// Canvas every frame is letterboxed onto before inference.
    pub target_width: u32,
    pub target_height: u32,
    pub resize_backend: ResizeBackend,
}

impl Default for InferenceConfig {
    fn default() -> Self {
        Self {
            confidence_threshold: 0.4,
            batch_size: 32,
            target_width: 1024,
            target_height: 1024,
            resize_backend: ResizeBackend::Cpu,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DecoderKind {
    Ffmpeg,
    Opencv,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct VideoConfig {
    pub input_dir: String,
    pub output_dir: String,
    pub target_fps: f64,
    pub pixel_size_mm: f64,
    /// `[start_s, end_s]` pairs.
    pub intervals: Vec<[f64; 2]>,
    /// Optional ROI `[x, y, w, h]` in original-frame pixels.
    pub region: Option<[i32; 4]>,
    pub save_video: bool,
    pub draw_overlay: bool,
    pub decoder: DecoderKind,
    /// Bounded decode-ahead queue; 0 decodes on the calling thread.
    pub prefetch_frames: usize,
}

impl Default for VideoConfig {
    fn default() -> Self {
        Self {
            input_dir: "videos".to_string(),
            output_dir: "output".to_string(),
            target_fps: 30.0,
            pixel_size_mm: 0.01,
            intervals: Vec::new(),
            region: None,
            save_video: true,
            draw_overlay: true,
            decoder: DecoderKind::Ffmpeg,
            prefetch_frames: 0,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    pub level: String,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "vessel_caliper=info,ort=warn".to_string(),
        }
    }
}

/// Axis-aligned rectangle `(x, y, w, h)` in pixel coordinates.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Rect {
    pub x: i32,
    pub y: i32,
    pub w: i32,
    pub h: i32,
}

impl Rect {
    pub fn new(x: i32, y: i32, w: i32, h: i32) -> Self {
        Self { x, y, w, h }
    }

    pub fn from_xywh(v: [i32; 4]) -> Self {
        Self::new(v[0], v[1], v[2], v[3])
    }

    pub fn is_empty(&self) -> bool {
        self.w <= 0 || self.h <= 0
    }

    /// Intersection with a `width x height` canvas anchored at the origin.
    pub fn clip_to(&self, width: u32, height: u32) -> Rect {
        let x0 = self.x.clamp(0, width as i32);
        let y0 = self.y.clamp(0, height as i32);
        let x1 = (self.x + self.w.max(0)).clamp(0, width as i32);
        let y1 = (self.y + self.h.max(0)).clamp(0, height as i32);
        Rect::new(x0, y0, x1 - x0, y1 - y0)
    }
}

/// One vertical caliper. `bottom_y >= top_y` always holds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct LineSegment {
    pub x: i32,
    pub top_y: i32,
    pub bottom_y: i32,
}

impl LineSegment {
    pub fn new(x: i32, top_y: i32, bottom_y: i32) -> Self {
        Self {
            x,
            top_y: top_y.min(bottom_y),
            bottom_y: top_y.max(bottom_y),
        }
    }

    pub fn height_px(&self) -> i32 {
        self.bottom_y - self.top_y
    }
}

/// Mean caliper length of one frame in millimetres; `None` without lines.
pub fn mean_length_mm(lines: &[LineSegment], pixel_size_mm: f64) -> Option<f64> {
    if lines.is_empty() {
        return None;
    }
    let total: i64 = lines.iter().map(|l| l.height_px() as i64).sum();
    Some(total as f64 / lines.len() as f64 * pixel_size_mm)
}

/// A contiguous span of source-video time.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Interval {
    pub start_s: f64,
    pub end_s: f64,
}

impl Interval {
    /// Negative starts clamp to zero; reversed or non-finite bounds are rejected.
    pub fn new(start_s: f64, end_s: f64) -> Result<Self, PipelineError> {
        if !start_s.is_finite() || !end_s.is_finite() {
            return Err(PipelineError::invalid(format!(
                "interval bounds must be finite, got ({}, {})",
                start_s, end_s
            )));
        }
        let start_s = start_s.max(0.0);
        if end_s < start_s {
            return Err(PipelineError::invalid(format!(
                "interval end {:.3}s precedes start {:.3}s",
                end_s, start_s
            )));
        }
        Ok(Self { start_s, end_s })
    }

    /// Inclusive source frame range, clamped to the last frame of the video.
    pub fn frame_range(&self, src_fps: f64, total_frames: usize) -> (usize, usize) {
        let last = total_frames.saturating_sub(1);
        let start = ((self.start_s * src_fps).round_ties_even().max(0.0) as usize).min(last);
        let end = ((self.end_s * src_fps).round_ties_even().max(0.0) as usize).min(last);
        (start, end)
    }
}

/// Final aggregate of one processed interval.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct IntervalStat {
    pub start_s: f64,
    pub end_s: f64,
    /// Number of sampled frame indices in the interval.
    pub frame_count: usize,
    pub processed_frames: usize,
    pub accepted_frames: usize,
    pub stopped_early: bool,
    pub mean_of_means_mm: f64,
    pub max_of_means_mm: f64,
    pub max_at_s: Option<f64>,
    pub output_path: Option<PathBuf>,
}

impl IntervalStat {
    pub fn has_data(&self) -> bool {
        self.accepted_frames > 0
    }
}
