// src/segmentation/mod.rs
//
// Contract with the vessel segmentation model. The pipeline only ever needs
// the single most confident instance per frame, so that is all a segmenter
// reports.

#[cfg(feature = "onnx")]
pub mod yolo;

#[cfg(feature = "onnx")]
pub use yolo::YoloSegmenter;

use crate::error::PipelineError;
use anyhow::Result;
use image::RgbImage;

/// Per-pixel mask aligned to the image it was predicted for. Values may be
/// binary (0/1), probabilities (0..1) or 8-bit (0..255).
#[derive(Debug, Clone, PartialEq)]
pub struct Mask {
    pub width: u32,
    pub height: u32,
    pub data: Vec<f32>,
}

impl Mask {
    pub fn new(width: u32, height: u32, data: Vec<f32>) -> Result<Self, PipelineError> {
        if data.len() != (width as usize) * (height as usize) {
            return Err(PipelineError::invalid(format!(
                "mask buffer holds {} values, {}x{} needs {}",
                data.len(),
                width,
                height,
                width as usize * height as usize
            )));
        }
        Ok(Self {
            width,
            height,
            data,
        })
    }

    pub fn from_fn(width: u32, height: u32, f: impl Fn(u32, u32) -> bool) -> Self {
        let mut data = Vec::with_capacity(width as usize * height as usize);
        for y in 0..height {
            for x in 0..width {
                data.push(if f(x, y) { 1.0 } else { 0.0 });
            }
        }
        Self {
            width,
            height,
            data,
        }
    }

    /// Threshold at the midpoint of the value range: 127 for 8-bit masks,
    /// 0.5 for probability/binary masks.
    pub fn binarize(&self) -> BinaryMask {
        let max = self.data.iter().cloned().fold(f32::NEG_INFINITY, f32::max);
        let threshold = if max > 1.0 { 127.0 } else { 0.5 };
        BinaryMask {
            width: self.width,
            height: self.height,
            bits: self.data.iter().map(|&v| v > threshold).collect(),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct BinaryMask {
    pub width: u32,
    pub height: u32,
    pub bits: Vec<bool>,
}

impl BinaryMask {
    #[inline]
    pub fn get(&self, x: u32, y: u32) -> bool {
        self.bits[(y * self.width + x) as usize]
    }

    pub fn is_empty(&self) -> bool {
        !self.bits.iter().any(|&b| b)
    }
}

/// Best detection of one frame.
#[derive(Debug, Clone)]
pub struct SegmentationResult {
    /// `[x1, y1, x2, y2]` in the coordinates of the image passed to `predict`.
    pub bbox: [f32; 4],
    pub confidence: f32,
    pub mask: Option<Mask>,
}

/// One candidate instance before reduction to the frame's best.
#[derive(Debug, Clone)]
pub struct Detection {
    pub bbox: [f32; 4],
    pub confidence: f32,
    pub mask: Option<Mask>,
}

/// Picks the most confident detection; ties keep the earliest.
pub fn extract_max_confidence_segment(detections: Vec<Detection>) -> Option<SegmentationResult> {
    let mut best: Option<Detection> = None;
    for det in detections {
        if !det.confidence.is_finite() {
            continue;
        }
        match &best {
            Some(b) if b.confidence >= det.confidence => {}
            _ => best = Some(det),
        }
    }
    best.map(|d| SegmentationResult {
        bbox: d.bbox,
        confidence: d.confidence,
        mask: d.mask,
    })
}

/// Batched segmentation model.
///
/// Implementations receive equally sized images and must return exactly one
/// entry per image, in submission order; `None` means no detection cleared
/// `conf_threshold`.
pub trait Segmenter {
    fn predict(
        &mut self,
        images: &[RgbImage],
        conf_threshold: f32,
    ) -> Result<Vec<Option<SegmentationResult>>>;
}

impl<T: Segmenter + ?Sized> Segmenter for Box<T> {
    fn predict(
        &mut self,
        images: &[RgbImage],
        conf_threshold: f32,
    ) -> Result<Vec<Option<SegmentationResult>>> {
        (**self).predict(images, conf_threshold)
    }
}
