// src/segmentation/yolo.rs
//
// YOLOv8-seg style ONNX model served through ONNX Runtime.
// Output 0: [B, 4 + classes + coeffs, anchors] (cx, cy, w, h, class scores, mask coeffs)
// Output 1: [B, coeffs, proto_h, proto_w] mask prototypes

use super::{Mask, SegmentationResult, Segmenter};
use crate::error::PipelineError;
use crate::preprocessing::{letterbox, LetterboxGeometry};
use anyhow::{Context, Result};
use image::RgbImage;
use ndarray::{Array1, ArrayView2};
use ort::{
    execution_providers::CUDAExecutionProvider,
    session::{builder::GraphOptimizationLevel, Session},
};
use tracing::{debug, info};

pub struct YoloSegmenter {
    session: Session,
    input_size: usize,
}

struct BestAnchor {
    index: usize,
    confidence: f32,
}

impl YoloSegmenter {
    pub fn new(model_path: &str, input_size: usize, num_threads: usize, use_cuda: bool) -> Result<Self> {
        info!("Loading segmentation model: {}", model_path);

        let mut builder = Session::builder()?;
        if use_cuda {
            info!("Enabling CUDA execution provider");
            builder = builder
                .with_execution_providers([CUDAExecutionProvider::default().with_device_id(0).build()])?;
        }

        let session = builder
            .with_optimization_level(GraphOptimizationLevel::Level3)?
            .with_intra_threads(num_threads)?
            .commit_from_file(model_path)
            .context("Failed to load segmentation model")?;

        info!("✓ Segmentation model ready ({}x{} input)", input_size, input_size);
        Ok(Self {
            session,
            input_size,
        })
    }

    /// HWC u8 -> normalised CHW f32, one plane set per image.
    fn build_input(&self, images: &[RgbImage]) -> (Vec<f32>, LetterboxGeometry) {
        let s = self.input_size;
        let geom = LetterboxGeometry::compute(images[0].width(), images[0].height(), (s as u32, s as u32));
        let mut input = vec![0.0f32; images.len() * 3 * s * s];

        for (b, img) in images.iter().enumerate() {
            let boxed = letterbox(img, (s as u32, s as u32));
            let raw = boxed.image.as_raw();
            let base = b * 3 * s * s;
            for c in 0..3 {
                for h in 0..s {
                    for w in 0..s {
                        let hwc_idx = (h * s + w) * 3 + c;
                        let chw_idx = base + c * s * s + h * s + w;
                        input[chw_idx] = raw[hwc_idx] as f32 / 255.0;
                    }
                }
            }
        }

        (input, geom)
    }
}

impl Segmenter for YoloSegmenter {
    fn predict(
        &mut self,
        images: &[RgbImage],
        conf_threshold: f32,
    ) -> Result<Vec<Option<SegmentationResult>>> {
        if images.is_empty() {
            return Ok(Vec::new());
        }
        let (img_w, img_h) = images[0].dimensions();
        if let Some(bad) = images.iter().find(|i| i.dimensions() != (img_w, img_h)) {
            return Err(PipelineError::mismatch((img_w, img_h), bad.dimensions()).into());
        }

        let (input, geom) = self.build_input(images);
        let s = self.input_size;
        let shape = [images.len(), 3, s, s];
        let input_value =
            ort::value::Value::from_array((shape.as_slice(), input.into_boxed_slice()))?;

        let input_name = self.session.inputs[0].name.clone();
        let outputs = self.session.run(ort::inputs![input_name => input_value])?;

        let (det_shape, det_data) = outputs[0].try_extract_tensor::<f32>()?;
        let det_dims: Vec<usize> = det_shape.iter().map(|&d| d as usize).collect();
        let det = det_data.to_vec();

        let (proto_shape, proto_data) = outputs[1].try_extract_tensor::<f32>()?;
        let proto_dims: Vec<usize> = proto_shape.iter().map(|&d| d as usize).collect();
        let protos = proto_data.to_vec();

        debug!("Detection head {:?}, prototypes {:?}", det_dims, proto_dims);

        if det_dims.len() != 3 || proto_dims.len() != 4 {
            return Err(PipelineError::Segmentation(format!(
                "unexpected output ranks {:?} / {:?}",
                det_dims, proto_dims
            ))
            .into());
        }

        let (channels, anchors) = (det_dims[1], det_dims[2]);
        let (num_coeffs, proto_h, proto_w) = (proto_dims[1], proto_dims[2], proto_dims[3]);
        if channels < 4 + num_coeffs + 1 {
            return Err(PipelineError::Segmentation(format!(
                "{} head channels cannot hold box, classes and {} coefficients",
                channels, num_coeffs
            ))
            .into());
        }
        let num_classes = channels - 4 - num_coeffs;

        let mut results = Vec::with_capacity(images.len());
        for b in 0..images.len() {
            let head = &det[b * channels * anchors..(b + 1) * channels * anchors];
            let at = |c: usize, i: usize| head[c * anchors + i];

            let Some(best) = best_anchor(head, anchors, num_classes, conf_threshold) else {
                results.push(None);
                continue;
            };

            let (cx, cy, w, h) = (
                at(0, best.index),
                at(1, best.index),
                at(2, best.index),
                at(3, best.index),
            );
            let to_image = |v: f32, pad: i32| (v - pad as f32) / geom.scale as f32;
            let bbox = [
                to_image(cx - w / 2.0, geom.pad_left).clamp(0.0, img_w as f32),
                to_image(cy - h / 2.0, geom.pad_top).clamp(0.0, img_h as f32),
                to_image(cx + w / 2.0, geom.pad_left).clamp(0.0, img_w as f32),
                to_image(cy + h / 2.0, geom.pad_top).clamp(0.0, img_h as f32),
            ];

            let coeffs = Array1::from_iter(
                (0..num_coeffs).map(|k| at(4 + num_classes + k, best.index)),
            );
            let plane = proto_h * proto_w;
            let proto_view = ArrayView2::from_shape(
                (num_coeffs, plane),
                &protos[b * num_coeffs * plane..(b + 1) * num_coeffs * plane],
            )?;
            let logits = coeffs.dot(&proto_view);

            let mask = assemble_mask(
                logits.as_slice().unwrap_or(&[]),
                (proto_w, proto_h),
                s,
                &geom,
                (img_w, img_h),
                bbox,
            );

            results.push(Some(SegmentationResult {
                bbox,
                confidence: best.confidence,
                mask: Some(mask),
            }));
        }

        Ok(results)
    }
}

/// Anchor with the highest class score above `conf_threshold`.
fn best_anchor(head: &[f32], anchors: usize, num_classes: usize, conf_threshold: f32) -> Option<BestAnchor> {
    let mut best: Option<BestAnchor> = None;
    for i in 0..anchors {
        let mut conf = 0.0f32;
        for c in 0..num_classes {
            conf = conf.max(head[(4 + c) * anchors + i]);
        }
        if conf < conf_threshold {
            continue;
        }
        if best.as_ref().map_or(true, |b| conf > b.confidence) {
            best = Some(BestAnchor {
                index: i,
                confidence: conf,
            });
        }
    }
    best
}

/// Samples prototype logits at image resolution, squashes them and zeroes
/// everything outside the detection box.
fn assemble_mask(
    logits: &[f32],
    proto_size: (usize, usize),
    input_size: usize,
    geom: &LetterboxGeometry,
    image_size: (u32, u32),
    bbox: [f32; 4],
) -> Mask {
    let (pw, ph) = proto_size;
    let (iw, ih) = image_size;
    let to_proto_x = pw as f32 / input_size as f32;
    let to_proto_y = ph as f32 / input_size as f32;

    Mask::from_fn(iw, ih, |x, y| {
        let (fx, fy) = (x as f32 + 0.5, y as f32 + 0.5);
        if fx < bbox[0] || fx > bbox[2] || fy < bbox[1] || fy > bbox[3] || logits.is_empty() {
            return false;
        }
        let mx = fx * geom.scale as f32 + geom.pad_left as f32;
        let my = fy * geom.scale as f32 + geom.pad_top as f32;
        let px = (mx * to_proto_x - 0.5).clamp(0.0, (pw - 1) as f32);
        let py = (my * to_proto_y - 0.5).clamp(0.0, (ph - 1) as f32);

        let x0 = px.floor() as usize;
        let y0 = py.floor() as usize;
        let x1 = (x0 + 1).min(pw - 1);
        let y1 = (y0 + 1).min(ph - 1);
        let ax = px - x0 as f32;
        let ay = py - y0 as f32;
        let v = logits[y0 * pw + x0] * (1.0 - ax) * (1.0 - ay)
            + logits[y0 * pw + x1] * ax * (1.0 - ay)
            + logits[y1 * pw + x0] * (1.0 - ax) * ay
            + logits[y1 * pw + x1] * ax * ay;

        // sigmoid(v) > 0.5
        v > 0.0
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_best_anchor_respects_threshold() {
        // 3 anchors, 2 classes, no coefficients: rows are cx, cy, w, h, c0, c1
        let anchors = 3;
        let head = vec![
            0.0, 0.0, 0.0, //
            0.0, 0.0, 0.0, //
            0.0, 0.0, 0.0, //
            0.0, 0.0, 0.0, //
            0.1, 0.7, 0.2, //
            0.3, 0.2, 0.8, //
        ];
        let best = best_anchor(&head, anchors, 2, 0.5).unwrap();
        assert_eq!(best.index, 2);
        assert!((best.confidence - 0.8).abs() < 1e-6);
        assert!(best_anchor(&head, anchors, 2, 0.9).is_none());
    }

    #[test]
    fn test_mask_cropped_to_box() {
        let geom = LetterboxGeometry::compute(8, 8, (8, 8));
        let logits = vec![1.0f32; 4 * 4];
        let mask = assemble_mask(&logits, (4, 4), 8, &geom, (8, 8), [2.0, 2.0, 6.0, 6.0]);
        let bin = mask.binarize();
        assert!(bin.get(3, 3));
        assert!(!bin.get(0, 0));
        assert!(!bin.get(7, 3));
    }
}
