// src/video/opencv.rs

use super::{FrameSource, VideoProperties};
use crate::error::PipelineError;
use anyhow::Result;
use image::RgbImage;
use opencv::{
    core::Mat,
    imgproc,
    prelude::*,
    videoio::{self, VideoCapture, VideoCaptureTrait, VideoCaptureTraitConst},
};
use std::path::Path;
use tracing::info;

pub struct OpenCvSource {
    cap: VideoCapture,
    props: VideoProperties,
}

impl OpenCvSource {
    pub fn open(path: &Path) -> Result<Self> {
        info!("Opening video (OpenCV): {}", path.display());
        let open_err = |reason: &str| PipelineError::SourceOpen {
            path: path.display().to_string(),
            reason: reason.to_string(),
        };

        let path_str = path.to_str().ok_or_else(|| open_err("path is not valid UTF-8"))?;
        let cap = VideoCapture::from_file(path_str, videoio::CAP_ANY)?;
        if !cap.is_opened()? {
            return Err(open_err("VideoCapture could not open the file").into());
        }

        let fps = VideoCaptureTraitConst::get(&cap, videoio::CAP_PROP_FPS)?;
        let total_frames = VideoCaptureTraitConst::get(&cap, videoio::CAP_PROP_FRAME_COUNT)?;
        let width = VideoCaptureTraitConst::get(&cap, videoio::CAP_PROP_FRAME_WIDTH)?;
        let height = VideoCaptureTraitConst::get(&cap, videoio::CAP_PROP_FRAME_HEIGHT)?;

        let props = VideoProperties {
            width: width.max(0.0) as u32,
            height: height.max(0.0) as u32,
            fps,
            total_frames: total_frames.max(0.0) as usize,
        };
        info!(
            "Video properties: {}x{} @ {:.2} FPS, {} frames",
            props.width, props.height, props.fps, props.total_frames
        );

        Ok(Self { cap, props })
    }
}

impl FrameSource for OpenCvSource {
    fn properties(&self) -> VideoProperties {
        self.props
    }

    fn seek(&mut self, index: usize) -> Result<()> {
        VideoCaptureTrait::set(&mut self.cap, videoio::CAP_PROP_POS_FRAMES, index as f64)?;
        Ok(())
    }

    fn read_frame(&mut self) -> Result<Option<RgbImage>> {
        let mut mat = Mat::default();
        if !VideoCaptureTrait::read(&mut self.cap, &mut mat)? || mat.empty() {
            return Ok(None);
        }

        let mut rgb_mat = Mat::default();
        imgproc::cvt_color(&mat, &mut rgb_mat, imgproc::COLOR_BGR2RGB, 0)?;

        let (w, h) = (rgb_mat.cols() as u32, rgb_mat.rows() as u32);
        let data = rgb_mat.data_bytes()?.to_vec();
        let frame = RgbImage::from_raw(w, h, data)
            .ok_or_else(|| PipelineError::mismatch((self.props.width, self.props.height), (w, h)))?;
        Ok(Some(frame))
    }
}
