// src/video/mod.rs
//
// Frame sources. Every source yields packed RGB frames in presentation order
// and can be repositioned to an absolute frame index before reading.

pub mod ffmpeg;
#[cfg(feature = "opencv")]
pub mod opencv;
pub mod prefetch;

pub use ffmpeg::FfmpegSource;
#[cfg(feature = "opencv")]
pub use self::opencv::OpenCvSource;
pub use prefetch::read_frames;

use crate::error::PipelineError;
use crate::types::DecoderKind;
use anyhow::Result;
use image::RgbImage;
use std::path::{Path, PathBuf};
use tracing::info;
use walkdir::WalkDir;

const VIDEO_EXTENSIONS: [&str; 4] = ["mp4", "avi", "mov", "mkv"];

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct VideoProperties {
    pub width: u32,
    pub height: u32,
    pub fps: f64,
    pub total_frames: usize,
}

pub trait FrameSource: Send {
    fn properties(&self) -> VideoProperties;

    /// Positions the source so the next `read_frame` returns frame `index`.
    fn seek(&mut self, index: usize) -> Result<()>;

    /// Next frame, or `None` at end of stream.
    fn read_frame(&mut self) -> Result<Option<RgbImage>>;
}

impl<T: FrameSource + ?Sized> FrameSource for Box<T> {
    fn properties(&self) -> VideoProperties {
        (**self).properties()
    }

    fn seek(&mut self, index: usize) -> Result<()> {
        (**self).seek(index)
    }

    fn read_frame(&mut self) -> Result<Option<RgbImage>> {
        (**self).read_frame()
    }
}

/// Opens `path` with the requested decoder backend.
pub fn open_source(path: &Path, decoder: DecoderKind, ffmpeg_bin: &str) -> Result<Box<dyn FrameSource>> {
    match decoder {
        DecoderKind::Ffmpeg => Ok(Box::new(FfmpegSource::open(path, ffmpeg_bin)?)),
        #[cfg(feature = "opencv")]
        DecoderKind::Opencv => Ok(Box::new(OpenCvSource::open(path)?)),
        #[cfg(not(feature = "opencv"))]
        DecoderKind::Opencv => Err(PipelineError::SourceOpen {
            path: path.display().to_string(),
            reason: "built without the `opencv` feature".to_string(),
        }
        .into()),
    }
}

/// Video files below `dir`, sorted by path.
pub fn find_video_files(dir: &Path) -> Vec<PathBuf> {
    let mut videos: Vec<PathBuf> = WalkDir::new(dir)
        .follow_links(true)
        .into_iter()
        .filter_map(|e| e.ok())
        .map(|e| e.into_path())
        .filter(|p| {
            p.extension()
                .and_then(|e| e.to_str())
                .map(|e| VIDEO_EXTENSIONS.contains(&e.to_ascii_lowercase().as_str()))
                .unwrap_or(false)
        })
        .collect();
    videos.sort();

    info!("Found {} video files in {}", videos.len(), dir.display());
    videos
}

/// Frames already held in memory, e.g. decoded elsewhere.
pub struct MemorySource {
    frames: Vec<RgbImage>,
    fps: f64,
    pos: usize,
}

impl MemorySource {
    pub fn new(frames: Vec<RgbImage>, fps: f64) -> Result<Self, PipelineError> {
        if let Some(first) = frames.first() {
            let dims = first.dimensions();
            if let Some(bad) = frames.iter().find(|f| f.dimensions() != dims) {
                return Err(PipelineError::mismatch(dims, bad.dimensions()));
            }
        }
        Ok(Self { frames, fps, pos: 0 })
    }
}

impl FrameSource for MemorySource {
    fn properties(&self) -> VideoProperties {
        let (width, height) = self.frames.first().map(|f| f.dimensions()).unwrap_or((0, 0));
        VideoProperties {
            width,
            height,
            fps: self.fps,
            total_frames: self.frames.len(),
        }
    }

    fn seek(&mut self, index: usize) -> Result<()> {
        self.pos = index.min(self.frames.len());
        Ok(())
    }

    fn read_frame(&mut self) -> Result<Option<RgbImage>> {
        let frame = self.frames.get(self.pos).cloned();
        if frame.is_some() {
            self.pos += 1;
        }
        Ok(frame)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use image::Rgb;

    #[test]
    fn test_memory_source_seek_and_read() {
        let frames: Vec<RgbImage> = (0..4u8).map(|i| RgbImage::from_pixel(4, 4, Rgb([i, 0, 0]))).collect();
        let mut src = MemorySource::new(frames, 25.0).unwrap();
        assert_eq!(src.properties().total_frames, 4);
        src.seek(2).unwrap();
        assert_eq!(src.read_frame().unwrap().unwrap().get_pixel(0, 0).0[0], 2);
        assert_eq!(src.read_frame().unwrap().unwrap().get_pixel(0, 0).0[0], 3);
        assert!(src.read_frame().unwrap().is_none());
    }

    #[test]
    fn test_memory_source_rejects_mixed_sizes() {
        let frames = vec![RgbImage::new(4, 4), RgbImage::new(8, 4)];
        assert!(MemorySource::new(frames, 25.0).is_err());
    }

    #[test]
    fn test_find_video_files_filters_extensions() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::create_dir(dir.path().join("nested")).unwrap();
        for name in ["a.mp4", "b.MOV", "notes.txt", "nested/c.mkv"] {
            std::fs::write(dir.path().join(name), b"").unwrap();
        }
        let found = find_video_files(dir.path());
        let names: Vec<String> = found
            .iter()
            .map(|p| p.file_name().unwrap().to_string_lossy().into_owned())
            .collect();
        assert_eq!(found.len(), 3);
        assert!(names.contains(&"b.MOV".to_string()));
        assert!(!names.contains(&"notes.txt".to_string()));
    }
}
