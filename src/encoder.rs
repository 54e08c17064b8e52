// src/encoder.rs
//
// Streams raw RGB frames into an ffmpeg child process that encodes H.264.
// Writes block when the pipe is full, so a slow encoder throttles the caller.

use crate::error::PipelineError;
use anyhow::{Context, Result};
use image::RgbImage;
use serde::{Deserialize, Serialize};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::process::{Child, ChildStdin, Command, ExitStatus, Stdio};
use tracing::{debug, info, warn};

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct EncoderSettings {
    pub ffmpeg_bin: String,
    pub codec: String,
    /// Pixel format of the encoded stream.
    pub output_pix_fmt: String,
    pub preset: Option<String>,
    pub crf: Option<u32>,
    /// Used only when `crf` is unset.
    pub bitrate_kbps: Option<u32>,
    pub loglevel: String,
    pub extra_args: Vec<String>,
}

impl Default for EncoderSettings {
    fn default() -> Self {
        Self {
            ffmpeg_bin: "ffmpeg".to_string(),
            codec: "libx264".to_string(),
            output_pix_fmt: "yuv420p".to_string(),
            preset: Some("ultrafast".to_string()),
            crf: Some(23),
            bitrate_kbps: None,
            loglevel: "error".to_string(),
            extra_args: Vec::new(),
        }
    }
}

pub struct FfmpegEncoder {
    child: Option<Child>,
    stdin: Option<ChildStdin>,
    width: u32,
    height: u32,
    path: PathBuf,
    frames_written: usize,
}

impl FfmpegEncoder {
    pub fn spawn(
        path: &Path,
        width: u32,
        height: u32,
        fps: f64,
        settings: &EncoderSettings,
    ) -> Result<Self> {
        if width == 0 || height == 0 || !(fps > 0.0) {
            return Err(PipelineError::invalid(format!(
                "encoder needs a positive frame size and rate, got {}x{} @ {}",
                width, height, fps
            ))
            .into());
        }

        let args = build_args(path, width, height, fps, settings);
        debug!("{} {}", settings.ffmpeg_bin, args.join(" "));

        let mut child = Command::new(&settings.ffmpeg_bin)
            .args(&args)
            .stdin(Stdio::piped())
            .stdout(Stdio::null())
            .stderr(Stdio::inherit())
            .spawn()
            .map_err(|e| PipelineError::EncoderSpawn {
                program: settings.ffmpeg_bin.clone(),
                reason: e.to_string(),
            })?;

        let stdin = child.stdin.take().ok_or_else(|| PipelineError::EncoderSpawn {
            program: settings.ffmpeg_bin.clone(),
            reason: "stdin not captured".to_string(),
        })?;

        info!("🎞️  Encoding {}x{} @ {:.2} fps -> {}", width, height, fps, path.display());

        Ok(Self {
            child: Some(child),
            stdin: Some(stdin),
            width,
            height,
            path: path.to_path_buf(),
            frames_written: 0,
        })
    }

    pub fn write_frame(&mut self, frame: &RgbImage) -> Result<()> {
        if frame.dimensions() != (self.width, self.height) {
            return Err(PipelineError::mismatch((self.width, self.height), frame.dimensions()).into());
        }
        let stdin = self
            .stdin
            .as_mut()
            .ok_or_else(|| PipelineError::Encoder("encoder already closed".to_string()))?;
        stdin
            .write_all(frame.as_raw())
            .map_err(|e| PipelineError::Encoder(format!("writing frame {}: {}", self.frames_written, e)))?;
        self.frames_written += 1;
        Ok(())
    }

    pub fn frames_written(&self) -> usize {
        self.frames_written
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Closes the pipe and waits for ffmpeg to finish the file.
    pub fn close(mut self) -> Result<ExitStatus> {
        let status = self.finish()?;
        if !status.success() {
            return Err(PipelineError::Encoder(format!(
                "ffmpeg exited with {} for {}",
                status,
                self.path.display()
            ))
            .into());
        }
        info!(
            "✓ Wrote {} frames to {}",
            self.frames_written,
            self.path.display()
        );
        Ok(status)
    }

    fn finish(&mut self) -> Result<ExitStatus> {
        // EOF on stdin lets ffmpeg flush and write the trailer
        drop(self.stdin.take());
        let mut child = self
            .child
            .take()
            .ok_or_else(|| PipelineError::Encoder("encoder already closed".to_string()))?;
        child.wait().context("waiting for ffmpeg")
    }
}

impl Drop for FfmpegEncoder {
    fn drop(&mut self) {
        if self.child.is_some() {
            match self.finish() {
                Ok(status) if !status.success() => {
                    warn!("ffmpeg exited with {} for {}", status, self.path.display())
                }
                Err(e) => warn!("Failed to finalize {}: {}", self.path.display(), e),
                _ => {}
            }
        }
    }
}

pub(crate) fn build_args(
    path: &Path,
    width: u32,
    height: u32,
    fps: f64,
    settings: &EncoderSettings,
) -> Vec<String> {
    let mut args: Vec<String> = [
        "-y",
        "-f",
        "rawvideo",
        "-pix_fmt",
        "rgb24",
        "-s",
    ]
    .iter()
    .map(|s| s.to_string())
    .collect();
    args.push(format!("{}x{}", width, height));
    args.push("-r".to_string());
    args.push(format!("{}", fps));
    for s in ["-i", "-", "-an", "-vcodec"] {
        args.push(s.to_string());
    }
    args.push(settings.codec.clone());
    args.push("-pix_fmt".to_string());
    args.push(settings.output_pix_fmt.clone());
    args.push("-loglevel".to_string());
    args.push(settings.loglevel.clone());

    if let Some(preset) = &settings.preset {
        args.push("-preset".to_string());
        args.push(preset.clone());
    }
    match (settings.crf, settings.bitrate_kbps) {
        (Some(crf), _) => {
            args.push("-crf".to_string());
            args.push(crf.to_string());
        }
        (None, Some(kbps)) => {
            args.push("-b:v".to_string());
            args.push(format!("{}k", kbps));
        }
        (None, None) => {}
    }
    args.extend(settings.extra_args.iter().cloned());
    args.push(path.to_string_lossy().into_owned());
    args
}

#[cfg(test)]
mod tests {
    use super::*;

    fn has_x264() -> bool {
        Command::new("ffmpeg")
            .args(["-hide_banner", "-encoders"])
            .output()
            .map(|o| String::from_utf8_lossy(&o.stdout).contains("libx264"))
            .unwrap_or(false)
    }

    #[test]
    fn test_args_default() {
        let args = build_args(Path::new("out.mp4"), 640, 480, 15.0, &EncoderSettings::default());
        let joined = args.join(" ");
        assert!(joined.starts_with("-y -f rawvideo -pix_fmt rgb24 -s 640x480 -r 15 -i - -an"));
        assert!(joined.contains("-vcodec libx264 -pix_fmt yuv420p"));
        assert!(joined.contains("-preset ultrafast"));
        assert!(joined.contains("-crf 23"));
        assert_eq!(args.last().map(String::as_str), Some("out.mp4"));
    }

    #[test]
    fn test_args_bitrate_when_no_crf() {
        let settings = EncoderSettings {
            crf: None,
            bitrate_kbps: Some(2500),
            preset: None,
            ..Default::default()
        };
        let joined = build_args(Path::new("o.mp4"), 2, 2, 29.97, &settings).join(" ");
        assert!(joined.contains("-b:v 2500k"));
        assert!(joined.contains("-r 29.97"));
        assert!(!joined.contains("-preset"));
    }

    #[test]
    fn test_missing_binary_is_spawn_error() {
        let settings = EncoderSettings {
            ffmpeg_bin: "definitely-not-ffmpeg-binary".to_string(),
            ..Default::default()
        };
        let err = FfmpegEncoder::spawn(Path::new("x.mp4"), 16, 16, 10.0, &settings)
            .err()
            .unwrap();
        assert!(matches!(
            err.downcast_ref::<PipelineError>(),
            Some(PipelineError::EncoderSpawn { .. })
        ));
    }

    #[test]
    fn test_encode_and_mismatch() {
        if !has_x264() {
            eprintln!("ffmpeg with libx264 not available, skipping");
            return;
        }
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("clip.mp4");
        let mut enc = FfmpegEncoder::spawn(&path, 64, 48, 10.0, &EncoderSettings::default()).unwrap();

        let wrong = RgbImage::new(32, 32);
        let err = enc.write_frame(&wrong).unwrap_err();
        assert!(matches!(
            err.downcast_ref::<PipelineError>(),
            Some(PipelineError::DimensionMismatch { .. })
        ));

        for i in 0..5u8 {
            enc.write_frame(&RgbImage::from_pixel(64, 48, image::Rgb([i * 40, 80, 120])))
                .unwrap();
        }
        assert_eq!(enc.frames_written(), 5);
        assert!(enc.close().unwrap().success());
        assert!(std::fs::metadata(&path).unwrap().len() > 0);
    }
}
