// src/video/ffmpeg.rs
//
// Decodes through an ffmpeg child process writing rawvideo rgb24 to stdout.
// Stream metadata comes from ffprobe's JSON output.

use super::{FrameSource, VideoProperties};
use crate::error::PipelineError;
use anyhow::{Context, Result};
use image::RgbImage;
use serde::Deserialize;
use std::io::{ErrorKind, Read};
use std::path::{Path, PathBuf};
use std::process::{Child, ChildStdout, Command, Stdio};
use tracing::{debug, info};

#[derive(Debug, Deserialize)]
struct ProbeOutput {
    #[serde(default)]
    streams: Vec<ProbeStream>,
    format: Option<ProbeFormat>,
}

#[derive(Debug, Deserialize)]
struct ProbeStream {
    width: Option<u32>,
    height: Option<u32>,
    r_frame_rate: Option<String>,
    avg_frame_rate: Option<String>,
    nb_frames: Option<String>,
    duration: Option<String>,
    tags: Option<ProbeTags>,
    #[serde(default)]
    side_data_list: Vec<ProbeSideData>,
}

#[derive(Debug, Deserialize)]
struct ProbeTags {
    rotate: Option<String>,
}

#[derive(Debug, Deserialize)]
struct ProbeSideData {
    rotation: Option<f64>,
}

impl ProbeStream {
    /// Display rotation in degrees, from the display matrix or the legacy tag.
    fn rotation(&self) -> f64 {
        self.side_data_list
            .iter()
            .find_map(|d| d.rotation)
            .or_else(|| {
                self.tags
                    .as_ref()
                    .and_then(|t| t.rotate.as_deref())
                    .and_then(|r| r.trim().parse().ok())
            })
            .unwrap_or(0.0)
    }
}

#[derive(Debug, Deserialize)]
struct ProbeFormat {
    duration: Option<String>,
}

pub struct FfmpegSource {
    path: PathBuf,
    ffmpeg_bin: String,
    props: VideoProperties,
    child: Option<Child>,
    stdout: Option<ChildStdout>,
    buffer: Vec<u8>,
}

impl FfmpegSource {
    pub fn open(path: &Path, ffmpeg_bin: &str) -> Result<Self> {
        info!("Opening video: {}", path.display());
        let open_err = |reason: String| PipelineError::SourceOpen {
            path: path.display().to_string(),
            reason,
        };

        if !path.is_file() {
            return Err(open_err("no such file".to_string()).into());
        }

        let output = Command::new(ffprobe_for(ffmpeg_bin))
            .args([
                "-v",
                "error",
                "-select_streams",
                "v:0",
                "-show_entries",
                "stream=width,height,r_frame_rate,avg_frame_rate,nb_frames,duration\
                 :stream_tags=rotate:stream_side_data=rotation:format=duration",
                "-of",
                "json",
            ])
            .arg(path)
            .output()
            .map_err(|e| open_err(format!("ffprobe: {}", e)))?;

        if !output.status.success() {
            return Err(open_err(String::from_utf8_lossy(&output.stderr).trim().to_string()).into());
        }

        let props = parse_probe(&String::from_utf8_lossy(&output.stdout))
            .map_err(|e| open_err(e.to_string()))?;

        info!(
            "Video properties: {}x{} @ {:.2} FPS, {} frames",
            props.width, props.height, props.fps, props.total_frames
        );

        Ok(Self {
            path: path.to_path_buf(),
            ffmpeg_bin: ffmpeg_bin.to_string(),
            buffer: vec![0u8; props.width as usize * props.height as usize * 3],
            props,
            child: None,
            stdout: None,
        })
    }

    fn start_at(&mut self, index: usize) -> Result<()> {
        self.stop();

        let seconds = if self.props.fps > 0.0 {
            index as f64 / self.props.fps
        } else {
            0.0
        };
        debug!("Starting decoder at frame {} ({:.3}s)", index, seconds);

        let mut child = Command::new(&self.ffmpeg_bin)
            .args(["-v", "error", "-ss"])
            .arg(format!("{:.6}", seconds))
            .arg("-i")
            .arg(&self.path)
            .args(["-an", "-sn", "-f", "rawvideo", "-pix_fmt", "rgb24", "-"])
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::null())
            .spawn()
            .with_context(|| format!("spawning {} for {}", self.ffmpeg_bin, self.path.display()))?;

        self.stdout = child.stdout.take();
        self.child = Some(child);
        Ok(())
    }

    fn stop(&mut self) {
        self.stdout = None;
        if let Some(mut child) = self.child.take() {
            let _ = child.kill();
            let _ = child.wait();
        }
    }
}

impl FrameSource for FfmpegSource {
    fn properties(&self) -> VideoProperties {
        self.props
    }

    fn seek(&mut self, index: usize) -> Result<()> {
        self.start_at(index)
    }

    fn read_frame(&mut self) -> Result<Option<RgbImage>> {
        if self.stdout.is_none() {
            self.start_at(0)?;
        }
        let Some(stdout) = self.stdout.as_mut() else {
            return Ok(None);
        };

        match stdout.read_exact(&mut self.buffer) {
            Ok(()) => {}
            Err(e) if e.kind() == ErrorKind::UnexpectedEof => return Ok(None),
            Err(e) => return Err(e).context("reading decoded frame"),
        }

        let frame = RgbImage::from_raw(self.props.width, self.props.height, self.buffer.clone())
            .ok_or_else(|| PipelineError::mismatch((self.props.width, self.props.height), (0, 0)))?;
        Ok(Some(frame))
    }
}

impl Drop for FfmpegSource {
    fn drop(&mut self) {
        self.stop();
    }
}

/// `ffprobe` living next to the configured `ffmpeg`.
fn ffprobe_for(ffmpeg_bin: &str) -> String {
    match ffmpeg_bin.strip_suffix("ffmpeg") {
        Some(prefix) => format!("{}ffprobe", prefix),
        None => "ffprobe".to_string(),
    }
}

/// Parses `"30000/1001"` or `"25"`; zero or malformed rates give `None`.
fn parse_rate(rate: &str) -> Option<f64> {
    let value = match rate.split_once('/') {
        Some((num, den)) => {
            let den: f64 = den.trim().parse().ok()?;
            if den == 0.0 {
                return None;
            }
            num.trim().parse::<f64>().ok()? / den
        }
        None => rate.trim().parse().ok()?,
    };
    (value.is_finite() && value > 0.0).then_some(value)
}

fn parse_probe(json: &str) -> Result<VideoProperties> {
    let probe: ProbeOutput = serde_json::from_str(json).context("parsing ffprobe output")?;
    let stream = probe
        .streams
        .first()
        .ok_or_else(|| anyhow::anyhow!("no video stream"))?;

    let mut width = stream.width.unwrap_or(0);
    let mut height = stream.height.unwrap_or(0);
    if width == 0 || height == 0 {
        anyhow::bail!("video stream has no frame size");
    }
    // ffmpeg applies the display rotation while decoding
    let quarter_turns = (stream.rotation() / 90.0).round_ties_even() as i64;
    if quarter_turns.rem_euclid(2) == 1 {
        std::mem::swap(&mut width, &mut height);
    }

    let fps = stream
        .avg_frame_rate
        .as_deref()
        .and_then(parse_rate)
        .or_else(|| stream.r_frame_rate.as_deref().and_then(parse_rate))
        .unwrap_or(0.0);

    let duration = stream
        .duration
        .as_deref()
        .or(probe.format.as_ref().and_then(|f| f.duration.as_deref()))
        .and_then(|d| d.trim().parse::<f64>().ok());

    let total_frames = stream
        .nb_frames
        .as_deref()
        .and_then(|n| n.trim().parse::<usize>().ok())
        .filter(|&n| n > 0)
        .or_else(|| duration.map(|d| (d * fps).round().max(0.0) as usize))
        .unwrap_or(0);

    Ok(VideoProperties {
        width,
        height,
        fps,
        total_frames,
    })
}
