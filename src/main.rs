// src/main.rs

use anyhow::{Context, Result};
use serde::Serialize;
use std::path::{Path, PathBuf};
use std::time::Instant;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;
use vessel_caliper::pipeline::{IntervalOutcome, IntervalProcessor, MetricsSummary, ProcessorOptions};
use vessel_caliper::segmentation::YoloSegmenter;
use vessel_caliper::types::{Config, IntervalStat};
use vessel_caliper::video::find_video_files;

#[derive(Debug, Serialize)]
struct IntervalReport {
    index: usize,
    start_s: f64,
    end_s: f64,
    #[serde(skip_serializing_if = "Option::is_none")]
    stat: Option<IntervalStat>,
    #[serde(skip_serializing_if = "Option::is_none")]
    error: Option<String>,
}

#[derive(Debug, Serialize)]
struct VideoReport {
    video: PathBuf,
    pixel_size_mm: f64,
    target_fps: f64,
    intervals: Vec<IntervalReport>,
    metrics: MetricsSummary,
}

fn main() -> Result<()> {
    let config_path = std::env::args().nth(1).unwrap_or_else(|| "config.yaml".to_string());
    let config = Config::load(&config_path)?;

    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&config.logging.level));
    tracing_subscriber::fmt().with_env_filter(filter).init();

    info!("🩺 Vessel caliper starting");
    info!("✓ Configuration loaded from {}", config_path);

    let intervals = config.intervals()?;
    if intervals.is_empty() {
        warn!("No intervals configured under video.intervals, nothing to do");
        return Ok(());
    }

    let video_files = find_video_files(Path::new(&config.video.input_dir));
    if video_files.is_empty() {
        error!("No video files found in {}", config.video.input_dir);
        return Ok(());
    }

    let segmenter = YoloSegmenter::new(
        &config.model.path,
        config.model.input_size,
        config.model.num_threads,
        config.model.use_cuda,
    )?;
    let mut processor = IntervalProcessor::new(segmenter, ProcessorOptions::from_config(&config))?;

    let output_dir = PathBuf::from(&config.video.output_dir);
    std::fs::create_dir_all(&output_dir)
        .with_context(|| format!("creating {}", output_dir.display()))?;

    for (idx, video_path) in video_files.iter().enumerate() {
        info!("========================================");
        info!(
            "Processing video {}/{}: {}",
            idx + 1,
            video_files.len(),
            video_path.display()
        );
        info!("========================================");

        let started = Instant::now();
        let outcomes = match processor.process_video(
            video_path,
            &intervals,
            config.video.target_fps,
            &output_dir,
            config.region(),
        ) {
            Ok(outcomes) => outcomes,
            Err(e) => {
                error!("❌ Failed to process {}: {:#}", video_path.display(), e);
                continue;
            }
        };

        let report = VideoReport {
            video: video_path.clone(),
            pixel_size_mm: config.video.pixel_size_mm,
            target_fps: config.video.target_fps,
            intervals: outcomes.into_iter().map(to_report).collect(),
            metrics: processor.metrics().summary(),
        };

        let stem = video_path
            .file_stem()
            .map(|s| s.to_string_lossy().into_owned())
            .unwrap_or_else(|| "video".to_string());
        let json_path = output_dir.join(format!("{}_intervals.json", stem));
        let file = std::fs::File::create(&json_path)
            .with_context(|| format!("creating {}", json_path.display()))?;
        serde_json::to_writer_pretty(file, &report)?;

        let ok = report.intervals.iter().filter(|r| r.stat.is_some()).count();
        info!(
            "✓ {}: {}/{} intervals in {:.1}s, summary at {}",
            video_path.display(),
            ok,
            report.intervals.len(),
            started.elapsed().as_secs_f64(),
            json_path.display()
        );
    }

    let summary = processor.metrics().summary();
    info!(
        "Done: {} frames processed ({:.1} fps), {} accepted, {} rejected",
        summary.frames_processed, summary.fps, summary.frames_accepted, summary.frames_rejected
    );

    Ok(())
}

fn to_report(outcome: IntervalOutcome) -> IntervalReport {
    let (stat, error) = match outcome.result {
        Ok(stat) => (Some(stat), None),
        Err(e) => (None, Some(format!("{:#}", e))),
    };
    IntervalReport {
        index: outcome.index,
        start_s: outcome.interval.start_s,
        end_s: outcome.interval.end_s,
        stat,
        error,
    }
}
