// src/pipeline/metrics.rs
//
// Frame counts and cumulative stage timings for one processor. Cloning shares
// the underlying counters.

use serde::Serialize;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

#[derive(Debug, Clone)]
pub struct PipelineMetrics {
    pub frames_processed: Arc<AtomicU64>,
    pub frames_with_mask: Arc<AtomicU64>,
    pub frames_with_lines: Arc<AtomicU64>,
    pub frames_accepted: Arc<AtomicU64>,
    pub frames_rejected: Arc<AtomicU64>,
    pub batches: Arc<AtomicU64>,
    pub letterbox_time_us: Arc<AtomicU64>,
    pub inference_time_us: Arc<AtomicU64>,
    pub postprocess_time_us: Arc<AtomicU64>,
    pub started_at: Instant,
}

impl Default for PipelineMetrics {
    fn default() -> Self {
        Self::new()
    }
}

impl PipelineMetrics {
    pub fn new() -> Self {
        Self {
            frames_processed: Arc::new(AtomicU64::new(0)),
            frames_with_mask: Arc::new(AtomicU64::new(0)),
            frames_with_lines: Arc::new(AtomicU64::new(0)),
            frames_accepted: Arc::new(AtomicU64::new(0)),
            frames_rejected: Arc::new(AtomicU64::new(0)),
            batches: Arc::new(AtomicU64::new(0)),
            letterbox_time_us: Arc::new(AtomicU64::new(0)),
            inference_time_us: Arc::new(AtomicU64::new(0)),
            postprocess_time_us: Arc::new(AtomicU64::new(0)),
            started_at: Instant::now(),
        }
    }

    pub fn inc(&self, counter: &AtomicU64) {
        counter.fetch_add(1, Ordering::Relaxed);
    }

    pub fn add_time(&self, counter: &AtomicU64, elapsed: Duration) {
        counter.fetch_add(elapsed.as_micros() as u64, Ordering::Relaxed);
    }

    pub fn fps(&self) -> f64 {
        let frames = self.frames_processed.load(Ordering::Relaxed);
        let elapsed = self.started_at.elapsed().as_secs_f64();
        if elapsed > 0.01 {
            frames as f64 / elapsed
        } else {
            0.0
        }
    }

    pub fn summary(&self) -> MetricsSummary {
        let frames = self.frames_processed.load(Ordering::Relaxed);
        let batches = self.batches.load(Ordering::Relaxed);
        let per = |counter: &AtomicU64, n: u64| {
            if n == 0 {
                0
            } else {
                counter.load(Ordering::Relaxed) / n
            }
        };

        MetricsSummary {
            frames_processed: frames,
            frames_with_mask: self.frames_with_mask.load(Ordering::Relaxed),
            frames_with_lines: self.frames_with_lines.load(Ordering::Relaxed),
            frames_accepted: self.frames_accepted.load(Ordering::Relaxed),
            frames_rejected: self.frames_rejected.load(Ordering::Relaxed),
            fps: self.fps(),
            avg_letterbox_us_per_batch: per(&self.letterbox_time_us, batches),
            avg_inference_us_per_batch: per(&self.inference_time_us, batches),
            avg_postprocess_us_per_frame: per(&self.postprocess_time_us, frames),
            elapsed_secs: self.started_at.elapsed().as_secs_f64(),
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct MetricsSummary {
    pub frames_processed: u64,
    pub frames_with_mask: u64,
    pub frames_with_lines: u64,
    pub frames_accepted: u64,
    pub frames_rejected: u64,
    pub fps: f64,
    pub avg_letterbox_us_per_batch: u64,
    pub avg_inference_us_per_batch: u64,
    pub avg_postprocess_us_per_frame: u64,
    pub elapsed_secs: f64,
}
