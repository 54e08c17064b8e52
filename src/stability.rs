// src/stability.rs
//
// Frame-to-frame plausibility gate for per-frame caliper means.
//
// A warm-up phase (Welford running mean/variance) waits until the signal is
// calm enough to fix a baseline. After that every value must pass a robust
// z-score against the sliding window, stay within a relative band around the
// baseline and not jump too far from the last accepted value.

use crate::error::PipelineError;
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use tracing::{debug, warn};

/// Scale factor turning a MAD into a normal-consistent sigma.
const MAD_TO_SIGMA: f64 = 1.4826;
const MIN_SIGMA: f64 = 1e-6;
const MIN_WINDOW: usize = 3;

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct StabilityConfig {
    /// Warm-up values required before a baseline may be fixed.
    pub init_window: usize,
    /// Maximum coefficient of variation (std / mean) of the warm-up values.
    pub init_cv_max: f64,
    /// Sliding window length, at least 3.
    pub win_size: usize,
    pub z_thresh: f64,
    /// Allowed relative band around the baseline.
    pub rel_tol: f64,
    /// Maximum change from the last accepted value, in mm per processed frame.
    pub roc_abs_max: f64,
    /// Consecutive rejections that stop the filter for good.
    pub consec_bad_stop: u32,
    /// Accept everything until a baseline exists.
    pub require_baseline: bool,
}

impl Default for StabilityConfig {
    fn default() -> Self {
        Self {
            init_window: 10,
            init_cv_max: 0.08,
            win_size: 9,
            z_thresh: 3.5,
            rel_tol: 0.2,
            roc_abs_max: 3.0,
            consec_bad_stop: u32::MAX,
            require_baseline: true,
        }
    }
}

impl StabilityConfig {
    /// Derives the per-frame rate limit from a physical one.
    pub fn with_roc_per_second(mut self, mm_per_s: f64, eff_fps: f64) -> Self {
        if eff_fps > 0.0 && mm_per_s.is_finite() {
            self.roc_abs_max = mm_per_s / eff_fps;
        }
        self
    }

    pub fn validate(&self) -> Result<(), PipelineError> {
        if self.init_window == 0 {
            return Err(PipelineError::invalid("stability.init_window must be > 0"));
        }
        if !(self.init_cv_max >= 0.0) {
            return Err(PipelineError::invalid("stability.init_cv_max must be >= 0"));
        }
        if !(self.z_thresh > 0.0) {
            return Err(PipelineError::invalid("stability.z_thresh must be > 0"));
        }
        if !(self.rel_tol >= 0.0) {
            return Err(PipelineError::invalid("stability.rel_tol must be >= 0"));
        }
        if !(self.roc_abs_max >= 0.0) {
            return Err(PipelineError::invalid("stability.roc_abs_max must be >= 0"));
        }
        if self.consec_bad_stop == 0 {
            return Err(PipelineError::invalid("stability.consec_bad_stop must be > 0"));
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Default)]
struct Welford {
    n: usize,
    mean: f64,
    m2: f64,
}

impl Welford {
    fn update(&mut self, x: f64) {
        self.n += 1;
        let delta = x - self.mean;
        self.mean += delta / self.n as f64;
        self.m2 += delta * (x - self.mean);
    }

    fn std(&self) -> f64 {
        let var = self.m2 / (self.n.saturating_sub(1)).max(1) as f64;
        var.max(0.0).sqrt()
    }
}

#[derive(Debug, Clone)]
pub struct StabilityFilter {
    cfg: StabilityConfig,
    win: usize,
    window: VecDeque<f64>,
    sorted: Vec<f64>,
    warm: Welford,
    baseline: Option<f64>,
    baseline_mad: Option<f64>,
    last_valid: Option<f64>,
    consecutive_bad: u32,
    stopped: bool,
}

impl StabilityFilter {
    pub fn new(cfg: StabilityConfig) -> Self {
        let win = cfg.win_size.max(MIN_WINDOW);
        Self {
            cfg,
            win,
            window: VecDeque::with_capacity(win),
            sorted: Vec::with_capacity(win),
            warm: Welford::default(),
            baseline: None,
            baseline_mad: None,
            last_valid: None,
            consecutive_bad: 0,
            stopped: false,
        }
    }

    /// Feeds one frame measurement; `true` if it is accepted.
    pub fn add(&mut self, value: f64) -> bool {
        if self.stopped {
            return false;
        }
        if !value.is_finite() {
            return self.reject("non-finite value");
        }

        self.push(value);

        if self.baseline.is_none() {
            self.warm.update(value);
            self.try_build_baseline();
            if self.cfg.require_baseline {
                self.last_valid = Some(value);
                return true;
            }
        }

        let median = median_of_sorted(&self.sorted);
        let mad = mad(self.window.iter().copied(), median);
        let sigma = (MAD_TO_SIGMA * mad).max(MIN_SIGMA);
        if (value - median).abs() / sigma > self.cfg.z_thresh {
            return self.reject("robust z-score");
        }

        if let Some(baseline) = self.baseline {
            let lo = baseline * (1.0 - self.cfg.rel_tol);
            let hi = baseline * (1.0 + self.cfg.rel_tol);
            if value < lo || value > hi {
                return self.reject("outside baseline band");
            }
        }

        if let Some(last) = self.last_valid {
            if (value - last).abs() > self.cfg.roc_abs_max {
                return self.reject("rate of change");
            }
        }

        self.consecutive_bad = 0;
        self.last_valid = Some(value);
        true
    }

    pub fn baseline(&self) -> Option<f64> {
        self.baseline
    }

    pub fn baseline_mad(&self) -> Option<f64> {
        self.baseline_mad
    }

    pub fn last_valid(&self) -> Option<f64> {
        self.last_valid
    }

    pub fn is_stopped(&self) -> bool {
        self.stopped
    }

    pub fn consecutive_bad(&self) -> u32 {
        self.consecutive_bad
    }

    pub fn window_len(&self) -> usize {
        self.window.len()
    }

    fn push(&mut self, value: f64) {
        if self.window.len() == self.win {
            if let Some(old) = self.window.pop_front() {
                let i = self.sorted.partition_point(|&v| v < old);
                let i = i.min(self.sorted.len().saturating_sub(1));
                self.sorted.remove(i);
            }
        }
        self.window.push_back(value);
        let i = self.sorted.partition_point(|&v| v < value);
        self.sorted.insert(i, value);
    }

    fn try_build_baseline(&mut self) {
        if self.warm.n < self.cfg.init_window || self.warm.mean <= 0.0 {
            return;
        }
        let cv = self.warm.std() / self.warm.mean;
        if cv > self.cfg.init_cv_max {
            return;
        }
        let median = median_of_sorted(&self.sorted);
        let mad = mad(self.window.iter().copied(), median);
        debug!(
            "Baseline established at {:.3} mm (MAD {:.3}, CV {:.3}, n={})",
            median, mad, cv, self.warm.n
        );
        self.baseline = Some(median);
        self.baseline_mad = Some(mad);
    }

    fn reject(&mut self, reason: &str) -> bool {
        self.consecutive_bad = self.consecutive_bad.saturating_add(1);
        debug!("Rejected measurement ({}), {} in a row", reason, self.consecutive_bad);
        if self.consecutive_bad >= self.cfg.consec_bad_stop {
            warn!(
                "⚠️  {} consecutive rejections, stability filter stopped",
                self.consecutive_bad
            );
            self.stopped = true;
        }
        false
    }
}

fn median_of_sorted(sorted: &[f64]) -> f64 {
    let n = sorted.len();
    if n == 0 {
        return 0.0;
    }
    let mid = n / 2;
    if n % 2 == 1 {
        sorted[mid]
    } else {
        0.5 * (sorted[mid - 1] + sorted[mid])
    }
}

fn mad(values: impl Iterator<Item = f64>, median: f64) -> f64 {
    let mut dev: Vec<f64> = values.map(|v| (v - median).abs()).collect();
    dev.sort_by(|a, b| a.total_cmp(b));
    median_of_sorted(&dev)
}
