// src/pipeline/stats.rs

use crate::types::{Interval, NO_DATA};

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct IntervalAggregate {
    pub mean_of_means_mm: f64,
    pub max_of_means_mm: f64,
    /// Source-video time of the first maximum.
    pub max_at_s: Option<f64>,
}

/// Reduces accepted `(frame_index, mean_mm)` pairs to the interval summary.
pub fn aggregate_interval(frame_means: &[(usize, f64)], src_fps: f64) -> IntervalAggregate {
    if frame_means.is_empty() {
        return IntervalAggregate {
            mean_of_means_mm: NO_DATA,
            max_of_means_mm: NO_DATA,
            max_at_s: None,
        };
    }

    let sum: f64 = frame_means.iter().map(|&(_, m)| m).sum();
    let mean = sum / frame_means.len() as f64;

    let (mut max_frame, mut max) = frame_means[0];
    for &(frame, m) in &frame_means[1..] {
        if m > max {
            max = m;
            max_frame = frame;
        }
    }

    IntervalAggregate {
        mean_of_means_mm: mean,
        max_of_means_mm: max,
        max_at_s: (src_fps > 0.0).then(|| max_frame as f64 / src_fps),
    }
}

/// `{stem}_seg_{k}_{start}-{end}_{fps}fps.mp4` with whole-second bounds.
pub fn output_file_name(stem: &str, k: usize, interval: &Interval, out_fps: f64) -> String {
    format!(
        "{}_seg_{}_{}-{}_{}fps.mp4",
        stem,
        k,
        interval.start_s.trunc() as i64,
        interval.end_s.trunc() as i64,
        out_fps.round_ties_even() as i64
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;

    #[test]
    fn test_aggregate_basic() {
        let agg = aggregate_interval(&[(0, 1.0), (5, 2.0), (10, 3.0)], 10.0);
        assert_relative_eq!(agg.mean_of_means_mm, 2.0);
        assert_relative_eq!(agg.max_of_means_mm, 3.0);
        assert_relative_eq!(agg.max_at_s.unwrap(), 1.0);
    }

    #[test]
    fn test_aggregate_first_max_wins() {
        let agg = aggregate_interval(&[(3, 4.0), (6, 4.0), (9, 1.0)], 3.0);
        assert_relative_eq!(agg.max_at_s.unwrap(), 1.0);
    }

    #[test]
    fn test_aggregate_empty_is_sentinel() {
        let agg = aggregate_interval(&[], 30.0);
        assert_eq!(agg.mean_of_means_mm, NO_DATA);
        assert_eq!(agg.max_of_means_mm, NO_DATA);
        assert!(agg.max_at_s.is_none());
    }

    #[test]
    fn test_output_file_name() {
        let iv = Interval::new(75.6, 100.2).unwrap();
        assert_eq!(
            output_file_name("scan_01", 2, &iv, 14.6),
            "scan_01_seg_2_75-100_15fps.mp4"
        );
        assert_eq!(
            output_file_name("scan_01", 0, &iv, 12.5),
            "scan_01_seg_0_75-100_12fps.mp4"
        );
    }
}
