// src/sampler.rs
//
// Chooses which source frames of an interval are decoded and measured when
// the requested rate is below the source rate.

/// Ratios at or below this are treated as "same rate" and sample every frame.
const SAME_RATE_RATIO: f64 = 1.05;

/// Ordered source frame indices in `[start_frame, end_frame]` to process.
pub fn sample_frame_indices(
    start_frame: usize,
    end_frame: usize,
    src_fps: f64,
    target_fps: f64,
) -> Vec<usize> {
    if end_frame < start_frame {
        return Vec::new();
    }

    let mut src = src_fps;
    let mut target = target_fps;
    if target <= 0.0 {
        target = src;
    }
    if src <= 0.0 {
        src = target;
    }
    if !(src > 0.0 && target > 0.0) {
        return (start_frame..=end_frame).collect();
    }

    let ratio = src / target;
    if ratio <= SAME_RATE_RATIO {
        return (start_frame..=end_frame).collect();
    }

    let span = (end_frame - start_frame + 1) as f64;
    let n = ((span / ratio).floor() as usize).max(1);

    (0..n)
        .map(|i| (start_frame as f64 + i as f64 * ratio).round_ties_even() as usize)
        .filter(|&idx| idx >= start_frame && idx <= end_frame)
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_equal_rates_sample_every_frame() {
        let idx = sample_frame_indices(10, 40, 30.0, 30.0);
        assert_eq!(idx.len(), 31);
        assert_eq!(idx.first(), Some(&10));
        assert_eq!(idx.last(), Some(&40));
    }

    #[test]
    fn test_near_equal_rates_sample_every_frame() {
        // 30 / 29 = 1.034, inside the same-rate tolerance
        let idx = sample_frame_indices(0, 59, 30.0, 29.0);
        assert_eq!(idx.len(), 60);
    }

    #[test]
    fn test_half_rate_is_monotonic_and_in_bounds() {
        let idx = sample_frame_indices(100, 199, 30.0, 15.0);
        assert_eq!(idx.len(), 50);
        assert!(idx.windows(2).all(|w| w[0] < w[1]));
        assert!(idx.iter().all(|&i| (100..=199).contains(&i)));
        assert_eq!(idx[..3], [100, 102, 104]);
    }

    #[test]
    fn test_non_positive_rates_fall_back() {
        assert_eq!(sample_frame_indices(0, 9, 30.0, 0.0).len(), 10);
        assert_eq!(sample_frame_indices(0, 9, 0.0, 10.0).len(), 10);
        assert_eq!(sample_frame_indices(0, 9, 0.0, 0.0).len(), 10);
    }

    #[test]
    fn test_short_span_yields_at_least_one_frame() {
        assert_eq!(sample_frame_indices(5, 6, 60.0, 1.0), vec![5]);
    }

    #[test]
    fn test_reversed_range_is_empty() {
        assert!(sample_frame_indices(10, 5, 30.0, 30.0).is_empty());
    }

    #[test]
    fn test_half_steps_round_to_even() {
        // 25 -> 10 fps gives a 2.5 frame stride
        assert_eq!(sample_frame_indices(0, 9, 25.0, 10.0), vec![0, 2, 5, 8]);
    }

    #[test]
    fn test_fractional_ratio_rounds() {
        let a = sample_frame_indices(0, 99, 29.97, 10.0);
        let b = sample_frame_indices(0, 99, 29.97, 10.0);
        assert_eq!(a, b);
        assert_eq!(a.len(), 33);
        assert_eq!(a[1], 3);
    }
}
