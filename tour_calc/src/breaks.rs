//! Break-time detection over aligned time/distance/speed series.

use serde::{Deserialize, Serialize};

use crate::config::{BreakTimeConfig, BreakTimeMethod};
use crate::TourError;

const MPS_TO_KMH: f64 = 3.6;
/// Average speed series are stored as km/h * 10.
const SPEED_SERIE_SCALE: f64 = 10.0;

/// Minimum break length used for devices with a fixed recording interval.
pub const FIXED_INTERVAL_MIN_BREAK_S: i32 = 20;

#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct BreakTimeResult {
    pub break_mask: Vec<bool>,
    pub total_break_seconds: i32,
}

impl BreakTimeResult {
    pub fn break_samples(&self) -> usize {
        self.break_mask.iter().filter(|&&b| b).count()
    }
}

#[derive(Clone, Copy)]
enum SpeedSource<'a> {
    Slice,
    Average(&'a [f64]),
}

/// Classify every sample of a tour as moving or break, using `config.method`.
///
/// `speed` is only consulted by [`BreakTimeMethod::ByAvgSpeed`].
pub fn detect_breaks(
    time: &[i32],
    distance: &[f64],
    speed: Option<&[f64]>,
    config: &BreakTimeConfig,
) -> Result<BreakTimeResult, TourError> {
    check_series(time, distance)?;

    match config.method {
        BreakTimeMethod::BySliceSpeed => Ok(break_time_by_speed(
            time,
            distance,
            SpeedSource::Slice,
            config.min_slice_speed_kmh,
        )),
        BreakTimeMethod::ByAvgSpeed => {
            let speed = speed.ok_or_else(|| {
                TourError::InvalidInput("average speed series required for by_avg_speed".into())
            })?;
            if speed.len() != time.len() {
                return Err(TourError::InvalidInput(format!(
                    "speed series has {} samples, time series has {}",
                    speed.len(),
                    time.len()
                )));
            }
            Ok(break_time_by_speed(
                time,
                distance,
                SpeedSource::Average(speed),
                config.min_avg_speed_kmh,
            ))
        }
        BreakTimeMethod::ByTimeDistance => Ok(break_time_by_time_distance(
            time,
            distance,
            config.shortest_break_time_s,
            config.max_distance_m,
            config.slice_diff_min,
        )),
        BreakTimeMethod::ByAvgSliceSpeed => Ok(break_time_by_avg_slice_speed(
            time,
            distance,
            config.as_min_avg_speed_kmh,
            config.as_min_slice_speed_kmh,
            config.as_min_slice_time_s,
        )),
    }
}

fn check_series(time: &[i32], distance: &[f64]) -> Result<(), TourError> {
    if time.is_empty() {
        return Err(TourError::InvalidInput("time series is empty".into()));
    }
    if time.len() != distance.len() {
        return Err(TourError::InvalidInput(format!(
            "distance series has {} samples, time series has {}",
            distance.len(),
            time.len()
        )));
    }
    if distance.iter().any(|d| !d.is_finite()) {
        return Err(TourError::InvalidInput(
            "distance series contains non-finite values".into(),
        ));
    }
    Ok(())
}

fn slice_speed_kmh(time_diff: i32, dist_diff: f64) -> f64 {
    if time_diff == 0 {
        0.0
    } else {
        dist_diff * MPS_TO_KMH / time_diff as f64
    }
}

// The first slice is measured from time 0 / distance 0, not from sample 0.
fn break_time_by_speed(
    time: &[i32],
    distance: &[f64],
    source: SpeedSource<'_>,
    min_speed_kmh: f64,
) -> BreakTimeResult {
    let mut break_mask = vec![false; time.len()];
    let mut total = 0;
    let mut last_time = 0;
    let mut last_distance = 0.0;

    for i in 1..time.len() {
        let current_time = time[i];
        let current_distance = distance[i];
        let time_diff = current_time - last_time;
        let dist_diff = current_distance - last_distance;

        let speed = match source {
            SpeedSource::Slice => slice_speed_kmh(time_diff, dist_diff),
            SpeedSource::Average(serie) => serie[i] / SPEED_SERIE_SCALE,
        };

        if speed <= min_speed_kmh {
            break_mask[i] = true;
            total += time_diff;
        }

        last_time = current_time;
        last_distance = current_distance;
    }

    BreakTimeResult {
        break_mask,
        total_break_seconds: total,
    }
}

fn break_time_by_time_distance(
    time: &[i32],
    distance: &[f64],
    shortest_break_s: i32,
    max_distance_m: f64,
    slice_diff_min: i32,
) -> BreakTimeResult {
    let n = time.len();
    let slice_diff_s = slice_diff_min.saturating_mul(60);
    let mut break_mask = vec![false; n];
    let mut prev_time = 0;
    let mut prev_distance = 0.0;

    for i in 0..n {
        let current_time = time[i];
        let current_distance = distance[i];
        let slice_time = current_time - prev_time;
        let slice_distance = current_distance - prev_distance;

        if slice_time > shortest_break_s && slice_distance < max_distance_m {
            break_mask[i] = true;
        } else if slice_diff_min > 0 && slice_time > slice_diff_s {
            break_mask[i] = true;
        } else {
            let mut start = i;
            let mut acc_time = 0;
            let mut acc_distance = 0.0;
            while start > 0 {
                start -= 1;
                acc_time = current_time - time[start];
                acc_distance = current_distance - distance[start];
                if acc_time > shortest_break_s {
                    break;
                }
            }
            if acc_time > shortest_break_s && acc_distance < max_distance_m {
                for mark in &mut break_mask[start..=i] {
                    *mark = true;
                }
            }
        }

        prev_time = current_time;
        prev_distance = current_distance;
    }

    // Summed in a second sweep: the backward walk can mark samples that were
    // already passed above.
    let mut total = 0;
    let mut prev_time = 0;
    for (i, &current_time) in time.iter().enumerate() {
        if break_mask[i] {
            total += current_time - prev_time;
        }
        prev_time = current_time;
    }

    BreakTimeResult {
        break_mask,
        total_break_seconds: total,
    }
}

fn break_time_by_avg_slice_speed(
    time: &[i32],
    distance: &[f64],
    min_avg_speed_kmh: f64,
    min_slice_speed_kmh: f64,
    min_slice_time_s: i32,
) -> BreakTimeResult {
    let n = time.len();
    let mut break_mask = vec![false; n];
    let mut total = 0;
    let mut last_time = 0;
    let mut last_distance = 0.0;
    let mut window_start = 0usize;

    for i in 1..n {
        let current_time = time[i];
        let current_distance = distance[i];
        let time_diff = current_time - last_time;
        let slice_speed = slice_speed_kmh(time_diff, current_distance - last_distance);

        // Latest start that still spans at least `min_slice_time_s`.
        while window_start + 1 < i && current_time - time[window_start + 1] >= min_slice_time_s {
            window_start += 1;
        }
        let avg_speed = slice_speed_kmh(
            current_time - time[window_start],
            current_distance - distance[window_start],
        );

        if avg_speed <= min_avg_speed_kmh && slice_speed <= min_slice_speed_kmh {
            break_mask[i] = true;
            total += time_diff;
        }

        last_time = current_time;
        last_distance = current_distance;
    }

    BreakTimeResult {
        break_mask,
        total_break_seconds: total,
    }
}

/// Break detection for devices recording at a fixed interval: a sample is a
/// break when the distance did not change over the last `min_slices` samples.
pub fn break_time_fixed(distance: &[f64], min_slices: usize) -> Vec<bool> {
    let min_slices = min_slices.max(1);
    let mut break_mask = Vec::with_capacity(distance.len());
    let mut reference = 0.0;

    for i in 0..distance.len() {
        break_mask.push(distance[i] == reference);
        reference = distance[i.saturating_sub(min_slices)];
    }
    break_mask
}

/// Seconds spent in breaks between `start` and `end` (inclusive), `end` is
/// clamped to the last sample.
pub fn break_time_in_range(
    time: &[i32],
    break_mask: &[bool],
    start: usize,
    end: usize,
) -> Result<i32, TourError> {
    if time.len() != break_mask.len() {
        return Err(TourError::InvalidInput(format!(
            "break mask has {} samples, time series has {}",
            break_mask.len(),
            time.len()
        )));
    }
    if start >= time.len() {
        return Err(TourError::InvalidInput(format!(
            "start index {start} outside series of {} samples",
            time.len()
        )));
    }
    let end = end.min(time.len() - 1);

    let mut total = 0;
    let mut prev_time = time[start];
    for i in start + 1..=end {
        if break_mask[i] {
            total += time[i] - prev_time;
        }
        prev_time = time[i];
    }
    Ok(total)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config(method: BreakTimeMethod) -> BreakTimeConfig {
        BreakTimeConfig {
            method,
            ..BreakTimeConfig::default()
        }
    }

    #[test]
    fn test_slice_speed_scenario() {
        let time = [0, 10, 20, 30];
        let distance = [0.0, 5.0, 6.0, 20.0];
        let cfg = BreakTimeConfig {
            min_slice_speed_kmh: 2.0,
            ..config(BreakTimeMethod::BySliceSpeed)
        };
        let result = detect_breaks(&time, &distance, None, &cfg).unwrap();
        assert_eq!(result.break_mask, vec![false, true, true, false]);
        assert_eq!(result.total_break_seconds, 20);
        assert_eq!(result.break_samples(), 2);
    }

    #[test]
    fn test_slice_speed_total_matches_marked_deltas() {
        let time = [0, 4, 9, 9, 20, 31, 40];
        let distance = [0.0, 0.0, 30.0, 30.0, 31.0, 80.0, 80.5];
        let cfg = BreakTimeConfig {
            min_slice_speed_kmh: 1.0,
            ..config(BreakTimeMethod::BySliceSpeed)
        };
        let result = detect_breaks(&time, &distance, None, &cfg).unwrap();

        let mut expected = 0;
        for i in 1..time.len() {
            let dt = time[i] - time[i - 1];
            let speed = if dt == 0 {
                0.0
            } else {
                (distance[i] - distance[i - 1]) * 3.6 / dt as f64
            };
            assert_eq!(result.break_mask[i], speed <= 1.0, "sample {i}");
            if result.break_mask[i] {
                expected += dt;
            }
        }
        assert!(!result.break_mask[0]);
        assert_eq!(result.total_break_seconds, expected);
    }

    #[test]
    fn test_first_slice_is_measured_from_origin() {
        // Sample 0 sits at t=100 / 1000 m; the first slice still diffs against 0/0.
        let time = [100, 110];
        let distance = [1000.0, 1000.0];
        let cfg = BreakTimeConfig {
            min_slice_speed_kmh: 1.0,
            ..config(BreakTimeMethod::BySliceSpeed)
        };
        let result = detect_breaks(&time, &distance, None, &cfg).unwrap();
        // 1000 m in 110 s is fast, so the standing slice is not a break.
        assert_eq!(result.break_mask, vec![false, false]);
        assert_eq!(result.total_break_seconds, 0);
    }

    #[test]
    fn test_constant_speed_never_breaks() {
        let time: Vec<i32> = (0..50).map(|i| i * 2).collect();
        let distance: Vec<f64> = (0..50).map(|i| i as f64 * 10.0).collect();
        let cfg = config(BreakTimeMethod::BySliceSpeed);
        let result = detect_breaks(&time, &distance, None, &cfg).unwrap();
        assert_eq!(result.break_samples(), 0);
        assert_eq!(result.total_break_seconds, 0);
    }

    #[test]
    fn test_all_zero_distance_is_all_breaks() {
        let time = [0, 5, 10, 15];
        let distance = [0.0; 4];
        let result =
            detect_breaks(&time, &distance, None, &config(BreakTimeMethod::BySliceSpeed)).unwrap();
        assert_eq!(result.break_mask, vec![false, true, true, true]);
        assert_eq!(result.total_break_seconds, 15);
    }

    #[test]
    fn test_avg_speed_uses_scaled_series() {
        let time = [0, 10, 20, 30];
        let distance = [0.0, 50.0, 60.0, 200.0];
        let speed = [0.0, 180.0, 8.0, 10.0];
        let cfg = BreakTimeConfig {
            min_avg_speed_kmh: 1.0,
            ..config(BreakTimeMethod::ByAvgSpeed)
        };
        let result = detect_breaks(&time, &distance, Some(&speed[..]), &cfg).unwrap();
        assert_eq!(result.break_mask, vec![false, false, true, true]);
        assert_eq!(result.total_break_seconds, 20);
    }

    #[test]
    fn test_avg_speed_requires_speed_series() {
        let time = [0, 10];
        let distance = [0.0, 1.0];
        let cfg = config(BreakTimeMethod::ByAvgSpeed);
        assert!(matches!(
            detect_breaks(&time, &distance, None, &cfg),
            Err(TourError::InvalidInput(_))
        ));
        assert!(matches!(
            detect_breaks(&time, &distance, Some(&[0.0][..]), &cfg),
            Err(TourError::InvalidInput(_))
        ));
    }

    #[test]
    fn test_rejects_mismatched_or_empty_series() {
        let cfg = config(BreakTimeMethod::BySliceSpeed);
        assert!(matches!(
            detect_breaks(&[], &[], None, &cfg),
            Err(TourError::InvalidInput(_))
        ));
        assert!(matches!(
            detect_breaks(&[0, 1], &[0.0], None, &cfg),
            Err(TourError::InvalidInput(_))
        ));
        assert!(matches!(
            detect_breaks(&[0, 1], &[0.0, f64::NAN], None, &cfg),
            Err(TourError::InvalidInput(_))
        ));
    }

    #[test]
    fn test_time_distance_long_slow_slice() {
        let time = [0, 10, 50, 60];
        let distance = [0.0, 100.0, 110.0, 300.0];
        let cfg = BreakTimeConfig {
            shortest_break_time_s: 20,
            max_distance_m: 20.0,
            slice_diff_min: 0,
            ..config(BreakTimeMethod::ByTimeDistance)
        };
        let result = detect_breaks(&time, &distance, None, &cfg).unwrap();
        assert_eq!(result.break_mask, vec![false, false, true, false]);
        assert_eq!(result.total_break_seconds, 40);
    }

    #[test]
    fn test_time_distance_slice_diff_rule() {
        let time = [0, 10, 100];
        let distance = [0.0, 100.0, 500.0];
        let enabled = BreakTimeConfig {
            shortest_break_time_s: 20,
            max_distance_m: 20.0,
            slice_diff_min: 1,
            ..config(BreakTimeMethod::ByTimeDistance)
        };
        let result = detect_breaks(&time, &distance, None, &enabled).unwrap();
        assert_eq!(result.break_mask, vec![false, false, true]);
        assert_eq!(result.total_break_seconds, 90);

        let disabled = BreakTimeConfig {
            slice_diff_min: 0,
            ..enabled
        };
        let result = detect_breaks(&time, &distance, None, &disabled).unwrap();
        assert_eq!(result.break_mask, vec![false, false, false]);
        assert_eq!(result.total_break_seconds, 0);
    }

    #[test]
    fn test_time_distance_huge_slice_diff() {
        let time = [0, 10, 100];
        let distance = [0.0, 100.0, 500.0];
        let cfg = BreakTimeConfig {
            slice_diff_min: 40_000_000,
            ..config(BreakTimeMethod::ByTimeDistance)
        };
        let result = detect_breaks(&time, &distance, None, &cfg).unwrap();
        assert_eq!(result.break_mask, vec![false, false, false]);
        assert_eq!(result.total_break_seconds, 0);

        let cfg = BreakTimeConfig {
            slice_diff_min: i32::MAX,
            ..cfg
        };
        assert!(detect_breaks(&time, &distance, None, &cfg).is_ok());
    }

    #[test]
    fn test_time_distance_backward_walk_marks_earlier_samples() {
        let time = [0, 10, 20, 30, 40];
        let distance = [0.0, 100.0, 105.0, 110.0, 115.0];
        let cfg = BreakTimeConfig {
            shortest_break_time_s: 25,
            max_distance_m: 20.0,
            slice_diff_min: 0,
            ..config(BreakTimeMethod::ByTimeDistance)
        };
        let result = detect_breaks(&time, &distance, None, &cfg).unwrap();
        // Only sample 4 closes a slow 30 s window; samples 1..=3 are marked after the fact.
        assert_eq!(result.break_mask, vec![false, true, true, true, true]);
        assert_eq!(result.total_break_seconds, 40);
    }

    #[test]
    fn test_avg_slice_speed_requires_both_speeds_low() {
        let time = [0, 1, 2, 3, 4, 5];
        let distance = [0.0, 5.0, 10.0, 10.0, 10.0, 10.1];
        let cfg = BreakTimeConfig {
            as_min_avg_speed_kmh: 1.0,
            as_min_slice_speed_kmh: 1.0,
            as_min_slice_time_s: 2,
            ..config(BreakTimeMethod::ByAvgSliceSpeed)
        };
        let result = detect_breaks(&time, &distance, None, &cfg).unwrap();
        // Sample 3 stands still but the 2 s window still carries movement.
        assert_eq!(result.break_mask, vec![false, false, false, false, true, true]);
        assert_eq!(result.total_break_seconds, 2);
    }

    #[test]
    fn test_break_time_fixed() {
        let distance = [0.0, 0.0, 10.0, 20.0, 20.0, 20.0, 20.0, 30.0];
        let mask = break_time_fixed(&distance, 2);
        assert_eq!(
            mask,
            vec![true, true, false, false, false, false, true, false]
        );
        // min_slices of 0 behaves like 1
        assert_eq!(break_time_fixed(&distance, 0), break_time_fixed(&distance, 1));
    }

    #[test]
    fn test_break_time_in_range() {
        let time = [0, 10, 20, 30, 40];
        let mask = [false, true, false, true, true];
        assert_eq!(break_time_in_range(&time, &mask, 0, 4).unwrap(), 30);
        assert_eq!(break_time_in_range(&time, &mask, 1, 3).unwrap(), 10);
        assert_eq!(break_time_in_range(&time, &mask, 2, 99).unwrap(), 20);
        assert!(break_time_in_range(&time, &mask, 5, 6).is_err());
        assert!(break_time_in_range(&time, &mask[..3], 0, 2).is_err());
    }
}
