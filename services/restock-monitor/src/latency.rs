//! Rolling latency anomaly detection
//!
//! A silently blocked client is often served a cached block page that
//! returns far faster than a real product response. Every `window` samples
//! the mean is compared with the previous window's mean; a sharp drop to
//! below an absolute floor is reported as an anomaly.

use std::time::Duration;

use crate::config::LatencyConfig;

/// A window mean that dropped below both the ratio and the floor.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LatencyAnomaly {
    pub previous: Duration,
    pub current: Duration,
}

/// Per-task latency window. Owned by a single task loop.
#[derive(Debug)]
pub struct LatencyTracker {
    samples: Vec<Duration>,
    window: usize,
    ratio: f64,
    floor: Duration,
    prev_avg: Option<Duration>,
}

impl LatencyTracker {
    pub fn new(window: usize, ratio: f64, floor: Duration) -> Self {
        Self {
            samples: Vec::with_capacity(window),
            window: window.max(1),
            ratio,
            floor,
            prev_avg: None,
        }
    }

    pub fn from_config(config: &LatencyConfig) -> Self {
        Self::new(
            config.window,
            config.ratio,
            Duration::from_millis(config.floor_ms),
        )
    }

    /// Mean of the last completed window, if any.
    pub fn previous_average(&self) -> Option<Duration> {
        self.prev_avg
    }

    /// Record one request's round trip. Returns an anomaly when this sample
    /// completes a window whose mean dropped sharply.
    pub fn record(&mut self, sample: Duration) -> Option<LatencyAnomaly> {
        self.samples.push(sample);
        if self.samples.len() < self.window {
            return None;
        }

        let total: Duration = self.samples.iter().sum();
        let current = total / self.samples.len() as u32;
        self.samples.clear();

        let previous = self.prev_avg.replace(current)?;
        evaluate(previous, current, self.ratio, self.floor)
    }
}

/// Compare two window means. Both conditions must hold.
pub fn evaluate(
    previous: Duration,
    current: Duration,
    ratio: f64,
    floor: Duration,
) -> Option<LatencyAnomaly> {
    if previous.is_zero() {
        return None;
    }
    let dropped = current.as_secs_f64() / previous.as_secs_f64() < ratio;
    if dropped && current < floor {
        Some(LatencyAnomaly { previous, current })
    } else {
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ms(n: u64) -> Duration {
        Duration::from_millis(n)
    }

    #[test]
    fn drop_above_floor_is_not_anomalous() {
        assert_eq!(evaluate(ms(1000), ms(200), 0.3, ms(150)), None);
    }

    #[test]
    fn drop_below_floor_is_anomalous() {
        assert_eq!(
            evaluate(ms(1000), ms(100), 0.3, ms(150)),
            Some(LatencyAnomaly {
                previous: ms(1000),
                current: ms(100)
            })
        );
    }

    #[test]
    fn fast_but_steady_is_not_anomalous() {
        // Below the floor, but no sharp drop.
        assert_eq!(evaluate(ms(120), ms(100), 0.3, ms(150)), None);
    }

    #[test]
    fn first_window_only_seeds() {
        let mut tracker = LatencyTracker::new(2, 0.3, ms(150));
        assert_eq!(tracker.record(ms(10)), None);
        assert_eq!(tracker.record(ms(10)), None);
        assert_eq!(tracker.previous_average(), Some(ms(10)));
    }

    #[test]
    fn anomaly_fires_on_window_boundary_only() {
        let mut tracker = LatencyTracker::new(3, 0.3, ms(150));
        for _ in 0..3 {
            tracker.record(ms(1000));
        }
        assert_eq!(tracker.record(ms(100)), None);
        assert_eq!(tracker.record(ms(100)), None);
        let anomaly = tracker.record(ms(100)).unwrap();
        assert_eq!(anomaly.previous, ms(1000));
        assert_eq!(anomaly.current, ms(100));
    }

    #[test]
    fn previous_average_updates_after_anomaly() {
        let mut tracker = LatencyTracker::new(1, 0.3, ms(150));
        tracker.record(ms(1000));
        assert!(tracker.record(ms(100)).is_some());
        assert_eq!(tracker.previous_average(), Some(ms(100)));
        // Same level again is not a drop.
        assert_eq!(tracker.record(ms(100)), None);
    }

    #[test]
    fn window_mean_is_arithmetic() {
        let mut tracker = LatencyTracker::new(4, 0.3, ms(150));
        for sample in [100, 200, 300, 400] {
            tracker.record(ms(sample));
        }
        assert_eq!(tracker.previous_average(), Some(ms(250)));
    }
}
