// clockfeed: Stats/Convergence
//
// Rolling-window range/count series and convergence classifier.

use std::collections::VecDeque;
use std::time::{Duration, Instant};

/// A bounded rolling window tracking the min/max/count of recently
/// observed values, used for the rt-stats the engine periodically drains.
pub struct RollingWindow {
    values: VecDeque<(Instant, f64)>,
    horizon: Duration,
}

impl RollingWindow {
    pub fn new(horizon: Duration) -> Self {
        Self {
            values: VecDeque::new(),
            horizon,
        }
    }

    pub fn push(&mut self, now: Instant, value: f64) {
        self.values.push_back((now, value));
        self.evict(now);
    }

    fn evict(&mut self, now: Instant) {
        while let Some((t, _)) = self.values.front() {
            if now.saturating_duration_since(*t) > self.horizon {
                self.values.pop_front();
            } else {
                break;
            }
        }
    }

    pub fn count(&self) -> usize {
        self.values.len()
    }

    pub fn range(&self) -> Option<(f64, f64)> {
        if self.values.is_empty() {
            return None;
        }
        let mut lo = f64::INFINITY;
        let mut hi = f64::NEG_INFINITY;
        for (_, v) in &self.values {
            lo = lo.min(*v);
            hi = hi.max(*v);
        }
        Some((lo, hi))
    }
}

/// Tracks whether a servo instance has held `|offset| <= threshold` for at
/// least `min_period` while in SLAVE with no alarms.
pub struct ConvergenceTracker {
    threshold_ns: i128,
    min_period: Duration,
    in_sync_since: Option<Instant>,
    converged: bool,
}

impl ConvergenceTracker {
    pub const DEFAULT_THRESHOLD_NS: i128 = 100_000;
    pub const DEFAULT_MIN_PERIOD: Duration = Duration::from_secs(60);

    pub fn new(threshold_ns: i128, min_period: Duration) -> Self {
        Self {
            threshold_ns,
            min_period,
            in_sync_since: None,
            converged: false,
        }
    }

    /// Call once per evaluated sample while the instance is eligible
    /// (SLAVE, no alarms, TIMESTAMP_PROCESSING enabled). `in_sync` is
    /// `|offset| <= threshold`.
    pub fn observe_eligible(&mut self, now: Instant, offset_ns: i128) -> bool {
        let in_sync = offset_ns.abs() <= self.threshold_ns;
        if !in_sync {
            // Freezes (does not reset) the window unless explicitly told
            // to via `reset` — an out-of-sync *sample* while still
            // eligible does reset the run, matching "the instance is
            // converged if samples have remained in-sync for >= min_period".
            self.in_sync_since = None;
            self.converged = false;
            return self.converged;
        }
        let since = *self.in_sync_since.get_or_insert(now);
        if now.saturating_duration_since(since) >= self.min_period {
            self.converged = true;
        }
        self.converged
    }

    /// Call while the instance is not eligible (alarm raised, or not in
    /// SLAVE, or TIMESTAMP_PROCESSING disabled): freezes the window
    /// without resetting it.
    pub fn freeze(&self) -> bool {
        self.converged
    }

    /// A monotonic-check failure (e.g. the local clock moved backwards)
    /// resets the measure entirely.
    pub fn reset(&mut self) {
        self.in_sync_since = None;
        self.converged = false;
    }

    pub fn converged(&self) -> bool {
        self.converged
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rolling_window_tracks_range() {
        let mut w = RollingWindow::new(Duration::from_secs(60));
        let now = Instant::now();
        w.push(now, 10.0);
        w.push(now, -5.0);
        w.push(now, 3.0);
        assert_eq!(w.range(), Some((-5.0, 10.0)));
        assert_eq!(w.count(), 3);
    }

    #[test]
    fn convergence_requires_min_period_in_sync() {
        let mut c = ConvergenceTracker::new(100_000, Duration::from_millis(50));
        let t0 = Instant::now();
        assert!(!c.observe_eligible(t0, 2_000));
        assert!(!c.observe_eligible(t0 + Duration::from_millis(10), 2_000));
        assert!(c.observe_eligible(t0 + Duration::from_millis(60), 2_000));
    }

    #[test]
    fn out_of_sync_sample_resets_window() {
        let mut c = ConvergenceTracker::new(100_000, Duration::from_millis(50));
        let t0 = Instant::now();
        c.observe_eligible(t0, 2_000);
        c.observe_eligible(t0 + Duration::from_millis(60), 2_000);
        assert!(c.converged());
        c.observe_eligible(t0 + Duration::from_millis(70), 5_000_000);
        assert!(!c.converged());
    }

    #[test]
    fn freeze_does_not_reset_converged_state() {
        let mut c = ConvergenceTracker::new(100_000, Duration::from_millis(10));
        let t0 = Instant::now();
        c.observe_eligible(t0, 0);
        c.observe_eligible(t0 + Duration::from_millis(20), 0);
        assert!(c.converged());
        assert!(c.freeze());
    }
}
