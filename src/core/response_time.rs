/// Adaptive response time estimation
///
/// The routing layer feeds batches of measured query latencies per backend;
/// the tracker keeps an exponential moving average whose reactivity adapts
/// to load. `sample_max` caps how much weight one batch can carry: a busy
/// server raises it so all servers stay comparable, a degrading server
/// halves it so new samples dominate quickly, and otherwise it decays
/// slowly back down.
use std::time::Duration;

/// Smallest weight a batch can have
const MIN_ALPHA: f64 = 0.04;
/// Additional weight scale for a full-sized batch
const MAX_ALPHA: f64 = 0.35;
/// Starting point for the adaptive batch-size cap
const DEFAULT_SAMPLE_MAX: i64 = 500;
/// Rate at which sample_max follows the observed batch sizes
const DRIFT: f64 = 1.1;

/// Exponential moving average of backend response time, in seconds
#[derive(Debug, Clone)]
pub struct ResponseTimeTracker {
    average: f64,
    sample_max: i64,
    num_samples: u64,
}

impl ResponseTimeTracker {
    pub fn new() -> Self {
        Self::with_sample_max(DEFAULT_SAMPLE_MAX)
    }

    pub fn with_sample_max(sample_max: i64) -> Self {
        Self {
            average: 0.0,
            sample_max: sample_max.max(1),
            num_samples: 0,
        }
    }

    /// Current estimate in seconds, 0.0 before any samples
    pub fn average(&self) -> f64 {
        self.average
    }

    /// Current estimate as a duration, None before any samples
    pub fn average_duration(&self) -> Option<Duration> {
        if self.num_samples == 0 {
            None
        } else {
            Some(Duration::from_secs_f64(self.average.max(0.0)))
        }
    }

    pub fn sample_max(&self) -> i64 {
        self.sample_max
    }

    pub fn num_samples(&self) -> u64 {
        self.num_samples
    }

    pub fn set_sample_max(&mut self, sample_max: i64) {
        self.sample_max = sample_max.max(1);
    }

    /// Fold one batch into the average, weighted by batch size
    pub fn add(&mut self, average: f64, num_samples: i64) {
        if num_samples <= 0 {
            return;
        }

        let capped = num_samples.min(self.sample_max) as f64;
        let alpha = MIN_ALPHA + MAX_ALPHA * capped / self.sample_max as f64;

        if self.num_samples == 0 {
            self.average = average;
        } else {
            self.average = alpha * average + (1.0 - alpha) * self.average;
        }
        self.num_samples += num_samples as u64;
    }

    /// Adapt `sample_max` to the batch, then fold the batch in.
    ///
    /// A batch at or above the cap raises it proportionally so heavily
    /// loaded servers keep comparable weights. An incoming average more
    /// than twice the current estimate means the server is degrading:
    /// halve the cap so the new reality takes hold fast. Otherwise the cap
    /// trickles down towards real batch sizes.
    pub fn observe(&mut self, average: f64, num_samples: i64) {
        if num_samples <= 0 {
            return;
        }

        let current_max = self.sample_max;
        let new_max = if num_samples >= current_max {
            (num_samples as f64 * DRIFT) as i64
        } else if self.average > 0.0 && average / self.average > 2.0 {
            (current_max as f64 * 0.5) as i64
        } else {
            (current_max as f64 / DRIFT) as i64
        };

        self.set_sample_max(new_max);
        self.add(average, num_samples);
    }
}

impl Default for ResponseTimeTracker {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_first_batch_sets_average() {
        let mut tracker = ResponseTimeTracker::new();
        assert!(tracker.average_duration().is_none());

        tracker.observe(0.025, 10);
        assert!((tracker.average() - 0.025).abs() < 1e-9);
        assert_eq!(tracker.num_samples(), 10);
        assert!(tracker.average_duration().is_some());
    }

    #[test]
    fn test_large_batch_raises_sample_max() {
        let mut tracker = ResponseTimeTracker::new();
        let before = tracker.sample_max();

        tracker.observe(0.01, before);
        assert!(tracker.sample_max() > before);
        assert_eq!(tracker.sample_max(), (before as f64 * 1.1) as i64);
    }

    #[test]
    fn test_degradation_halves_sample_max() {
        let mut tracker = ResponseTimeTracker::new();
        tracker.observe(0.010, 100);
        let before = tracker.sample_max();

        // More than double the current estimate: the server got slower
        tracker.observe(0.050, 100);
        assert!(tracker.sample_max() < before);
        assert_eq!(tracker.sample_max(), before / 2);
    }

    #[test]
    fn test_steady_state_decays_sample_max() {
        let mut tracker = ResponseTimeTracker::new();
        tracker.observe(0.010, 50);
        let before = tracker.sample_max();

        tracker.observe(0.011, 50);
        let after = tracker.sample_max();
        assert!(after < before);
        assert_eq!(after, (before as f64 / 1.1) as i64);
    }

    #[test]
    fn test_sample_max_never_reaches_zero() {
        let mut tracker = ResponseTimeTracker::with_sample_max(1);
        for _ in 0..50 {
            tracker.observe(0.5, 1);
            tracker.observe(0.001, 1);
            assert!(tracker.sample_max() >= 1);
        }
    }

    #[test]
    fn test_heavier_batches_move_average_more() {
        let mut small = ResponseTimeTracker::new();
        small.add(0.010, 1);
        small.add(0.100, 1);

        let mut big = ResponseTimeTracker::new();
        big.add(0.010, 1);
        big.add(0.100, 400);

        assert!(big.average() > small.average());
    }

    #[test]
    fn test_empty_batch_ignored() {
        let mut tracker = ResponseTimeTracker::new();
        tracker.observe(1.0, 0);
        assert_eq!(tracker.num_samples(), 0);
        assert!(tracker.average_duration().is_none());
    }
}
