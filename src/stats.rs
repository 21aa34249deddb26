//! Running one-way delay statistics for the final summary.
//!
//! [`DelayStats`] accumulates min/mean/max/stddev of per-packet delay plus a
//! smoothed jitter estimate.  Values feed the operator summary printed at the
//! end of a run; they are never persisted to the row log (the offline joiner
//! recomputes statistics from the raw rows).
//!
//! Jitter follows the RFC 3550 recurrence over consecutive delay deltas:
//! `J += (|D| - J) / 16`.

/// Accumulated delay statistics for one receive loop.
///
/// Delay may be negative when the endpoint clocks are not synchronised; all
/// statistics are defined over the raw signed values.
#[derive(Debug, Clone, Default)]
pub struct DelayStats {
    count: u64,
    sum: f64,
    sum_sq: f64,
    min: f64,
    max: f64,
    jitter: f64,
    last_delay: Option<f64>,
}

impl DelayStats {
    pub fn new() -> Self {
        Self::default()
    }

    /// Fold one delay sample, in seconds, into the running statistics.
    pub fn record(&mut self, delay: f64) {
        if self.count == 0 {
            self.min = delay;
            self.max = delay;
        } else {
            self.min = self.min.min(delay);
            self.max = self.max.max(delay);
        }
        self.count += 1;
        self.sum += delay;
        self.sum_sq += delay * delay;
        if let Some(prev) = self.last_delay {
            let delta = (delay - prev).abs();
            self.jitter += (delta - self.jitter) / 16.0;
        }
        self.last_delay = Some(delay);
    }

    #[inline]
    pub fn count(&self) -> u64 {
        self.count
    }

    /// Smallest delay seen, or `None` before the first sample.
    pub fn min(&self) -> Option<f64> {
        (self.count > 0).then_some(self.min)
    }

    /// Largest delay seen, or `None` before the first sample.
    pub fn max(&self) -> Option<f64> {
        (self.count > 0).then_some(self.max)
    }

    pub fn mean(&self) -> Option<f64> {
        (self.count > 0).then(|| self.sum / self.count as f64)
    }

    /// Population standard deviation, or `None` before the first sample.
    pub fn stddev(&self) -> Option<f64> {
        if self.count == 0 {
            return None;
        }
        let n = self.count as f64;
        let mean = self.sum / n;
        // Clamp the tiny negatives that float cancellation can produce.
        let variance = (self.sum_sq / n - mean * mean).max(0.0);
        Some(variance.sqrt())
    }

    /// Smoothed inter-packet jitter estimate in seconds.
    ///
    /// Zero until two samples have arrived.
    #[inline]
    pub fn jitter(&self) -> f64 {
        self.jitter
    }
}

// ---------------------------------------------------------------------------
// Unit tests
// ---------------------------------------------------------------------------
