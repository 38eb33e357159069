//! Welford's Online Algorithm
//!
//! Numerically stable running mean/variance without storing history.
//! Lifetime-cumulative by design: no decay or windowing, which trades
//! recency-sensitivity for restart-resilience.

use serde::{Deserialize, Serialize};

/// Streaming duration statistics for a single monitor.
///
/// Only successful run durations feed the accumulator; the caller owns that
/// filtering. Updates are a read-modify-write and must be serialized per
/// monitor by the storage layer.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct DurationStats {
    /// Number of recorded samples
    pub count: u64,
    /// Running mean
    pub mean: f64,
    /// Sum of squared differences from the running mean
    pub m2: f64,
    /// Smallest sample seen
    pub min: Option<f64>,
    /// Largest sample seen
    pub max: Option<f64>,
}

impl DurationStats {
    /// Fold one sample into the accumulator.
    pub fn record(&mut self, x: f64) {
        self.count += 1;
        let delta = x - self.mean;
        self.mean += delta / self.count as f64;
        let delta2 = x - self.mean;
        self.m2 += delta * delta2;

        self.min = Some(self.min.map_or(x, |m| m.min(x)));
        self.max = Some(self.max.map_or(x, |m| m.max(x)));
    }

    /// Sample variance `m2 / (count - 1)`; `None` until two samples exist.
    pub fn variance(&self) -> Option<f64> {
        if self.count > 1 {
            Some(self.m2 / (self.count - 1) as f64)
        } else {
            None
        }
    }

    /// Sample standard deviation.
    pub fn stddev(&self) -> Option<f64> {
        self.variance().map(f64::sqrt)
    }

    /// Z-score of an observation against the running distribution.
    ///
    /// `None` when fewer than two samples exist or the stddev is zero
    /// (a zero-spread baseline has no finite z-score).
    pub fn z_score(&self, observed: f64) -> Option<f64> {
        match self.stddev() {
            Some(sd) if sd > 0.0 => Some((observed - self.mean) / sd),
            _ => None,
        }
    }
}
