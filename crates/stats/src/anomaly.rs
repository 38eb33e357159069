//! Anomaly Detection
//!
//! Pure functions over a statistics snapshot plus one new observation.
//! The caller decides what to do with a verdict; nothing here has side
//! effects.

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::welford::DurationStats;

/// Per-monitor anomaly thresholds.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AnomalyThresholds {
    /// Z-score above which a duration is anomalous; valid range [1, 10]
    pub z_score: f64,
    /// A duration above `median * multiplier` is anomalous; must exceed 1
    pub median_multiplier: f64,
    /// Output shrinking below `recent average * (1 - fraction)` is anomalous;
    /// valid range (0, 1)
    pub output_drop_fraction: f64,
}

impl Default for AnomalyThresholds {
    fn default() -> Self {
        Self {
            z_score: 3.0,
            median_multiplier: 1.5,
            output_drop_fraction: 0.7,
        }
    }
}

/// Out-of-range threshold configuration, rejected before any mutation.
#[derive(Debug, Error)]
pub enum ThresholdError {
    #[error("z_score threshold {0} outside [1, 10]")]
    ZScoreOutOfRange(f64),
    #[error("median_multiplier {0} must be greater than 1")]
    MedianMultiplierOutOfRange(f64),
    #[error("output_drop_fraction {0} outside (0, 1)")]
    OutputDropOutOfRange(f64),
}

impl AnomalyThresholds {
    /// Validate all threshold ranges.
    pub fn validate(&self) -> Result<(), ThresholdError> {
        if !(1.0..=10.0).contains(&self.z_score) {
            return Err(ThresholdError::ZScoreOutOfRange(self.z_score));
        }
        if self.median_multiplier <= 1.0 {
            return Err(ThresholdError::MedianMultiplierOutOfRange(
                self.median_multiplier,
            ));
        }
        if self.output_drop_fraction <= 0.0 || self.output_drop_fraction >= 1.0 {
            return Err(ThresholdError::OutputDropOutOfRange(
                self.output_drop_fraction,
            ));
        }
        Ok(())
    }
}

/// Why a verdict came out the way it did.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AnomalyReason {
    /// Observation within the expected range
    Normal,
    /// Fewer than two baseline samples
    InsufficientData,
    /// Duration z-score above threshold (or any deviation on zero spread)
    SlowDuration,
    /// Duration above the running median times the multiplier
    AboveMedian,
    /// Output size dropped below the recent-average floor
    OutputDropped,
}

/// Outcome of an anomaly check.
#[derive(Debug, Clone, PartialEq)]
pub struct Verdict {
    pub is_anomaly: bool,
    pub reason: AnomalyReason,
    /// Finite z-score when one exists; `None` on zero spread
    pub z_score: Option<f64>,
}

impl Verdict {
    fn normal() -> Self {
        Self {
            is_anomaly: false,
            reason: AnomalyReason::Normal,
            z_score: None,
        }
    }
}

/// Snapshot handed to the detector: the Welford accumulator plus the
/// recency-window aggregates, taken *before* folding in the new sample.
#[derive(Debug, Clone, Default)]
pub struct StatsSnapshot {
    pub duration: DurationStats,
    pub duration_median: Option<f64>,
    pub recent_output_mean: Option<f64>,
}

/// Check a run duration against the baseline.
///
/// The z-score and median signals are independent; either flags an anomaly
/// with its own reason (z-score wins when both fire).
pub fn detect_duration(
    snapshot: &StatsSnapshot,
    observed_ms: f64,
    thresholds: &AnomalyThresholds,
) -> Verdict {
    let stats = &snapshot.duration;
    if stats.count < 2 {
        return Verdict {
            is_anomaly: false,
            reason: AnomalyReason::InsufficientData,
            z_score: None,
        };
    }

    match stats.z_score(observed_ms) {
        Some(z) => {
            if z > thresholds.z_score {
                return Verdict {
                    is_anomaly: true,
                    reason: AnomalyReason::SlowDuration,
                    z_score: Some(z),
                };
            }
            if let Some(median) = snapshot.duration_median {
                if observed_ms > median * thresholds.median_multiplier {
                    return Verdict {
                        is_anomaly: true,
                        reason: AnomalyReason::AboveMedian,
                        z_score: Some(z),
                    };
                }
            }
            Verdict {
                z_score: Some(z),
                ..Verdict::normal()
            }
        }
        // Zero spread: the baseline never varied, so any deviation is
        // anomalous (infinite z-score).
        None => {
            if observed_ms != stats.mean {
                Verdict {
                    is_anomaly: true,
                    reason: AnomalyReason::SlowDuration,
                    z_score: None,
                }
            } else {
                Verdict::normal()
            }
        }
    }
}

/// Check an output size against the recent average.
pub fn detect_output_size(
    snapshot: &StatsSnapshot,
    observed_bytes: f64,
    thresholds: &AnomalyThresholds,
) -> Verdict {
    let Some(avg) = snapshot.recent_output_mean else {
        return Verdict {
            is_anomaly: false,
            reason: AnomalyReason::InsufficientData,
            z_score: None,
        };
    };
    if avg <= 0.0 {
        return Verdict::normal();
    }

    let floor = avg * (1.0 - thresholds.output_drop_fraction);
    if observed_bytes < floor {
        Verdict {
            is_anomaly: true,
            reason: AnomalyReason::OutputDropped,
            z_score: None,
        }
    } else {
        Verdict::normal()
    }
}
