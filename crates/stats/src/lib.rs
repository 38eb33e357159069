//! Run Statistics
//!
//! Streaming mean/variance via Welford's online algorithm, bounded recency
//! windows for the running median and output sizes, and the pure anomaly
//! detector that consumes their snapshots.

mod anomaly;
mod welford;
mod window;

pub use anomaly::{
    detect_duration, detect_output_size, AnomalyReason, AnomalyThresholds, StatsSnapshot,
    ThresholdError, Verdict,
};
pub use welford::DurationStats;
pub use window::RecentWindow;
