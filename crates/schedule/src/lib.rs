//! Schedule Calculation
//!
//! Computes the next expected ping time for interval and cron monitors,
//! and classifies lateness against a grace period.

mod calc;

pub use calc::{compute_next_due_at, is_late, InvalidScheduleError, ScheduleKind, ScheduleSpec};
