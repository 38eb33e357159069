//! Next-Due Calculation

use std::str::FromStr;

use chrono::{DateTime, Duration, Utc};
use chrono_tz::Tz;
use cron::Schedule;
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// How a monitor's expected run times are derived
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ScheduleKind {
    /// Fixed interval in seconds, no calendar semantics
    Interval,
    /// Standard 5-field cron expression evaluated in the monitor's timezone
    Cron,
}

/// Schedule specification for a monitor
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ScheduleSpec {
    /// Schedule kind
    pub kind: ScheduleKind,
    /// Interval in seconds (INTERVAL only)
    pub interval_sec: Option<u64>,
    /// Cron expression (CRON only)
    pub cron_expr: Option<String>,
    /// IANA timezone name for cron evaluation
    #[serde(default = "default_timezone")]
    pub timezone: String,
}

fn default_timezone() -> String {
    "UTC".to_string()
}

impl ScheduleSpec {
    /// Build an interval spec
    pub fn interval(interval_sec: u64) -> Self {
        Self {
            kind: ScheduleKind::Interval,
            interval_sec: Some(interval_sec),
            cron_expr: None,
            timezone: default_timezone(),
        }
    }

    /// Build a cron spec
    pub fn cron(expr: impl Into<String>, timezone: impl Into<String>) -> Self {
        Self {
            kind: ScheduleKind::Cron,
            interval_sec: None,
            cron_expr: Some(expr.into()),
            timezone: timezone.into(),
        }
    }

    /// Validate the spec without computing an occurrence
    pub fn validate(&self) -> Result<(), InvalidScheduleError> {
        compute_next_due_at(self, Utc::now()).map(|_| ())
    }
}

/// Errors for malformed or incomplete schedule specs
#[derive(Debug, Error)]
pub enum InvalidScheduleError {
    #[error("interval_sec is required for INTERVAL schedules")]
    MissingInterval,
    #[error("interval_sec must be greater than zero")]
    ZeroInterval,
    #[error("cron_expr is required for CRON schedules")]
    MissingCronExpr,
    #[error("invalid cron expression {expr:?}: {source}")]
    BadCronExpr {
        expr: String,
        #[source]
        source: cron::error::Error,
    },
    #[error("unknown timezone {0:?}")]
    UnknownTimezone(String),
    #[error("cron expression {0:?} has no future occurrence")]
    NoFutureOccurrence(String),
}

/// Compute the next expected ping time strictly after `from`.
///
/// INTERVAL schedules are plain arithmetic. CRON schedules are evaluated in
/// the monitor's timezone; during a DST fall-back the ambiguous wall-clock
/// time maps to its first (earliest) occurrence.
pub fn compute_next_due_at(
    spec: &ScheduleSpec,
    from: DateTime<Utc>,
) -> Result<DateTime<Utc>, InvalidScheduleError> {
    match spec.kind {
        ScheduleKind::Interval => {
            let interval = spec.interval_sec.ok_or(InvalidScheduleError::MissingInterval)?;
            if interval == 0 {
                return Err(InvalidScheduleError::ZeroInterval);
            }
            Ok(from + Duration::seconds(interval as i64))
        }
        ScheduleKind::Cron => {
            let expr = spec
                .cron_expr
                .as_deref()
                .ok_or(InvalidScheduleError::MissingCronExpr)?;
            let tz: Tz = spec
                .timezone
                .parse()
                .map_err(|_| InvalidScheduleError::UnknownTimezone(spec.timezone.clone()))?;

            let normalized = normalize_cron(expr);
            let schedule = Schedule::from_str(&normalized).map_err(|source| {
                InvalidScheduleError::BadCronExpr {
                    expr: expr.to_string(),
                    source,
                }
            })?;

            let local_from = from.with_timezone(&tz);
            schedule
                .after(&local_from)
                .next()
                .map(|next| next.with_timezone(&Utc))
                .ok_or_else(|| InvalidScheduleError::NoFutureOccurrence(expr.to_string()))
        }
    }
}

/// True iff `now` is past the due time plus its grace period.
///
/// Zero grace makes any elapsed time past the due time late.
pub fn is_late(next_due_at: DateTime<Utc>, grace_sec: u32, now: DateTime<Utc>) -> bool {
    now > next_due_at + Duration::seconds(i64::from(grace_sec))
}

/// Normalize a standard 5-field cron expression to the 6-field form the
/// `cron` crate expects by prepending a `0` seconds field. 6-field input
/// passes through untouched.
fn normalize_cron(expr: &str) -> String {
    let trimmed = expr.trim();
    if trimmed.split_whitespace().count() == 5 {
        format!("0 {trimmed}")
    } else {
        trimmed.to_string()
    }
}
