//! Domain Model

use std::collections::HashMap;
use std::fmt;

use chrono::{DateTime, Utc};
use schedule::ScheduleSpec;
use serde::{Deserialize, Serialize};
use stats::{AnomalyThresholds, DurationStats, RecentWindow, StatsSnapshot};
use uuid::Uuid;

/// Capacity of the recent-duration window backing the running median.
const DURATION_WINDOW: usize = 50;
/// Capacity of the recent-output-size window backing the drop signal.
const OUTPUT_WINDOW: usize = 7;

/// Lifecycle status of a monitor
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum MonitorStatus {
    Ok,
    Late,
    Missed,
    Failing,
    Disabled,
}

/// Outcome of a single execution
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum RunOutcome {
    Started,
    Success,
    Fail,
    Late,
    Missed,
    Timeout,
}

/// Incident lifecycle state
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum IncidentStatus {
    Open,
    Acked,
    Resolved,
}

/// What condition an incident tracks
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum IncidentKind {
    Missed,
    Late,
    Fail,
    Anomaly,
}

impl fmt::Display for IncidentKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Missed => write!(f, "MISSED"),
            Self::Late => write!(f, "LATE"),
            Self::Fail => write!(f, "FAIL"),
            Self::Anomaly => write!(f, "ANOMALY"),
        }
    }
}

/// A monitored scheduled job
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Monitor {
    pub id: Uuid,
    pub org_id: Uuid,
    pub name: String,
    /// Ping routing key
    pub token: String,
    pub schedule: ScheduleSpec,
    /// Tolerance window after the due time, seconds
    pub grace_sec: u32,
    /// Started runs older than this are finalized as TIMEOUT by the scanner
    pub timeout_sec: Option<u32>,
    pub status: MonitorStatus,
    pub next_due_at: Option<DateTime<Utc>>,
    pub last_run_at: Option<DateTime<Utc>>,
    pub last_duration_ms: Option<u64>,
    pub last_exit_code: Option<i32>,
    /// Welford accumulator over SUCCESS durations
    pub duration_stats: DurationStats,
    /// Last 50 SUCCESS durations, source of the running median
    pub recent_durations: RecentWindow,
    /// Last 7 output sizes, source of the drop signal
    pub recent_output_bytes: RecentWindow,
    pub thresholds: AnomalyThresholds,
    pub created_at: DateTime<Utc>,
}

impl Monitor {
    /// Create a monitor in OK state with empty statistics.
    pub fn new(
        org_id: Uuid,
        name: impl Into<String>,
        token: impl Into<String>,
        schedule: ScheduleSpec,
        grace_sec: u32,
    ) -> Self {
        Self {
            id: Uuid::new_v4(),
            org_id,
            name: name.into(),
            token: token.into(),
            schedule,
            grace_sec,
            timeout_sec: None,
            status: MonitorStatus::Ok,
            next_due_at: None,
            last_run_at: None,
            last_duration_ms: None,
            last_exit_code: None,
            duration_stats: DurationStats::default(),
            recent_durations: RecentWindow::new(DURATION_WINDOW),
            recent_output_bytes: RecentWindow::new(OUTPUT_WINDOW),
            thresholds: AnomalyThresholds::default(),
            created_at: Utc::now(),
        }
    }

    /// Snapshot handed to the anomaly detector.
    pub fn stats_snapshot(&self) -> StatsSnapshot {
        StatsSnapshot {
            duration: self.duration_stats.clone(),
            duration_median: self.recent_durations.median(),
            recent_output_mean: self.recent_output_bytes.mean(),
        }
    }
}

/// Immutable execution record
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Run {
    pub id: Uuid,
    pub monitor_id: Uuid,
    pub outcome: RunOutcome,
    pub started_at: DateTime<Utc>,
    pub finished_at: Option<DateTime<Utc>>,
    pub duration_ms: Option<u64>,
    pub exit_code: Option<i32>,
    /// Object-storage key for captured output, if any
    pub output_key: Option<String>,
    pub output_bytes: Option<u64>,
}

impl Run {
    /// A run that has only reported its start ping.
    pub fn started(monitor_id: Uuid, started_at: DateTime<Utc>) -> Self {
        Self {
            id: Uuid::new_v4(),
            monitor_id,
            outcome: RunOutcome::Started,
            started_at,
            finished_at: None,
            duration_ms: None,
            exit_code: None,
            output_key: None,
            output_bytes: None,
        }
    }
}

/// Stable identifier of a detected condition occurrence.
///
/// Re-detection of the same occurrence must hash identically, so the
/// identifier is the missed due-timestamp or the offending run id.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Occurrence {
    DueAt(DateTime<Utc>),
    Run(Uuid),
}

impl fmt::Display for Occurrence {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::DueAt(ts) => write!(f, "due:{}", ts.to_rfc3339()),
            Self::Run(id) => write!(f, "run:{id}"),
        }
    }
}

/// A detected condition emitted into the work queue
#[derive(Debug, Clone)]
pub struct Detection {
    pub monitor_id: Uuid,
    pub kind: IncidentKind,
    pub occurrence: Occurrence,
    pub summary: String,
    pub details: Option<String>,
}

/// Incident state transitions that fan out to channels
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum IncidentTransition {
    Opened,
    Acknowledged,
    Resolved,
}

impl fmt::Display for IncidentTransition {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Opened => write!(f, "opened"),
            Self::Acknowledged => write!(f, "acknowledged"),
            Self::Resolved => write!(f, "resolved"),
        }
    }
}

/// Unit of work on the shared pipeline queue
#[derive(Debug, Clone)]
pub enum WorkItem {
    /// A detector output needing incident creation
    Detection(Detection),
    /// An already-applied transition needing notification fan-out
    Transition {
        incident_id: Uuid,
        transition: IncidentTransition,
    },
}

/// An open, acknowledged, or resolved problem on a monitor
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Incident {
    pub id: Uuid,
    pub monitor_id: Uuid,
    pub kind: IncidentKind,
    pub status: IncidentStatus,
    pub summary: String,
    pub details: Option<String>,
    /// Deterministic fingerprint of (monitor, kind, occurrence)
    pub dedupe_hash: String,
    pub opened_at: DateTime<Utc>,
    pub acknowledged_at: Option<DateTime<Utc>>,
    pub resolved_at: Option<DateTime<Utc>>,
    /// Alerts are withheld while `now` is before this
    pub suppress_until: Option<DateTime<Utc>>,
    /// Root-message identifier for threading-capable channels
    pub thread_key: Option<String>,
}

/// Append-only audit entry attached to an incident
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IncidentEvent {
    pub id: Uuid,
    pub incident_id: Uuid,
    pub event_type: IncidentEventType,
    pub message: String,
    /// Who caused the transition; `system` for automatic resolution
    pub actor: String,
    pub at: DateTime<Utc>,
}

/// Kinds of audit entries
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum IncidentEventType {
    Opened,
    Acknowledged,
    Resolved,
    Snoozed,
    Unsnoozed,
}

/// Planned downtime during which alerts are withheld
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MaintenanceWindow {
    pub id: Uuid,
    pub org_id: Uuid,
    /// `None` means the window applies org-wide
    pub monitor_id: Option<Uuid>,
    pub starts_at: DateTime<Utc>,
    pub ends_at: DateTime<Utc>,
    pub enabled: bool,
}

impl MaintenanceWindow {
    /// Whether this window suppresses alerts for `monitor` at `now`.
    pub fn covers(&self, monitor: &Monitor, now: DateTime<Utc>) -> bool {
        self.enabled
            && self.org_id == monitor.org_id
            && self.monitor_id.map_or(true, |id| id == monitor.id)
            && self.starts_at <= now
            && now <= self.ends_at
    }
}

/// Per-channel configuration, tagged by channel type.
///
/// Adapters resolve this with exhaustive matching; an unknown type cannot
/// exist past deserialization.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ChannelConfig {
    Webhook {
        url: String,
        #[serde(default)]
        headers: HashMap<String, String>,
    },
    Slack {
        token: String,
        channel: String,
        /// Override for tests; defaults to the public Slack API
        #[serde(default)]
        api_url: Option<String>,
    },
}

/// A configured notification destination
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AlertChannel {
    pub id: Uuid,
    pub org_id: Uuid,
    pub name: String,
    pub config: ChannelConfig,
}

/// Delivery ledger entry for one (incident, transition, channel) key
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AlertDelivery {
    pub incident_id: Uuid,
    pub channel_id: Uuid,
    pub transition: IncidentTransition,
    pub attempts: u32,
    pub delivered: bool,
    pub last_error: Option<String>,
    pub updated_at: DateTime<Utc>,
}
