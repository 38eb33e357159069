//! Ping Processing Implementation

use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use incident::{IncidentError, IncidentManager};
use schedule::{compute_next_due_at, is_late, InvalidScheduleError};
use stats::{detect_duration, detect_output_size, AnomalyReason, Verdict};
use store::{
    Detection, IncidentKind, IncidentTransition, MonitorStatus, Occurrence, Repository, Run,
    RunOutcome, StorageError, WorkItem,
};

/// What a ping claims happened
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PingState {
    Start,
    #[default]
    Success,
    Fail,
}

/// One inbound ping, already parsed off the wire
#[derive(Debug, Clone, Default)]
pub struct PingEvent {
    pub state: PingState,
    /// Caller-reported duration; falls back to start-ping elapsed time
    pub duration_ms: Option<u64>,
    pub exit_code: Option<i32>,
    /// Size of any captured output body
    pub output_bytes: Option<u64>,
}

/// Acknowledgement returned to the pinging job
#[derive(Debug, Clone, Serialize)]
pub struct PingAck {
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub next_due_at: Option<DateTime<Utc>>,
}

/// Ingestion failures, mapped to HTTP statuses at the edge
#[derive(Debug, Error)]
pub enum IngestError {
    #[error("no monitor matches the token")]
    UnknownToken,
    #[error("monitor is disabled")]
    MonitorDisabled,
    #[error(transparent)]
    Storage(#[from] StorageError),
    #[error(transparent)]
    Schedule(#[from] InvalidScheduleError),
    #[error(transparent)]
    Incident(#[from] IncidentError),
}

/// Drives a ping through run recording, schedule advance, statistics, and
/// detection emission.
///
/// Anomaly and failure detections are enqueued, never handled inline, so a
/// slow alert channel cannot delay the ping response.
pub struct PingProcessor {
    repo: Arc<Repository>,
    incidents: IncidentManager,
    queue: mpsc::Sender<WorkItem>,
}

impl PingProcessor {
    pub fn new(
        repo: Arc<Repository>,
        incidents: IncidentManager,
        queue: mpsc::Sender<WorkItem>,
    ) -> Self {
        Self {
            repo,
            incidents,
            queue,
        }
    }

    /// Handle one ping for `token` at an explicit `now`.
    pub async fn handle(
        &self,
        token: &str,
        event: PingEvent,
        now: DateTime<Utc>,
    ) -> Result<PingAck, IngestError> {
        let monitor = self
            .repo
            .monitor_by_token(token)?
            .ok_or(IngestError::UnknownToken)?;
        if monitor.status == MonitorStatus::Disabled {
            return Err(IngestError::MonitorDisabled);
        }

        if event.state == PingState::Start {
            self.repo.insert_run(Run::started(monitor.id, now))?;
            debug!(monitor_id = %monitor.id, "start ping recorded");
            return Ok(PingAck {
                message: "start ping recorded".to_string(),
                next_due_at: monitor.next_due_at,
            });
        }

        // Completion ping: finalize the open STARTED run or record a
        // standalone one.
        let started = self.repo.open_started_run(monitor.id)?;
        let duration_ms = event.duration_ms.or_else(|| {
            started
                .as_ref()
                .map(|r| (now - r.started_at).num_milliseconds().max(0) as u64)
        });
        let success = event.state == PingState::Success;
        let exit_code = event
            .exit_code
            .unwrap_or(if success { 0 } else { 1 });

        // A completion past the grace cutoff is recorded as LATE whatever
        // the ping claimed.
        let late_due = monitor
            .next_due_at
            .filter(|due| is_late(*due, monitor.grace_sec, now));
        let late = late_due.is_some();
        let outcome = if late {
            RunOutcome::Late
        } else if success {
            RunOutcome::Success
        } else {
            RunOutcome::Fail
        };

        let run = match started {
            Some(run) => self.repo.update_run(run.id, |r| {
                r.outcome = outcome;
                r.finished_at = Some(now);
                r.duration_ms = duration_ms;
                r.exit_code = Some(exit_code);
                r.output_bytes = event.output_bytes;
            })?,
            None => {
                let run = Run {
                    id: uuid::Uuid::new_v4(),
                    monitor_id: monitor.id,
                    outcome,
                    started_at: now,
                    finished_at: Some(now),
                    duration_ms,
                    exit_code: Some(exit_code),
                    output_key: None,
                    output_bytes: event.output_bytes,
                };
                self.repo.insert_run(run.clone())?;
                run
            }
        };

        let next_due_at = compute_next_due_at(&monitor.schedule, now)?;
        let status = if success {
            if late {
                MonitorStatus::Late
            } else {
                MonitorStatus::Ok
            }
        } else {
            MonitorStatus::Failing
        };

        // The detector sees the baseline as it was before this sample.
        let snapshot = monitor.stats_snapshot();

        self.repo.update_monitor(monitor.id, |m| {
            m.status = status;
            m.last_run_at = Some(now);
            m.last_duration_ms = duration_ms;
            m.last_exit_code = Some(exit_code);
            m.next_due_at = Some(next_due_at);
            if success {
                if let Some(d) = duration_ms.filter(|d| *d > 0) {
                    m.duration_stats.record(d as f64);
                    m.recent_durations.push(d as f64);
                }
                if let Some(bytes) = event.output_bytes {
                    m.recent_output_bytes.push(bytes as f64);
                }
            }
        })?;

        if success && !late {
            // The run clears every open condition on this monitor.
            for resolved in self.incidents.resolve_open_for_monitor(monitor.id, now)? {
                info!(incident_id = %resolved.id, "auto-resolved by success ping");
                self.enqueue(WorkItem::Transition {
                    incident_id: resolved.id,
                    transition: IncidentTransition::Resolved,
                })
                .await;
            }
        } else if !success {
            self.enqueue(WorkItem::Detection(Detection {
                monitor_id: monitor.id,
                kind: IncidentKind::Fail,
                occurrence: Occurrence::Run(run.id),
                summary: format!("{} failed with exit code {exit_code}", monitor.name),
                details: None,
            }))
            .await;
        } else if let Some(due) = late_due {
            // Keyed by the due time the run was judged against, so a sweep
            // that already flagged this occurrence collapses into the same
            // incident.
            let late_by = (now - due).num_seconds() - i64::from(monitor.grace_sec);
            self.enqueue(WorkItem::Detection(Detection {
                monitor_id: monitor.id,
                kind: IncidentKind::Late,
                occurrence: Occurrence::DueAt(due),
                summary: format!("{} completed but was late by {late_by}s", monitor.name),
                details: None,
            }))
            .await;
        }

        if success && !late {
            self.check_anomalies(&monitor, &run, &snapshot).await;
        }

        Ok(PingAck {
            message: format!("{outcome:?} ping recorded").to_lowercase(),
            next_due_at: Some(next_due_at),
        })
    }

    /// Compare this run against the pre-update baseline and emit an
    /// ANOMALY detection when any signal fires.
    async fn check_anomalies(
        &self,
        monitor: &store::Monitor,
        run: &Run,
        snapshot: &stats::StatsSnapshot,
    ) {
        let mut verdicts: Vec<Verdict> = Vec::new();
        if let Some(d) = run.duration_ms {
            verdicts.push(detect_duration(snapshot, d as f64, &monitor.thresholds));
        }
        if let Some(bytes) = run.output_bytes {
            verdicts.push(detect_output_size(
                snapshot,
                bytes as f64,
                &monitor.thresholds,
            ));
        }

        let fired: Vec<&Verdict> = verdicts.iter().filter(|v| v.is_anomaly).collect();
        if fired.is_empty() {
            return;
        }

        let reasons: Vec<&str> = fired.iter().map(|v| reason_label(v.reason)).collect();
        debug!(monitor_id = %monitor.id, run_id = %run.id, ?reasons, "anomaly detected");
        self.enqueue(WorkItem::Detection(Detection {
            monitor_id: monitor.id,
            kind: IncidentKind::Anomaly,
            occurrence: Occurrence::Run(run.id),
            summary: format!("{} run looks anomalous: {}", monitor.name, reasons.join(", ")),
            details: fired
                .iter()
                .find_map(|v| v.z_score)
                .map(|z| format!("z-score {z:.2}")),
        }))
        .await;
    }

    /// Enqueue without awaiting downstream; only a full queue blocks.
    async fn enqueue(&self, item: WorkItem) {
        if let Err(mpsc::error::TrySendError::Full(item)) = self.queue.try_send(item) {
            debug!("work queue full, awaiting capacity");
            if self.queue.send(item).await.is_err() {
                warn!("work queue closed, dropping work item");
            }
        }
    }
}

fn reason_label(reason: AnomalyReason) -> &'static str {
    match reason {
        AnomalyReason::Normal => "normal",
        AnomalyReason::InsufficientData => "insufficient data",
        AnomalyReason::SlowDuration => "slow duration",
        AnomalyReason::AboveMedian => "above median",
        AnomalyReason::OutputDropped => "output dropped",
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;
    use schedule::ScheduleSpec;
    use store::{IncidentStatus, Monitor};
    use uuid::Uuid;

    fn setup() -> (Arc<Repository>, PingProcessor, mpsc::Receiver<WorkItem>) {
        let repo = Arc::new(Repository::new());
        let (tx, rx) = mpsc::channel(16);
        let processor = PingProcessor::new(
            Arc::clone(&repo),
            IncidentManager::new(Arc::clone(&repo)),
            tx,
        );
        (repo, processor, rx)
    }

    fn monitor(repo: &Repository, now: DateTime<Utc>) -> Monitor {
        let mut m = Monitor::new(
            Uuid::new_v4(),
            "nightly-backup",
            "tok-123",
            ScheduleSpec::interval(3600),
            300,
        );
        m.next_due_at = Some(now + Duration::minutes(30));
        repo.insert_monitor(m.clone()).unwrap();
        m
    }

    fn success(duration_ms: u64) -> PingEvent {
        PingEvent {
            state: PingState::Success,
            duration_ms: Some(duration_ms),
            ..PingEvent::default()
        }
    }

    #[tokio::test]
    async fn test_unknown_token_is_rejected() {
        let (_repo, p, _rx) = setup();
        let err = p.handle("nope", PingEvent::default(), Utc::now()).await;
        assert!(matches!(err, Err(IngestError::UnknownToken)));
    }

    #[tokio::test]
    async fn test_disabled_monitor_is_rejected() {
        let (repo, p, _rx) = setup();
        let now = Utc::now();
        let m = monitor(&repo, now);
        repo.update_monitor(m.id, |m| m.status = MonitorStatus::Disabled)
            .unwrap();

        let err = p.handle("tok-123", PingEvent::default(), now).await;
        assert!(matches!(err, Err(IngestError::MonitorDisabled)));
    }

    #[tokio::test]
    async fn test_start_ping_records_a_started_run() {
        let (repo, p, _rx) = setup();
        let now = Utc::now();
        let m = monitor(&repo, now);

        let event = PingEvent {
            state: PingState::Start,
            ..PingEvent::default()
        };
        p.handle("tok-123", event, now).await.unwrap();

        let run = repo.open_started_run(m.id).unwrap().unwrap();
        assert_eq!(run.outcome, RunOutcome::Started);
        // Schedule does not advance on a start ping.
        assert_eq!(repo.monitor(m.id).unwrap().next_due_at, m.next_due_at);
    }

    #[tokio::test]
    async fn test_success_finalizes_open_started_run() {
        let (repo, p, _rx) = setup();
        let now = Utc::now();
        let m = monitor(&repo, now);
        let started_at = now - Duration::seconds(42);
        repo.insert_run(Run::started(m.id, started_at)).unwrap();

        let ack = p
            .handle("tok-123", PingEvent::default(), now)
            .await
            .unwrap();

        let runs = repo.recent_runs(m.id, 10).unwrap();
        assert_eq!(runs.len(), 1);
        assert_eq!(runs[0].outcome, RunOutcome::Success);
        // Duration falls back to elapsed time since the start ping.
        assert_eq!(runs[0].duration_ms, Some(42_000));
        assert_eq!(runs[0].exit_code, Some(0));
        assert_eq!(ack.next_due_at, Some(now + Duration::seconds(3600)));

        let updated = repo.monitor(m.id).unwrap();
        assert_eq!(updated.status, MonitorStatus::Ok);
        assert_eq!(updated.last_duration_ms, Some(42_000));
        assert_eq!(updated.duration_stats.count, 1);
    }

    #[tokio::test]
    async fn test_success_without_start_creates_a_run() {
        let (repo, p, _rx) = setup();
        let now = Utc::now();
        let m = monitor(&repo, now);

        p.handle("tok-123", success(1500), now).await.unwrap();

        let runs = repo.recent_runs(m.id, 10).unwrap();
        assert_eq!(runs.len(), 1);
        assert_eq!(runs[0].outcome, RunOutcome::Success);
        assert_eq!(runs[0].duration_ms, Some(1500));
    }

    #[tokio::test]
    async fn test_fail_ping_opens_fail_detection() {
        let (repo, p, mut rx) = setup();
        let now = Utc::now();
        let m = monitor(&repo, now);

        let event = PingEvent {
            state: PingState::Fail,
            exit_code: Some(7),
            ..PingEvent::default()
        };
        p.handle("tok-123", event, now).await.unwrap();

        assert_eq!(repo.monitor(m.id).unwrap().status, MonitorStatus::Failing);
        match rx.try_recv().unwrap() {
            WorkItem::Detection(d) => {
                assert_eq!(d.kind, IncidentKind::Fail);
                assert!(d.summary.contains("exit code 7"));
            }
            other => panic!("unexpected item: {other:?}"),
        }
        // No stats from a failed run.
        assert_eq!(repo.monitor(m.id).unwrap().duration_stats.count, 0);
    }

    #[tokio::test]
    async fn test_late_completion_overrides_outcome() {
        let (repo, p, mut rx) = setup();
        let now = Utc::now();
        let mut m = Monitor::new(
            Uuid::new_v4(),
            "nightly-backup",
            "tok-123",
            ScheduleSpec::interval(3600),
            300,
        );
        // Due an hour ago; this completion is well past grace.
        m.next_due_at = Some(now - Duration::hours(1));
        repo.insert_monitor(m.clone()).unwrap();

        p.handle("tok-123", success(1000), now).await.unwrap();

        let runs = repo.recent_runs(m.id, 10).unwrap();
        assert_eq!(runs[0].outcome, RunOutcome::Late);
        assert_eq!(repo.monitor(m.id).unwrap().status, MonitorStatus::Late);
        match rx.try_recv().unwrap() {
            WorkItem::Detection(d) => {
                assert_eq!(d.kind, IncidentKind::Late);
                assert!(d.summary.contains("late by 3300s"));
                // Keyed by the missed due time, not the run.
                assert_eq!(d.occurrence, Occurrence::DueAt(m.next_due_at.unwrap()));
            }
            other => panic!("unexpected item: {other:?}"),
        }
        // A late success still feeds the duration baseline.
        assert_eq!(repo.monitor(m.id).unwrap().duration_stats.count, 1);
    }

    #[tokio::test]
    async fn test_late_ping_collapses_into_a_sweep_incident() {
        let (repo, p, mut rx) = setup();
        let now = Utc::now();
        let mut m = Monitor::new(
            Uuid::new_v4(),
            "nightly-backup",
            "tok-123",
            ScheduleSpec::interval(3600),
            300,
        );
        let due = now - Duration::hours(1);
        m.next_due_at = Some(due);
        repo.insert_monitor(m.clone()).unwrap();

        // A sweep already flagged this occurrence before the ping landed.
        let manager = IncidentManager::new(Arc::clone(&repo));
        let sweep_detection = Detection {
            monitor_id: m.id,
            kind: IncidentKind::Late,
            occurrence: Occurrence::DueAt(due),
            summary: "started but did not finish".to_string(),
            details: None,
        };
        assert!(manager.open(&sweep_detection, now).unwrap().created);

        p.handle("tok-123", success(1000), now).await.unwrap();
        match rx.try_recv().unwrap() {
            WorkItem::Detection(d) => {
                assert!(!manager.open(&d, now).unwrap().created);
            }
            other => panic!("unexpected item: {other:?}"),
        }
        assert_eq!(repo.open_incidents(m.id).unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_success_auto_resolves_open_incidents() {
        let (repo, p, mut rx) = setup();
        let now = Utc::now();
        let m = monitor(&repo, now);

        let manager = IncidentManager::new(Arc::clone(&repo));
        let opened = manager
            .open(
                &Detection {
                    monitor_id: m.id,
                    kind: IncidentKind::Missed,
                    occurrence: Occurrence::DueAt(now - Duration::hours(2)),
                    summary: "missed".to_string(),
                    details: None,
                },
                now - Duration::hours(1),
            )
            .unwrap();

        p.handle("tok-123", success(1000), now).await.unwrap();

        let incident = repo.incident(opened.incident.id).unwrap();
        assert_eq!(incident.status, IncidentStatus::Resolved);
        match rx.try_recv().unwrap() {
            WorkItem::Transition {
                incident_id,
                transition,
            } => {
                assert_eq!(incident_id, opened.incident.id);
                assert_eq!(transition, IncidentTransition::Resolved);
            }
            other => panic!("unexpected item: {other:?}"),
        }
        // The system actor wrote the RESOLVED event.
        let events = repo.events_for(opened.incident.id).unwrap();
        assert!(events
            .iter()
            .any(|e| e.event_type == store::IncidentEventType::Resolved && e.actor == "system"));
    }

    #[tokio::test]
    async fn test_slow_run_emits_anomaly_detection() {
        let (repo, p, mut rx) = setup();
        let now = Utc::now();
        let m = monitor(&repo, now);
        // Baseline: mean 1000ms, stddev 100ms.
        repo.update_monitor(m.id, |m| {
            m.duration_stats.count = 10;
            m.duration_stats.mean = 1000.0;
            m.duration_stats.m2 = 90_000.0;
            for _ in 0..10 {
                m.recent_durations.push(1000.0);
            }
        })
        .unwrap();

        p.handle("tok-123", success(1400), now).await.unwrap();

        match rx.try_recv().unwrap() {
            WorkItem::Detection(d) => {
                assert_eq!(d.kind, IncidentKind::Anomaly);
                assert!(d.summary.contains("slow duration"));
            }
            other => panic!("unexpected item: {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_normal_run_emits_nothing() {
        let (repo, p, mut rx) = setup();
        let now = Utc::now();
        let m = monitor(&repo, now);
        repo.update_monitor(m.id, |m| {
            m.duration_stats.count = 10;
            m.duration_stats.mean = 1000.0;
            m.duration_stats.m2 = 90_000.0;
            for _ in 0..10 {
                m.recent_durations.push(1000.0);
            }
        })
        .unwrap();

        p.handle("tok-123", success(1100), now).await.unwrap();
        assert!(rx.try_recv().is_err());
    }
}
