//! Sweep Loop Implementation

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Duration as ChronoDuration, Utc};
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use schedule::{compute_next_due_at, is_late};
use store::{
    Detection, IncidentKind, Monitor, Occurrence, Repository, Run, RunOutcome, StorageError,
    WorkItem,
};

/// Sweep cadence and queue behavior
#[derive(Debug, Clone)]
pub struct ScannerConfig {
    /// Time between sweeps
    pub sweep_interval: Duration,
}

impl Default for ScannerConfig {
    fn default() -> Self {
        Self {
            sweep_interval: Duration::from_secs(60),
        }
    }
}

/// Counters from one pass over the monitor table
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SweepSummary {
    pub scanned: usize,
    pub timed_out: usize,
    pub late: usize,
    pub missed: usize,
}

/// Turns monitor silence into MISSED/LATE detections.
///
/// The scanner is stateless between sweeps and not deduplication-aware; the
/// same overdue occurrence is re-emitted every pass until a ping or an
/// operator clears it.
pub struct MissedRunScanner {
    repo: Arc<Repository>,
    queue: mpsc::Sender<WorkItem>,
    config: ScannerConfig,
}

impl MissedRunScanner {
    pub fn new(
        repo: Arc<Repository>,
        queue: mpsc::Sender<WorkItem>,
        config: ScannerConfig,
    ) -> Self {
        Self {
            repo,
            queue,
            config,
        }
    }

    /// Sweep forever at the configured cadence.
    pub async fn run(&self) {
        let mut ticker = tokio::time::interval(self.config.sweep_interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        info!(interval = ?self.config.sweep_interval, "missed-run scanner started");
        loop {
            ticker.tick().await;
            match self.sweep(Utc::now()).await {
                Ok(summary) => {
                    if summary.timed_out + summary.late + summary.missed > 0 {
                        info!(?summary, "sweep found overdue monitors");
                    } else {
                        debug!(scanned = summary.scanned, "sweep clean");
                    }
                }
                Err(e) => warn!(error = %e, "sweep failed"),
            }
        }
    }

    /// One pass over every non-DISABLED monitor at an explicit `now`.
    pub async fn sweep(&self, now: DateTime<Utc>) -> Result<SweepSummary, StorageError> {
        let monitors = self.repo.active_monitors()?;
        let mut summary = SweepSummary {
            scanned: monitors.len(),
            ..SweepSummary::default()
        };

        for monitor in monitors {
            if self.finalize_timed_out(&monitor, now).await? {
                summary.timed_out += 1;
            }

            let Some(due) = monitor.next_due_at else {
                continue;
            };
            if !is_late(due, monitor.grace_sec, now) {
                continue;
            }

            let runs = self.repo.runs_since(monitor.id, due)?;
            let qualifying = runs.iter().any(|r| {
                matches!(
                    r.outcome,
                    RunOutcome::Success | RunOutcome::Fail | RunOutcome::Late
                )
            });

            if qualifying {
                // A ping arrived after the grace cutoff but before this
                // sweep; the ping path already settled the monitor.
                continue;
            }

            if runs.iter().any(|r| r.outcome == RunOutcome::Started) {
                debug!(monitor_id = %monitor.id, %due, "started run past grace");
                self.repo.update_monitor(monitor.id, |m| {
                    m.status = store::MonitorStatus::Late;
                })?;
                self.enqueue(Detection {
                    monitor_id: monitor.id,
                    kind: IncidentKind::Late,
                    occurrence: Occurrence::DueAt(due),
                    summary: format!(
                        "{} started but did not finish within its grace window",
                        monitor.name
                    ),
                    details: None,
                })
                .await;
                summary.late += 1;
                continue;
            }

            // Nothing at all since the due time.
            let already_recorded = runs.iter().any(|r| r.outcome == RunOutcome::Missed);
            if !already_recorded {
                self.repo.insert_run(Run {
                    id: uuid::Uuid::new_v4(),
                    monitor_id: monitor.id,
                    outcome: RunOutcome::Missed,
                    started_at: due,
                    finished_at: Some(now),
                    duration_ms: None,
                    exit_code: None,
                    output_key: None,
                    output_bytes: None,
                })?;
            }
            // Advance past the missed occurrence so the next completion
            // ping is judged against a fresh due time, not the one the
            // job already missed.
            let next_due = match compute_next_due_at(&monitor.schedule, now) {
                Ok(next) => Some(next),
                Err(e) => {
                    warn!(monitor_id = %monitor.id, error = %e, "cannot advance schedule");
                    None
                }
            };
            self.repo.update_monitor(monitor.id, |m| {
                m.status = store::MonitorStatus::Missed;
                if let Some(next) = next_due {
                    m.next_due_at = Some(next);
                }
            })?;
            self.enqueue(Detection {
                monitor_id: monitor.id,
                kind: IncidentKind::Missed,
                occurrence: Occurrence::DueAt(due),
                summary: format!("{} missed its expected run", monitor.name),
                details: Some(format!(
                    "due at {}, grace {}s",
                    due.to_rfc3339(),
                    monitor.grace_sec
                )),
            })
            .await;
            summary.missed += 1;
        }

        Ok(summary)
    }

    /// Finalize a STARTED run that outlived the monitor's timeout.
    async fn finalize_timed_out(
        &self,
        monitor: &Monitor,
        now: DateTime<Utc>,
    ) -> Result<bool, StorageError> {
        let Some(timeout_sec) = monitor.timeout_sec else {
            return Ok(false);
        };
        let Some(run) = self.repo.open_started_run(monitor.id)? else {
            return Ok(false);
        };
        let deadline = run.started_at + ChronoDuration::seconds(i64::from(timeout_sec));
        if now <= deadline {
            return Ok(false);
        }

        warn!(monitor_id = %monitor.id, run_id = %run.id, "run exceeded timeout");
        self.repo.update_run(run.id, |r| {
            r.outcome = RunOutcome::Timeout;
            r.finished_at = Some(now);
            r.duration_ms = Some((now - run.started_at).num_milliseconds().max(0) as u64);
        })?;
        self.repo.update_monitor(monitor.id, |m| {
            m.status = store::MonitorStatus::Failing;
        })?;
        self.enqueue(Detection {
            monitor_id: monitor.id,
            kind: IncidentKind::Fail,
            occurrence: Occurrence::Run(run.id),
            summary: format!("{} run exceeded its {timeout_sec}s timeout", monitor.name),
            details: None,
        })
        .await;
        Ok(true)
    }

    /// Enqueue without awaiting downstream; only a full queue blocks.
    async fn enqueue(&self, detection: Detection) {
        let item = WorkItem::Detection(detection);
        if let Err(mpsc::error::TrySendError::Full(item)) = self.queue.try_send(item) {
            debug!("work queue full, awaiting capacity");
            if self.queue.send(item).await.is_err() {
                warn!("work queue closed, dropping detection");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use schedule::ScheduleSpec;
    use uuid::Uuid;

    fn setup(depth: usize) -> (Arc<Repository>, MissedRunScanner, mpsc::Receiver<WorkItem>) {
        let repo = Arc::new(Repository::new());
        let (tx, rx) = mpsc::channel(depth);
        let scanner = MissedRunScanner::new(Arc::clone(&repo), tx, ScannerConfig::default());
        (repo, scanner, rx)
    }

    fn overdue_monitor(repo: &Repository, now: DateTime<Utc>) -> Monitor {
        let mut m = Monitor::new(
            Uuid::new_v4(),
            "nightly-backup",
            "tok",
            ScheduleSpec::interval(3600),
            300,
        );
        // Due an hour ago; grace long expired.
        m.next_due_at = Some(now - ChronoDuration::hours(1));
        repo.insert_monitor(m.clone()).unwrap();
        m
    }

    #[tokio::test]
    async fn test_missed_run_detected_and_schedule_advanced() {
        let (repo, scanner, mut rx) = setup(8);
        let now = Utc::now();
        let m = overdue_monitor(&repo, now);

        let s1 = scanner.sweep(now).await.unwrap();
        assert_eq!(s1.missed, 1);

        let after = repo.monitor(m.id).unwrap();
        assert_eq!(after.status, store::MonitorStatus::Missed);
        // Due time moved past the missed occurrence.
        assert_eq!(after.next_due_at, Some(now + ChronoDuration::seconds(3600)));

        // Synthetic MISSED run recorded exactly once, keyed to the old
        // due time.
        let runs = repo.recent_runs(m.id, 10).unwrap();
        assert_eq!(runs.len(), 1);
        assert_eq!(runs[0].outcome, RunOutcome::Missed);
        assert_eq!(runs[0].started_at, m.next_due_at.unwrap());

        match rx.try_recv().unwrap() {
            WorkItem::Detection(d) => {
                assert_eq!(d.kind, IncidentKind::Missed);
                assert_eq!(d.occurrence, Occurrence::DueAt(m.next_due_at.unwrap()));
            }
            other => panic!("unexpected item: {other:?}"),
        }

        // The next sweep sees a future due time and stays quiet.
        let s2 = scanner.sweep(now + ChronoDuration::minutes(1)).await.unwrap();
        assert_eq!(s2.missed, 0);
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_sweeps_before_ping_reemit_the_same_occurrence() {
        let (repo, scanner, mut rx) = setup(8);
        let now = Utc::now();
        let m = overdue_monitor(&repo, now);
        // The job has at least started; the due time stays put until a
        // completion ping advances it.
        repo.insert_run(Run::started(m.id, now - ChronoDuration::minutes(50)))
            .unwrap();

        scanner.sweep(now).await.unwrap();
        scanner.sweep(now + ChronoDuration::minutes(1)).await.unwrap();

        let mut occurrences = Vec::new();
        while let Ok(item) = rx.try_recv() {
            match item {
                WorkItem::Detection(d) => occurrences.push(d.occurrence),
                other => panic!("unexpected item: {other:?}"),
            }
        }
        // Incident-manager dedupe is what collapses these.
        assert_eq!(occurrences.len(), 2);
        assert_eq!(occurrences[0], occurrences[1]);
    }

    #[tokio::test]
    async fn test_started_run_past_grace_is_late() {
        let (repo, scanner, mut rx) = setup(8);
        let now = Utc::now();
        let m = overdue_monitor(&repo, now);
        repo.insert_run(Run::started(m.id, now - ChronoDuration::minutes(50)))
            .unwrap();

        let summary = scanner.sweep(now).await.unwrap();
        assert_eq!(summary.late, 1);
        assert_eq!(summary.missed, 0);
        assert_eq!(
            repo.monitor(m.id).unwrap().status,
            store::MonitorStatus::Late
        );

        match rx.try_recv().unwrap() {
            WorkItem::Detection(d) => assert_eq!(d.kind, IncidentKind::Late),
            other => panic!("unexpected item: {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_qualifying_run_clears_the_sweep() {
        let (repo, scanner, mut rx) = setup(8);
        let now = Utc::now();
        let m = overdue_monitor(&repo, now);
        let mut run = Run::started(m.id, now - ChronoDuration::minutes(30));
        run.outcome = RunOutcome::Success;
        run.finished_at = Some(now - ChronoDuration::minutes(29));
        repo.insert_run(run).unwrap();

        let summary = scanner.sweep(now).await.unwrap();
        assert_eq!(summary.missed, 0);
        assert_eq!(summary.late, 0);
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_within_grace_is_quiet() {
        let (repo, scanner, mut rx) = setup(8);
        let now = Utc::now();
        let mut m = Monitor::new(
            Uuid::new_v4(),
            "nightly-backup",
            "tok",
            ScheduleSpec::interval(3600),
            300,
        );
        m.next_due_at = Some(now - ChronoDuration::seconds(200));
        repo.insert_monitor(m.clone()).unwrap();

        let summary = scanner.sweep(now).await.unwrap();
        assert_eq!(summary.missed, 0);
        assert!(rx.try_recv().is_err());
        assert_eq!(repo.monitor(m.id).unwrap().status, store::MonitorStatus::Ok);
    }

    #[tokio::test]
    async fn test_disabled_monitor_is_skipped() {
        let (repo, scanner, mut rx) = setup(8);
        let now = Utc::now();
        let m = overdue_monitor(&repo, now);
        repo.update_monitor(m.id, |m| m.status = store::MonitorStatus::Disabled)
            .unwrap();

        let summary = scanner.sweep(now).await.unwrap();
        assert_eq!(summary.scanned, 0);
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_started_run_past_timeout_is_finalized() {
        let (repo, scanner, mut rx) = setup(8);
        let now = Utc::now();
        let mut m = Monitor::new(
            Uuid::new_v4(),
            "nightly-backup",
            "tok",
            ScheduleSpec::interval(3600),
            300,
        );
        m.timeout_sec = Some(600);
        m.next_due_at = Some(now + ChronoDuration::minutes(30));
        repo.insert_monitor(m.clone()).unwrap();
        let run = Run::started(m.id, now - ChronoDuration::minutes(20));
        repo.insert_run(run.clone()).unwrap();

        let summary = scanner.sweep(now).await.unwrap();
        assert_eq!(summary.timed_out, 1);

        let runs = repo.recent_runs(m.id, 10).unwrap();
        assert_eq!(runs[0].outcome, RunOutcome::Timeout);
        assert!(runs[0].finished_at.is_some());
        assert_eq!(
            repo.monitor(m.id).unwrap().status,
            store::MonitorStatus::Failing
        );

        match rx.try_recv().unwrap() {
            WorkItem::Detection(d) => {
                assert_eq!(d.kind, IncidentKind::Fail);
                assert_eq!(d.occurrence, Occurrence::Run(run.id));
            }
            other => panic!("unexpected item: {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_open_run_within_timeout_is_left_alone() {
        let (repo, scanner, _rx) = setup(8);
        let now = Utc::now();
        let mut m = Monitor::new(
            Uuid::new_v4(),
            "nightly-backup",
            "tok",
            ScheduleSpec::interval(3600),
            300,
        );
        m.timeout_sec = Some(3600);
        m.next_due_at = Some(now + ChronoDuration::minutes(30));
        repo.insert_monitor(m.clone()).unwrap();
        repo.insert_run(Run::started(m.id, now - ChronoDuration::minutes(20)))
            .unwrap();

        let summary = scanner.sweep(now).await.unwrap();
        assert_eq!(summary.timed_out, 0);
        assert_eq!(
            repo.recent_runs(m.id, 10).unwrap()[0].outcome,
            RunOutcome::Started
        );
    }
}
