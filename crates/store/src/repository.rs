//! Repository Implementation

use std::collections::{HashMap, VecDeque};
use std::sync::{Mutex, MutexGuard};

use chrono::{DateTime, Utc};
use tracing::{debug, info};
use uuid::Uuid;

use crate::model::{
    AlertChannel, AlertDelivery, Incident, IncidentEvent, IncidentStatus, IncidentTransition,
    MaintenanceWindow, Monitor, MonitorStatus, Run, RunOutcome,
};
use crate::StorageError;

/// Outcome of an atomic insert-if-absent on incidents.
#[derive(Debug, Clone)]
pub struct InsertOutcome {
    pub incident: Incident,
    /// False when an existing OPEN/ACKED incident with the same dedupe
    /// hash won the race
    pub created: bool,
}

/// Outcome of claiming a delivery slot.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeliveryClaim {
    /// This worker may (re)attempt the send
    Claimed,
    /// The transition already reached this channel; do not re-send
    AlreadyDelivered,
}

/// In-memory repository for all persisted rows.
///
/// Every read-modify-write goes through one of the internal mutexes, which
/// serializes per-monitor Welford updates and makes incident dedup an atomic
/// check-then-insert.
pub struct Repository {
    monitors: Mutex<HashMap<Uuid, Monitor>>,
    runs: Mutex<VecDeque<Run>>,
    incidents: Mutex<Vec<Incident>>,
    events: Mutex<Vec<IncidentEvent>>,
    windows: Mutex<Vec<MaintenanceWindow>>,
    channels: Mutex<Vec<AlertChannel>>,
    deliveries: Mutex<HashMap<(Uuid, Uuid, IncidentTransition), AlertDelivery>>,
    max_runs: usize,
}

fn lock<T>(m: &Mutex<T>) -> Result<MutexGuard<'_, T>, StorageError> {
    m.lock().map_err(|e| StorageError::Lock(e.to_string()))
}

impl Repository {
    /// Create an empty repository.
    pub fn new() -> Self {
        info!("creating in-memory repository");
        Self {
            monitors: Mutex::new(HashMap::new()),
            runs: Mutex::new(VecDeque::with_capacity(1024)),
            incidents: Mutex::new(Vec::new()),
            events: Mutex::new(Vec::new()),
            windows: Mutex::new(Vec::new()),
            channels: Mutex::new(Vec::new()),
            deliveries: Mutex::new(HashMap::new()),
            max_runs: 100_000,
        }
    }

    // ── Monitors ────────────────────────────────────────────────

    pub fn insert_monitor(&self, monitor: Monitor) -> Result<(), StorageError> {
        lock(&self.monitors)?.insert(monitor.id, monitor);
        Ok(())
    }

    pub fn monitor(&self, id: Uuid) -> Result<Monitor, StorageError> {
        lock(&self.monitors)?
            .get(&id)
            .cloned()
            .ok_or(StorageError::NotFound)
    }

    pub fn monitor_by_token(&self, token: &str) -> Result<Option<Monitor>, StorageError> {
        Ok(lock(&self.monitors)?
            .values()
            .find(|m| m.token == token)
            .cloned())
    }

    pub fn list_monitors(&self) -> Result<Vec<Monitor>, StorageError> {
        let mut all: Vec<Monitor> = lock(&self.monitors)?.values().cloned().collect();
        all.sort_by_key(|m| m.created_at);
        Ok(all)
    }

    /// Monitors the scanner sweeps: everything not DISABLED.
    pub fn active_monitors(&self) -> Result<Vec<Monitor>, StorageError> {
        Ok(lock(&self.monitors)?
            .values()
            .filter(|m| m.status != MonitorStatus::Disabled)
            .cloned()
            .collect())
    }

    /// Apply a mutation under the monitor-table lock.
    ///
    /// Welford updates are read-modify-write; funnelling them through here
    /// is what keeps concurrent pings from corrupting the accumulators.
    pub fn update_monitor<F>(&self, id: Uuid, f: F) -> Result<Monitor, StorageError>
    where
        F: FnOnce(&mut Monitor),
    {
        let mut monitors = lock(&self.monitors)?;
        let monitor = monitors.get_mut(&id).ok_or(StorageError::NotFound)?;
        f(monitor);
        Ok(monitor.clone())
    }

    pub fn monitor_count(&self) -> usize {
        lock(&self.monitors).map(|m| m.len()).unwrap_or(0)
    }

    // ── Runs ────────────────────────────────────────────────────

    pub fn insert_run(&self, run: Run) -> Result<(), StorageError> {
        let mut runs = lock(&self.runs)?;
        while runs.len() >= self.max_runs {
            runs.pop_front();
        }
        runs.push_back(run);
        Ok(())
    }

    pub fn update_run<F>(&self, id: Uuid, f: F) -> Result<Run, StorageError>
    where
        F: FnOnce(&mut Run),
    {
        let mut runs = lock(&self.runs)?;
        let run = runs
            .iter_mut()
            .find(|r| r.id == id)
            .ok_or(StorageError::NotFound)?;
        f(run);
        Ok(run.clone())
    }

    /// Most recent STARTED run without a finish for this monitor.
    pub fn open_started_run(&self, monitor_id: Uuid) -> Result<Option<Run>, StorageError> {
        Ok(lock(&self.runs)?
            .iter()
            .rev()
            .find(|r| {
                r.monitor_id == monitor_id
                    && r.outcome == RunOutcome::Started
                    && r.finished_at.is_none()
            })
            .cloned())
    }

    /// Runs for a monitor started at or after `since`.
    pub fn runs_since(
        &self,
        monitor_id: Uuid,
        since: DateTime<Utc>,
    ) -> Result<Vec<Run>, StorageError> {
        Ok(lock(&self.runs)?
            .iter()
            .filter(|r| r.monitor_id == monitor_id && r.started_at >= since)
            .cloned()
            .collect())
    }

    pub fn recent_runs(&self, monitor_id: Uuid, limit: usize) -> Result<Vec<Run>, StorageError> {
        Ok(lock(&self.runs)?
            .iter()
            .rev()
            .filter(|r| r.monitor_id == monitor_id)
            .take(limit)
            .cloned()
            .collect())
    }

    // ── Incidents ───────────────────────────────────────────────

    /// Atomic check-then-insert keyed by (monitor, kind, dedupe hash).
    ///
    /// The losing side of a racing ping-path/scanner-path detection gets
    /// the winner's incident back with `created: false`; duplicates never
    /// surface as errors.
    pub fn insert_incident_if_absent(
        &self,
        candidate: Incident,
    ) -> Result<InsertOutcome, StorageError> {
        let mut incidents = lock(&self.incidents)?;
        if let Some(existing) = incidents.iter().find(|i| {
            i.monitor_id == candidate.monitor_id
                && i.kind == candidate.kind
                && i.dedupe_hash == candidate.dedupe_hash
                && i.status != IncidentStatus::Resolved
        }) {
            debug!(incident_id = %existing.id, "dedupe hit, reusing incident");
            return Ok(InsertOutcome {
                incident: existing.clone(),
                created: false,
            });
        }
        incidents.push(candidate.clone());
        Ok(InsertOutcome {
            incident: candidate,
            created: true,
        })
    }

    pub fn incident(&self, id: Uuid) -> Result<Incident, StorageError> {
        lock(&self.incidents)?
            .iter()
            .find(|i| i.id == id)
            .cloned()
            .ok_or(StorageError::NotFound)
    }

    pub fn update_incident<F>(&self, id: Uuid, f: F) -> Result<Incident, StorageError>
    where
        F: FnOnce(&mut Incident),
    {
        let mut incidents = lock(&self.incidents)?;
        let incident = incidents
            .iter_mut()
            .find(|i| i.id == id)
            .ok_or(StorageError::NotFound)?;
        f(incident);
        Ok(incident.clone())
    }

    /// Non-resolved incidents for a monitor.
    pub fn open_incidents(&self, monitor_id: Uuid) -> Result<Vec<Incident>, StorageError> {
        Ok(lock(&self.incidents)?
            .iter()
            .filter(|i| i.monitor_id == monitor_id && i.status != IncidentStatus::Resolved)
            .cloned()
            .collect())
    }

    pub fn list_incidents(
        &self,
        status: Option<IncidentStatus>,
        limit: usize,
    ) -> Result<Vec<Incident>, StorageError> {
        let mut all: Vec<Incident> = lock(&self.incidents)?
            .iter()
            .filter(|i| status.map_or(true, |s| i.status == s))
            .cloned()
            .collect();
        all.sort_by(|a, b| b.opened_at.cmp(&a.opened_at));
        all.truncate(limit);
        Ok(all)
    }

    pub fn open_incident_count(&self) -> usize {
        lock(&self.incidents)
            .map(|v| {
                v.iter()
                    .filter(|i| i.status != IncidentStatus::Resolved)
                    .count()
            })
            .unwrap_or(0)
    }

    // ── Incident events ─────────────────────────────────────────

    pub fn append_event(&self, event: IncidentEvent) -> Result<(), StorageError> {
        lock(&self.events)?.push(event);
        Ok(())
    }

    pub fn events_for(&self, incident_id: Uuid) -> Result<Vec<IncidentEvent>, StorageError> {
        Ok(lock(&self.events)?
            .iter()
            .filter(|e| e.incident_id == incident_id)
            .cloned()
            .collect())
    }

    // ── Maintenance windows & channels ──────────────────────────

    pub fn insert_window(&self, window: MaintenanceWindow) -> Result<(), StorageError> {
        lock(&self.windows)?.push(window);
        Ok(())
    }

    /// Enabled windows that could apply to this monitor (time check is the
    /// suppression gate's job).
    pub fn windows_for(&self, monitor: &Monitor) -> Result<Vec<MaintenanceWindow>, StorageError> {
        Ok(lock(&self.windows)?
            .iter()
            .filter(|w| {
                w.enabled
                    && w.org_id == monitor.org_id
                    && w.monitor_id.map_or(true, |id| id == monitor.id)
            })
            .cloned()
            .collect())
    }

    pub fn insert_channel(&self, channel: AlertChannel) -> Result<(), StorageError> {
        lock(&self.channels)?.push(channel);
        Ok(())
    }

    pub fn channels_for_org(&self, org_id: Uuid) -> Result<Vec<AlertChannel>, StorageError> {
        Ok(lock(&self.channels)?
            .iter()
            .filter(|c| c.org_id == org_id)
            .cloned()
            .collect())
    }

    // ── Delivery ledger ─────────────────────────────────────────

    /// Claim the (incident, transition, channel) delivery slot.
    ///
    /// A delivered slot is never re-claimed; an undelivered one may be,
    /// which is what makes delivery at-least-once but resend-free.
    pub fn try_claim_delivery(
        &self,
        incident_id: Uuid,
        channel_id: Uuid,
        transition: IncidentTransition,
    ) -> Result<DeliveryClaim, StorageError> {
        let mut deliveries = lock(&self.deliveries)?;
        let key = (incident_id, channel_id, transition);
        match deliveries.get(&key) {
            Some(d) if d.delivered => Ok(DeliveryClaim::AlreadyDelivered),
            Some(_) => Ok(DeliveryClaim::Claimed),
            None => {
                deliveries.insert(
                    key,
                    AlertDelivery {
                        incident_id,
                        channel_id,
                        transition,
                        attempts: 0,
                        delivered: false,
                        last_error: None,
                        updated_at: Utc::now(),
                    },
                );
                Ok(DeliveryClaim::Claimed)
            }
        }
    }

    pub fn mark_delivered(
        &self,
        incident_id: Uuid,
        channel_id: Uuid,
        transition: IncidentTransition,
        attempts: u32,
    ) -> Result<(), StorageError> {
        let mut deliveries = lock(&self.deliveries)?;
        let entry = deliveries
            .get_mut(&(incident_id, channel_id, transition))
            .ok_or(StorageError::NotFound)?;
        entry.attempts = attempts;
        entry.delivered = true;
        entry.last_error = None;
        entry.updated_at = Utc::now();
        Ok(())
    }

    pub fn mark_failed(
        &self,
        incident_id: Uuid,
        channel_id: Uuid,
        transition: IncidentTransition,
        attempts: u32,
        error: &str,
    ) -> Result<(), StorageError> {
        let mut deliveries = lock(&self.deliveries)?;
        let entry = deliveries
            .get_mut(&(incident_id, channel_id, transition))
            .ok_or(StorageError::NotFound)?;
        entry.attempts = attempts;
        entry.delivered = false;
        entry.last_error = Some(error.to_string());
        entry.updated_at = Utc::now();
        Ok(())
    }

    pub fn delivery(
        &self,
        incident_id: Uuid,
        channel_id: Uuid,
        transition: IncidentTransition,
    ) -> Result<Option<AlertDelivery>, StorageError> {
        Ok(lock(&self.deliveries)?
            .get(&(incident_id, channel_id, transition))
            .cloned())
    }
}

impl Default for Repository {
    fn default() -> Self {
        Self::new()
    }
}
