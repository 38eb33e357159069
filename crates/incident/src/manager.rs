//! Incident Manager Implementation

use std::sync::Arc;

use chrono::{DateTime, Duration, Utc};
use sha2::{Digest, Sha256};
use thiserror::Error;
use tracing::{debug, info};
use uuid::Uuid;

use store::{
    Detection, Incident, IncidentEvent, IncidentEventType, IncidentKind, IncidentStatus,
    Occurrence, Repository, StorageError,
};

/// Longest permitted snooze: one week, in minutes.
const MAX_SNOOZE_MINUTES: u64 = 10_080;

/// Errors from incident operations
#[derive(Debug, Error)]
pub enum IncidentError {
    #[error("incident {0} not found")]
    NotFound(Uuid),
    #[error("invalid transition: cannot {action} an incident in {from:?}")]
    InvalidTransition {
        from: IncidentStatus,
        action: &'static str,
    },
    #[error("validation failed: {0}")]
    Validation(String),
    #[error(transparent)]
    Storage(#[from] StorageError),
}

/// Result of `open`: the incident plus whether this call created it.
#[derive(Debug, Clone)]
pub struct OpenOutcome {
    pub incident: Incident,
    pub created: bool,
}

/// Snooze parameters: a duration in minutes or an absolute end time.
#[derive(Debug, Clone, Copy, Default)]
pub struct SnoozeRequest {
    pub minutes: Option<u64>,
    pub until: Option<DateTime<Utc>>,
}

/// Deterministic fingerprint of a detected condition occurrence.
///
/// Re-detection of the same occurrence always yields the same hash, which
/// is what lets racing ping-path and scanner-path detections converge on
/// one incident.
pub fn dedupe_hash(monitor_id: Uuid, kind: IncidentKind, occurrence: &Occurrence) -> String {
    let mut hasher = Sha256::new();
    hasher.update(monitor_id.as_bytes());
    hasher.update(b":");
    hasher.update(kind.to_string().as_bytes());
    hasher.update(b":");
    hasher.update(occurrence.to_string().as_bytes());
    hex::encode(hasher.finalize())
}

/// Creates, dedups, and transitions incidents.
pub struct IncidentManager {
    repo: Arc<Repository>,
}

impl IncidentManager {
    pub fn new(repo: Arc<Repository>) -> Self {
        Self { repo }
    }

    /// Open an incident for a detection, or return the existing one.
    ///
    /// Idempotent under concurrent detection of the same occurrence: the
    /// repository's insert-if-absent decides the winner and the loser's
    /// call is a no-op returning it. Exactly one OPENED event is written
    /// for the winning insert.
    pub fn open(&self, detection: &Detection, now: DateTime<Utc>) -> Result<OpenOutcome, IncidentError> {
        let hash = dedupe_hash(detection.monitor_id, detection.kind, &detection.occurrence);
        let candidate = Incident {
            id: Uuid::new_v4(),
            monitor_id: detection.monitor_id,
            kind: detection.kind,
            status: IncidentStatus::Open,
            summary: detection.summary.clone(),
            details: detection.details.clone(),
            dedupe_hash: hash,
            opened_at: now,
            acknowledged_at: None,
            resolved_at: None,
            suppress_until: None,
            thread_key: None,
        };

        let outcome = self.repo.insert_incident_if_absent(candidate)?;
        if outcome.created {
            info!(
                incident_id = %outcome.incident.id,
                monitor_id = %detection.monitor_id,
                kind = %detection.kind,
                "incident opened"
            );
            self.append(
                outcome.incident.id,
                IncidentEventType::Opened,
                detection.summary.clone(),
                "detector",
                now,
            )?;
        } else {
            debug!(incident_id = %outcome.incident.id, "duplicate detection absorbed");
        }
        Ok(OpenOutcome {
            incident: outcome.incident,
            created: outcome.created,
        })
    }

    /// Acknowledge an OPEN incident.
    pub fn acknowledge(
        &self,
        id: Uuid,
        actor: &str,
        now: DateTime<Utc>,
    ) -> Result<Incident, IncidentError> {
        let current = self.fetch(id)?;
        if current.status != IncidentStatus::Open {
            return Err(IncidentError::InvalidTransition {
                from: current.status,
                action: "acknowledge",
            });
        }
        let updated = self.repo.update_incident(id, |i| {
            i.status = IncidentStatus::Acked;
            i.acknowledged_at = Some(now);
        })?;
        self.append(
            id,
            IncidentEventType::Acknowledged,
            format!("acknowledged by {actor}"),
            actor,
            now,
        )?;
        Ok(updated)
    }

    /// Resolve an OPEN or ACKED incident. RESOLVED is terminal.
    pub fn resolve(
        &self,
        id: Uuid,
        actor: &str,
        now: DateTime<Utc>,
    ) -> Result<Incident, IncidentError> {
        let current = self.fetch(id)?;
        if current.status == IncidentStatus::Resolved {
            return Err(IncidentError::InvalidTransition {
                from: current.status,
                action: "resolve",
            });
        }
        let updated = self.repo.update_incident(id, |i| {
            i.status = IncidentStatus::Resolved;
            i.resolved_at = Some(now);
        })?;
        info!(incident_id = %id, actor, "incident resolved");
        self.append(
            id,
            IncidentEventType::Resolved,
            format!("resolved by {actor}"),
            actor,
            now,
        )?;
        Ok(updated)
    }

    /// Resolve every non-resolved incident on a monitor, attributing the
    /// system actor. Invoked when a SUCCESS ping clears the condition.
    pub fn resolve_open_for_monitor(
        &self,
        monitor_id: Uuid,
        now: DateTime<Utc>,
    ) -> Result<Vec<Incident>, IncidentError> {
        let open = self.repo.open_incidents(monitor_id)?;
        let mut resolved = Vec::with_capacity(open.len());
        for incident in open {
            resolved.push(self.resolve(incident.id, "system", now)?);
        }
        Ok(resolved)
    }

    /// Set the suppression window. Does not change status.
    pub fn snooze(
        &self,
        id: Uuid,
        request: SnoozeRequest,
        actor: &str,
        now: DateTime<Utc>,
    ) -> Result<Incident, IncidentError> {
        let until = match (request.until, request.minutes) {
            (Some(until), _) => {
                if until <= now {
                    return Err(IncidentError::Validation(
                        "until must be strictly in the future".to_string(),
                    ));
                }
                until
            }
            (None, Some(minutes)) => {
                if minutes == 0 || minutes > MAX_SNOOZE_MINUTES {
                    return Err(IncidentError::Validation(format!(
                        "minutes must be between 1 and {MAX_SNOOZE_MINUTES}"
                    )));
                }
                now + Duration::minutes(minutes as i64)
            }
            (None, None) => {
                return Err(IncidentError::Validation(
                    "either minutes or until is required".to_string(),
                ));
            }
        };

        self.fetch(id)?;
        let updated = self
            .repo
            .update_incident(id, |i| i.suppress_until = Some(until))?;
        self.append(
            id,
            IncidentEventType::Snoozed,
            format!("snoozed until {}", until.to_rfc3339()),
            actor,
            now,
        )?;
        Ok(updated)
    }

    /// Clear the suppression window.
    pub fn unsnooze(
        &self,
        id: Uuid,
        actor: &str,
        now: DateTime<Utc>,
    ) -> Result<Incident, IncidentError> {
        self.fetch(id)?;
        let updated = self.repo.update_incident(id, |i| i.suppress_until = None)?;
        self.append(
            id,
            IncidentEventType::Unsnoozed,
            "snooze cleared".to_string(),
            actor,
            now,
        )?;
        Ok(updated)
    }

    fn fetch(&self, id: Uuid) -> Result<Incident, IncidentError> {
        match self.repo.incident(id) {
            Ok(i) => Ok(i),
            Err(StorageError::NotFound) => Err(IncidentError::NotFound(id)),
            Err(e) => Err(e.into()),
        }
    }

    fn append(
        &self,
        incident_id: Uuid,
        event_type: IncidentEventType,
        message: String,
        actor: &str,
        at: DateTime<Utc>,
    ) -> Result<(), IncidentError> {
        self.repo.append_event(IncidentEvent {
            id: Uuid::new_v4(),
            incident_id,
            event_type,
            message,
            actor: actor.to_string(),
            at,
        })?;
        Ok(())
    }
}
