//! Suppression Gate

use std::sync::Arc;

use chrono::{DateTime, Utc};
use tracing::debug;
use uuid::Uuid;

use store::{Incident, Monitor, Repository, StorageError};

/// Why an alert was withheld
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SuppressReason {
    /// The incident is snoozed until the given time
    Snoozed { until: DateTime<Utc> },
    /// An enabled maintenance window covers the monitor right now
    Maintenance { window_id: Uuid },
}

/// Gatekeeper consulted before any alert leaves the dispatcher.
///
/// Suppression gates notification only; incident state is recorded
/// regardless, so history stays complete through planned maintenance.
pub struct SuppressionGate {
    repo: Arc<Repository>,
}

impl SuppressionGate {
    pub fn new(repo: Arc<Repository>) -> Self {
        Self { repo }
    }

    /// Check snooze first, then maintenance windows. `None` means send.
    pub fn check(
        &self,
        incident: &Incident,
        monitor: &Monitor,
        now: DateTime<Utc>,
    ) -> Result<Option<SuppressReason>, StorageError> {
        if let Some(until) = incident.suppress_until {
            if now < until {
                debug!(incident_id = %incident.id, %until, "alert suppressed by snooze");
                return Ok(Some(SuppressReason::Snoozed { until }));
            }
        }

        for window in self.repo.windows_for(monitor)? {
            if window.covers(monitor, now) {
                debug!(
                    incident_id = %incident.id,
                    window_id = %window.id,
                    "alert suppressed by maintenance window"
                );
                return Ok(Some(SuppressReason::Maintenance {
                    window_id: window.id,
                }));
            }
        }

        Ok(None)
    }
}
