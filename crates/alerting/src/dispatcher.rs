//! Alert Dispatcher Implementation

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use thiserror::Error;
use tokio::time::sleep;
use tracing::{debug, info, warn};
use uuid::Uuid;

use store::{
    DeliveryClaim, Incident, IncidentTransition, Monitor, Repository, StorageError,
};

use crate::gate::SuppressionGate;
use crate::senders::{AlertNote, AlertSender, SenderError};

/// Retry policy for outbound deliveries
#[derive(Debug, Clone)]
pub struct DispatcherConfig {
    /// Attempts per channel before recording failure
    pub max_attempts: u32,
    /// Base backoff doubled after each failed attempt
    pub backoff_base: Duration,
}

impl Default for DispatcherConfig {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            backoff_base: Duration::from_millis(500),
        }
    }
}

/// What happened to one fan-out
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DispatchSummary {
    pub delivered: usize,
    pub failed: usize,
    /// Channels skipped because the transition already reached them
    pub skipped: usize,
    /// True when the suppression gate withheld the whole fan-out
    pub suppressed: bool,
}

/// Dispatch failures that prevent any fan-out at all
#[derive(Debug, Error)]
pub enum DispatchError {
    #[error(transparent)]
    Storage(#[from] StorageError),
}

/// Fans one incident transition out to every channel of the owning org.
///
/// Channels fail independently; incident state is never touched by a
/// delivery outcome.
pub struct AlertDispatcher {
    repo: Arc<Repository>,
    gate: SuppressionGate,
    sender: Arc<dyn AlertSender>,
    config: DispatcherConfig,
}

impl AlertDispatcher {
    pub fn new(
        repo: Arc<Repository>,
        gate: SuppressionGate,
        sender: Arc<dyn AlertSender>,
        config: DispatcherConfig,
    ) -> Self {
        Self {
            repo,
            gate,
            sender,
            config,
        }
    }

    /// Fan `transition` of `incident_id` out to the org's channels.
    pub async fn dispatch(
        &self,
        incident_id: Uuid,
        transition: IncidentTransition,
    ) -> Result<DispatchSummary, DispatchError> {
        let incident = self.repo.incident(incident_id)?;
        let monitor = self.repo.monitor(incident.monitor_id)?;

        if let Some(reason) = self.gate.check(&incident, &monitor, Utc::now())? {
            info!(
                incident_id = %incident_id,
                %transition,
                ?reason,
                "alert suppressed; incident state already recorded"
            );
            return Ok(DispatchSummary {
                suppressed: true,
                ..DispatchSummary::default()
            });
        }

        let channels = self.repo.channels_for_org(monitor.org_id)?;
        let mut summary = DispatchSummary::default();

        for channel in channels {
            let claim = self
                .repo
                .try_claim_delivery(incident_id, channel.id, transition)?;
            if claim == DeliveryClaim::AlreadyDelivered {
                debug!(
                    incident_id = %incident_id,
                    channel_id = %channel.id,
                    %transition,
                    "transition already delivered, skipping"
                );
                summary.skipped += 1;
                continue;
            }

            let note = Self::note(&incident, &monitor, transition);
            match self.deliver_with_retry(&channel.config, &note).await {
                Ok((thread, attempts)) => {
                    self.repo
                        .mark_delivered(incident_id, channel.id, transition, attempts)?;
                    summary.delivered += 1;
                    if let Some(ts) = thread {
                        // Record the root message so follow-ups thread.
                        if transition == IncidentTransition::Opened {
                            self.repo.update_incident(incident_id, |i| {
                                if i.thread_key.is_none() {
                                    i.thread_key = Some(ts.clone());
                                }
                            })?;
                        }
                    }
                }
                Err((error, attempts)) => {
                    warn!(
                        incident_id = %incident_id,
                        channel_id = %channel.id,
                        %transition,
                        attempts,
                        %error,
                        "channel delivery failed"
                    );
                    self.repo.mark_failed(
                        incident_id,
                        channel.id,
                        transition,
                        attempts,
                        &error.to_string(),
                    )?;
                    summary.failed += 1;
                }
            }
        }

        Ok(summary)
    }

    /// Bounded exponential-backoff retry; permanent errors stop early.
    async fn deliver_with_retry(
        &self,
        config: &store::ChannelConfig,
        note: &AlertNote,
    ) -> Result<(Option<String>, u32), (SenderError, u32)> {
        let mut attempt = 0;
        loop {
            attempt += 1;
            match self.sender.send(config, note).await {
                Ok(thread) => return Ok((thread, attempt)),
                Err(e) if e.is_transient() && attempt < self.config.max_attempts => {
                    let backoff = self.config.backoff_base * 2u32.pow(attempt - 1);
                    debug!(attempt, ?backoff, error = %e, "retrying channel delivery");
                    sleep(backoff).await;
                }
                Err(e) => return Err((e, attempt)),
            }
        }
    }

    fn note(incident: &Incident, monitor: &Monitor, transition: IncidentTransition) -> AlertNote {
        AlertNote {
            incident_id: incident.id,
            monitor_name: monitor.name.clone(),
            kind: incident.kind,
            status: incident.status,
            transition,
            summary: incident.summary.clone(),
            opened_at: incident.opened_at,
            thread_key: incident.thread_key.clone(),
        }
    }
}
