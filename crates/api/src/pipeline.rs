//! Detection Pipeline
//!
//! Workers drain the shared work queue: detections become incidents through
//! the manager's idempotent open, and applied transitions fan out to alert
//! channels through the dispatcher. Duplicate detections of one occurrence
//! collapse here, whichever path produced them.

use std::sync::Arc;

use chrono::Utc;
use tokio::sync::{mpsc, Mutex};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use alerting::AlertDispatcher;
use incident::IncidentManager;
use store::{IncidentTransition, WorkItem};

/// Spawn `workers` tasks draining `rx` until the queue closes.
pub fn spawn_workers(
    workers: usize,
    rx: mpsc::Receiver<WorkItem>,
    incidents: Arc<IncidentManager>,
    dispatcher: Arc<AlertDispatcher>,
) -> Vec<JoinHandle<()>> {
    let rx = Arc::new(Mutex::new(rx));
    (0..workers.max(1))
        .map(|n| {
            let rx = Arc::clone(&rx);
            let incidents = Arc::clone(&incidents);
            let dispatcher = Arc::clone(&dispatcher);
            tokio::spawn(async move {
                info!(worker = n, "pipeline worker started");
                loop {
                    let item = { rx.lock().await.recv().await };
                    let Some(item) = item else {
                        debug!(worker = n, "work queue closed");
                        break;
                    };
                    process(&incidents, &dispatcher, item).await;
                }
            })
        })
        .collect()
}

/// Apply one work item end to end.
pub async fn process(
    incidents: &IncidentManager,
    dispatcher: &AlertDispatcher,
    item: WorkItem,
) {
    match item {
        WorkItem::Detection(detection) => {
            let outcome = match incidents.open(&detection, Utc::now()) {
                Ok(outcome) => outcome,
                Err(e) => {
                    warn!(monitor_id = %detection.monitor_id, error = %e, "failed to open incident");
                    return;
                }
            };
            if !outcome.created {
                debug!(incident_id = %outcome.incident.id, "detection deduplicated");
                return;
            }
            dispatch(dispatcher, outcome.incident.id, IncidentTransition::Opened).await;
        }
        WorkItem::Transition {
            incident_id,
            transition,
        } => dispatch(dispatcher, incident_id, transition).await,
    }
}

async fn dispatch(
    dispatcher: &AlertDispatcher,
    incident_id: uuid::Uuid,
    transition: IncidentTransition,
) {
    match dispatcher.dispatch(incident_id, transition).await {
        Ok(summary) => {
            debug!(incident_id = %incident_id, %transition, ?summary, "fan-out complete")
        }
        // Delivery problems never feed back into incident state.
        Err(e) => warn!(incident_id = %incident_id, %transition, error = %e, "fan-out failed"),
    }
}
