//! Storage Layer
//!
//! Domain model and repository for monitors, runs, incidents, and alert
//! plumbing. The repository is in-memory behind a storage-error API so the
//! pipeline and tests share one substitutable service dependency.

mod model;
mod repository;

pub use model::{
    AlertChannel, AlertDelivery, ChannelConfig, Detection, Incident, IncidentEvent,
    IncidentEventType, IncidentKind, IncidentStatus, IncidentTransition, MaintenanceWindow,
    Monitor, MonitorStatus, Occurrence, Run, RunOutcome, WorkItem,
};
pub use repository::{DeliveryClaim, InsertOutcome, Repository};

use thiserror::Error;

/// Storage errors
#[derive(Debug, Error)]
pub enum StorageError {
    #[error("lock poisoned: {0}")]
    Lock(String),
    #[error("record not found")]
    NotFound,
}
