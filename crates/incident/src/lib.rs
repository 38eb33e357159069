//! Incident Management
//!
//! Owns the OPEN → ACKED → RESOLVED state machine, deduplication of racing
//! detections, snooze bookkeeping, and the append-only audit trail.

mod manager;

pub use manager::{dedupe_hash, IncidentError, IncidentManager, OpenOutcome, SnoozeRequest};
