//! Ping Ingestion
//!
//! The write-heavy path of the system. A ping resolves its token to a
//! monitor, records or finalizes a run, advances the schedule, updates the
//! duration statistics, and emits detections for anything the completion
//! reveals: a failure, a late finish, or an anomalous-looking success.

mod processor;

pub use processor::{IngestError, PingAck, PingEvent, PingProcessor, PingState};
