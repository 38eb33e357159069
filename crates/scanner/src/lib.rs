//! Missed-Run Scanner
//!
//! Pings only ever tell us a job ran; silence is what this crate turns into
//! signal. A periodic sweep walks every enabled monitor whose due time has
//! passed its grace window and classifies the gap: a run arrived after all
//! (OK), a run started but never finished (LATE), or nothing happened
//! (MISSED). Detections go onto the shared work queue; the incident
//! manager's dedupe hash absorbs the re-emissions of later sweeps.

mod sweep;

pub use sweep::{MissedRunScanner, ScannerConfig, SweepSummary};
