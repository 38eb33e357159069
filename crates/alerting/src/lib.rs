//! Alerting
//!
//! Decides whether a transition may notify at all (suppression gate) and
//! fans permitted transitions out to every configured channel with retry,
//! per-channel independence, and resend protection.

mod dispatcher;
mod gate;
pub mod senders;

pub use dispatcher::{AlertDispatcher, DispatchSummary, DispatcherConfig};
pub use gate::{SuppressReason, SuppressionGate};
pub use senders::{AlertNote, AlertSender, HttpSenders, SenderError};
