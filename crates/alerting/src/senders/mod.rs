//! Channel Senders
//!
//! One adapter per channel type, resolved by exhaustive matching on the
//! channel's tagged config. Senders are transport only: they neither read
//! nor mutate incident state.

pub mod slack;
pub mod webhook;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use thiserror::Error;
use uuid::Uuid;

use store::{ChannelConfig, IncidentKind, IncidentStatus, IncidentTransition};

use slack::SlackSender;
use webhook::WebhookSender;

/// Errors from a single channel delivery attempt
#[derive(Debug, Error)]
pub enum SenderError {
    /// Worth retrying: timeouts, 5xx, connection resets
    #[error("transient delivery failure: {0}")]
    Transient(String),
    /// Not worth retrying: bad config, rejected payloads, 4xx
    #[error("permanent delivery failure: {0}")]
    Permanent(String),
    #[error("network error: {0}")]
    Network(#[from] reqwest::Error),
}

impl SenderError {
    /// Whether the dispatcher should spend another attempt on this error.
    pub fn is_transient(&self) -> bool {
        matches!(self, Self::Transient(_) | Self::Network(_))
    }
}

/// Rendered notification content handed to an adapter.
#[derive(Debug, Clone)]
pub struct AlertNote {
    pub incident_id: Uuid,
    pub monitor_name: String,
    pub kind: IncidentKind,
    pub status: IncidentStatus,
    pub transition: IncidentTransition,
    pub summary: String,
    pub opened_at: DateTime<Utc>,
    /// Root-message identifier from the OPENED delivery, for threaded
    /// follow-ups on channels that support them
    pub thread_key: Option<String>,
}

/// A channel adapter.
///
/// Returns the channel's root-message identifier when the channel supports
/// threading and this send created a root message.
#[async_trait]
pub trait AlertSender: Send + Sync {
    async fn send(
        &self,
        config: &ChannelConfig,
        note: &AlertNote,
    ) -> Result<Option<String>, SenderError>;
}

/// Production sender set backed by one shared HTTP client.
pub struct HttpSenders {
    webhook: WebhookSender,
    slack: SlackSender,
}

impl HttpSenders {
    pub fn new() -> Self {
        let client = reqwest::Client::new();
        Self {
            webhook: WebhookSender::new(client.clone()),
            slack: SlackSender::new(client),
        }
    }
}

impl Default for HttpSenders {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl AlertSender for HttpSenders {
    async fn send(
        &self,
        config: &ChannelConfig,
        note: &AlertNote,
    ) -> Result<Option<String>, SenderError> {
        match config {
            ChannelConfig::Webhook { .. } => self.webhook.send(config, note).await,
            ChannelConfig::Slack { .. } => self.slack.send(config, note).await,
        }
    }
}
