//! Slack Sender
//!
//! Thread-aware: the OPENED notification posts a root message whose `ts`
//! is recorded on the incident; later transitions reply in that thread.

use std::time::Duration;

use async_trait::async_trait;
use reqwest::Client;
use serde::Deserialize;
use serde_json::json;

use store::{ChannelConfig, IncidentTransition};

use super::{AlertNote, AlertSender, SenderError};

const DEFAULT_API_URL: &str = "https://slack.com/api/chat.postMessage";
const REQUEST_TIMEOUT: Duration = Duration::from_secs(10);

#[derive(Debug, Deserialize)]
struct PostMessageResponse {
    ok: bool,
    ts: Option<String>,
    error: Option<String>,
}

pub struct SlackSender {
    client: Client,
}

impl SlackSender {
    pub fn new(client: Client) -> Self {
        Self { client }
    }

    fn text(note: &AlertNote) -> String {
        match note.transition {
            IncidentTransition::Opened => {
                format!(
                    ":rotating_light: [{}] {} - {}",
                    note.kind, note.monitor_name, note.summary
                )
            }
            IncidentTransition::Acknowledged => {
                format!(":eyes: {} acknowledged - {}", note.monitor_name, note.summary)
            }
            IncidentTransition::Resolved => {
                format!(":white_check_mark: {} resolved - {}", note.monitor_name, note.summary)
            }
        }
    }
}

#[async_trait]
impl AlertSender for SlackSender {
    async fn send(
        &self,
        config: &ChannelConfig,
        note: &AlertNote,
    ) -> Result<Option<String>, SenderError> {
        let ChannelConfig::Slack {
            token,
            channel,
            api_url,
        } = config
        else {
            return Err(SenderError::Permanent(
                "slack sender received a non-slack config".to_string(),
            ));
        };

        let mut body = json!({
            "channel": channel,
            "text": Self::text(note),
        });
        // Follow-up transitions thread under the recorded root message.
        if note.transition != IncidentTransition::Opened {
            if let Some(ts) = &note.thread_key {
                body["thread_ts"] = json!(ts);
            }
        }

        let url = api_url.as_deref().unwrap_or(DEFAULT_API_URL);
        let response = self
            .client
            .post(url)
            .bearer_auth(token)
            .timeout(REQUEST_TIMEOUT)
            .json(&body)
            .send()
            .await?;

        let status = response.status();
        if status.is_server_error() {
            return Err(SenderError::Transient(format!("slack returned {status}")));
        }
        if !status.is_success() {
            return Err(SenderError::Permanent(format!("slack returned {status}")));
        }

        let parsed: PostMessageResponse = response.json().await?;
        if !parsed.ok {
            let reason = parsed.error.unwrap_or_else(|| "unknown".to_string());
            // Slack signals config problems (bad channel, revoked token)
            // in-band with ok=false.
            return Err(SenderError::Permanent(format!("slack error: {reason}")));
        }

        // Only root messages establish a thread.
        if note.transition == IncidentTransition::Opened {
            Ok(parsed.ts)
        } else {
            Ok(None)
        }
    }
}
