//! Generic Webhook Sender

use std::time::Duration;

use async_trait::async_trait;
use reqwest::header::{HeaderMap, HeaderName, HeaderValue};
use reqwest::Client;
use serde_json::json;

use store::ChannelConfig;

use super::{AlertNote, AlertSender, SenderError};

const REQUEST_TIMEOUT: Duration = Duration::from_secs(10);

/// Posts a JSON event payload to a user-supplied URL.
///
/// Webhooks have no threading concept, so `send` never returns a root
/// identifier and ignores `thread_key`.
pub struct WebhookSender {
    client: Client,
}

impl WebhookSender {
    pub fn new(client: Client) -> Self {
        Self { client }
    }

    fn payload(note: &AlertNote) -> serde_json::Value {
        json!({
            "event": format!("incident.{}", note.transition),
            "incident": {
                "id": note.incident_id,
                "kind": note.kind,
                "status": note.status,
                "summary": note.summary,
                "opened_at": note.opened_at,
            },
            "monitor": {
                "name": note.monitor_name,
            },
        })
    }
}

#[async_trait]
impl AlertSender for WebhookSender {
    async fn send(
        &self,
        config: &ChannelConfig,
        note: &AlertNote,
    ) -> Result<Option<String>, SenderError> {
        let ChannelConfig::Webhook { url, headers } = config else {
            return Err(SenderError::Permanent(
                "webhook sender received a non-webhook config".to_string(),
            ));
        };

        let mut header_map = HeaderMap::new();
        for (key, value) in headers {
            let name = HeaderName::from_bytes(key.as_bytes())
                .map_err(|e| SenderError::Permanent(format!("invalid header name: {e}")))?;
            let value = HeaderValue::from_str(value)
                .map_err(|e| SenderError::Permanent(format!("invalid header value: {e}")))?;
            header_map.insert(name, value);
        }

        let response = self
            .client
            .post(url)
            .headers(header_map)
            .timeout(REQUEST_TIMEOUT)
            .json(&Self::payload(note))
            .send()
            .await?;

        let status = response.status();
        if status.is_success() {
            Ok(None)
        } else if status.is_server_error() {
            Err(SenderError::Transient(format!(
                "webhook returned {status}"
            )))
        } else {
            Err(SenderError::Permanent(format!(
                "webhook returned {status}"
            )))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use store::{IncidentKind, IncidentStatus, IncidentTransition};
    use uuid::Uuid;

    #[test]
    fn test_payload_shape() {
        let note = AlertNote {
            incident_id: Uuid::new_v4(),
            monitor_name: "nightly-backup".to_string(),
            kind: IncidentKind::Missed,
            status: IncidentStatus::Open,
            transition: IncidentTransition::Opened,
            summary: "missed expected run".to_string(),
            opened_at: Utc::now(),
            thread_key: None,
        };
        let payload = WebhookSender::payload(&note);
        assert_eq!(payload["event"], "incident.opened");
        assert_eq!(payload["incident"]["kind"], "MISSED");
        assert_eq!(payload["monitor"]["name"], "nightly-backup");
    }
}
