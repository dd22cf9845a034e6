//! Slack incoming-webhook channel.

use serde_json::{json, Value};
use tracing::{debug, warn};

use crate::errors::NotificationError;

pub struct SlackNotifier {
    webhook_url: String,
    http: reqwest::Client,
}

impl SlackNotifier {
    pub fn new(webhook_url: String) -> Self {
        Self {
            webhook_url,
            http: reqwest::Client::new(),
        }
    }

    /// Post `message` (Slack mrkdwn) to the webhook.
    pub async fn send_message(&self, message: &str) -> Result<(), NotificationError> {
        debug!(len = message.len(), "posting to Slack");

        let resp = self.http.post(&self.webhook_url).json(&payload(message)).send().await?;
        let status = resp.status();
        if !status.is_success() {
            let body = resp.text().await.unwrap_or_default();
            warn!(%status, %body, "Slack webhook refused message");
            return Err(NotificationError::SlackError(format!("HTTP {status}: {body}")));
        }
        Ok(())
    }
}

fn payload(message: &str) -> Value {
    json!({
        "text": message,
        "unfurl_links": false,
        "unfurl_media": false,
    })
}
