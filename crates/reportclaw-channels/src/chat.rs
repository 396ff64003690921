//! Chat delivery via incoming webhooks (Slack-compatible payload).

use std::collections::HashMap;
use std::time::Duration;

use async_trait::async_trait;
use reportclaw_core::config::ChatConfig;
use reportclaw_core::error::{ReportClawError, Result};
use reportclaw_core::traits::ChatTransport;
use reportclaw_core::types::{ItemSnapshot, ReportArtifact};

pub struct WebhookChatTransport {
    client: reqwest::Client,
    webhooks: HashMap<String, String>,
    timeout: Duration,
}

impl WebhookChatTransport {
    pub fn new(config: ChatConfig) -> Self {
        Self {
            client: reqwest::Client::new(),
            webhooks: config.webhooks,
            timeout: Duration::from_secs(config.timeout_secs),
        }
    }

    /// Webhook URL for a channel: a configured name, or a literal URL.
    pub fn webhook_url(&self, channel: &str) -> Result<String> {
        let channel = channel.trim_start_matches('#');
        if let Some(url) = self.webhooks.get(channel) {
            return Ok(url.clone());
        }
        if channel.starts_with("https://") || channel.starts_with("http://") {
            return Ok(channel.to_string());
        }
        Err(ReportClawError::Transport(format!(
            "No webhook configured for channel '{channel}'"
        )))
    }
}

fn payload(snapshot: &ItemSnapshot, artifact: &ReportArtifact) -> serde_json::Value {
    let mut text = format!(
        "*{}* ({} {}) is ready: <{}|{}>",
        snapshot.name,
        snapshot.target.kind(),
        snapshot.target.reference(),
        artifact.url,
        artifact.file_name,
    );
    if let Some(rows) = artifact.rows {
        text.push_str(&format!(" · {rows} rows"));
    }
    serde_json::json!({
        "text": text,
        "unfurl_links": artifact.format == reportclaw_core::types::DeliveryFormat::Image,
    })
}

#[async_trait]
impl ChatTransport for WebhookChatTransport {
    async fn post_report(
        &self,
        channel: &str,
        snapshot: &ItemSnapshot,
        artifact: &ReportArtifact,
    ) -> Result<()> {
        let url = self.webhook_url(channel)?;
        let resp = self
            .client
            .post(&url)
            .json(&payload(snapshot, artifact))
            .timeout(self.timeout)
            .send()
            .await
            .map_err(|e| ReportClawError::Transport(format!("Webhook request failed: {e}")))?;

        if !resp.status().is_success() {
            let status = resp.status();
            let body = resp.text().await.unwrap_or_default();
            return Err(ReportClawError::Transport(format!(
                "Webhook error {status}: {}",
                crate::truncate_body(&body)
            )));
        }
        tracing::info!("📤 Chat message posted to: {channel}");
        Ok(())
    }
}
