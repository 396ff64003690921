//! Client for the report render service.
//!
//! `POST {base_url}/api/v1/render` with the item's target and format; the
//! service answers with a download URL for the produced file.

use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use reportclaw_core::config::RenderConfig;
use reportclaw_core::error::{ReportClawError, Result};
use reportclaw_core::traits::ReportRenderer;
use reportclaw_core::types::{DeliveryFormat, ItemSnapshot, ReportArtifact};

pub struct HttpReportRenderer {
    client: reqwest::Client,
    config: RenderConfig,
}

#[derive(Debug, Serialize)]
struct RenderRequest<'a> {
    organization_id: &'a str,
    project_id: &'a str,
    target_kind: &'a str,
    target_id: &'a str,
    format: DeliveryFormat,
}

#[derive(Debug, Deserialize)]
struct RenderResponse {
    url: String,
    #[serde(default)]
    file_name: Option<String>,
    #[serde(default)]
    rows: Option<u64>,
}

impl HttpReportRenderer {
    pub fn new(config: RenderConfig) -> Self {
        Self {
            client: reqwest::Client::new(),
            config,
        }
    }

    fn endpoint(&self) -> String {
        format!("{}/api/v1/render", self.config.base_url.trim_end_matches('/'))
    }
}

fn request(snapshot: &ItemSnapshot) -> RenderRequest<'_> {
    RenderRequest {
        organization_id: &snapshot.organization_id,
        project_id: &snapshot.project_id,
        target_kind: snapshot.target.kind(),
        target_id: snapshot.target.reference(),
        format: snapshot.format,
    }
}

fn extension(format: DeliveryFormat) -> &'static str {
    match format {
        DeliveryFormat::Csv => "csv",
        DeliveryFormat::Image => "png",
    }
}

fn into_artifact(resp: RenderResponse, snapshot: &ItemSnapshot) -> ReportArtifact {
    let file_name = resp.file_name.unwrap_or_else(|| {
        format!(
            "{}-{}.{}",
            snapshot.target.kind(),
            snapshot.target.reference(),
            extension(snapshot.format)
        )
    });
    ReportArtifact {
        url: resp.url,
        file_name,
        format: snapshot.format,
        rows: resp.rows,
    }
}

#[async_trait]
impl ReportRenderer for HttpReportRenderer {
    async fn render(&self, snapshot: &ItemSnapshot) -> Result<ReportArtifact> {
        let mut req = self
            .client
            .post(self.endpoint())
            .json(&request(snapshot))
            .timeout(Duration::from_secs(self.config.timeout_secs));
        if !self.config.api_token.is_empty() {
            req = req.bearer_auth(&self.config.api_token);
        }
        let resp = req
            .send()
            .await
            .map_err(|e| ReportClawError::Transport(format!("Render request failed: {e}")))?;

        if !resp.status().is_success() {
            let status = resp.status();
            let body = resp.text().await.unwrap_or_default();
            return Err(ReportClawError::Transport(format!(
                "Render service error {status}: {}",
                crate::truncate_body(&body)
            )));
        }
        let parsed: RenderResponse = resp
            .json()
            .await
            .map_err(|e| ReportClawError::Transport(format!("Invalid render response: {e}")))?;
        tracing::debug!(
            target_kind = snapshot.target.kind(),
            target_id = snapshot.target.reference(),
            "🖨️ Report rendered"
        );
        Ok(into_artifact(parsed, snapshot))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use reportclaw_core::types::{ItemId, Target};

    fn snapshot() -> ItemSnapshot {
        ItemSnapshot {
            item_id: ItemId::new(),
            transient: true,
            name: "Export".into(),
            organization_id: "org-1".into(),
            project_id: "proj-1".into(),
            target: Target::Chart("c-1".into()),
            format: DeliveryFormat::Csv,
            destinations: Vec::new(),
            owner: "u1".into(),
            requested_by: Some("u1".into()),
        }
    }

    #[test]
    fn test_endpoint_ignores_trailing_slash() {
        let renderer = HttpReportRenderer::new(RenderConfig {
            base_url: "http://render.local/".into(),
            ..Default::default()
        });
        assert_eq!(renderer.endpoint(), "http://render.local/api/v1/render");
    }

    #[test]
    fn test_request_body() {
        let snap = snapshot();
        let body = serde_json::to_value(request(&snap)).unwrap();
        assert_eq!(body["target_kind"], "chart");
        assert_eq!(body["target_id"], "c-1");
        assert_eq!(body["project_id"], "proj-1");
    }

    #[test]
    fn test_artifact_defaults_file_name() {
        let resp: RenderResponse =
            serde_json::from_str(r#"{"url":"https://f.example.com/x","rows":3}"#).unwrap();
        let artifact = into_artifact(resp, &snapshot());
        assert_eq!(artifact.file_name, "chart-c-1.csv");
        assert_eq!(artifact.rows, Some(3));
        assert_eq!(artifact.format, DeliveryFormat::Csv);
    }
}
