//! Spreadsheet export: download the rendered CSV and write its rows into a
//! sheet tab through the Sheets v4 values API.

use std::time::Duration;

use async_trait::async_trait;
use reportclaw_core::config::SpreadsheetConfig;
use reportclaw_core::error::{ReportClawError, Result};
use reportclaw_core::traits::SpreadsheetUploader;
use reportclaw_core::types::{DeliveryFormat, ItemSnapshot, ReportArtifact};

pub struct HttpSpreadsheetUploader {
    client: reqwest::Client,
    config: SpreadsheetConfig,
}

impl HttpSpreadsheetUploader {
    pub fn new(config: SpreadsheetConfig) -> Self {
        Self {
            client: reqwest::Client::new(),
            config,
        }
    }

    /// `{base}/spreadsheets/{id}/values/{range}?valueInputOption=RAW`
    fn values_url(&self, spreadsheet_id: &str, tab: Option<&str>) -> Result<reqwest::Url> {
        let mut url = reqwest::Url::parse(&self.config.api_base_url)
            .map_err(|e| ReportClawError::Config(format!("Invalid spreadsheet API URL: {e}")))?;
        url.path_segments_mut()
            .map_err(|_| ReportClawError::Config("Spreadsheet API URL cannot be a base".into()))?
            .pop_if_empty()
            .push("spreadsheets")
            .push(spreadsheet_id)
            .push("values")
            .push(&range(tab));
        url.query_pairs_mut().append_pair("valueInputOption", "RAW");
        Ok(url)
    }

    fn timeout(&self) -> Duration {
        Duration::from_secs(self.config.timeout_secs)
    }

    async fn download(&self, artifact: &ReportArtifact) -> Result<String> {
        let resp = self
            .client
            .get(&artifact.url)
            .timeout(self.timeout())
            .send()
            .await
            .map_err(|e| ReportClawError::Transport(format!("Report download failed: {e}")))?;
        if !resp.status().is_success() {
            return Err(ReportClawError::Transport(format!(
                "Report download error {}",
                resp.status()
            )));
        }
        resp.text()
            .await
            .map_err(|e| ReportClawError::Transport(format!("Report download failed: {e}")))
    }
}

fn range(tab: Option<&str>) -> String {
    match tab {
        Some(tab) => format!("'{}'!A1", tab.replace('\'', "''")),
        None => "A1".to_string(),
    }
}

/// Link shown to users for a spreadsheet id.
pub fn sheet_url(spreadsheet_id: &str) -> String {
    format!("https://docs.google.com/spreadsheets/d/{spreadsheet_id}")
}

/// Split CSV text into rows. Quoted fields may contain commas, newlines and
/// doubled quotes.
pub fn parse_csv(text: &str) -> Vec<Vec<String>> {
    let mut rows = Vec::new();
    let mut row = Vec::new();
    let mut field = String::new();
    let mut quoted = false;
    let mut chars = text.chars().peekable();

    while let Some(c) = chars.next() {
        if quoted {
            match c {
                '"' if chars.peek() == Some(&'"') => {
                    field.push('"');
                    chars.next();
                }
                '"' => quoted = false,
                _ => field.push(c),
            }
            continue;
        }
        match c {
            '"' if field.is_empty() => quoted = true,
            ',' => row.push(std::mem::take(&mut field)),
            '\r' => {}
            '\n' => {
                row.push(std::mem::take(&mut field));
                rows.push(std::mem::take(&mut row));
            }
            _ => field.push(c),
        }
    }
    if !field.is_empty() || !row.is_empty() {
        row.push(field);
        rows.push(row);
    }
    rows
}

#[async_trait]
impl SpreadsheetUploader for HttpSpreadsheetUploader {
    async fn upload(
        &self,
        spreadsheet_id: &str,
        tab: Option<&str>,
        _snapshot: &ItemSnapshot,
        artifact: &ReportArtifact,
    ) -> Result<String> {
        if self.config.access_token.is_empty() {
            return Err(ReportClawError::Transport(
                "Spreadsheet access token not configured".into(),
            ));
        }
        if artifact.format != DeliveryFormat::Csv {
            return Err(ReportClawError::Transport(format!(
                "Spreadsheet export needs CSV, got {}",
                artifact.format.label()
            )));
        }

        let rows = parse_csv(&self.download(artifact).await?);
        let url = self.values_url(spreadsheet_id, tab)?;
        let resp = self
            .client
            .put(url)
            .bearer_auth(&self.config.access_token)
            .json(&serde_json::json!({
                "range": range(tab),
                "majorDimension": "ROWS",
                "values": rows,
            }))
            .timeout(self.timeout())
            .send()
            .await
            .map_err(|e| ReportClawError::Transport(format!("Sheets request failed: {e}")))?;

        if !resp.status().is_success() {
            let status = resp.status();
            let body = resp.text().await.unwrap_or_default();
            return Err(ReportClawError::Transport(format!(
                "Sheets API error {status}: {}",
                crate::truncate_body(&body)
            )));
        }
        tracing::info!("📤 {} rows written to sheet {spreadsheet_id}", rows.len());
        Ok(sheet_url(spreadsheet_id))
    }
}
