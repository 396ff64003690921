//! Collaborator interfaces implemented outside the scheduling core.
//!
//! The render service computes a report; the transports deliver it. Their
//! protocols are not the scheduler's concern: they succeed or fail with a
//! human-readable message.

use async_trait::async_trait;

use crate::error::Result;
use crate::types::{ItemSnapshot, ReportArtifact};

/// Computes the report an item targets.
#[async_trait]
pub trait ReportRenderer: Send + Sync {
    async fn render(&self, snapshot: &ItemSnapshot) -> Result<ReportArtifact>;
}

/// Sends a computed report by email.
#[async_trait]
pub trait EmailTransport: Send + Sync {
    async fn send_report(
        &self,
        recipients: &[String],
        snapshot: &ItemSnapshot,
        artifact: &ReportArtifact,
    ) -> Result<()>;
}

/// Posts a computed report to a chat channel.
#[async_trait]
pub trait ChatTransport: Send + Sync {
    async fn post_report(
        &self,
        channel: &str,
        snapshot: &ItemSnapshot,
        artifact: &ReportArtifact,
    ) -> Result<()>;
}

/// Uploads a tabular report into a spreadsheet. Returns the sheet URL.
#[async_trait]
pub trait SpreadsheetUploader: Send + Sync {
    async fn upload(
        &self,
        spreadsheet_id: &str,
        tab: Option<&str>,
        snapshot: &ItemSnapshot,
        artifact: &ReportArtifact,
    ) -> Result<String>;
}
