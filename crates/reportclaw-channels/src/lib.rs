//! # ReportClaw Channels
//! Concrete collaborators behind the scheduler's transport traits.
//!
//! - [`render::HttpReportRenderer`] asks the render service for a report file
//! - [`email::SmtpEmailTransport`] mails a link to the report
//! - [`chat::WebhookChatTransport`] posts to an incoming webhook
//! - [`spreadsheet::HttpSpreadsheetUploader`] writes CSV rows into a sheet tab

pub mod chat;
pub mod email;
pub mod render;
pub mod spreadsheet;

pub use chat::WebhookChatTransport;
pub use email::SmtpEmailTransport;
pub use render::HttpReportRenderer;
pub use spreadsheet::HttpSpreadsheetUploader;

/// Shorten a response body for error messages.
pub(crate) fn truncate_body(body: &str) -> &str {
    match body.char_indices().nth(200) {
        Some((idx, _)) => &body[..idx],
        None => body,
    }
}
