//! Email delivery over SMTP (lettre, STARTTLS).

use async_trait::async_trait;
use lettre::{
    AsyncSmtpTransport, AsyncTransport, Message as LettreMessage, message::Mailbox,
    message::header::ContentType, transport::smtp::authentication::Credentials,
};
use reportclaw_core::config::EmailConfig;
use reportclaw_core::error::{ReportClawError, Result};
use reportclaw_core::traits::EmailTransport;
use reportclaw_core::types::{ItemSnapshot, ReportArtifact};

/// Sends one message per delivery, addressed to every recipient.
pub struct SmtpEmailTransport {
    config: EmailConfig,
}

impl SmtpEmailTransport {
    pub fn new(config: EmailConfig) -> Self {
        Self { config }
    }

    /// Build the message without sending it.
    pub fn compose(
        &self,
        recipients: &[String],
        snapshot: &ItemSnapshot,
        artifact: &ReportArtifact,
    ) -> Result<LettreMessage> {
        let from: Mailbox = self
            .config
            .from
            .parse()
            .map_err(|e| ReportClawError::Transport(format!("Invalid from: {e}")))?;
        let mut builder = LettreMessage::builder().from(from).subject(subject(snapshot));
        for recipient in recipients {
            let to: Mailbox = recipient
                .parse()
                .map_err(|e| ReportClawError::Transport(format!("Invalid to '{recipient}': {e}")))?;
            builder = builder.to(to);
        }
        builder
            .header(ContentType::TEXT_PLAIN)
            .body(body(snapshot, artifact))
            .map_err(|e| ReportClawError::Transport(format!("Build email: {e}")))
    }
}

fn subject(snapshot: &ItemSnapshot) -> String {
    format!("[ReportClaw] {}", snapshot.name)
}

fn body(snapshot: &ItemSnapshot, artifact: &ReportArtifact) -> String {
    let mut text = format!(
        "Your scheduled {} delivery \"{}\" is ready.\n\n{} {}: {}\n",
        artifact.format.label(),
        snapshot.name,
        capitalize(snapshot.target.kind()),
        snapshot.target.reference(),
        artifact.url,
    );
    if let Some(rows) = artifact.rows {
        text.push_str(&format!("Rows: {rows}\n"));
    }
    if let Some(user) = &snapshot.requested_by {
        text.push_str(&format!("\nRequested by {user}.\n"));
    }
    text
}

fn capitalize(word: &str) -> String {
    let mut chars = word.chars();
    match chars.next() {
        Some(first) => first.to_uppercase().chain(chars).collect(),
        None => String::new(),
    }
}

#[async_trait]
impl EmailTransport for SmtpEmailTransport {
    async fn send_report(
        &self,
        recipients: &[String],
        snapshot: &ItemSnapshot,
        artifact: &ReportArtifact,
    ) -> Result<()> {
        if self.config.smtp_host.is_empty() {
            return Err(ReportClawError::Transport("SMTP host not configured".into()));
        }
        let email = self.compose(recipients, snapshot, artifact)?;

        let creds = Credentials::new(self.config.username.clone(), self.config.password.clone());
        let mailer = AsyncSmtpTransport::<lettre::Tokio1Executor>::starttls_relay(
            &self.config.smtp_host,
        )
        .map_err(|e| ReportClawError::Transport(format!("SMTP relay: {e}")))?
        .port(self.config.smtp_port)
        .credentials(creds)
        .build();

        mailer
            .send(email)
            .await
            .map_err(|e| ReportClawError::Transport(format!("SMTP send: {e}")))?;

        tracing::info!("📤 Email sent to: {}", recipients.join(", "));
        Ok(())
    }
}
