//! ReportClaw configuration system.

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

use crate::error::{ReportClawError, Result};

/// Root configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ReportClawConfig {
    #[serde(default)]
    pub scheduler: SchedulerConfig,
    #[serde(default)]
    pub render: RenderConfig,
    #[serde(default)]
    pub email: EmailConfig,
    #[serde(default)]
    pub chat: ChatConfig,
    #[serde(default)]
    pub spreadsheet: SpreadsheetConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
}

impl ReportClawConfig {
    /// Load config from the default path (~/.reportclaw/config.toml).
    pub fn load() -> Result<Self> {
        let path = Self::default_path();
        if path.exists() {
            Self::load_from(&path)
        } else {
            Ok(Self::default())
        }
    }

    /// Load config from a specific path.
    pub fn load_from(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .map_err(|e| ReportClawError::Config(format!("Failed to read config: {e}")))?;
        Self::from_toml(&content)
    }

    /// Parse and validate a TOML document.
    pub fn from_toml(content: &str) -> Result<Self> {
        let config: Self = toml::from_str(content)
            .map_err(|e| ReportClawError::Config(format!("Failed to parse config: {e}")))?;
        config.validate()?;
        Ok(config)
    }

    /// Save config to the given path.
    pub fn save_to(&self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let content = toml::to_string_pretty(self)
            .map_err(|e| ReportClawError::Config(format!("Failed to serialize config: {e}")))?;
        std::fs::write(path, content)?;
        Ok(())
    }

    /// Reject settings the engine cannot run with.
    pub fn validate(&self) -> Result<()> {
        if self.scheduler.poll_interval_secs == 0 {
            return Err(ReportClawError::Config(
                "scheduler.poll_interval_secs must be at least 1".into(),
            ));
        }
        if self.scheduler.render_workers == 0 || self.scheduler.deliver_workers == 0 {
            return Err(ReportClawError::Config(
                "scheduler.render_workers and scheduler.deliver_workers must be at least 1".into(),
            ));
        }
        Ok(())
    }

    /// Get the default config path.
    pub fn default_path() -> PathBuf {
        Self::home_dir().join("config.toml")
    }

    /// Get the ReportClaw home directory.
    pub fn home_dir() -> PathBuf {
        dirs::home_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join(".reportclaw")
    }
}

/// Trigger evaluation and worker pool settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SchedulerConfig {
    #[serde(default = "default_poll_interval")]
    pub poll_interval_secs: u64,
    #[serde(default = "default_db_path")]
    pub db_path: String,
    /// Concurrent root (report computation) executions.
    #[serde(default = "default_render_workers")]
    pub render_workers: usize,
    /// Concurrent delivery executions.
    #[serde(default = "default_deliver_workers")]
    pub deliver_workers: usize,
    /// How far back a missed occurrence is still fired after downtime.
    #[serde(default = "default_missed_lookback")]
    pub missed_lookback_mins: i64,
    /// Capacity of the trigger-event channel between evaluator and dispatcher.
    #[serde(default = "default_trigger_buffer")]
    pub trigger_buffer: usize,
}

fn default_poll_interval() -> u64 { 30 }
fn default_db_path() -> String { "~/.reportclaw/scheduler.db".into() }
fn default_render_workers() -> usize { 2 }
fn default_deliver_workers() -> usize { 8 }
fn default_missed_lookback() -> i64 { 24 * 60 }
fn default_trigger_buffer() -> usize { 256 }

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            poll_interval_secs: default_poll_interval(),
            db_path: default_db_path(),
            render_workers: default_render_workers(),
            deliver_workers: default_deliver_workers(),
            missed_lookback_mins: default_missed_lookback(),
            trigger_buffer: default_trigger_buffer(),
        }
    }
}

impl SchedulerConfig {
    /// Database path with `~` expanded.
    pub fn expanded_db_path(&self) -> PathBuf {
        PathBuf::from(shellexpand::tilde(&self.db_path).to_string())
    }
}

/// Report render service.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RenderConfig {
    #[serde(default = "default_render_url")]
    pub base_url: String,
    #[serde(default)]
    pub api_token: String,
    #[serde(default = "default_timeout")]
    pub timeout_secs: u64,
}

fn default_render_url() -> String { "http://127.0.0.1:8080".into() }
fn default_timeout() -> u64 { 30 }

impl Default for RenderConfig {
    fn default() -> Self {
        Self {
            base_url: default_render_url(),
            api_token: String::new(),
            timeout_secs: default_timeout(),
        }
    }
}

/// SMTP settings for email delivery.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EmailConfig {
    #[serde(default)]
    pub smtp_host: String,
    #[serde(default = "default_smtp_port")]
    pub smtp_port: u16,
    #[serde(default)]
    pub username: String,
    #[serde(default)]
    pub password: String,
    #[serde(default = "default_from")]
    pub from: String,
}

fn default_smtp_port() -> u16 { 587 }
fn default_from() -> String { "ReportClaw <reports@localhost>".into() }

impl Default for EmailConfig {
    fn default() -> Self {
        Self {
            smtp_host: String::new(),
            smtp_port: default_smtp_port(),
            username: String::new(),
            password: String::new(),
            from: default_from(),
        }
    }
}

/// Chat webhook delivery.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChatConfig {
    /// Channel name → incoming webhook URL.
    #[serde(default)]
    pub webhooks: std::collections::HashMap<String, String>,
    #[serde(default = "default_timeout")]
    pub timeout_secs: u64,
}

impl Default for ChatConfig {
    fn default() -> Self {
        Self {
            webhooks: Default::default(),
            timeout_secs: default_timeout(),
        }
    }
}

/// Spreadsheet export uploader.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SpreadsheetConfig {
    #[serde(default = "default_sheets_url")]
    pub api_base_url: String,
    #[serde(default)]
    pub access_token: String,
    #[serde(default = "default_timeout")]
    pub timeout_secs: u64,
}

fn default_sheets_url() -> String { "https://sheets.googleapis.com/v4".into() }

impl Default for SpreadsheetConfig {
    fn default() -> Self {
        Self {
            api_base_url: default_sheets_url(),
            access_token: String::new(),
            timeout_secs: default_timeout(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    #[serde(default = "default_level")]
    pub level: String,
    #[serde(default)]
    pub json: bool,
}

fn default_level() -> String { "info".into() }

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_level(),
            json: false,
        }
    }
}
