//! Data model: scheduled items, job-tree tasks and their log entries.

use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::{ReportClawError, Result};

macro_rules! id_type {
    ($(#[$meta:meta])* $name:ident) => {
        $(#[$meta])*
        #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
        #[serde(transparent)]
        pub struct $name(pub Uuid);

        impl $name {
            pub fn new() -> Self {
                Self(Uuid::new_v4())
            }
        }

        impl Default for $name {
            fn default() -> Self {
                Self::new()
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                self.0.fmt(f)
            }
        }

        impl FromStr for $name {
            type Err = ReportClawError;

            fn from_str(s: &str) -> Result<Self> {
                Uuid::parse_str(s.trim())
                    .map(Self)
                    .map_err(|e| ReportClawError::Validation(format!("invalid id '{s}': {e}")))
            }
        }
    };
}

id_type!(
    /// Identity of a scheduled item (or of a transient ad-hoc request).
    ItemId
);
id_type!(
    /// Identity of one task node.
    TaskId
);

/// A job is identified by its root task.
pub type JobId = TaskId;

// ─── Scheduled items ──────────────────────────────────────

/// What the report is computed from. Exactly one of chart or dashboard.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", content = "id", rename_all = "snake_case")]
pub enum Target {
    Chart(String),
    Dashboard(String),
}

impl Target {
    /// Build a target from the two optional references a caller supplies.
    /// Blank strings count as absent.
    pub fn from_parts(chart: Option<String>, dashboard: Option<String>) -> Result<Self> {
        let chart = chart.filter(|c| !c.trim().is_empty());
        let dashboard = dashboard.filter(|d| !d.trim().is_empty());
        match (chart, dashboard) {
            (Some(c), None) => Ok(Self::Chart(c)),
            (None, Some(d)) => Ok(Self::Dashboard(d)),
            (Some(_), Some(_)) => Err(ReportClawError::Validation(
                "target must reference a chart or a dashboard, not both".into(),
            )),
            (None, None) => Err(ReportClawError::Validation(
                "target must reference a chart or a dashboard".into(),
            )),
        }
    }

    pub fn reference(&self) -> &str {
        match self {
            Self::Chart(id) | Self::Dashboard(id) => id,
        }
    }

    pub fn kind(&self) -> &'static str {
        match self {
            Self::Chart(_) => "chart",
            Self::Dashboard(_) => "dashboard",
        }
    }
}

/// Output format of the computed report.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DeliveryFormat {
    Csv,
    Image,
}

impl DeliveryFormat {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Csv => "csv",
            Self::Image => "image",
        }
    }

    /// Human-facing label.
    pub fn label(&self) -> &'static str {
        match self {
            Self::Csv => "CSV",
            Self::Image => "Image",
        }
    }
}

impl FromStr for DeliveryFormat {
    type Err = ReportClawError;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "csv" => Ok(Self::Csv),
            "image" | "png" => Ok(Self::Image),
            other => Err(ReportClawError::Validation(format!("unknown format '{other}'"))),
        }
    }
}

/// Cron expression plus the timezone it is evaluated in.
/// Parsing lives with the scheduler; this is the stored form.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Cadence {
    pub expression: String,
    #[serde(default = "default_timezone")]
    pub timezone: String,
}

fn default_timezone() -> String {
    "UTC".into()
}

impl Cadence {
    pub fn new(expression: &str, timezone: &str) -> Self {
        Self {
            expression: expression.trim().to_string(),
            timezone: timezone.trim().to_string(),
        }
    }

    pub fn utc(expression: &str) -> Self {
        Self::new(expression, "UTC")
    }
}

/// Where one delivery goes. Each destination becomes one child task.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Destination {
    Email {
        recipients: Vec<String>,
    },
    /// A chat channel name, or an incoming-webhook URL.
    Chat {
        channel: String,
    },
    Spreadsheet {
        spreadsheet_id: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        tab: Option<String>,
    },
}

impl Destination {
    /// The delivery task kind that serves this destination.
    pub fn task_kind(&self) -> TaskKind {
        match self {
            Self::Email { .. } => TaskKind::EmailNotify,
            Self::Chat { .. } => TaskKind::ChatNotify,
            Self::Spreadsheet { .. } => TaskKind::SpreadsheetExport,
        }
    }

    pub fn validate(&self) -> Result<()> {
        match self {
            Self::Email { recipients } => {
                if recipients.is_empty() {
                    return Err(ReportClawError::Validation(
                        "email destination needs at least one recipient".into(),
                    ));
                }
                if let Some(bad) = recipients.iter().find(|r| !r.contains('@')) {
                    return Err(ReportClawError::Validation(format!(
                        "invalid email recipient '{bad}'"
                    )));
                }
            }
            Self::Chat { channel } => {
                if channel.trim().is_empty() {
                    return Err(ReportClawError::Validation("chat channel is empty".into()));
                }
            }
            Self::Spreadsheet { spreadsheet_id, .. } => {
                if spreadsheet_id.trim().is_empty() {
                    return Err(ReportClawError::Validation("spreadsheet id is empty".into()));
                }
            }
        }
        Ok(())
    }

    /// Short description for logs and history rows.
    pub fn describe(&self) -> String {
        match self {
            Self::Email { recipients } => format!("email:{}", recipients.join(",")),
            Self::Chat { channel } => format!("chat:{channel}"),
            Self::Spreadsheet { spreadsheet_id, tab } => match tab {
                Some(tab) => format!("sheet:{spreadsheet_id}/{tab}"),
                None => format!("sheet:{spreadsheet_id}"),
            },
        }
    }
}

/// A recurring report-delivery definition.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ScheduledItem {
    pub id: ItemId,
    pub name: String,
    pub organization_id: String,
    pub project_id: String,
    pub target: Target,
    pub format: DeliveryFormat,
    pub cadence: Cadence,
    pub destinations: Vec<Destination>,
    /// User id of the creator.
    pub owner: String,
    pub enabled: bool,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    /// Start of the current schedule: set on create, on resume and when the
    /// cadence changes. Occurrences before it never fire.
    pub active_since: DateTime<Utc>,
    /// Soft-deletion marker; history stays queryable.
    pub deleted_at: Option<DateTime<Utc>>,
}

impl ScheduledItem {
    pub fn is_deleted(&self) -> bool {
        self.deleted_at.is_some()
    }

    /// Eligible for automatic triggering.
    pub fn is_active(&self) -> bool {
        self.enabled && !self.is_deleted()
    }

    /// Freeze the parts of the item a job needs. Later edits to the item do not
    /// reach jobs created from an earlier snapshot.
    pub fn snapshot(&self, requested_by: Option<&str>) -> ItemSnapshot {
        ItemSnapshot {
            item_id: self.id,
            transient: false,
            name: self.name.clone(),
            organization_id: self.organization_id.clone(),
            project_id: self.project_id.clone(),
            target: self.target.clone(),
            format: self.format,
            destinations: self.destinations.clone(),
            owner: self.owner.clone(),
            requested_by: requested_by.map(str::to_string),
        }
    }
}

/// Caller-supplied fields for creating or replacing an item.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ItemDraft {
    pub name: String,
    pub project_id: String,
    #[serde(default)]
    pub chart: Option<String>,
    #[serde(default)]
    pub dashboard: Option<String>,
    pub format: DeliveryFormat,
    pub cadence: Cadence,
    pub destinations: Vec<Destination>,
    #[serde(default = "default_true")]
    pub enabled: bool,
}

fn default_true() -> bool {
    true
}

/// The frozen copy of an item that a job runs against.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ItemSnapshot {
    pub item_id: ItemId,
    /// True for ad-hoc exports that have no persisted item behind them.
    #[serde(default)]
    pub transient: bool,
    pub name: String,
    pub organization_id: String,
    pub project_id: String,
    pub target: Target,
    pub format: DeliveryFormat,
    pub destinations: Vec<Destination>,
    pub owner: String,
    #[serde(default)]
    pub requested_by: Option<String>,
}

/// A one-off spreadsheet export request that is not backed by a stored item.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AdHocExport {
    pub organization_id: String,
    pub project_id: String,
    pub target: Target,
    pub spreadsheet_id: String,
    #[serde(default)]
    pub tab: Option<String>,
    #[serde(default)]
    pub title: Option<String>,
}

impl AdHocExport {
    /// Snapshot for a transient item, requested by `user_id`.
    pub fn snapshot(&self, user_id: &str) -> ItemSnapshot {
        ItemSnapshot {
            item_id: ItemId::new(),
            transient: true,
            name: self
                .title
                .clone()
                .unwrap_or_else(|| format!("Export {} {}", self.target.kind(), self.target.reference())),
            organization_id: self.organization_id.clone(),
            project_id: self.project_id.clone(),
            target: self.target.clone(),
            format: DeliveryFormat::Csv,
            destinations: vec![Destination::Spreadsheet {
                spreadsheet_id: self.spreadsheet_id.clone(),
                tab: self.tab.clone(),
            }],
            owner: user_id.to_string(),
            requested_by: Some(user_id.to_string()),
        }
    }
}

// ─── Actors and authorization vocabulary ──────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OrgRole {
    Viewer,
    Editor,
    Admin,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Action {
    View,
    Manage,
}

/// Kinds of resource a grant can cover.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Subject {
    ScheduledDelivery,
    ExportCsv,
}

/// A capability held by an actor, optionally limited to one project.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Grant {
    pub action: Action,
    pub subject: Subject,
    /// `None` covers every project in the actor's organization.
    #[serde(default)]
    pub project_id: Option<String>,
}

/// Who is asking.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Actor {
    pub user_id: String,
    pub organization_id: String,
    pub role: OrgRole,
    #[serde(default)]
    pub grants: Vec<Grant>,
}

impl Actor {
    pub fn new(user_id: &str, organization_id: &str, role: OrgRole) -> Self {
        Self {
            user_id: user_id.to_string(),
            organization_id: organization_id.to_string(),
            role,
            grants: Vec::new(),
        }
    }

    pub fn with_grant(mut self, action: Action, subject: Subject, project_id: Option<&str>) -> Self {
        self.grants.push(Grant {
            action,
            subject,
            project_id: project_id.map(str::to_string),
        });
        self
    }

    pub fn is_org_admin(&self, organization_id: &str) -> bool {
        self.role == OrgRole::Admin && self.organization_id == organization_id
    }
}

/// The resource a submission targets.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Resource {
    ScheduledItem {
        organization_id: String,
        project_id: String,
        owner: String,
    },
    ExportCsv {
        organization_id: String,
        project_id: String,
    },
}

// ─── Tasks ────────────────────────────────────────────────

/// Closed set of task kinds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskKind {
    /// Computes the report for a scheduled item, then fans out.
    RootDelivery,
    /// Root of an on-demand ad-hoc export.
    AdHocExport,
    EmailNotify,
    ChatNotify,
    SpreadsheetExport,
}

impl TaskKind {
    pub const ALL: [TaskKind; 5] = [
        TaskKind::RootDelivery,
        TaskKind::AdHocExport,
        TaskKind::EmailNotify,
        TaskKind::ChatNotify,
        TaskKind::SpreadsheetExport,
    ];

    pub fn is_root(&self) -> bool {
        matches!(self, Self::RootDelivery | Self::AdHocExport)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::RootDelivery => "root_delivery",
            Self::AdHocExport => "ad_hoc_export",
            Self::EmailNotify => "email_notify",
            Self::ChatNotify => "chat_notify",
            Self::SpreadsheetExport => "spreadsheet_export",
        }
    }

    /// Label used in history views.
    pub fn label(&self) -> &'static str {
        match self {
            Self::RootDelivery => "Scheduled delivery",
            Self::AdHocExport => "On-demand export",
            Self::EmailNotify => "Email notification",
            Self::ChatNotify => "Chat notification",
            Self::SpreadsheetExport => "Spreadsheet export",
        }
    }
}

impl fmt::Display for TaskKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for TaskKind {
    type Err = ReportClawError;

    fn from_str(s: &str) -> Result<Self> {
        Self::ALL
            .into_iter()
            .find(|k| k.as_str() == s)
            .ok_or_else(|| ReportClawError::Invariant(format!("unknown task kind '{s}'")))
    }
}

/// Task lifecycle: `scheduled → started → {completed | error}`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskStatus {
    Scheduled,
    Started,
    Completed,
    Error,
}

impl TaskStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed | Self::Error)
    }

    /// Whether `next` is the single legal step after `self`.
    pub fn can_advance_to(&self, next: TaskStatus) -> bool {
        matches!(
            (self, next),
            (Self::Scheduled, Self::Started)
                | (Self::Started, Self::Completed)
                | (Self::Started, Self::Error)
        )
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Scheduled => "scheduled",
            Self::Started => "started",
            Self::Completed => "completed",
            Self::Error => "error",
        }
    }
}

impl fmt::Display for TaskStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for TaskStatus {
    type Err = ReportClawError;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "scheduled" => Ok(Self::Scheduled),
            "started" => Ok(Self::Started),
            "completed" => Ok(Self::Completed),
            "error" => Ok(Self::Error),
            other => Err(ReportClawError::Invariant(format!("unknown task status '{other}'"))),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureKind {
    /// The executor reported a failure.
    Execution,
    /// The task could not run at all (unregistered kind, malformed tree).
    Invariant,
}

/// Structured failure recorded on a task in `error`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FailureDetail {
    pub kind: FailureKind,
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub detail: Option<String>,
}

impl FailureDetail {
    pub fn execution(message: impl Into<String>) -> Self {
        Self {
            kind: FailureKind::Execution,
            message: message.into(),
            detail: None,
        }
    }

    pub fn invariant(message: impl Into<String>) -> Self {
        Self {
            kind: FailureKind::Invariant,
            message: message.into(),
            detail: None,
        }
    }

    pub fn with_detail(mut self, detail: impl Into<String>) -> Self {
        self.detail = Some(detail.into());
        self
    }
}

impl fmt::Display for FailureDetail {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.detail {
            Some(detail) => write!(f, "{} ({detail})", self.message),
            None => f.write_str(&self.message),
        }
    }
}

/// One node of a job tree.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Task {
    pub id: TaskId,
    /// `None` for roots.
    pub parent_id: Option<TaskId>,
    pub item_id: ItemId,
    pub kind: TaskKind,
    pub scheduled_time: DateTime<Utc>,
    /// The cadence occurrence a triggered root was created for.
    pub occurrence: Option<DateTime<Utc>>,
    pub status: TaskStatus,
    pub created_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
    pub error: Option<FailureDetail>,
    /// Delivery target of a child task.
    pub destination: Option<Destination>,
    /// Item snapshot carried by root tasks.
    pub snapshot: Option<ItemSnapshot>,
    pub requested_by: Option<String>,
    /// The task this one re-runs.
    pub retry_of: Option<TaskId>,
}

impl Task {
    /// A fresh root task in `scheduled`.
    pub fn root(
        kind: TaskKind,
        snapshot: ItemSnapshot,
        scheduled_time: DateTime<Utc>,
        occurrence: Option<DateTime<Utc>>,
    ) -> Self {
        Self {
            id: TaskId::new(),
            parent_id: None,
            item_id: snapshot.item_id,
            kind,
            scheduled_time,
            occurrence,
            status: TaskStatus::Scheduled,
            created_at: Utc::now(),
            started_at: None,
            completed_at: None,
            error: None,
            destination: None,
            requested_by: snapshot.requested_by.clone(),
            snapshot: Some(snapshot),
            retry_of: None,
        }
    }

    /// A fresh delivery child of `parent` in `scheduled`.
    pub fn child(parent: &Task, destination: Destination) -> Self {
        let now = Utc::now();
        Self {
            id: TaskId::new(),
            parent_id: Some(parent.id),
            item_id: parent.item_id,
            kind: destination.task_kind(),
            scheduled_time: now,
            occurrence: parent.occurrence,
            status: TaskStatus::Scheduled,
            created_at: now,
            started_at: None,
            completed_at: None,
            error: None,
            destination: Some(destination),
            snapshot: None,
            requested_by: parent.requested_by.clone(),
            retry_of: None,
        }
    }

    pub fn is_root(&self) -> bool {
        self.parent_id.is_none()
    }
}

/// Immutable record of one status transition.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LogEntry {
    /// Store-assigned sequence, monotonic per store.
    pub seq: i64,
    pub task_id: TaskId,
    pub parent_id: Option<TaskId>,
    pub item_id: ItemId,
    pub kind: TaskKind,
    pub status: TaskStatus,
    pub scheduled_time: DateTime<Utc>,
    pub at: DateTime<Utc>,
    pub error: Option<FailureDetail>,
}

/// A computed report ready for delivery.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ReportArtifact {
    pub url: String,
    pub file_name: String,
    pub format: DeliveryFormat,
    #[serde(default)]
    pub rows: Option<u64>,
}

/// What an executor returns on success.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct TaskOutput {
    pub artifact: Option<ReportArtifact>,
    pub detail: Option<String>,
}

impl TaskOutput {
    pub fn with_artifact(artifact: ReportArtifact) -> Self {
        Self {
            artifact: Some(artifact),
            detail: None,
        }
    }

    pub fn with_detail(detail: impl Into<String>) -> Self {
        Self {
            artifact: None,
            detail: Some(detail.into()),
        }
    }
}
