//! Read model over the log store: job trees, item history and the
//! per-project overview. Tree health is derived here, never stored.

use chrono::{DateTime, Utc};
use serde::Serialize;

use reportclaw_core::error::{ReportClawError, Result};
use reportclaw_core::types::{ItemId, JobId, LogEntry, Task, TaskKind, TaskStatus};

use crate::logstore::LogStore;
use crate::registry::SchedulerRegistry;

/// A task with its latest log entry.
#[derive(Debug, Clone, Serialize)]
pub struct TaskView {
    pub task: Task,
    pub latest: Option<LogEntry>,
}

/// Aggregate outcome of a job, computed from its tasks.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum TreeHealth {
    /// Root not started yet.
    Pending,
    /// Root or some delivery still in progress.
    Running,
    Succeeded,
    /// Report computed, at least one delivery failed.
    PartialFailure,
    /// Report could not be computed.
    Failed,
}

impl TreeHealth {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Running => "running",
            Self::Succeeded => "succeeded",
            Self::PartialFailure => "partial_failure",
            Self::Failed => "failed",
        }
    }
}

impl std::fmt::Display for TreeHealth {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A root and its deliveries.
#[derive(Debug, Clone, Serialize)]
pub struct JobTree {
    pub root: TaskView,
    pub children: Vec<TaskView>,
}

impl JobTree {
    pub fn job_id(&self) -> JobId {
        self.root.task.id
    }

    pub fn health(&self) -> TreeHealth {
        match self.root.task.status {
            TaskStatus::Scheduled => return TreeHealth::Pending,
            TaskStatus::Started => return TreeHealth::Running,
            TaskStatus::Error => return TreeHealth::Failed,
            TaskStatus::Completed => {}
        }
        let expected = self
            .root
            .task
            .snapshot
            .as_ref()
            .map_or(0, |s| s.destinations.len());
        if self.children.len() < expected {
            // Fan-out not written yet
            return TreeHealth::Running;
        }
        if self.children.iter().any(|c| !c.task.status.is_terminal()) {
            TreeHealth::Running
        } else if self.children.iter().any(|c| c.task.status == TaskStatus::Error) {
            TreeHealth::PartialFailure
        } else {
            TreeHealth::Succeeded
        }
    }
}

/// Load one job tree by root id.
pub async fn job_tree(store: &LogStore, job_id: JobId) -> Result<JobTree> {
    let root = store
        .get_task(job_id)
        .await?
        .ok_or_else(|| ReportClawError::NotFound(format!("job {job_id}")))?;
    if !root.is_root() {
        return Err(ReportClawError::Validation(format!(
            "task {job_id} is a delivery of job {}",
            root.parent_id.map(|p| p.to_string()).unwrap_or_default()
        )));
    }
    let root_latest = store.latest(root.id).await?;
    let mut children = Vec::new();
    for child in store.children(root.id).await? {
        let latest = store.latest(child.id).await?;
        children.push(TaskView {
            task: child,
            latest,
        });
    }
    Ok(JobTree {
        root: TaskView {
            task: root,
            latest: root_latest,
        },
        children,
    })
}

/// The most recent `limit` jobs of an item, newest first.
pub async fn history(store: &LogStore, item_id: ItemId, limit: usize) -> Result<Vec<JobTree>> {
    let rows = store.query_by_scheduled_item(item_id, limit).await?;
    let mut trees: Vec<JobTree> = Vec::new();
    for (task, entries) in rows {
        let view = TaskView {
            latest: entries.last().cloned(),
            task,
        };
        if view.task.is_root() {
            trees.push(JobTree {
                root: view,
                children: Vec::new(),
            });
        } else if let Some(tree) = trees.last_mut() {
            tree.children.push(view);
        }
    }
    Ok(trees)
}

/// Summary of the latest job of an item.
#[derive(Debug, Clone, Serialize)]
pub struct JobSummary {
    pub job_id: JobId,
    pub kind: TaskKind,
    pub scheduled_time: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub status: TaskStatus,
    pub health: TreeHealth,
    pub deliveries: Vec<DeliverySummary>,
}

#[derive(Debug, Clone, Serialize)]
pub struct DeliverySummary {
    pub kind: TaskKind,
    pub destination: String,
    pub status: TaskStatus,
    pub started_at: Option<DateTime<Utc>>,
    pub error: Option<String>,
}

/// One line of the per-project overview.
#[derive(Debug, Clone, Serialize)]
pub struct OverviewRow {
    pub item_id: ItemId,
    pub name: String,
    /// `chart:<id>` or `dashboard:<id>`.
    pub target: String,
    pub format: &'static str,
    pub owner: String,
    pub enabled: bool,
    pub next_run: Option<DateTime<Utc>>,
    /// `None` means no jobs yet.
    pub latest_job: Option<JobSummary>,
}

impl From<JobTree> for JobSummary {
    fn from(tree: JobTree) -> Self {
        let health = tree.health();
        let deliveries = tree
            .children
            .into_iter()
            .map(|c| DeliverySummary {
                kind: c.task.kind,
                destination: c
                    .task
                    .destination
                    .as_ref()
                    .map(|d| d.describe())
                    .unwrap_or_default(),
                status: c.task.status,
                started_at: c.task.started_at,
                error: c.task.error.map(|e| e.to_string()),
            })
            .collect();
        let root = tree.root.task;
        Self {
            job_id: root.id,
            kind: root.kind,
            scheduled_time: root.scheduled_time,
            started_at: root.started_at,
            status: root.status,
            health,
            deliveries,
        }
    }
}

/// Every live item of a project (or all projects) with its latest job.
pub async fn overview(
    registry: &SchedulerRegistry,
    store: &LogStore,
    project_id: Option<&str>,
    now: DateTime<Utc>,
) -> Result<Vec<OverviewRow>> {
    let mut rows = Vec::new();
    for item in registry.list(project_id)? {
        let latest_job = history(store, item.id, 1).await?.into_iter().next().map(JobSummary::from);
        rows.push(OverviewRow {
            item_id: item.id,
            target: format!("{}:{}", item.target.kind(), item.target.reference()),
            format: item.format.label(),
            next_run: registry.next_run(item.id, now)?,
            name: item.name,
            owner: item.owner,
            enabled: item.enabled,
            latest_job,
        });
    }
    Ok(rows)
}
