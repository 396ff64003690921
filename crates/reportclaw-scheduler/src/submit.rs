//! On-demand submission API.
//!
//! Every entry point consults the [`AuthorizationGate`] before any task is
//! created, so a rejected call leaves no trace in the log store.

use std::sync::Arc;

use chrono::Utc;

use reportclaw_core::error::{ReportClawError, Result};
use reportclaw_core::types::{
    Action, Actor, AdHocExport, ItemId, ItemSnapshot, Resource, Task, TaskId, TaskKind,
};

use crate::dispatch::{Dispatcher, JobTicket};
use crate::gate::{AuthorizationGate, authorize};

/// What to run now.
#[derive(Debug, Clone)]
pub enum SubmitRequest {
    /// Run a scheduled item immediately, enabled or not.
    Item(ItemId),
    /// One-off spreadsheet export with no stored item behind it.
    AdHoc(AdHocExport),
}

pub struct SubmissionService {
    dispatcher: Dispatcher,
    gate: Arc<dyn AuthorizationGate>,
}

impl SubmissionService {
    pub fn new(dispatcher: Dispatcher, gate: Arc<dyn AuthorizationGate>) -> Self {
        Self { dispatcher, gate }
    }

    /// Authorize and start a job with `scheduled_time = now`.
    pub async fn submit(&self, request: SubmitRequest, actor: &Actor) -> Result<JobTicket> {
        let (kind, snapshot) = match request {
            SubmitRequest::Item(id) => {
                let item = self.dispatcher.registry().get(id)?;
                if item.is_deleted() {
                    return Err(ReportClawError::NotFound(format!("scheduled item {id}")));
                }
                let resource = Resource::ScheduledItem {
                    organization_id: item.organization_id.clone(),
                    project_id: item.project_id.clone(),
                    owner: item.owner.clone(),
                };
                authorize(self.gate.as_ref(), actor, Action::Manage, &resource)?;
                (TaskKind::RootDelivery, item.snapshot(Some(&actor.user_id)))
            }
            SubmitRequest::AdHoc(export) => {
                let resource = Resource::ExportCsv {
                    organization_id: export.organization_id.clone(),
                    project_id: export.project_id.clone(),
                };
                authorize(self.gate.as_ref(), actor, Action::Manage, &resource)?;
                let snapshot = export.snapshot(&actor.user_id);
                for destination in &snapshot.destinations {
                    destination.validate()?;
                }
                (TaskKind::AdHocExport, snapshot)
            }
        };

        tracing::info!(
            item_id = %snapshot.item_id,
            user = %actor.user_id,
            kind = %kind,
            "▶️ On-demand job submitted"
        );
        let root = Task::root(kind, snapshot, Utc::now(), None);
        self.dispatcher.start_job(root).await
    }

    /// Retry a job (root id) or a single failed delivery (child id).
    pub async fn retry(&self, task_id: TaskId, actor: &Actor) -> Result<JobTicket> {
        let task = self
            .dispatcher
            .store()
            .get_task(task_id)
            .await?
            .ok_or_else(|| ReportClawError::NotFound(format!("task {task_id}")))?;
        let root = match task.parent_id {
            None => task.clone(),
            Some(parent_id) => self
                .dispatcher
                .store()
                .get_task(parent_id)
                .await?
                .ok_or_else(|| ReportClawError::NotFound(format!("task {parent_id}")))?,
        };
        let snapshot = root.snapshot.as_ref().ok_or_else(|| {
            ReportClawError::Invariant(format!("root {} carries no item snapshot", root.id))
        })?;
        authorize(self.gate.as_ref(), actor, Action::Manage, &resource_of(snapshot))?;

        if task.is_root() {
            self.dispatcher.retry_job(task_id, &actor.user_id).await
        } else {
            self.dispatcher.retry_delivery(task_id, &actor.user_id).await
        }
    }
}

fn resource_of(snapshot: &ItemSnapshot) -> Resource {
    if snapshot.transient {
        Resource::ExportCsv {
            organization_id: snapshot.organization_id.clone(),
            project_id: snapshot.project_id.clone(),
        }
    } else {
        Resource::ScheduledItem {
            organization_id: snapshot.organization_id.clone(),
            project_id: snapshot.project_id.clone(),
            owner: snapshot.owner.clone(),
        }
    }
}
