//! Job dispatcher: owns the job-tree state machine.
//!
//! A job is a root task plus, once the root completes, one child per
//! destination in the item snapshot. Each task moves
//! `scheduled → started → {completed | error}`; every step is appended to the
//! [`LogStore`] before anything else observes it. Children run concurrently
//! and independently: a failed delivery never touches its siblings or its
//! root. Tree health is left to readers (see [`crate::query`]).
//!
//! The log store is the only state: on startup [`Dispatcher::recover`] picks
//! up whatever a previous process left unfinished.

use std::collections::BTreeSet;
use std::sync::Arc;

use chrono::Utc;
use futures::future::join_all;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

use reportclaw_core::error::{ReportClawError, Result};
use reportclaw_core::types::{
    FailureDetail, ItemSnapshot, JobId, ReportArtifact, Task, TaskId, TaskKind, TaskOutput,
    TaskStatus,
};

use crate::executor::{ExecutionContext, ExecutorRegistry};
use crate::lanes::{Lane, WorkerLanes};
use crate::logstore::LogStore;
use crate::registry::SchedulerRegistry;
use crate::trigger::TriggerEvent;

/// Handle to a running job.
pub struct JobTicket {
    pub job_id: JobId,
    handle: JoinHandle<Result<()>>,
}

impl JobTicket {
    /// Wait until the root and every child reached a terminal state.
    pub async fn wait(self) -> Result<JobId> {
        self.handle
            .await
            .map_err(|e| ReportClawError::Invariant(format!("job {} aborted: {e}", self.job_id)))??;
        Ok(self.job_id)
    }
}

#[derive(Clone)]
pub struct Dispatcher {
    registry: Arc<SchedulerRegistry>,
    store: Arc<LogStore>,
    executors: Arc<ExecutorRegistry>,
    lanes: Arc<WorkerLanes>,
}

impl Dispatcher {
    pub fn new(
        registry: Arc<SchedulerRegistry>,
        store: Arc<LogStore>,
        executors: Arc<ExecutorRegistry>,
        lanes: Arc<WorkerLanes>,
    ) -> Self {
        Self {
            registry,
            store,
            executors,
            lanes,
        }
    }

    pub fn store(&self) -> &Arc<LogStore> {
        &self.store
    }

    pub fn registry(&self) -> &Arc<SchedulerRegistry> {
        &self.registry
    }

    /// Consume trigger events until the channel closes.
    pub async fn run(self, mut rx: mpsc::Receiver<TriggerEvent>) {
        tracing::info!("🚚 Dispatcher started");
        while let Some(event) = rx.recv().await {
            if let Err(e) = self.handle_trigger(event).await {
                tracing::error!(item_id = %event.item_id, "❌ Trigger dropped: {e}");
            }
        }
        tracing::info!("Dispatcher stopped");
    }

    /// Turn a trigger event into a job. Replays of an occurrence that already
    /// has a root, and events for items that were paused or deleted since,
    /// return `None`.
    pub async fn handle_trigger(&self, event: TriggerEvent) -> Result<Option<JobTicket>> {
        let item = self.registry.get(event.item_id)?;
        if !item.is_active() {
            tracing::info!(item_id = %item.id, "⏸️ Item no longer active, trigger skipped");
            return Ok(None);
        }

        let root = Task::root(
            TaskKind::RootDelivery,
            item.snapshot(None),
            event.occurrence,
            Some(event.occurrence),
        );
        let (root, created) = self.store.create_root(root).await?;
        if !created {
            tracing::info!(
                item_id = %item.id,
                job_id = %root.id,
                occurrence = %event.occurrence,
                "Occurrence already has a job, trigger ignored"
            );
            return Ok(None);
        }
        Ok(Some(self.spawn(root)))
    }

    /// Persist a fresh root and run it.
    pub async fn start_job(&self, root: Task) -> Result<JobTicket> {
        self.start(root).await
    }

    async fn start(&self, root: Task) -> Result<JobTicket> {
        let (root, created) = self.store.create_root(root).await?;
        if !created {
            return Err(ReportClawError::Invariant(format!(
                "job {} already exists for this occurrence",
                root.id
            )));
        }
        Ok(self.spawn(root))
    }

    fn spawn(&self, root: Task) -> JobTicket {
        let job_id = root.id;
        tracing::info!(
            job_id = %job_id,
            item_id = %root.item_id,
            kind = %root.kind,
            status = %TaskStatus::Scheduled,
            "📥 Job scheduled"
        );
        let dispatcher = self.clone();
        let handle = tokio::spawn(async move {
            let result = dispatcher.run_job(root).await;
            if let Err(e) = &result {
                tracing::error!(job_id = %job_id, "❌ Job bookkeeping failed: {e}");
            }
            result
        });
        JobTicket { job_id, handle }
    }

    /// Re-run a whole job as a new tree. The original records are untouched.
    pub async fn retry_job(&self, job_id: JobId, requested_by: &str) -> Result<JobTicket> {
        let original = self.load(job_id).await?;
        if !original.is_root() {
            return Err(ReportClawError::Validation(format!(
                "task {job_id} is a delivery; retry it with retry_delivery"
            )));
        }
        if !original.status.is_terminal() {
            return Err(ReportClawError::Validation(format!(
                "job {job_id} is still {}",
                original.status
            )));
        }
        let snapshot = root_snapshot(&original)?;
        let mut root = retry_root(&original, snapshot, requested_by);
        root.retry_of = Some(original.id);
        tracing::info!(job_id = %root.id, retry_of = %original.id, "🔁 Job retry requested by {requested_by}");
        self.start(root).await
    }

    /// Re-run one failed delivery as a new tree restricted to its destination.
    pub async fn retry_delivery(&self, task_id: TaskId, requested_by: &str) -> Result<JobTicket> {
        let failed = self.load(task_id).await?;
        let Some(parent_id) = failed.parent_id else {
            return Err(ReportClawError::Validation(format!(
                "task {task_id} is a job root; retry it with retry_job"
            )));
        };
        if failed.status != TaskStatus::Error {
            return Err(ReportClawError::Validation(format!(
                "only failed deliveries can be retried, task {task_id} is {}",
                failed.status
            )));
        }
        let destination = failed.destination.clone().ok_or_else(|| {
            ReportClawError::Invariant(format!("delivery task {task_id} has no destination"))
        })?;
        let parent = self.load(parent_id).await?;
        let mut snapshot = root_snapshot(&parent)?;
        snapshot.destinations = vec![destination];

        let mut root = retry_root(&parent, snapshot, requested_by);
        root.retry_of = Some(parent.id);
        tracing::info!(
            job_id = %root.id,
            retry_of = %task_id,
            "🔁 Delivery retry requested by {requested_by}"
        );
        self.start(root).await
    }

    /// Finish what a previous process left behind.
    ///
    /// Tasks stuck in `started` were cut off mid-execution and are failed as
    /// interrupted; they can be retried. Roots still `scheduled` run now.
    /// Completed roots with missing or `scheduled` children fan out again,
    /// which reuses any children already recorded. Returns the resumed jobs.
    pub async fn recover(&self) -> Result<Vec<JobTicket>> {
        let mut fan_out: BTreeSet<TaskId> = self
            .store
            .roots_awaiting_fan_out()
            .await?
            .into_iter()
            .filter(|root| {
                root.snapshot
                    .as_ref()
                    .is_some_and(|snapshot| !snapshot.destinations.is_empty())
            })
            .map(|root| root.id)
            .collect();
        let mut to_run = Vec::new();
        let mut interrupted = 0usize;

        for task in self.store.unfinished_tasks().await? {
            match (task.status, task.parent_id) {
                (TaskStatus::Started, _) => {
                    let detail = FailureDetail::invariant("interrupted before completion");
                    self.record(&task, TaskStatus::Error, Some(detail), None).await?;
                    interrupted += 1;
                }
                (TaskStatus::Scheduled, None) => to_run.push(task),
                (TaskStatus::Scheduled, Some(parent_id)) => {
                    fan_out.insert(parent_id);
                }
                _ => {}
            }
        }

        let mut tickets: Vec<JobTicket> = to_run.into_iter().map(|root| self.spawn(root)).collect();
        for root_id in fan_out {
            let root = self.load(root_id).await?;
            tickets.push(self.resume_fan_out(root).await?);
        }

        if interrupted > 0 || !tickets.is_empty() {
            tracing::info!(
                interrupted,
                resumed = tickets.len(),
                "♻️ Recovered unfinished jobs"
            );
        }
        Ok(tickets)
    }

    /// Run the delivery stage of a completed root.
    async fn resume_fan_out(&self, root: Task) -> Result<JobTicket> {
        let snapshot = root_snapshot(&root)?;
        let artifact = self
            .store
            .task_output(root.id)
            .await?
            .and_then(|output| output.artifact);
        let job_id = root.id;
        let dispatcher = self.clone();
        let handle = tokio::spawn(async move {
            let result = dispatcher.fan_out(&root, snapshot, artifact).await;
            if let Err(e) = &result {
                tracing::error!(job_id = %job_id, "❌ Job bookkeeping failed: {e}");
            }
            result
        });
        Ok(JobTicket { job_id, handle })
    }

    async fn load(&self, id: TaskId) -> Result<Task> {
        self.store
            .get_task(id)
            .await?
            .ok_or_else(|| ReportClawError::NotFound(format!("task {id}")))
    }

    // ─── Execution ────────────────────────────────────────────

    async fn run_job(self, root: Task) -> Result<()> {
        let Some(snapshot) = root.snapshot.clone() else {
            // Malformed tree: fail the root, never the pool
            self.record(&root, TaskStatus::Started, None, None).await?;
            let detail = FailureDetail::invariant("root task carries no item snapshot");
            self.record(&root, TaskStatus::Error, Some(detail), None).await?;
            return Ok(());
        };

        let ctx = ExecutionContext::for_root(snapshot.clone());
        let outcome = self
            .lanes
            .run(Lane::for_kind(root.kind), async {
                self.record(&root, TaskStatus::Started, None, None).await?;
                Ok::<_, ReportClawError>(self.executors.execute(&root, &ctx).await)
            })
            .await??;

        match outcome {
            Ok(output) => {
                let artifact = output.artifact.clone();
                self.record(&root, TaskStatus::Completed, None, Some(output)).await?;
                self.fan_out(&root, snapshot, artifact).await
            }
            Err(detail) => {
                self.record(&root, TaskStatus::Error, Some(detail), None).await?;
                Ok(())
            }
        }
    }

    /// Create the children of a completed root once and run the ones not yet
    /// started.
    ///
    /// On a retried root, each child links to the failed delivery of the
    /// original job with the same destination.
    async fn fan_out(
        &self,
        root: &Task,
        snapshot: ItemSnapshot,
        artifact: Option<ReportArtifact>,
    ) -> Result<()> {
        let previous = match root.retry_of {
            Some(original) => self.store.children(original).await?,
            None => Vec::new(),
        };
        let planned = snapshot
            .destinations
            .iter()
            .cloned()
            .map(|destination| {
                let mut child = Task::child(root, destination);
                child.retry_of = previous
                    .iter()
                    .find(|p| p.status == TaskStatus::Error && p.destination == child.destination)
                    .map(|p| p.id);
                child
            })
            .collect();
        let children = self.store.create_children(root.id, planned).await?;
        tracing::info!(job_id = %root.id, children = children.len(), "🌿 Fan-out");

        let runs = children
            .into_iter()
            .filter(|child| child.status == TaskStatus::Scheduled)
            .map(|child| {
                let dispatcher = self.clone();
                let snapshot = snapshot.clone();
                let artifact = artifact.clone();
                tokio::spawn(async move { dispatcher.run_child(child, snapshot, artifact).await })
            });

        for joined in join_all(runs).await {
            match joined {
                Ok(Ok(())) => {}
                Ok(Err(e)) => tracing::error!(job_id = %root.id, "❌ Delivery bookkeeping failed: {e}"),
                Err(e) => tracing::error!(job_id = %root.id, "❌ Delivery task aborted: {e}"),
            }
        }
        Ok(())
    }

    async fn run_child(
        self,
        child: Task,
        snapshot: ItemSnapshot,
        artifact: Option<ReportArtifact>,
    ) -> Result<()> {
        let Some(destination) = child.destination.clone() else {
            self.record(&child, TaskStatus::Started, None, None).await?;
            let detail = FailureDetail::invariant("delivery task carries no destination");
            return self.record(&child, TaskStatus::Error, Some(detail), None).await;
        };

        let ctx = ExecutionContext::for_delivery(snapshot, destination, artifact);
        let outcome = self
            .lanes
            .run(Lane::for_kind(child.kind), async {
                self.record(&child, TaskStatus::Started, None, None).await?;
                Ok::<_, ReportClawError>(self.executors.execute(&child, &ctx).await)
            })
            .await??;

        match outcome {
            Ok(output) => self.record(&child, TaskStatus::Completed, None, Some(output)).await,
            Err(detail) => self.record(&child, TaskStatus::Error, Some(detail), None).await,
        }
    }

    /// Append one transition and log it.
    async fn record(
        &self,
        task: &Task,
        status: TaskStatus,
        error: Option<FailureDetail>,
        output: Option<TaskOutput>,
    ) -> Result<()> {
        let entry = self.store.transition(task.id, status, error, output).await?;
        match &entry.error {
            Some(detail) if detail.kind == reportclaw_core::types::FailureKind::Invariant => {
                tracing::error!(
                    task_id = %task.id,
                    job_id = %task.parent_id.unwrap_or(task.id),
                    kind = %task.kind,
                    status = %status,
                    "❌ {detail}"
                );
            }
            Some(detail) => {
                tracing::warn!(
                    task_id = %task.id,
                    job_id = %task.parent_id.unwrap_or(task.id),
                    kind = %task.kind,
                    status = %status,
                    "⚠️ {detail}"
                );
            }
            None => {
                tracing::info!(
                    task_id = %task.id,
                    job_id = %task.parent_id.unwrap_or(task.id),
                    kind = %task.kind,
                    status = %status,
                    "Task {}",
                    status
                );
            }
        }
        Ok(())
    }
}

fn root_snapshot(root: &Task) -> Result<ItemSnapshot> {
    root.snapshot
        .clone()
        .ok_or_else(|| ReportClawError::Invariant(format!("root {} carries no item snapshot", root.id)))
}

/// A new root for re-running `original`, queued now.
fn retry_root(original: &Task, mut snapshot: ItemSnapshot, requested_by: &str) -> Task {
    snapshot.requested_by = Some(requested_by.to_string());
    Task::root(original.kind, snapshot, Utc::now(), original.occurrence)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::executor::tests::{FakeRenderer, FakeTransport, PanickingExecutor, registry_with};
    use crate::gate::RoleGate;
    use crate::persistence::SchedulerDb;
    use crate::query::{TreeHealth, job_tree};
    use chrono::{DateTime, TimeZone};
    use reportclaw_core::types::{
        Actor, Cadence, DeliveryFormat, Destination, FailureKind, ItemDraft, ItemId, OrgRole,
    };

    struct Harness {
        dispatcher: Dispatcher,
        transport: Arc<FakeTransport>,
        actor: Actor,
        item_id: ItemId,
    }

    fn harness(transport: FakeTransport, render_fails: bool) -> Harness {
        let db = Arc::new(SchedulerDb::open_in_memory().unwrap());
        let registry = Arc::new(SchedulerRegistry::new(db, Arc::new(RoleGate)).unwrap());
        let actor = Actor::new("u1", "org-1", OrgRole::Editor);
        let item = registry
            .create(
                &actor,
                ItemDraft {
                    name: "Daily revenue".into(),
                    project_id: "proj-1".into(),
                    chart: Some("chart-1".into()),
                    dashboard: None,
                    format: DeliveryFormat::Csv,
                    cadence: Cadence::utc("0 9 * * *"),
                    destinations: vec![
                        Destination::Email {
                            recipients: vec!["ceo@example.com".into()],
                        },
                        Destination::Chat {
                            channel: "revenue".into(),
                        },
                    ],
                    enabled: true,
                },
            )
            .unwrap();
        let transport = Arc::new(transport);
        let executors = registry_with(FakeRenderer { fail: render_fails }, transport.clone());
        let dispatcher = Dispatcher::new(
            registry,
            Arc::new(LogStore::open_in_memory().unwrap()),
            Arc::new(executors),
            Arc::new(WorkerLanes::new(2, 4)),
        );
        Harness {
            dispatcher,
            transport,
            actor,
            item_id: item.id,
        }
    }

    fn nine_am() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2026, 3, 2, 9, 0, 0).unwrap()
    }

    async fn trigger(h: &Harness) -> JobId {
        let ticket = h
            .dispatcher
            .handle_trigger(TriggerEvent {
                item_id: h.item_id,
                occurrence: nine_am(),
            })
            .await
            .unwrap()
            .unwrap();
        ticket.wait().await.unwrap()
    }

    async fn statuses(store: &LogStore, id: TaskId) -> Vec<TaskStatus> {
        store
            .query_by_task(id)
            .await
            .unwrap()
            .into_iter()
            .map(|e| e.status)
            .collect()
    }

    #[tokio::test]
    async fn test_all_deliveries_succeed() {
        let h = harness(FakeTransport::default(), false);
        let job_id = trigger(&h).await;
        let store = h.dispatcher.store();

        let tree = job_tree(store, job_id).await.unwrap();
        assert_eq!(tree.root.task.status, TaskStatus::Completed);
        assert_eq!(tree.children.len(), 2);
        assert!(tree.children.iter().all(|c| c.task.status == TaskStatus::Completed));
        assert_eq!(tree.health(), TreeHealth::Succeeded);
        assert_eq!(tree.root.task.scheduled_time, nine_am());

        let mut sent = h.transport.sent();
        sent.sort();
        assert_eq!(sent, vec!["chat:revenue", "email:ceo@example.com"]);

        let full = vec![TaskStatus::Scheduled, TaskStatus::Started, TaskStatus::Completed];
        assert_eq!(statuses(store, job_id).await, full);
        for child in &tree.children {
            assert_eq!(statuses(store, child.task.id).await, full);
        }
    }

    #[tokio::test]
    async fn test_failed_chat_is_partial_failure() {
        let h = harness(FakeTransport::failing(&["chat"]), false);
        let job_id = trigger(&h).await;

        let tree = job_tree(h.dispatcher.store(), job_id).await.unwrap();
        assert_eq!(tree.root.task.status, TaskStatus::Completed);
        let chat = tree
            .children
            .iter()
            .find(|c| c.task.kind == TaskKind::ChatNotify)
            .unwrap();
        let email = tree
            .children
            .iter()
            .find(|c| c.task.kind == TaskKind::EmailNotify)
            .unwrap();
        assert_eq!(chat.task.status, TaskStatus::Error);
        let detail = chat.task.error.clone().unwrap();
        assert_eq!(detail.kind, FailureKind::Execution);
        assert!(detail.to_string().contains("503"));
        assert_eq!(email.task.status, TaskStatus::Completed);
        assert_eq!(tree.health(), TreeHealth::PartialFailure);
    }

    #[tokio::test]
    async fn test_duplicate_trigger_creates_no_second_root() {
        let h = harness(FakeTransport::default(), false);
        trigger(&h).await;
        let again = h
            .dispatcher
            .handle_trigger(TriggerEvent {
                item_id: h.item_id,
                occurrence: nine_am(),
            })
            .await
            .unwrap();
        assert!(again.is_none());
        let roots = h.dispatcher.store().roots_for_item(h.item_id, 10).await.unwrap();
        assert_eq!(roots.len(), 1);
        assert_eq!(h.transport.sent().len(), 2);
    }

    #[tokio::test]
    async fn test_render_failure_creates_no_children() {
        let h = harness(FakeTransport::default(), true);
        let job_id = trigger(&h).await;
        let tree = job_tree(h.dispatcher.store(), job_id).await.unwrap();
        assert_eq!(tree.root.task.status, TaskStatus::Error);
        assert!(tree.children.is_empty());
        assert_eq!(tree.health(), TreeHealth::Failed);
        assert!(h.transport.sent().is_empty());
    }

    #[tokio::test]
    async fn test_snapshot_isolated_from_later_edits() {
        let h = harness(
            FakeTransport {
                delay_ms: 30,
                ..Default::default()
            },
            false,
        );
        let ticket = h
            .dispatcher
            .handle_trigger(TriggerEvent {
                item_id: h.item_id,
                occurrence: nine_am(),
            })
            .await
            .unwrap()
            .unwrap();

        // Edit and pause while the job is in flight
        let registry = h.dispatcher.registry();
        let mut draft = ItemDraft {
            name: "Daily revenue".into(),
            project_id: "proj-1".into(),
            chart: Some("chart-1".into()),
            dashboard: None,
            format: DeliveryFormat::Csv,
            cadence: Cadence::utc("0 9 * * *"),
            destinations: vec![Destination::Chat {
                channel: "other".into(),
            }],
            enabled: true,
        };
        registry.update(&h.actor, h.item_id, draft.clone()).unwrap();
        draft.enabled = false;
        registry.update(&h.actor, h.item_id, draft).unwrap();

        let job_id = ticket.wait().await.unwrap();
        let tree = job_tree(h.dispatcher.store(), job_id).await.unwrap();
        assert_eq!(tree.children.len(), 2);
        assert_eq!(tree.health(), TreeHealth::Succeeded);
    }

    #[tokio::test]
    async fn test_paused_item_trigger_skipped() {
        let h = harness(FakeTransport::default(), false);
        h.dispatcher.registry().pause(&h.actor, h.item_id).unwrap();
        let ticket = h
            .dispatcher
            .handle_trigger(TriggerEvent {
                item_id: h.item_id,
                occurrence: nine_am(),
            })
            .await
            .unwrap();
        assert!(ticket.is_none());
        assert_eq!(h.dispatcher.store().task_count().await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_unregistered_kind_fails_only_that_task() {
        let h = harness(FakeTransport::default(), false);
        // Same stores, but no chat executor registered
        let mut executors = ExecutorRegistry::new();
        executors.register(
            TaskKind::RootDelivery,
            Arc::new(crate::executor::RenderExecutor::new(Arc::new(FakeRenderer { fail: false }))),
        );
        executors.register(
            TaskKind::EmailNotify,
            Arc::new(crate::executor::EmailExecutor::new(h.transport.clone())),
        );
        let dispatcher = Dispatcher::new(
            h.dispatcher.registry().clone(),
            h.dispatcher.store().clone(),
            Arc::new(executors),
            Arc::new(WorkerLanes::new(1, 1)),
        );

        let job_id = dispatcher
            .handle_trigger(TriggerEvent {
                item_id: h.item_id,
                occurrence: nine_am(),
            })
            .await
            .unwrap()
            .unwrap()
            .wait()
            .await
            .unwrap();

        let tree = job_tree(dispatcher.store(), job_id).await.unwrap();
        let chat = tree
            .children
            .iter()
            .find(|c| c.task.kind == TaskKind::ChatNotify)
            .unwrap();
        assert_eq!(chat.task.error.clone().unwrap().kind, FailureKind::Invariant);
        assert!(
            tree.children
                .iter()
                .any(|c| c.task.kind == TaskKind::EmailNotify && c.task.status == TaskStatus::Completed)
        );
        assert_eq!(tree.health(), TreeHealth::PartialFailure);
    }

    #[tokio::test]
    async fn test_retry_failed_delivery() {
        let h = harness(FakeTransport::failing(&["chat"]), false);
        let job_id = trigger(&h).await;
        let store = h.dispatcher.store();
        let tree = job_tree(store, job_id).await.unwrap();
        let failed = tree
            .children
            .iter()
            .find(|c| c.task.status == TaskStatus::Error)
            .unwrap()
            .task
            .clone();

        let retry_id = h
            .dispatcher
            .retry_delivery(failed.id, "u1")
            .await
            .unwrap()
            .wait()
            .await
            .unwrap();
        let retry = job_tree(store, retry_id).await.unwrap();
        assert_eq!(retry.root.task.retry_of, Some(job_id));
        assert_eq!(retry.children.len(), 1);
        assert_eq!(retry.children[0].task.kind, TaskKind::ChatNotify);
        assert_eq!(retry.children[0].task.retry_of, Some(failed.id));

        // The original failure stays on record
        let original = store.get_task(failed.id).await.unwrap().unwrap();
        assert_eq!(original.status, TaskStatus::Error);

        // Completed deliveries cannot be retried individually
        let email = tree
            .children
            .iter()
            .find(|c| c.task.status == TaskStatus::Completed)
            .unwrap();
        assert!(matches!(
            h.dispatcher.retry_delivery(email.task.id, "u1").await,
            Err(ReportClawError::Validation(_))
        ));
    }

    #[tokio::test]
    async fn test_retry_whole_job() {
        let h = harness(FakeTransport::default(), true);
        let job_id = trigger(&h).await;
        let retry_id = h
            .dispatcher
            .retry_job(job_id, "u1")
            .await
            .unwrap()
            .wait()
            .await
            .unwrap();
        assert_ne!(retry_id, job_id);
        let retry = h.dispatcher.store().get_task(retry_id).await.unwrap().unwrap();
        assert_eq!(retry.retry_of, Some(job_id));
        assert_eq!(retry.requested_by.as_deref(), Some("u1"));
        assert_eq!(
            h.dispatcher.store().roots_for_item(h.item_id, 10).await.unwrap().len(),
            2
        );
    }

    #[tokio::test]
    async fn test_panicking_executor_fails_only_its_task() {
        let h = harness(FakeTransport::default(), false);
        let mut executors = registry_with(FakeRenderer { fail: false }, h.transport.clone());
        executors.register(TaskKind::ChatNotify, Arc::new(PanickingExecutor));
        let dispatcher = Dispatcher::new(
            h.dispatcher.registry().clone(),
            h.dispatcher.store().clone(),
            Arc::new(executors),
            Arc::new(WorkerLanes::new(1, 2)),
        );

        let job_id = dispatcher
            .handle_trigger(TriggerEvent {
                item_id: h.item_id,
                occurrence: nine_am(),
            })
            .await
            .unwrap()
            .unwrap()
            .wait()
            .await
            .unwrap();

        let tree = job_tree(dispatcher.store(), job_id).await.unwrap();
        let chat = tree
            .children
            .iter()
            .find(|c| c.task.kind == TaskKind::ChatNotify)
            .unwrap();
        assert_eq!(chat.task.status, TaskStatus::Error);
        let detail = chat.task.error.clone().unwrap();
        assert_eq!(detail.kind, FailureKind::Invariant);
        assert!(detail.message.contains("panicked"));
        assert!(
            tree.children
                .iter()
                .any(|c| c.task.kind == TaskKind::EmailNotify && c.task.status == TaskStatus::Completed)
        );
        assert_eq!(tree.health(), TreeHealth::PartialFailure);
        // Lane permits were released despite the panic
        assert!(dispatcher.lanes.stats().iter().all(|s| s.active == 0));
    }

    #[tokio::test]
    async fn test_recover_finishes_interrupted_work() {
        let h = harness(FakeTransport::default(), false);
        let store = h.dispatcher.store().clone();
        let snapshot = h.dispatcher.registry().get(h.item_id).unwrap().snapshot(None);
        let at = |days: i64| nine_am() + chrono::Duration::days(days);
        let root_at = |days: i64| {
            Task::root(TaskKind::RootDelivery, snapshot.clone(), at(days), Some(at(days)))
        };

        // Cut off while rendering
        let (rendering, _) = store.create_root(root_at(0)).await.unwrap();
        store
            .transition(rendering.id, TaskStatus::Started, None, None)
            .await
            .unwrap();
        // Written but never started
        let (queued, _) = store.create_root(root_at(1)).await.unwrap();
        // Rendered, then cut off before fan-out
        let (rendered, _) = store.create_root(root_at(2)).await.unwrap();
        store
            .transition(rendered.id, TaskStatus::Started, None, None)
            .await
            .unwrap();
        let artifact = ReportArtifact {
            url: "https://reports.example.com/chart-1".into(),
            file_name: "Daily revenue.csv".into(),
            format: DeliveryFormat::Csv,
            rows: Some(3),
        };
        store
            .transition(
                rendered.id,
                TaskStatus::Completed,
                None,
                Some(TaskOutput::with_artifact(artifact)),
            )
            .await
            .unwrap();

        let tickets = h.dispatcher.recover().await.unwrap();
        let mut resumed = Vec::new();
        for ticket in tickets {
            resumed.push(ticket.wait().await.unwrap());
        }
        resumed.sort();
        let mut expected = vec![queued.id, rendered.id];
        expected.sort();
        assert_eq!(resumed, expected);

        let interrupted = store.get_task(rendering.id).await.unwrap().unwrap();
        assert_eq!(interrupted.status, TaskStatus::Error);
        let detail = interrupted.error.unwrap();
        assert_eq!(detail.kind, FailureKind::Invariant);
        assert!(detail.message.contains("interrupted"));

        for id in [queued.id, rendered.id] {
            let tree = job_tree(&store, id).await.unwrap();
            assert_eq!(tree.health(), TreeHealth::Succeeded);
            assert_eq!(tree.children.len(), 2);
        }
        assert_eq!(h.transport.sent().len(), 4);

        // Nothing left to do
        assert!(h.dispatcher.recover().await.unwrap().is_empty());
        assert!(store.unfinished_tasks().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_recover_runs_scheduled_children_and_fails_started_ones() {
        let h = harness(FakeTransport::default(), false);
        let store = h.dispatcher.store().clone();
        let snapshot = h.dispatcher.registry().get(h.item_id).unwrap().snapshot(None);
        let root = Task::root(TaskKind::RootDelivery, snapshot.clone(), nine_am(), Some(nine_am()));
        let (root, _) = store.create_root(root).await.unwrap();
        store
            .transition(root.id, TaskStatus::Started, None, None)
            .await
            .unwrap();
        store
            .transition(root.id, TaskStatus::Completed, None, None)
            .await
            .unwrap();
        let planned = snapshot
            .destinations
            .iter()
            .cloned()
            .map(|d| Task::child(&root, d))
            .collect();
        let children = store.create_children(root.id, planned).await.unwrap();
        store
            .transition(children[0].id, TaskStatus::Started, None, None)
            .await
            .unwrap();

        let tickets = h.dispatcher.recover().await.unwrap();
        assert_eq!(tickets.len(), 1);
        for ticket in tickets {
            ticket.wait().await.unwrap();
        }

        let first = store.get_task(children[0].id).await.unwrap().unwrap();
        assert_eq!(first.status, TaskStatus::Error);
        // The root stored no artifact, so the resumed delivery cannot send
        let second = store.get_task(children[1].id).await.unwrap().unwrap();
        assert_eq!(second.status, TaskStatus::Error);
        assert_eq!(second.error.unwrap().kind, FailureKind::Invariant);
        assert_eq!(store.children(root.id).await.unwrap().len(), 2);
    }

    #[tokio::test]
    async fn test_job_retry_links_failed_deliveries() {
        let h = harness(FakeTransport::failing(&["chat"]), false);
        let job_id = trigger(&h).await;
        let store = h.dispatcher.store();
        let original = job_tree(store, job_id).await.unwrap();
        let failed_chat = original
            .children
            .iter()
            .find(|c| c.task.kind == TaskKind::ChatNotify)
            .unwrap()
            .task
            .id;

        let retry_id = h
            .dispatcher
            .retry_job(job_id, "u1")
            .await
            .unwrap()
            .wait()
            .await
            .unwrap();
        let retry = job_tree(store, retry_id).await.unwrap();
        let chat = retry
            .children
            .iter()
            .find(|c| c.task.kind == TaskKind::ChatNotify)
            .unwrap();
        let email = retry
            .children
            .iter()
            .find(|c| c.task.kind == TaskKind::EmailNotify)
            .unwrap();
        assert_eq!(chat.task.retry_of, Some(failed_chat));
        assert_eq!(email.task.retry_of, None);
    }
}
