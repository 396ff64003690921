//! Task executor registry: maps each task kind to its execution logic.
//!
//! Root kinds compute the report through the [`ReportRenderer`]; delivery
//! kinds are thin adapters over the transports. Executors only return an
//! outcome, they never touch task or log state.

use std::any::Any;
use std::collections::HashMap;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;

use async_trait::async_trait;
use futures::FutureExt;

use reportclaw_core::traits::{ChatTransport, EmailTransport, ReportRenderer, SpreadsheetUploader};
use reportclaw_core::types::{
    Destination, FailureDetail, ItemSnapshot, ReportArtifact, Task, TaskKind, TaskOutput,
};

/// Read-only inputs handed to an executor.
#[derive(Debug, Clone)]
pub struct ExecutionContext {
    /// Item as it was when the job was created.
    pub snapshot: ItemSnapshot,
    /// Set for delivery tasks.
    pub destination: Option<Destination>,
    /// The report the root computed, for delivery tasks.
    pub artifact: Option<ReportArtifact>,
}

impl ExecutionContext {
    pub fn for_root(snapshot: ItemSnapshot) -> Self {
        Self {
            snapshot,
            destination: None,
            artifact: None,
        }
    }

    pub fn for_delivery(
        snapshot: ItemSnapshot,
        destination: Destination,
        artifact: Option<ReportArtifact>,
    ) -> Self {
        Self {
            snapshot,
            destination: Some(destination),
            artifact,
        }
    }

    fn require_artifact(&self) -> Result<&ReportArtifact, FailureDetail> {
        self.artifact
            .as_ref()
            .ok_or_else(|| FailureDetail::invariant("delivery task has no computed report"))
    }
}

#[async_trait]
pub trait TaskExecutor: Send + Sync {
    async fn execute(
        &self,
        task: &Task,
        ctx: &ExecutionContext,
    ) -> Result<TaskOutput, FailureDetail>;
}

/// Closed mapping from [`TaskKind`] to executor.
#[derive(Default, Clone)]
pub struct ExecutorRegistry {
    executors: HashMap<TaskKind, Arc<dyn TaskExecutor>>,
}

impl ExecutorRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registry wired to the standard renderer and transports.
    pub fn with_builtins(
        renderer: Arc<dyn ReportRenderer>,
        email: Arc<dyn EmailTransport>,
        chat: Arc<dyn ChatTransport>,
        sheets: Arc<dyn SpreadsheetUploader>,
    ) -> Self {
        let render: Arc<dyn TaskExecutor> = Arc::new(RenderExecutor::new(renderer));
        let mut registry = Self::new();
        registry.register(TaskKind::RootDelivery, render.clone());
        registry.register(TaskKind::AdHocExport, render);
        registry.register(TaskKind::EmailNotify, Arc::new(EmailExecutor::new(email)));
        registry.register(TaskKind::ChatNotify, Arc::new(ChatExecutor::new(chat)));
        registry.register(TaskKind::SpreadsheetExport, Arc::new(SpreadsheetExecutor::new(sheets)));
        registry
    }

    /// Register (or replace) the executor for `kind`.
    pub fn register(&mut self, kind: TaskKind, executor: Arc<dyn TaskExecutor>) {
        self.executors.insert(kind, executor);
    }

    pub fn contains(&self, kind: TaskKind) -> bool {
        self.executors.contains_key(&kind)
    }

    /// Run `task`. A kind with no executor, or an executor that panics,
    /// fails the task as an invariant violation.
    pub async fn execute(
        &self,
        task: &Task,
        ctx: &ExecutionContext,
    ) -> Result<TaskOutput, FailureDetail> {
        let Some(executor) = self.executors.get(&task.kind) else {
            tracing::error!(task_id = %task.id, kind = %task.kind, "❌ No executor registered");
            return Err(FailureDetail::invariant(format!(
                "no executor registered for task kind '{}'",
                task.kind
            )));
        };
        match AssertUnwindSafe(executor.execute(task, ctx)).catch_unwind().await {
            Ok(outcome) => outcome,
            Err(payload) => {
                let message = panic_message(payload.as_ref());
                tracing::error!(task_id = %task.id, kind = %task.kind, "💥 Executor panicked: {message}");
                Err(FailureDetail::invariant(format!("executor panicked: {message}")))
            }
        }
    }
}

fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        s.to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic".to_string()
    }
}

// ─── Built-in executors ───────────────────────────────────

/// Computes the report for root tasks.
pub struct RenderExecutor {
    renderer: Arc<dyn ReportRenderer>,
}

impl RenderExecutor {
    pub fn new(renderer: Arc<dyn ReportRenderer>) -> Self {
        Self { renderer }
    }
}

#[async_trait]
impl TaskExecutor for RenderExecutor {
    async fn execute(
        &self,
        _task: &Task,
        ctx: &ExecutionContext,
    ) -> Result<TaskOutput, FailureDetail> {
        let artifact = self.renderer.render(&ctx.snapshot).await.map_err(|e| {
            FailureDetail::execution(format!(
                "failed to compute {} {}",
                ctx.snapshot.target.kind(),
                ctx.snapshot.target.reference()
            ))
            .with_detail(e.to_string())
        })?;
        Ok(TaskOutput::with_artifact(artifact))
    }
}

pub struct EmailExecutor {
    transport: Arc<dyn EmailTransport>,
}

impl EmailExecutor {
    pub fn new(transport: Arc<dyn EmailTransport>) -> Self {
        Self { transport }
    }
}

#[async_trait]
impl TaskExecutor for EmailExecutor {
    async fn execute(
        &self,
        _task: &Task,
        ctx: &ExecutionContext,
    ) -> Result<TaskOutput, FailureDetail> {
        let Some(Destination::Email { recipients }) = &ctx.destination else {
            return Err(mismatch(ctx, "email"));
        };
        let artifact = ctx.require_artifact()?;
        self.transport
            .send_report(recipients, &ctx.snapshot, artifact)
            .await
            .map_err(|e| FailureDetail::execution("email delivery failed").with_detail(e.to_string()))?;
        Ok(TaskOutput::with_detail(format!(
            "sent to {} recipient(s)",
            recipients.len()
        )))
    }
}

pub struct ChatExecutor {
    transport: Arc<dyn ChatTransport>,
}

impl ChatExecutor {
    pub fn new(transport: Arc<dyn ChatTransport>) -> Self {
        Self { transport }
    }
}

#[async_trait]
impl TaskExecutor for ChatExecutor {
    async fn execute(
        &self,
        _task: &Task,
        ctx: &ExecutionContext,
    ) -> Result<TaskOutput, FailureDetail> {
        let Some(Destination::Chat { channel }) = &ctx.destination else {
            return Err(mismatch(ctx, "chat"));
        };
        let artifact = ctx.require_artifact()?;
        self.transport
            .post_report(channel, &ctx.snapshot, artifact)
            .await
            .map_err(|e| FailureDetail::execution("chat delivery failed").with_detail(e.to_string()))?;
        Ok(TaskOutput::with_detail(format!("posted to {channel}")))
    }
}

pub struct SpreadsheetExecutor {
    uploader: Arc<dyn SpreadsheetUploader>,
}

impl SpreadsheetExecutor {
    pub fn new(uploader: Arc<dyn SpreadsheetUploader>) -> Self {
        Self { uploader }
    }
}

#[async_trait]
impl TaskExecutor for SpreadsheetExecutor {
    async fn execute(
        &self,
        _task: &Task,
        ctx: &ExecutionContext,
    ) -> Result<TaskOutput, FailureDetail> {
        let Some(Destination::Spreadsheet {
            spreadsheet_id,
            tab,
        }) = &ctx.destination
        else {
            return Err(mismatch(ctx, "spreadsheet"));
        };
        let artifact = ctx.require_artifact()?;
        let url = self
            .uploader
            .upload(spreadsheet_id, tab.as_deref(), &ctx.snapshot, artifact)
            .await
            .map_err(|e| FailureDetail::execution("spreadsheet upload failed").with_detail(e.to_string()))?;
        Ok(TaskOutput::with_detail(url))
    }
}

fn mismatch(ctx: &ExecutionContext, expected: &str) -> FailureDetail {
    let got = ctx
        .destination
        .as_ref()
        .map(Destination::describe)
        .unwrap_or_else(|| "none".into());
    FailureDetail::invariant(format!("expected a {expected} destination, got {got}"))
}
