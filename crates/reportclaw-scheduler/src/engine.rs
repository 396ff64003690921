//! Scheduler engine: wires registry, trigger evaluator, dispatcher and log
//! store together and runs the two background loops.
//!
//! ```text
//! TriggerEvaluator::run ──(TriggerEvent, bounded mpsc)──► Dispatcher::run
//! ```

use std::sync::Arc;

use chrono::{DateTime, Utc};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

use reportclaw_core::config::SchedulerConfig;
use reportclaw_core::error::Result;

use crate::dispatch::{Dispatcher, JobTicket};
use crate::executor::ExecutorRegistry;
use crate::gate::AuthorizationGate;
use crate::lanes::{LaneStats, WorkerLanes};
use crate::logstore::LogStore;
use crate::persistence::SchedulerDb;
use crate::registry::SchedulerRegistry;
use crate::submit::SubmissionService;
use crate::trigger::TriggerEvaluator;

pub struct SchedulerEngine {
    config: SchedulerConfig,
    registry: Arc<SchedulerRegistry>,
    store: Arc<LogStore>,
    lanes: Arc<WorkerLanes>,
    dispatcher: Dispatcher,
    submissions: SubmissionService,
    evaluator: Arc<TriggerEvaluator>,
}

/// Background loops started by [`SchedulerEngine::spawn`].
pub struct SchedulerHandle {
    pub trigger: JoinHandle<()>,
    pub dispatch: JoinHandle<()>,
}

impl SchedulerHandle {
    pub fn shutdown(&self) {
        self.trigger.abort();
        self.dispatch.abort();
    }
}

impl SchedulerEngine {
    /// Open the on-disk databases named by `config`.
    pub fn open(
        config: &SchedulerConfig,
        executors: ExecutorRegistry,
        gate: Arc<dyn AuthorizationGate>,
    ) -> Result<Self> {
        let path = config.expanded_db_path();
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let db = Arc::new(SchedulerDb::open(&path)?);
        let store = Arc::new(LogStore::open(&path)?);
        tracing::info!("🗄️ Scheduler database: {}", path.display());
        Self::assemble(config, db, store, executors, gate)
    }

    /// Engine backed by private in-memory databases.
    pub fn in_memory(
        config: &SchedulerConfig,
        executors: ExecutorRegistry,
        gate: Arc<dyn AuthorizationGate>,
    ) -> Result<Self> {
        let db = Arc::new(SchedulerDb::open_in_memory()?);
        let store = Arc::new(LogStore::open_in_memory()?);
        Self::assemble(config, db, store, executors, gate)
    }

    fn assemble(
        config: &SchedulerConfig,
        db: Arc<SchedulerDb>,
        store: Arc<LogStore>,
        executors: ExecutorRegistry,
        gate: Arc<dyn AuthorizationGate>,
    ) -> Result<Self> {
        let registry = Arc::new(SchedulerRegistry::new(db, gate.clone())?);
        let lanes = Arc::new(WorkerLanes::from_config(config));
        let dispatcher = Dispatcher::new(
            registry.clone(),
            store.clone(),
            Arc::new(executors),
            lanes.clone(),
        );
        let submissions = SubmissionService::new(dispatcher.clone(), gate);
        let evaluator = Arc::new(TriggerEvaluator::new(
            registry.clone(),
            store.clone(),
            config.missed_lookback_mins,
        ));
        Ok(Self {
            config: config.clone(),
            registry,
            store,
            lanes,
            dispatcher,
            submissions,
            evaluator,
        })
    }

    pub fn registry(&self) -> &Arc<SchedulerRegistry> {
        &self.registry
    }

    pub fn store(&self) -> &Arc<LogStore> {
        &self.store
    }

    pub fn dispatcher(&self) -> &Dispatcher {
        &self.dispatcher
    }

    pub fn submissions(&self) -> &SubmissionService {
        &self.submissions
    }

    pub fn lane_stats(&self) -> Vec<LaneStats> {
        self.lanes.stats()
    }

    /// Resume unfinished jobs, then start the trigger loop and the
    /// dispatcher loop. Resumed jobs run in the background.
    pub async fn spawn(&self) -> Result<SchedulerHandle> {
        let resumed = self.dispatcher.recover().await?;
        if !resumed.is_empty() {
            tracing::info!("♻️ Resuming {} unfinished job(s)", resumed.len());
        }

        let (tx, rx) = mpsc::channel(self.config.trigger_buffer.max(1));
        let trigger = tokio::spawn(
            self.evaluator
                .clone()
                .run(self.config.poll_interval_secs, tx),
        );
        let dispatch = tokio::spawn(self.dispatcher.clone().run(rx));
        tracing::info!(
            "⏰ Scheduler started (check every {}s, {} render / {} deliver workers)",
            self.config.poll_interval_secs,
            self.config.render_workers,
            self.config.deliver_workers
        );
        Ok(SchedulerHandle { trigger, dispatch })
    }

    /// One evaluation at `now`, dispatched inline. Returns the started jobs.
    pub async fn tick(&self, now: DateTime<Utc>) -> Result<Vec<JobTicket>> {
        let mut tickets = Vec::new();
        for event in self.evaluator.tick(now).await? {
            if let Some(ticket) = self.dispatcher.handle_trigger(event).await? {
                tickets.push(ticket);
            }
        }
        Ok(tickets)
    }
}
