//! Worker lanes: bounded concurrency for task execution.
//!
//! Root tasks (report computation) and delivery tasks run in separate lanes so
//! a burst of renders never starves deliveries and vice versa. Each lane is a
//! semaphore; a task holds one permit for the duration of its executor call.

use std::future::Future;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};

use tokio::sync::Semaphore;

use reportclaw_core::config::SchedulerConfig;
use reportclaw_core::error::{ReportClawError, Result};
use reportclaw_core::types::TaskKind;

/// Execution lane.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, serde::Serialize, serde::Deserialize)]
pub enum Lane {
    /// Root tasks: compute the report.
    Render,
    /// Child tasks: hand the report to a transport.
    Deliver,
}

impl Lane {
    pub fn for_kind(kind: TaskKind) -> Self {
        if kind.is_root() {
            Lane::Render
        } else {
            Lane::Deliver
        }
    }

    fn index(&self) -> usize {
        match self {
            Lane::Render => 0,
            Lane::Deliver => 1,
        }
    }
}

impl std::fmt::Display for Lane {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Lane::Render => write!(f, "render"),
            Lane::Deliver => write!(f, "deliver"),
        }
    }
}

struct LaneState {
    permits: Arc<Semaphore>,
    max_concurrent: usize,
    active: AtomicUsize,
    total_processed: AtomicU64,
}

impl LaneState {
    fn new(max_concurrent: usize) -> Self {
        Self {
            permits: Arc::new(Semaphore::new(max_concurrent)),
            max_concurrent,
            active: AtomicUsize::new(0),
            total_processed: AtomicU64::new(0),
        }
    }
}

/// Decrements the active count even if the task future is dropped mid-way.
struct ActiveGuard<'a>(&'a LaneState);

impl Drop for ActiveGuard<'_> {
    fn drop(&mut self) {
        self.0.active.fetch_sub(1, Ordering::SeqCst);
        self.0.total_processed.fetch_add(1, Ordering::SeqCst);
    }
}

pub struct WorkerLanes {
    lanes: [LaneState; 2],
}

impl WorkerLanes {
    pub fn new(render_workers: usize, deliver_workers: usize) -> Self {
        Self {
            lanes: [
                LaneState::new(render_workers.max(1)),
                LaneState::new(deliver_workers.max(1)),
            ],
        }
    }

    pub fn from_config(config: &SchedulerConfig) -> Self {
        Self::new(config.render_workers, config.deliver_workers)
    }

    /// Run `work` once a permit in `lane` is free.
    pub async fn run<F, T>(&self, lane: Lane, work: F) -> Result<T>
    where
        F: Future<Output = T>,
    {
        let state = &self.lanes[lane.index()];
        let _permit = state
            .permits
            .acquire()
            .await
            .map_err(|e| ReportClawError::Invariant(format!("lane {lane} closed: {e}")))?;
        state.active.fetch_add(1, Ordering::SeqCst);
        let _active = ActiveGuard(state);
        tracing::debug!(
            "Lane[{}] run (active: {}/{})",
            lane,
            state.active.load(Ordering::SeqCst),
            state.max_concurrent
        );
        Ok(work.await)
    }

    pub fn stats(&self) -> Vec<LaneStats> {
        [Lane::Render, Lane::Deliver]
            .into_iter()
            .map(|lane| {
                let state = &self.lanes[lane.index()];
                LaneStats {
                    lane,
                    active: state.active.load(Ordering::SeqCst),
                    max_concurrent: state.max_concurrent,
                    total_processed: state.total_processed.load(Ordering::SeqCst),
                }
            })
            .collect()
    }
}

impl Default for WorkerLanes {
    fn default() -> Self {
        Self::from_config(&SchedulerConfig::default())
    }
}

/// Statistics for a single lane.
#[derive(Debug, Clone, serde::Serialize)]
pub struct LaneStats {
    pub lane: Lane,
    pub active: usize,
    pub max_concurrent: usize,
    pub total_processed: u64,
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[test]
    fn test_lane_for_kind() {
        assert_eq!(Lane::for_kind(TaskKind::RootDelivery), Lane::Render);
        assert_eq!(Lane::for_kind(TaskKind::AdHocExport), Lane::Render);
        assert_eq!(Lane::for_kind(TaskKind::ChatNotify), Lane::Deliver);
    }

    #[tokio::test]
    async fn test_concurrency_limit() {
        let lanes = Arc::new(WorkerLanes::new(1, 2));
        let peak = Arc::new(AtomicUsize::new(0));
        let current = Arc::new(AtomicUsize::new(0));

        let handles: Vec<_> = (0..6)
            .map(|_| {
                let lanes = lanes.clone();
                let peak = peak.clone();
                let current = current.clone();
                tokio::spawn(async move {
                    lanes
                        .run(Lane::Deliver, async {
                            let now = current.fetch_add(1, Ordering::SeqCst) + 1;
                            peak.fetch_max(now, Ordering::SeqCst);
                            tokio::time::sleep(Duration::from_millis(20)).await;
                            current.fetch_sub(1, Ordering::SeqCst);
                        })
                        .await
                })
            })
            .collect();
        for handle in handles {
            handle.await.unwrap().unwrap();
        }

        assert_eq!(peak.load(Ordering::SeqCst), 2);
        let stats = lanes.stats();
        assert_eq!(stats[1].total_processed, 6);
        assert_eq!(stats[1].active, 0);
        assert_eq!(stats[0].total_processed, 0);
    }

    #[tokio::test]
    async fn test_lanes_are_independent() {
        let lanes = Arc::new(WorkerLanes::new(1, 1));
        let blocker = {
            let lanes = lanes.clone();
            tokio::spawn(async move {
                lanes
                    .run(Lane::Render, tokio::time::sleep(Duration::from_millis(200)))
                    .await
            })
        };
        tokio::time::sleep(Duration::from_millis(10)).await;

        // Deliver lane is free while render is saturated
        let done = tokio::time::timeout(
            Duration::from_millis(100),
            lanes.run(Lane::Deliver, async { 7 }),
        )
        .await
        .unwrap()
        .unwrap();
        assert_eq!(done, 7);
        blocker.await.unwrap().unwrap();
    }
}
