//! Trigger evaluator: finds due occurrences and emits trigger events.
//!
//! Runs on its own tokio interval, decoupled from task execution by an mpsc
//! channel. The log store is the record of what fired: an occurrence is
//! emitted until a root task exists for it, and never after. Nothing is
//! marked fired before the dispatcher has durably created the root, so an
//! event lost in the channel or in a crash is emitted again on a later tick.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;

use reportclaw_core::error::{ReportClawError, Result};
use reportclaw_core::types::ItemId;

use crate::logstore::LogStore;
use crate::registry::SchedulerRegistry;

/// Grace period before an emitted occurrence with no root is emitted again.
const REEMIT_AFTER_SECS: i64 = 60;

/// One due occurrence of one scheduled item. Safe to deliver more than once.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct TriggerEvent {
    pub item_id: ItemId,
    pub occurrence: DateTime<Utc>,
}

pub struct TriggerEvaluator {
    registry: Arc<SchedulerRegistry>,
    store: Arc<LogStore>,
    lookback: Duration,
    /// Occurrences emitted but not yet seen as roots, with when they were sent.
    pending: Mutex<HashMap<(ItemId, DateTime<Utc>), DateTime<Utc>>>,
}

impl TriggerEvaluator {
    pub fn new(registry: Arc<SchedulerRegistry>, store: Arc<LogStore>, lookback_mins: i64) -> Self {
        Self {
            registry,
            store,
            lookback: Duration::minutes(lookback_mins.max(1)),
            pending: Mutex::new(HashMap::new()),
        }
    }

    /// Evaluate every active item at `now`. Returns the occurrences that have
    /// no root yet and were not emitted within the last grace period.
    pub async fn tick(&self, now: DateTime<Utc>) -> Result<Vec<TriggerEvent>> {
        let due = self.registry.list_due(now, self.lookback)?;
        let mut events = Vec::new();
        let mut fired = Vec::new();
        for (item, occurrence) in due {
            if self.store.root_for_occurrence(item.id, occurrence).await?.is_some() {
                tracing::debug!(item_id = %item.id, %occurrence, "occurrence already fired");
                fired.push((item.id, occurrence));
                continue;
            }
            events.push((item, occurrence));
        }

        let mut pending = self
            .pending
            .lock()
            .map_err(|e| ReportClawError::Store(format!("Trigger lock: {e}")))?;
        let floor = now - self.lookback;
        pending.retain(|(_, occurrence), _| *occurrence >= floor);
        for key in fired {
            pending.remove(&key);
        }

        let mut emitted = Vec::new();
        for (item, occurrence) in events {
            match pending.get(&(item.id, occurrence)) {
                Some(sent) if now - *sent < Duration::seconds(REEMIT_AFTER_SECS) => continue,
                Some(_) => {
                    tracing::warn!(item_id = %item.id, %occurrence, "⚠️ No job yet for emitted occurrence, emitting again");
                }
                None => {
                    tracing::info!(
                        item_id = %item.id,
                        %occurrence,
                        "🔔 Item due: '{}'",
                        item.name
                    );
                }
            }
            pending.insert((item.id, occurrence), now);
            emitted.push(TriggerEvent {
                item_id: item.id,
                occurrence,
            });
        }
        Ok(emitted)
    }

    /// Tick every `interval_secs` until the receiving side goes away.
    pub async fn run(self: Arc<Self>, interval_secs: u64, tx: mpsc::Sender<TriggerEvent>) {
        tracing::info!("⏰ Trigger evaluator started (check every {}s)", interval_secs);
        let mut interval = tokio::time::interval(std::time::Duration::from_secs(interval_secs));

        loop {
            interval.tick().await;

            let events = match self.tick(Utc::now()).await {
                Ok(events) => events,
                Err(e) => {
                    tracing::warn!("⚠️ Trigger evaluation failed: {e}");
                    continue;
                }
            };

            for event in events {
                if tx.send(event).await.is_err() {
                    tracing::info!("Trigger channel closed, evaluator stopping");
                    return;
                }
            }
        }
    }
}
