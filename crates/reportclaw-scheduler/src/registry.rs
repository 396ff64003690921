//! Scheduler registry holds the set of scheduled items and their enabled state.
//!
//! Every write is validated (target exclusivity, destinations, cadence
//! syntax) and authorized before it reaches the database. The database is the
//! source of truth: reads go to it, so edits made by another process sharing
//! the file are seen on the next call. Parsed cadences are cached and reused
//! while an item's stored cadence is unchanged.

use std::collections::HashMap;
use std::sync::{Arc, RwLock};

use chrono::{DateTime, Duration, Utc};

use reportclaw_core::error::{ReportClawError, Result};
use reportclaw_core::types::{Action, Actor, ItemDraft, ItemId, Resource, ScheduledItem, Target};

use crate::cron::CronSchedule;
use crate::gate::{AuthorizationGate, authorize};
use crate::persistence::SchedulerDb;

struct Entry {
    item: ScheduledItem,
    schedule: Option<CronSchedule>,
}

impl Entry {
    /// Entry for `item`, reusing `previous`'s parsed cadence when it still applies.
    fn refreshed(item: ScheduledItem, previous: Option<Entry>) -> Self {
        match previous {
            Some(old) if old.item.cadence == item.cadence => Self {
                item,
                schedule: old.schedule,
            },
            _ => Self::new(item),
        }
    }

    fn new(item: ScheduledItem) -> Self {
        let schedule = match CronSchedule::from_cadence(&item.cadence) {
            Ok(s) => Some(s),
            Err(e) => {
                tracing::warn!(item_id = %item.id, "⚠️ stored cadence no longer parses: {e}");
                None
            }
        };
        Self { item, schedule }
    }
}

/// CRUD over scheduled items plus due-occurrence lookup.
pub struct SchedulerRegistry {
    db: Arc<SchedulerDb>,
    gate: Arc<dyn AuthorizationGate>,
    items: RwLock<HashMap<ItemId, Entry>>,
}

impl SchedulerRegistry {
    /// Load every stored item.
    pub fn new(db: Arc<SchedulerDb>, gate: Arc<dyn AuthorizationGate>) -> Result<Self> {
        let items = db
            .load_items()?
            .into_iter()
            .map(|item| (item.id, Entry::new(item)))
            .collect::<HashMap<_, _>>();
        tracing::info!("📋 Loaded {} scheduled items", items.len());
        Ok(Self {
            db,
            gate,
            items: RwLock::new(items),
        })
    }

    /// Create an item owned by `actor`.
    pub fn create(&self, actor: &Actor, draft: ItemDraft) -> Result<ScheduledItem> {
        // Owner left empty: creation needs a role or grant, not ownership.
        let resource = Resource::ScheduledItem {
            organization_id: actor.organization_id.clone(),
            project_id: draft.project_id.clone(),
            owner: String::new(),
        };
        authorize(self.gate.as_ref(), actor, Action::Manage, &resource)?;

        let (target, schedule) = validate_draft(&draft)?;
        let now = Utc::now();
        let item = ScheduledItem {
            id: ItemId::new(),
            name: draft.name.trim().to_string(),
            organization_id: actor.organization_id.clone(),
            project_id: draft.project_id,
            target,
            format: draft.format,
            cadence: draft.cadence,
            destinations: draft.destinations,
            owner: actor.user_id.clone(),
            enabled: draft.enabled,
            created_at: now,
            updated_at: now,
            active_since: now,
            deleted_at: None,
        };
        self.db.save_item(&item)?;
        tracing::info!(
            item_id = %item.id,
            owner = %item.owner,
            cadence = %schedule.expression(),
            "📅 Scheduled item created: '{}'",
            item.name
        );
        self.write()?.insert(
            item.id,
            Entry {
                item: item.clone(),
                schedule: Some(schedule),
            },
        );
        Ok(item)
    }

    /// Replace cadence, target, destinations, format, name and enabled state.
    pub fn update(&self, actor: &Actor, id: ItemId, draft: ItemDraft) -> Result<ScheduledItem> {
        let (target, schedule) = validate_draft(&draft)?;
        self.mutate(actor, id, |item| {
            item.name = draft.name.trim().to_string();
            item.project_id = draft.project_id;
            item.target = target;
            item.format = draft.format;
            item.cadence = draft.cadence;
            item.destinations = draft.destinations;
            item.enabled = draft.enabled;
            Ok(Some(schedule))
        })
    }

    /// Stop automatic triggering. In-flight jobs are not affected.
    pub fn pause(&self, actor: &Actor, id: ItemId) -> Result<ScheduledItem> {
        self.mutate(actor, id, |item| {
            item.enabled = false;
            Ok(None)
        })
    }

    pub fn resume(&self, actor: &Actor, id: ItemId) -> Result<ScheduledItem> {
        self.mutate(actor, id, |item| {
            if item.destinations.is_empty() {
                return Err(ReportClawError::Validation(
                    "cannot enable an item without destinations".into(),
                ));
            }
            item.enabled = true;
            Ok(None)
        })
    }

    /// Soft delete: the item stops triggering, its history stays queryable.
    pub fn delete(&self, actor: &Actor, id: ItemId) -> Result<ScheduledItem> {
        self.mutate(actor, id, |item| {
            item.enabled = false;
            item.deleted_at = Some(Utc::now());
            Ok(None)
        })
    }

    /// Apply `change` to the stored item after checking the actor may modify it.
    ///
    /// `active_since` moves to now when the item becomes active again or its
    /// cadence changes, so neither fires occurrences from before the change.
    fn mutate<F>(&self, actor: &Actor, id: ItemId, change: F) -> Result<ScheduledItem>
    where
        F: FnOnce(&mut ScheduledItem) -> Result<Option<CronSchedule>>,
    {
        let current = self
            .db
            .get_item(id)?
            .filter(|item| !item.is_deleted())
            .ok_or_else(|| ReportClawError::NotFound(format!("scheduled item {id}")))?;

        if current.owner != actor.user_id && !actor.is_org_admin(&current.organization_id) {
            return Err(ReportClawError::Authorization(format!(
                "only the owner or an organization admin may modify item {id}"
            )));
        }

        let mut updated = current.clone();
        let schedule = change(&mut updated)?;
        let now = Utc::now();
        updated.updated_at = now;
        if updated.is_active() && (!current.is_active() || current.cadence != updated.cadence) {
            updated.active_since = now;
        }
        self.db.save_item(&updated)?;

        tracing::info!(
            item_id = %id,
            enabled = updated.enabled,
            deleted = updated.is_deleted(),
            "✏️ Scheduled item updated by {}",
            actor.user_id
        );
        let entry = match schedule {
            Some(schedule) => Entry {
                item: updated.clone(),
                schedule: Some(schedule),
            },
            None => Entry::new(updated.clone()),
        };
        self.write()?.insert(id, entry);
        Ok(updated)
    }

    /// Fetch an item, soft-deleted ones included.
    pub fn get(&self, id: ItemId) -> Result<ScheduledItem> {
        self.db
            .get_item(id)?
            .ok_or_else(|| ReportClawError::NotFound(format!("scheduled item {id}")))
    }

    /// Live items, optionally limited to one project, oldest first.
    pub fn list(&self, project_id: Option<&str>) -> Result<Vec<ScheduledItem>> {
        self.refresh()?;
        let mut items: Vec<_> = self
            .read()?
            .values()
            .filter(|e| !e.item.is_deleted())
            .filter(|e| project_id.is_none_or(|p| e.item.project_id == p))
            .map(|e| e.item.clone())
            .collect();
        items.sort_by_key(|i| i.created_at);
        Ok(items)
    }

    /// Active items whose most recent occurrence at or before `now` falls
    /// inside the lookback window, paired with that occurrence.
    ///
    /// Only the latest occurrence is reported; older missed ones are skipped.
    /// Occurrences before the item's `active_since` are never reported, so a
    /// fresh, resumed or re-scheduled item does not fire retroactively. Other
    /// edits (name, destinations) leave pending occurrences due.
    pub fn list_due(
        &self,
        now: DateTime<Utc>,
        lookback: Duration,
    ) -> Result<Vec<(ScheduledItem, DateTime<Utc>)>> {
        let floor = now - lookback;
        self.refresh()?;
        let items = self.read()?;
        let mut due: Vec<_> = items
            .values()
            .filter(|e| e.item.is_active())
            .filter_map(|e| {
                let occurrence = e.schedule.as_ref()?.latest_at_or_before(now)?;
                (occurrence >= floor && occurrence >= e.item.active_since)
                    .then(|| (e.item.clone(), occurrence))
            })
            .collect();
        due.sort_by_key(|(item, at)| (*at, item.created_at));
        Ok(due)
    }

    /// Next occurrence per active item, for display.
    pub fn next_run(&self, id: ItemId, after: DateTime<Utc>) -> Result<Option<DateTime<Utc>>> {
        let item = self.get(id)?;
        if !item.is_active() {
            return Ok(None);
        }
        let mut items = self.write()?;
        let previous = items.remove(&id);
        let entry = items.entry(id).or_insert(Entry::refreshed(item, previous));
        Ok(entry.schedule.as_ref().and_then(|s| s.next_after(after)))
    }

    /// Reload every item from the database.
    fn refresh(&self) -> Result<()> {
        let stored = self.db.load_items()?;
        let mut items = self.write()?;
        let mut fresh = HashMap::with_capacity(stored.len());
        for item in stored {
            let previous = items.remove(&item.id);
            fresh.insert(item.id, Entry::refreshed(item, previous));
        }
        *items = fresh;
        Ok(())
    }

    fn read(&self) -> Result<std::sync::RwLockReadGuard<'_, HashMap<ItemId, Entry>>> {
        self.items
            .read()
            .map_err(|e| ReportClawError::Store(format!("Registry lock: {e}")))
    }

    fn write(&self) -> Result<std::sync::RwLockWriteGuard<'_, HashMap<ItemId, Entry>>> {
        self.items
            .write()
            .map_err(|e| ReportClawError::Store(format!("Registry lock: {e}")))
    }
}

/// Validate a draft, returning its target and parsed cadence.
pub fn validate_draft(draft: &ItemDraft) -> Result<(Target, CronSchedule)> {
    if draft.name.trim().is_empty() {
        return Err(ReportClawError::Validation("name must not be empty".into()));
    }
    if draft.project_id.trim().is_empty() {
        return Err(ReportClawError::Validation("project must not be empty".into()));
    }
    let target = Target::from_parts(draft.chart.clone(), draft.dashboard.clone())?;
    if draft.enabled && draft.destinations.is_empty() {
        return Err(ReportClawError::Validation(
            "an enabled item needs at least one destination".into(),
        ));
    }
    for destination in &draft.destinations {
        destination.validate()?;
    }
    let schedule = CronSchedule::from_cadence(&draft.cadence)?;
    Ok((target, schedule))
}
