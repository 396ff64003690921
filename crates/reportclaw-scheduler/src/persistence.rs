//! SQLite-backed persistence for scheduled items.
//! Survives restarts and is shared by every process opening the same file.
//! Which occurrences already fired is recorded by the log store, not here.

use std::path::Path;
use std::sync::Mutex;

use chrono::{DateTime, SecondsFormat, Utc};
use rusqlite::{Connection, OptionalExtension, params};

use reportclaw_core::error::{ReportClawError, Result};
use reportclaw_core::types::{Cadence, DeliveryFormat, Destination, ItemId, ScheduledItem, Target};

/// Scheduled item definitions.
pub struct SchedulerDb {
    conn: Mutex<Connection>,
}

const ITEM_COLUMNS: &str = "id, name, organization_id, project_id, target_kind, target_ref, format, \
     cron_expression, timezone, destinations, owner, enabled, created_at, updated_at, deleted_at, active_since";

impl SchedulerDb {
    /// Open or create the scheduler database.
    pub fn open(path: &Path) -> Result<Self> {
        let conn = Connection::open(path).map_err(|e| store_err("DB open", e))?;
        conn.execute_batch("PRAGMA journal_mode=WAL; PRAGMA synchronous=FULL;")
            .map_err(|e| store_err("DB pragmas", e))?;
        // Other processes and the log store write to the same file
        conn.busy_timeout(std::time::Duration::from_secs(5))
            .map_err(|e| store_err("DB pragmas", e))?;
        Self::with_connection(conn)
    }

    /// Private in-memory database (tests, dry runs).
    pub fn open_in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory().map_err(|e| store_err("DB open", e))?;
        Self::with_connection(conn)
    }

    fn with_connection(conn: Connection) -> Result<Self> {
        let db = Self {
            conn: Mutex::new(conn),
        };
        db.migrate()?;
        Ok(db)
    }

    fn migrate(&self) -> Result<()> {
        let conn = self.lock()?;
        conn.execute_batch(
            "
            CREATE TABLE IF NOT EXISTS scheduled_items (
                id TEXT PRIMARY KEY,
                name TEXT NOT NULL,
                organization_id TEXT NOT NULL,
                project_id TEXT NOT NULL,
                target_kind TEXT NOT NULL,       -- 'chart' | 'dashboard'
                target_ref TEXT NOT NULL,
                format TEXT NOT NULL,            -- 'csv' | 'image'
                cron_expression TEXT NOT NULL,
                timezone TEXT NOT NULL,
                destinations TEXT NOT NULL,      -- JSON array
                owner TEXT NOT NULL,
                enabled INTEGER NOT NULL DEFAULT 1,
                created_at TEXT NOT NULL,
                updated_at TEXT NOT NULL,
                deleted_at TEXT,
                active_since TEXT                -- occurrences before it never fire
            );
            CREATE INDEX IF NOT EXISTS idx_items_project ON scheduled_items(project_id);
            DROP TABLE IF EXISTS fired_occurrences;
            ",
        )
        .map_err(|e| store_err("Migration", e))?;

        // Databases created before the schedule floor existed
        let has_active_since: bool = conn
            .query_row(
                "SELECT COUNT(*) FROM pragma_table_info('scheduled_items') WHERE name = 'active_since'",
                [],
                |row| row.get::<_, i64>(0),
            )
            .map(|n| n > 0)
            .map_err(|e| store_err("Migration", e))?;
        if !has_active_since {
            conn.execute_batch(
                "ALTER TABLE scheduled_items ADD COLUMN active_since TEXT;
                 UPDATE scheduled_items SET active_since = updated_at;",
            )
            .map_err(|e| store_err("Migration", e))?;
            tracing::info!("🗄️ Added active_since to scheduled_items");
        }
        Ok(())
    }

    fn lock(&self) -> Result<std::sync::MutexGuard<'_, Connection>> {
        self.conn
            .lock()
            .map_err(|e| ReportClawError::Store(format!("Lock: {e}")))
    }

    // ─── Scheduled items ──────────────────────────────────────

    /// Insert or replace an item.
    pub fn save_item(&self, item: &ScheduledItem) -> Result<()> {
        let destinations = serde_json::to_string(&item.destinations)
            .map_err(|e| ReportClawError::Store(format!("Serialize destinations: {e}")))?;
        let conn = self.lock()?;
        conn.execute(
            &format!(
                "INSERT OR REPLACE INTO scheduled_items ({ITEM_COLUMNS})
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14, ?15, ?16)"
            ),
            params![
                item.id.to_string(),
                item.name,
                item.organization_id,
                item.project_id,
                item.target.kind(),
                item.target.reference(),
                item.format.as_str(),
                item.cadence.expression,
                item.cadence.timezone,
                destinations,
                item.owner,
                item.enabled as i32,
                ts(item.created_at),
                ts(item.updated_at),
                item.deleted_at.map(ts),
                ts(item.active_since),
            ],
        )
        .map_err(|e| store_err("Save item", e))?;
        Ok(())
    }

    /// Load every item, soft-deleted ones included.
    pub fn load_items(&self) -> Result<Vec<ScheduledItem>> {
        let conn = self.lock()?;
        let mut stmt = conn
            .prepare(&format!("SELECT {ITEM_COLUMNS} FROM scheduled_items ORDER BY created_at"))
            .map_err(|e| store_err("Load items", e))?;
        let rows = stmt
            .query_map([], ItemRow::from_row)
            .map_err(|e| store_err("Load items", e))?
            .collect::<std::result::Result<Vec<_>, _>>()
            .map_err(|e| store_err("Load items", e))?;
        rows.into_iter().map(ItemRow::into_item).collect()
    }

    pub fn get_item(&self, id: ItemId) -> Result<Option<ScheduledItem>> {
        let conn = self.lock()?;
        let row = conn
            .query_row(
                &format!("SELECT {ITEM_COLUMNS} FROM scheduled_items WHERE id = ?1"),
                [id.to_string()],
                ItemRow::from_row,
            )
            .optional()
            .map_err(|e| store_err("Get item", e))?;
        row.map(ItemRow::into_item).transpose()
    }
}

/// Raw column values, converted outside the rusqlite closure so decode errors
/// surface as store errors.
struct ItemRow {
    id: String,
    name: String,
    organization_id: String,
    project_id: String,
    target_kind: String,
    target_ref: String,
    format: String,
    cron_expression: String,
    timezone: String,
    destinations: String,
    owner: String,
    enabled: bool,
    created_at: String,
    updated_at: String,
    deleted_at: Option<String>,
    active_since: Option<String>,
}

impl ItemRow {
    fn from_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<Self> {
        Ok(Self {
            id: row.get(0)?,
            name: row.get(1)?,
            organization_id: row.get(2)?,
            project_id: row.get(3)?,
            target_kind: row.get(4)?,
            target_ref: row.get(5)?,
            format: row.get(6)?,
            cron_expression: row.get(7)?,
            timezone: row.get(8)?,
            destinations: row.get(9)?,
            owner: row.get(10)?,
            enabled: row.get::<_, i32>(11)? != 0,
            created_at: row.get(12)?,
            updated_at: row.get(13)?,
            deleted_at: row.get(14)?,
            active_since: row.get(15)?,
        })
    }

    fn into_item(self) -> Result<ScheduledItem> {
        let target = match self.target_kind.as_str() {
            "chart" => Target::Chart(self.target_ref),
            "dashboard" => Target::Dashboard(self.target_ref),
            other => {
                return Err(ReportClawError::Store(format!(
                    "item {}: unknown target kind '{other}'",
                    self.id
                )));
            }
        };
        let updated_at = parse_ts(&self.updated_at)?;
        let active_since = match self.active_since.as_deref() {
            Some(raw) => parse_ts(raw)?,
            None => updated_at,
        };
        let destinations: Vec<Destination> = serde_json::from_str(&self.destinations)
            .map_err(|e| ReportClawError::Store(format!("item {}: destinations: {e}", self.id)))?;
        Ok(ScheduledItem {
            id: self.id.parse()?,
            name: self.name,
            organization_id: self.organization_id,
            project_id: self.project_id,
            target,
            format: self.format.parse::<DeliveryFormat>()?,
            cadence: Cadence {
                expression: self.cron_expression,
                timezone: self.timezone,
            },
            destinations,
            owner: self.owner,
            enabled: self.enabled,
            created_at: parse_ts(&self.created_at)?,
            updated_at,
            active_since,
            deleted_at: self.deleted_at.as_deref().map(parse_ts).transpose()?,
        })
    }
}

/// Sortable timestamp encoding shared by every table.
pub(crate) fn ts(t: DateTime<Utc>) -> String {
    t.to_rfc3339_opts(SecondsFormat::Micros, true)
}

pub(crate) fn parse_ts(s: &str) -> Result<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(s)
        .map(|d| d.with_timezone(&Utc))
        .map_err(|e| ReportClawError::Store(format!("bad timestamp '{s}': {e}")))
}

pub(crate) fn store_err(context: &str, e: rusqlite::Error) -> ReportClawError {
    ReportClawError::Store(format!("{context}: {e}"))
}
