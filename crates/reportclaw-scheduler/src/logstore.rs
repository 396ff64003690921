//! Log store: system of record for job trees.
//!
//! Two tables: `tasks` holds one row per task with its current status, and
//! `log_entries` is the append-only history of transitions. A task row and
//! its log entry are always written in the same transaction, so the current
//! status and the latest entry never disagree.
//!
//! Appends for one task are serialized by a per-task lock and validated
//! against the state machine; different tasks append concurrently. Writes go
//! through one connection; reads are spread over a small pool of read-only
//! WAL connections so history queries never wait behind appends.

use std::collections::HashMap;
use std::path::Path;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use chrono::{DateTime, Utc};
use rusqlite::{Connection, OpenFlags, OptionalExtension, Transaction, params};
use tokio::sync::Mutex;

use reportclaw_core::error::{ReportClawError, Result};
use reportclaw_core::types::{
    FailureDetail, ItemId, LogEntry, Task, TaskId, TaskOutput, TaskStatus,
};

use crate::persistence::{parse_ts, store_err, ts};

const TASK_COLUMNS: &str = "id, parent_id, item_id, kind, scheduled_time, occurrence, status, \
     created_at, started_at, completed_at, error, destination, snapshot, requested_by, retry_of";

const ENTRY_COLUMNS: &str = "seq, task_id, parent_id, item_id, kind, status, scheduled_time, at, error";

/// Read-only connections opened next to the writer for on-disk stores.
const READERS: usize = 4;

const BUSY_TIMEOUT: Duration = Duration::from_secs(5);

type Shared = Arc<Mutex<Connection>>;

pub struct LogStore {
    writer: Shared,
    readers: Vec<Shared>,
    next_reader: AtomicUsize,
    task_locks: std::sync::Mutex<HashMap<TaskId, Arc<Mutex<()>>>>,
}

impl LogStore {
    pub fn open(path: &Path) -> Result<Self> {
        let conn = Connection::open(path).map_err(|e| store_err("Log store open", e))?;
        // Appends must be on disk before they are acknowledged
        conn.execute_batch("PRAGMA journal_mode=WAL; PRAGMA synchronous=FULL;")
            .map_err(|e| store_err("Log store pragmas", e))?;
        conn.busy_timeout(BUSY_TIMEOUT)
            .map_err(|e| store_err("Log store pragmas", e))?;
        migrate(&conn)?;

        let readers = (0..READERS)
            .map(|_| {
                let reader = Connection::open_with_flags(
                    path,
                    OpenFlags::SQLITE_OPEN_READ_ONLY | OpenFlags::SQLITE_OPEN_NO_MUTEX,
                )
                .map_err(|e| store_err("Log store open reader", e))?;
                reader
                    .busy_timeout(BUSY_TIMEOUT)
                    .map_err(|e| store_err("Log store open reader", e))?;
                Ok(Arc::new(Mutex::new(reader)))
            })
            .collect::<Result<Vec<_>>>()?;
        Ok(Self::assemble(Arc::new(Mutex::new(conn)), readers))
    }

    /// Private in-memory store. A memory database cannot be shared between
    /// connections, so reads use the writer.
    pub fn open_in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory().map_err(|e| store_err("Log store open", e))?;
        migrate(&conn)?;
        let writer = Arc::new(Mutex::new(conn));
        Ok(Self::assemble(writer.clone(), vec![writer]))
    }

    fn assemble(writer: Shared, readers: Vec<Shared>) -> Self {
        Self {
            writer,
            readers,
            next_reader: AtomicUsize::new(0),
            task_locks: std::sync::Mutex::new(HashMap::new()),
        }
    }

    /// Run `f` against the writer on the blocking pool.
    async fn with_conn<T, F>(&self, f: F) -> Result<T>
    where
        T: Send + 'static,
        F: FnOnce(&mut Connection) -> Result<T> + Send + 'static,
    {
        run_blocking(self.writer.clone(), f).await
    }

    /// Run a read-only `f` on the next reader, round robin.
    async fn with_reader<T, F>(&self, f: F) -> Result<T>
    where
        T: Send + 'static,
        F: FnOnce(&mut Connection) -> Result<T> + Send + 'static,
    {
        let idx = self.next_reader.fetch_add(1, Ordering::Relaxed) % self.readers.len();
        run_blocking(self.readers[idx].clone(), f).await
    }

    fn task_lock(&self, id: TaskId) -> Result<Arc<Mutex<()>>> {
        let mut locks = self
            .task_locks
            .lock()
            .map_err(|e| ReportClawError::Store(format!("Lock: {e}")))?;
        Ok(locks.entry(id).or_default().clone())
    }

    fn release_task_lock(&self, id: TaskId) {
        if let Ok(mut locks) = self.task_locks.lock() {
            locks.remove(&id);
        }
    }

    // ─── Writes ───────────────────────────────────────────────

    /// Persist a new root in `scheduled` together with its first log entry.
    ///
    /// A triggered root (one with an occurrence and no `retry_of`) is unique
    /// per `(item, occurrence)`: when one already exists it is returned with
    /// `false` and nothing is written.
    pub async fn create_root(&self, task: Task) -> Result<(Task, bool)> {
        if !task.is_root() || !task.kind.is_root() || task.status != TaskStatus::Scheduled {
            return Err(ReportClawError::Invariant(format!(
                "task {} is not a fresh root",
                task.id
            )));
        }
        self.with_conn(move |conn| {
            let tx = conn.transaction().map_err(|e| store_err("Create root", e))?;
            if !insert_task(&tx, &task)? {
                let existing = match task.occurrence {
                    Some(occurrence) => find_root(&tx, task.item_id, occurrence)?,
                    None => None,
                };
                return existing.map(|t| (t, false)).ok_or_else(|| {
                    ReportClawError::Invariant(format!("task {} could not be inserted", task.id))
                });
            }
            insert_entry(&tx, &task, TaskStatus::Scheduled, task.created_at, None)?;
            tx.commit().map_err(|e| store_err("Create root", e))?;
            Ok((task, true))
        })
        .await
    }

    /// Persist the children of a completed root, exactly once.
    ///
    /// If the root already has children (a retried fan-out), those are
    /// returned unchanged and `children` is discarded.
    pub async fn create_children(&self, parent_id: TaskId, children: Vec<Task>) -> Result<Vec<Task>> {
        if let Some(bad) = children.iter().find(|c| c.parent_id != Some(parent_id)) {
            return Err(ReportClawError::Invariant(format!(
                "task {} does not belong to parent {parent_id}",
                bad.id
            )));
        }
        self.with_conn(move |conn| {
            let tx = conn.transaction().map_err(|e| store_err("Create children", e))?;
            let parent = load_task(&tx, parent_id)?
                .ok_or_else(|| ReportClawError::NotFound(format!("task {parent_id}")))?;
            if !parent.is_root() {
                return Err(ReportClawError::Invariant(format!(
                    "task {parent_id} is a child; trees are one level deep"
                )));
            }
            if parent.status != TaskStatus::Completed {
                return Err(ReportClawError::Invariant(format!(
                    "root {parent_id} is {} and cannot fan out",
                    parent.status
                )));
            }

            let existing = load_children(&tx, parent_id)?;
            if !existing.is_empty() {
                return Ok(existing);
            }
            for child in &children {
                insert_task(&tx, child)?;
                insert_entry(&tx, child, TaskStatus::Scheduled, child.created_at, None)?;
            }
            tx.commit().map_err(|e| store_err("Create children", e))?;
            Ok(children)
        })
        .await
    }

    /// Append a transition for one task.
    ///
    /// Rejects with [`ReportClawError::Invariant`] anything that is not the
    /// next legal step from the task's current status. `error` must be given
    /// exactly when moving to `error`; `output` is kept for completed tasks.
    pub async fn transition(
        &self,
        task_id: TaskId,
        next: TaskStatus,
        error: Option<FailureDetail>,
        output: Option<TaskOutput>,
    ) -> Result<LogEntry> {
        if (next == TaskStatus::Error) != error.is_some() {
            return Err(ReportClawError::Invariant(format!(
                "task {task_id}: failure detail is required for, and only for, status error"
            )));
        }

        let lock = self.task_lock(task_id)?;
        let _guard = lock.lock().await;

        let entry = self
            .with_conn(move |conn| {
                let tx = conn.transaction().map_err(|e| store_err("Transition", e))?;
                let task = load_task(&tx, task_id)?
                    .ok_or_else(|| ReportClawError::NotFound(format!("task {task_id}")))?;
                if !task.status.can_advance_to(next) {
                    return Err(ReportClawError::Invariant(format!(
                        "task {task_id}: illegal transition {} → {next}",
                        task.status
                    )));
                }

                let now = Utc::now();
                match next {
                    TaskStatus::Started => tx.execute(
                        "UPDATE tasks SET status = ?2, started_at = ?3 WHERE id = ?1",
                        params![task_id.to_string(), next.as_str(), ts(now)],
                    ),
                    _ => tx.execute(
                        "UPDATE tasks SET status = ?2, completed_at = ?3, error = ?4, output = ?5
                         WHERE id = ?1",
                        params![
                            task_id.to_string(),
                            next.as_str(),
                            ts(now),
                            to_json(&error)?,
                            to_json(&output)?
                        ],
                    ),
                }
                .map_err(|e| store_err("Transition", e))?;

                let entry = insert_entry(&tx, &task, next, now, error)?;
                tx.commit().map_err(|e| store_err("Transition", e))?;
                Ok(entry)
            })
            .await?;

        if next.is_terminal() {
            self.release_task_lock(task_id);
        }
        Ok(entry)
    }

    // ─── Reads ────────────────────────────────────────────────

    pub async fn get_task(&self, id: TaskId) -> Result<Option<Task>> {
        self.with_reader(move |conn| load_task(conn, id)).await
    }

    /// Output recorded when the task completed.
    pub async fn task_output(&self, id: TaskId) -> Result<Option<TaskOutput>> {
        self.with_reader(move |conn| {
            let raw: Option<Option<String>> = conn
                .query_row(
                    "SELECT output FROM tasks WHERE id = ?1",
                    [id.to_string()],
                    |row| row.get(0),
                )
                .optional()
                .map_err(|e| store_err("Task output", e))?;
            raw.flatten().as_deref().map(from_json).transpose()
        })
        .await
    }

    /// Children of a root in creation order.
    pub async fn children(&self, parent_id: TaskId) -> Result<Vec<Task>> {
        self.with_reader(move |conn| load_children(conn, parent_id)).await
    }

    /// Full transition history of one task, oldest first.
    pub async fn query_by_task(&self, id: TaskId) -> Result<Vec<LogEntry>> {
        self.with_reader(move |conn| load_entries(conn, id)).await
    }

    /// Latest entry of one task.
    pub async fn latest(&self, id: TaskId) -> Result<Option<LogEntry>> {
        self.with_reader(move |conn| {
            conn.query_row(
                &format!(
                    "SELECT {ENTRY_COLUMNS} FROM log_entries WHERE task_id = ?1
                     ORDER BY seq DESC LIMIT 1"
                ),
                [id.to_string()],
                EntryRow::from_row,
            )
            .optional()
            .map_err(|e| store_err("Latest entry", e))?
            .map(EntryRow::into_entry)
            .transpose()
        })
        .await
    }

    /// Root tasks of an item, most recent scheduled time first.
    pub async fn roots_for_item(&self, item_id: ItemId, limit: usize) -> Result<Vec<Task>> {
        self.with_reader(move |conn| {
            let mut stmt = conn
                .prepare(&format!(
                    "SELECT {TASK_COLUMNS} FROM tasks
                     WHERE item_id = ?1 AND parent_id IS NULL
                     ORDER BY scheduled_time DESC, created_at DESC LIMIT ?2"
                ))
                .map_err(|e| store_err("Roots for item", e))?;
            let rows = stmt
                .query_map(params![item_id.to_string(), limit as i64], TaskRow::from_row)
                .map_err(|e| store_err("Roots for item", e))?
                .collect::<std::result::Result<Vec<_>, _>>()
                .map_err(|e| store_err("Roots for item", e))?;
            rows.into_iter().map(TaskRow::into_task).collect()
        })
        .await
    }

    /// Every task of an item's most recent `limit` jobs, each with its log
    /// entries. Each root is followed by its children; roots are ordered by
    /// scheduled time, most recent first.
    pub async fn query_by_scheduled_item(
        &self,
        item_id: ItemId,
        limit: usize,
    ) -> Result<Vec<(Task, Vec<LogEntry>)>> {
        self.with_reader(move |conn| {
            let roots = {
                let mut stmt = conn
                    .prepare(&format!(
                        "SELECT {TASK_COLUMNS} FROM tasks
                         WHERE item_id = ?1 AND parent_id IS NULL
                         ORDER BY scheduled_time DESC, created_at DESC LIMIT ?2"
                    ))
                    .map_err(|e| store_err("Query by item", e))?;
                let rows = stmt
                    .query_map(params![item_id.to_string(), limit as i64], TaskRow::from_row)
                    .map_err(|e| store_err("Query by item", e))?
                    .collect::<std::result::Result<Vec<_>, _>>()
                    .map_err(|e| store_err("Query by item", e))?;
                rows.into_iter()
                    .map(TaskRow::into_task)
                    .collect::<Result<Vec<_>>>()?
            };

            // Entries are read only for the selected jobs, not the item's
            // whole history
            let mut out = Vec::new();
            for root in roots {
                let children = load_children(conn, root.id)?;
                let root_entries = load_entries(conn, root.id)?;
                out.push((root, root_entries));
                for child in children {
                    let child_entries = load_entries(conn, child.id)?;
                    out.push((child, child_entries));
                }
            }
            Ok(out)
        })
        .await
    }

    /// The root created for `(item, occurrence)` by a trigger, if any.
    pub async fn root_for_occurrence(
        &self,
        item_id: ItemId,
        occurrence: DateTime<Utc>,
    ) -> Result<Option<Task>> {
        self.with_reader(move |conn| find_root(conn, item_id, occurrence)).await
    }

    /// Tasks left `scheduled` or `started`, oldest first. After a restart
    /// these are the jobs a previous process did not finish.
    pub async fn unfinished_tasks(&self) -> Result<Vec<Task>> {
        self.with_reader(|conn| {
            let mut stmt = conn
                .prepare(&format!(
                    "SELECT {TASK_COLUMNS} FROM tasks
                     WHERE status IN ('scheduled', 'started')
                     ORDER BY parent_id IS NOT NULL, created_at, rowid"
                ))
                .map_err(|e| store_err("Unfinished tasks", e))?;
            let rows = stmt
                .query_map([], TaskRow::from_row)
                .map_err(|e| store_err("Unfinished tasks", e))?
                .collect::<std::result::Result<Vec<_>, _>>()
                .map_err(|e| store_err("Unfinished tasks", e))?;
            rows.into_iter().map(TaskRow::into_task).collect()
        })
        .await
    }

    /// Completed roots that never fanned out.
    pub async fn roots_awaiting_fan_out(&self) -> Result<Vec<Task>> {
        self.with_reader(|conn| {
            let mut stmt = conn
                .prepare(&format!(
                    "SELECT {TASK_COLUMNS} FROM tasks t
                     WHERE t.parent_id IS NULL AND t.status = 'completed'
                       AND NOT EXISTS (SELECT 1 FROM tasks c WHERE c.parent_id = t.id)
                     ORDER BY t.created_at, t.rowid"
                ))
                .map_err(|e| store_err("Roots awaiting fan-out", e))?;
            let rows = stmt
                .query_map([], TaskRow::from_row)
                .map_err(|e| store_err("Roots awaiting fan-out", e))?
                .collect::<std::result::Result<Vec<_>, _>>()
                .map_err(|e| store_err("Roots awaiting fan-out", e))?;
            rows.into_iter().map(TaskRow::into_task).collect()
        })
        .await
    }

    /// Number of log entries for an item (all jobs).
    pub async fn entry_count(&self, item_id: ItemId) -> Result<usize> {
        self.with_reader(move |conn| {
            conn.query_row(
                "SELECT COUNT(*) FROM log_entries WHERE item_id = ?1",
                [item_id.to_string()],
                |row| row.get::<_, i64>(0),
            )
            .map(|n| n as usize)
            .map_err(|e| store_err("Entry count", e))
        })
        .await
    }

    /// Total number of tasks across every item.
    pub async fn task_count(&self) -> Result<usize> {
        self.with_reader(|conn| {
            conn.query_row("SELECT COUNT(*) FROM tasks", [], |row| row.get::<_, i64>(0))
                .map(|n| n as usize)
                .map_err(|e| store_err("Task count", e))
        })
        .await
    }
}

async fn run_blocking<T, F>(conn: Shared, f: F) -> Result<T>
where
    T: Send + 'static,
    F: FnOnce(&mut Connection) -> Result<T> + Send + 'static,
{
    tokio::task::spawn_blocking(move || {
        let mut conn = conn.blocking_lock();
        f(&mut conn)
    })
    .await
    .map_err(|e| ReportClawError::Store(format!("Blocking task join error: {e}")))?
}

fn migrate(conn: &Connection) -> Result<()> {
    conn.execute_batch(
        "
        CREATE TABLE IF NOT EXISTS tasks (
            id TEXT PRIMARY KEY,
            parent_id TEXT,
            item_id TEXT NOT NULL,
            kind TEXT NOT NULL,
            scheduled_time TEXT NOT NULL,
            occurrence TEXT,
            status TEXT NOT NULL,
            created_at TEXT NOT NULL,
            started_at TEXT,
            completed_at TEXT,
            error TEXT,                 -- JSON FailureDetail
            destination TEXT,           -- JSON Destination (children)
            snapshot TEXT,              -- JSON ItemSnapshot (roots)
            requested_by TEXT,
            retry_of TEXT,
            output TEXT                 -- JSON TaskOutput
        );
        CREATE INDEX IF NOT EXISTS idx_tasks_item_roots
            ON tasks(item_id, scheduled_time DESC) WHERE parent_id IS NULL;
        CREATE INDEX IF NOT EXISTS idx_tasks_parent ON tasks(parent_id);
        CREATE UNIQUE INDEX IF NOT EXISTS idx_tasks_occurrence
            ON tasks(item_id, occurrence)
            WHERE parent_id IS NULL AND occurrence IS NOT NULL AND retry_of IS NULL;

        CREATE TABLE IF NOT EXISTS log_entries (
            seq INTEGER PRIMARY KEY AUTOINCREMENT,
            task_id TEXT NOT NULL,
            parent_id TEXT,
            item_id TEXT NOT NULL,
            kind TEXT NOT NULL,
            status TEXT NOT NULL,
            scheduled_time TEXT NOT NULL,
            at TEXT NOT NULL,
            error TEXT
        );
        CREATE INDEX IF NOT EXISTS idx_entries_task ON log_entries(task_id, seq);
        CREATE INDEX IF NOT EXISTS idx_entries_item ON log_entries(item_id, seq);
        ",
    )
    .map_err(|e| store_err("Log store migration", e))
}

/// Insert a task row. Returns false when a unique constraint swallowed it.
fn insert_task(tx: &Transaction<'_>, task: &Task) -> Result<bool> {
    let inserted = tx
        .execute(
            &format!(
                "INSERT OR IGNORE INTO tasks ({TASK_COLUMNS})
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14, ?15)"
            ),
            params![
                task.id.to_string(),
                task.parent_id.map(|p| p.to_string()),
                task.item_id.to_string(),
                task.kind.as_str(),
                ts(task.scheduled_time),
                task.occurrence.map(ts),
                task.status.as_str(),
                ts(task.created_at),
                task.started_at.map(ts),
                task.completed_at.map(ts),
                to_json(&task.error)?,
                to_json(&task.destination)?,
                to_json(&task.snapshot)?,
                task.requested_by,
                task.retry_of.map(|r| r.to_string()),
            ],
        )
        .map_err(|e| store_err("Insert task", e))?;
    Ok(inserted == 1)
}

fn insert_entry(
    tx: &Transaction<'_>,
    task: &Task,
    status: TaskStatus,
    at: DateTime<Utc>,
    error: Option<FailureDetail>,
) -> Result<LogEntry> {
    tx.execute(
        "INSERT INTO log_entries (task_id, parent_id, item_id, kind, status, scheduled_time, at, error)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)",
        params![
            task.id.to_string(),
            task.parent_id.map(|p| p.to_string()),
            task.item_id.to_string(),
            task.kind.as_str(),
            status.as_str(),
            ts(task.scheduled_time),
            ts(at),
            to_json(&error)?,
        ],
    )
    .map_err(|e| store_err("Append entry", e))?;

    Ok(LogEntry {
        seq: tx.last_insert_rowid(),
        task_id: task.id,
        parent_id: task.parent_id,
        item_id: task.item_id,
        kind: task.kind,
        status,
        scheduled_time: task.scheduled_time,
        at,
        error,
    })
}

fn load_task(conn: &Connection, id: TaskId) -> Result<Option<Task>> {
    conn.query_row(
        &format!("SELECT {TASK_COLUMNS} FROM tasks WHERE id = ?1"),
        [id.to_string()],
        TaskRow::from_row,
    )
    .optional()
    .map_err(|e| store_err("Load task", e))?
    .map(TaskRow::into_task)
    .transpose()
}

fn load_children(conn: &Connection, parent_id: TaskId) -> Result<Vec<Task>> {
    let mut stmt = conn
        .prepare(&format!(
            "SELECT {TASK_COLUMNS} FROM tasks WHERE parent_id = ?1 ORDER BY created_at, rowid"
        ))
        .map_err(|e| store_err("Load children", e))?;
    let rows = stmt
        .query_map([parent_id.to_string()], TaskRow::from_row)
        .map_err(|e| store_err("Load children", e))?
        .collect::<std::result::Result<Vec<_>, _>>()
        .map_err(|e| store_err("Load children", e))?;
    rows.into_iter().map(TaskRow::into_task).collect()
}

fn load_entries(conn: &Connection, task_id: TaskId) -> Result<Vec<LogEntry>> {
    let mut stmt = conn
        .prepare_cached(&format!(
            "SELECT {ENTRY_COLUMNS} FROM log_entries WHERE task_id = ?1 ORDER BY seq"
        ))
        .map_err(|e| store_err("Load entries", e))?;
    let rows = stmt
        .query_map([task_id.to_string()], EntryRow::from_row)
        .map_err(|e| store_err("Load entries", e))?
        .collect::<std::result::Result<Vec<_>, _>>()
        .map_err(|e| store_err("Load entries", e))?;
    rows.into_iter().map(EntryRow::into_entry).collect()
}

fn find_root(conn: &Connection, item_id: ItemId, occurrence: DateTime<Utc>) -> Result<Option<Task>> {
    conn.query_row(
        &format!(
            "SELECT {TASK_COLUMNS} FROM tasks
             WHERE item_id = ?1 AND occurrence = ?2 AND parent_id IS NULL AND retry_of IS NULL"
        ),
        params![item_id.to_string(), ts(occurrence)],
        TaskRow::from_row,
    )
    .optional()
    .map_err(|e| store_err("Find root", e))?
    .map(TaskRow::into_task)
    .transpose()
}

fn to_json<T: serde::Serialize>(value: &Option<T>) -> Result<Option<String>> {
    value
        .as_ref()
        .map(|v| {
            serde_json::to_string(v).map_err(|e| ReportClawError::Store(format!("Serialize: {e}")))
        })
        .transpose()
}

fn from_json<T: serde::de::DeserializeOwned>(raw: &str) -> Result<T> {
    serde_json::from_str(raw).map_err(|e| ReportClawError::Store(format!("Deserialize: {e}")))
}

struct TaskRow {
    id: String,
    parent_id: Option<String>,
    item_id: String,
    kind: String,
    scheduled_time: String,
    occurrence: Option<String>,
    status: String,
    created_at: String,
    started_at: Option<String>,
    completed_at: Option<String>,
    error: Option<String>,
    destination: Option<String>,
    snapshot: Option<String>,
    requested_by: Option<String>,
    retry_of: Option<String>,
}

impl TaskRow {
    fn from_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<Self> {
        Ok(Self {
            id: row.get(0)?,
            parent_id: row.get(1)?,
            item_id: row.get(2)?,
            kind: row.get(3)?,
            scheduled_time: row.get(4)?,
            occurrence: row.get(5)?,
            status: row.get(6)?,
            created_at: row.get(7)?,
            started_at: row.get(8)?,
            completed_at: row.get(9)?,
            error: row.get(10)?,
            destination: row.get(11)?,
            snapshot: row.get(12)?,
            requested_by: row.get(13)?,
            retry_of: row.get(14)?,
        })
    }

    fn into_task(self) -> Result<Task> {
        Ok(Task {
            id: self.id.parse()?,
            parent_id: self.parent_id.as_deref().map(|p| p.parse::<TaskId>()).transpose()?,
            item_id: self.item_id.parse()?,
            kind: self.kind.parse()?,
            scheduled_time: parse_ts(&self.scheduled_time)?,
            occurrence: self.occurrence.as_deref().map(parse_ts).transpose()?,
            status: self.status.parse()?,
            created_at: parse_ts(&self.created_at)?,
            started_at: self.started_at.as_deref().map(parse_ts).transpose()?,
            completed_at: self.completed_at.as_deref().map(parse_ts).transpose()?,
            error: self.error.as_deref().map(from_json).transpose()?,
            destination: self.destination.as_deref().map(from_json).transpose()?,
            snapshot: self.snapshot.as_deref().map(from_json).transpose()?,
            requested_by: self.requested_by,
            retry_of: self.retry_of.as_deref().map(|r| r.parse::<TaskId>()).transpose()?,
        })
    }
}

struct EntryRow {
    seq: i64,
    task_id: String,
    parent_id: Option<String>,
    item_id: String,
    kind: String,
    status: String,
    scheduled_time: String,
    at: String,
    error: Option<String>,
}

impl EntryRow {
    fn from_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<Self> {
        Ok(Self {
            seq: row.get(0)?,
            task_id: row.get(1)?,
            parent_id: row.get(2)?,
            item_id: row.get(3)?,
            kind: row.get(4)?,
            status: row.get(5)?,
            scheduled_time: row.get(6)?,
            at: row.get(7)?,
            error: row.get(8)?,
        })
    }

    fn into_entry(self) -> Result<LogEntry> {
        Ok(LogEntry {
            seq: self.seq,
            task_id: self.task_id.parse()?,
            parent_id: self.parent_id.as_deref().map(|p| p.parse::<TaskId>()).transpose()?,
            item_id: self.item_id.parse()?,
            kind: self.kind.parse()?,
            status: self.status.parse()?,
            scheduled_time: parse_ts(&self.scheduled_time)?,
            at: parse_ts(&self.at)?,
            error: self.error.as_deref().map(from_json).transpose()?,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use reportclaw_core::types::{
        DeliveryFormat, Destination, ItemSnapshot, ReportArtifact, Target, TaskKind,
    };

    fn snapshot() -> ItemSnapshot {
        ItemSnapshot {
            item_id: ItemId::new(),
            transient: false,
            name: "ops".into(),
            organization_id: "org-1".into(),
            project_id: "proj-1".into(),
            target: Target::Dashboard("dash-1".into()),
            format: DeliveryFormat::Image,
            destinations: vec![
                Destination::Email {
                    recipients: vec!["a@example.com".into()],
                },
                Destination::Chat {
                    channel: "ops".into(),
                },
            ],
            owner: "u1".into(),
            requested_by: None,
        }
    }

    fn occurrence() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2026, 3, 2, 9, 0, 0).unwrap()
    }

    fn triggered_root(snap: ItemSnapshot) -> Task {
        Task::root(TaskKind::RootDelivery, snap, occurrence(), Some(occurrence()))
    }

    async fn completed_root(store: &LogStore) -> Task {
        let (root, _) = store.create_root(triggered_root(snapshot())).await.unwrap();
        store
            .transition(root.id, TaskStatus::Started, None, None)
            .await
            .unwrap();
        store
            .transition(root.id, TaskStatus::Completed, None, None)
            .await
            .unwrap();
        store.get_task(root.id).await.unwrap().unwrap()
    }

    #[tokio::test]
    async fn test_root_round_trip_and_first_entry() {
        let store = LogStore::open_in_memory().unwrap();
        let (root, created) = store.create_root(triggered_root(snapshot())).await.unwrap();
        assert!(created);

        let loaded = store.get_task(root.id).await.unwrap().unwrap();
        assert_eq!(loaded.id, root.id);
        assert_eq!(loaded.kind, TaskKind::RootDelivery);
        assert_eq!(loaded.status, TaskStatus::Scheduled);
        assert_eq!(loaded.occurrence, Some(occurrence()));
        assert_eq!(loaded.snapshot, root.snapshot);

        let entries = store.query_by_task(root.id).await.unwrap();
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].status, TaskStatus::Scheduled);
    }

    #[tokio::test]
    async fn test_same_occurrence_yields_one_root() {
        let store = LogStore::open_in_memory().unwrap();
        let snap = snapshot();
        let (first, created) = store.create_root(triggered_root(snap.clone())).await.unwrap();
        assert!(created);
        let (second, created) = store.create_root(triggered_root(snap.clone())).await.unwrap();
        assert!(!created);
        assert_eq!(first.id, second.id);
        assert_eq!(store.roots_for_item(snap.item_id, 10).await.unwrap().len(), 1);
        assert_eq!(store.entry_count(snap.item_id).await.unwrap(), 1);
    }

    #[tokio::test]
    async fn test_illegal_transitions_rejected() {
        let store = LogStore::open_in_memory().unwrap();
        let (root, _) = store.create_root(triggered_root(snapshot())).await.unwrap();

        // Cannot skip `started`
        let err = store
            .transition(root.id, TaskStatus::Completed, None, None)
            .await
            .unwrap_err();
        assert!(matches!(err, ReportClawError::Invariant(_)));

        store
            .transition(root.id, TaskStatus::Started, None, None)
            .await
            .unwrap();
        // Error requires a failure detail
        assert!(
            store
                .transition(root.id, TaskStatus::Error, None, None)
                .await
                .is_err()
        );
        store
            .transition(
                root.id,
                TaskStatus::Error,
                Some(FailureDetail::execution("render failed")),
                None,
            )
            .await
            .unwrap();
        // Terminal states are final
        assert!(
            store
                .transition(root.id, TaskStatus::Started, None, None)
                .await
                .is_err()
        );

        let statuses: Vec<_> = store
            .query_by_task(root.id)
            .await
            .unwrap()
            .into_iter()
            .map(|e| e.status)
            .collect();
        assert_eq!(
            statuses,
            vec![TaskStatus::Scheduled, TaskStatus::Started, TaskStatus::Error]
        );
        let task = store.get_task(root.id).await.unwrap().unwrap();
        assert!(task.started_at.is_some() && task.completed_at.is_some());
        assert_eq!(task.error.unwrap().message, "render failed");
    }

    #[tokio::test]
    async fn test_fan_out_exactly_once() {
        let store = LogStore::open_in_memory().unwrap();
        let root = completed_root(&store).await;
        let destinations = root.snapshot.clone().unwrap().destinations;

        let make = || {
            destinations
                .iter()
                .cloned()
                .map(|d| Task::child(&root, d))
                .collect::<Vec<_>>()
        };
        let first = store.create_children(root.id, make()).await.unwrap();
        let again = store.create_children(root.id, make()).await.unwrap();
        assert_eq!(first.len(), 2);
        assert_eq!(
            first.iter().map(|t| t.id).collect::<Vec<_>>(),
            again.iter().map(|t| t.id).collect::<Vec<_>>()
        );
        assert_eq!(store.children(root.id).await.unwrap().len(), 2);
        assert_eq!(store.task_count().await.unwrap(), 3);
    }

    #[tokio::test]
    async fn test_fan_out_requires_completed_root() {
        let store = LogStore::open_in_memory().unwrap();
        let (root, _) = store.create_root(triggered_root(snapshot())).await.unwrap();
        let child = Task::child(
            &root,
            Destination::Chat {
                channel: "ops".into(),
            },
        );
        let err = store.create_children(root.id, vec![child]).await.unwrap_err();
        assert!(matches!(err, ReportClawError::Invariant(_)));
    }

    #[tokio::test]
    async fn test_query_by_item_groups_root_and_children() {
        let store = LogStore::open_in_memory().unwrap();
        let root = completed_root(&store).await;
        let children: Vec<_> = root
            .snapshot
            .clone()
            .unwrap()
            .destinations
            .into_iter()
            .map(|d| Task::child(&root, d))
            .collect();
        let children = store.create_children(root.id, children).await.unwrap();
        store
            .transition(children[0].id, TaskStatus::Started, None, None)
            .await
            .unwrap();

        let history = store.query_by_scheduled_item(root.item_id, 10).await.unwrap();
        assert_eq!(history.len(), 3);
        assert_eq!(history[0].0.id, root.id);
        assert_eq!(history[0].1.len(), 3);
        assert_eq!(history[1].1.len(), 2);
        assert_eq!(history[2].1.len(), 1);

        let latest = store.latest(children[0].id).await.unwrap().unwrap();
        assert_eq!(latest.status, TaskStatus::Started);
    }

    #[tokio::test]
    async fn test_output_kept_on_completion() {
        let store = LogStore::open_in_memory().unwrap();
        let (root, _) = store.create_root(triggered_root(snapshot())).await.unwrap();
        store
            .transition(root.id, TaskStatus::Started, None, None)
            .await
            .unwrap();
        let artifact = ReportArtifact {
            url: "https://r/1.png".into(),
            file_name: "1.png".into(),
            format: DeliveryFormat::Image,
            rows: None,
        };
        store
            .transition(
                root.id,
                TaskStatus::Completed,
                None,
                Some(TaskOutput::with_artifact(artifact.clone())),
            )
            .await
            .unwrap();
        let output = store.task_output(root.id).await.unwrap().unwrap();
        assert_eq!(output.artifact, Some(artifact));
    }

    #[tokio::test]
    async fn test_concurrent_appends_keep_per_task_order() {
        let store = Arc::new(LogStore::open_in_memory().unwrap());
        let mut ids = Vec::new();
        for _ in 0..8 {
            let (root, _) = store
                .create_root(Task::root(TaskKind::AdHocExport, snapshot(), Utc::now(), None))
                .await
                .unwrap();
            ids.push(root.id);
        }

        let handles: Vec<_> = ids
            .iter()
            .map(|&id| {
                let store = store.clone();
                tokio::spawn(async move {
                    store.transition(id, TaskStatus::Started, None, None).await?;
                    store.transition(id, TaskStatus::Completed, None, None).await
                })
            })
            .collect();
        for handle in handles {
            handle.await.unwrap().unwrap();
        }

        for id in ids {
            let entries = store.query_by_task(id).await.unwrap();
            let statuses: Vec<_> = entries.iter().map(|e| e.status).collect();
            assert_eq!(
                statuses,
                vec![TaskStatus::Scheduled, TaskStatus::Started, TaskStatus::Completed]
            );
            assert!(entries.windows(2).all(|w| w[0].seq < w[1].seq));
        }
    }

    #[tokio::test]
    async fn test_item_history_reads_only_selected_jobs() {
        let store = LogStore::open_in_memory().unwrap();
        let snap = snapshot();
        let older = Task::root(TaskKind::RootDelivery, snap.clone(), occurrence(), Some(occurrence()));
        let (older, _) = store.create_root(older).await.unwrap();
        store
            .transition(older.id, TaskStatus::Started, None, None)
            .await
            .unwrap();

        let later_at = occurrence() + chrono::Duration::days(1);
        let later = Task::root(TaskKind::RootDelivery, snap.clone(), later_at, Some(later_at));
        let (later, _) = store.create_root(later).await.unwrap();

        let history = store.query_by_scheduled_item(snap.item_id, 1).await.unwrap();
        assert_eq!(history.len(), 1);
        assert_eq!(history[0].0.id, later.id);
        assert!(history[0].1.iter().all(|e| e.task_id == later.id));
        assert_eq!(history[0].1.len(), 1);
    }

    #[tokio::test]
    async fn test_unfinished_and_unfanned_roots() {
        let store = LogStore::open_in_memory().unwrap();
        let done = completed_root(&store).await;

        let other = Task::root(TaskKind::AdHocExport, snapshot(), Utc::now(), None);
        let (running, _) = store.create_root(other).await.unwrap();
        store
            .transition(running.id, TaskStatus::Started, None, None)
            .await
            .unwrap();

        let unfinished = store.unfinished_tasks().await.unwrap();
        assert_eq!(unfinished.iter().map(|t| t.id).collect::<Vec<_>>(), vec![running.id]);
        let awaiting = store.roots_awaiting_fan_out().await.unwrap();
        assert_eq!(awaiting.iter().map(|t| t.id).collect::<Vec<_>>(), vec![done.id]);

        let children: Vec<_> = done
            .snapshot
            .clone()
            .unwrap()
            .destinations
            .into_iter()
            .map(|d| Task::child(&done, d))
            .collect();
        store.create_children(done.id, children).await.unwrap();
        assert!(store.roots_awaiting_fan_out().await.unwrap().is_empty());
        // Fresh children are unfinished too, listed after roots
        let unfinished = store.unfinished_tasks().await.unwrap();
        assert_eq!(unfinished.len(), 3);
        assert_eq!(unfinished[0].id, running.id);
    }

    #[tokio::test]
    async fn test_file_store_reads_through_reader_pool() {
        let dir = std::env::temp_dir().join(format!("reportclaw-log-{}", TaskId::new()));
        std::fs::create_dir_all(&dir).unwrap();
        let store = Arc::new(LogStore::open(&dir.join("log.db")).unwrap());
        assert_eq!(store.readers.len(), READERS);

        let (root, _) = store.create_root(triggered_root(snapshot())).await.unwrap();
        store
            .transition(root.id, TaskStatus::Started, None, None)
            .await
            .unwrap();

        // Every reader sees committed writes
        for _ in 0..READERS {
            let task = store.get_task(root.id).await.unwrap().unwrap();
            assert_eq!(task.status, TaskStatus::Started);
        }

        // Reads proceed while a writer holds the write connection
        let guard = store.writer.lock().await;
        let latest = tokio::time::timeout(
            std::time::Duration::from_millis(500),
            store.latest(root.id),
        )
        .await
        .unwrap()
        .unwrap()
        .unwrap();
        assert_eq!(latest.status, TaskStatus::Started);
        drop(guard);
        drop(store);
        std::fs::remove_dir_all(&dir).ok();
    }
}
