use std::path::{Path, PathBuf};
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use rusqlite::{params, Connection, OptionalExtension, Row, TransactionBehavior};
use tokio::sync::Mutex;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::backends::{CapabilitySet, TaskManager};
use crate::models::task::LOCAL_UID_PREFIX;
use crate::models::{
    ConflictRecord, ConflictResolution, OperationKind, Task, TaskList, TaskStatus,
};
use crate::utils::error::{TodoError, TodoResult};

/// Window for the conservative create-dedup heuristic: a pulled remote task
/// is matched to a placeholder row only when their creation times are this
/// close and list + summary agree.
#[must_use]
pub fn dedup_window() -> Duration {
    Duration::minutes(2)
}

const SCHEMA: &str = "
CREATE TABLE IF NOT EXISTS lists (
    id              INTEGER PRIMARY KEY AUTOINCREMENT,
    uid             TEXT NOT NULL UNIQUE,
    name            TEXT NOT NULL,
    description     TEXT NOT NULL DEFAULT '',
    color           TEXT NOT NULL DEFAULT '',
    modified        TEXT NOT NULL,
    deleted_at      TEXT,
    synced_modified TEXT
);
CREATE UNIQUE INDEX IF NOT EXISTS idx_cache_lists_name
    ON lists(name COLLATE NOCASE) WHERE deleted_at IS NULL;

CREATE TABLE IF NOT EXISTS tasks (
    id              INTEGER PRIMARY KEY AUTOINCREMENT,
    uid             TEXT NOT NULL UNIQUE,
    list_uid        TEXT NOT NULL REFERENCES lists(uid)
                        ON UPDATE CASCADE ON DELETE CASCADE,
    summary         TEXT NOT NULL,
    description     TEXT NOT NULL DEFAULT '',
    status          TEXT NOT NULL,
    priority        INTEGER NOT NULL DEFAULT 0,
    due             TEXT,
    start           TEXT,
    completed       TEXT,
    categories      TEXT NOT NULL DEFAULT '',
    parent_uid      TEXT REFERENCES tasks(uid) ON UPDATE CASCADE,
    created         TEXT NOT NULL,
    modified        TEXT NOT NULL,
    recurrence      TEXT,
    synced_modified TEXT,
    synced_snapshot TEXT
);
CREATE INDEX IF NOT EXISTS idx_cache_tasks_list ON tasks(list_uid);

CREATE TABLE IF NOT EXISTS operations (
    seq         INTEGER PRIMARY KEY AUTOINCREMENT,
    backend     TEXT NOT NULL,
    kind        TEXT NOT NULL,
    target_uid  TEXT NOT NULL,
    list_uid    TEXT NOT NULL,
    payload     TEXT NOT NULL,
    state       TEXT NOT NULL DEFAULT 'pending',
    retries     INTEGER NOT NULL DEFAULT 0,
    last_error  TEXT,
    enqueued_at TEXT NOT NULL,
    claimed_at  TEXT,
    worker_id   TEXT
);
CREATE INDEX IF NOT EXISTS idx_operations_state ON operations(state, seq);

CREATE TABLE IF NOT EXISTS conflicts (
    id          INTEGER PRIMARY KEY AUTOINCREMENT,
    uid         TEXT NOT NULL,
    list_uid    TEXT NOT NULL,
    local       TEXT NOT NULL,
    remote      TEXT,
    detected_at TEXT NOT NULL,
    resolution  TEXT
);

CREATE TABLE IF NOT EXISTS sync_meta (
    key   TEXT PRIMARY KEY,
    value TEXT NOT NULL
);
";

/// Mirror store for one remote backend.
///
/// Every mutation runs inside a single IMMEDIATE transaction; when sync is
/// enabled the matching operation record is inserted in that same
/// transaction, so a crash can never separate a cache write from its queue
/// entry.
pub struct CacheStore {
    backend: String,
    path: PathBuf,
    sync_enabled: bool,
    /// Capabilities of the mirrored remote, advertised as our own so the
    /// engine can project pushes correctly.
    remote_capabilities: CapabilitySet,
    pub(crate) connection: Arc<Mutex<Connection>>,
}

impl CacheStore {
    pub fn open(
        backend: &str,
        path: &Path,
        remote_capabilities: CapabilitySet,
        sync_enabled: bool,
    ) -> TodoResult<Self> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let conn = Connection::open(path)?;
        conn.pragma_update(None, "journal_mode", "WAL")?;
        conn.pragma_update(None, "foreign_keys", "ON")?;
        // Writers from the CLI and the daemon contend; wait rather than fail.
        conn.busy_timeout(std::time::Duration::from_secs(5))?;
        conn.execute_batch(SCHEMA)?;

        // One backend per cache file.
        let stored: Option<String> = conn
            .query_row(
                "SELECT value FROM sync_meta WHERE key = 'backend'",
                [],
                |r| r.get(0),
            )
            .optional()?;
        match stored {
            None => {
                conn.execute(
                    "INSERT INTO sync_meta (key, value) VALUES ('backend', ?1)",
                    params![backend],
                )?;
            }
            Some(name) if name == backend => {}
            Some(name) => {
                return Err(TodoError::CacheError {
                    operation: "open".to_string(),
                    reason: format!(
                        "cache file {} belongs to backend {name}, not {backend}",
                        path.display()
                    ),
                });
            }
        }

        debug!(backend, path = %path.display(), "cache opened");
        Ok(Self {
            backend: backend.to_string(),
            path: path.to_path_buf(),
            sync_enabled,
            remote_capabilities,
            connection: Arc::new(Mutex::new(conn)),
        })
    }

    #[must_use]
    pub fn backend(&self) -> &str {
        &self.backend
    }

    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }

    // ----- row mapping -------------------------------------------------

    fn row_to_list(row: &Row<'_>) -> rusqlite::Result<TaskList> {
        Ok(TaskList {
            uid: row.get("uid")?,
            name: row.get("name")?,
            description: row.get("description")?,
            color: row.get("color")?,
            modified: row.get("modified")?,
            deleted_at: row.get("deleted_at")?,
        })
    }

    fn row_to_task(row: &Row<'_>) -> rusqlite::Result<Task> {
        let categories: String = row.get("categories")?;
        let status: String = row.get("status")?;
        Ok(Task {
            uid: row.get("uid")?,
            list_uid: row.get("list_uid")?,
            summary: row.get("summary")?,
            description: row.get("description")?,
            status: TaskStatus::parse(&status).unwrap_or_default(),
            priority: row.get::<_, i64>("priority")? as u8,
            due: row.get("due")?,
            start: row.get("start")?,
            completed: row.get("completed")?,
            categories: Task::categories_from_joined(&categories),
            parent_uid: row.get("parent_uid")?,
            created: row.get("created")?,
            modified: row.get("modified")?,
            recurrence: row.get("recurrence")?,
            local_id: row.get("id")?,
        })
    }

    fn insert_task_row(conn: &Connection, task: &Task, synced: Option<DateTime<Utc>>) -> TodoResult<i64> {
        conn.execute(
            "INSERT INTO tasks (uid, list_uid, summary, description, status, priority, due,
                                start, completed, categories, parent_uid, created, modified,
                                recurrence, synced_modified)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14, ?15)",
            params![
                task.uid,
                task.list_uid,
                task.summary,
                task.description,
                task.status.as_str(),
                i64::from(task.priority),
                task.due,
                task.start,
                task.completed,
                task.categories_joined(),
                task.parent_uid,
                task.created,
                task.modified,
                task.recurrence,
                synced,
            ],
        )?;
        Ok(conn.last_insert_rowid())
    }

    fn update_task_row(conn: &Connection, task: &Task, synced: Option<Option<DateTime<Utc>>>) -> TodoResult<usize> {
        let changed = conn.execute(
            "UPDATE tasks SET list_uid = ?2, summary = ?3, description = ?4, status = ?5,
                              priority = ?6, due = ?7, start = ?8, completed = ?9,
                              categories = ?10, parent_uid = ?11, modified = ?12, recurrence = ?13
             WHERE uid = ?1",
            params![
                task.uid,
                task.list_uid,
                task.summary,
                task.description,
                task.status.as_str(),
                i64::from(task.priority),
                task.due,
                task.start,
                task.completed,
                task.categories_joined(),
                task.parent_uid,
                task.modified,
                task.recurrence,
            ],
        )?;
        if let Some(synced) = synced {
            conn.execute(
                "UPDATE tasks SET synced_modified = ?2 WHERE uid = ?1",
                params![task.uid, synced],
            )?;
        }
        Ok(changed)
    }

    /// Reject parents outside the list and parent chains that loop back.
    /// The cache answers the same contract as the local sqlite store, so a
    /// link it would refuse must be refused here too.
    fn check_parent(conn: &Connection, task: &Task) -> TodoResult<()> {
        let Some(parent_uid) = &task.parent_uid else {
            return Ok(());
        };
        let mut current = parent_uid.clone();
        // Bounded walk: a forest deeper than this is a loop in practice.
        for _ in 0..64 {
            let row: Option<(String, Option<String>)> = conn
                .query_row(
                    "SELECT list_uid, parent_uid FROM tasks WHERE uid = ?1",
                    params![current],
                    |r| Ok((r.get(0)?, r.get(1)?)),
                )
                .optional()?;
            let Some((list_uid, next_parent)) = row else {
                return Err(TodoError::InvalidInput {
                    field: "parent_uid".to_string(),
                    reason: format!("parent {current} not found"),
                });
            };
            if list_uid != task.list_uid {
                return Err(TodoError::InvalidInput {
                    field: "parent_uid".to_string(),
                    reason: "parent must be in the same list".to_string(),
                });
            }
            match next_parent {
                Some(next) if next == task.uid => {
                    return Err(TodoError::InvalidInput {
                        field: "parent_uid".to_string(),
                        reason: "task cannot be its own ancestor".to_string(),
                    });
                }
                Some(next) => current = next,
                None => return Ok(()),
            }
        }
        Err(TodoError::InvalidInput {
            field: "parent_uid".to_string(),
            reason: "parent chain too deep".to_string(),
        })
    }

    fn enqueue(
        conn: &Connection,
        backend: &str,
        kind: OperationKind,
        target_uid: &str,
        list_uid: &str,
        payload: &serde_json::Value,
    ) -> TodoResult<i64> {
        conn.execute(
            "INSERT INTO operations (backend, kind, target_uid, list_uid, payload, enqueued_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
            params![
                backend,
                kind.as_str(),
                target_uid,
                list_uid,
                payload.to_string(),
                Utc::now(),
            ],
        )?;
        Ok(conn.last_insert_rowid())
    }

    // ----- engine-facing API ------------------------------------------

    /// Whether a UID has an unpushed local mutation in the queue.
    pub async fn has_pending_operation(&self, uid: &str) -> TodoResult<bool> {
        let conn = self.connection.lock().await;
        let count: i64 = conn.query_row(
            "SELECT COUNT(*) FROM operations
             WHERE target_uid = ?1 AND state IN ('pending', 'processing')",
            params![uid],
            |r| r.get(0),
        )?;
        Ok(count > 0)
    }

    /// Baseline `(uid, synced_modified)` pairs for every cached task.
    pub async fn task_baselines(&self) -> TodoResult<Vec<(String, Option<DateTime<Utc>>)>> {
        let conn = self.connection.lock().await;
        let mut stmt = conn.prepare("SELECT uid, synced_modified FROM tasks")?;
        let rows = stmt
            .query_map([], |r| Ok((r.get(0)?, r.get(1)?)))?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(rows)
    }

    pub async fn list_baselines(&self) -> TodoResult<Vec<(String, Option<DateTime<Utc>>)>> {
        let conn = self.connection.lock().await;
        let mut stmt = conn.prepare("SELECT uid, synced_modified FROM lists")?;
        let rows = stmt
            .query_map([], |r| Ok((r.get(0)?, r.get(1)?)))?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(rows)
    }

    /// Overwrite (or insert) a list from a remote snapshot. Does not touch
    /// the queue; the remote is authoritative here.
    pub async fn apply_remote_list(&self, list: &TaskList) -> TodoResult<()> {
        let mut conn = self.connection.lock().await;
        let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
        let changed = tx.execute(
            "UPDATE lists SET name = ?2, description = ?3, color = ?4, modified = ?5,
                              synced_modified = ?5, deleted_at = NULL
             WHERE uid = ?1",
            params![list.uid, list.name, list.description, list.color, list.modified],
        )?;
        if changed == 0 {
            tx.execute(
                "INSERT INTO lists (uid, name, description, color, modified, synced_modified)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?5)",
                params![list.uid, list.name, list.description, list.color, list.modified],
            )?;
        }
        tx.commit()?;
        Ok(())
    }

    /// Overwrite (or insert) a task from a remote snapshot in one
    /// transaction per UID. The snapshot becomes the merge baseline.
    pub async fn apply_remote_task(&self, task: &Task) -> TodoResult<()> {
        let mut conn = self.connection.lock().await;
        let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
        let changed = Self::update_task_row(&tx, task, Some(Some(task.modified)))?;
        if changed == 0 {
            Self::insert_task_row(&tx, task, Some(task.modified))?;
        }
        tx.execute(
            "UPDATE tasks SET synced_snapshot = ?2 WHERE uid = ?1",
            params![task.uid, serde_json::to_string(task)?],
        )?;
        tx.commit()?;
        Ok(())
    }

    /// The task state as of the last successful sync, used as the common
    /// ancestor by the merge policy.
    pub async fn task_base_snapshot(&self, uid: &str) -> TodoResult<Option<Task>> {
        let conn = self.connection.lock().await;
        let snapshot: Option<Option<String>> = conn
            .query_row(
                "SELECT synced_snapshot FROM tasks WHERE uid = ?1",
                params![uid],
                |r| r.get(0),
            )
            .optional()?;
        Ok(snapshot
            .flatten()
            .and_then(|s| serde_json::from_str(&s).ok()))
    }

    /// Queue a push produced by conflict resolution without touching the
    /// entity row.
    pub async fn enqueue_operation(
        &self,
        kind: OperationKind,
        target_uid: &str,
        list_uid: &str,
        payload: &serde_json::Value,
    ) -> TodoResult<i64> {
        let conn = self.connection.lock().await;
        Self::enqueue(&conn, &self.backend, kind, target_uid, list_uid, payload)
    }

    /// Remove a row the remote no longer has, without queueing a delete.
    pub async fn remove_task_silent(&self, uid: &str) -> TodoResult<()> {
        let conn = self.connection.lock().await;
        conn.execute(
            "UPDATE tasks SET parent_uid = NULL WHERE parent_uid = ?1",
            params![uid],
        )?;
        conn.execute("DELETE FROM tasks WHERE uid = ?1", params![uid])?;
        Ok(())
    }

    pub async fn remove_list_silent(&self, uid: &str) -> TodoResult<()> {
        let conn = self.connection.lock().await;
        conn.execute("DELETE FROM lists WHERE uid = ?1", params![uid])?;
        Ok(())
    }

    /// Record the remote `modified` observed after a successful push and
    /// refresh the merge baseline to the pushed state.
    pub async fn mark_task_synced(&self, uid: &str, modified: DateTime<Utc>) -> TodoResult<()> {
        let mut conn = self.connection.lock().await;
        let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
        tx.execute(
            "UPDATE tasks SET synced_modified = ?2, modified = ?2 WHERE uid = ?1",
            params![uid, modified],
        )?;
        let task = tx
            .query_row(
                "SELECT * FROM tasks WHERE uid = ?1",
                params![uid],
                Self::row_to_task,
            )
            .optional()?;
        if let Some(task) = task {
            tx.execute(
                "UPDATE tasks SET synced_snapshot = ?2 WHERE uid = ?1",
                params![uid, serde_json::to_string(&task)?],
            )?;
        }
        tx.commit()?;
        Ok(())
    }

    pub async fn mark_list_synced(&self, uid: &str, modified: DateTime<Utc>) -> TodoResult<()> {
        let conn = self.connection.lock().await;
        conn.execute(
            "UPDATE lists SET synced_modified = ?2, modified = ?2 WHERE uid = ?1",
            params![uid, modified],
        )?;
        Ok(())
    }

    /// Replace a placeholder UID with the remote-assigned one everywhere:
    /// the entity row, children referencing it, queued operations and
    /// conflict records. FKs cascade the row updates.
    pub async fn rewrite_uid(&self, old_uid: &str, new_uid: &str) -> TodoResult<()> {
        let mut conn = self.connection.lock().await;
        let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;

        tx.execute(
            "UPDATE lists SET uid = ?2 WHERE uid = ?1",
            params![old_uid, new_uid],
        )?;
        tx.execute(
            "UPDATE tasks SET uid = ?2 WHERE uid = ?1",
            params![old_uid, new_uid],
        )?;
        tx.execute(
            "UPDATE operations SET target_uid = ?2 WHERE target_uid = ?1 AND state IN ('pending', 'processing')",
            params![old_uid, new_uid],
        )?;
        tx.execute(
            "UPDATE operations SET list_uid = ?2 WHERE list_uid = ?1 AND state IN ('pending', 'processing')",
            params![old_uid, new_uid],
        )?;
        tx.execute(
            "UPDATE conflicts SET uid = ?2 WHERE uid = ?1",
            params![old_uid, new_uid],
        )?;

        // Queued payloads embed the placeholder in uid-valued fields.
        {
            let mut stmt = tx.prepare(
                "SELECT seq, payload FROM operations WHERE state IN ('pending', 'processing')",
            )?;
            let rows: Vec<(i64, String)> = stmt
                .query_map([], |r| Ok((r.get(0)?, r.get(1)?)))?
                .collect::<Result<Vec<_>, _>>()?;
            for (seq, payload) in rows {
                let Ok(mut value) = serde_json::from_str::<serde_json::Value>(&payload) else {
                    continue;
                };
                let mut touched = false;
                for field in ["uid", "parent_uid", "list_uid"] {
                    if value.get(field).and_then(|v| v.as_str()) == Some(old_uid) {
                        value[field] = serde_json::Value::String(new_uid.to_string());
                        touched = true;
                    }
                }
                if touched {
                    tx.execute(
                        "UPDATE operations SET payload = ?2 WHERE seq = ?1",
                        params![seq, value.to_string()],
                    )?;
                }
            }
        }

        tx.commit()?;
        debug!(backend = %self.backend, old_uid, new_uid, "placeholder uid rewritten");
        Ok(())
    }

    /// Conservative dedup for a crash between remote create and local
    /// commit: find a placeholder row matching (list, summary) whose
    /// creation time is within the window of the remote's.
    pub async fn find_placeholder_twin(
        &self,
        list_uid: &str,
        summary: &str,
        remote_created: DateTime<Utc>,
    ) -> TodoResult<Option<Task>> {
        let conn = self.connection.lock().await;
        let low = remote_created - dedup_window();
        let high = remote_created + dedup_window();
        Ok(conn
            .query_row(
                "SELECT * FROM tasks
                 WHERE list_uid = ?1 AND summary = ?2 AND uid LIKE 'local-%'
                   AND created BETWEEN ?3 AND ?4",
                params![list_uid, summary, low, high],
                Self::row_to_task,
            )
            .optional()?)
    }

    /// Lookup by UID alone; pull diffing does not know the list.
    pub async fn get_task_by_uid(&self, uid: &str) -> TodoResult<Option<Task>> {
        let conn = self.connection.lock().await;
        Ok(conn
            .query_row(
                "SELECT * FROM tasks WHERE uid = ?1",
                params![uid],
                Self::row_to_task,
            )
            .optional()?)
    }

    /// Insert a locally-surviving row (keep-both duplicate) without
    /// touching the queue or the baseline.
    pub async fn insert_local_task(&self, task: &Task) -> TodoResult<()> {
        let conn = self.connection.lock().await;
        Self::insert_task_row(&conn, task, None)?;
        Ok(())
    }

    // ----- conflicts ---------------------------------------------------

    /// Pull must not stack duplicate conflicts for a UID across cycles.
    pub async fn has_unresolved_conflict(&self, uid: &str) -> TodoResult<bool> {
        let conn = self.connection.lock().await;
        let count: i64 = conn.query_row(
            "SELECT COUNT(*) FROM conflicts WHERE uid = ?1 AND resolution IS NULL",
            params![uid],
            |r| r.get(0),
        )?;
        Ok(count > 0)
    }

    pub async fn record_conflict(
        &self,
        local: &Task,
        remote: Option<&Task>,
    ) -> TodoResult<i64> {
        let conn = self.connection.lock().await;
        conn.execute(
            "INSERT INTO conflicts (uid, list_uid, local, remote, detected_at)
             VALUES (?1, ?2, ?3, ?4, ?5)",
            params![
                local.uid,
                local.list_uid,
                serde_json::to_string(local)?,
                remote.map(serde_json::to_string).transpose()?,
                Utc::now(),
            ],
        )?;
        Ok(conn.last_insert_rowid())
    }

    pub async fn unresolved_conflicts(&self) -> TodoResult<Vec<ConflictRecord>> {
        let conn = self.connection.lock().await;
        let mut stmt = conn.prepare(
            "SELECT id, uid, list_uid, local, remote, detected_at FROM conflicts
             WHERE resolution IS NULL ORDER BY id",
        )?;
        let rows: Vec<(i64, String, String, String, Option<String>, DateTime<Utc>)> = stmt
            .query_map([], |r| {
                Ok((
                    r.get(0)?,
                    r.get(1)?,
                    r.get(2)?,
                    r.get(3)?,
                    r.get(4)?,
                    r.get(5)?,
                ))
            })?
            .collect::<Result<Vec<_>, _>>()?;

        let mut conflicts = Vec::with_capacity(rows.len());
        for (id, uid, list_uid, local, remote, detected_at) in rows {
            conflicts.push(ConflictRecord {
                id,
                uid,
                list_uid,
                local: serde_json::from_str(&local)?,
                remote: remote.map(|r| serde_json::from_str(&r)).transpose()?,
                detected_at,
                resolution: None,
            });
        }
        Ok(conflicts)
    }

    /// Terminal transition on a conflict record.
    pub async fn resolve_conflict(
        &self,
        id: i64,
        resolution: ConflictResolution,
    ) -> TodoResult<()> {
        let conn = self.connection.lock().await;
        let changed = conn.execute(
            "UPDATE conflicts SET resolution = ?2 WHERE id = ?1 AND resolution IS NULL",
            params![id, resolution.as_str()],
        )?;
        if changed == 0 {
            return Err(TodoError::NotFound {
                resource: format!("unresolved conflict {id}"),
            });
        }
        Ok(())
    }

    // ----- sync metadata ----------------------------------------------

    pub async fn last_sync(&self) -> TodoResult<Option<DateTime<Utc>>> {
        let value = self.get_meta("last_sync").await?;
        Ok(value.and_then(|v| v.parse().ok()))
    }

    pub async fn checkpoint_sync(&self, at: DateTime<Utc>) -> TodoResult<()> {
        self.set_meta("last_sync", &at.to_rfc3339()).await
    }

    pub async fn get_meta(&self, key: &str) -> TodoResult<Option<String>> {
        let conn = self.connection.lock().await;
        Ok(conn
            .query_row(
                "SELECT value FROM sync_meta WHERE key = ?1",
                params![key],
                |r| r.get(0),
            )
            .optional()?)
    }

    pub async fn set_meta(&self, key: &str, value: &str) -> TodoResult<()> {
        let conn = self.connection.lock().await;
        conn.execute(
            "INSERT INTO sync_meta (key, value) VALUES (?1, ?2)
             ON CONFLICT(key) DO UPDATE SET value = excluded.value",
            params![key, value],
        )?;
        Ok(())
    }

}

#[async_trait]
impl TaskManager for CacheStore {
    fn name(&self) -> &str {
        &self.backend
    }

    fn capabilities(&self) -> CapabilitySet {
        // Trash is always available locally; the rest mirrors the remote.
        CapabilitySet {
            trash: true,
            ..self.remote_capabilities
        }
    }

    async fn get_lists(&self) -> TodoResult<Vec<TaskList>> {
        let conn = self.connection.lock().await;
        let mut stmt =
            conn.prepare("SELECT * FROM lists WHERE deleted_at IS NULL ORDER BY name")?;
        let lists = stmt
            .query_map([], Self::row_to_list)?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(lists)
    }

    async fn get_list(&self, uid: &str) -> TodoResult<Option<TaskList>> {
        let conn = self.connection.lock().await;
        Ok(conn
            .query_row(
                "SELECT * FROM lists WHERE uid = ?1 AND deleted_at IS NULL",
                params![uid],
                Self::row_to_list,
            )
            .optional()?)
    }

    async fn get_list_by_name(&self, name: &str) -> TodoResult<Option<TaskList>> {
        let conn = self.connection.lock().await;
        Ok(conn
            .query_row(
                "SELECT * FROM lists WHERE name = ?1 COLLATE NOCASE AND deleted_at IS NULL",
                params![name],
                Self::row_to_list,
            )
            .optional()?)
    }

    async fn create_list(&self, name: &str) -> TodoResult<TaskList> {
        if name.trim().is_empty() {
            return Err(TodoError::InvalidInput {
                field: "name".to_string(),
                reason: "list name must not be empty".to_string(),
            });
        }
        let mut conn = self.connection.lock().await;
        let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;

        if let Some(existing) = tx
            .query_row(
                "SELECT * FROM lists WHERE name = ?1 COLLATE NOCASE AND deleted_at IS NULL",
                params![name],
                Self::row_to_list,
            )
            .optional()?
        {
            return Ok(existing);
        }

        let list = TaskList::new(name);
        tx.execute(
            "INSERT INTO lists (uid, name, description, color, modified)
             VALUES (?1, ?2, ?3, ?4, ?5)",
            params![list.uid, list.name, list.description, list.color, list.modified],
        )?;
        if self.sync_enabled {
            Self::enqueue(
                &tx,
                &self.backend,
                OperationKind::CreateList,
                &list.uid,
                &list.uid,
                &serde_json::to_value(&list)?,
            )?;
        }
        tx.commit()?;
        Ok(list)
    }

    async fn update_list(&self, list: &TaskList) -> TodoResult<TaskList> {
        list.validate()?;
        let mut conn = self.connection.lock().await;
        let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;

        let mut updated = list.clone();
        updated.modified = Utc::now().max(list.modified);
        let changed = tx.execute(
            "UPDATE lists SET name = ?2, description = ?3, color = ?4, modified = ?5 WHERE uid = ?1",
            params![updated.uid, updated.name, updated.description, updated.color, updated.modified],
        )?;
        if changed == 0 {
            return Err(TodoError::NotFound {
                resource: format!("list {}", updated.uid),
            });
        }
        if self.sync_enabled {
            Self::enqueue(
                &tx,
                &self.backend,
                OperationKind::UpdateList,
                &updated.uid,
                &updated.uid,
                &serde_json::to_value(&updated)?,
            )?;
        }
        tx.commit()?;
        Ok(updated)
    }

    async fn delete_list(&self, uid: &str) -> TodoResult<()> {
        let mut conn = self.connection.lock().await;
        let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;

        // Trash locally; the queued operation hard-deletes remotely once
        // pushed.
        let changed = tx.execute(
            "UPDATE lists SET deleted_at = ?2 WHERE uid = ?1 AND deleted_at IS NULL",
            params![uid, Utc::now()],
        )?;
        if changed == 0 {
            return Err(TodoError::NotFound {
                resource: format!("list {uid}"),
            });
        }
        if self.sync_enabled {
            Self::enqueue(
                &tx,
                &self.backend,
                OperationKind::DeleteList,
                uid,
                uid,
                &serde_json::Value::Null,
            )?;
        }
        tx.commit()?;
        Ok(())
    }

    async fn get_tasks(&self, list_uid: &str) -> TodoResult<Vec<Task>> {
        let conn = self.connection.lock().await;
        let mut stmt = conn.prepare("SELECT * FROM tasks WHERE list_uid = ?1 ORDER BY id")?;
        let tasks = stmt
            .query_map(params![list_uid], Self::row_to_task)?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(tasks)
    }

    async fn get_task(&self, list_uid: &str, uid: &str) -> TodoResult<Option<Task>> {
        let conn = self.connection.lock().await;
        Ok(conn
            .query_row(
                "SELECT * FROM tasks WHERE list_uid = ?1 AND uid = ?2",
                params![list_uid, uid],
                Self::row_to_task,
            )
            .optional()?)
    }

    async fn create_task(&self, list_uid: &str, task: Task) -> TodoResult<Task> {
        let mut conn = self.connection.lock().await;
        let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;

        let list_exists: i64 = tx.query_row(
            "SELECT COUNT(*) FROM lists WHERE uid = ?1 AND deleted_at IS NULL",
            params![list_uid],
            |r| r.get(0),
        )?;
        if list_exists == 0 {
            return Err(TodoError::NotFound {
                resource: format!("list {list_uid}"),
            });
        }

        let now = Utc::now();
        let mut created = task;
        created.uid = format!("{LOCAL_UID_PREFIX}{}", Uuid::new_v4());
        created.list_uid = list_uid.to_string();
        created.created = now;
        created.modified = now;
        created.validate()?;
        Self::check_parent(&tx, &created)?;

        let id = Self::insert_task_row(&tx, &created, None)?;
        created.local_id = Some(id);
        if self.sync_enabled {
            Self::enqueue(
                &tx,
                &self.backend,
                OperationKind::CreateTask,
                &created.uid,
                list_uid,
                &serde_json::to_value(&created)?,
            )?;
        }
        tx.commit()?;
        Ok(created)
    }

    async fn update_task(&self, list_uid: &str, task: Task) -> TodoResult<Task> {
        task.validate()?;
        let mut conn = self.connection.lock().await;
        let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;

        let mut updated = task;
        updated.list_uid = list_uid.to_string();
        updated.modified = Utc::now().max(updated.modified);
        Self::check_parent(&tx, &updated)?;
        let changed = Self::update_task_row(&tx, &updated, None)?;
        if changed == 0 {
            return Err(TodoError::NotFound {
                resource: format!("task {}", updated.uid),
            });
        }
        if self.sync_enabled {
            Self::enqueue(
                &tx,
                &self.backend,
                OperationKind::UpdateTask,
                &updated.uid,
                list_uid,
                &serde_json::to_value(&updated)?,
            )?;
        }
        tx.commit()?;
        Ok(updated)
    }

    async fn delete_task(&self, list_uid: &str, uid: &str) -> TodoResult<()> {
        let mut conn = self.connection.lock().await;
        let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;

        tx.execute(
            "UPDATE tasks SET parent_uid = NULL WHERE list_uid = ?1 AND parent_uid = ?2",
            params![list_uid, uid],
        )?;
        let changed = tx.execute(
            "DELETE FROM tasks WHERE list_uid = ?1 AND uid = ?2",
            params![list_uid, uid],
        )?;
        if changed == 0 {
            return Err(TodoError::NotFound {
                resource: format!("task {uid}"),
            });
        }
        if self.sync_enabled {
            // A delete of a never-pushed placeholder cancels its create.
            if uid.starts_with(LOCAL_UID_PREFIX) {
                tx.execute(
                    "UPDATE operations SET state = 'done'
                     WHERE target_uid = ?1 AND state = 'pending'",
                    params![uid],
                )?;
            } else {
                Self::enqueue(
                    &tx,
                    &self.backend,
                    OperationKind::DeleteTask,
                    uid,
                    list_uid,
                    &serde_json::Value::Null,
                )?;
            }
        }
        tx.commit()?;
        Ok(())
    }

    async fn deleted_lists(&self) -> TodoResult<Vec<TaskList>> {
        let conn = self.connection.lock().await;
        let mut stmt = conn
            .prepare("SELECT * FROM lists WHERE deleted_at IS NOT NULL ORDER BY deleted_at")?;
        let lists = stmt
            .query_map([], Self::row_to_list)?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(lists)
    }

    async fn restore_list(&self, uid: &str) -> TodoResult<TaskList> {
        let mut conn = self.connection.lock().await;
        let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
        let changed = tx.execute(
            "UPDATE lists SET deleted_at = NULL, modified = ?2
             WHERE uid = ?1 AND deleted_at IS NOT NULL",
            params![uid, Utc::now()],
        )?;
        if changed == 0 {
            return Err(TodoError::NotFound {
                resource: format!("trashed list {uid}"),
            });
        }
        let list = tx
            .query_row("SELECT * FROM lists WHERE uid = ?1", params![uid], Self::row_to_list)
            .optional()?
            .ok_or_else(|| TodoError::NotFound {
                resource: format!("list {uid}"),
            })?;
        if self.sync_enabled {
            // The remote may have processed the delete already; re-create.
            Self::enqueue(
                &tx,
                &self.backend,
                OperationKind::CreateList,
                &list.uid,
                &list.uid,
                &serde_json::to_value(&list)?,
            )?;
        }
        tx.commit()?;
        Ok(list)
    }

    async fn purge_list(&self, uid: &str) -> TodoResult<()> {
        let conn = self.connection.lock().await;
        let changed = conn.execute("DELETE FROM lists WHERE uid = ?1", params![uid])?;
        if changed == 0 {
            return Err(TodoError::NotFound {
                resource: format!("list {uid}"),
            });
        }
        Ok(())
    }

    /// Trash retention, enforced at cache open. 0 disables.
    async fn purge_expired_trash(&self, retention_days: u32) -> TodoResult<usize> {
        if retention_days == 0 {
            return Ok(0);
        }
        let cutoff = Utc::now() - Duration::days(i64::from(retention_days));
        let conn = self.connection.lock().await;
        let purged = conn.execute(
            "DELETE FROM lists WHERE deleted_at IS NOT NULL AND deleted_at < ?1",
            params![cutoff],
        )?;
        if purged > 0 {
            info!(backend = %self.backend, purged, "expired trash purged from cache");
        }
        Ok(purged)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sync::queue::OperationQueue;
    use tempfile::TempDir;

    async fn open_cache(dir: &TempDir) -> CacheStore {
        CacheStore::open(
            "remote",
            &dir.path().join("remote.db"),
            CapabilitySet::full_local(),
            true,
        )
        .unwrap()
    }

    #[tokio::test]
    async fn mutations_enqueue_in_the_same_transaction() {
        let dir = TempDir::new().unwrap();
        let cache = open_cache(&dir).await;

        let list = cache.create_list("Work").await.unwrap();
        let task = cache
            .create_task(&list.uid, Task::new(&list.uid, "Buy milk"))
            .await
            .unwrap();
        assert!(task.has_placeholder_uid());

        let queue = OperationQueue::new(cache.connection.clone(), "remote");
        let pending = queue.pending().await.unwrap();
        assert_eq!(pending.len(), 2);
        assert_eq!(pending[0].kind, OperationKind::CreateList);
        assert_eq!(pending[1].kind, OperationKind::CreateTask);
        // FIFO: sequence ids strictly increase.
        assert!(pending[0].seq < pending[1].seq);
    }

    #[tokio::test]
    async fn cache_refuses_foreign_backend_file() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("one.db");
        drop(
            CacheStore::open("one", &path, CapabilitySet::default(), false).unwrap(),
        );
        assert!(CacheStore::open("two", &path, CapabilitySet::default(), false).is_err());
    }

    #[tokio::test]
    async fn placeholder_rewrite_reaches_children_and_payloads() {
        let dir = TempDir::new().unwrap();
        let cache = open_cache(&dir).await;
        let list = cache.create_list("Work").await.unwrap();
        let parent = cache
            .create_task(&list.uid, Task::new(&list.uid, "Parent"))
            .await
            .unwrap();
        let child = cache
            .create_task(
                &list.uid,
                Task::new(&list.uid, "Child").with_parent(&parent.uid),
            )
            .await
            .unwrap();

        cache.rewrite_uid(&parent.uid, "remote-42").await.unwrap();

        let fetched = cache.get_task(&list.uid, "remote-42").await.unwrap();
        assert!(fetched.is_some());
        let child_row = cache.get_task(&list.uid, &child.uid).await.unwrap().unwrap();
        assert_eq!(child_row.parent_uid.as_deref(), Some("remote-42"));

        // The queued child create now references the remote uid.
        let queue = OperationQueue::new(cache.connection.clone(), "remote");
        let pending = queue.pending().await.unwrap();
        let child_op = pending
            .iter()
            .find(|op| op.target_uid == child.uid)
            .unwrap();
        assert_eq!(
            child_op.payload.get("parent_uid").and_then(|v| v.as_str()),
            Some("remote-42")
        );
    }

    #[tokio::test]
    async fn parent_checks_reject_missing_cross_list_and_cycles() {
        let dir = TempDir::new().unwrap();
        let cache = open_cache(&dir).await;
        let work = cache.create_list("Work").await.unwrap();
        let home = cache.create_list("Home").await.unwrap();

        // Unknown parent is rejected outright.
        let dangling = Task::new(&work.uid, "dangling").with_parent("no-such-uid");
        assert!(cache.create_task(&work.uid, dangling).await.is_err());

        let parent = cache
            .create_task(&work.uid, Task::new(&work.uid, "Parent"))
            .await
            .unwrap();

        // Parent in a different list is rejected.
        let stray = Task::new(&home.uid, "Stray").with_parent(&parent.uid);
        assert!(cache.create_task(&home.uid, stray).await.is_err());

        // A -> B -> A is rejected.
        let child = cache
            .create_task(
                &work.uid,
                Task::new(&work.uid, "Child").with_parent(&parent.uid),
            )
            .await
            .unwrap();
        let mut looped = parent.clone();
        looped.parent_uid = Some(child.uid.clone());
        assert!(cache.update_task(&work.uid, looped).await.is_err());

        // The rejected link never reached the queue.
        let queue = OperationQueue::new(cache.connection.clone(), "remote");
        assert!(queue
            .pending()
            .await
            .unwrap()
            .iter()
            .all(|op| op.kind != OperationKind::UpdateTask));
    }

    #[tokio::test]
    async fn deleting_unpushed_placeholder_cancels_its_create() {
        let dir = TempDir::new().unwrap();
        let cache = open_cache(&dir).await;
        let list = cache.create_list("Work").await.unwrap();
        let task = cache
            .create_task(&list.uid, Task::new(&list.uid, "ephemeral"))
            .await
            .unwrap();

        cache.delete_task(&list.uid, &task.uid).await.unwrap();

        let queue = OperationQueue::new(cache.connection.clone(), "remote");
        let pending = queue.pending().await.unwrap();
        assert!(pending.iter().all(|op| op.target_uid != task.uid));
        // No delete_task was queued for a never-pushed row either.
        assert!(pending
            .iter()
            .all(|op| op.kind != OperationKind::DeleteTask));
    }

    #[tokio::test]
    async fn remote_apply_sets_baseline_and_skips_queue() {
        let dir = TempDir::new().unwrap();
        let cache = open_cache(&dir).await;

        let mut list = TaskList::new("Pulled");
        list.uid = "srv-list".to_string();
        cache.apply_remote_list(&list).await.unwrap();

        let mut task = Task::new("srv-list", "From server");
        task.uid = "srv-task".to_string();
        cache.apply_remote_task(&task).await.unwrap();

        let baselines = cache.task_baselines().await.unwrap();
        assert_eq!(baselines.len(), 1);
        assert_eq!(baselines[0].0, "srv-task");
        assert_eq!(baselines[0].1, Some(task.modified));

        let queue = OperationQueue::new(cache.connection.clone(), "remote");
        assert!(queue.pending().await.unwrap().is_empty());
        assert!(!cache.has_pending_operation("srv-task").await.unwrap());
    }

    #[tokio::test]
    async fn conflict_records_persist_until_resolved() {
        let dir = TempDir::new().unwrap();
        let cache = open_cache(&dir).await;
        let list = cache.create_list("Work").await.unwrap();
        let local = cache
            .create_task(&list.uid, Task::new(&list.uid, "contested"))
            .await
            .unwrap();
        let mut remote = local.clone();
        remote.summary = "contested (remote)".to_string();

        let id = cache.record_conflict(&local, Some(&remote)).await.unwrap();
        let open = cache.unresolved_conflicts().await.unwrap();
        assert_eq!(open.len(), 1);
        assert_eq!(open[0].local.summary, "contested");

        cache
            .resolve_conflict(id, ConflictResolution::ServerWins)
            .await
            .unwrap();
        assert!(cache.unresolved_conflicts().await.unwrap().is_empty());
        // Double resolution is rejected.
        assert!(cache
            .resolve_conflict(id, ConflictResolution::LocalWins)
            .await
            .is_err());
    }

    #[tokio::test]
    async fn dedup_twin_matches_only_inside_window() {
        let dir = TempDir::new().unwrap();
        let cache = open_cache(&dir).await;
        let list = cache.create_list("Work").await.unwrap();
        let task = cache
            .create_task(&list.uid, Task::new(&list.uid, "Buy milk"))
            .await
            .unwrap();

        let twin = cache
            .find_placeholder_twin(&list.uid, "Buy milk", task.created)
            .await
            .unwrap();
        assert_eq!(twin.map(|t| t.uid), Some(task.uid.clone()));

        let far = task.created + Duration::minutes(10);
        assert!(cache
            .find_placeholder_twin(&list.uid, "Buy milk", far)
            .await
            .unwrap()
            .is_none());
        assert!(cache
            .find_placeholder_twin(&list.uid, "Buy bread", task.created)
            .await
            .unwrap()
            .is_none());
    }

    #[tokio::test]
    async fn trash_keeps_tasks_and_restore_reattaches() {
        let dir = TempDir::new().unwrap();
        let cache = open_cache(&dir).await;
        let list = cache.create_list("Work").await.unwrap();
        cache
            .create_task(&list.uid, Task::new(&list.uid, "kept"))
            .await
            .unwrap();

        cache.delete_list(&list.uid).await.unwrap();
        assert!(cache.get_list(&list.uid).await.unwrap().is_none());
        let restored = cache.restore_list(&list.uid).await.unwrap();
        assert_eq!(restored.uid, list.uid);
        assert_eq!(cache.get_tasks(&list.uid).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn checkpoint_round_trips() {
        let dir = TempDir::new().unwrap();
        let cache = open_cache(&dir).await;
        assert!(cache.last_sync().await.unwrap().is_none());
        let now = Utc::now();
        cache.checkpoint_sync(now).await.unwrap();
        let stored = cache.last_sync().await.unwrap().unwrap();
        assert!((stored - now).num_seconds().abs() < 1);
    }
}
