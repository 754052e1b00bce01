//! Embedded relational backend: the canonical purely-local task store.
//!
//! Unlike the remote drivers this one is its own source of truth, so the
//! dispatcher hands it out directly and no cache or queue sits in front.

use std::path::PathBuf;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use rusqlite::{params, Connection, OptionalExtension, Row};
use tokio::sync::Mutex;
use tracing::{debug, info};
use uuid::Uuid;

use crate::backends::{CapabilitySet, TaskManager};
use crate::models::{Task, TaskList, TaskStatus};
use crate::utils::config::BackendConfig;
use crate::utils::error::{TodoError, TodoResult};

const SCHEMA: &str = "
CREATE TABLE IF NOT EXISTS lists (
    id          INTEGER PRIMARY KEY AUTOINCREMENT,
    uid         TEXT NOT NULL UNIQUE,
    name        TEXT NOT NULL,
    description TEXT NOT NULL DEFAULT '',
    color       TEXT NOT NULL DEFAULT '',
    modified    TEXT NOT NULL,
    deleted_at  TEXT
);
CREATE UNIQUE INDEX IF NOT EXISTS idx_lists_name
    ON lists(name COLLATE NOCASE) WHERE deleted_at IS NULL;

CREATE TABLE IF NOT EXISTS tasks (
    id          INTEGER PRIMARY KEY AUTOINCREMENT,
    uid         TEXT NOT NULL UNIQUE,
    list_uid    TEXT NOT NULL REFERENCES lists(uid) ON DELETE CASCADE,
    summary     TEXT NOT NULL,
    description TEXT NOT NULL DEFAULT '',
    status      TEXT NOT NULL,
    priority    INTEGER NOT NULL DEFAULT 0,
    due         TEXT,
    start       TEXT,
    completed   TEXT,
    categories  TEXT NOT NULL DEFAULT '',
    parent_uid  TEXT,
    created     TEXT NOT NULL,
    modified    TEXT NOT NULL,
    recurrence  TEXT
);
CREATE INDEX IF NOT EXISTS idx_tasks_list ON tasks(list_uid);
";

pub struct SqliteBackend {
    name: String,
    path: PathBuf,
    connection: Arc<Mutex<Connection>>,
}

impl SqliteBackend {
    pub fn open(name: &str, config: &BackendConfig) -> TodoResult<Self> {
        let path = match &config.path {
            Some(p) => p.clone(),
            None => crate::utils::paths::data_dir()?.join(format!("{name}.db")),
        };
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }

        let conn = Connection::open(&path)?;
        conn.pragma_update(None, "journal_mode", "WAL")?;
        conn.pragma_update(None, "foreign_keys", "ON")?;
        conn.execute_batch(SCHEMA)?;

        debug!(backend = name, path = %path.display(), "sqlite backend opened");
        Ok(Self {
            name: name.to_string(),
            path,
            connection: Arc::new(Mutex::new(conn)),
        })
    }

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

    fn get_list_sync(conn: &Connection, uid: &str) -> TodoResult<Option<TaskList>> {
        Ok(conn
            .query_row(
                "SELECT * FROM lists WHERE uid = ?1",
                params![uid],
                Self::row_to_list,
            )
            .optional()?)
    }

    /// Reject parents outside the list and parent chains that loop back.
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
}

#[async_trait]
impl TaskManager for SqliteBackend {
    fn name(&self) -> &str {
        &self.name
    }

    fn capabilities(&self) -> CapabilitySet {
        CapabilitySet::full_local()
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
        Ok(Self::get_list_sync(&conn, uid)?.filter(|l| l.deleted_at.is_none()))
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
        let conn = self.connection.lock().await;
        // Idempotent on name collision.
        if let Some(existing) = conn
            .query_row(
                "SELECT * FROM lists WHERE name = ?1 COLLATE NOCASE AND deleted_at IS NULL",
                params![name],
                Self::row_to_list,
            )
            .optional()?
        {
            return Ok(existing);
        }

        let list = TaskList {
            uid: Uuid::new_v4().to_string(),
            name: name.to_string(),
            description: String::new(),
            color: String::new(),
            modified: Utc::now(),
            deleted_at: None,
        };
        conn.execute(
            "INSERT INTO lists (uid, name, description, color, modified) VALUES (?1, ?2, ?3, ?4, ?5)",
            params![list.uid, list.name, list.description, list.color, list.modified],
        )?;
        Ok(list)
    }

    async fn update_list(&self, list: &TaskList) -> TodoResult<TaskList> {
        list.validate()?;
        let conn = self.connection.lock().await;
        let existing = Self::get_list_sync(&conn, &list.uid)?.ok_or_else(|| {
            TodoError::NotFound {
                resource: format!("list {}", list.uid),
            }
        })?;

        let mut updated = list.clone();
        updated.modified = Utc::now().max(existing.modified);
        conn.execute(
            "UPDATE lists SET name = ?2, description = ?3, color = ?4, modified = ?5 WHERE uid = ?1",
            params![updated.uid, updated.name, updated.description, updated.color, updated.modified],
        )?;
        Ok(updated)
    }

    async fn delete_list(&self, uid: &str) -> TodoResult<()> {
        let conn = self.connection.lock().await;
        // Soft delete; tasks stay attached for restore.
        let changed = conn.execute(
            "UPDATE lists SET deleted_at = ?2 WHERE uid = ?1 AND deleted_at IS NULL",
            params![uid, Utc::now()],
        )?;
        if changed == 0 {
            return Err(TodoError::NotFound {
                resource: format!("list {uid}"),
            });
        }
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
        let conn = self.connection.lock().await;
        if Self::get_list_sync(&conn, list_uid)?.is_none() {
            return Err(TodoError::NotFound {
                resource: format!("list {list_uid}"),
            });
        }

        let now = Utc::now();
        let mut created = task;
        created.uid = Uuid::new_v4().to_string();
        created.list_uid = list_uid.to_string();
        created.created = now;
        created.modified = now;
        created.validate()?;
        Self::check_parent(&conn, &created)?;

        conn.execute(
            "INSERT INTO tasks (uid, list_uid, summary, description, status, priority, due,
                                start, completed, categories, parent_uid, created, modified, recurrence)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14)",
            params![
                created.uid,
                created.list_uid,
                created.summary,
                created.description,
                created.status.as_str(),
                i64::from(created.priority),
                created.due,
                created.start,
                created.completed,
                created.categories_joined(),
                created.parent_uid,
                created.created,
                created.modified,
                created.recurrence,
            ],
        )?;
        created.local_id = Some(conn.last_insert_rowid());
        Ok(created)
    }

    async fn update_task(&self, list_uid: &str, task: Task) -> TodoResult<Task> {
        task.validate()?;
        let conn = self.connection.lock().await;
        let existing: Option<Task> = conn
            .query_row(
                "SELECT * FROM tasks WHERE list_uid = ?1 AND uid = ?2",
                params![list_uid, task.uid],
                Self::row_to_task,
            )
            .optional()?;
        let existing = existing.ok_or_else(|| TodoError::NotFound {
            resource: format!("task {}", task.uid),
        })?;
        Self::check_parent(&conn, &task)?;

        let mut updated = task;
        updated.modified = Utc::now().max(existing.modified);
        conn.execute(
            "UPDATE tasks SET summary = ?3, description = ?4, status = ?5, priority = ?6,
                              due = ?7, start = ?8, completed = ?9, categories = ?10,
                              parent_uid = ?11, modified = ?12, recurrence = ?13
             WHERE list_uid = ?1 AND uid = ?2",
            params![
                list_uid,
                updated.uid,
                updated.summary,
                updated.description,
                updated.status.as_str(),
                i64::from(updated.priority),
                updated.due,
                updated.start,
                updated.completed,
                updated.categories_joined(),
                updated.parent_uid,
                updated.modified,
                updated.recurrence,
            ],
        )?;
        Ok(updated)
    }

    async fn delete_task(&self, list_uid: &str, uid: &str) -> TodoResult<()> {
        let conn = self.connection.lock().await;
        // Children of a removed parent become roots.
        conn.execute(
            "UPDATE tasks SET parent_uid = NULL WHERE list_uid = ?1 AND parent_uid = ?2",
            params![list_uid, uid],
        )?;
        let changed = conn.execute(
            "DELETE FROM tasks WHERE list_uid = ?1 AND uid = ?2",
            params![list_uid, uid],
        )?;
        if changed == 0 {
            return Err(TodoError::NotFound {
                resource: format!("task {uid}"),
            });
        }
        Ok(())
    }

    async fn deleted_lists(&self) -> TodoResult<Vec<TaskList>> {
        let conn = self.connection.lock().await;
        let mut stmt =
            conn.prepare("SELECT * FROM lists WHERE deleted_at IS NOT NULL ORDER BY deleted_at")?;
        let lists = stmt
            .query_map([], Self::row_to_list)?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(lists)
    }

    async fn restore_list(&self, uid: &str) -> TodoResult<TaskList> {
        let conn = self.connection.lock().await;
        let changed = conn.execute(
            "UPDATE lists SET deleted_at = NULL, modified = ?2 WHERE uid = ?1 AND deleted_at IS NOT NULL",
            params![uid, Utc::now()],
        )?;
        if changed == 0 {
            return Err(TodoError::NotFound {
                resource: format!("trashed list {uid}"),
            });
        }
        Self::get_list_sync(&conn, uid)?.ok_or_else(|| TodoError::NotFound {
            resource: format!("list {uid}"),
        })
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
            info!(backend = %self.name, purged, "expired trash purged");
        }
        Ok(purged)
    }

    fn can_detect(&self) -> bool {
        self.path.exists()
    }

    fn detection_info(&self) -> String {
        format!("sqlite database at {}", self.path.display())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn open_backend(dir: &TempDir) -> SqliteBackend {
        let config = BackendConfig {
            kind: "sqlite".to_string(),
            path: Some(dir.path().join("tasks.db")),
            ..BackendConfig::default()
        };
        SqliteBackend::open("local", &config).unwrap()
    }

    #[tokio::test]
    async fn create_list_is_idempotent_on_name() {
        let dir = TempDir::new().unwrap();
        let backend = open_backend(&dir);

        let first = backend.create_list("Work").await.unwrap();
        let second = backend.create_list("work").await.unwrap();
        assert_eq!(first.uid, second.uid);
        assert_eq!(backend.get_lists().await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn task_crud_round_trip() {
        let dir = TempDir::new().unwrap();
        let backend = open_backend(&dir);
        let list = backend.create_list("Work").await.unwrap();

        let task = Task::new(&list.uid, "Buy milk").with_priority(1);
        let created = backend.create_task(&list.uid, task).await.unwrap();
        assert!(!created.has_placeholder_uid());
        assert!(created.local_id.is_some());

        let mut updated = created.clone();
        updated.set_status(TaskStatus::Completed, Utc::now());
        let stored = backend.update_task(&list.uid, updated).await.unwrap();
        assert_eq!(stored.status, TaskStatus::Completed);
        assert!(stored.completed.is_some());

        backend.delete_task(&list.uid, &stored.uid).await.unwrap();
        assert!(backend
            .get_task(&list.uid, &stored.uid)
            .await
            .unwrap()
            .is_none());
    }

    #[tokio::test]
    async fn parent_checks_reject_cross_list_and_cycles() {
        let dir = TempDir::new().unwrap();
        let backend = open_backend(&dir);
        let work = backend.create_list("Work").await.unwrap();
        let home = backend.create_list("Home").await.unwrap();

        let parent = backend
            .create_task(&work.uid, Task::new(&work.uid, "Parent"))
            .await
            .unwrap();

        // Parent in a different list is rejected.
        let stray = Task::new(&home.uid, "Stray").with_parent(&parent.uid);
        assert!(backend.create_task(&home.uid, stray).await.is_err());

        // A -> B -> A is rejected.
        let child = backend
            .create_task(
                &work.uid,
                Task::new(&work.uid, "Child").with_parent(&parent.uid),
            )
            .await
            .unwrap();
        let mut looped = parent.clone();
        looped.parent_uid = Some(child.uid.clone());
        assert!(backend.update_task(&work.uid, looped).await.is_err());
    }

    #[tokio::test]
    async fn trash_round_trip_and_retention() {
        let dir = TempDir::new().unwrap();
        let backend = open_backend(&dir);
        let list = backend.create_list("Work").await.unwrap();
        backend
            .create_task(&list.uid, Task::new(&list.uid, "t"))
            .await
            .unwrap();

        backend.delete_list(&list.uid).await.unwrap();
        assert!(backend.get_list(&list.uid).await.unwrap().is_none());
        assert_eq!(backend.deleted_lists().await.unwrap().len(), 1);

        // Tasks survive the trash round trip.
        let restored = backend.restore_list(&list.uid).await.unwrap();
        assert!(restored.deleted_at.is_none());
        assert_eq!(backend.get_tasks(&list.uid).await.unwrap().len(), 1);

        backend.delete_list(&list.uid).await.unwrap();
        backend.purge_list(&list.uid).await.unwrap();
        assert!(backend.deleted_lists().await.unwrap().is_empty());
        assert!(backend.get_tasks(&list.uid).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn purge_expired_trash_honours_retention_window() {
        let dir = TempDir::new().unwrap();
        let backend = open_backend(&dir);
        let list = backend.create_list("Old").await.unwrap();
        backend.delete_list(&list.uid).await.unwrap();

        // Backdate the tombstone past the retention window.
        {
            let conn = backend.connection.lock().await;
            conn.execute(
                "UPDATE lists SET deleted_at = ?2 WHERE uid = ?1",
                params![list.uid, Utc::now() - Duration::days(45)],
            )
            .unwrap();
        }

        assert_eq!(backend.purge_expired_trash(0).await.unwrap(), 0);
        assert_eq!(backend.purge_expired_trash(30).await.unwrap(), 1);
        assert!(backend.deleted_lists().await.unwrap().is_empty());
    }
}
