//! Backend abstraction: the `TaskManager` contract every driver and the
//! cache implement, capability advertisement, and the driver factory.

use std::sync::Arc;

use async_trait::async_trait;

use crate::models::{Task, TaskList};
use crate::utils::config::BackendConfig;
use crate::utils::error::{TodoError, TodoResult};

pub mod caldav;
pub mod markdown;
pub mod sqlite;
pub mod todoist;

/// Looks up a secret by key. Injected by the outer application; the core
/// never talks to a keyring itself.
pub type CredentialFn = Arc<dyn Fn(&str) -> TodoResult<String> + Send + Sync>;

/// Features a driver advertises. The sync engine consults these to avoid
/// emitting updates a backend cannot represent; drivers silently drop
/// unsupported fields on push and tolerate them on pull.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CapabilitySet {
    pub trash: bool,
    pub priority: bool,
    pub subtasks: bool,
    pub categories: bool,
    pub start_date: bool,
    pub recurrence: bool,
    pub sharing: bool,
}

impl CapabilitySet {
    /// Everything except sharing; what the local sqlite store offers.
    #[must_use]
    pub fn full_local() -> Self {
        Self {
            trash: true,
            priority: true,
            subtasks: true,
            categories: true,
            start_date: true,
            recurrence: true,
            sharing: false,
        }
    }

    /// Project a task onto this capability set, dropping what the backend
    /// cannot hold. Used before pushing.
    #[must_use]
    pub fn project(&self, mut task: Task) -> Task {
        if !self.priority {
            task.priority = 0;
        }
        if !self.categories {
            task.categories.clear();
        }
        if !self.start_date {
            task.start = None;
        }
        if !self.recurrence {
            task.recurrence = None;
        }
        if !self.subtasks {
            task.parent_uid = None;
        }
        task
    }
}

/// The uniform task-store contract.
///
/// Implemented by every remote driver, the purely local drivers, and the
/// cache store, so dispatcher callers cannot tell them apart. All calls run
/// under the caller's cancellation scope; the engine and daemon wrap them in
/// deadlines, so implementations must be cancel-safe.
#[async_trait]
pub trait TaskManager: Send + Sync {
    /// Backend name as configured (also the cache file stem).
    fn name(&self) -> &str;

    fn capabilities(&self) -> CapabilitySet;

    fn supports_trash(&self) -> bool {
        self.capabilities().trash
    }

    async fn get_lists(&self) -> TodoResult<Vec<TaskList>>;

    async fn get_list(&self, uid: &str) -> TodoResult<Option<TaskList>>;

    /// Case-insensitive name lookup.
    async fn get_list_by_name(&self, name: &str) -> TodoResult<Option<TaskList>> {
        Ok(self
            .get_lists()
            .await?
            .into_iter()
            .find(|l| l.name_matches(name)))
    }

    /// Idempotent: a name collision returns the existing list.
    async fn create_list(&self, name: &str) -> TodoResult<TaskList>;

    /// Fails `NotFound` for unknown lists.
    async fn update_list(&self, list: &TaskList) -> TodoResult<TaskList>;

    /// May be `Unsupported`; trash-capable backends soft-delete.
    async fn delete_list(&self, uid: &str) -> TodoResult<()>;

    async fn get_tasks(&self, list_uid: &str) -> TodoResult<Vec<Task>>;

    async fn get_task(&self, list_uid: &str, uid: &str) -> TodoResult<Option<Task>>;

    /// Assigns UID, created and modified; status defaults to needs-action.
    async fn create_task(&self, list_uid: &str, task: Task) -> TodoResult<Task>;

    async fn update_task(&self, list_uid: &str, task: Task) -> TodoResult<Task>;

    async fn delete_task(&self, list_uid: &str, uid: &str) -> TodoResult<()>;

    /// Trash contents; empty for backends without trash.
    async fn deleted_lists(&self) -> TodoResult<Vec<TaskList>> {
        Ok(Vec::new())
    }

    async fn restore_list(&self, uid: &str) -> TodoResult<TaskList> {
        Err(unsupported(self.name(), "restore_list"))
    }

    async fn purge_list(&self, uid: &str) -> TodoResult<()> {
        let _ = uid;
        Err(unsupported(self.name(), "purge_list"))
    }

    /// Drop trashed lists older than `retention_days` (0 disables). Called
    /// opportunistically by the dispatcher; a no-op for backends without
    /// trash.
    async fn purge_expired_trash(&self, retention_days: u32) -> TodoResult<usize> {
        let _ = retention_days;
        Ok(0)
    }

    /// Auto-detection: whether this driver recognises the current
    /// environment (e.g. a marker file in the working directory).
    fn can_detect(&self) -> bool {
        false
    }

    fn detection_info(&self) -> String {
        String::new()
    }
}

pub(crate) fn unsupported(backend: &str, operation: &str) -> TodoError {
    TodoError::Unsupported {
        backend: backend.to_string(),
        operation: operation.to_string(),
    }
}

/// Construct a driver for a named backend from its configuration.
///
/// The factory is the single place drivers are enumerated; the rest of the
/// system only sees `Arc<dyn TaskManager>`.
pub fn connect(
    name: &str,
    config: &BackendConfig,
    credentials: &CredentialFn,
) -> TodoResult<Arc<dyn TaskManager>> {
    match config.kind.as_str() {
        "sqlite" => Ok(Arc::new(sqlite::SqliteBackend::open(name, config)?)),
        "markdown" => Ok(Arc::new(markdown::MarkdownBackend::open(name, config)?)),
        "todoist" => {
            let key = config.credential.as_deref().ok_or_else(|| {
                TodoError::Configuration {
                    reason: format!("backend {name}: todoist requires a credential key"),
                }
            })?;
            let token = credentials(key)?;
            Ok(Arc::new(todoist::TodoistBackend::new(name, token)?))
        }
        "caldav" => {
            let token = match config.credential.as_deref() {
                Some(key) => Some(credentials(key)?),
                None => None,
            };
            Ok(Arc::new(caldav::CaldavBackend::new(name, config, token)?))
        }
        other => Err(TodoError::Configuration {
            reason: format!("backend {name}: unknown kind {other:?}"),
        }),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn capability_projection_drops_unsupported_fields() {
        let caps = CapabilitySet {
            priority: true,
            ..CapabilitySet::default()
        };
        let mut task = Task::new("l", "t").with_priority(2);
        task.categories = vec!["a".to_string()];
        task.start = Some(chrono::Utc::now());
        task.recurrence = Some("FREQ=DAILY".to_string());
        task.parent_uid = Some("p".to_string());

        let projected = caps.project(task);
        assert_eq!(projected.priority, 2);
        assert!(projected.categories.is_empty());
        assert!(projected.start.is_none());
        assert!(projected.recurrence.is_none());
        assert!(projected.parent_uid.is_none());
    }
}
