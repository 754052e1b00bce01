//! Shared fixtures for the integration suite: a scripted in-memory driver
//! with failure injection and call recording, plus cache/engine builders
//! over temp directories.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::Utc;
use tempfile::TempDir;
use tokio::sync::Mutex;

use todoat::backends::{CapabilitySet, TaskManager};
use todoat::cache::CacheStore;
use todoat::models::{Task, TaskList};
use todoat::sync::SyncEngine;
use todoat::utils::config::SyncConfig;
use todoat::utils::error::{TodoError, TodoResult};

#[derive(Default)]
struct MockState {
    lists: Vec<TaskList>,
    tasks: HashMap<String, Vec<Task>>,
    uid_counter: u64,
}

/// In-memory remote with scripted failures.
pub struct MockBackend {
    name: String,
    capabilities: CapabilitySet,
    state: Mutex<MockState>,
    /// When set, every remote call fails with a clone of this error.
    failure: Mutex<Option<TodoError>>,
    /// When set, only mutating calls fail; reads (and the probe) succeed.
    write_failure: Mutex<Option<TodoError>>,
    calls: Mutex<Vec<String>>,
}

impl MockBackend {
    pub fn new(name: &str) -> Self {
        Self {
            name: name.to_string(),
            capabilities: CapabilitySet::full_local(),
            state: Mutex::new(MockState::default()),
            failure: Mutex::new(None),
            write_failure: Mutex::new(None),
            calls: Mutex::new(Vec::new()),
        }
    }

    pub fn with_capabilities(name: &str, capabilities: CapabilitySet) -> Self {
        Self {
            capabilities,
            ..Self::new(name)
        }
    }

    /// Simulate an unreachable network.
    pub async fn set_offline(&self, offline: bool) {
        *self.failure.lock().await = offline.then(|| TodoError::TransientIo {
            operation: "connect".to_string(),
            reason: "network unreachable".to_string(),
        });
    }

    pub async fn set_failure(&self, error: Option<TodoError>) {
        *self.failure.lock().await = error;
    }

    pub async fn set_write_failure(&self, error: Option<TodoError>) {
        *self.write_failure.lock().await = error;
    }

    pub async fn calls(&self) -> Vec<String> {
        self.calls.lock().await.clone()
    }

    async fn record(&self, call: &str) -> TodoResult<()> {
        self.calls.lock().await.push(call.to_string());
        if let Some(error) = self.failure.lock().await.clone() {
            return Err(error);
        }
        Ok(())
    }

    async fn record_write(&self, call: &str) -> TodoResult<()> {
        self.record(call).await?;
        if let Some(error) = self.write_failure.lock().await.clone() {
            return Err(error);
        }
        Ok(())
    }

    /// Server-side edit between syncs, bumping `modified`.
    pub async fn mutate_task<F>(&self, list_uid: &str, uid: &str, mutate: F)
    where
        F: FnOnce(&mut Task),
    {
        let mut state = self.state.lock().await;
        let task = state
            .tasks
            .get_mut(list_uid)
            .and_then(|tasks| tasks.iter_mut().find(|t| t.uid == uid))
            .unwrap_or_else(|| panic!("no task {uid} in {list_uid}"));
        mutate(task);
        task.modified = Utc::now().max(task.modified + chrono::Duration::milliseconds(1));
    }

    /// Server-side delete between syncs.
    pub async fn remove_task(&self, list_uid: &str, uid: &str) {
        let mut state = self.state.lock().await;
        if let Some(tasks) = state.tasks.get_mut(list_uid) {
            tasks.retain(|t| t.uid != uid);
        }
    }

    pub async fn task_count(&self, list_uid: &str) -> usize {
        self.state
            .lock()
            .await
            .tasks
            .get(list_uid)
            .map_or(0, Vec::len)
    }

    pub async fn task_by_summary(&self, list_uid: &str, summary: &str) -> Option<Task> {
        self.state
            .lock()
            .await
            .tasks
            .get(list_uid)
            .and_then(|tasks| tasks.iter().find(|t| t.summary == summary))
            .cloned()
    }

    pub async fn get_task_direct(&self, list_uid: &str, uid: &str) -> Option<Task> {
        self.state
            .lock()
            .await
            .tasks
            .get(list_uid)
            .and_then(|tasks| tasks.iter().find(|t| t.uid == uid))
            .cloned()
    }

    /// Plant a task directly, as if another client created it.
    pub async fn seed_task(&self, list_uid: &str, mut task: Task) -> Task {
        let mut state = self.state.lock().await;
        state.uid_counter += 1;
        task.uid = format!("srv-{}", state.uid_counter);
        task.list_uid = list_uid.to_string();
        state
            .tasks
            .entry(list_uid.to_string())
            .or_default()
            .push(task.clone());
        task
    }

    pub async fn seed_list(&self, name: &str) -> TaskList {
        let mut state = self.state.lock().await;
        state.uid_counter += 1;
        let list = TaskList {
            uid: format!("srvlist-{}", state.uid_counter),
            name: name.to_string(),
            description: String::new(),
            color: String::new(),
            modified: Utc::now(),
            deleted_at: None,
        };
        state.lists.push(list.clone());
        state.tasks.entry(list.uid.clone()).or_default();
        list
    }
}

#[async_trait]
impl TaskManager for MockBackend {
    fn name(&self) -> &str {
        &self.name
    }

    fn capabilities(&self) -> CapabilitySet {
        self.capabilities
    }

    async fn get_lists(&self) -> TodoResult<Vec<TaskList>> {
        self.record("get_lists").await?;
        Ok(self.state.lock().await.lists.clone())
    }

    async fn get_list(&self, uid: &str) -> TodoResult<Option<TaskList>> {
        self.record("get_list").await?;
        Ok(self
            .state
            .lock()
            .await
            .lists
            .iter()
            .find(|l| l.uid == uid)
            .cloned())
    }

    async fn create_list(&self, name: &str) -> TodoResult<TaskList> {
        self.record_write(&format!("create_list:{name}")).await?;
        let mut state = self.state.lock().await;
        if let Some(existing) = state.lists.iter().find(|l| l.name_matches(name)) {
            return Ok(existing.clone());
        }
        state.uid_counter += 1;
        let list = TaskList {
            uid: format!("srvlist-{}", state.uid_counter),
            name: name.to_string(),
            description: String::new(),
            color: String::new(),
            modified: Utc::now(),
            deleted_at: None,
        };
        state.lists.push(list.clone());
        state.tasks.entry(list.uid.clone()).or_default();
        Ok(list)
    }

    async fn update_list(&self, list: &TaskList) -> TodoResult<TaskList> {
        self.record_write(&format!("update_list:{}", list.uid)).await?;
        let mut state = self.state.lock().await;
        let slot = state
            .lists
            .iter_mut()
            .find(|l| l.uid == list.uid)
            .ok_or_else(|| TodoError::NotFound {
                resource: format!("list {}", list.uid),
            })?;
        *slot = list.clone();
        slot.modified = Utc::now();
        Ok(slot.clone())
    }

    async fn delete_list(&self, uid: &str) -> TodoResult<()> {
        self.record_write(&format!("delete_list:{uid}")).await?;
        let mut state = self.state.lock().await;
        let before = state.lists.len();
        state.lists.retain(|l| l.uid != uid);
        if state.lists.len() == before {
            return Err(TodoError::NotFound {
                resource: format!("list {uid}"),
            });
        }
        state.tasks.remove(uid);
        Ok(())
    }

    async fn get_tasks(&self, list_uid: &str) -> TodoResult<Vec<Task>> {
        self.record(&format!("get_tasks:{list_uid}")).await?;
        Ok(self
            .state
            .lock()
            .await
            .tasks
            .get(list_uid)
            .cloned()
            .unwrap_or_default())
    }

    async fn get_task(&self, list_uid: &str, uid: &str) -> TodoResult<Option<Task>> {
        self.record(&format!("get_task:{uid}")).await?;
        Ok(self
            .state
            .lock()
            .await
            .tasks
            .get(list_uid)
            .and_then(|tasks| tasks.iter().find(|t| t.uid == uid))
            .cloned())
    }

    async fn create_task(&self, list_uid: &str, task: Task) -> TodoResult<Task> {
        self.record_write(&format!("create_task:{}", task.summary)).await?;
        let mut state = self.state.lock().await;
        if !state.lists.iter().any(|l| l.uid == list_uid) {
            return Err(TodoError::NotFound {
                resource: format!("list {list_uid}"),
            });
        }
        state.uid_counter += 1;
        let now = Utc::now();
        let mut created = task;
        created.uid = format!("srv-{}", state.uid_counter);
        created.list_uid = list_uid.to_string();
        created.created = now;
        created.modified = now;
        state
            .tasks
            .entry(list_uid.to_string())
            .or_default()
            .push(created.clone());
        Ok(created)
    }

    async fn update_task(&self, list_uid: &str, task: Task) -> TodoResult<Task> {
        self.record_write(&format!("update_task:{}", task.uid)).await?;
        let mut state = self.state.lock().await;
        let slot = state
            .tasks
            .get_mut(list_uid)
            .and_then(|tasks| tasks.iter_mut().find(|t| t.uid == task.uid))
            .ok_or_else(|| TodoError::NotFound {
                resource: format!("task {}", task.uid),
            })?;
        let previous_modified = slot.modified;
        *slot = task;
        slot.modified = Utc::now().max(previous_modified + chrono::Duration::milliseconds(1));
        Ok(slot.clone())
    }

    async fn delete_task(&self, list_uid: &str, uid: &str) -> TodoResult<()> {
        self.record_write(&format!("delete_task:{uid}")).await?;
        let mut state = self.state.lock().await;
        let tasks = state
            .tasks
            .get_mut(list_uid)
            .ok_or_else(|| TodoError::NotFound {
                resource: format!("list {list_uid}"),
            })?;
        let before = tasks.len();
        tasks.retain(|t| t.uid != uid);
        if tasks.len() == before {
            return Err(TodoError::NotFound {
                resource: format!("task {uid}"),
            });
        }
        Ok(())
    }
}

/// A cache + engine pair over a scripted remote, on a temp directory.
pub struct SyncFixture {
    pub remote: Arc<MockBackend>,
    pub cache: Arc<CacheStore>,
    pub engine: SyncEngine,
    _dir: TempDir,
}

pub fn sync_config() -> SyncConfig {
    SyncConfig {
        enabled: true,
        ..SyncConfig::default()
    }
}

pub fn fixture_with(remote: MockBackend, config: SyncConfig) -> SyncFixture {
    let dir = TempDir::new().expect("tempdir");
    let remote = Arc::new(remote);
    let cache = Arc::new(
        CacheStore::open(
            "mock",
            &dir.path().join("cache.db"),
            remote.capabilities(),
            true,
        )
        .expect("cache"),
    );
    let engine = SyncEngine::new(
        Arc::clone(&remote) as Arc<dyn TaskManager>,
        Arc::clone(&cache),
        config,
    );
    SyncFixture {
        remote,
        cache,
        engine,
        _dir: dir,
    }
}

pub fn fixture() -> SyncFixture {
    fixture_with(MockBackend::new("mock"), sync_config())
}
