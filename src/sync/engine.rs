//! The per-backend sync cycle: connectivity probe, pull with conflict
//! detection, policy-driven resolution, FIFO push, checkpoint.
//!
//! One engine instance serves one backend. Cycles are internally
//! sequential; the daemon runs one engine per backend in parallel across a
//! tick. Every remote call is safe to retry: creates are deduped by
//! placeholder adoption, updates send full state.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use tokio::time::timeout;
use tracing::{debug, warn};
use uuid::Uuid;

use crate::backends::TaskManager;
use crate::cache::CacheStore;
use crate::models::{
    ConflictRecord, OperationKind, OperationRecord, OperationState, Task, TaskList,
};
use crate::sync::conflict::{resolve, PushAction};
use crate::sync::queue::OperationQueue;
use crate::utils::config::SyncConfig;
use crate::utils::error::{TodoError, TodoResult};
use crate::utils::logging::SyncLogger;

/// Upper bound for the in-cycle retry backoff.
const MAX_BACKOFF: Duration = Duration::from_secs(60);
/// Transient failures tolerated inside one cycle before giving up on the
/// push phase (the record stays pending for the next cycle).
const MAX_IN_CYCLE_RETRIES: u32 = 3;

#[derive(Debug, Clone, Default, PartialEq, Eq, serde::Serialize)]
pub struct SyncOutcome {
    pub backend: String,
    /// Remote entities applied to the cache.
    pub pulled: usize,
    /// Operations transitioned to done.
    pub pushed: usize,
    pub conflicts_detected: usize,
    pub conflicts_resolved: usize,
    /// Operations that went terminally failed this cycle.
    pub failed: usize,
    /// Connectivity probe failed; nothing was attempted.
    pub skipped: bool,
}

impl SyncOutcome {
    /// Whether the cycle moved anything at all.
    #[must_use]
    pub fn made_progress(&self) -> bool {
        !self.skipped && (self.pulled + self.pushed + self.conflicts_resolved) > 0
    }
}

pub struct SyncEngine {
    backend_name: String,
    remote: Arc<dyn TaskManager>,
    cache: Arc<CacheStore>,
    queue: OperationQueue,
    config: SyncConfig,
    /// Distinguishes this worker in claim tokens across restarts.
    nonce: String,
}

impl SyncEngine {
    #[must_use]
    pub fn new(remote: Arc<dyn TaskManager>, cache: Arc<CacheStore>, config: SyncConfig) -> Self {
        let backend_name = cache.backend().to_string();
        let queue = OperationQueue::new(cache.connection.clone(), &backend_name);
        Self {
            backend_name,
            remote,
            cache,
            queue,
            config,
            nonce: Uuid::new_v4().simple().to_string(),
        }
    }

    #[must_use]
    pub fn queue(&self) -> &OperationQueue {
        &self.queue
    }

    fn worker_token(&self) -> String {
        OperationRecord::worker_token(&self.nonce)
    }

    /// One full cycle: probe, pull, resolve, push, checkpoint.
    pub async fn run_cycle(&self) -> TodoResult<SyncOutcome> {
        SyncLogger::cycle_started(&self.backend_name, false);
        let mut outcome = SyncOutcome {
            backend: self.backend_name.clone(),
            ..SyncOutcome::default()
        };

        // Connectivity probe doubles as the list fetch. A probe failure
        // skips pull AND push; the queue keeps growing offline.
        let remote_lists = match self.probe().await {
            Ok(lists) => lists,
            Err(e) => {
                SyncLogger::cycle_skipped(&self.backend_name, &e.to_string());
                outcome.skipped = true;
                return Ok(outcome);
            }
        };

        self.pull(&remote_lists, &mut outcome).await?;
        self.resolve_conflicts(&mut outcome).await?;
        self.push(&mut outcome).await?;

        self.cache.checkpoint_sync(Utc::now()).await?;
        SyncLogger::cycle_finished(
            &self.backend_name,
            outcome.pulled,
            outcome.pushed,
            outcome.conflicts_detected,
            outcome.failed,
        );
        Ok(outcome)
    }

    /// Read-triggered refresh: probe and pull only, no resolution or push.
    pub async fn run_pull_only(&self) -> TodoResult<SyncOutcome> {
        SyncLogger::cycle_started(&self.backend_name, true);
        let mut outcome = SyncOutcome {
            backend: self.backend_name.clone(),
            ..SyncOutcome::default()
        };
        match self.probe().await {
            Ok(remote_lists) => {
                self.pull(&remote_lists, &mut outcome).await?;
                self.cache.checkpoint_sync(Utc::now()).await?;
            }
            Err(e) => {
                SyncLogger::cycle_skipped(&self.backend_name, &e.to_string());
                outcome.skipped = true;
            }
        }
        Ok(outcome)
    }

    async fn probe(&self) -> TodoResult<Vec<TaskList>> {
        let probe_timeout = self.config.connectivity_timeout();
        timeout(probe_timeout, self.remote.get_lists())
            .await
            .map_err(|_| TodoError::Timeout {
                operation: "connectivity_probe".to_string(),
                duration_ms: probe_timeout.as_millis() as u64,
            })?
    }

    // ----- pull --------------------------------------------------------

    async fn pull(&self, remote_lists: &[TaskList], outcome: &mut SyncOutcome) -> TodoResult<()> {
        let list_baselines: HashMap<String, _> =
            self.cache.list_baselines().await?.into_iter().collect();

        for list in remote_lists {
            let newer = match list_baselines.get(&list.uid) {
                Some(Some(baseline)) => list.modified > *baseline,
                Some(None) | None => true,
            };
            if !newer {
                continue;
            }
            // A pending local edit keeps the local list row until pushed.
            if !self.cache.has_pending_operation(&list.uid).await? {
                self.cache.apply_remote_list(list).await?;
                outcome.pulled += 1;
            }
        }

        // Lists gone from the remote: drop mirrored rows that have no
        // pending local operation. Placeholder rows were never pushed.
        let remote_list_uids: HashSet<&str> =
            remote_lists.iter().map(|l| l.uid.as_str()).collect();
        for (uid, baseline) in list_baselines {
            if remote_list_uids.contains(uid.as_str()) || baseline.is_none() {
                continue;
            }
            if !self.cache.has_pending_operation(&uid).await? {
                self.cache.remove_list_silent(&uid).await?;
                outcome.pulled += 1;
            }
        }

        // Tasks, list by list. Parents must land before their children so
        // the cache's parent reference always resolves.
        let task_baselines: HashMap<String, _> =
            self.cache.task_baselines().await?.into_iter().collect();
        let known_uids: HashSet<String> = task_baselines.keys().cloned().collect();
        let mut seen_remote: HashSet<String> = HashSet::new();

        for list in remote_lists {
            let remote_tasks = self.remote.get_tasks(&list.uid).await?;
            let (ordered, orphans) = order_parents_first(remote_tasks, &known_uids);
            if orphans > 0 {
                warn!(
                    backend = %self.backend_name,
                    list = %list.uid,
                    orphans,
                    "tasks with missing parents pulled as roots"
                );
            }
            for task in ordered {
                seen_remote.insert(task.uid.clone());
                self.pull_task(task, &task_baselines, outcome).await?;
            }
        }

        // Previously-synced tasks missing remotely are deletions.
        for (uid, baseline) in task_baselines {
            if seen_remote.contains(&uid) || baseline.is_none() {
                continue;
            }
            if self.cache.has_pending_operation(&uid).await? {
                if !self.cache.has_unresolved_conflict(&uid).await? {
                    if let Some(local) = self.cache.get_task_by_uid(&uid).await? {
                        self.cache.record_conflict(&local, None).await?;
                        SyncLogger::conflict_detected(&self.backend_name, &uid, true);
                        outcome.conflicts_detected += 1;
                    }
                }
            } else {
                self.cache.remove_task_silent(&uid).await?;
                outcome.pulled += 1;
            }
        }
        Ok(())
    }

    async fn pull_task(
        &self,
        task: Task,
        baselines: &HashMap<String, Option<chrono::DateTime<Utc>>>,
        outcome: &mut SyncOutcome,
    ) -> TodoResult<()> {
        match baselines.get(&task.uid) {
            Some(baseline) => {
                let newer = baseline.map_or(true, |b| task.modified > b);
                if !newer {
                    return Ok(());
                }
                if self.cache.has_pending_operation(&task.uid).await? {
                    // Both sides advanced: conflict, detected once.
                    if !self.cache.has_unresolved_conflict(&task.uid).await? {
                        if let Some(local) = self.cache.get_task_by_uid(&task.uid).await? {
                            self.cache.record_conflict(&local, Some(&task)).await?;
                            SyncLogger::conflict_detected(&self.backend_name, &task.uid, false);
                            outcome.conflicts_detected += 1;
                        }
                    }
                } else {
                    self.cache.apply_remote_task(&task).await?;
                    outcome.pulled += 1;
                }
            }
            None => {
                // Unknown UID. Either genuinely new, or the remote half of
                // a create whose local commit was lost: adopt the
                // placeholder twin when one matches closely enough.
                if let Some(twin) = self
                    .cache
                    .find_placeholder_twin(&task.list_uid, &task.summary, task.created)
                    .await?
                {
                    debug!(
                        backend = %self.backend_name,
                        placeholder = %twin.uid,
                        remote = %task.uid,
                        "adopting remote uid for interrupted create"
                    );
                    self.cache.rewrite_uid(&twin.uid, &task.uid).await?;
                    self.queue.complete_create_for(&task.uid).await?;
                    self.cache.apply_remote_task(&task).await?;
                } else {
                    self.cache.apply_remote_task(&task).await?;
                }
                outcome.pulled += 1;
            }
        }
        Ok(())
    }

    // ----- resolve -----------------------------------------------------

    async fn resolve_conflicts(&self, outcome: &mut SyncOutcome) -> TodoResult<()> {
        for conflict in self.cache.unresolved_conflicts().await? {
            self.resolve_one(&conflict, outcome).await?;
        }
        Ok(())
    }

    async fn resolve_one(
        &self,
        conflict: &ConflictRecord,
        outcome: &mut SyncOutcome,
    ) -> TodoResult<()> {
        let policy = self.config.conflict_resolution;
        let base = self.cache.task_base_snapshot(&conflict.uid).await?;
        let resolution = resolve(policy, conflict, base.as_ref());

        if resolution.cache_is_remote {
            // The local edit lost (or moved into a keep-both copy); its
            // queued operations must not be replayed.
            self.queue.cancel_for(&conflict.uid).await?;
        }

        match &resolution.cache_task {
            None => {
                self.cache.remove_task_silent(&conflict.uid).await?;
                warn!(
                    backend = %self.backend_name,
                    uid = %conflict.uid,
                    "local edit discarded by server_wins"
                );
            }
            Some(task) => {
                if self.cache.get_task_by_uid(&task.uid).await?.is_some() {
                    self.cache.apply_remote_task(task).await?;
                } else {
                    self.cache.insert_local_task(task).await?;
                }
            }
        }

        match resolution.push {
            Some(PushAction::Update(task)) => {
                self.cache
                    .enqueue_operation(
                        OperationKind::UpdateTask,
                        &task.uid,
                        &task.list_uid,
                        &serde_json::to_value(&task)?,
                    )
                    .await?;
            }
            Some(PushAction::Create(task)) => {
                if self.cache.get_task_by_uid(&task.uid).await?.is_none() {
                    self.cache.insert_local_task(&task).await?;
                }
                self.cache
                    .enqueue_operation(
                        OperationKind::CreateTask,
                        &task.uid,
                        &task.list_uid,
                        &serde_json::to_value(&task)?,
                    )
                    .await?;
            }
            None => {}
        }

        self.cache
            .resolve_conflict(conflict.id, resolution.resolution)
            .await?;
        SyncLogger::conflict_resolved(&self.backend_name, &conflict.uid, policy.as_str());
        outcome.conflicts_resolved += 1;
        Ok(())
    }

    // ----- push --------------------------------------------------------

    async fn push(&self, outcome: &mut SyncOutcome) -> TodoResult<()> {
        let worker = self.worker_token();
        let mut transient_failures: u32 = 0;

        loop {
            let Some(record) = self.queue.claim_next(&worker).await? else {
                break;
            };
            let seq = record.seq;
            let kind = record.kind;
            let uid = record.target_uid.clone();

            let deadline = self.config.daemon.task_timeout();
            let result = match timeout(deadline, self.execute(&record)).await {
                Ok(result) => result,
                Err(_) => Err(TodoError::Timeout {
                    operation: kind.as_str().to_string(),
                    duration_ms: deadline.as_millis() as u64,
                }),
            };

            match result {
                Ok(()) => {
                    self.queue.complete(seq).await?;
                    SyncLogger::operation_pushed(&self.backend_name, seq, kind.as_str(), &uid);
                    outcome.pushed += 1;
                    transient_failures = 0;
                }
                Err(TodoError::Unsupported { backend, operation }) => {
                    // Capability gap: drop silently but audibly.
                    warn!(backend = %backend, operation = %operation, seq, "unsupported operation skipped");
                    self.queue.complete(seq).await?;
                    outcome.pushed += 1;
                }
                Err(e) if e.is_transient() => {
                    let state = self
                        .queue
                        .fail(seq, &e.to_string(), self.config.max_retries)
                        .await?;
                    SyncLogger::operation_failed(&self.backend_name, seq, transient_failures, &e.to_string());
                    if state == OperationState::Failed {
                        outcome.failed += 1;
                        continue;
                    }
                    transient_failures += 1;
                    if transient_failures > MAX_IN_CYCLE_RETRIES {
                        // Leave the record pending for the next cycle; FIFO
                        // order forbids skipping ahead of it.
                        break;
                    }
                    tokio::time::sleep(backoff_delay(transient_failures)).await;
                }
                Err(e) => {
                    // Permanent: terminal failure, successors proceed.
                    self.queue.fail_permanently(seq, &e.to_string()).await?;
                    SyncLogger::operation_failed(&self.backend_name, seq, record.retries, &e.to_string());
                    outcome.failed += 1;
                }
            }
        }
        Ok(())
    }

    /// Translate one queued operation into a remote call, honouring the
    /// driver's capability set.
    async fn execute(&self, record: &OperationRecord) -> TodoResult<()> {
        let caps = self.remote.capabilities();
        match record.kind {
            OperationKind::CreateList => {
                let list: TaskList = serde_json::from_value(record.payload.clone())?;
                let created = self.remote.create_list(&list.name).await?;
                if created.uid != record.target_uid {
                    self.cache.rewrite_uid(&record.target_uid, &created.uid).await?;
                }
                self.cache.mark_list_synced(&created.uid, created.modified).await?;
                Ok(())
            }
            OperationKind::UpdateList => {
                let list: TaskList = serde_json::from_value(record.payload.clone())?;
                let updated = self.remote.update_list(&list).await?;
                self.cache.mark_list_synced(&updated.uid, updated.modified).await?;
                Ok(())
            }
            OperationKind::DeleteList => {
                match self.remote.delete_list(&record.target_uid).await {
                    // Already gone remotely: the intent is satisfied.
                    Err(e) if e.is_not_found() => Ok(()),
                    other => other,
                }
            }
            OperationKind::CreateTask => {
                let task: Task = serde_json::from_value(record.payload.clone())?;
                let task = caps.project(task);
                let created = self.remote.create_task(&record.list_uid, task).await?;
                if created.uid != record.target_uid {
                    self.cache.rewrite_uid(&record.target_uid, &created.uid).await?;
                }
                self.cache.mark_task_synced(&created.uid, created.modified).await?;
                Ok(())
            }
            OperationKind::UpdateTask => {
                let task: Task = serde_json::from_value(record.payload.clone())?;
                let task = caps.project(task);
                let updated = self.remote.update_task(&record.list_uid, task).await?;
                self.cache.mark_task_synced(&updated.uid, updated.modified).await?;
                Ok(())
            }
            OperationKind::DeleteTask => {
                match self
                    .remote
                    .delete_task(&record.list_uid, &record.target_uid)
                    .await
                {
                    Err(e) if e.is_not_found() => Ok(()),
                    other => other,
                }
            }
        }
    }
}

/// Order a pulled task set so every parent precedes its children. A parent
/// UID found neither in the fetched set nor in the cache demotes the child
/// to a root (returned count is reported by the caller); parent cycles in
/// remote data are broken the same way.
fn order_parents_first(
    tasks: Vec<Task>,
    known_uids: &HashSet<String>,
) -> (Vec<Task>, usize) {
    let fetched: HashSet<String> = tasks.iter().map(|t| t.uid.clone()).collect();
    let mut placed: HashSet<String> = known_uids.clone();
    let mut remaining = tasks;
    let mut ordered = Vec::with_capacity(remaining.len());
    let mut orphans = 0;

    while !remaining.is_empty() {
        let before = remaining.len();
        let mut deferred = Vec::new();
        for mut task in remaining {
            let ready = match &task.parent_uid {
                None => true,
                Some(parent) if placed.contains(parent) => true,
                Some(parent) if fetched.contains(parent) => false, // wait for it
                Some(_) => {
                    task.parent_uid = None;
                    orphans += 1;
                    true
                }
            };
            if ready {
                placed.insert(task.uid.clone());
                ordered.push(task);
            } else {
                deferred.push(task);
            }
        }
        remaining = deferred;
        if remaining.len() == before {
            // Parent cycle: demote everything still waiting.
            for mut task in remaining.drain(..) {
                task.parent_uid = None;
                orphans += 1;
                ordered.push(task);
            }
        }
    }
    (ordered, orphans)
}

fn backoff_delay(attempt: u32) -> Duration {
    let base = Duration::from_secs(1)
        .checked_mul(1u32 << attempt.min(6))
        .unwrap_or(MAX_BACKOFF);
    let capped = base.min(MAX_BACKOFF);
    // Jitter: 50-100% of the capped delay.
    let jitter = 0.5 + rand::random::<f64>() * 0.5;
    capped.mul_f64(jitter)
}
