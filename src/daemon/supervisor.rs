//! Daemon process lifecycle and scheduling.
//!
//! The daemon is a detached, single-instance child process. A PID file
//! holds an exclusive lock for the daemon's lifetime and a Unix socket
//! answers the line-oriented IPC commands. Each tick runs one sync cycle
//! per configured remote backend, gated by per-backend circuit breakers;
//! stuck queue claims from dead workers are recovered on every tick.

use std::collections::BTreeMap;
use std::fs::File;
use std::io::Write as _;
use std::path::PathBuf;
use std::process::{Command as ProcessCommand, Stdio};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use fs2::FileExt;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::{UnixListener, UnixStream};
use tokio::sync::{watch, Notify, RwLock};
use tracing::{error, info, warn};

use crate::daemon::breaker::CircuitBreaker;
use crate::daemon::ipc::{AckResponse, BackendStatus, Command, StatusResponse};
use crate::models::OperationRecord;
use crate::sync::SyncEngine;
use crate::utils::config::TodoConfig;
use crate::utils::error::{TodoError, TodoResult};
use crate::utils::paths;

/// Consecutive whole-cycle failures before the daemon terminates itself
/// rather than spin.
const MAX_FAILED_ROUNDS: u32 = 5;
/// Grace period between SIGTERM and SIGKILL for `daemon kill`.
const KILL_GRACE: Duration = Duration::from_secs(5);

/// State shared between the scheduler loop and IPC connections.
struct Shared {
    engines: Vec<Arc<SyncEngine>>,
    breakers: BTreeMap<String, Arc<CircuitBreaker>>,
    interval: Duration,
    heartbeat_interval: Duration,
    heartbeat_path: PathBuf,
    sync_count: AtomicU64,
    last_sync: RwLock<Option<DateTime<Utc>>>,
    last_activity: RwLock<Instant>,
    trigger: Notify,
    shutdown_tx: watch::Sender<bool>,
}

impl Shared {
    async fn status(&self) -> StatusResponse {
        let mut backends = BTreeMap::new();
        for engine in &self.engines {
            let name = engine.queue().backend_name().to_string();
            let stats = engine.queue().stats().await.unwrap_or_default();
            let breaker = &self.breakers[&name];
            backends.insert(
                name,
                BackendStatus {
                    circuit: breaker.state().await.as_str().to_string(),
                    failures: breaker.failure_count(),
                    pending_operations: stats.pending + stats.processing,
                    failed_operations: stats.failed,
                },
            );
        }

        let heartbeat_age = heartbeat_age(&self.heartbeat_path);
        let healthy = self.heartbeat_interval.is_zero()
            || heartbeat_age
                .map_or(true, |age| age <= self.heartbeat_interval * 2);

        StatusResponse {
            ok: true,
            pid: std::process::id(),
            interval_secs: self.interval.as_secs(),
            sync_count: self.sync_count.load(Ordering::Relaxed),
            last_sync: *self.last_sync.read().await,
            backends,
            heartbeat_age_secs: heartbeat_age.map(|age| age.as_secs()),
            healthy,
        }
    }
}

pub struct Supervisor {
    config: TodoConfig,
    shared: Arc<Shared>,
    shutdown_rx: watch::Receiver<bool>,
    socket_path: PathBuf,
    pid_path: PathBuf,
    // NOTE(lifetime): held for the exclusive lock; released on drop.
    #[allow(dead_code)]
    lock_file: File,
}

impl Supervisor {
    /// Acquire single-instance ownership and prepare runtime artifacts.
    ///
    /// Refuses to start when the PID file is locked by a live daemon; a
    /// stale file from a crashed one is cleaned up silently.
    pub fn start(
        config: TodoConfig,
        engines: Vec<Arc<SyncEngine>>,
        interval_override: Option<u64>,
    ) -> TodoResult<Self> {
        let pid_path = paths::pid_file()?;
        let socket_path = paths::socket_path()?;

        let lock_file = std::fs::OpenOptions::new()
            .write(true)
            .create(true)
            .truncate(false)
            .open(&pid_path)?;
        if lock_file.try_lock_exclusive().is_err() {
            let holder = std::fs::read_to_string(&pid_path).unwrap_or_default();
            let holder = holder.trim();
            return Err(TodoError::Daemon {
                reason: format!(
                    "daemon already running (pid {})",
                    if holder.is_empty() { "unknown" } else { holder }
                ),
            });
        }

        // We own the lock now: anything left over is stale.
        let mut lock_file = lock_file;
        lock_file.set_len(0)?;
        writeln!(lock_file, "{}", std::process::id())?;
        if socket_path.exists() {
            std::fs::remove_file(&socket_path)?;
        }

        let interval = Duration::from_secs(
            interval_override.unwrap_or(config.sync.daemon.interval_secs),
        );
        let breakers = engines
            .iter()
            .map(|e| {
                (
                    e.queue().backend_name().to_string(),
                    Arc::new(CircuitBreaker::default()),
                )
            })
            .collect();

        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let shared = Arc::new(Shared {
            engines,
            breakers,
            interval,
            heartbeat_interval: Duration::from_secs(config.sync.daemon.heartbeat_interval_secs),
            heartbeat_path: paths::heartbeat_file()?,
            sync_count: AtomicU64::new(0),
            last_sync: RwLock::new(None),
            last_activity: RwLock::new(Instant::now()),
            trigger: Notify::new(),
            shutdown_tx,
        });

        info!(pid = std::process::id(), interval_secs = interval.as_secs(), "daemon starting");
        Ok(Self {
            config,
            shared,
            shutdown_rx,
            socket_path,
            pid_path,
            lock_file,
        })
    }

    /// Main loop: serve IPC, tick the scheduler, recover stuck work,
    /// heartbeat, and exit on idleness, `stop`, or repeated total failure.
    pub async fn run(mut self) -> TodoResult<()> {
        let listener = UnixListener::bind(&self.socket_path).map_err(|e| TodoError::Daemon {
            reason: format!("cannot bind {}: {e}", self.socket_path.display()),
        })?;

        let ipc_shared = Arc::clone(&self.shared);
        let ipc_task = tokio::spawn(async move {
            loop {
                match listener.accept().await {
                    Ok((stream, _)) => {
                        let shared = Arc::clone(&ipc_shared);
                        tokio::spawn(handle_connection(stream, shared));
                    }
                    Err(e) => {
                        warn!(error = %e, "ipc accept failed");
                    }
                }
            }
        });

        let heartbeat_task = self.spawn_heartbeat();

        let idle_timeout = self.config.sync.daemon.idle_timeout();
        let stuck_timeout = self.config.sync.daemon.stuck_timeout();
        let mut failed_rounds: u32 = 0;
        let mut timer = tokio::time::interval(self.shared.interval);
        timer.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        timer.tick().await; // the first tick fires immediately

        // Recover anything a crashed predecessor left claimed.
        self.recover_stuck(stuck_timeout).await;

        loop {
            let idle_deadline = {
                let last = *self.shared.last_activity.read().await;
                tokio::time::Instant::from_std(last + idle_timeout)
            };

            tokio::select! {
                _ = timer.tick() => {}
                _ = self.shared.trigger.notified() => {
                    info!("sync triggered");
                    *self.shared.last_activity.write().await = Instant::now();
                }
                _ = tokio::time::sleep_until(idle_deadline) => {
                    let idle_for = self.shared.last_activity.read().await.elapsed();
                    if idle_for >= idle_timeout {
                        info!(idle_secs = idle_for.as_secs(), "idle timeout reached, exiting");
                        break;
                    }
                    continue;
                }
                _ = self.shutdown_rx.changed() => {
                    info!("stop requested, finishing up");
                    break;
                }
            }

            self.recover_stuck(stuck_timeout).await;
            let round = self.run_round().await;

            match round {
                RoundResult::Progress => {
                    failed_rounds = 0;
                    self.shared.sync_count.fetch_add(1, Ordering::Relaxed);
                    *self.shared.last_sync.write().await = Some(Utc::now());
                    *self.shared.last_activity.write().await = Instant::now();
                }
                RoundResult::Quiet => {
                    failed_rounds = 0;
                    self.shared.sync_count.fetch_add(1, Ordering::Relaxed);
                    *self.shared.last_sync.write().await = Some(Utc::now());
                }
                RoundResult::Failed => {
                    failed_rounds += 1;
                    error!(failed_rounds, "sync round made no progress on any backend");
                    if failed_rounds >= MAX_FAILED_ROUNDS {
                        error!("too many consecutive failed rounds, shutting down");
                        break;
                    }
                }
                RoundResult::Nothing => {}
            }

            let idle_for = self.shared.last_activity.read().await.elapsed();
            if idle_for >= idle_timeout {
                info!(idle_secs = idle_for.as_secs(), "idle timeout reached, exiting");
                break;
            }
        }

        ipc_task.abort();
        if let Some(task) = heartbeat_task {
            task.abort();
        }
        self.cleanup();
        info!("daemon stopped");
        Ok(())
    }

    /// One scheduling round: every allowed backend runs one cycle.
    /// Backends proceed in parallel and independently; one failing never
    /// stops another.
    async fn run_round(&self) -> RoundResult {
        if self.shared.engines.is_empty() {
            return RoundResult::Nothing;
        }

        let cycles = self.shared.engines.iter().map(|engine| {
            let engine = Arc::clone(engine);
            let breaker = Arc::clone(&self.shared.breakers[engine.queue().backend_name()]);
            async move {
                if !breaker.allow().await {
                    return None;
                }
                let result = engine.run_cycle().await;
                match &result {
                    Ok(outcome) if !outcome.skipped => breaker.record_success().await,
                    _ => breaker.record_failure().await,
                }
                Some(result)
            }
        });

        let results = futures::future::join_all(cycles).await;
        let mut attempted = 0;
        let mut progressed = 0;
        let mut succeeded = 0;
        for result in results.into_iter().flatten() {
            attempted += 1;
            match result {
                Ok(outcome) => {
                    if !outcome.skipped {
                        succeeded += 1;
                    }
                    if outcome.made_progress() {
                        progressed += 1;
                    }
                }
                Err(e) => {
                    warn!(error = %e, "backend cycle failed");
                }
            }
        }

        if attempted == 0 {
            RoundResult::Nothing
        } else if progressed > 0 {
            RoundResult::Progress
        } else if succeeded > 0 {
            RoundResult::Quiet
        } else {
            RoundResult::Failed
        }
    }

    async fn recover_stuck(&self, stuck_timeout: Duration) {
        for engine in &self.shared.engines {
            let result = engine
                .queue()
                .reset_stuck(stuck_timeout, |worker_id| {
                    OperationRecord::worker_pid(worker_id).is_some_and(pid_alive)
                })
                .await;
            if let Err(e) = result {
                warn!(error = %e, "stuck-task recovery failed");
            }
        }
    }

    fn spawn_heartbeat(&self) -> Option<tokio::task::JoinHandle<()>> {
        let interval = self.shared.heartbeat_interval;
        if interval.is_zero() {
            return None;
        }
        let path = self.shared.heartbeat_path.clone();
        Some(tokio::spawn(async move {
            let mut timer = tokio::time::interval(interval);
            loop {
                timer.tick().await;
                if let Err(e) = std::fs::write(&path, Utc::now().to_rfc3339()) {
                    warn!(error = %e, "heartbeat write failed");
                }
            }
        }))
    }

    fn cleanup(&self) {
        let _ = std::fs::remove_file(&self.socket_path);
        let _ = std::fs::remove_file(&self.shared.heartbeat_path);
        let _ = std::fs::remove_file(&self.pid_path);
    }
}

enum RoundResult {
    /// At least one backend moved data.
    Progress,
    /// Cycles ran cleanly with nothing to do.
    Quiet,
    /// Every attempted backend failed or was unreachable.
    Failed,
    /// No backend was due (all circuits open, or none configured).
    Nothing,
}

async fn handle_connection(stream: UnixStream, shared: Arc<Shared>) {
    let (read_half, mut write_half) = stream.into_split();
    let mut lines = BufReader::new(read_half).lines();

    while let Ok(Some(line)) = lines.next_line().await {
        let response = match Command::parse(&line) {
            Some(Command::Status) => serde_json::to_string(&shared.status().await),
            Some(Command::Trigger) => {
                *shared.last_activity.write().await = Instant::now();
                shared.trigger.notify_one();
                serde_json::to_string(&AckResponse::ok("sync triggered"))
            }
            Some(Command::Stop) => {
                let _ = shared.shutdown_tx.send(true);
                serde_json::to_string(&AckResponse::ok("stopping"))
            }
            None => serde_json::to_string(&AckResponse::error(&format!(
                "unknown command: {}",
                line.trim()
            ))),
        };
        let Ok(mut payload) = response else { break };
        payload.push('\n');
        if write_half.write_all(payload.as_bytes()).await.is_err() {
            break;
        }
        if matches!(Command::parse(&line), Some(Command::Stop)) {
            break;
        }
    }
}

fn heartbeat_age(path: &std::path::Path) -> Option<Duration> {
    let content = std::fs::read_to_string(path).ok()?;
    let written: DateTime<Utc> = content.trim().parse().ok()?;
    (Utc::now() - written).to_std().ok()
}

/// `kill(pid, 0)` liveness probe.
#[must_use]
pub fn pid_alive(pid: i32) -> bool {
    if pid <= 0 {
        return false;
    }
    // SAFETY: signal 0 performs permission and existence checks only.
    unsafe { libc::kill(pid, 0) == 0 }
}

/// Re-execute the current binary as a detached `daemon run` child.
pub fn spawn_detached(interval_override: Option<u64>) -> TodoResult<u32> {
    let exe = std::env::current_exe()?;
    let mut command = ProcessCommand::new(exe);
    command
        .arg("daemon")
        .arg("run")
        .stdin(Stdio::null())
        .stdout(Stdio::null())
        .stderr(Stdio::null());
    if let Some(interval) = interval_override {
        command.arg("--interval").arg(interval.to_string());
    }
    #[cfg(unix)]
    {
        use std::os::unix::process::CommandExt;
        // Detach from the controlling terminal and our process group.
        command.process_group(0);
    }
    let child = command.spawn().map_err(|e| TodoError::Daemon {
        reason: format!("failed to spawn daemon: {e}"),
    })?;
    Ok(child.id())
}

/// Read the PID recorded by a (possibly dead) daemon.
#[must_use]
pub fn recorded_pid() -> Option<i32> {
    let path = paths::pid_file().ok()?;
    std::fs::read_to_string(path).ok()?.trim().parse().ok()
}

/// Force-terminate the daemon: SIGTERM, a grace period, then SIGKILL,
/// followed by artifact cleanup.
pub async fn kill_daemon() -> TodoResult<bool> {
    let Some(pid) = recorded_pid() else {
        return Ok(false);
    };
    if !pid_alive(pid) {
        cleanup_artifacts()?;
        return Ok(false);
    }

    // SAFETY: pid was just verified to name a live process we own.
    unsafe { libc::kill(pid, libc::SIGTERM) };
    let deadline = Instant::now() + KILL_GRACE;
    while pid_alive(pid) && Instant::now() < deadline {
        tokio::time::sleep(Duration::from_millis(100)).await;
    }
    if pid_alive(pid) {
        warn!(pid, "daemon ignored SIGTERM, sending SIGKILL");
        // SAFETY: as above.
        unsafe { libc::kill(pid, libc::SIGKILL) };
    }
    cleanup_artifacts()?;
    Ok(true)
}

fn cleanup_artifacts() -> TodoResult<()> {
    for path in [paths::pid_file()?, paths::socket_path()?, paths::heartbeat_file()?] {
        if path.exists() {
            let _ = std::fs::remove_file(path);
        }
    }
    Ok(())
}
