use tracing::{event, Level};

use crate::utils::config::LoggingConfig;

/// Initialise the global tracing subscriber from the logging section.
/// `RUST_LOG` takes precedence over the configured level when set.
pub fn init(config: &LoggingConfig) {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(config.level.clone()));

    if config.format == "json" {
        tracing_subscriber::fmt()
            .with_env_filter(filter)
            .with_target(false)
            .json()
            .init();
    } else {
        tracing_subscriber::fmt()
            .with_env_filter(filter)
            .with_target(false)
            .init();
    }
}

/// Structured logging helpers for sync and queue events.
pub struct SyncLogger;

impl SyncLogger {
    pub fn cycle_started(backend: &str, pull_only: bool) {
        event!(
            Level::INFO,
            backend = backend,
            pull_only = pull_only,
            "sync cycle started"
        );
    }

    pub fn cycle_finished(
        backend: &str,
        pulled: usize,
        pushed: usize,
        conflicts: usize,
        failed: usize,
    ) {
        event!(
            Level::INFO,
            backend = backend,
            pulled = pulled,
            pushed = pushed,
            conflicts = conflicts,
            failed = failed,
            "sync cycle finished"
        );
    }

    pub fn cycle_skipped(backend: &str, reason: &str) {
        event!(
            Level::WARN,
            backend = backend,
            reason = reason,
            "sync cycle skipped"
        );
    }

    pub fn operation_pushed(backend: &str, seq: i64, kind: &str, uid: &str) {
        event!(
            Level::DEBUG,
            backend = backend,
            seq = seq,
            kind = kind,
            uid = uid,
            "operation pushed"
        );
    }

    pub fn operation_failed(backend: &str, seq: i64, retries: u32, error: &str) {
        event!(
            Level::WARN,
            backend = backend,
            seq = seq,
            retries = retries,
            error = error,
            "operation failed"
        );
    }

    pub fn conflict_detected(backend: &str, uid: &str, remote_deleted: bool) {
        event!(
            Level::WARN,
            backend = backend,
            uid = uid,
            remote_deleted = remote_deleted,
            "conflict detected"
        );
    }

    pub fn conflict_resolved(backend: &str, uid: &str, policy: &str) {
        event!(
            Level::INFO,
            backend = backend,
            uid = uid,
            policy = policy,
            "conflict resolved"
        );
    }
}
