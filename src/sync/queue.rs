//! FIFO journal of pending mutations for one backend.
//!
//! The queue is a table inside the backend's cache database and shares its
//! locking. A record is claimed by an atomic `pending -> processing`
//! transition stamping the claim time and worker token; a claimed record is
//! exclusively owned by that worker until it transitions again.

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use rusqlite::{params, Connection, OptionalExtension, Row, TransactionBehavior};
use tokio::sync::Mutex;
use tracing::{info, warn};

use crate::models::{OperationKind, OperationRecord, OperationState};
use crate::utils::error::TodoResult;

#[derive(Clone)]
pub struct OperationQueue {
    connection: Arc<Mutex<Connection>>,
    backend: String,
}

/// Counts surfaced by `sync status`.
#[derive(Debug, Clone, Default, PartialEq, Eq, serde::Serialize)]
pub struct QueueStats {
    pub pending: usize,
    pub processing: usize,
    pub done: usize,
    pub failed: usize,
}

impl OperationQueue {
    #[must_use]
    pub fn new(connection: Arc<Mutex<Connection>>, backend: &str) -> Self {
        Self {
            connection,
            backend: backend.to_string(),
        }
    }

    #[must_use]
    pub fn backend_name(&self) -> &str {
        &self.backend
    }

    fn row_to_record(row: &Row<'_>) -> rusqlite::Result<OperationRecord> {
        let kind: String = row.get("kind")?;
        let state: String = row.get("state")?;
        let payload: String = row.get("payload")?;
        Ok(OperationRecord {
            seq: row.get("seq")?,
            backend: row.get("backend")?,
            kind: OperationKind::parse(&kind).unwrap_or(OperationKind::UpdateTask),
            target_uid: row.get("target_uid")?,
            list_uid: row.get("list_uid")?,
            payload: serde_json::from_str(&payload).unwrap_or(serde_json::Value::Null),
            state: OperationState::parse(&state).unwrap_or(OperationState::Pending),
            retries: row.get::<_, i64>("retries")? as u32,
            last_error: row.get("last_error")?,
            enqueued_at: row.get("enqueued_at")?,
            claimed_at: row.get("claimed_at")?,
            worker_id: row.get("worker_id")?,
        })
    }

    /// Pending records in FIFO order.
    pub async fn pending(&self) -> TodoResult<Vec<OperationRecord>> {
        self.by_state(OperationState::Pending).await
    }

    pub async fn failed(&self) -> TodoResult<Vec<OperationRecord>> {
        self.by_state(OperationState::Failed).await
    }

    async fn by_state(&self, state: OperationState) -> TodoResult<Vec<OperationRecord>> {
        let conn = self.connection.lock().await;
        let mut stmt = conn.prepare(
            "SELECT * FROM operations WHERE backend = ?1 AND state = ?2 ORDER BY seq",
        )?;
        let records = stmt
            .query_map(params![self.backend, state.as_str()], Self::row_to_record)?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(records)
    }

    pub async fn stats(&self) -> TodoResult<QueueStats> {
        let conn = self.connection.lock().await;
        let mut stmt = conn.prepare(
            "SELECT state, COUNT(*) FROM operations WHERE backend = ?1 GROUP BY state",
        )?;
        let rows: Vec<(String, i64)> = stmt
            .query_map(params![self.backend], |r| Ok((r.get(0)?, r.get(1)?)))?
            .collect::<Result<Vec<_>, _>>()?;

        let mut stats = QueueStats::default();
        for (state, count) in rows {
            let count = count as usize;
            match state.as_str() {
                "pending" => stats.pending = count,
                "processing" => stats.processing = count,
                "done" => stats.done = count,
                "failed" => stats.failed = count,
                _ => {}
            }
        }
        Ok(stats)
    }

    /// Atomically claim the oldest pending record for this worker.
    ///
    /// Returns `None` when the queue has no pending work.
    pub async fn claim_next(&self, worker_id: &str) -> TodoResult<Option<OperationRecord>> {
        let mut conn = self.connection.lock().await;
        let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;

        let next_seq: Option<i64> = tx
            .query_row(
                "SELECT seq FROM operations
                 WHERE backend = ?1 AND state = 'pending' ORDER BY seq LIMIT 1",
                params![self.backend],
                |r| r.get(0),
            )
            .optional()?;
        let Some(seq) = next_seq else {
            return Ok(None);
        };

        tx.execute(
            "UPDATE operations SET state = 'processing', claimed_at = ?2, worker_id = ?3
             WHERE seq = ?1 AND state = 'pending'",
            params![seq, Utc::now(), worker_id],
        )?;
        let record = tx.query_row(
            "SELECT * FROM operations WHERE seq = ?1",
            params![seq],
            Self::row_to_record,
        )?;
        tx.commit()?;
        Ok(Some(record))
    }

    /// `processing -> done` after a successful push.
    pub async fn complete(&self, seq: i64) -> TodoResult<()> {
        let conn = self.connection.lock().await;
        conn.execute(
            "UPDATE operations SET state = 'done', last_error = NULL
             WHERE seq = ?1 AND state = 'processing'",
            params![seq],
        )?;
        Ok(())
    }

    /// Record a failure: back to `pending` with the retry counter bumped,
    /// or terminally `failed` once `max_retries` is reached. Later records
    /// are never blocked by a failed one.
    pub async fn fail(&self, seq: i64, error: &str, max_retries: u32) -> TodoResult<OperationState> {
        let mut conn = self.connection.lock().await;
        let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;

        let retries: i64 = tx.query_row(
            "SELECT retries FROM operations WHERE seq = ?1",
            params![seq],
            |r| r.get(0),
        )?;
        let retries = retries as u32 + 1;
        let state = if retries >= max_retries {
            OperationState::Failed
        } else {
            OperationState::Pending
        };

        tx.execute(
            "UPDATE operations
             SET state = ?2, retries = ?3, last_error = ?4, claimed_at = NULL, worker_id = NULL
             WHERE seq = ?1",
            params![seq, state.as_str(), i64::from(retries), error],
        )?;
        tx.commit()?;

        if state == OperationState::Failed {
            warn!(
                backend = %self.backend,
                seq,
                retries,
                error,
                "operation terminally failed"
            );
        }
        Ok(state)
    }

    /// Permanently fail a record regardless of its retry budget.
    pub async fn fail_permanently(&self, seq: i64, error: &str) -> TodoResult<()> {
        let conn = self.connection.lock().await;
        conn.execute(
            "UPDATE operations
             SET state = 'failed', last_error = ?2, claimed_at = NULL, worker_id = NULL
             WHERE seq = ?1",
            params![seq, error],
        )?;
        Ok(())
    }

    /// Return `processing` rows older than `stuck_timeout` whose claiming
    /// worker is gone back to `pending`. Called by the daemon each tick and
    /// on startup after a crash.
    pub async fn reset_stuck<F>(&self, stuck_timeout: Duration, worker_alive: F) -> TodoResult<usize>
    where
        F: Fn(&str) -> bool,
    {
        let cutoff = Utc::now()
            - chrono::Duration::from_std(stuck_timeout).unwrap_or_else(|_| chrono::Duration::minutes(10));

        let mut conn = self.connection.lock().await;
        let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
        let stuck: Vec<(i64, Option<String>)> = {
            let mut stmt = tx.prepare(
                "SELECT seq, worker_id FROM operations
                 WHERE backend = ?1 AND state = 'processing' AND claimed_at < ?2",
            )?;
            let rows = stmt
                .query_map(params![self.backend, cutoff], |r| {
                    Ok((r.get(0)?, r.get(1)?))
                })?
                .collect::<Result<Vec<_>, _>>()?;
            rows
        };

        let mut reset = 0;
        for (seq, worker_id) in stuck {
            // A live worker may legitimately still hold the claim.
            if worker_id.as_deref().is_some_and(&worker_alive) {
                continue;
            }
            tx.execute(
                "UPDATE operations
                 SET state = 'pending', claimed_at = NULL, worker_id = NULL
                 WHERE seq = ?1 AND state = 'processing'",
                params![seq],
            )?;
            reset += 1;
        }
        tx.commit()?;

        if reset > 0 {
            info!(backend = %self.backend, reset, "stuck operations recovered");
        }
        Ok(reset)
    }

    /// Retire pending mutations for a UID whose local edit was discarded by
    /// conflict resolution; pushing them would resurrect the losing side.
    pub async fn cancel_for(&self, uid: &str) -> TodoResult<usize> {
        let conn = self.connection.lock().await;
        let changed = conn.execute(
            "UPDATE operations
             SET state = 'done', last_error = 'superseded by conflict resolution'
             WHERE backend = ?1 AND target_uid = ?2 AND state IN ('pending', 'processing')",
            params![self.backend, uid],
        )?;
        Ok(changed)
    }

    /// Retire the create operation for a UID whose row was adopted from the
    /// remote by the pull-side dedup (the create already happened there).
    pub async fn complete_create_for(&self, uid: &str) -> TodoResult<usize> {
        let conn = self.connection.lock().await;
        let changed = conn.execute(
            "UPDATE operations SET state = 'done'
             WHERE backend = ?1 AND target_uid = ?2 AND kind = 'create_task'
               AND state IN ('pending', 'processing')",
            params![self.backend, uid],
        )?;
        Ok(changed)
    }

    /// Empty the queue, discarding unsynced changes.
    pub async fn clear(&self) -> TodoResult<usize> {
        let conn = self.connection.lock().await;
        let removed = conn.execute(
            "DELETE FROM operations WHERE backend = ?1",
            params![self.backend],
        )?;
        Ok(removed)
    }
}
