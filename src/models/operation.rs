use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::utils::error::{TodoError, TodoResult};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OperationKind {
    CreateList,
    UpdateList,
    DeleteList,
    CreateTask,
    UpdateTask,
    DeleteTask,
}

impl OperationKind {
    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            OperationKind::CreateList => "create_list",
            OperationKind::UpdateList => "update_list",
            OperationKind::DeleteList => "delete_list",
            OperationKind::CreateTask => "create_task",
            OperationKind::UpdateTask => "update_task",
            OperationKind::DeleteTask => "delete_task",
        }
    }

    pub fn parse(s: &str) -> TodoResult<Self> {
        match s {
            "create_list" => Ok(OperationKind::CreateList),
            "update_list" => Ok(OperationKind::UpdateList),
            "delete_list" => Ok(OperationKind::DeleteList),
            "create_task" => Ok(OperationKind::CreateTask),
            "update_task" => Ok(OperationKind::UpdateTask),
            "delete_task" => Ok(OperationKind::DeleteTask),
            other => Err(TodoError::CacheError {
                operation: "parse_operation_kind".to_string(),
                reason: format!("unknown operation kind: {other}"),
            }),
        }
    }

    #[must_use]
    pub fn is_create(&self) -> bool {
        matches!(self, OperationKind::CreateList | OperationKind::CreateTask)
    }

    #[must_use]
    pub fn targets_list(&self) -> bool {
        matches!(
            self,
            OperationKind::CreateList | OperationKind::UpdateList | OperationKind::DeleteList
        )
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OperationState {
    Pending,
    Processing,
    Done,
    Failed,
}

impl OperationState {
    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            OperationState::Pending => "pending",
            OperationState::Processing => "processing",
            OperationState::Done => "done",
            OperationState::Failed => "failed",
        }
    }

    pub fn parse(s: &str) -> TodoResult<Self> {
        match s {
            "pending" => Ok(OperationState::Pending),
            "processing" => Ok(OperationState::Processing),
            "done" => Ok(OperationState::Done),
            "failed" => Ok(OperationState::Failed),
            other => Err(TodoError::CacheError {
                operation: "parse_operation_state".to_string(),
                reason: format!("unknown operation state: {other}"),
            }),
        }
    }

    #[must_use]
    pub fn is_terminal(&self) -> bool {
        matches!(self, OperationState::Done | OperationState::Failed)
    }
}

/// One queued mutation, recorded in the same transaction as the cache write
/// that produced it. Replayed against the remote in FIFO `seq` order.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OperationRecord {
    /// Strictly increasing per backend; assigned by the cache store.
    pub seq: i64,
    pub backend: String,
    pub kind: OperationKind,
    /// UID the operation targets. For creates this is the client-assigned
    /// placeholder that push rewrites on success.
    pub target_uid: String,
    pub list_uid: String,
    /// Serialized entity snapshot at enqueue time.
    pub payload: serde_json::Value,
    pub state: OperationState,
    pub retries: u32,
    pub last_error: Option<String>,
    pub enqueued_at: DateTime<Utc>,
    pub claimed_at: Option<DateTime<Utc>>,
    /// "pid:nonce" of the worker holding the claim.
    pub worker_id: Option<String>,
}

impl OperationRecord {
    /// Worker identifier for the current process.
    #[must_use]
    pub fn worker_token(nonce: &str) -> String {
        format!("{}:{nonce}", std::process::id())
    }

    /// Extract the pid half of a worker token, if parseable.
    #[must_use]
    pub fn worker_pid(worker_id: &str) -> Option<i32> {
        worker_id.split(':').next()?.parse().ok()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn kind_and_state_round_trip_through_strings() {
        for kind in [
            OperationKind::CreateList,
            OperationKind::UpdateList,
            OperationKind::DeleteList,
            OperationKind::CreateTask,
            OperationKind::UpdateTask,
            OperationKind::DeleteTask,
        ] {
            assert_eq!(OperationKind::parse(kind.as_str()).ok(), Some(kind));
        }
        for state in [
            OperationState::Pending,
            OperationState::Processing,
            OperationState::Done,
            OperationState::Failed,
        ] {
            assert_eq!(OperationState::parse(state.as_str()).ok(), Some(state));
        }
        assert!(OperationKind::parse("drop_table").is_err());
    }

    #[test]
    fn worker_token_carries_current_pid() {
        let token = OperationRecord::worker_token("abc123");
        assert_eq!(
            OperationRecord::worker_pid(&token),
            Some(std::process::id() as i32)
        );
    }
}
