use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::models::Task;
use crate::utils::error::{TodoError, TodoResult};

/// Policy applied to a (local, remote) pair that diverged since the last
/// sync baseline.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConflictResolution {
    ServerWins,
    LocalWins,
    Merge,
    KeepBoth,
}

impl ConflictResolution {
    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            ConflictResolution::ServerWins => "server_wins",
            ConflictResolution::LocalWins => "local_wins",
            ConflictResolution::Merge => "merge",
            ConflictResolution::KeepBoth => "keep_both",
        }
    }

    pub fn parse(s: &str) -> TodoResult<Self> {
        match s {
            "server_wins" => Ok(ConflictResolution::ServerWins),
            "local_wins" => Ok(ConflictResolution::LocalWins),
            "merge" => Ok(ConflictResolution::Merge),
            "keep_both" => Ok(ConflictResolution::KeepBoth),
            other => Err(TodoError::Configuration {
                reason: format!("unknown conflict resolution policy: {other}"),
            }),
        }
    }
}

impl Default for ConflictResolution {
    fn default() -> Self {
        ConflictResolution::ServerWins
    }
}

/// Emitted when pull observes a remote change to a UID whose local copy also
/// advanced past the baseline. Lives until a resolver processes it; never
/// silently dropped.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConflictRecord {
    pub id: i64,
    pub uid: String,
    pub list_uid: String,
    /// Local snapshot at detection time.
    pub local: Task,
    /// Remote snapshot at detection time. `None` when the remote side is a
    /// deletion tombstone.
    pub remote: Option<Task>,
    pub detected_at: DateTime<Utc>,
    pub resolution: Option<ConflictResolution>,
}

impl ConflictRecord {
    #[must_use]
    pub fn is_resolved(&self) -> bool {
        self.resolution.is_some()
    }

    #[must_use]
    pub fn remote_deleted(&self) -> bool {
        self.remote.is_none()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn policy_parse_round_trip() {
        for policy in [
            ConflictResolution::ServerWins,
            ConflictResolution::LocalWins,
            ConflictResolution::Merge,
            ConflictResolution::KeepBoth,
        ] {
            assert_eq!(ConflictResolution::parse(policy.as_str()).ok(), Some(policy));
        }
        assert!(ConflictResolution::parse("coin_flip").is_err());
    }
}
