use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::utils::error::{TodoError, TodoResult};

/// Prefix for UIDs assigned by the cache before the remote has seen the
/// task. Replaced with the remote-assigned UID on first successful push.
pub const LOCAL_UID_PREFIX: &str = "local-";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum TaskStatus {
    NeedsAction,
    InProgress,
    Completed,
    Cancelled,
}

impl TaskStatus {
    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            TaskStatus::NeedsAction => "needs-action",
            TaskStatus::InProgress => "in-progress",
            TaskStatus::Completed => "completed",
            TaskStatus::Cancelled => "cancelled",
        }
    }

    pub fn parse(s: &str) -> TodoResult<Self> {
        match s {
            "needs-action" => Ok(TaskStatus::NeedsAction),
            "in-progress" => Ok(TaskStatus::InProgress),
            "completed" => Ok(TaskStatus::Completed),
            "cancelled" => Ok(TaskStatus::Cancelled),
            other => Err(TodoError::CacheError {
                operation: "parse_status".to_string(),
                reason: format!("unknown task status: {other}"),
            }),
        }
    }

    #[must_use]
    pub fn is_done(&self) -> bool {
        matches!(self, TaskStatus::Completed | TaskStatus::Cancelled)
    }
}

impl Default for TaskStatus {
    fn default() -> Self {
        TaskStatus::NeedsAction
    }
}

/// A unit of work, scoped to one list within one backend.
///
/// `uid` is opaque and backend-assigned; tasks created locally carry a
/// `local-` placeholder until the first push succeeds. `modified` is
/// monotonically non-decreasing per UID within one backend.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Task {
    pub uid: String,
    pub list_uid: String,
    pub summary: String,
    pub description: String,
    pub status: TaskStatus,
    /// 0 = unset, 1 = highest, 9 = lowest.
    pub priority: u8,
    pub due: Option<DateTime<Utc>>,
    pub start: Option<DateTime<Utc>>,
    pub completed: Option<DateTime<Utc>>,
    pub categories: Vec<String>,
    pub parent_uid: Option<String>,
    pub created: DateTime<Utc>,
    pub modified: DateTime<Utc>,
    /// RRULE text, passed through untouched.
    pub recurrence: Option<String>,
    /// Short numeric handle issued by the cache for CLI ergonomics.
    pub local_id: Option<i64>,
}

impl Task {
    #[must_use]
    pub fn new(list_uid: impl Into<String>, summary: impl Into<String>) -> Self {
        let now = Utc::now();
        Self {
            uid: format!("{LOCAL_UID_PREFIX}{}", Uuid::new_v4()),
            list_uid: list_uid.into(),
            summary: summary.into(),
            description: String::new(),
            status: TaskStatus::NeedsAction,
            priority: 0,
            due: None,
            start: None,
            completed: None,
            categories: Vec::new(),
            parent_uid: None,
            created: now,
            modified: now,
            recurrence: None,
            local_id: None,
        }
    }

    #[must_use]
    pub fn with_priority(mut self, priority: u8) -> Self {
        self.priority = priority.min(9);
        self
    }

    #[must_use]
    pub fn with_due(mut self, due: DateTime<Utc>) -> Self {
        self.due = Some(due);
        self
    }

    #[must_use]
    pub fn with_parent(mut self, parent_uid: impl Into<String>) -> Self {
        self.parent_uid = Some(parent_uid.into());
        self
    }

    #[must_use]
    pub fn has_placeholder_uid(&self) -> bool {
        self.uid.starts_with(LOCAL_UID_PREFIX)
    }

    /// Transition status, keeping the completed timestamp invariant: it is
    /// set iff status == Completed.
    pub fn set_status(&mut self, status: TaskStatus, now: DateTime<Utc>) {
        self.status = status;
        self.completed = match status {
            TaskStatus::Completed => Some(self.completed.unwrap_or(now)),
            _ => None,
        };
        self.touch(now);
    }

    /// Bump `modified`, never letting it move backwards.
    pub fn touch(&mut self, now: DateTime<Utc>) {
        if now > self.modified {
            self.modified = now;
        }
    }

    #[must_use]
    pub fn categories_joined(&self) -> String {
        self.categories.join(",")
    }

    #[must_use]
    pub fn categories_from_joined(joined: &str) -> Vec<String> {
        joined
            .split(',')
            .map(str::trim)
            .filter(|s| !s.is_empty())
            .map(str::to_string)
            .collect()
    }

    /// Structural validation applied before any store accepts the task.
    pub fn validate(&self) -> TodoResult<()> {
        if self.summary.trim().is_empty() {
            return Err(TodoError::InvalidInput {
                field: "summary".to_string(),
                reason: "summary must not be empty".to_string(),
            });
        }
        if self.priority > 9 {
            return Err(TodoError::InvalidInput {
                field: "priority".to_string(),
                reason: format!("priority {} out of range 0..=9", self.priority),
            });
        }
        if let (Some(start), Some(due)) = (self.start, self.due) {
            if start > due {
                return Err(TodoError::InvalidInput {
                    field: "start".to_string(),
                    reason: "start must not be after due".to_string(),
                });
            }
        }
        if self.completed.is_some() != (self.status == TaskStatus::Completed) {
            return Err(TodoError::InvalidInput {
                field: "completed".to_string(),
                reason: "completed timestamp is set iff status is completed".to_string(),
            });
        }
        if let Some(parent) = &self.parent_uid {
            if parent == &self.uid {
                return Err(TodoError::InvalidInput {
                    field: "parent_uid".to_string(),
                    reason: "task cannot be its own parent".to_string(),
                });
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn new_task_gets_placeholder_uid_and_defaults() {
        let task = Task::new("list-1", "Buy milk");
        assert!(task.has_placeholder_uid());
        assert_eq!(task.status, TaskStatus::NeedsAction);
        assert_eq!(task.priority, 0);
        assert!(task.completed.is_none());
        assert!(task.validate().is_ok());
    }

    #[test]
    fn set_status_keeps_completed_invariant() {
        let mut task = Task::new("list-1", "Buy milk");
        let now = Utc::now();
        task.set_status(TaskStatus::Completed, now);
        assert_eq!(task.completed, Some(now));
        assert!(task.validate().is_ok());

        task.set_status(TaskStatus::NeedsAction, now);
        assert!(task.completed.is_none());
        assert!(task.validate().is_ok());
    }

    #[test]
    fn touch_never_moves_modified_backwards() {
        let mut task = Task::new("list-1", "Buy milk");
        let before = task.modified - chrono::Duration::seconds(10);
        task.touch(before);
        assert!(task.modified > before);
    }

    #[test]
    fn validate_rejects_empty_summary_and_bad_ranges() {
        let mut task = Task::new("list-1", "  ");
        assert!(task.validate().is_err());

        task.summary = "ok".to_string();
        task.start = Some(Utc::now());
        task.due = Some(Utc::now() - chrono::Duration::hours(1));
        assert!(task.validate().is_err());
    }

    #[test]
    fn categories_round_trip_through_joined_form() {
        let mut task = Task::new("list-1", "t");
        task.categories = vec!["home".to_string(), "urgent".to_string()];
        let joined = task.categories_joined();
        assert_eq!(Task::categories_from_joined(&joined), task.categories);
        assert!(Task::categories_from_joined("").is_empty());
    }
}
