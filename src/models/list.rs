use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::models::task::LOCAL_UID_PREFIX;
use crate::utils::error::{TodoError, TodoResult};

/// A container of tasks. Names are unique per backend, case-insensitively.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct TaskList {
    pub uid: String,
    pub name: String,
    pub description: String,
    /// `#RRGGBB` or empty.
    pub color: String,
    pub modified: DateTime<Utc>,
    /// Soft-delete marker, cache only. Backends without trash never set it.
    pub deleted_at: Option<DateTime<Utc>>,
}

impl TaskList {
    #[must_use]
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            uid: format!("{LOCAL_UID_PREFIX}{}", Uuid::new_v4()),
            name: name.into(),
            description: String::new(),
            color: String::new(),
            modified: Utc::now(),
            deleted_at: None,
        }
    }

    #[must_use]
    pub fn has_placeholder_uid(&self) -> bool {
        self.uid.starts_with(LOCAL_UID_PREFIX)
    }

    #[must_use]
    pub fn name_matches(&self, other: &str) -> bool {
        self.name.eq_ignore_ascii_case(other)
    }

    pub fn validate(&self) -> TodoResult<()> {
        if self.name.trim().is_empty() {
            return Err(TodoError::InvalidInput {
                field: "name".to_string(),
                reason: "list name must not be empty".to_string(),
            });
        }
        if !self.color.is_empty() && !is_hex_color(&self.color) {
            return Err(TodoError::InvalidInput {
                field: "color".to_string(),
                reason: format!("color {:?} is not #RRGGBB", self.color),
            });
        }
        Ok(())
    }
}

fn is_hex_color(s: &str) -> bool {
    s.len() == 7
        && s.starts_with('#')
        && s.chars().skip(1).all(|c| c.is_ascii_hexdigit())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn name_matching_is_case_insensitive() {
        let list = TaskList::new("Work");
        assert!(list.name_matches("work"));
        assert!(list.name_matches("WORK"));
        assert!(!list.name_matches("home"));
    }

    #[test]
    fn color_validation() {
        let mut list = TaskList::new("Work");
        assert!(list.validate().is_ok());
        list.color = "#00ff00".to_string();
        assert!(list.validate().is_ok());
        list.color = "green".to_string();
        assert!(list.validate().is_err());
        list.color = "#00ff0".to_string();
        assert!(list.validate().is_err());
    }
}
