use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Error taxonomy for todoat.
///
/// Every boundary in the system returns one of these kinds rather than a
/// bare string; the sync engine and queue dispatch on `is_transient()` to
/// decide between backoff-retry and terminal failure.
#[derive(Error, Debug, Clone, Serialize, Deserialize)]
pub enum TodoError {
    /// List or task absent; surfaced to the caller.
    #[error("Not found: {resource}")]
    NotFound { resource: String },

    /// Simultaneous local and remote change; produces a conflict record and
    /// never aborts a sync cycle.
    #[error("Conflict on {uid} in list {list_uid}")]
    Conflict { uid: String, list_uid: String },

    /// The driver lacks the capability; skipped with a warning.
    #[error("Operation not supported by backend {backend}: {operation}")]
    Unsupported { backend: String, operation: String },

    /// Timeouts, 5xx, 429. Retried with backoff; counted by the circuit
    /// breaker.
    #[error("Transient IO error: {operation}, reason: {reason}")]
    TransientIo { operation: String, reason: String },

    /// 4xx except 429. The queue record terminates as failed.
    #[error("Permanent IO error: {operation}, reason: {reason}")]
    PermanentIo { operation: String, reason: String },

    /// Invalid or expired credentials. Transient once (refresh), then
    /// permanent.
    #[error("Authentication failed for backend {backend}: {reason}")]
    Auth { backend: String, reason: String },

    /// Local storage failure. Aborts the current operation; the cache is
    /// left consistent via transaction rollback.
    #[error("Cache error: {operation}, reason: {reason}")]
    CacheError { operation: String, reason: String },

    #[error("Invalid input: {field} - {reason}")]
    InvalidInput { field: String, reason: String },

    #[error("Configuration error: {reason}")]
    Configuration { reason: String },

    /// Daemon lifecycle and IPC failures.
    #[error("Daemon error: {reason}")]
    Daemon { reason: String },

    #[error("Operation timed out: {operation} after {duration_ms}ms")]
    Timeout { operation: String, duration_ms: u64 },
}

impl TodoError {
    /// Whether a retry with backoff is worthwhile.
    #[must_use]
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            TodoError::TransientIo { .. } | TodoError::Timeout { .. } | TodoError::Auth { .. }
        )
    }

    #[must_use]
    pub fn is_not_found(&self) -> bool {
        matches!(self, TodoError::NotFound { .. })
    }

    /// A short hint shown to CLI users under the error message, when one
    /// exists for the kind.
    #[must_use]
    pub fn suggestion(&self) -> Option<&'static str> {
        match self {
            TodoError::Auth { .. } => {
                Some("check the backend credentials and re-run `todoat sync now`")
            }
            TodoError::TransientIo { .. } | TodoError::Timeout { .. } => {
                Some("the backend looks unreachable; changes are queued and will sync later")
            }
            TodoError::Unsupported { .. } => {
                Some("this backend does not support the feature; it was skipped")
            }
            TodoError::Configuration { .. } => Some("run `todoat config path` to locate the file"),
            _ => None,
        }
    }

    /// Map an HTTP-level failure to the taxonomy.
    #[must_use]
    pub fn from_http_status(operation: &str, status: u16, body: &str) -> Self {
        match status {
            401 | 403 => TodoError::Auth {
                backend: operation.to_string(),
                reason: format!("HTTP {status}: {body}"),
            },
            404 => TodoError::NotFound {
                resource: operation.to_string(),
            },
            429 => TodoError::TransientIo {
                operation: operation.to_string(),
                reason: format!("HTTP 429: {body}"),
            },
            400..=499 => TodoError::PermanentIo {
                operation: operation.to_string(),
                reason: format!("HTTP {status}: {body}"),
            },
            _ => TodoError::TransientIo {
                operation: operation.to_string(),
                reason: format!("HTTP {status}: {body}"),
            },
        }
    }
}

impl From<rusqlite::Error> for TodoError {
    fn from(err: rusqlite::Error) -> Self {
        match err {
            rusqlite::Error::QueryReturnedNoRows => TodoError::NotFound {
                resource: "row".to_string(),
            },
            other => TodoError::CacheError {
                operation: "sqlite".to_string(),
                reason: other.to_string(),
            },
        }
    }
}

impl From<reqwest::Error> for TodoError {
    fn from(err: reqwest::Error) -> Self {
        let operation = err
            .url()
            .map_or_else(|| "http".to_string(), |u| u.path().to_string());
        if let Some(status) = err.status() {
            TodoError::from_http_status(&operation, status.as_u16(), &err.to_string())
        } else {
            // Connect errors, timeouts, body failures: all worth retrying.
            TodoError::TransientIo {
                operation,
                reason: err.to_string(),
            }
        }
    }
}

impl From<std::io::Error> for TodoError {
    fn from(err: std::io::Error) -> Self {
        TodoError::CacheError {
            operation: "io".to_string(),
            reason: err.to_string(),
        }
    }
}

impl From<serde_json::Error> for TodoError {
    fn from(err: serde_json::Error) -> Self {
        TodoError::CacheError {
            operation: "serialize".to_string(),
            reason: err.to_string(),
        }
    }
}

/// Result type alias used throughout the crate.
pub type TodoResult<T> = Result<T, TodoError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn transient_classification_follows_the_failure_policy() {
        assert!(TodoError::TransientIo {
            operation: "pull".into(),
            reason: "timeout".into()
        }
        .is_transient());
        assert!(TodoError::Auth {
            backend: "todoist".into(),
            reason: "expired".into()
        }
        .is_transient());
        assert!(!TodoError::PermanentIo {
            operation: "push".into(),
            reason: "400".into()
        }
        .is_transient());
        assert!(!TodoError::NotFound {
            resource: "list".into()
        }
        .is_transient());
    }

    #[test]
    fn http_status_mapping() {
        assert!(matches!(
            TodoError::from_http_status("op", 429, ""),
            TodoError::TransientIo { .. }
        ));
        assert!(matches!(
            TodoError::from_http_status("op", 503, ""),
            TodoError::TransientIo { .. }
        ));
        assert!(matches!(
            TodoError::from_http_status("op", 400, ""),
            TodoError::PermanentIo { .. }
        ));
        assert!(matches!(
            TodoError::from_http_status("op", 401, ""),
            TodoError::Auth { .. }
        ));
        assert!(matches!(
            TodoError::from_http_status("op", 404, ""),
            TodoError::NotFound { .. }
        ));
    }
}
