/// Configuration loading with file and environment precedence
pub mod config;
/// Structured errors shared by every component
pub mod error;
/// Tracing setup and structured event helpers
pub mod logging;
/// XDG-style path resolution for data and runtime artifacts
pub mod paths;

pub use config::{BackendConfig, DaemonConfig, OfflineMode, SyncConfig, TodoConfig};
pub use error::{TodoError, TodoResult};
