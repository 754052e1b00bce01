//! Canonical entities shared by every backend driver, the cache and the
//! sync engine.

pub mod conflict;
pub mod list;
pub mod operation;
pub mod task;

pub use conflict::{ConflictRecord, ConflictResolution};
pub use list::TaskList;
pub use operation::{OperationKind, OperationRecord, OperationState};
pub use task::{Task, TaskStatus};
