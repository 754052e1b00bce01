//! Offline-first synchronization: the per-backend pull -> resolve -> push
//! pipeline, the durable operation queue it drains, and the conflict
//! resolution policies.

pub mod conflict;
pub mod engine;
pub mod queue;

pub use conflict::{resolve, PushAction, ResolutionOutcome};
pub use engine::{SyncEngine, SyncOutcome};
pub use queue::{OperationQueue, QueueStats};
