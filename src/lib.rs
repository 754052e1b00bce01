//! # todoat
//!
//! Offline-first task manager federating heterogeneous task stores (an
//! embedded relational store, CalDAV servers, REST task APIs, Markdown
//! files) behind one `TaskManager` contract, kept consistent by a
//! per-backend sync engine and a background daemon.
//!
//! Module map:
//!
//! - [`models`]: canonical Task/TaskList entities, operation and conflict
//!   records
//! - [`backends`]: the `TaskManager` trait, capability flags and drivers
//! - [`cache`]: per-backend durable mirror with queue and conflict tables
//! - [`sync`]: operation queue, pull/push/resolve engine, conflict policies
//! - [`daemon`]: single-instance supervisor, socket IPC, circuit breakers
//! - [`dispatch`]: cache-vs-driver routing per offline mode
//! - [`utils`]: configuration, error taxonomy, paths, logging

pub mod backends;
pub mod cache;
pub mod cli;
pub mod daemon;
pub mod dispatch;
pub mod models;
pub mod sync;
pub mod utils;

pub use backends::{CapabilitySet, CredentialFn, TaskManager};
pub use cache::CacheStore;
pub use dispatch::Dispatcher;
pub use models::{Task, TaskList, TaskStatus};
pub use sync::{OperationQueue, SyncEngine, SyncOutcome};
pub use utils::{TodoConfig, TodoError, TodoResult};
