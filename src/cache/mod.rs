//! Durable per-backend mirror of a remote task store.
//!
//! One database file per remote backend holds the mirrored `lists` and
//! `tasks`, the operation queue, unresolved conflicts and sync metadata.
//! The store exposes the `TaskManager` contract so dispatcher callers
//! cannot tell it apart from a live driver.

pub mod store;

pub use store::CacheStore;
