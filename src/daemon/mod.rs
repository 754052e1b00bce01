//! Background daemon: single-instance supervisor, socket IPC and
//! per-backend circuit breakers.

pub mod breaker;
pub mod ipc;
pub mod supervisor;

pub use breaker::{CircuitBreaker, CircuitState};
pub use ipc::{Command, DaemonClient, StatusResponse};
pub use supervisor::{kill_daemon, pid_alive, recorded_pid, spawn_detached, Supervisor};
