//! Resolution of configuration, data and runtime locations.
//!
//! Follows the XDG base-directory layout with user-home fallbacks. Runtime
//! artifacts (daemon PID file, socket, heartbeat) prefer
//! `$XDG_RUNTIME_DIR/todoat/`; when that is unavailable they land in the
//! system temp directory under a per-uid directory name so concurrent users
//! cannot collide.

use std::env;
use std::fs;
use std::path::PathBuf;

use crate::utils::error::{TodoError, TodoResult};

const APP_DIR: &str = "todoat";

fn uid() -> u32 {
    // SAFETY: getuid has no failure modes.
    unsafe { libc::getuid() }
}

pub fn config_file() -> TodoResult<PathBuf> {
    let base = match env::var_os("XDG_CONFIG_HOME") {
        Some(dir) if !dir.is_empty() => PathBuf::from(dir),
        _ => dirs::config_dir().ok_or_else(|| TodoError::Configuration {
            reason: "cannot determine config directory".to_string(),
        })?,
    };
    Ok(base.join(APP_DIR).join("config.toml"))
}

pub fn data_dir() -> TodoResult<PathBuf> {
    let base = match env::var_os("XDG_DATA_HOME") {
        Some(dir) if !dir.is_empty() => PathBuf::from(dir),
        _ => dirs::data_dir().ok_or_else(|| TodoError::Configuration {
            reason: "cannot determine data directory".to_string(),
        })?,
    };
    let dir = base.join(APP_DIR);
    fs::create_dir_all(&dir)?;
    Ok(dir)
}

/// Cache database for one remote backend: `caches/<backend>.db`.
pub fn cache_db_path(backend: &str) -> TodoResult<PathBuf> {
    let dir = data_dir()?.join("caches");
    fs::create_dir_all(&dir)?;
    Ok(dir.join(format!("{backend}.db")))
}

/// Per-user runtime directory holding the daemon PID file, socket and
/// heartbeat. Created on first use.
pub fn runtime_dir() -> TodoResult<PathBuf> {
    let dir = match env::var_os("XDG_RUNTIME_DIR") {
        Some(base) if !base.is_empty() => PathBuf::from(base).join(APP_DIR),
        _ => env::temp_dir().join(format!("{APP_DIR}-{}", uid())),
    };
    fs::create_dir_all(&dir)?;
    Ok(dir)
}

pub fn pid_file() -> TodoResult<PathBuf> {
    Ok(runtime_dir()?.join("daemon.pid"))
}

pub fn socket_path() -> TodoResult<PathBuf> {
    Ok(runtime_dir()?.join("daemon.sock"))
}

pub fn heartbeat_file() -> TodoResult<PathBuf> {
    Ok(runtime_dir()?.join("daemon.heartbeat"))
}
