//! Line-oriented IPC between the CLI and the daemon.
//!
//! One text command per request line (`status`, `trigger`, `stop`); the
//! daemon answers with one JSON object per line. Unknown commands get an
//! error object rather than a dropped connection.

use std::collections::BTreeMap;
use std::path::Path;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::UnixStream;
use tokio::time::timeout;

use crate::utils::error::{TodoError, TodoResult};

const IPC_TIMEOUT: Duration = Duration::from_secs(5);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Command {
    Status,
    Trigger,
    Stop,
}

impl Command {
    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            Command::Status => "status",
            Command::Trigger => "trigger",
            Command::Stop => "stop",
        }
    }

    #[must_use]
    pub fn parse(line: &str) -> Option<Self> {
        match line.trim() {
            "status" => Some(Command::Status),
            "trigger" => Some(Command::Trigger),
            "stop" => Some(Command::Stop),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BackendStatus {
    pub circuit: String,
    pub failures: u32,
    pub pending_operations: usize,
    pub failed_operations: usize,
}

/// Payload answered to `status`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StatusResponse {
    pub ok: bool,
    pub pid: u32,
    pub interval_secs: u64,
    pub sync_count: u64,
    pub last_sync: Option<DateTime<Utc>>,
    /// Sorted for stable output.
    pub backends: BTreeMap<String, BackendStatus>,
    pub heartbeat_age_secs: Option<u64>,
    /// False when the heartbeat is older than twice its interval.
    pub healthy: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AckResponse {
    pub ok: bool,
    pub message: String,
}

impl AckResponse {
    #[must_use]
    pub fn ok(message: &str) -> Self {
        Self {
            ok: true,
            message: message.to_string(),
        }
    }

    #[must_use]
    pub fn error(message: &str) -> Self {
        Self {
            ok: false,
            message: message.to_string(),
        }
    }
}

/// CLI-side connection to a running daemon.
pub struct DaemonClient {
    socket_path: std::path::PathBuf,
}

impl DaemonClient {
    #[must_use]
    pub fn new(socket_path: &Path) -> Self {
        Self {
            socket_path: socket_path.to_path_buf(),
        }
    }

    pub async fn send(&self, command: Command) -> TodoResult<serde_json::Value> {
        let io = async {
            let stream = UnixStream::connect(&self.socket_path).await?;
            let (read_half, mut write_half) = stream.into_split();
            write_half
                .write_all(format!("{}\n", command.as_str()).as_bytes())
                .await?;

            let mut line = String::new();
            BufReader::new(read_half).read_line(&mut line).await?;
            Ok::<String, std::io::Error>(line)
        };

        let line = timeout(IPC_TIMEOUT, io)
            .await
            .map_err(|_| TodoError::Daemon {
                reason: format!("daemon did not answer `{}` in time", command.as_str()),
            })?
            .map_err(|e| TodoError::Daemon {
                reason: format!("cannot reach daemon socket: {e}"),
            })?;

        serde_json::from_str(&line).map_err(|e| TodoError::Daemon {
            reason: format!("malformed daemon response: {e}"),
        })
    }

    pub async fn status(&self) -> TodoResult<StatusResponse> {
        let value = self.send(Command::Status).await?;
        Ok(serde_json::from_value(value)?)
    }

    /// Nudge an immediate sync cycle. Best effort by design.
    pub async fn trigger(&self) -> TodoResult<()> {
        self.send(Command::Trigger).await.map(|_| ())
    }

    pub async fn stop(&self) -> TodoResult<()> {
        self.send(Command::Stop).await.map(|_| ())
    }

    /// Whether something is answering on the socket at all.
    pub async fn is_running(&self) -> bool {
        self.status().await.is_ok()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn command_parsing_ignores_whitespace() {
        assert_eq!(Command::parse(" status \n"), Some(Command::Status));
        assert_eq!(Command::parse("trigger"), Some(Command::Trigger));
        assert_eq!(Command::parse("stop"), Some(Command::Stop));
        assert_eq!(Command::parse("reboot"), None);
        assert_eq!(Command::parse(""), None);
    }

    #[test]
    fn status_response_round_trips_as_json() {
        let mut backends = BTreeMap::new();
        backends.insert(
            "work".to_string(),
            BackendStatus {
                circuit: "closed".to_string(),
                failures: 0,
                pending_operations: 2,
                failed_operations: 0,
            },
        );
        let status = StatusResponse {
            ok: true,
            pid: 42,
            interval_secs: 300,
            sync_count: 7,
            last_sync: Some(Utc::now()),
            backends,
            heartbeat_age_secs: Some(3),
            healthy: true,
        };
        let json = serde_json::to_string(&status).unwrap();
        let parsed: StatusResponse = serde_json::from_str(&json).unwrap();
        assert_eq!(parsed.sync_count, 7);
        assert_eq!(parsed.backends["work"].pending_operations, 2);
    }
}
