use crate::models::ConflictResolution;
use crate::utils::error::{TodoError, TodoResult};

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::env;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Dispatcher policy for routing calls between cache and live driver.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OfflineMode {
    /// Cache for remote backends, live driver for local ones.
    Auto,
    /// Like auto; never attempts background pulls.
    Offline,
    /// Live driver for everything, bypassing cache and queue.
    Online,
}

impl OfflineMode {
    pub fn parse(s: &str) -> TodoResult<Self> {
        match s {
            "auto" => Ok(OfflineMode::Auto),
            "offline" => Ok(OfflineMode::Offline),
            "online" => Ok(OfflineMode::Online),
            other => Err(TodoError::Configuration {
                reason: format!("unknown offline_mode: {other}"),
            }),
        }
    }
}

impl Default for OfflineMode {
    fn default() -> Self {
        OfflineMode::Auto
    }
}

/// Top-level configuration, loaded from TOML with environment overrides.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct TodoConfig {
    pub sync: SyncConfig,
    pub trash: TrashConfig,
    pub logging: LoggingConfig,
    /// Named backend connections; the key is the backend name used on the
    /// CLI and in cache file names.
    pub backends: HashMap<String, BackendConfig>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SyncConfig {
    /// Turns on cache + queue for remote backends.
    pub enabled: bool,
    pub offline_mode: OfflineMode,
    pub conflict_resolution: ConflictResolution,
    /// Storage kind backing the cache. Currently only "sqlite".
    pub local_backend: String,
    pub connectivity_timeout_secs: u64,
    /// A write through the dispatcher nudges the daemon immediately.
    pub auto_sync_after_operation: bool,
    /// Minimum spacing between read-triggered background pulls. Floor 5s.
    pub background_pull_cooldown_secs: u64,
    pub max_retries: u32,
    pub daemon: DaemonConfig,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            offline_mode: OfflineMode::Auto,
            conflict_resolution: ConflictResolution::ServerWins,
            local_backend: "sqlite".to_string(),
            connectivity_timeout_secs: 5,
            auto_sync_after_operation: true,
            background_pull_cooldown_secs: 30,
            max_retries: 5,
            daemon: DaemonConfig::default(),
        }
    }
}

impl SyncConfig {
    #[must_use]
    pub fn connectivity_timeout(&self) -> Duration {
        Duration::from_secs(self.connectivity_timeout_secs)
    }

    #[must_use]
    pub fn background_pull_cooldown(&self) -> Duration {
        Duration::from_secs(self.background_pull_cooldown_secs.max(5))
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DaemonConfig {
    pub enabled: bool,
    /// Tick period in seconds.
    pub interval_secs: u64,
    /// Auto-exit after this long with no trigger and no needed sync.
    pub idle_timeout_secs: u64,
    /// 0 disables the heartbeat file.
    pub heartbeat_interval_secs: u64,
    /// Recovery threshold for operations stuck in processing.
    pub stuck_timeout_minutes: u64,
    /// Per-operation execution deadline.
    pub task_timeout_secs: u64,
}

impl Default for DaemonConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            interval_secs: 300,
            idle_timeout_secs: 300,
            heartbeat_interval_secs: 60,
            stuck_timeout_minutes: 10,
            task_timeout_secs: 300,
        }
    }
}

impl DaemonConfig {
    #[must_use]
    pub fn interval(&self) -> Duration {
        Duration::from_secs(self.interval_secs)
    }

    #[must_use]
    pub fn idle_timeout(&self) -> Duration {
        Duration::from_secs(self.idle_timeout_secs)
    }

    #[must_use]
    pub fn stuck_timeout(&self) -> Duration {
        Duration::from_secs(self.stuck_timeout_minutes * 60)
    }

    #[must_use]
    pub fn task_timeout(&self) -> Duration {
        Duration::from_secs(self.task_timeout_secs)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TrashConfig {
    /// Days a soft-deleted list is kept before auto-purge; 0 disables.
    pub retention_days: u32,
}

impl Default for TrashConfig {
    fn default() -> Self {
        Self { retention_days: 30 }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    pub level: String,
    /// "pretty" or "json".
    pub format: String,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            format: "pretty".to_string(),
        }
    }
}

/// Connection settings for one named backend.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct BackendConfig {
    /// Driver kind: "sqlite", "markdown", "todoist", "caldav".
    pub kind: String,
    /// Server URL for network drivers.
    pub url: Option<String>,
    pub username: Option<String>,
    /// Key passed to the injected credential lookup function.
    pub credential: Option<String>,
    /// Calendar name for CalDAV.
    pub calendar: Option<String>,
    /// Path for filesystem drivers (markdown directory or sqlite file).
    pub path: Option<PathBuf>,
    /// Extra markdown file candidates tried before the default names.
    pub fallbacks: Vec<String>,
    /// Commit markdown saves when the directory is a git work tree.
    pub git: bool,
}

impl BackendConfig {
    /// Remote backends get a cache + queue; local ones are their own store.
    #[must_use]
    pub fn is_remote(&self) -> bool {
        matches!(self.kind.as_str(), "todoist" | "caldav")
    }
}

impl TodoConfig {
    /// Load configuration with precedence: defaults -> file -> environment.
    pub fn load() -> TodoResult<Self> {
        let mut config = Self::default();

        let path = match env::var("TODOAT_CONFIG_FILE") {
            Ok(p) => Some(PathBuf::from(p)),
            Err(_) => crate::utils::paths::config_file().ok(),
        };
        if let Some(path) = path {
            if path.exists() {
                config = Self::from_file(&path)?;
            }
        }

        config.apply_env_overrides()?;
        config.validate()?;
        Ok(config)
    }

    pub fn from_file<P: AsRef<Path>>(path: P) -> TodoResult<Self> {
        let content = fs::read_to_string(path.as_ref()).map_err(|e| TodoError::Configuration {
            reason: format!("failed to read config file {}: {e}", path.as_ref().display()),
        })?;

        let config: Self = toml::from_str(&content).map_err(|e| TodoError::Configuration {
            reason: format!("failed to parse config file: {e}"),
        })?;
        Ok(config)
    }

    /// Environment variables override file values. Only scalar sync keys are
    /// overridable; backend tables come from the file.
    fn apply_env_overrides(&mut self) -> TodoResult<()> {
        if let Ok(v) = env::var("TODOAT_SYNC_ENABLED") {
            self.sync.enabled = parse_bool("TODOAT_SYNC_ENABLED", &v)?;
        }
        if let Ok(v) = env::var("TODOAT_OFFLINE_MODE") {
            self.sync.offline_mode = OfflineMode::parse(&v)?;
        }
        if let Ok(v) = env::var("TODOAT_CONFLICT_RESOLUTION") {
            self.sync.conflict_resolution = ConflictResolution::parse(&v)?;
        }
        if let Ok(v) = env::var("TODOAT_DAEMON_INTERVAL") {
            self.sync.daemon.interval_secs =
                v.parse().map_err(|e| TodoError::Configuration {
                    reason: format!("TODOAT_DAEMON_INTERVAL: {e}"),
                })?;
        }
        if let Ok(v) = env::var("TODOAT_LOG_LEVEL") {
            self.logging.level = v;
        }
        Ok(())
    }

    pub fn validate(&self) -> TodoResult<()> {
        if self.sync.local_backend != "sqlite" {
            return Err(TodoError::Configuration {
                reason: format!(
                    "unsupported sync.local_backend {:?}; only \"sqlite\" is available",
                    self.sync.local_backend
                ),
            });
        }
        if self.sync.connectivity_timeout_secs == 0 {
            return Err(TodoError::Configuration {
                reason: "sync.connectivity_timeout must be positive".to_string(),
            });
        }
        if self.sync.daemon.interval_secs == 0 {
            return Err(TodoError::Configuration {
                reason: "sync.daemon.interval must be positive".to_string(),
            });
        }
        for (name, backend) in &self.backends {
            match backend.kind.as_str() {
                "sqlite" | "markdown" => {}
                "todoist" => {
                    if backend.credential.is_none() {
                        return Err(TodoError::Configuration {
                            reason: format!("backend {name}: todoist requires a credential key"),
                        });
                    }
                }
                "caldav" => {
                    if backend.url.is_none() {
                        return Err(TodoError::Configuration {
                            reason: format!("backend {name}: caldav requires a url"),
                        });
                    }
                }
                other => {
                    return Err(TodoError::Configuration {
                        reason: format!("backend {name}: unknown kind {other:?}"),
                    });
                }
            }
        }
        Ok(())
    }

    /// Names of configured remote backends, the set the daemon syncs.
    #[must_use]
    pub fn remote_backends(&self) -> Vec<String> {
        let mut names: Vec<String> = self
            .backends
            .iter()
            .filter(|(_, b)| b.is_remote())
            .map(|(name, _)| name.clone())
            .collect();
        names.sort();
        names
    }
}

fn parse_bool(key: &str, v: &str) -> TodoResult<bool> {
    match v {
        "1" | "true" | "yes" => Ok(true),
        "0" | "false" | "no" => Ok(false),
        other => Err(TodoError::Configuration {
            reason: format!("{key}: expected boolean, got {other:?}"),
        }),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_documented_values() {
        let config = TodoConfig::default();
        assert!(!config.sync.enabled);
        assert_eq!(config.sync.offline_mode, OfflineMode::Auto);
        assert_eq!(config.sync.connectivity_timeout_secs, 5);
        assert_eq!(config.sync.background_pull_cooldown_secs, 30);
        assert_eq!(config.sync.max_retries, 5);
        assert_eq!(config.sync.daemon.interval_secs, 300);
        assert_eq!(config.sync.daemon.stuck_timeout_minutes, 10);
        assert_eq!(config.sync.daemon.task_timeout_secs, 300);
        assert_eq!(config.trash.retention_days, 30);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn cooldown_is_floored_at_five_seconds() {
        let mut config = TodoConfig::default();
        config.sync.background_pull_cooldown_secs = 1;
        assert_eq!(
            config.sync.background_pull_cooldown(),
            Duration::from_secs(5)
        );
    }

    #[test]
    fn parses_backend_tables_from_toml() {
        let toml = r#"
            [sync]
            enabled = true
            conflict_resolution = "merge"

            [backends.work]
            kind = "caldav"
            url = "https://cloud.example.com/remote.php/dav"
            username = "me"
            credential = "caldav-work"

            [backends.notes]
            kind = "markdown"
            path = "/home/me/notes"
            git = true
        "#;
        let config: TodoConfig = toml::from_str(toml).unwrap();
        assert!(config.sync.enabled);
        assert_eq!(
            config.sync.conflict_resolution,
            ConflictResolution::Merge
        );
        assert_eq!(config.backends.len(), 2);
        assert!(config.backends["work"].is_remote());
        assert!(!config.backends["notes"].is_remote());
        assert!(config.validate().is_ok());
        assert_eq!(config.remote_backends(), vec!["work".to_string()]);
    }

    #[test]
    fn validate_rejects_unknown_kind_and_missing_credential() {
        let mut config = TodoConfig::default();
        config.backends.insert(
            "x".to_string(),
            BackendConfig {
                kind: "carrier-pigeon".to_string(),
                ..BackendConfig::default()
            },
        );
        assert!(config.validate().is_err());

        config.backends.clear();
        config.backends.insert(
            "t".to_string(),
            BackendConfig {
                kind: "todoist".to_string(),
                ..BackendConfig::default()
            },
        );
        assert!(config.validate().is_err());
    }
}
