//! Dispatcher: picks the cache or the live driver for each call.
//!
//! Remote backends are served from their cache under `auto`/`offline` (with
//! read-triggered background pulls under `auto`), and from the live driver
//! under `online`. Purely local backends are always their own store. All
//! state here is constructed values; there are no hidden singletons.

use std::sync::Arc;
use std::time::{Duration, Instant};

use dashmap::DashMap;
use tokio::sync::Mutex;
use tracing::{debug, warn};

use crate::backends::{self, CredentialFn, TaskManager};
use crate::cache::CacheStore;
use crate::daemon::DaemonClient;
use crate::sync::SyncEngine;
use crate::utils::config::{OfflineMode, TodoConfig};
use crate::utils::error::{TodoError, TodoResult};
use crate::utils::paths;

pub struct Dispatcher {
    config: TodoConfig,
    credentials: CredentialFn,
    drivers: DashMap<String, Arc<dyn TaskManager>>,
    caches: DashMap<String, Arc<CacheStore>>,
    /// Cooldown bookkeeping for read-triggered pulls.
    last_pull: DashMap<String, Instant>,
    /// At most one in-flight background pull per backend.
    pull_guards: DashMap<String, Arc<Mutex<()>>>,
}

impl Dispatcher {
    #[must_use]
    pub fn new(config: TodoConfig, credentials: CredentialFn) -> Self {
        Self {
            config,
            credentials,
            drivers: DashMap::new(),
            caches: DashMap::new(),
            last_pull: DashMap::new(),
            pull_guards: DashMap::new(),
        }
    }

    #[must_use]
    pub fn config(&self) -> &TodoConfig {
        &self.config
    }

    /// The `TaskManager` view of a named backend for the current offline
    /// mode. Reads through a cache may kick off a background pull.
    pub async fn resolve(&self, name: &str) -> TodoResult<Arc<dyn TaskManager>> {
        let backend_config = self.backend_config(name)?;

        let use_cache = backend_config.is_remote()
            && self.config.sync.enabled
            && self.config.sync.offline_mode != OfflineMode::Online;
        if !use_cache {
            let driver = self.driver(name)?;
            if driver.supports_trash() {
                driver
                    .purge_expired_trash(self.config.trash.retention_days)
                    .await?;
            }
            return Ok(driver);
        }

        let cache = self.cache(name).await?;
        if self.config.sync.offline_mode == OfflineMode::Auto {
            self.maybe_background_pull(name);
        }
        Ok(cache as Arc<dyn TaskManager>)
    }

    /// The live driver, bypassing any cache.
    pub fn driver(&self, name: &str) -> TodoResult<Arc<dyn TaskManager>> {
        if let Some(driver) = self.drivers.get(name) {
            return Ok(Arc::clone(&driver));
        }
        let backend_config = self.backend_config(name)?;
        let driver = backends::connect(name, &backend_config, &self.credentials)?;
        self.drivers.insert(name.to_string(), Arc::clone(&driver));
        Ok(driver)
    }

    pub async fn cache(&self, name: &str) -> TodoResult<Arc<CacheStore>> {
        if let Some(cache) = self.caches.get(name) {
            return Ok(Arc::clone(&cache));
        }
        let driver = self.driver(name)?;
        let path = paths::cache_db_path(name)?;
        let cache = Arc::new(CacheStore::open(
            name,
            &path,
            driver.capabilities(),
            self.config.sync.enabled,
        )?);
        // Opportunistic retention enforcement at open.
        cache
            .purge_expired_trash(self.config.trash.retention_days)
            .await?;
        self.caches.insert(name.to_string(), Arc::clone(&cache));
        Ok(cache)
    }

    /// Sync engine for one remote backend (foreground `sync now` and the
    /// daemon both go through here).
    pub async fn engine(&self, name: &str) -> TodoResult<Arc<SyncEngine>> {
        let backend_config = self.backend_config(name)?;
        if !backend_config.is_remote() {
            return Err(TodoError::InvalidInput {
                field: "backend".to_string(),
                reason: format!("backend {name} is local and never syncs"),
            });
        }
        let driver = self.driver(name)?;
        let cache = self.cache(name).await?;
        Ok(Arc::new(SyncEngine::new(
            driver,
            cache,
            self.config.sync.clone(),
        )))
    }

    /// Engines for every configured remote backend, the daemon's working set.
    pub async fn engines(&self) -> TodoResult<Vec<Arc<SyncEngine>>> {
        let mut engines = Vec::new();
        for name in self.config.remote_backends() {
            engines.push(self.engine(&name).await?);
        }
        Ok(engines)
    }

    /// Kick a detached pull for a backend unless one is in flight or the
    /// cooldown has not elapsed. Never blocks the caller.
    fn maybe_background_pull(&self, name: &str) {
        let cooldown = self.config.sync.background_pull_cooldown();
        if let Some(last) = self.last_pull.get(name) {
            if last.elapsed() < cooldown {
                return;
            }
        }

        let guard = self
            .pull_guards
            .entry(name.to_string())
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone();
        let Ok(permit) = guard.try_lock_owned() else {
            return; // a pull is already running
        };
        self.last_pull.insert(name.to_string(), Instant::now());

        let name = name.to_string();
        let driver = match self.driver(&name) {
            Ok(driver) => driver,
            Err(_) => return,
        };
        let Some(cache) = self.caches.get(&name).map(|c| Arc::clone(&c)) else {
            return;
        };
        let engine = SyncEngine::new(driver, cache, self.config.sync.clone());

        tokio::spawn(async move {
            let _permit = permit;
            match engine.run_pull_only().await {
                Ok(outcome) => {
                    debug!(backend = %name, pulled = outcome.pulled, "background pull finished");
                }
                Err(e) => {
                    debug!(backend = %name, error = %e, "background pull failed");
                }
            }
        });
    }

    /// Nudge the daemon after a successful write, when configured to.
    pub fn notify_write(&self) {
        if !self.config.sync.enabled
            || !self.config.sync.auto_sync_after_operation
            || !self.config.sync.daemon.enabled
        {
            return;
        }
        tokio::spawn(async {
            let Ok(socket) = paths::socket_path() else {
                return;
            };
            let client = DaemonClient::new(&socket);
            if let Err(e) = client.trigger().await {
                debug!(error = %e, "daemon trigger skipped");
            }
        });
    }

    /// Ask every configured backend whether it recognises the current
    /// environment.
    pub fn detect(&self) -> Vec<(String, String)> {
        let mut found = Vec::new();
        let mut names: Vec<&String> = self.config.backends.keys().collect();
        names.sort();
        for name in names {
            match self.driver(name) {
                Ok(driver) => {
                    if driver.can_detect() {
                        found.push((name.clone(), driver.detection_info()));
                    }
                }
                Err(e) => warn!(backend = %name, error = %e, "driver construction failed"),
            }
        }
        found
    }

    fn backend_config(&self, name: &str) -> TodoResult<crate::utils::config::BackendConfig> {
        self.config
            .backends
            .get(name)
            .cloned()
            .ok_or_else(|| TodoError::NotFound {
                resource: format!("backend {name}"),
            })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::utils::config::BackendConfig;

    fn test_credentials() -> CredentialFn {
        Arc::new(|_key: &str| {
            Ok::<String, TodoError>("secret".to_string())
        })
    }

    fn config_with(kind: &str, remote: bool) -> TodoConfig {
        let mut config = TodoConfig::default();
        config.sync.enabled = true;
        let backend = BackendConfig {
            kind: kind.to_string(),
            url: remote.then(|| "https://example.com/dav/".to_string()),
            credential: Some("key".to_string()),
            path: Some(std::env::temp_dir().join(format!("todoat-dispatch-{}", uuid::Uuid::new_v4()))),
            ..BackendConfig::default()
        };
        config.backends.insert("b".to_string(), backend);
        config
    }

    #[tokio::test]
    async fn local_backends_are_served_directly() {
        let dispatcher = Dispatcher::new(config_with("markdown", false), test_credentials());
        let manager = dispatcher.resolve("b").await.unwrap();
        assert_eq!(manager.name(), "b");
        // Markdown has no trash; the cache would have reported trash.
        assert!(!manager.supports_trash());
    }

    #[tokio::test]
    async fn unknown_backend_is_not_found() {
        let dispatcher = Dispatcher::new(TodoConfig::default(), test_credentials());
        assert!(matches!(
            dispatcher.resolve("nope").await,
            Err(TodoError::NotFound { .. })
        ));
    }

    #[tokio::test]
    async fn local_backends_never_get_engines() {
        let dispatcher = Dispatcher::new(config_with("markdown", false), test_credentials());
        assert!(dispatcher.engine("b").await.is_err());
    }
}
