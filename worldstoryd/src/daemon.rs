use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{debug, info};
use worldstory_core::StoryClient;
use worldstory_integrations::ids::{DBUS_NAME_SYNC, DBUS_OBJECT_PATH_SYNC};
use zbus::connection::Builder as ConnectionBuilder;
use zbus::object_server::SignalEmitter;

use crate::dbus_api::{OfflineSyncDbusService, forward_events};
use crate::sync::connectivity::{ConnectivityMonitor, ProbeConfig, probe_once};
use crate::sync::engine::{SyncConfig, SyncEngine};
use crate::sync::manager::OperationManager;
use crate::sync::queue::DEFAULT_MAX_RETRIES;
use crate::sync::store::{QueueStore, default_db_path};
use crate::token_source::{AccessTokenSource, EnvToken, FileToken};

const DEFAULT_API_BASE_URL: &str = "https://story-api.dicoding.dev/v1";
const DEFAULT_SYNC_INTERVAL_MS: u64 = 5_000;
const DEFAULT_SYNC_TIMEOUT_SECS: u64 = 30;
const DEFAULT_PROBE_SECS: u64 = 15;

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct DaemonConfig {
    pub api_base_url: String,
    pub db_path: PathBuf,
    pub sync_interval: Duration,
    pub request_timeout: Duration,
    pub max_retries: u32,
    pub probe_interval: Duration,
    pub enable_probe: bool,
    /// Token file; when unset the token is read from `WORLDSTORY_ACCESS_TOKEN`.
    pub token_file: Option<PathBuf>,
}

impl DaemonConfig {
    pub fn from_env() -> anyhow::Result<Self> {
        let home = dirs::home_dir().context("home directory is unavailable")?;
        Ok(Self::from_lookup(&home, |name| std::env::var(name).ok()))
    }

    pub fn from_lookup<F>(home: &Path, lookup: F) -> Self
    where
        F: Fn(&str) -> Option<String>,
    {
        let api_base_url = lookup("WORLDSTORY_API_BASE_URL")
            .filter(|value| !value.trim().is_empty())
            .unwrap_or_else(|| DEFAULT_API_BASE_URL.to_string());
        let db_path = lookup("WORLDSTORY_DB_PATH")
            .map(|value| expand_with_home(&value, home))
            .unwrap_or_else(|| fallback_db_path(home));
        let sync_interval = Duration::from_millis(read_u64_env(
            &lookup,
            "WORLDSTORY_SYNC_INTERVAL_MS",
            DEFAULT_SYNC_INTERVAL_MS,
        ));
        let request_timeout = Duration::from_secs(read_u64_env(
            &lookup,
            "WORLDSTORY_SYNC_TIMEOUT_SECS",
            DEFAULT_SYNC_TIMEOUT_SECS,
        ));
        let max_retries = u32::try_from(read_u64_env(
            &lookup,
            "WORLDSTORY_MAX_RETRIES",
            u64::from(DEFAULT_MAX_RETRIES),
        ))
        .unwrap_or(u32::MAX);
        let probe_interval = Duration::from_secs(read_u64_env(
            &lookup,
            "WORLDSTORY_PROBE_SECS",
            DEFAULT_PROBE_SECS,
        ));
        let enable_probe = read_bool_env(&lookup, "WORLDSTORY_ENABLE_PROBE", true);
        let token_file = lookup("WORLDSTORY_TOKEN_FILE")
            .filter(|value| !value.trim().is_empty())
            .map(|value| expand_with_home(&value, home));

        Self {
            api_base_url,
            db_path,
            sync_interval,
            request_timeout,
            max_retries,
            probe_interval,
            enable_probe,
            token_file,
        }
    }

    pub fn sync_config(&self) -> SyncConfig {
        SyncConfig {
            sync_interval: self.sync_interval,
            request_timeout: self.request_timeout,
        }
    }
}

pub struct DaemonRuntime {
    config: DaemonConfig,
    client: StoryClient,
    engine: Arc<SyncEngine>,
}

impl DaemonRuntime {
    pub async fn bootstrap(config: DaemonConfig) -> anyhow::Result<Self> {
        let client = StoryClient::with_base_url(&config.api_base_url)
            .with_context(|| format!("invalid API base url {:?}", config.api_base_url))?;
        let store = QueueStore::open_path(&config.db_path)
            .await
            .with_context(|| format!("failed to open queue database at {:?}", config.db_path))?;
        let manager =
            Arc::new(OperationManager::new(store).with_default_max_retries(config.max_retries));

        let initially_online = if config.enable_probe {
            probe_once(&client, ProbeConfig::with_interval(config.probe_interval).timeout).await
        } else {
            true
        };
        let connectivity = ConnectivityMonitor::new(initially_online);
        let engine = Arc::new(
            SyncEngine::new(
                manager,
                client.clone(),
                token_source_for(&config),
                connectivity,
            )
            .with_config(config.sync_config()),
        );

        Ok(Self {
            config,
            client,
            engine,
        })
    }

    pub fn engine(&self) -> &Arc<SyncEngine> {
        &self.engine
    }

    pub async fn run(self) -> anyhow::Result<()> {
        info!(
            api = %self.config.api_base_url,
            db = %self.config.db_path.display(),
            online = self.engine.connectivity().is_online(),
            probe = self.config.enable_probe,
            "worldstoryd started"
        );

        let shutdown = CancellationToken::new();
        let requested_passes = TaskTracker::new();
        let dbus_connection = ConnectionBuilder::session()?
            .name(DBUS_NAME_SYNC)?
            .serve_at(
                DBUS_OBJECT_PATH_SYNC,
                OfflineSyncDbusService::with_shutdown(
                    Arc::clone(&self.engine),
                    shutdown.clone(),
                    requested_passes.clone(),
                ),
            )?
            .build()
            .await
            .context("failed to start D-Bus object server")?;

        let _event_log = self.engine.manager().on_sync_status_change(|event| {
            debug!(?event, "sync status changed");
            Ok(())
        });

        let signal_emitter = SignalEmitter::new(&dbus_connection, DBUS_OBJECT_PATH_SYNC)
            .context("failed to create D-Bus signal emitter")?
            .into_owned();
        let signal_handle = tokio::spawn(forward_events(Arc::clone(&self.engine), signal_emitter));

        let scheduler_handle = tokio::spawn(Arc::clone(&self.engine).run(shutdown.clone()));
        let probe_handle = self.config.enable_probe.then(|| {
            self.engine.connectivity().spawn_probe(
                self.client.clone(),
                ProbeConfig::with_interval(self.config.probe_interval),
                shutdown.clone(),
            )
        });

        tokio::signal::ctrl_c()
            .await
            .context("failed waiting for shutdown signal")?;
        info!("shutdown requested");

        shutdown.cancel();
        scheduler_handle
            .await
            .context("sync scheduler task failed")?;
        if let Some(handle) = probe_handle {
            handle.await.context("connectivity probe task failed")?;
        }
        requested_passes.close();
        requested_passes.wait().await;
        drop(dbus_connection);
        signal_handle.abort();
        self.engine.manager().close().await;
        info!("worldstoryd stopped");
        Ok(())
    }
}

include!("daemon_helpers.rs");

#[cfg(test)]
#[path = "daemon_tests.rs"]
mod tests;
