use std::sync::Arc;

use serde::Serialize;
use serde_json::Value;
use thiserror::Error;
use tracing::{error, warn};
use worldstory_integrations::ids::{
    DBUS_ERROR_FAILED, DBUS_ERROR_INVALID_ARGUMENT, DBUS_ERROR_NOT_FOUND, DBUS_ERROR_OFFLINE,
};
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use zbus::{interface, object_server::SignalEmitter};

use crate::sync::engine::{SyncEngine, SyncError};
use crate::sync::manager::{DEFAULT_LOG_LIMIT, ManagerError};
use crate::sync::queue::{OperationOptions, OperationType, QueueError, SyncStatus};

#[derive(Debug, Error)]
pub enum DbusServiceError {
    #[error("{0}")]
    NotFound(String),
    #[error("device is offline")]
    Offline,
    #[error("{0}")]
    InvalidArgument(String),
    #[error("{0}")]
    Failed(String),
}

pub fn dbus_error_name(err: &DbusServiceError) -> &'static str {
    match err {
        DbusServiceError::NotFound(_) => DBUS_ERROR_NOT_FOUND,
        DbusServiceError::Offline => DBUS_ERROR_OFFLINE,
        DbusServiceError::InvalidArgument(_) => DBUS_ERROR_INVALID_ARGUMENT,
        DbusServiceError::Failed(_) => DBUS_ERROR_FAILED,
    }
}

fn map_to_fdo(err: DbusServiceError) -> zbus::fdo::Error {
    zbus::fdo::Error::Failed(format!("{}: {}", dbus_error_name(&err), err))
}

impl From<ManagerError> for DbusServiceError {
    fn from(err: ManagerError) -> Self {
        match err {
            ManagerError::NotFound(_) => DbusServiceError::NotFound(err.to_string()),
            ManagerError::Store(_) => DbusServiceError::Failed(err.to_string()),
        }
    }
}

impl From<SyncError> for DbusServiceError {
    fn from(err: SyncError) -> Self {
        match err {
            SyncError::Manager(err) => err.into(),
            other => DbusServiceError::Failed(other.to_string()),
        }
    }
}

impl From<QueueError> for DbusServiceError {
    fn from(err: QueueError) -> Self {
        DbusServiceError::InvalidArgument(err.to_string())
    }
}

fn to_fdo<E: Into<DbusServiceError>>(err: E) -> zbus::fdo::Error {
    map_to_fdo(err.into())
}

fn parse_json(label: &str, raw: &str) -> Result<Value, DbusServiceError> {
    serde_json::from_str(raw)
        .map_err(|err| DbusServiceError::InvalidArgument(format!("invalid {label} JSON: {err}")))
}

fn to_json<T: Serialize>(value: &T) -> zbus::fdo::Result<String> {
    serde_json::to_string(value)
        .map_err(|err| map_to_fdo(DbusServiceError::Failed(format!("encode failed: {err}"))))
}

/// `io.worldstory.OfflineSync1`: queue control for the web app and the CLI.
///
/// Structured values cross the bus as JSON strings.
pub struct OfflineSyncDbusService {
    engine: Arc<SyncEngine>,
    shutdown: CancellationToken,
    passes: TaskTracker,
}

impl OfflineSyncDbusService {
    /// Passes requested over the bus run on `passes` and stop between operations
    /// once `shutdown` is cancelled.
    pub fn with_shutdown(
        engine: Arc<SyncEngine>,
        shutdown: CancellationToken,
        passes: TaskTracker,
    ) -> Self {
        Self {
            engine,
            shutdown,
            passes,
        }
    }

    fn spawn_pass(&self) {
        if self.shutdown.is_cancelled() {
            return;
        }
        let engine = Arc::clone(&self.engine);
        let shutdown = self.shutdown.clone();
        self.passes.spawn(async move {
            if let Err(err) = engine.sync_all_until(&shutdown).await {
                error!(error = %err, "requested sync pass failed");
            }
        });
    }
}

#[interface(name = "io.worldstory.OfflineSync1")]
impl OfflineSyncDbusService {
    /// `max_retries` of 0 selects the daemon default.
    async fn enqueue(
        &self,
        operation_type: &str,
        endpoint: &str,
        payload_json: &str,
        max_retries: u32,
    ) -> zbus::fdo::Result<i64> {
        let operation_type = OperationType::parse(operation_type).map_err(to_fdo)?;
        if endpoint.trim().is_empty() {
            return Err(map_to_fdo(DbusServiceError::InvalidArgument(
                "endpoint is empty".to_string(),
            )));
        }
        let payload = parse_json("payload", payload_json).map_err(map_to_fdo)?;
        let options = OperationOptions {
            max_retries: (max_retries > 0).then_some(max_retries),
            ..OperationOptions::default()
        };
        let id = self
            .engine
            .manager()
            .add_pending_operation(operation_type, endpoint, payload, options)
            .await
            .map_err(to_fdo)?;
        if self.engine.connectivity().is_online() {
            self.spawn_pass();
        }
        Ok(id)
    }

    /// An empty `status` lists every operation.
    async fn list_operations(&self, status: &str) -> zbus::fdo::Result<String> {
        let filter = if status.is_empty() {
            None
        } else {
            Some(SyncStatus::parse(status).map_err(to_fdo)?)
        };
        let operations = self
            .engine
            .manager()
            .get_pending_operations(filter)
            .await
            .map_err(to_fdo)?;
        to_json(&operations)
    }

    async fn delete_operation(&self, id: i64) -> zbus::fdo::Result<()> {
        self.engine
            .manager()
            .delete_operation(id)
            .await
            .map_err(to_fdo)
    }

    async fn retry_operation(&self, id: i64) -> zbus::fdo::Result<()> {
        self.engine.requeue_operation(id).await.map_err(to_fdo)?;
        self.spawn_pass();
        Ok(())
    }

    async fn retry_failed(&self) -> zbus::fdo::Result<u32> {
        let requeued = self.engine.requeue_failed().await.map_err(to_fdo)?;
        self.spawn_pass();
        Ok(u32::try_from(requeued).unwrap_or(u32::MAX))
    }

    /// Starts a pass in the background; false when one is already running.
    async fn sync_now(&self) -> zbus::fdo::Result<bool> {
        if !self.engine.connectivity().is_online() {
            return Err(map_to_fdo(DbusServiceError::Offline));
        }
        if self.engine.is_syncing() {
            return Ok(false);
        }
        self.spawn_pass();
        Ok(true)
    }

    async fn clear_all(&self) -> zbus::fdo::Result<()> {
        self.engine.manager().clear_all().await.map_err(to_fdo)
    }

    /// A `limit` of 0 selects the default of 50 entries.
    async fn get_sync_log(&self, limit: u32) -> zbus::fdo::Result<String> {
        let limit = if limit == 0 { DEFAULT_LOG_LIMIT } else { limit };
        let log = self
            .engine
            .manager()
            .get_sync_log(limit)
            .await
            .map_err(to_fdo)?;
        to_json(&log)
    }

    async fn get_status(&self) -> zbus::fdo::Result<String> {
        let status = self.engine.status().await.map_err(to_fdo)?;
        to_json(&status)
    }

    /// Pins the connectivity state; probe results are ignored until `ClearOnlineOverride`.
    async fn set_online(&self, online: bool) -> zbus::fdo::Result<()> {
        self.engine.connectivity().override_online(online);
        Ok(())
    }

    async fn clear_online_override(&self) -> zbus::fdo::Result<()> {
        self.engine.connectivity().clear_override();
        Ok(())
    }

    async fn save_draft(&self, id: &str, data_json: &str) -> zbus::fdo::Result<()> {
        if id.is_empty() {
            return Err(map_to_fdo(DbusServiceError::InvalidArgument(
                "draft id is empty".to_string(),
            )));
        }
        let data = parse_json("draft", data_json).map_err(map_to_fdo)?;
        self.engine
            .manager()
            .save_draft(id, data)
            .await
            .map_err(to_fdo)?;
        Ok(())
    }

    async fn get_draft(&self, id: &str) -> zbus::fdo::Result<String> {
        let draft = self
            .engine
            .manager()
            .get_draft(id)
            .await
            .map_err(to_fdo)?
            .ok_or_else(|| {
                map_to_fdo(DbusServiceError::NotFound(format!("Draft not found: {id}")))
            })?;
        to_json(&draft)
    }

    async fn delete_draft(&self, id: &str) -> zbus::fdo::Result<()> {
        self.engine.manager().delete_draft(id).await.map_err(to_fdo)
    }

    async fn list_drafts(&self) -> zbus::fdo::Result<String> {
        let drafts = self
            .engine
            .manager()
            .list_drafts()
            .await
            .map_err(to_fdo)?;
        to_json(&drafts)
    }

    #[zbus(signal)]
    pub async fn sync_status_changed(ctxt: &SignalEmitter<'_>, event_json: &str)
    -> zbus::Result<()>;
}

/// Relays every sync event as a `SyncStatusChanged` signal until the hub closes.
pub async fn forward_events(engine: Arc<SyncEngine>, emitter: SignalEmitter<'static>) {
    use tokio::sync::broadcast::error::RecvError;

    let mut rx = engine.manager().subscribe();
    loop {
        match rx.recv().await {
            Ok(event) => {
                let payload = match serde_json::to_string(&event) {
                    Ok(payload) => payload,
                    Err(err) => {
                        warn!(error = %err, "failed to encode sync event");
                        continue;
                    }
                };
                if let Err(err) =
                    OfflineSyncDbusService::sync_status_changed(&emitter, &payload).await
                {
                    warn!(error = %err, "failed to emit SyncStatusChanged");
                }
            }
            Err(RecvError::Lagged(skipped)) => warn!(skipped, "signal relay lagged behind"),
            Err(RecvError::Closed) => break,
        }
    }
}
