use serde_json::Value;
use thiserror::Error;
use tokio::sync::{OnceCell, broadcast};
use tracing::{debug, error, info, warn};

use super::events::{EventHub, Subscription, SyncEvent};
use super::now_millis;
use super::queue::{
    DEFAULT_MAX_RETRIES, Draft, NewLogEntry, NewOperation, Operation, OperationOptions,
    OperationType, QueueStats, StatusCounts, SyncLogEntry, SyncStatus, TypeCounts,
};
use super::store::{OperationIndex, QueueStore, StoreError};

pub const DEFAULT_LOG_LIMIT: u32 = 50;
const STATS_LOG_WINDOW: u32 = 100;
const STATS_RECENT: usize = 5;

#[derive(Debug, Error)]
pub enum ManagerError {
    #[error("storage error: {0}")]
    Store(#[from] StoreError),
    #[error("Operation not found: {0}")]
    NotFound(i64),
}

/// Durable queue of offline mutations plus the sync log and drafts.
///
/// All state lives in the [`QueueStore`]; the manager owns status transitions,
/// retry accounting and observer notification.
pub struct OperationManager {
    store: QueueStore,
    recovered: OnceCell<()>,
    events: EventHub,
    default_max_retries: u32,
}

impl OperationManager {
    pub fn new(store: QueueStore) -> Self {
        Self {
            store,
            recovered: OnceCell::new(),
            events: EventHub::default(),
            default_max_retries: DEFAULT_MAX_RETRIES,
        }
    }

    pub fn with_default_max_retries(mut self, max_retries: u32) -> Self {
        self.default_max_retries = max_retries;
        self
    }

    pub fn default_max_retries(&self) -> u32 {
        self.default_max_retries
    }

    /// Prepares the store and returns operations interrupted mid-sync to `pending`.
    pub async fn init(&self) -> Result<(), ManagerError> {
        self.ready().await?;
        Ok(())
    }

    async fn ready(&self) -> Result<&QueueStore, ManagerError> {
        self.recovered
            .get_or_try_init(|| self.recover_interrupted())
            .await?;
        Ok(&self.store)
    }

    /// Runs once per manager, before any pass can move an operation to `syncing`.
    async fn recover_interrupted(&self) -> Result<(), ManagerError> {
        self.store.init().await?;
        let stuck = self
            .store
            .operations_by_index(OperationIndex::Status(SyncStatus::Syncing))
            .await?;
        let now = now_millis();
        for operation in &stuck {
            self.store
                .modify_operation(operation.id, |operation| {
                    if operation.status == SyncStatus::Syncing {
                        operation.status = SyncStatus::Pending;
                        operation.updated_at = Some(now);
                    }
                })
                .await?;
        }
        if !stuck.is_empty() {
            warn!(count = stuck.len(), "requeued operations interrupted mid-sync");
        }
        Ok(())
    }

    pub async fn close(&self) {
        self.store.close().await;
    }

    pub async fn add_pending_operation(
        &self,
        operation_type: OperationType,
        endpoint: &str,
        payload: Value,
        options: OperationOptions,
    ) -> Result<i64, ManagerError> {
        let store = self.ready().await?;
        let operation = NewOperation {
            operation_type,
            endpoint: endpoint.to_string(),
            payload,
            status: SyncStatus::Pending,
            timestamp: now_millis(),
            retries: 0,
            max_retries: options.max_retries.unwrap_or(self.default_max_retries),
            local_id: options.local_id,
            server_id: options.server_id,
        };
        let id = store.add_operation(&operation).await?;
        info!(id, operation_type = operation_type.as_str(), endpoint, "operation queued");
        Ok(id)
    }

    /// All operations, or only those with `status`, in insertion order.
    pub async fn get_pending_operations(
        &self,
        status: Option<SyncStatus>,
    ) -> Result<Vec<Operation>, ManagerError> {
        let store = self.ready().await?;
        let operations = match status {
            Some(status) => {
                store
                    .operations_by_index(OperationIndex::Status(status))
                    .await?
            }
            None => store.all_operations().await?,
        };
        Ok(operations)
    }

    pub async fn get_operation(&self, id: i64) -> Result<Option<Operation>, ManagerError> {
        Ok(self.ready().await?.get_operation(id).await?)
    }

    pub async fn list_operations_by_endpoint(
        &self,
        endpoint: &str,
    ) -> Result<Vec<Operation>, ManagerError> {
        Ok(self
            .ready()
            .await?
            .operations_by_index(OperationIndex::Endpoint(endpoint))
            .await?)
    }

    /// Sets `status` and `error` and stamps `updated_at`.
    ///
    /// Fails with [`ManagerError::NotFound`] when the operation no longer exists.
    pub async fn update_operation_status(
        &self,
        id: i64,
        status: SyncStatus,
        error: Option<&str>,
    ) -> Result<Operation, ManagerError> {
        let now = now_millis();
        let updated = self
            .ready()
            .await?
            .modify_operation(id, |operation| {
                operation.status = status;
                operation.updated_at = Some(now);
                operation.error = error.map(str::to_string);
            })
            .await?
            .ok_or(ManagerError::NotFound(id))?;
        debug!(id, status = status.as_str(), "operation status updated");
        Ok(updated)
    }

    /// Counts one failed attempt.
    ///
    /// The operation becomes `failed` with `error` once `retries` reaches
    /// `max_retries`, otherwise it goes back to `pending` with no error.
    pub async fn record_failure(&self, id: i64, error: &str) -> Result<Operation, ManagerError> {
        let now = now_millis();
        let updated = self
            .ready()
            .await?
            .modify_operation(id, |operation| {
                operation.retries = operation.retries.saturating_add(1);
                operation.updated_at = Some(now);
                if operation.retries >= operation.max_retries {
                    operation.status = SyncStatus::Failed;
                    operation.error = Some(error.to_string());
                } else {
                    operation.status = SyncStatus::Pending;
                    operation.error = None;
                }
            })
            .await?
            .ok_or(ManagerError::NotFound(id))?;
        Ok(updated)
    }

    /// Returns an operation to `pending` with a fresh retry budget.
    pub async fn reset_for_retry(&self, id: i64) -> Result<Operation, ManagerError> {
        let now = now_millis();
        let updated = self
            .ready()
            .await?
            .modify_operation(id, |operation| {
                operation.status = SyncStatus::Pending;
                operation.retries = 0;
                operation.error = None;
                operation.updated_at = Some(now);
            })
            .await?
            .ok_or(ManagerError::NotFound(id))?;
        info!(id, "operation reset for retry");
        Ok(updated)
    }

    /// Removes the operation; its sync log entries are kept.
    pub async fn delete_operation(&self, id: i64) -> Result<(), ManagerError> {
        self.ready().await?.delete_operation(id).await?;
        debug!(id, "operation deleted");
        Ok(())
    }

    pub async fn log_sync(
        &self,
        operation_id: i64,
        status: SyncStatus,
        response: Option<Value>,
        error: Option<&str>,
    ) -> Result<SyncLogEntry, ManagerError> {
        let entry = NewLogEntry {
            operation_id,
            status,
            timestamp: now_millis(),
            response,
            error: error.map(str::to_string),
        };
        Ok(self.ready().await?.add_log_entry(&entry).await?)
    }

    /// Most recent log entries first.
    pub async fn get_sync_log(&self, limit: u32) -> Result<Vec<SyncLogEntry>, ManagerError> {
        Ok(self.ready().await?.recent_log_entries(limit).await?)
    }

    pub fn subscribe(&self) -> broadcast::Receiver<SyncEvent> {
        self.events.subscribe()
    }

    pub fn on_sync_status_change<F>(&self, callback: F) -> Subscription
    where
        F: FnMut(&SyncEvent) -> anyhow::Result<()> + Send + 'static,
    {
        self.events.on_event(callback)
    }

    pub fn notify_sync_status_change(&self, event: SyncEvent) {
        self.events.publish(event);
    }

    pub async fn get_stats(&self) -> Result<QueueStats, ManagerError> {
        let store = self.ready().await?;
        let operations = store.all_operations().await?;
        let mut by_status = StatusCounts::default();
        let mut by_operation = TypeCounts::default();
        for operation in &operations {
            by_status.bump(operation.status);
            by_operation.bump(operation.operation_type);
        }
        let mut recent_sync = store.recent_log_entries(STATS_LOG_WINDOW).await?;
        recent_sync.truncate(STATS_RECENT);

        Ok(QueueStats {
            total_pending: operations.len() as u64,
            by_status,
            by_operation,
            recent_sync,
        })
    }

    /// Empties operations, log and drafts in one transaction.
    pub async fn clear_all(&self) -> Result<(), ManagerError> {
        let store = self.ready().await?;
        if let Err(err) = store.clear_all().await {
            error!(error = %err, "failed to clear offline data");
            return Err(err.into());
        }
        info!("all offline data cleared");
        Ok(())
    }

    pub async fn save_draft(&self, id: &str, data: Value) -> Result<Draft, ManagerError> {
        let draft = Draft {
            id: id.to_string(),
            data,
            saved_at: now_millis(),
        };
        self.ready().await?.put_draft(&draft).await?;
        debug!(id, "draft saved");
        Ok(draft)
    }

    pub async fn get_draft(&self, id: &str) -> Result<Option<Draft>, ManagerError> {
        Ok(self.ready().await?.get_draft(id).await?)
    }

    pub async fn delete_draft(&self, id: &str) -> Result<(), ManagerError> {
        self.ready().await?.delete_draft(id).await?;
        Ok(())
    }

    pub async fn list_drafts(&self) -> Result<Vec<Draft>, ManagerError> {
        Ok(self.ready().await?.all_drafts().await?)
    }
}
