use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicI64, Ordering};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;
use tokio::sync::Mutex;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};
use worldstory_core::{ApiError, ApiRequest, StoryClient};
use worldstory_integrations::SyncHealth;

use super::connectivity::ConnectivityMonitor;
use super::events::SyncEvent;
use super::manager::{ManagerError, OperationManager};
use super::now_millis;
use super::queue::{Operation, OperationType, StatusCounts, SyncStatus, TypeCounts};
use crate::token_source::AccessTokenSource;

pub const DEFAULT_SYNC_INTERVAL: Duration = Duration::from_millis(5_000);
pub const DEFAULT_REQUEST_TIMEOUT: Duration = Duration::from_secs(30);

const NEVER_SYNCED: i64 = 0;

#[derive(Debug, Error)]
pub enum SyncError {
    #[error(transparent)]
    Manager(#[from] ManagerError),
    #[error(transparent)]
    Api(#[from] ApiError),
    #[error("Sync timeout")]
    Timeout,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SyncConfig {
    pub sync_interval: Duration,
    pub request_timeout: Duration,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            sync_interval: DEFAULT_SYNC_INTERVAL,
            request_timeout: DEFAULT_REQUEST_TIMEOUT,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SyncPassOutcome {
    Completed { processed: usize, pending_count: u64 },
    SkippedBusy,
    SkippedOffline,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SyncStatusSnapshot {
    pub is_online: bool,
    pub is_syncing: bool,
    pub last_sync_time: Option<i64>,
    pub pending_count: u64,
    pub by_status: StatusCounts,
    pub by_operation: TypeCounts,
    pub health: SyncHealth,
}

/// Replays queued operations against the API while connectivity allows.
///
/// At most one pass runs at a time; overlapping triggers are skipped.
pub struct SyncEngine {
    manager: Arc<OperationManager>,
    client: StoryClient,
    tokens: Arc<dyn AccessTokenSource>,
    connectivity: ConnectivityMonitor,
    config: SyncConfig,
    pass_guard: Mutex<()>,
    is_syncing: AtomicBool,
    last_sync_time: AtomicI64,
}

/// Clears the syncing flag even when a pass is cancelled mid-flight.
struct SyncingFlag<'a>(&'a AtomicBool);

impl<'a> SyncingFlag<'a> {
    fn raise(flag: &'a AtomicBool) -> Self {
        flag.store(true, Ordering::SeqCst);
        Self(flag)
    }
}

impl Drop for SyncingFlag<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::SeqCst);
    }
}

impl SyncEngine {
    pub fn new(
        manager: Arc<OperationManager>,
        client: StoryClient,
        tokens: Arc<dyn AccessTokenSource>,
        connectivity: ConnectivityMonitor,
    ) -> Self {
        Self {
            manager,
            client,
            tokens,
            connectivity,
            config: SyncConfig::default(),
            pass_guard: Mutex::new(()),
            is_syncing: AtomicBool::new(false),
            last_sync_time: AtomicI64::new(NEVER_SYNCED),
        }
    }

    pub fn with_config(mut self, config: SyncConfig) -> Self {
        self.config = config;
        self
    }

    pub fn manager(&self) -> &Arc<OperationManager> {
        &self.manager
    }

    pub fn connectivity(&self) -> &ConnectivityMonitor {
        &self.connectivity
    }

    pub fn config(&self) -> SyncConfig {
        self.config
    }

    pub fn is_syncing(&self) -> bool {
        self.is_syncing.load(Ordering::SeqCst)
    }

    pub fn last_sync_time(&self) -> Option<i64> {
        match self.last_sync_time.load(Ordering::SeqCst) {
            NEVER_SYNCED => None,
            millis => Some(millis),
        }
    }

    /// Runs one pass over every `pending` operation, in insertion order.
    ///
    /// Individual operation failures are absorbed into retry accounting; only
    /// storage faults surface as errors.
    pub async fn sync_all(&self) -> Result<SyncPassOutcome, SyncError> {
        self.run_pass(None).await
    }

    /// Like [`SyncEngine::sync_all`], but stops before the next operation once
    /// `shutdown` is cancelled. The operation in flight is finished first.
    pub async fn sync_all_until(
        &self,
        shutdown: &CancellationToken,
    ) -> Result<SyncPassOutcome, SyncError> {
        self.run_pass(Some(shutdown)).await
    }

    async fn run_pass(
        &self,
        shutdown: Option<&CancellationToken>,
    ) -> Result<SyncPassOutcome, SyncError> {
        if !self.connectivity.is_online() {
            debug!("sync skipped: offline");
            return Ok(SyncPassOutcome::SkippedOffline);
        }
        let Ok(_pass) = self.pass_guard.try_lock() else {
            debug!("sync skipped: pass already running");
            return Ok(SyncPassOutcome::SkippedBusy);
        };
        let syncing = SyncingFlag::raise(&self.is_syncing);
        self.manager
            .notify_sync_status_change(SyncEvent::Pass {
                is_syncing: true,
                pending_count: 0,
                last_sync_time: self.last_sync_time(),
            });

        let drained = self.drain_pending(shutdown).await;
        let stats = self.manager.get_stats().await;
        if drained.is_ok() && stats.is_ok() {
            self.last_sync_time.store(now_millis(), Ordering::SeqCst);
        }
        drop(syncing);
        // Observers always see the pass end, even when storage failed.
        self.manager
            .notify_sync_status_change(SyncEvent::Pass {
                is_syncing: false,
                pending_count: stats.as_ref().map_or(0, |stats| stats.total_pending),
                last_sync_time: self.last_sync_time(),
            });

        let processed = drained?;
        let stats = stats?;
        Ok(SyncPassOutcome::Completed {
            processed,
            pending_count: stats.total_pending,
        })
    }

    async fn drain_pending(&self, shutdown: Option<&CancellationToken>) -> Result<usize, SyncError> {
        let pending = self
            .manager
            .get_pending_operations(Some(SyncStatus::Pending))
            .await?;
        if !pending.is_empty() {
            info!(count = pending.len(), "syncing pending operations");
        }
        let mut processed = 0;
        for operation in &pending {
            if shutdown.is_some_and(CancellationToken::is_cancelled) {
                info!(
                    remaining = pending.len() - processed,
                    "sync pass interrupted by shutdown"
                );
                break;
            }
            if let Err(err) = self.sync_operation(operation).await {
                warn!(id = operation.id, error = %err, "operation not synced");
            }
            processed += 1;
        }
        Ok(processed)
    }

    /// Replays one operation and records the outcome.
    ///
    /// On success the operation is logged and removed from the queue. On failure
    /// its retry count grows and it either returns to `pending` or, once the
    /// budget is spent, becomes `failed` with a log entry.
    pub async fn sync_operation(&self, operation: &Operation) -> Result<Value, SyncError> {
        let id = operation.id;
        debug!(
            id,
            operation_type = operation.operation_type.as_str(),
            endpoint = %operation.endpoint,
            "syncing operation"
        );
        self.manager
            .update_operation_status(id, SyncStatus::Syncing, None)
            .await?;
        self.notify_operation(id, SyncStatus::Syncing, None);

        match self.execute_operation(operation).await {
            Ok(response) => {
                self.manager
                    .update_operation_status(id, SyncStatus::Synced, None)
                    .await?;
                self.manager
                    .log_sync(id, SyncStatus::Synced, Some(response.clone()), None)
                    .await?;
                self.manager.delete_operation(id).await?;
                info!(id, "operation synced");
                self.notify_operation(id, SyncStatus::Synced, None);
                Ok(response)
            }
            Err(err) => {
                let message = err.to_string();
                let updated = self.manager.record_failure(id, &message).await?;
                if updated.status == SyncStatus::Failed {
                    self.manager
                        .log_sync(id, SyncStatus::Failed, None, Some(&message))
                        .await?;
                    error!(id, retries = updated.retries, error = %message, "operation failed permanently");
                    self.notify_operation(id, SyncStatus::Failed, Some(message));
                } else {
                    debug!(
                        id,
                        retries = updated.retries,
                        max_retries = updated.max_retries,
                        error = %message,
                        "operation will be retried"
                    );
                    self.notify_operation(id, SyncStatus::Pending, None);
                }
                Err(err)
            }
        }
    }

    /// Issues the HTTP request for `operation`, bounded by the request timeout.
    pub async fn execute_operation(&self, operation: &Operation) -> Result<Value, SyncError> {
        let request = match operation.operation_type {
            OperationType::Create => ApiRequest::create(&operation.endpoint, &operation.payload),
            OperationType::Update => ApiRequest::update(&operation.endpoint, &operation.payload),
            OperationType::Delete => ApiRequest::delete(&operation.endpoint, &operation.payload),
        };
        let token = self.tokens.access_token().await;
        match tokio::time::timeout(
            self.config.request_timeout,
            self.client.send(&request, token.as_deref()),
        )
        .await
        {
            Ok(result) => Ok(result?),
            Err(_) => Err(SyncError::Timeout),
        }
    }

    /// Moves every `failed` operation back to `pending` with a fresh budget.
    pub async fn requeue_failed(&self) -> Result<usize, SyncError> {
        let failed = self
            .manager
            .get_pending_operations(Some(SyncStatus::Failed))
            .await?;
        for operation in &failed {
            self.manager.reset_for_retry(operation.id).await?;
            self.notify_operation(operation.id, SyncStatus::Pending, None);
        }
        if !failed.is_empty() {
            info!(count = failed.len(), "retrying failed operations");
        }
        Ok(failed.len())
    }

    /// Requeues failed operations and runs a pass.
    pub async fn retry_failed(&self) -> Result<usize, SyncError> {
        let requeued = self.requeue_failed().await?;
        self.sync_all().await?;
        Ok(requeued)
    }

    pub async fn requeue_operation(&self, id: i64) -> Result<Operation, SyncError> {
        let operation = self.manager.reset_for_retry(id).await?;
        self.notify_operation(id, SyncStatus::Pending, None);
        Ok(operation)
    }

    /// Requeues a single operation regardless of its status and runs a pass.
    pub async fn retry_operation(&self, id: i64) -> Result<SyncPassOutcome, SyncError> {
        self.requeue_operation(id).await?;
        self.sync_all().await
    }

    pub async fn status(&self) -> Result<SyncStatusSnapshot, SyncError> {
        let stats = self.manager.get_stats().await?;
        let is_online = self.connectivity.is_online();
        let is_syncing = self.is_syncing();
        Ok(SyncStatusSnapshot {
            is_online,
            is_syncing,
            last_sync_time: self.last_sync_time(),
            pending_count: stats.total_pending,
            by_status: stats.by_status,
            by_operation: stats.by_operation,
            health: SyncHealth::from_counts(
                is_online,
                is_syncing,
                stats.by_status.pending,
                stats.by_status.failed,
            ),
        })
    }

    /// Periodic scheduler.
    ///
    /// Passes run every `sync_interval` while online, starting immediately on each
    /// offline to online transition. Nothing runs while offline.
    pub async fn run(self: Arc<Self>, shutdown: CancellationToken) {
        let mut online_rx = self.connectivity.subscribe();
        loop {
            let online = *online_rx.borrow_and_update();
            if online {
                info!("online: auto sync started");
                let mut ticker = tokio::time::interval(self.config.sync_interval);
                ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
                loop {
                    tokio::select! {
                        biased;
                        _ = shutdown.cancelled() => return,
                        changed = online_rx.changed() => {
                            if changed.is_err() {
                                return;
                            }
                            if !*online_rx.borrow_and_update() {
                                info!("offline: auto sync stopped");
                                break;
                            }
                        }
                        _ = ticker.tick() => {
                            if let Err(err) = self.sync_all_until(&shutdown).await {
                                error!(error = %err, "sync pass failed");
                            }
                        }
                    }
                }
            } else {
                tokio::select! {
                    biased;
                    _ = shutdown.cancelled() => return,
                    changed = online_rx.changed() => {
                        if changed.is_err() {
                            return;
                        }
                    }
                }
            }
        }
    }

    fn notify_operation(&self, operation_id: i64, status: SyncStatus, error: Option<String>) {
        self.manager
            .notify_sync_status_change(SyncEvent::Operation {
                operation_id,
                status,
                error,
            });
    }
}

#[cfg(test)]
#[path = "engine_tests.rs"]
mod tests;
