use std::path::{Path, PathBuf};

use serde_json::Value;
use sqlx::{
    Row, SqlitePool,
    migrate::Migrator,
    sqlite::{SqliteConnectOptions, SqliteRow},
};
use thiserror::Error;
use tokio::sync::OnceCell;

use super::queue::{
    Draft, NewLogEntry, NewOperation, Operation, OperationType, QueueError, SyncLogEntry,
    SyncStatus,
};

static MIGRATOR: Migrator = sqlx::migrate!("./migrations");

const OPERATION_COLUMNS: &str = "id, operation_type, endpoint, payload, status, timestamp, updated_at, retries, max_retries, local_id, server_id, error";
const LOG_COLUMNS: &str = "id, operation_id, status, timestamp, response, error";

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("database error: {0}")]
    Sqlx(#[from] sqlx::Error),
    #[error("migration error: {0}")]
    Migration(#[from] sqlx::migrate::MigrateError),
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
    #[error("XDG data directory is unavailable")]
    MissingDataDir,
    #[error("invalid stored JSON: {0}")]
    Json(#[from] serde_json::Error),
    #[error(transparent)]
    Queue(#[from] QueueError),
}

/// Secondary lookups over `pending_operations`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OperationIndex<'a> {
    Status(SyncStatus),
    Endpoint(&'a str),
    Timestamp(i64),
}

/// Secondary lookups over `sync_log`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogIndex {
    Status(SyncStatus),
    Timestamp(i64),
}

/// SQLite-backed storage for the operation queue, the sync log and drafts.
///
/// Holds no policy: status transitions and retry accounting live in the manager.
pub struct QueueStore {
    pool: SqlitePool,
    ready: OnceCell<()>,
}

impl QueueStore {
    pub fn from_pool(pool: SqlitePool) -> Self {
        Self {
            pool,
            ready: OnceCell::new(),
        }
    }

    pub async fn open(database_url: &str) -> Result<Self, StoreError> {
        let pool = SqlitePool::connect(database_url).await?;
        let store = Self::from_pool(pool);
        store.init().await?;
        Ok(store)
    }

    pub async fn open_path(db_path: &Path) -> Result<Self, StoreError> {
        if let Some(parent) = db_path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        let options = SqliteConnectOptions::new()
            .filename(db_path)
            .create_if_missing(true);
        let pool = SqlitePool::connect_with(options).await?;
        let store = Self::from_pool(pool);
        store.init().await?;
        Ok(store)
    }

    pub async fn open_default() -> Result<Self, StoreError> {
        Self::open_path(&default_db_path()?).await
    }

    /// Applies migrations once per store; later calls return immediately.
    pub async fn init(&self) -> Result<(), StoreError> {
        self.ready
            .get_or_try_init(|| async {
                MIGRATOR.run(&self.pool).await?;
                Ok::<(), StoreError>(())
            })
            .await?;
        Ok(())
    }

    pub fn is_initialized(&self) -> bool {
        self.ready.initialized()
    }

    pub async fn close(&self) {
        self.pool.close().await;
    }

    pub async fn add_operation(&self, operation: &NewOperation) -> Result<i64, StoreError> {
        let result = sqlx::query(
            "INSERT INTO pending_operations (operation_type, endpoint, payload, status, timestamp, retries, max_retries, local_id, server_id)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)",
        )
        .bind(operation.operation_type.as_str())
        .bind(&operation.endpoint)
        .bind(serde_json::to_string(&operation.payload)?)
        .bind(operation.status.as_str())
        .bind(operation.timestamp)
        .bind(i64::from(operation.retries))
        .bind(i64::from(operation.max_retries))
        .bind(&operation.local_id)
        .bind(&operation.server_id)
        .execute(&self.pool)
        .await?;
        Ok(result.last_insert_rowid())
    }

    pub async fn get_operation(&self, id: i64) -> Result<Option<Operation>, StoreError> {
        let row = sqlx::query(&format!(
            "SELECT {OPERATION_COLUMNS} FROM pending_operations WHERE id = ?1"
        ))
        .bind(id)
        .fetch_optional(&self.pool)
        .await?;
        row.as_ref().map(operation_from_row).transpose()
    }

    pub async fn all_operations(&self) -> Result<Vec<Operation>, StoreError> {
        let rows = sqlx::query(&format!(
            "SELECT {OPERATION_COLUMNS} FROM pending_operations ORDER BY id ASC"
        ))
        .fetch_all(&self.pool)
        .await?;
        rows.iter().map(operation_from_row).collect()
    }

    pub async fn operations_by_index(
        &self,
        index: OperationIndex<'_>,
    ) -> Result<Vec<Operation>, StoreError> {
        let sql = |column: &str| {
            format!(
                "SELECT {OPERATION_COLUMNS} FROM pending_operations WHERE {column} = ?1 ORDER BY id ASC"
            )
        };
        let rows = match index {
            OperationIndex::Status(status) => {
                sqlx::query(&sql("status"))
                    .bind(status.as_str())
                    .fetch_all(&self.pool)
                    .await?
            }
            OperationIndex::Endpoint(endpoint) => {
                sqlx::query(&sql("endpoint"))
                    .bind(endpoint)
                    .fetch_all(&self.pool)
                    .await?
            }
            OperationIndex::Timestamp(timestamp) => {
                sqlx::query(&sql("timestamp"))
                    .bind(timestamp)
                    .fetch_all(&self.pool)
                    .await?
            }
        };
        rows.iter().map(operation_from_row).collect()
    }

    /// Upsert keyed by `id`.
    pub async fn put_operation(&self, operation: &Operation) -> Result<(), StoreError> {
        sqlx::query(
            "INSERT INTO pending_operations (id, operation_type, endpoint, payload, status, timestamp, updated_at, retries, max_retries, local_id, server_id, error)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12)
             ON CONFLICT(id) DO UPDATE SET
                operation_type = excluded.operation_type,
                endpoint = excluded.endpoint,
                payload = excluded.payload,
                status = excluded.status,
                timestamp = excluded.timestamp,
                updated_at = excluded.updated_at,
                retries = excluded.retries,
                max_retries = excluded.max_retries,
                local_id = excluded.local_id,
                server_id = excluded.server_id,
                error = excluded.error",
        )
        .bind(operation.id)
        .bind(operation.operation_type.as_str())
        .bind(&operation.endpoint)
        .bind(serde_json::to_string(&operation.payload)?)
        .bind(operation.status.as_str())
        .bind(operation.timestamp)
        .bind(operation.updated_at)
        .bind(i64::from(operation.retries))
        .bind(i64::from(operation.max_retries))
        .bind(&operation.local_id)
        .bind(&operation.server_id)
        .bind(&operation.error)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    /// Read-modify-write of one record inside a single transaction.
    ///
    /// Returns `None` when the record does not exist; nothing is written in that case.
    pub async fn modify_operation<F>(
        &self,
        id: i64,
        apply: F,
    ) -> Result<Option<Operation>, StoreError>
    where
        F: FnOnce(&mut Operation),
    {
        let mut tx = self.pool.begin().await?;
        let row = sqlx::query(&format!(
            "SELECT {OPERATION_COLUMNS} FROM pending_operations WHERE id = ?1"
        ))
        .bind(id)
        .fetch_optional(&mut *tx)
        .await?;
        let Some(row) = row else {
            return Ok(None);
        };
        let mut operation = operation_from_row(&row)?;
        apply(&mut operation);
        operation.id = id;

        let result = sqlx::query(
            "UPDATE pending_operations
             SET status = ?1, updated_at = ?2, retries = ?3, max_retries = ?4, server_id = ?5, error = ?6
             WHERE id = ?7",
        )
        .bind(operation.status.as_str())
        .bind(operation.updated_at)
        .bind(i64::from(operation.retries))
        .bind(i64::from(operation.max_retries))
        .bind(&operation.server_id)
        .bind(&operation.error)
        .bind(id)
        .execute(&mut *tx)
        .await?;
        if result.rows_affected() == 0 {
            return Ok(None);
        }
        tx.commit().await?;
        Ok(Some(operation))
    }

    pub async fn delete_operation(&self, id: i64) -> Result<(), StoreError> {
        sqlx::query("DELETE FROM pending_operations WHERE id = ?1")
            .bind(id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    pub async fn clear_operations(&self) -> Result<(), StoreError> {
        sqlx::query("DELETE FROM pending_operations")
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    pub async fn add_log_entry(&self, entry: &NewLogEntry) -> Result<SyncLogEntry, StoreError> {
        let response = entry
            .response
            .as_ref()
            .map(serde_json::to_string)
            .transpose()?;
        let result = sqlx::query(
            "INSERT INTO sync_log (operation_id, status, timestamp, response, error) VALUES (?1, ?2, ?3, ?4, ?5)",
        )
        .bind(entry.operation_id)
        .bind(entry.status.as_str())
        .bind(entry.timestamp)
        .bind(response)
        .bind(&entry.error)
        .execute(&self.pool)
        .await?;

        Ok(SyncLogEntry {
            id: result.last_insert_rowid(),
            operation_id: entry.operation_id,
            status: entry.status,
            timestamp: entry.timestamp,
            response: entry.response.clone(),
            error: entry.error.clone(),
        })
    }

    /// Newest entries first; ties on timestamp fall back to insertion order.
    pub async fn recent_log_entries(&self, limit: u32) -> Result<Vec<SyncLogEntry>, StoreError> {
        let rows = sqlx::query(&format!(
            "SELECT {LOG_COLUMNS} FROM sync_log ORDER BY timestamp DESC, id DESC LIMIT ?1"
        ))
        .bind(i64::from(limit))
        .fetch_all(&self.pool)
        .await?;
        rows.iter().map(log_entry_from_row).collect()
    }

    pub async fn log_entries_by_index(
        &self,
        index: LogIndex,
    ) -> Result<Vec<SyncLogEntry>, StoreError> {
        let sql = |column: &str| {
            format!("SELECT {LOG_COLUMNS} FROM sync_log WHERE {column} = ?1 ORDER BY id ASC")
        };
        let rows = match index {
            LogIndex::Status(status) => {
                sqlx::query(&sql("status"))
                    .bind(status.as_str())
                    .fetch_all(&self.pool)
                    .await?
            }
            LogIndex::Timestamp(timestamp) => {
                sqlx::query(&sql("timestamp"))
                    .bind(timestamp)
                    .fetch_all(&self.pool)
                    .await?
            }
        };
        rows.iter().map(log_entry_from_row).collect()
    }

    pub async fn clear_log(&self) -> Result<(), StoreError> {
        sqlx::query("DELETE FROM sync_log")
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    pub async fn put_draft(&self, draft: &Draft) -> Result<(), StoreError> {
        sqlx::query(
            "INSERT INTO local_drafts (id, data, saved_at) VALUES (?1, ?2, ?3)
             ON CONFLICT(id) DO UPDATE SET data = excluded.data, saved_at = excluded.saved_at",
        )
        .bind(&draft.id)
        .bind(serde_json::to_string(&draft.data)?)
        .bind(draft.saved_at)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    pub async fn get_draft(&self, id: &str) -> Result<Option<Draft>, StoreError> {
        let row = sqlx::query("SELECT id, data, saved_at FROM local_drafts WHERE id = ?1")
            .bind(id)
            .fetch_optional(&self.pool)
            .await?;
        row.as_ref().map(draft_from_row).transpose()
    }

    pub async fn all_drafts(&self) -> Result<Vec<Draft>, StoreError> {
        let rows = sqlx::query("SELECT id, data, saved_at FROM local_drafts ORDER BY saved_at DESC")
            .fetch_all(&self.pool)
            .await?;
        rows.iter().map(draft_from_row).collect()
    }

    pub async fn delete_draft(&self, id: &str) -> Result<(), StoreError> {
        sqlx::query("DELETE FROM local_drafts WHERE id = ?1")
            .bind(id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    pub async fn clear_drafts(&self) -> Result<(), StoreError> {
        sqlx::query("DELETE FROM local_drafts")
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    /// Empties all three tables atomically.
    pub async fn clear_all(&self) -> Result<(), StoreError> {
        let mut tx = self.pool.begin().await?;
        sqlx::query("DELETE FROM pending_operations")
            .execute(&mut *tx)
            .await?;
        sqlx::query("DELETE FROM sync_log").execute(&mut *tx).await?;
        sqlx::query("DELETE FROM local_drafts")
            .execute(&mut *tx)
            .await?;
        tx.commit().await?;
        Ok(())
    }
}

pub fn default_db_path() -> Result<PathBuf, StoreError> {
    let base = dirs::data_dir().ok_or(StoreError::MissingDataDir)?;
    Ok(base.join("worldstory").join("offline_sync.db"))
}

fn stored_count(value: i64) -> u32 {
    u32::try_from(value.max(0)).unwrap_or(u32::MAX)
}

fn operation_from_row(row: &SqliteRow) -> Result<Operation, StoreError> {
    let operation_type: String = row.try_get("operation_type")?;
    let status: String = row.try_get("status")?;
    let payload: String = row.try_get("payload")?;
    Ok(Operation {
        id: row.try_get("id")?,
        operation_type: OperationType::parse(&operation_type)?,
        endpoint: row.try_get("endpoint")?,
        payload: serde_json::from_str(&payload)?,
        status: SyncStatus::parse(&status)?,
        timestamp: row.try_get("timestamp")?,
        updated_at: row.try_get("updated_at")?,
        retries: stored_count(row.try_get("retries")?),
        max_retries: stored_count(row.try_get("max_retries")?),
        local_id: row.try_get("local_id")?,
        server_id: row.try_get("server_id")?,
        error: row.try_get("error")?,
    })
}

fn log_entry_from_row(row: &SqliteRow) -> Result<SyncLogEntry, StoreError> {
    let status: String = row.try_get("status")?;
    let response: Option<String> = row.try_get("response")?;
    let response: Option<Value> = response
        .as_deref()
        .map(serde_json::from_str)
        .transpose()?;
    Ok(SyncLogEntry {
        id: row.try_get("id")?,
        operation_id: row.try_get("operation_id")?,
        status: SyncStatus::parse(&status)?,
        timestamp: row.try_get("timestamp")?,
        response,
        error: row.try_get("error")?,
    })
}

fn draft_from_row(row: &SqliteRow) -> Result<Draft, StoreError> {
    let data: String = row.try_get("data")?;
    Ok(Draft {
        id: row.try_get("id")?,
        data: serde_json::from_str(&data)?,
        saved_at: row.try_get("saved_at")?,
    })
}

#[cfg(test)]
#[path = "store_tests.rs"]
mod tests;
