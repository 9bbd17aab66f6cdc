use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;

pub const DEFAULT_MAX_RETRIES: u32 = 3;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum QueueError {
    #[error("invalid operation type: {0}")]
    InvalidOperationType(String),
    #[error("invalid sync status: {0}")]
    InvalidStatus(String),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum OperationType {
    Create,
    Update,
    Delete,
}

impl OperationType {
    pub fn as_str(self) -> &'static str {
        match self {
            OperationType::Create => "CREATE",
            OperationType::Update => "UPDATE",
            OperationType::Delete => "DELETE",
        }
    }

    pub fn parse(value: &str) -> Result<Self, QueueError> {
        match value {
            "CREATE" => Ok(OperationType::Create),
            "UPDATE" => Ok(OperationType::Update),
            "DELETE" => Ok(OperationType::Delete),
            other => Err(QueueError::InvalidOperationType(other.to_string())),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SyncStatus {
    Pending,
    Syncing,
    Synced,
    Failed,
}

impl SyncStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            SyncStatus::Pending => "pending",
            SyncStatus::Syncing => "syncing",
            SyncStatus::Synced => "synced",
            SyncStatus::Failed => "failed",
        }
    }

    pub fn parse(value: &str) -> Result<Self, QueueError> {
        match value {
            "pending" => Ok(SyncStatus::Pending),
            "syncing" => Ok(SyncStatus::Syncing),
            "synced" => Ok(SyncStatus::Synced),
            "failed" => Ok(SyncStatus::Failed),
            other => Err(QueueError::InvalidStatus(other.to_string())),
        }
    }
}

/// A queued mutation waiting to be replayed against the remote API.
///
/// Timestamps are Unix milliseconds.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Operation {
    pub id: i64,
    pub operation_type: OperationType,
    pub endpoint: String,
    pub payload: Value,
    pub status: SyncStatus,
    pub timestamp: i64,
    pub updated_at: Option<i64>,
    pub retries: u32,
    pub max_retries: u32,
    pub local_id: Option<String>,
    pub server_id: Option<String>,
    pub error: Option<String>,
}

/// Insert form of [`Operation`]; the store assigns the id.
#[derive(Debug, Clone, PartialEq)]
pub struct NewOperation {
    pub operation_type: OperationType,
    pub endpoint: String,
    pub payload: Value,
    pub status: SyncStatus,
    pub timestamp: i64,
    pub retries: u32,
    pub max_retries: u32,
    pub local_id: Option<String>,
    pub server_id: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct OperationOptions {
    /// `None` falls back to the manager default. `Some(0)` fails on the first error.
    pub max_retries: Option<u32>,
    pub local_id: Option<String>,
    pub server_id: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SyncLogEntry {
    pub id: i64,
    pub operation_id: i64,
    pub status: SyncStatus,
    pub timestamp: i64,
    pub response: Option<Value>,
    pub error: Option<String>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct NewLogEntry {
    pub operation_id: i64,
    pub status: SyncStatus,
    pub timestamp: i64,
    pub response: Option<Value>,
    pub error: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Draft {
    pub id: String,
    pub data: Value,
    pub saved_at: i64,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct StatusCounts {
    pub pending: u64,
    pub syncing: u64,
    pub synced: u64,
    pub failed: u64,
}

impl StatusCounts {
    pub fn bump(&mut self, status: SyncStatus) {
        match status {
            SyncStatus::Pending => self.pending += 1,
            SyncStatus::Syncing => self.syncing += 1,
            SyncStatus::Synced => self.synced += 1,
            SyncStatus::Failed => self.failed += 1,
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub struct TypeCounts {
    pub create: u64,
    pub update: u64,
    pub delete: u64,
}

impl TypeCounts {
    pub fn bump(&mut self, operation_type: OperationType) {
        match operation_type {
            OperationType::Create => self.create += 1,
            OperationType::Update => self.update += 1,
            OperationType::Delete => self.delete += 1,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct QueueStats {
    pub total_pending: u64,
    pub by_status: StatusCounts,
    pub by_operation: TypeCounts,
    pub recent_sync: Vec<SyncLogEntry>,
}
