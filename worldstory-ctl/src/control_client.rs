use anyhow::{Context, Result};
use serde_json::Value;
use worldstory_integrations::ids::{
    DBUS_INTERFACE_SYNC, DBUS_NAME_SYNC, DBUS_OBJECT_PATH_SYNC,
};
use zbus::blocking::{Connection, Proxy};

/// Blocking client for `io.worldstory.OfflineSync1`.
pub struct SyncClient {
    connection: Connection,
}

impl SyncClient {
    pub fn connect() -> Result<Self> {
        let connection =
            Connection::session().context("failed to connect to session D-Bus for OfflineSync1")?;
        Ok(Self { connection })
    }

    pub fn status(&self) -> Result<Value> {
        let raw: String = self
            .proxy()?
            .call("GetStatus", &())
            .context("GetStatus failed")?;
        decode(&raw)
    }

    pub fn list_operations(&self, status: Option<&str>) -> Result<Value> {
        let raw: String = self
            .proxy()?
            .call("ListOperations", &(status.unwrap_or(""),))
            .context("ListOperations failed")?;
        decode(&raw)
    }

    pub fn enqueue(&self, operation_type: &str, endpoint: &str, payload_json: &str) -> Result<i64> {
        self.proxy()?
            .call("Enqueue", &(operation_type, endpoint, payload_json, 0u32))
            .context("Enqueue failed")
    }

    pub fn delete_operation(&self, id: i64) -> Result<()> {
        self.proxy()?
            .call::<_, _, ()>("DeleteOperation", &(id,))
            .context("DeleteOperation failed")
    }

    pub fn retry_operation(&self, id: i64) -> Result<()> {
        self.proxy()?
            .call::<_, _, ()>("RetryOperation", &(id,))
            .context("RetryOperation failed")
    }

    pub fn retry_failed(&self) -> Result<u32> {
        self.proxy()?
            .call("RetryFailed", &())
            .context("RetryFailed failed")
    }

    pub fn sync_now(&self) -> Result<bool> {
        self.proxy()?
            .call("SyncNow", &())
            .context("SyncNow failed")
    }

    pub fn clear_all(&self) -> Result<()> {
        self.proxy()?
            .call::<_, _, ()>("ClearAll", &())
            .context("ClearAll failed")
    }

    pub fn sync_log(&self, limit: u32) -> Result<Value> {
        let raw: String = self
            .proxy()?
            .call("GetSyncLog", &(limit,))
            .context("GetSyncLog failed")?;
        decode(&raw)
    }

    pub fn set_online(&self, online: bool) -> Result<()> {
        self.proxy()?
            .call::<_, _, ()>("SetOnline", &(online,))
            .context("SetOnline failed")
    }

    pub fn clear_online_override(&self) -> Result<()> {
        self.proxy()?
            .call::<_, _, ()>("ClearOnlineOverride", &())
            .context("ClearOnlineOverride failed")
    }

    fn proxy(&self) -> Result<Proxy<'_>> {
        Proxy::new(
            &self.connection,
            DBUS_NAME_SYNC,
            DBUS_OBJECT_PATH_SYNC,
            DBUS_INTERFACE_SYNC,
        )
        .context("failed to create OfflineSync1 proxy")
    }
}

fn decode(raw: &str) -> Result<Value> {
    serde_json::from_str(raw).context("daemon returned invalid JSON")
}
