use std::panic::{AssertUnwindSafe, catch_unwind};

use serde::{Deserialize, Serialize};
use tokio::sync::broadcast::{self, error::RecvError};
use tokio::task::JoinHandle;
use tracing::{debug, error, warn};

use super::queue::SyncStatus;

const EVENT_BUFFER: usize = 256;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case", rename_all_fields = "camelCase")]
pub enum SyncEvent {
    /// A sync pass started or finished.
    Pass {
        is_syncing: bool,
        pending_count: u64,
        last_sync_time: Option<i64>,
    },
    /// One operation changed status.
    Operation {
        operation_id: i64,
        status: SyncStatus,
        error: Option<String>,
    },
}

/// Fan-out of [`SyncEvent`]s to any number of observers.
///
/// Publishing never blocks and never fails; slow receivers lose the oldest events.
#[derive(Debug, Clone)]
pub struct EventHub {
    tx: broadcast::Sender<SyncEvent>,
}

impl Default for EventHub {
    fn default() -> Self {
        Self::new(EVENT_BUFFER)
    }
}

impl EventHub {
    pub fn new(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity.max(1));
        Self { tx }
    }

    pub fn publish(&self, event: SyncEvent) {
        if self.tx.send(event).is_err() {
            debug!("sync event dropped: no observers");
        }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<SyncEvent> {
        self.tx.subscribe()
    }

    pub fn observer_count(&self) -> usize {
        self.tx.receiver_count()
    }

    /// Runs `callback` for every event on a dedicated task.
    ///
    /// Errors and panics raised by the callback are logged and do not stop delivery.
    /// Must be called from within a tokio runtime.
    pub fn on_event<F>(&self, mut callback: F) -> Subscription
    where
        F: FnMut(&SyncEvent) -> anyhow::Result<()> + Send + 'static,
    {
        let mut rx = self.tx.subscribe();
        let handle = tokio::spawn(async move {
            loop {
                match rx.recv().await {
                    Ok(event) => match catch_unwind(AssertUnwindSafe(|| callback(&event))) {
                        Ok(Ok(())) => {}
                        Ok(Err(err)) => error!(error = %err, "sync observer failed"),
                        Err(_) => error!("sync observer panicked"),
                    },
                    Err(RecvError::Lagged(skipped)) => {
                        warn!(skipped, "sync observer lagged behind");
                    }
                    Err(RecvError::Closed) => break,
                }
            }
        });
        Subscription { handle }
    }
}

/// Handle returned by [`EventHub::on_event`]; dropping it stops delivery.
#[derive(Debug)]
pub struct Subscription {
    handle: JoinHandle<()>,
}

impl Subscription {
    pub fn unsubscribe(self) {
        drop(self);
    }

    pub fn is_active(&self) -> bool {
        !self.handle.is_finished()
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        self.handle.abort();
    }
}
