use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};
use worldstory_core::StoryClient;

use super::backoff::ProbeBackoff;

#[derive(Debug, Clone, Copy)]
pub struct ProbeConfig {
    /// Delay between probes while the API is reachable.
    pub interval: Duration,
    pub timeout: Duration,
    pub offline_backoff: ProbeBackoff,
}

impl ProbeConfig {
    pub fn with_interval(interval: Duration) -> Self {
        Self {
            interval,
            timeout: Duration::from_secs(5),
            offline_backoff: ProbeBackoff::new(Duration::from_secs(1), interval),
        }
    }
}

/// Shared online/offline flag with change notification.
///
/// Only real transitions wake subscribers; setting the current value again is a no-op.
/// A manual override pins the flag until [`ConnectivityMonitor::clear_override`];
/// probe results are ignored meanwhile.
#[derive(Debug, Clone)]
pub struct ConnectivityMonitor {
    tx: Arc<watch::Sender<bool>>,
    pinned: Arc<AtomicBool>,
}

impl ConnectivityMonitor {
    pub fn new(initially_online: bool) -> Self {
        let (tx, _) = watch::channel(initially_online);
        Self {
            tx: Arc::new(tx),
            pinned: Arc::new(AtomicBool::new(false)),
        }
    }

    /// Sets the state and keeps it there regardless of probe results.
    pub fn override_online(&self, online: bool) -> bool {
        self.pinned.store(true, Ordering::SeqCst);
        info!(online, "connectivity pinned manually");
        self.set_online(online)
    }

    /// Hands the state back to the probe; the next probe result applies.
    pub fn clear_override(&self) {
        if self.pinned.swap(false, Ordering::SeqCst) {
            info!("connectivity override cleared");
        }
    }

    pub fn is_overridden(&self) -> bool {
        self.pinned.load(Ordering::SeqCst)
    }

    pub fn is_online(&self) -> bool {
        *self.tx.borrow()
    }

    /// Returns whether the state actually changed.
    pub fn set_online(&self, online: bool) -> bool {
        let changed = self.tx.send_if_modified(|current| {
            if *current == online {
                false
            } else {
                *current = online;
                true
            }
        });
        if changed {
            if online {
                info!("connectivity restored");
            } else {
                info!("connectivity lost");
            }
        }
        changed
    }

    pub fn subscribe(&self) -> watch::Receiver<bool> {
        self.tx.subscribe()
    }

    /// Probes the API host until `shutdown`, feeding results into this monitor.
    pub fn spawn_probe(
        &self,
        client: StoryClient,
        config: ProbeConfig,
        shutdown: CancellationToken,
    ) -> JoinHandle<()> {
        let monitor = self.clone();
        tokio::spawn(async move {
            let mut failures = 0u32;
            loop {
                let online = probe_once(&client, config.timeout).await;
                if monitor.is_overridden() {
                    debug!(online, "probe result ignored: connectivity pinned");
                } else {
                    monitor.set_online(online);
                }
                let delay = if online {
                    failures = 0;
                    config.interval
                } else {
                    failures = failures.saturating_add(1);
                    config.offline_backoff.next_delay(failures)
                };
                tokio::select! {
                    _ = shutdown.cancelled() => break,
                    _ = tokio::time::sleep(delay) => {}
                }
            }
            debug!("connectivity probe stopped");
        })
    }
}

/// Any HTTP answer within `timeout` counts as reachable.
pub async fn probe_once(client: &StoryClient, timeout: Duration) -> bool {
    match tokio::time::timeout(timeout, client.probe()).await {
        Ok(Ok(status)) => {
            debug!(status = status.as_u16(), "connectivity probe answered");
            true
        }
        Ok(Err(err)) => {
            debug!(error = %err, "connectivity probe failed");
            false
        }
        Err(_) => {
            debug!("connectivity probe timed out");
            false
        }
    }
}
