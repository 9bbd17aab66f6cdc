pub mod ids;

use serde::{Deserialize, Serialize};

/// Coarse sync state shown to the user, derived from a status snapshot.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SyncHealth {
    Offline,
    Syncing,
    NeedsAttention,
    Pending,
    Idle,
}

impl SyncHealth {
    pub fn from_counts(is_online: bool, is_syncing: bool, pending: u64, failed: u64) -> Self {
        if !is_online {
            SyncHealth::Offline
        } else if is_syncing {
            SyncHealth::Syncing
        } else if failed > 0 {
            SyncHealth::NeedsAttention
        } else if pending > 0 {
            SyncHealth::Pending
        } else {
            SyncHealth::Idle
        }
    }

    pub fn label(self) -> &'static str {
        match self {
            SyncHealth::Offline => "Offline: changes are queued locally",
            SyncHealth::Syncing => "Syncing",
            SyncHealth::NeedsAttention => "Some operations failed",
            SyncHealth::Pending => "Waiting to sync",
            SyncHealth::Idle => "All changes synced",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn offline_wins_over_everything() {
        assert_eq!(SyncHealth::from_counts(false, true, 3, 1), SyncHealth::Offline);
    }

    #[test]
    fn failed_operations_need_attention_when_idle() {
        assert_eq!(
            SyncHealth::from_counts(true, false, 2, 1),
            SyncHealth::NeedsAttention
        );
        assert_eq!(SyncHealth::from_counts(true, true, 2, 1), SyncHealth::Syncing);
        assert_eq!(SyncHealth::from_counts(true, false, 2, 0), SyncHealth::Pending);
        assert_eq!(SyncHealth::from_counts(true, false, 0, 0), SyncHealth::Idle);
    }

    #[test]
    fn every_state_has_a_label() {
        for health in [
            SyncHealth::Offline,
            SyncHealth::Syncing,
            SyncHealth::NeedsAttention,
            SyncHealth::Pending,
            SyncHealth::Idle,
        ] {
            assert!(!health.label().is_empty());
        }
    }
}
