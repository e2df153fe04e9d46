//! Snapshot Implementation

use crate::types::TxnId;
use serde::{Deserialize, Serialize};

/// The set of transactions a reader treats as invisible.
///
/// Ids below `snap_min` are resolved (committed or aborted), ids at or above
/// `snap_max` started after the snapshot, and ids in between are invisible
/// only if listed in `concurrent`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Snapshot {
    pub snap_min: TxnId,
    pub snap_max: TxnId,
    /// Transactions running when the snapshot was taken, sorted
    pub concurrent: Vec<TxnId>,
}

impl Snapshot {
    pub fn new(snap_max: TxnId, mut concurrent: Vec<TxnId>) -> Self {
        concurrent.sort_unstable();
        concurrent.dedup();
        let snap_min = concurrent.first().copied().unwrap_or(snap_max).min(snap_max);
        Self {
            snap_min,
            snap_max,
            concurrent,
        }
    }

    /// A snapshot in which every resolved transaction is visible.
    pub fn all() -> Self {
        Self {
            snap_min: TxnId::MAX,
            snap_max: TxnId::MAX,
            concurrent: Vec::new(),
        }
    }

    /// Check if a transaction's writes are visible in this snapshot
    #[inline]
    pub fn is_visible(&self, id: TxnId) -> bool {
        if id < self.snap_min {
            return true;
        }
        if id >= self.snap_max {
            return false;
        }
        self.concurrent.binary_search(&id).is_err()
    }
}
