//! Engine statistics.
//!
//! Plain relaxed atomic counters. `snapshot()` copies them into a
//! serializable struct for reporting.

use serde::Serialize;
use std::sync::atomic::{AtomicU64, Ordering};

macro_rules! define_stats {
    ($($field:ident),* $(,)?) => {
        /// Live counters shared by every component.
        #[derive(Debug, Default)]
        pub struct Stats {
            $(pub $field: AtomicU64,)*
        }

        /// Point-in-time copy of [`Stats`].
        #[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
        pub struct StatsSnapshot {
            $(pub $field: u64,)*
        }

        impl Stats {
            pub fn snapshot(&self) -> StatsSnapshot {
                StatsSnapshot {
                    $($field: self.$field.load(Ordering::Relaxed),)*
                }
            }
        }
    };
}

define_stats!(
    txn_begin,
    txn_commit,
    txn_rollback,
    txn_prepare,
    txn_conflict,
    prepared_conflict,
    hs_insert,
    hs_insert_delta,
    hs_squashed,
    hs_read,
    hs_removed,
    hs_obsolete_removed,
    hs_delta_rebased,
    hs_leaf_splits,
    hs_leaf_reads,
    hs_leaf_writes,
    hs_leaf_evicted,
    rec_pages,
    rec_residual_keys,
    evict_pages,
    evict_busy,
    evict_app_assist,
    evict_failed,
    page_splits,
    page_reads,
    chain_truncated,
    checkpoints,
    checkpoint_pages,
    checkpoint_blocks_freed,
    rts_runs,
    rts_upd_aborted,
    rts_keys_restored,
    rts_keys_removed,
    rts_stop_cleared,
    rts_hs_removed,
    rts_pages_visited,
    rts_trees_skipped_logged,
    wal_records_replayed,
    block_writes,
    block_frees,
);

impl Stats {
    #[inline]
    pub fn incr(counter: &AtomicU64) {
        counter.fetch_add(1, Ordering::Relaxed);
    }

    #[inline]
    pub fn add(counter: &AtomicU64, n: u64) {
        counter.fetch_add(n, Ordering::Relaxed);
    }
}

impl StatsSnapshot {
    pub fn to_json(&self) -> String {
        serde_json::to_string_pretty(self).unwrap_or_default()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_snapshot_counts() {
        let stats = Stats::default();
        Stats::incr(&stats.txn_commit);
        Stats::add(&stats.hs_insert, 3);
        let snap = stats.snapshot();
        assert_eq!(snap.txn_commit, 1);
        assert_eq!(snap.hs_insert, 3);
        assert!(snap.to_json().contains("\"hs_insert\": 3"));
    }
}
