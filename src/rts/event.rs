//! Rollback-to-stable trace and its verifier.

use crate::error::{LapisError, Result};
use crate::types::{ts_hex, Key, TableId, Timestamp};
use serde::Serialize;
use std::collections::HashMap;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum AbortReason {
    /// Durable after the stable timestamp
    Unstable,
    /// Prepared and never resolved
    Prepared,
    /// Written by a transaction the recovery checkpoint did not include
    RecoverySnapshot,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum RestoreSource {
    HistoryStore,
    /// The on-disk cell minus its unstable stop
    DataStore,
}

/// One step of a rollback, in the order it happened.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub enum RtsEvent {
    Init {
        stable: Timestamp,
    },
    /// Decision whether a table needs visiting
    Tree {
        table: TableId,
        modified: bool,
        durable_gt_stable: bool,
        has_prepared: bool,
        txnid_gt_recov: bool,
        stable: Timestamp,
    },
    TreeLogging {
        table: TableId,
        logging: bool,
        skipped: bool,
    },
    PageRollback {
        table: TableId,
        page: u64,
        max_durable_ts: Timestamp,
    },
    UpdateAbort {
        table: TableId,
        key: Key,
        start_ts: Timestamp,
        durable_ts: Timestamp,
        reason: AbortReason,
    },
    KeyRestored {
        table: TableId,
        key: Key,
        start_ts: Timestamp,
        source: RestoreSource,
    },
    KeyRemoved {
        table: TableId,
        key: Key,
    },
    HsSweep {
        removed: usize,
        stops_cleared: usize,
    },
}

/// Outcome of a rollback.
#[derive(Debug, Clone, Default, Serialize)]
pub struct RtsReport {
    pub stable: Timestamp,
    pub dryrun: bool,
    pub trees_visited: usize,
    pub trees_skipped_logged: usize,
    pub pages_visited: usize,
    pub upd_aborted: usize,
    pub keys_restored: usize,
    pub keys_removed: usize,
    pub hs_removed: usize,
    pub hs_stops_cleared: usize,
    pub events: Vec<RtsEvent>,
}

impl RtsReport {
    /// Whether the rollback changed (or, in dry-run, would change) anything.
    pub fn changed(&self) -> bool {
        self.upd_aborted + self.keys_restored + self.keys_removed + self.hs_removed + self.hs_stops_cleared > 0
    }

    pub fn to_json(&self) -> String {
        serde_json::to_string_pretty(self).unwrap_or_default()
    }
}

#[derive(Debug, Default)]
struct TreeState {
    needs_visit: bool,
    skipped: bool,
    logging_seen: bool,
}

/// Replays an event trace and rejects any that breaks the rules of a
/// rollback: init first, stable constant, each table decided once, no work
/// on tables that did not need it, logged tables skipped only with logging
/// on, aborts for instability only above stable.
#[derive(Debug, Default)]
pub struct RtsChecker {
    stable: Option<Timestamp>,
    logging_enabled: bool,
    trees: HashMap<TableId, TreeState>,
}

impl RtsChecker {
    pub fn new(logging_enabled: bool) -> Self {
        Self {
            logging_enabled,
            ..Default::default()
        }
    }

    fn fail(msg: String) -> Result<()> {
        Err(LapisError::Panic(format!("rollback-to-stable check failed: {}", msg)))
    }

    fn tree(&self, table: TableId, what: &str) -> Result<&TreeState> {
        match self.trees.get(&table) {
            Some(t) if t.skipped => Err(LapisError::Panic(format!(
                "rollback-to-stable check failed: {} in skipped table {}",
                what, table
            ))),
            Some(t) if !t.needs_visit => Err(LapisError::Panic(format!(
                "rollback-to-stable check failed: {} in table {} that needed no rollback",
                what, table
            ))),
            Some(t) => Ok(t),
            None => Err(LapisError::Panic(format!(
                "rollback-to-stable check failed: {} before table {} was examined",
                what, table
            ))),
        }
    }

    pub fn apply(&mut self, event: &RtsEvent) -> Result<()> {
        if self.stable.is_none() && !matches!(event, RtsEvent::Init { .. }) {
            return Self::fail("event before init".into());
        }
        match event {
            RtsEvent::Init { stable } => {
                if self.stable.is_some() {
                    return Self::fail("init seen twice".into());
                }
                self.stable = Some(*stable);
            }
            RtsEvent::Tree {
                table,
                modified,
                durable_gt_stable,
                has_prepared,
                txnid_gt_recov,
                stable,
            } => {
                if Some(*stable) != self.stable {
                    return Self::fail(format!(
                        "stable timestamp moved to {} while visiting table {}",
                        ts_hex(*stable),
                        table
                    ));
                }
                if self.trees.contains_key(table) {
                    return Self::fail(format!("table {} visited twice", table));
                }
                self.trees.insert(
                    *table,
                    TreeState {
                        needs_visit: *modified || *durable_gt_stable || *has_prepared || *txnid_gt_recov,
                        ..Default::default()
                    },
                );
            }
            RtsEvent::TreeLogging { table, logging, skipped } => {
                let Some(tree) = self.trees.get_mut(table) else {
                    return Self::fail(format!("logging decision before table {} was examined", table));
                };
                if tree.logging_seen {
                    return Self::fail(format!("logging decided twice for table {}", table));
                }
                if *logging != self.logging_enabled {
                    return Self::fail(format!("table {} saw inconsistent logging state", table));
                }
                if *skipped && !self.logging_enabled {
                    return Self::fail(format!("table {} skipped as logged with logging off", table));
                }
                tree.logging_seen = true;
                tree.skipped = *skipped;
            }
            RtsEvent::PageRollback { table, .. } => {
                self.tree(*table, "page rollback")?;
            }
            RtsEvent::UpdateAbort {
                table,
                durable_ts,
                reason,
                ..
            } => {
                self.tree(*table, "update abort")?;
                let stable = self.stable.unwrap_or_default();
                if *reason == AbortReason::Unstable && *durable_ts <= stable {
                    return Self::fail(format!(
                        "aborted an update durable at {} not after stable {}",
                        ts_hex(*durable_ts),
                        ts_hex(stable)
                    ));
                }
            }
            RtsEvent::KeyRestored { table, .. } => {
                self.tree(*table, "key restore")?;
            }
            RtsEvent::KeyRemoved { table, .. } => {
                self.tree(*table, "key removal")?;
            }
            RtsEvent::HsSweep { .. } => {}
        }
        Ok(())
    }

    /// Check a whole trace.
    pub fn check(logging_enabled: bool, events: &[RtsEvent]) -> Result<()> {
        let mut checker = Self::new(logging_enabled);
        events.iter().try_for_each(|e| checker.apply(e))
    }
}
