//! Visibility Resolver
//!
//! Picks the newest version of a key that a reader may see: first from the
//! in-memory chain, then the on-disk cell, then the history store.

use super::{Modify, Update, UpdateChain, UpdateValue};
use crate::btree::Cell;
use crate::error::{LapisError, Result};
use crate::txn::{IsolationLevel, Snapshot, TxnGlobal};
use crate::types::{Timestamp, TimeWindow, TxnId, Value, TS_MAX, TXN_ABORTED, TXN_NONE};
use smallvec::SmallVec;

/// Outcome of testing one update against a reader.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Visibility {
    Visible,
    Invisible,
    /// An unresolved prepared update sits at the reader's read point
    Prepared,
}

/// Everything needed to decide visibility for one read.
#[derive(Clone, Copy)]
pub struct ReadContext<'a> {
    pub txn_id: TxnId,
    pub isolation: IsolationLevel,
    pub snapshot: Option<&'a Snapshot>,
    /// `TS_MAX` when the reader has no read timestamp
    pub read_ts: Timestamp,
    pub global: Option<&'a TxnGlobal>,
}

impl<'a> ReadContext<'a> {
    /// A reader that sees every committed version at `read_ts`.
    pub fn committed(global: &'a TxnGlobal, read_ts: Option<Timestamp>) -> Self {
        Self {
            txn_id: TXN_NONE,
            isolation: IsolationLevel::ReadCommitted,
            snapshot: None,
            read_ts: read_ts.unwrap_or(TS_MAX),
            global: Some(global),
        }
    }

    /// A reader bound to a fixed snapshot (checkpoints, checkpoint readers).
    pub fn at_snapshot(snapshot: &'a Snapshot, read_ts: Option<Timestamp>) -> Self {
        Self {
            txn_id: TXN_NONE,
            isolation: IsolationLevel::Snapshot,
            snapshot: Some(snapshot),
            read_ts: read_ts.unwrap_or(TS_MAX),
            global: None,
        }
    }

    pub fn txn_visible(&self, id: TxnId) -> bool {
        if id == TXN_ABORTED {
            return false;
        }
        if id == TXN_NONE || (self.txn_id != TXN_NONE && id == self.txn_id) {
            return true;
        }
        if self.isolation == IsolationLevel::ReadUncommitted {
            return true;
        }
        match (self.snapshot, self.global) {
            (Some(snap), Some(global)) => snap.is_visible(id) && global.is_committed(id),
            (Some(snap), None) => snap.is_visible(id),
            (None, Some(global)) => global.is_committed(id),
            (None, None) => true,
        }
    }

    pub fn update_visibility(&self, upd: &Update) -> Visibility {
        let txn = upd.txn_id();
        if txn == TXN_ABORTED {
            return Visibility::Invisible;
        }
        let own = self.txn_id != TXN_NONE && txn == self.txn_id;
        if upd.is_prepared_in_progress() && !own {
            return if upd.start_ts() <= self.read_ts {
                Visibility::Prepared
            } else {
                Visibility::Invisible
            };
        }
        if own {
            return Visibility::Visible;
        }
        if !self.txn_visible(txn) {
            return Visibility::Invisible;
        }
        if upd.start_ts() > self.read_ts {
            return Visibility::Invisible;
        }
        Visibility::Visible
    }

    pub fn tw_start_visible(&self, tw: &TimeWindow) -> bool {
        self.txn_visible(tw.start_txn) && tw.start_ts <= self.read_ts
    }

    pub fn tw_stop_visible(&self, tw: &TimeWindow) -> bool {
        tw.has_stop() && self.txn_visible(tw.stop_txn) && tw.stop_ts <= self.read_ts
    }

    /// Visible start and invisible stop.
    pub fn tw_visible(&self, tw: &TimeWindow) -> bool {
        self.tw_start_visible(tw) && !self.tw_stop_visible(tw)
    }
}

/// The history store as seen for one key.
pub trait HistoryLookup {
    /// Newest history version visible to `ctx`; `Ok(None)` if there is none
    /// or the visible state is "deleted".
    fn newest_visible(&self, ctx: &ReadContext<'_>) -> Result<Option<Value>>;

    /// Newest history version regardless of visibility, fully materialized.
    fn newest_full(&self) -> Result<Option<Value>>;
}

/// A key with no history.
pub struct NoHistory;

impl HistoryLookup for NoHistory {
    fn newest_visible(&self, _ctx: &ReadContext<'_>) -> Result<Option<Value>> {
        Ok(None)
    }

    fn newest_full(&self) -> Result<Option<Value>> {
        Ok(None)
    }
}

/// Resolve the value of one key for `ctx`.
pub fn resolve(
    ctx: &ReadContext<'_>,
    chain: &UpdateChain,
    ondisk: Option<&Cell>,
    history: &dyn HistoryLookup,
) -> Result<Option<Value>> {
    let mut iter = chain.iter();
    while let Some(upd) = iter.next() {
        match ctx.update_visibility(&upd) {
            Visibility::Invisible => continue,
            Visibility::Prepared => return Err(LapisError::PreparedConflict),
            Visibility::Visible => {
                return match &upd.value {
                    UpdateValue::Full(v) => Ok(Some(v.clone())),
                    UpdateValue::Tombstone => Ok(None),
                    UpdateValue::Delta(m) => {
                        let mut deltas: SmallVec<[Modify; 4]> = SmallVec::new();
                        deltas.push(m.clone());
                        let base = delta_base(upd.writer(), &mut iter, &mut deltas, ondisk, history)?;
                        Ok(Some(Modify::apply_all(&base, deltas.iter().rev())))
                    }
                };
            }
        }
    }

    if let Some(cell) = ondisk {
        if ctx.tw_start_visible(&cell.tw) {
            if ctx.tw_stop_visible(&cell.tw) {
                return Ok(None);
            }
            return Ok(Some(cell.value.clone()));
        }
    }

    history.newest_visible(ctx)
}

/// Walk below a visible delta collecting further deltas until a full value.
/// The base of a delta is the next live update; finding the writer's own
/// update aborted underneath means the composite is not safe to build.
fn delta_base(
    writer: TxnId,
    iter: &mut impl Iterator<Item = std::sync::Arc<Update>>,
    deltas: &mut SmallVec<[Modify; 4]>,
    ondisk: Option<&Cell>,
    history: &dyn HistoryLookup,
) -> Result<Value> {
    for upd in iter.by_ref() {
        if upd.is_aborted() {
            if upd.writer() == writer {
                return Err(LapisError::conflict("modify base was rolled back"));
            }
            continue;
        }
        match &upd.value {
            UpdateValue::Full(v) => return Ok(v.clone()),
            UpdateValue::Tombstone => return Ok(Vec::new()),
            UpdateValue::Delta(m) => deltas.push(m.clone()),
        }
    }
    if let Some(cell) = ondisk {
        return Ok(cell.value.clone());
    }
    Ok(history.newest_full()?.unwrap_or_default())
}
