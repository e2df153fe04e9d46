//! Update records.

use super::Modify;
use crate::txn::PrepareState;
use crate::types::{Timestamp, TimeWindow, TxnId, Value, TS_NONE, TXN_ABORTED};
use arc_swap::ArcSwapOption;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::atomic::{AtomicU64, AtomicU8, Ordering};
use std::sync::Arc;

/// Payload of an update.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum UpdateValue {
    Full(Value),
    Delta(Modify),
    Tombstone,
}

impl UpdateValue {
    pub fn mem_size(&self) -> usize {
        match self {
            UpdateValue::Full(v) => v.len(),
            UpdateValue::Delta(m) => m.mem_size(),
            UpdateValue::Tombstone => 0,
        }
    }

    pub fn kind(&self) -> &'static str {
        match self {
            UpdateValue::Full(_) => "full",
            UpdateValue::Delta(_) => "delta",
            UpdateValue::Tombstone => "tombstone",
        }
    }
}

/// The update has a copy in the history store.
pub const UPD_IN_HS: u8 = 0x01;
/// Restored from the history store by rollback-to-stable.
pub const UPD_RESTORED_FROM_HS: u8 = 0x02;
/// Restored from an on-disk cell by rollback-to-stable.
pub const UPD_RESTORED_FROM_DS: u8 = 0x04;

/// One version of a key.
///
/// The payload and writer are fixed at creation. Timestamps are filled in
/// at prepare/commit; the txn id is overwritten with `TXN_ABORTED` when the
/// writer rolls back. `next` links to the next-older version.
pub struct Update {
    writer: TxnId,
    txn_id: AtomicU64,
    start_ts: AtomicU64,
    durable_ts: AtomicU64,
    prepare: AtomicU8,
    flags: AtomicU8,
    pub value: UpdateValue,
    next: ArcSwapOption<Update>,
}

impl Update {
    pub fn new(writer: TxnId, value: UpdateValue) -> Self {
        Self {
            writer,
            txn_id: AtomicU64::new(writer),
            start_ts: AtomicU64::new(TS_NONE),
            durable_ts: AtomicU64::new(TS_NONE),
            prepare: AtomicU8::new(PrepareState::None as u8),
            flags: AtomicU8::new(0),
            value,
            next: ArcSwapOption::empty(),
        }
    }

    /// An already-committed update carrying the given time window start.
    pub fn committed(tw_start: &TimeWindow, value: UpdateValue, flags: u8) -> Self {
        let upd = Self::new(tw_start.start_txn, value);
        upd.start_ts.store(tw_start.start_ts, Ordering::Release);
        upd.durable_ts.store(tw_start.durable_start_ts, Ordering::Release);
        upd.flags.store(flags, Ordering::Release);
        upd
    }

    /// Transaction that created the update, even after an abort.
    #[inline]
    pub fn writer(&self) -> TxnId {
        self.writer
    }

    #[inline]
    pub fn txn_id(&self) -> TxnId {
        self.txn_id.load(Ordering::Acquire)
    }

    #[inline]
    pub fn is_aborted(&self) -> bool {
        self.txn_id() == TXN_ABORTED
    }

    pub fn mark_aborted(&self) {
        self.txn_id.store(TXN_ABORTED, Ordering::Release);
    }

    #[inline]
    pub fn start_ts(&self) -> Timestamp {
        self.start_ts.load(Ordering::Acquire)
    }

    #[inline]
    pub fn durable_ts(&self) -> Timestamp {
        self.durable_ts.load(Ordering::Acquire)
    }

    #[inline]
    pub fn prepare_state(&self) -> PrepareState {
        PrepareState::from_u8(self.prepare.load(Ordering::Acquire))
    }

    pub fn is_prepared_in_progress(&self) -> bool {
        self.prepare_state() == PrepareState::InProgress
    }

    /// Stamp the prepare timestamp; the update stays unresolved.
    pub fn set_prepared(&self, prepare_ts: Timestamp) {
        self.start_ts.store(prepare_ts, Ordering::Release);
        self.durable_ts.store(prepare_ts, Ordering::Release);
        self.prepare.store(PrepareState::InProgress as u8, Ordering::Release);
    }

    /// Stamp commit timestamps, resolving a prepare if there was one.
    pub fn set_committed(&self, commit_ts: Timestamp, durable_ts: Timestamp) {
        self.start_ts.store(commit_ts, Ordering::Release);
        self.durable_ts.store(durable_ts, Ordering::Release);
        if self.prepare_state() == PrepareState::InProgress {
            self.prepare.store(PrepareState::Resolved as u8, Ordering::Release);
        }
    }

    /// Forget the writer id once the update is globally visible from a
    /// previous incarnation.
    pub fn clear_txn(&self) {
        if !self.is_aborted() {
            self.txn_id.store(crate::types::TXN_NONE, Ordering::Release);
        }
    }

    #[inline]
    pub fn has_flag(&self, flag: u8) -> bool {
        self.flags.load(Ordering::Acquire) & flag != 0
    }

    pub fn set_flag(&self, flag: u8) {
        self.flags.fetch_or(flag, Ordering::AcqRel);
    }

    pub fn clear_flag(&self, flag: u8) {
        self.flags.fetch_and(!flag, Ordering::AcqRel);
    }

    #[inline]
    pub fn next(&self) -> Option<Arc<Update>> {
        self.next.load_full()
    }

    pub(crate) fn set_next(&self, next: Option<Arc<Update>>) {
        self.next.store(next);
    }

    pub fn is_tombstone(&self) -> bool {
        matches!(self.value, UpdateValue::Tombstone)
    }

    pub fn is_delta(&self) -> bool {
        matches!(self.value, UpdateValue::Delta(_))
    }

    /// Time window start of this version.
    pub fn time_window(&self) -> TimeWindow {
        TimeWindow::new(self.start_ts(), self.durable_ts(), self.txn_id())
    }

    pub fn mem_size(&self) -> usize {
        std::mem::size_of::<Update>() + self.value.mem_size()
    }
}

impl fmt::Debug for Update {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Update")
            .field("txn_id", &self.txn_id())
            .field("start_ts", &self.start_ts())
            .field("durable_ts", &self.durable_ts())
            .field("prepare", &self.prepare_state())
            .field("kind", &self.value.kind())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_commit_resolves_prepare() {
        let upd = Update::new(5, UpdateValue::Full(b"v".to_vec()));
        upd.set_prepared(10);
        assert!(upd.is_prepared_in_progress());
        assert_eq!(upd.start_ts(), 10);

        upd.set_committed(12, 15);
        assert_eq!(upd.prepare_state(), PrepareState::Resolved);
        assert_eq!(upd.start_ts(), 12);
        assert_eq!(upd.durable_ts(), 15);
    }

    #[test]
    fn test_abort_keeps_writer() {
        let upd = Update::new(9, UpdateValue::Tombstone);
        upd.mark_aborted();
        assert!(upd.is_aborted());
        assert_eq!(upd.writer(), 9);
        upd.clear_txn();
        assert!(upd.is_aborted());
    }

    #[test]
    fn test_flags() {
        let upd = Update::new(1, UpdateValue::Full(vec![]));
        upd.set_flag(UPD_IN_HS);
        upd.set_flag(UPD_RESTORED_FROM_HS);
        assert!(upd.has_flag(UPD_IN_HS));
        upd.clear_flag(UPD_IN_HS);
        assert!(!upd.has_flag(UPD_IN_HS));
        assert!(upd.has_flag(UPD_RESTORED_FROM_HS));
    }

    #[test]
    fn test_committed_constructor() {
        let tw = TimeWindow::new(10, 12, 4);
        let upd = Update::committed(&tw, UpdateValue::Full(b"x".to_vec()), UPD_RESTORED_FROM_DS);
        assert_eq!(upd.start_ts(), 10);
        assert_eq!(upd.durable_ts(), 12);
        assert_eq!(upd.txn_id(), 4);
        assert!(upd.has_flag(UPD_RESTORED_FROM_DS));
    }
}
