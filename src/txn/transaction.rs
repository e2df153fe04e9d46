//! Transaction Implementation

use super::{IsolationLevel, Snapshot};
use crate::btree::KeyEntry;
use crate::mvcc::Update;
use crate::types::{Key, TableId, Timestamp, TxnId, TS_NONE};
use std::sync::atomic::{AtomicU64, AtomicU8, Ordering};
use std::sync::Arc;

/// Transaction state
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum TxnState {
    Running = 0,
    Prepared = 1,
    Committed = 2,
    Aborted = 3,
}

impl TxnState {
    fn from_u8(v: u8) -> Self {
        match v {
            0 => TxnState::Running,
            1 => TxnState::Prepared,
            2 => TxnState::Committed,
            _ => TxnState::Aborted,
        }
    }
}

/// Prepare state of an individual update.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum PrepareState {
    None = 0,
    InProgress = 1,
    Resolved = 2,
}

impl PrepareState {
    pub fn from_u8(v: u8) -> Self {
        match v {
            1 => PrepareState::InProgress,
            2 => PrepareState::Resolved,
            _ => PrepareState::None,
        }
    }
}

/// The part of a transaction other threads can observe through the
/// transaction table.
#[derive(Debug)]
pub struct TxnShared {
    pub id: TxnId,
    state: AtomicU8,
    /// Read timestamp pinned by this transaction (TS_NONE if none)
    read_ts: AtomicU64,
    /// Oldest id this transaction's snapshot still treats as running
    snap_min: AtomicU64,
    commit_ts: AtomicU64,
    durable_ts: AtomicU64,
    prepare_ts: AtomicU64,
}

impl TxnShared {
    pub fn new(id: TxnId) -> Self {
        Self {
            id,
            state: AtomicU8::new(TxnState::Running as u8),
            read_ts: AtomicU64::new(TS_NONE),
            snap_min: AtomicU64::new(id),
            commit_ts: AtomicU64::new(TS_NONE),
            durable_ts: AtomicU64::new(TS_NONE),
            prepare_ts: AtomicU64::new(TS_NONE),
        }
    }

    #[inline]
    pub fn state(&self) -> TxnState {
        TxnState::from_u8(self.state.load(Ordering::Acquire))
    }

    pub fn set_state(&self, state: TxnState) {
        self.state.store(state as u8, Ordering::Release);
    }

    #[inline]
    pub fn read_ts(&self) -> Timestamp {
        self.read_ts.load(Ordering::Acquire)
    }

    pub fn set_read_ts(&self, ts: Timestamp) {
        self.read_ts.store(ts, Ordering::Release);
    }

    #[inline]
    pub fn snap_min(&self) -> TxnId {
        self.snap_min.load(Ordering::Acquire)
    }

    pub fn set_snap_min(&self, id: TxnId) {
        self.snap_min.store(id, Ordering::Release);
    }

    pub fn commit_ts(&self) -> Timestamp {
        self.commit_ts.load(Ordering::Acquire)
    }

    pub fn durable_ts(&self) -> Timestamp {
        self.durable_ts.load(Ordering::Acquire)
    }

    pub fn prepare_ts(&self) -> Timestamp {
        self.prepare_ts.load(Ordering::Acquire)
    }

    pub fn set_commit_ts(&self, commit: Timestamp, durable: Timestamp) {
        self.commit_ts.store(commit, Ordering::Release);
        self.durable_ts.store(durable, Ordering::Release);
    }

    pub fn set_prepare_ts(&self, ts: Timestamp) {
        self.prepare_ts.store(ts, Ordering::Release);
    }
}

/// One modification made by a transaction, kept so that commit can stamp it
/// and rollback can mark it aborted.
#[derive(Clone)]
pub struct TxnOp {
    pub table: TableId,
    pub key: Key,
    pub entry: Arc<KeyEntry>,
    pub update: Arc<Update>,
}

/// A transaction, owned by the session running it.
pub struct Transaction {
    pub shared: Arc<TxnShared>,
    pub isolation: IsolationLevel,
    /// Snapshot-isolation snapshot, or the per-operation snapshot for
    /// read-committed
    pub snapshot: Option<Snapshot>,
    pub read_ts: Timestamp,
    pub commit_ts: Timestamp,
    pub durable_ts: Timestamp,
    pub prepare_ts: Timestamp,
    pub ops: Vec<TxnOp>,
    /// Set when the transaction can no longer commit
    pub doomed: Option<String>,
}

impl Transaction {
    pub fn new(shared: Arc<TxnShared>, isolation: IsolationLevel) -> Self {
        Self {
            shared,
            isolation,
            snapshot: None,
            read_ts: TS_NONE,
            commit_ts: TS_NONE,
            durable_ts: TS_NONE,
            prepare_ts: TS_NONE,
            ops: Vec::new(),
            doomed: None,
        }
    }

    #[inline]
    pub fn id(&self) -> TxnId {
        self.shared.id
    }

    pub fn state(&self) -> TxnState {
        self.shared.state()
    }

    pub fn is_prepared(&self) -> bool {
        self.state() == TxnState::Prepared
    }

    pub fn is_read_only(&self) -> bool {
        self.ops.is_empty()
    }

    pub fn doom(&mut self, reason: impl Into<String>) {
        if self.doomed.is_none() {
            self.doomed = Some(reason.into());
        }
    }
}
