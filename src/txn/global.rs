//! Global transaction table and timestamp watermarks.
//!
//! Hot paths are lock-free: ids are published with an insert-then-CAS loop,
//! watermarks only move forward through compare-exchange loops. Two short
//! mutexes serialize commit validation and keep the stable timestamp frozen
//! while rollback-to-stable runs.

use super::{IsolationLevel, Snapshot, TxnShared, TxnState};
use crate::error::{LapisError, Result};
use crate::types::{ts_hex, Timestamp, TxnId, TS_NONE, TXN_ABORTED, TXN_NONE};
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use parking_lot::{Mutex, MutexGuard, RwLock};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tracing::debug;

/// Read point pinned by a running checkpoint.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CheckpointPin {
    pub snap_min: TxnId,
    pub read_ts: Timestamp,
}

pub struct TxnGlobal {
    /// Next id to allocate
    current: AtomicU64,
    /// Ids below this were written by an earlier incarnation of the database
    base_id: AtomicU64,
    running: DashMap<TxnId, Arc<TxnShared>, ahash::RandomState>,
    /// Cached oldest id any snapshot may still treat as running
    oldest_id: AtomicU64,

    oldest_ts: AtomicU64,
    stable_ts: AtomicU64,
    recovery_ts: AtomicU64,
    last_ckpt_ts: AtomicU64,
    /// Largest durable timestamp of a committed transaction
    durable_ts: AtomicU64,

    ckpt_snap_min: AtomicU64,
    ckpt_read_ts: AtomicU64,

    commit_lock: Mutex<()>,
    rts_lock: Mutex<()>,
    /// Snapshot recorded by the checkpoint recovery started from
    recovery_snapshot: RwLock<Option<Snapshot>>,
}

impl TxnGlobal {
    pub fn new() -> Self {
        Self::with_base(1)
    }

    /// Start allocating ids at `base`, treating anything lower as committed
    /// by a previous run.
    pub fn with_base(base: TxnId) -> Self {
        let base = base.max(1);
        Self {
            current: AtomicU64::new(base),
            base_id: AtomicU64::new(base),
            running: DashMap::with_hasher(ahash::RandomState::new()),
            oldest_id: AtomicU64::new(base),
            oldest_ts: AtomicU64::new(TS_NONE),
            stable_ts: AtomicU64::new(TS_NONE),
            recovery_ts: AtomicU64::new(TS_NONE),
            last_ckpt_ts: AtomicU64::new(TS_NONE),
            durable_ts: AtomicU64::new(TS_NONE),
            ckpt_snap_min: AtomicU64::new(TXN_NONE),
            ckpt_read_ts: AtomicU64::new(TS_NONE),
            commit_lock: Mutex::new(()),
            rts_lock: Mutex::new(()),
            recovery_snapshot: RwLock::new(None),
        }
    }

    // ------------------------------------------------------------------
    // Transaction ids
    // ------------------------------------------------------------------

    /// Allocate an id and publish it in the running table.
    ///
    /// The id is inserted before `current` moves past it, so any snapshot
    /// that observes `current > id` also observes the entry.
    pub fn begin(&self, isolation: IsolationLevel, read_ts: Timestamp) -> Arc<TxnShared> {
        loop {
            let id = self.current.load(Ordering::Acquire);
            let shared = Arc::new(TxnShared::new(id));
            shared.set_read_ts(read_ts);
            match self.running.entry(id) {
                Entry::Occupied(_) => {
                    std::hint::spin_loop();
                    continue;
                }
                Entry::Vacant(v) => {
                    v.insert(Arc::clone(&shared));
                }
            }
            if self
                .current
                .compare_exchange(id, id + 1, Ordering::AcqRel, Ordering::Acquire)
                .is_ok()
            {
                debug!(target: "lapis::txn", txn = id, isolation = isolation.as_str(), "begin");
                return shared;
            }
            self.running.remove(&id);
        }
    }

    /// Remove a resolved transaction from the running table.
    pub fn end(&self, shared: &TxnShared, state: TxnState) {
        shared.set_state(state);
        if state == TxnState::Committed {
            let durable = shared.durable_ts().max(shared.commit_ts());
            self.advance(&self.durable_ts, durable);
        }
        self.running.remove(&shared.id);
        self.update_oldest_id();
    }

    /// Id the next transaction will receive.
    #[inline]
    pub fn current_id(&self) -> TxnId {
        self.current.load(Ordering::Acquire)
    }

    #[inline]
    pub fn base_id(&self) -> TxnId {
        self.base_id.load(Ordering::Acquire)
    }

    /// Move id allocation past ids found on disk.
    pub fn reserve_ids(&self, next: TxnId) {
        self.advance(&self.current, next);
        self.advance(&self.base_id, next);
        self.advance(&self.oldest_id, next);
    }

    pub fn active_count(&self) -> usize {
        self.running.len()
    }

    /// Take a snapshot on behalf of `own` (TXN_NONE for internal readers).
    pub fn snapshot(&self, own: TxnId) -> Snapshot {
        let snap_max = self.current.load(Ordering::Acquire);
        let concurrent: Vec<TxnId> = self
            .running
            .iter()
            .filter(|r| {
                let id = *r.key();
                id != own
                    && id < snap_max
                    && matches!(r.value().state(), TxnState::Running | TxnState::Prepared)
            })
            .map(|r| *r.key())
            .collect();
        let snapshot = Snapshot::new(snap_max, concurrent);
        if let Some(shared) = self.running.get(&own) {
            shared.set_snap_min(snapshot.snap_min.min(own));
        }
        snapshot
    }

    /// Whether the writer of an update has committed.
    pub fn is_committed(&self, id: TxnId) -> bool {
        if id == TXN_ABORTED {
            return false;
        }
        if id == TXN_NONE || id < self.base_id() {
            return true;
        }
        if id >= self.current_id() {
            return false;
        }
        match self.running.get(&id) {
            Some(shared) => shared.state() == TxnState::Committed,
            None => true,
        }
    }

    /// Oldest id that some snapshot may still consider running.
    pub fn oldest_id(&self) -> TxnId {
        self.update_oldest_id()
    }

    /// Recompute the oldest id and move the cached value forward.
    pub fn update_oldest_id(&self) -> TxnId {
        let mut oldest = self.current_id();
        for r in self.running.iter() {
            oldest = oldest.min(r.value().id).min(r.value().snap_min());
        }
        let ckpt = self.ckpt_snap_min.load(Ordering::Acquire);
        if ckpt != TXN_NONE {
            oldest = oldest.min(ckpt);
        }
        self.advance(&self.oldest_id, oldest);
        self.oldest_id.load(Ordering::Acquire).min(oldest)
    }

    // ------------------------------------------------------------------
    // Timestamps
    // ------------------------------------------------------------------

    #[inline]
    pub fn oldest_timestamp(&self) -> Timestamp {
        self.oldest_ts.load(Ordering::Acquire)
    }

    #[inline]
    pub fn stable_timestamp(&self) -> Timestamp {
        self.stable_ts.load(Ordering::Acquire)
    }

    pub fn recovery_timestamp(&self) -> Timestamp {
        self.recovery_ts.load(Ordering::Acquire)
    }

    pub fn last_checkpoint_timestamp(&self) -> Timestamp {
        self.last_ckpt_ts.load(Ordering::Acquire)
    }

    pub fn set_last_checkpoint_timestamp(&self, ts: Timestamp) {
        self.last_ckpt_ts.store(ts, Ordering::Release);
    }

    /// Oldest read point anyone may still use: oldest timestamp, active
    /// read timestamps and a running checkpoint's read timestamp.
    pub fn pinned_timestamp(&self) -> Timestamp {
        let oldest = self.oldest_timestamp();
        if oldest == TS_NONE {
            return TS_NONE;
        }
        let mut pinned = oldest;
        for r in self.running.iter() {
            let ts = r.value().read_ts();
            if ts != TS_NONE {
                pinned = pinned.min(ts);
            }
        }
        let ckpt = self.ckpt_read_ts.load(Ordering::Acquire);
        if ckpt != TS_NONE {
            pinned = pinned.min(ckpt);
        }
        pinned
    }

    /// Oldest read timestamp of any running transaction.
    pub fn oldest_reader_timestamp(&self) -> Timestamp {
        self.running
            .iter()
            .map(|r| r.value().read_ts())
            .filter(|ts| *ts != TS_NONE)
            .min()
            .unwrap_or(TS_NONE)
    }

    /// Largest timestamp at or below which every commit is durable.
    pub fn all_durable_timestamp(&self) -> Timestamp {
        let mut all = self.durable_ts.load(Ordering::Acquire);
        for r in self.running.iter() {
            let shared = r.value();
            if shared.state() == TxnState::Running || shared.state() == TxnState::Prepared {
                let pending = shared.durable_ts().max(shared.prepare_ts());
                if pending != TS_NONE {
                    all = all.min(pending.saturating_sub(1));
                }
            }
        }
        all
    }

    /// Whether every current and future reader sees a write by `id` at `ts`.
    pub fn visible_all(&self, id: TxnId, ts: Timestamp) -> bool {
        if id == TXN_ABORTED {
            return false;
        }
        if id != TXN_NONE && id >= self.base_id() && id >= self.oldest_id() {
            return false;
        }
        if ts == TS_NONE {
            return true;
        }
        let pinned = self.pinned_timestamp();
        pinned != TS_NONE && ts <= pinned
    }

    /// CAS loop moving `cell` forward; returns false if `ts` is not newer.
    fn advance(&self, cell: &AtomicU64, ts: Timestamp) -> bool {
        let mut current = cell.load(Ordering::Acquire);
        loop {
            if ts <= current {
                return false;
            }
            match cell.compare_exchange_weak(current, ts, Ordering::AcqRel, Ordering::Acquire) {
                Ok(_) => return true,
                Err(actual) => current = actual,
            }
        }
    }

    /// Set oldest and/or stable. Attempts to move either backward are
    /// ignored; oldest may never pass stable.
    pub fn set_global(&self, oldest: Option<Timestamp>, stable: Option<Timestamp>) -> Result<()> {
        let new_oldest = oldest.unwrap_or_else(|| self.oldest_timestamp());
        let new_stable = stable.unwrap_or_else(|| self.stable_timestamp());
        if new_oldest != TS_NONE && new_stable != TS_NONE && new_oldest > new_stable {
            return Err(LapisError::invalid(format!(
                "oldest timestamp {} must not be later than stable timestamp {}",
                ts_hex(new_oldest),
                ts_hex(new_stable)
            )));
        }
        if let Some(ts) = stable {
            // Blocks while rollback-to-stable is running.
            let _frozen = self.rts_lock.lock();
            if self.advance(&self.stable_ts, ts) {
                debug!(target: "lapis::txn", stable = ts, "stable timestamp moved");
            }
        }
        if let Some(ts) = oldest {
            if self.advance(&self.oldest_ts, ts) {
                debug!(target: "lapis::txn", oldest = ts, "oldest timestamp moved");
            }
        }
        Ok(())
    }

    /// Install watermarks recovered from a checkpoint. Only valid while the
    /// database is opening.
    pub fn restore_watermarks(&self, oldest: Timestamp, stable: Timestamp) {
        self.oldest_ts.store(oldest, Ordering::Release);
        self.stable_ts.store(stable, Ordering::Release);
        self.recovery_ts.store(stable, Ordering::Release);
        self.last_ckpt_ts.store(stable, Ordering::Release);
        self.advance(&self.durable_ts, stable);
    }

    // ------------------------------------------------------------------
    // Checkpoint / commit / RTS coordination
    // ------------------------------------------------------------------

    pub fn pin_checkpoint(&self, pin: CheckpointPin) {
        self.ckpt_snap_min.store(pin.snap_min.max(1), Ordering::Release);
        self.ckpt_read_ts.store(pin.read_ts, Ordering::Release);
    }

    pub fn unpin_checkpoint(&self) {
        self.ckpt_snap_min.store(TXN_NONE, Ordering::Release);
        self.ckpt_read_ts.store(TS_NONE, Ordering::Release);
        self.update_oldest_id();
    }

    /// Serializes commit-time conflict validation with publishing.
    pub fn commit_lock(&self) -> MutexGuard<'_, ()> {
        self.commit_lock.lock()
    }

    /// Held for the whole of rollback-to-stable; stable cannot move meanwhile.
    pub fn rts_lock(&self) -> MutexGuard<'_, ()> {
        self.rts_lock.lock()
    }

    pub fn set_recovery_snapshot(&self, snapshot: Option<Snapshot>) {
        *self.recovery_snapshot.write() = snapshot;
    }

    pub fn recovery_snapshot(&self) -> Option<Snapshot> {
        self.recovery_snapshot.read().clone()
    }
}

impl Default for TxnGlobal {
    fn default() -> Self {
        Self::new()
    }
}
