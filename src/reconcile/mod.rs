//! Reconciliation: turn a page's rows into a new page image plus the
//! history store rows for superseded versions.
//!
//! Per key, the versions worth keeping are gathered newest-first from the
//! update chain, with the on-disk cell appended as the oldest. The newest
//! becomes the image cell; older ones go to the history store, each with a
//! stop equal to the start of the version that replaced it. The walk ends at
//! the first version every reader has moved past.
//!
//! Two modes:
//!
//! - `Evict` writes every committed version. An uncommitted or prepared
//!   update makes the key unwritable: eviction is refused, or with
//!   update/restore the key keeps its chain in memory.
//! - `Checkpoint` writes what the checkpoint snapshot sees at its read
//!   timestamp. Anything newer stays in memory and the page stays dirty.

use crate::btree::{Cell, KeyEntry, PageImage};
use crate::error::{LapisError, Result};
use crate::history::{HistoryStore, HsBatch, HsKey, HsRecord, HsValue};
use crate::mvcc::{HistoryLookup, Modify, ReadContext, Update, UpdateValue, Visibility, UPD_IN_HS};
use crate::txn::{Snapshot, TxnGlobal};
use crate::types::{Key, TableId, Timestamp, TimeWindow, Value};
use smallvec::SmallVec;
use std::collections::BTreeMap;
use std::sync::Arc;
use tracing::trace;

/// Longest run of consecutive deltas written to the history store before a
/// full value is forced.
pub const MAX_DELTA_RUN: usize = 16;

#[derive(Clone, Copy)]
pub enum ReconcileMode<'a> {
    Evict,
    Checkpoint {
        snapshot: &'a Snapshot,
        read_ts: Option<Timestamp>,
    },
}

pub struct ReconcileCtx<'a> {
    pub table: TableId,
    pub global: &'a TxnGlobal,
    pub hs: &'a HistoryStore,
    pub mode: ReconcileMode<'a>,
    /// Keep chains of unwritable keys in memory instead of failing
    pub update_restore: bool,
}

/// Result of reconciling one page. Nothing is applied yet.
#[derive(Default)]
pub struct Reconciled {
    pub image: PageImage,
    pub hs_batch: HsBatch,
    /// Updates whose versions are inserted by `hs_batch`
    pub hs_updates: Vec<Arc<Update>>,
    /// New image cell for every key that was fully written
    pub cells: Vec<(Key, Option<Cell>)>,
    /// Keys whose chains must stay in memory (update/restore)
    pub residual: Vec<Key>,
    /// Checkpoint left newer updates in memory
    pub retained: bool,
    pub squashed: usize,
}

impl Reconciled {
    /// Set `UPD_IN_HS` on every update now copied into the history store.
    pub fn mark_in_hs(&self) {
        for upd in &self.hs_updates {
            upd.set_flag(UPD_IN_HS);
        }
    }
}

/// One version of a key chosen for writing.
struct Version {
    /// `None` for the on-disk cell
    upd: Option<Arc<Update>>,
    tw: TimeWindow,
    /// Materialized value; `None` for a tombstone
    value: Option<Value>,
    /// The stored delta if the update was a modify
    delta: Option<Modify>,
}

impl Version {
    fn from_cell(cell: &Cell) -> Self {
        Self {
            upd: None,
            tw: cell.tw,
            value: Some(cell.value.clone()),
            delta: None,
        }
    }

    fn is_tombstone(&self) -> bool {
        self.value.is_none()
    }

    fn same_source(&self, base: &Option<Arc<Update>>) -> bool {
        match (&self.upd, base) {
            (Some(a), Some(b)) => Arc::ptr_eq(a, b),
            (None, None) => true,
            _ => false,
        }
    }
}

enum KeyOutcome {
    Write(Option<Cell>),
    /// Existing cell kept unchanged
    Keep,
    Residual,
}

/// Reconcile every row of a page.
pub fn reconcile_page(ctx: &ReconcileCtx<'_>, rows: &BTreeMap<Key, Arc<KeyEntry>>) -> Result<Reconciled> {
    let mut out = Reconciled::default();
    let mut cells = Vec::with_capacity(rows.len());
    for (key, entry) in rows {
        let ondisk = entry.ondisk();
        match reconcile_key(ctx, key, entry, &mut out)? {
            KeyOutcome::Write(cell) => {
                if let Some(cell) = &cell {
                    cells.push((key.clone(), cell.clone()));
                }
                out.cells.push((key.clone(), cell));
            }
            KeyOutcome::Keep => {
                if let Some(cell) = ondisk {
                    cells.push((key.clone(), (*cell).clone()));
                }
            }
            KeyOutcome::Residual => {
                if let Some(cell) = ondisk {
                    cells.push((key.clone(), (*cell).clone()));
                }
                out.residual.push(key.clone());
            }
        }
    }
    out.image = PageImage::new(cells);
    trace!(
        target: "lapis::reconcile",
        table = ctx.table,
        rows = out.image.len(),
        hs_rows = out.hs_batch.len(),
        residual = out.residual.len(),
        "page reconciled"
    );
    Ok(out)
}

fn reconcile_key(ctx: &ReconcileCtx<'_>, key: &[u8], entry: &KeyEntry, out: &mut Reconciled) -> Result<KeyOutcome> {
    let ondisk = entry.ondisk();
    let mut selected: Vec<Arc<Update>> = Vec::new();

    match ctx.mode {
        ReconcileMode::Evict => {
            for upd in entry.chain.iter() {
                if upd.is_aborted() {
                    continue;
                }
                if upd.is_prepared_in_progress() || !ctx.global.is_committed(upd.txn_id()) {
                    if ctx.update_restore {
                        return Ok(KeyOutcome::Residual);
                    }
                    return Err(LapisError::EvictionBusy);
                }
                selected.push(upd);
            }
        }
        ReconcileMode::Checkpoint { snapshot, read_ts } => {
            let view = ReadContext::at_snapshot(snapshot, read_ts);
            for upd in entry.chain.iter() {
                if upd.is_aborted() {
                    continue;
                }
                let durable_ok = read_ts.map_or(true, |ts| upd.durable_ts() <= ts);
                if view.update_visibility(&upd) == Visibility::Visible && durable_ok {
                    selected.push(upd);
                } else {
                    out.retained = true;
                }
            }
            if selected.is_empty() {
                return Ok(KeyOutcome::Keep);
            }
        }
    }

    if selected.is_empty() && ondisk.is_none() {
        return Ok(KeyOutcome::Write(None));
    }

    // Newest-first list of versions, the cell last.
    let mut versions: Vec<Version> = Vec::with_capacity(selected.len() + 1);
    for upd in selected {
        let value = materialize(ctx, key, &upd, ondisk.as_deref())?;
        let delta = match &upd.value {
            UpdateValue::Delta(m) => Some(m.clone()),
            _ => None,
        };
        versions.push(Version {
            tw: upd.time_window(),
            upd: Some(upd),
            value,
            delta,
        });
    }
    if let Some(cell) = &ondisk {
        versions.push(Version::from_cell(cell));
    }

    // Only the newest of several updates by one transaction at one
    // timestamp is a real version.
    let before = versions.len();
    versions.dedup_by(|older, newer| {
        older.upd.is_some()
            && newer.upd.is_some()
            && older.tw.start_txn == newer.tw.start_txn
            && older.tw.start_ts == newer.tw.start_ts
    });
    out.squashed += before - versions.len();

    let mut iter = versions.into_iter();
    let Some(newest) = iter.next() else {
        return Ok(KeyOutcome::Write(None));
    };

    // The image cell and the point where it stopped, if it did.
    let (image_version, stop) = if newest.is_tombstone() {
        let start = newest.tw;
        if ctx.global.visible_all(start.start_txn, start.start_ts.max(start.durable_start_ts)) {
            return Ok(KeyOutcome::Write(None));
        }
        match iter.next() {
            Some(v) if v.is_tombstone() => (v, None),
            Some(v) => (v, Some(start)),
            None => return Ok(KeyOutcome::Write(None)),
        }
    } else {
        (newest, None)
    };

    let mut tw = image_version.tw;
    if image_version.upd.is_some() {
        tw.clear_stop();
    }
    if let Some(stop) = stop {
        if !tw.has_stop() {
            tw.set_stop(stop.start_ts, stop.durable_start_ts, stop.start_txn);
        }
    }
    let cell = match &image_version.value {
        Some(value) => Cell::new(value.clone(), tw),
        None => return Ok(KeyOutcome::Write(None)),
    };

    // Older versions go to the history store.
    let mut newer_start = image_version.tw;
    let mut prev_written: Option<Version> = None;
    let mut pending: Vec<(Version, TimeWindow)> = Vec::new();
    for version in iter {
        if version.is_tombstone() {
            newer_start = version.tw;
            continue;
        }
        let mut row_tw = version.tw;
        if version.upd.is_some() || !row_tw.has_stop() {
            row_tw.set_stop(newer_start.start_ts, newer_start.durable_start_ts, newer_start.start_txn);
        }
        let obsolete = ctx
            .global
            .visible_all(row_tw.stop_txn, row_tw.stop_ts.max(row_tw.durable_stop_ts));
        if obsolete {
            break;
        }
        newer_start = version.tw;
        pending.push((version, row_tw));
    }

    // Oldest first, so delta bases are known.
    let mut delta_run = 0usize;
    for (version, row_tw) in pending.into_iter().rev() {
        if version.upd.as_ref().is_some_and(|u| u.has_flag(UPD_IN_HS)) {
            prev_written = None;
            delta_run = 0;
            continue;
        }
        let base_written = match (&version.delta, &version.upd, &prev_written) {
            (Some(_), Some(upd), Some(prev)) => prev.same_source(&chain_base(upd)),
            _ => false,
        };
        let value = match (&version.delta, &version.value) {
            (Some(m), _) if base_written && delta_run + 1 < MAX_DELTA_RUN => {
                delta_run += 1;
                HsValue::Delta(m.clone())
            }
            (_, Some(v)) => {
                delta_run = 0;
                HsValue::Full(v.clone())
            }
            (_, None) => continue,
        };
        out.hs_batch.insert(
            HsKey::new(ctx.table, key.to_vec(), row_tw.start_ts, row_tw.start_txn),
            HsRecord { tw: row_tw, value },
        );
        if let Some(upd) = &version.upd {
            out.hs_updates.push(Arc::clone(upd));
        }
        prev_written = Some(version);
    }

    Ok(KeyOutcome::Write(Some(cell)))
}

/// Next live update below `upd`; `None` means the chain ends there and the
/// on-disk cell is the base.
fn chain_base(upd: &Update) -> Option<Arc<Update>> {
    let mut cur = upd.next();
    while let Some(u) = cur {
        if !u.is_aborted() {
            return Some(u);
        }
        cur = u.next();
    }
    None
}

/// Full value of an update; `None` for a tombstone. Deltas are replayed onto
/// the first full value below them, the on-disk cell, or the newest history
/// value when the chain and cell have nothing.
fn materialize(ctx: &ReconcileCtx<'_>, key: &[u8], upd: &Update, ondisk: Option<&Cell>) -> Result<Option<Value>> {
    let first = match &upd.value {
        UpdateValue::Full(v) => return Ok(Some(v.clone())),
        UpdateValue::Tombstone => return Ok(None),
        UpdateValue::Delta(m) => m,
    };
    let mut holder: Vec<Arc<Update>> = Vec::new();
    let mut cur = upd.next();
    let base = loop {
        let Some(u) = cur else {
            break match ondisk {
                Some(cell) => cell.value.clone(),
                None => ctx.hs.view(ctx.table, key).newest_full()?.unwrap_or_default(),
            };
        };
        cur = u.next();
        if u.is_aborted() {
            continue;
        }
        match &u.value {
            UpdateValue::Full(v) => break v.clone(),
            UpdateValue::Tombstone => break Vec::new(),
            UpdateValue::Delta(_) => holder.push(u),
        }
    };
    let mut deltas: SmallVec<[&Modify; 4]> = SmallVec::new();
    deltas.push(first);
    for u in &holder {
        if let UpdateValue::Delta(m) = &u.value {
            deltas.push(m);
        }
    }
    Ok(Some(Modify::apply_all(&base, deltas.iter().rev().copied())))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::block::MemBlockManager;
    use crate::mvcc::ModifyEntry;
    use crate::stats::Stats;
    use crate::txn::{IsolationLevel, TxnState};
    use crate::types::{TS_NONE, TXN_NONE};

    struct Fixture {
        global: TxnGlobal,
        hs: HistoryStore,
    }

    fn setup() -> Fixture {
        Fixture {
            global: TxnGlobal::new(),
            hs: HistoryStore::new(Arc::new(MemBlockManager::new()), 512, Arc::new(Stats::default())),
        }
    }

    impl Fixture {
        fn ctx<'a>(&'a self, mode: ReconcileMode<'a>) -> ReconcileCtx<'a> {
            ReconcileCtx {
                table: 1,
                global: &self.global,
                hs: &self.hs,
                mode,
                update_restore: false,
            }
        }

        fn commit(&self, entry: &KeyEntry, value: UpdateValue, ts: Timestamp) -> Arc<Update> {
            let shared = self.global.begin(IsolationLevel::Snapshot, TS_NONE);
            let upd = Arc::new(Update::new(shared.id, value));
            entry.chain.push(Arc::clone(&upd));
            upd.set_committed(ts, ts);
            shared.set_commit_ts(ts, ts);
            self.global.end(&shared, TxnState::Committed);
            upd
        }

        /// Keep a reader open so nothing is globally visible.
        fn hold_history(&self) -> Arc<crate::txn::TxnShared> {
            self.global.begin(IsolationLevel::Snapshot, 1)
        }
    }

    fn rows(entries: Vec<(&[u8], Arc<KeyEntry>)>) -> BTreeMap<Key, Arc<KeyEntry>> {
        entries.into_iter().map(|(k, e)| (k.to_vec(), e)).collect()
    }

    fn full(v: &[u8]) -> UpdateValue {
        UpdateValue::Full(v.to_vec())
    }

    #[test]
    fn test_evict_writes_newest_and_history() {
        let f = setup();
        let entry = Arc::new(KeyEntry::new());
        f.commit(&entry, full(b"v10"), 10);
        f.commit(&entry, full(b"v20"), 20);
        let _reader = f.hold_history();

        let out = reconcile_page(&f.ctx(ReconcileMode::Evict), &rows(vec![(b"k", entry)])).unwrap();
        assert_eq!(out.image.len(), 1);
        let (_, cell) = &out.image.cells[0];
        assert_eq!(cell.value, b"v20".to_vec());
        assert!(!cell.tw.has_stop());

        let inserts: Vec<_> = out.hs_batch.inserts().collect();
        assert_eq!(inserts.len(), 1);
        assert_eq!(inserts[0].0.start_ts, 10);
        assert_eq!(inserts[0].1.tw.stop_ts, 20);
        assert_eq!(inserts[0].1.value, HsValue::Full(b"v10".to_vec()));
    }

    #[test]
    fn test_evict_refuses_uncommitted() {
        let f = setup();
        let entry = Arc::new(KeyEntry::new());
        f.commit(&entry, full(b"v10"), 10);
        let writer = f.global.begin(IsolationLevel::Snapshot, TS_NONE);
        entry.chain.push(Arc::new(Update::new(writer.id, full(b"dirty"))));

        let page_rows = rows(vec![(b"k", entry)]);
        assert!(matches!(
            reconcile_page(&f.ctx(ReconcileMode::Evict), &page_rows),
            Err(LapisError::EvictionBusy)
        ));

        let mut ctx = f.ctx(ReconcileMode::Evict);
        ctx.update_restore = true;
        let out = reconcile_page(&ctx, &page_rows).unwrap();
        assert_eq!(out.residual, vec![b"k".to_vec()]);
        assert!(out.hs_batch.is_empty());
    }

    #[test]
    fn test_aborted_updates_skipped() {
        let f = setup();
        let entry = Arc::new(KeyEntry::new());
        f.commit(&entry, full(b"keep"), 10);
        let writer = f.global.begin(IsolationLevel::Snapshot, TS_NONE);
        let upd = Arc::new(Update::new(writer.id, full(b"gone")));
        entry.chain.push(Arc::clone(&upd));
        upd.mark_aborted();
        f.global.end(&writer, TxnState::Aborted);

        let out = reconcile_page(&f.ctx(ReconcileMode::Evict), &rows(vec![(b"k", entry)])).unwrap();
        assert_eq!(out.image.cells[0].1.value, b"keep".to_vec());
    }

    #[test]
    fn test_tombstone_becomes_stop() {
        let f = setup();
        let entry = Arc::new(KeyEntry::new());
        f.commit(&entry, full(b"v"), 10);
        f.commit(&entry, UpdateValue::Tombstone, 20);
        let _reader = f.hold_history();

        let out = reconcile_page(&f.ctx(ReconcileMode::Evict), &rows(vec![(b"k", entry)])).unwrap();
        let (_, cell) = &out.image.cells[0];
        assert_eq!(cell.value, b"v".to_vec());
        assert_eq!(cell.tw.stop_ts, 20);
        assert!(out.hs_batch.is_empty());
    }

    #[test]
    fn test_globally_visible_tombstone_drops_key() {
        let f = setup();
        let entry = Arc::new(KeyEntry::new());
        f.commit(&entry, full(b"v"), TS_NONE);
        f.commit(&entry, UpdateValue::Tombstone, TS_NONE);

        let out = reconcile_page(&f.ctx(ReconcileMode::Evict), &rows(vec![(b"k", entry)])).unwrap();
        assert!(out.image.is_empty());
        assert_eq!(out.cells, vec![(b"k".to_vec(), None)]);
    }

    #[test]
    fn test_history_stops_at_obsolete_version() {
        let f = setup();
        let entry = Arc::new(KeyEntry::new());
        f.commit(&entry, full(b"v10"), 10);
        f.commit(&entry, full(b"v20"), 20);
        f.commit(&entry, full(b"v30"), 30);
        // Every reader is at or past 20, so v10 is never needed again
        f.global.set_global(Some(20), Some(30)).unwrap();

        let out = reconcile_page(&f.ctx(ReconcileMode::Evict), &rows(vec![(b"k", entry)])).unwrap();
        let starts: Vec<Timestamp> = out.hs_batch.inserts().map(|(k, _)| k.start_ts).collect();
        assert_eq!(starts, vec![20]);
    }

    #[test]
    fn test_squash_same_txn_and_timestamp() {
        let f = setup();
        let entry = Arc::new(KeyEntry::new());
        f.commit(&entry, full(b"v10"), 10);
        let shared = f.global.begin(IsolationLevel::Snapshot, TS_NONE);
        let a = Arc::new(Update::new(shared.id, full(b"first")));
        let b = Arc::new(Update::new(shared.id, full(b"second")));
        entry.chain.push(Arc::clone(&a));
        entry.chain.push(Arc::clone(&b));
        a.set_committed(20, 20);
        b.set_committed(20, 20);
        f.global.end(&shared, TxnState::Committed);
        f.commit(&entry, full(b"v30"), 30);
        let _reader = f.hold_history();

        let out = reconcile_page(&f.ctx(ReconcileMode::Evict), &rows(vec![(b"k", entry)])).unwrap();
        assert_eq!(out.squashed, 1);
        let values: Vec<HsValue> = out.hs_batch.inserts().map(|(_, r)| r.value.clone()).collect();
        assert_eq!(
            values,
            vec![HsValue::Full(b"v10".to_vec()), HsValue::Full(b"second".to_vec())]
        );
    }

    #[test]
    fn test_delta_written_verbatim_over_adjacent_base() {
        let f = setup();
        let entry = Arc::new(KeyEntry::new());
        f.commit(&entry, full(b"aaaa"), 10);
        f.commit(
            &entry,
            UpdateValue::Delta(Modify::new([ModifyEntry::new(0, 1, b"b".to_vec())])),
            20,
        );
        f.commit(&entry, full(b"zzzz"), 30);
        let _reader = f.hold_history();

        let out = reconcile_page(&f.ctx(ReconcileMode::Evict), &rows(vec![(b"k", entry)])).unwrap();
        let values: Vec<HsValue> = out.hs_batch.inserts().map(|(_, r)| r.value.clone()).collect();
        assert_eq!(values[0], HsValue::Full(b"aaaa".to_vec()));
        assert!(values[1].is_delta());

        f.hs.apply(out.hs_batch).unwrap();
        assert_eq!(f.hs.read_newest_leq(1, b"k", 25).unwrap(), Some(b"baaa".to_vec()));
    }

    #[test]
    fn test_delta_newest_is_materialized_in_image() {
        let f = setup();
        let entry = Arc::new(KeyEntry::with_cell(Cell::new(b"base".to_vec(), TimeWindow::new(5, 5, TXN_NONE))));
        f.commit(
            &entry,
            UpdateValue::Delta(Modify::new([ModifyEntry::new(0, 1, b"B".to_vec())])),
            20,
        );
        let _reader = f.hold_history();

        let out = reconcile_page(&f.ctx(ReconcileMode::Evict), &rows(vec![(b"k", entry)])).unwrap();
        assert_eq!(out.image.cells[0].1.value, b"Base".to_vec());
        let inserts: Vec<_> = out.hs_batch.inserts().collect();
        assert_eq!(inserts.len(), 1);
        assert_eq!(inserts[0].0.start_ts, 5);
        assert_eq!(inserts[0].1.tw.stop_ts, 20);
    }

    #[test]
    fn test_checkpoint_retains_unstable() {
        let f = setup();
        let entry = Arc::new(KeyEntry::new());
        f.commit(&entry, full(b"v10"), 10);
        f.commit(&entry, full(b"v20"), 20);
        let snapshot = f.global.snapshot(TXN_NONE);
        let _reader = f.hold_history();

        let mode = ReconcileMode::Checkpoint {
            snapshot: &snapshot,
            read_ts: Some(15),
        };
        let out = reconcile_page(&f.ctx(mode), &rows(vec![(b"k", Arc::clone(&entry))])).unwrap();
        assert!(out.retained);
        assert_eq!(out.image.cells[0].1.value, b"v10".to_vec());
        assert!(out.hs_batch.is_empty());
        // The chain itself is untouched
        assert_eq!(entry.chain.len(), 2);
    }

    #[test]
    fn test_checkpoint_keeps_cell_when_nothing_selectable() {
        let f = setup();
        let cell = Cell::new(b"disk".to_vec(), TimeWindow::new(5, 5, TXN_NONE));
        let entry = Arc::new(KeyEntry::with_cell(cell.clone()));
        f.commit(&entry, full(b"v20"), 20);
        let snapshot = f.global.snapshot(TXN_NONE);

        let mode = ReconcileMode::Checkpoint {
            snapshot: &snapshot,
            read_ts: Some(10),
        };
        let out = reconcile_page(&f.ctx(mode), &rows(vec![(b"k", entry)])).unwrap();
        assert!(out.retained);
        assert_eq!(out.image.cells, vec![(b"k".to_vec(), cell)]);
        assert!(out.cells.is_empty());
    }

    #[test]
    fn test_flagged_update_not_reinserted() {
        let f = setup();
        let entry = Arc::new(KeyEntry::new());
        let old = f.commit(&entry, full(b"v10"), 10);
        f.commit(&entry, full(b"v20"), 20);
        old.set_flag(UPD_IN_HS);
        let _reader = f.hold_history();

        let snapshot = f.global.snapshot(TXN_NONE);
        let mode = ReconcileMode::Checkpoint {
            snapshot: &snapshot,
            read_ts: None,
        };
        let out = reconcile_page(&f.ctx(mode), &rows(vec![(b"k", entry)])).unwrap();
        assert!(out.hs_batch.is_empty());
        assert!(!out.retained);
    }
}
