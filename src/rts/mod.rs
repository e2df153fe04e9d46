//! Rollback-to-stable.
//!
//! Brings every unlogged table back to the stable timestamp: in-memory
//! updates durable after stable (or prepared, or missing from the recovery
//! checkpoint's snapshot) are aborted, on-disk cells that are too new are
//! replaced by the newest stable version from the history store, and
//! history rows newer than stable are deleted.
//!
//! Runs once at the end of recovery and on demand. Either every table is
//! rolled back or the engine panics.

mod event;

pub use event::{AbortReason, RestoreSource, RtsChecker, RtsEvent, RtsReport};

use crate::btree::{Cell, KeyEntry, PagePin, Table};
use crate::config::RtsConfig;
use crate::engine::EngineState;
use crate::error::{LapisError, Result};
use crate::mvcc::{Update, UpdateValue, UPD_IN_HS, UPD_RESTORED_FROM_DS, UPD_RESTORED_FROM_HS};
use crate::stats::Stats;
use crate::txn::Snapshot;
use crate::types::{ts_hex, Key, Timestamp, TimeWindow, TxnId, TS_MAX, TS_NONE, TXN_NONE};
use roaring::RoaringBitmap;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info};

struct Rollback<'a> {
    engine: &'a EngineState,
    stable: Timestamp,
    /// False only when recovering from a checkpoint taken without
    /// timestamps: then every checkpointed version is stable
    check_ts: bool,
    snapshot: Option<Snapshot>,
    dryrun: bool,
    checker: RtsChecker,
    report: RtsReport,
}

impl Rollback<'_> {
    fn unstable(&self, durable_ts: Timestamp) -> bool {
        self.check_ts && durable_ts > self.stable
    }

    fn outside_snapshot(&self, txn: TxnId) -> bool {
        txn != TXN_NONE && self.snapshot.as_ref().is_some_and(|s| !s.is_visible(txn))
    }

    fn emit(&mut self, event: RtsEvent) -> Result<()> {
        if let Err(e) = self.checker.apply(&event) {
            return Err(self.engine.panic(e.to_string()));
        }
        self.report.events.push(event);
        Ok(())
    }

    fn table(&mut self, table: &Table, skip: &mut RoaringBitmap) -> Result<()> {
        let pages = table.freeze();
        let snap_min = self.snapshot.as_ref().map(|s| s.snap_min);
        let mut modified = false;
        let mut durable_gt_stable = false;
        let mut has_prepared = false;
        let mut txnid_gt_recov = false;
        for page in pages.values() {
            if let Some(info) = page.image() {
                durable_gt_stable |= self.unstable(info.max_durable_ts);
                txnid_gt_recov |= snap_min.is_some_and(|min| info.max_txn >= min);
            }
            if page.is_resident() {
                modified |= page.is_dirty();
                for entry in page.rows().values() {
                    has_prepared |= entry.chain.iter().any(|u| u.is_prepared_in_progress());
                }
            }
        }
        let event = RtsEvent::Tree {
            table: table.id,
            modified,
            durable_gt_stable,
            has_prepared,
            txnid_gt_recov,
            stable: self.engine.global.stable_timestamp(),
        };
        debug!(
            target: "lapis::rts",
            table = table.id,
            modified,
            durable_gt_stable,
            has_prepared,
            txnid_gt_recov,
            "tree"
        );
        self.emit(event)?;

        let logging = self.engine.wal.is_enabled();
        let skipped = self.engine.log_is_enabled(table);
        debug!(target: "lapis::rts", table = table.id, logging, skipped, "tree logging");
        self.emit(RtsEvent::TreeLogging {
            table: table.id,
            logging,
            skipped,
        })?;
        if skipped {
            skip.insert(table.id);
            self.report.trees_skipped_logged += 1;
            Stats::incr(&self.engine.stats.rts_trees_skipped_logged);
            return Ok(());
        }
        if !(modified || durable_gt_stable || has_prepared || txnid_gt_recov) {
            return Ok(());
        }
        self.report.trees_visited += 1;

        for page in pages.values() {
            let clean_on_disk = !page.is_resident()
                && page.image().is_some_and(|info| {
                    !self.unstable(info.max_durable_ts) && !snap_min.is_some_and(|min| info.max_txn >= min)
                });
            if clean_on_disk {
                continue;
            }
            let Some(pin) = self.engine.pin_existing(page)? else {
                continue;
            };
            let max_durable_ts = page.image().map(|i| i.max_durable_ts).unwrap_or(TS_NONE);
            debug!(target: "lapis::rts", table = table.id, page = page.id(), max_durable_ts = %ts_hex(max_durable_ts), "page rollback");
            self.emit(RtsEvent::PageRollback {
                table: table.id,
                page: page.id(),
                max_durable_ts,
            })?;
            self.report.pages_visited += 1;
            Stats::incr(&self.engine.stats.rts_pages_visited);
            self.page(table, &pin)?;
        }
        Ok(())
    }

    fn page(&mut self, table: &Table, pin: &PagePin) -> Result<()> {
        let _latch = pin.latch();
        let rows: Vec<(Key, Arc<KeyEntry>)> = pin.rows().iter().map(|(k, e)| (k.clone(), Arc::clone(e))).collect();
        let mut changed = false;
        for (key, entry) in rows {
            changed |= self.key(table, pin, &key, &entry)?;
        }
        if changed && !self.dryrun {
            pin.mark_dirty();
        }
        Ok(())
    }

    /// Roll back one key. Returns whether anything changed.
    fn key(&mut self, table: &Table, pin: &PagePin, key: &[u8], entry: &KeyEntry) -> Result<bool> {
        let mut changed = false;
        let mut stable_update = false;
        for upd in entry.chain.iter() {
            if upd.is_aborted() {
                continue;
            }
            let reason = if upd.is_prepared_in_progress() {
                AbortReason::Prepared
            } else if self.unstable(upd.durable_ts()) {
                AbortReason::Unstable
            } else if self.outside_snapshot(upd.txn_id()) {
                AbortReason::RecoverySnapshot
            } else {
                stable_update = true;
                break;
            };
            debug!(
                target: "lapis::rts",
                table = table.id,
                start_ts = %ts_hex(upd.start_ts()),
                durable_ts = %ts_hex(upd.durable_ts()),
                ?reason,
                "update abort"
            );
            self.emit(RtsEvent::UpdateAbort {
                table: table.id,
                key: key.to_vec(),
                start_ts: upd.start_ts(),
                durable_ts: upd.durable_ts(),
                reason,
            })?;
            if !self.dryrun {
                upd.mark_aborted();
                upd.clear_flag(UPD_IN_HS);
            }
            self.report.upd_aborted += 1;
            changed = true;
        }
        if stable_update {
            return Ok(changed);
        }

        let Some(cell) = entry.ondisk() else {
            return Ok(changed);
        };
        let tw = cell.tw;
        if self.unstable(tw.durable_start_ts) || self.outside_snapshot(tw.start_txn) {
            self.restore_from_history(table, pin, key, entry)?;
            return Ok(true);
        }
        if tw.has_stop() && (self.unstable(tw.durable_stop_ts) || self.outside_snapshot(tw.stop_txn)) {
            self.emit(RtsEvent::KeyRestored {
                table: table.id,
                key: key.to_vec(),
                start_ts: tw.start_ts,
                source: RestoreSource::DataStore,
            })?;
            if !self.dryrun {
                let upd = Update::committed(&tw, UpdateValue::Full(cell.value.clone()), UPD_RESTORED_FROM_DS);
                self.install(pin, entry, upd);
            }
            self.report.keys_restored += 1;
            return Ok(true);
        }
        Ok(changed)
    }

    /// Replace a too-new on-disk cell with the newest stable history
    /// version, or remove the key if there is none.
    fn restore_from_history(&mut self, table: &Table, pin: &PagePin, key: &[u8], entry: &KeyEntry) -> Result<()> {
        let horizon = if self.check_ts { self.stable } else { TS_MAX };
        let found = self
            .engine
            .hs
            .newest_stable(table.id, key, horizon, self.snapshot.as_ref())?;
        match found {
            Some((hs_key, record, value)) => {
                let stop_stable = record.tw.has_stop()
                    && !self.unstable(record.tw.durable_stop_ts)
                    && !self.outside_snapshot(record.tw.stop_txn);
                self.emit(RtsEvent::KeyRestored {
                    table: table.id,
                    key: key.to_vec(),
                    start_ts: record.tw.start_ts,
                    source: RestoreSource::HistoryStore,
                })?;
                if !self.dryrun {
                    if stop_stable {
                        // The stable state is "deleted at stop"; the row
                        // stays for older readers.
                        let tw = TimeWindow::new(record.tw.stop_ts, record.tw.durable_stop_ts, record.tw.stop_txn);
                        self.install(pin, entry, Update::committed(&tw, UpdateValue::Tombstone, 0));
                    } else {
                        let upd = Update::committed(&record.tw, UpdateValue::Full(value), UPD_RESTORED_FROM_HS);
                        self.install(pin, entry, upd);
                        self.engine.hs.remove_rows(&[hs_key])?;
                        self.report.hs_removed += 1;
                        Stats::incr(&self.engine.stats.rts_hs_removed);
                    }
                }
                self.report.keys_restored += 1;
                Stats::incr(&self.engine.stats.rts_keys_restored);
            }
            None => {
                self.emit(RtsEvent::KeyRemoved {
                    table: table.id,
                    key: key.to_vec(),
                })?;
                if !self.dryrun {
                    let tw = TimeWindow::new(TS_NONE, TS_NONE, TXN_NONE);
                    self.install(pin, entry, Update::committed(&tw, UpdateValue::Tombstone, 0));
                }
                self.report.keys_removed += 1;
                Stats::incr(&self.engine.stats.rts_keys_removed);
            }
        }
        Ok(())
    }

    /// Push a replacement version and drop the on-disk cell it replaces.
    fn install(&self, pin: &PagePin, entry: &KeyEntry, upd: Update) {
        let removed = entry.ondisk().map(|c| c.mem_size()).unwrap_or(0);
        let upd = Arc::new(upd);
        let size = upd.mem_size();
        entry.chain.push(upd);
        entry.set_ondisk(None::<Arc<Cell>>);
        pin.add_mem(size);
        pin.sub_mem(removed);
        self.engine.cache.add_update(size);
        self.engine.cache.sub_bytes(removed);
    }
}

/// Roll the database back to the stable timestamp.
///
/// `recovering` is set for the pass run while opening: then the recovery
/// checkpoint's snapshot also decides what survives.
pub fn rollback_to_stable(engine: &EngineState, config: &RtsConfig, recovering: bool) -> Result<RtsReport> {
    engine.check_panic()?;
    let active = engine.global.active_count();
    if active > 0 {
        return Err(LapisError::invalid(format!(
            "rollback to stable requires no active transactions ({} running)",
            active
        )));
    }
    let _ckpt = engine
        .ckpt
        .lock(Duration::from_millis(engine.config.checkpoint_wait_ms))?;
    let _frozen = engine.global.rts_lock();

    let stable = engine.global.stable_timestamp();
    let snapshot = if recovering {
        engine.global.recovery_snapshot()
    } else {
        None
    };
    let mut rts = Rollback {
        engine,
        stable,
        check_ts: !(recovering && stable == TS_NONE),
        snapshot,
        dryrun: config.dryrun,
        checker: RtsChecker::new(engine.wal.is_enabled()),
        report: RtsReport {
            stable,
            dryrun: config.dryrun,
            ..Default::default()
        },
    };
    debug!(target: "lapis::rts", stable = %ts_hex(stable), recovering, dryrun = config.dryrun, "init");
    rts.emit(RtsEvent::Init { stable })?;

    let mut skip = RoaringBitmap::new();
    for table in engine.tables() {
        rts.table(&table, &mut skip)?;
    }

    if rts.check_ts {
        let (removed, stops_cleared) = engine.hs.sweep_unstable(stable, &skip, config.dryrun)?;
        rts.report.hs_removed += removed;
        rts.report.hs_stops_cleared += stops_cleared;
        Stats::add(&engine.stats.rts_hs_removed, removed as u64);
        Stats::add(&engine.stats.rts_stop_cleared, stops_cleared as u64);
        rts.emit(RtsEvent::HsSweep { removed, stops_cleared })?;
    }

    let now = engine.global.stable_timestamp();
    if now != stable {
        return Err(engine.panic(format!(
            "stable timestamp moved from {} to {} during rollback to stable",
            ts_hex(stable),
            ts_hex(now)
        )));
    }

    let report = rts.report;
    Stats::incr(&engine.stats.rts_runs);
    Stats::add(&engine.stats.rts_upd_aborted, report.upd_aborted as u64);
    info!(
        target: "lapis::rts",
        stable = %ts_hex(stable),
        recovering,
        dryrun = report.dryrun,
        trees = report.trees_visited,
        pages = report.pages_visited,
        aborted = report.upd_aborted,
        restored = report.keys_restored,
        removed = report.keys_removed,
        hs_removed = report.hs_removed,
        "rollback to stable complete"
    );
    Ok(report)
}
