//! Checkpoints: a consistent on-disk copy of every table and the history
//! store.
//!
//! A checkpoint takes a snapshot and a read timestamp (the stable
//! timestamp, unless it ignores timestamps) and writes, for each table,
//! what that reader would see. Pages that are clean or already on disk
//! reuse their current image. Updates the checkpoint cannot include stay in
//! memory and keep their page dirty.
//!
//! Logged tables are checkpointed without a read timestamp: their
//! durability comes from the log, which is replayed from the LSN recorded
//! here.
//!
//! Eviction adds no history rows between the first page write and the
//! copy of the history store, so no row duplicates a version some written
//! image holds as current. Only history leaves changed since their last
//! image are rewritten.
//!
//! The metadata write is the commit point. Blocks no record, open reader
//! or live page still references are then released.

mod reader;
mod record;

pub use reader::CheckpointReader;
pub(crate) use reader::read_history_root;
pub use record::{CheckpointMeta, CheckpointRecord, TableEntry};

use crate::block::{encode, BlockAddr};
use crate::btree::{ImageInfo, PageState, RootEntry, RootImage, Table};
use crate::config::CheckpointConfig;
use crate::engine::EngineState;
use crate::error::{LapisError, Result};
use crate::reconcile::{reconcile_page, ReconcileCtx, ReconcileMode};
use crate::stats::Stats;
use crate::txn::{CheckpointPin, Snapshot, TxnGlobal};
use crate::types::{ts_hex, TableId, Timestamp, TS_NONE, TXN_NONE};
use parking_lot::{Mutex, MutexGuard};
use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, info};

pub struct CheckpointState {
    /// One checkpoint (or rollback-to-stable) at a time
    lock: Mutex<()>,
    meta: Mutex<CheckpointMeta>,
    readers: Mutex<HashMap<u64, CheckpointRecord>>,
    next_reader: AtomicU64,
}

impl CheckpointState {
    pub fn new(meta: CheckpointMeta) -> Self {
        Self {
            lock: Mutex::new(()),
            meta: Mutex::new(meta),
            readers: Mutex::new(HashMap::new()),
            next_reader: AtomicU64::new(1),
        }
    }

    /// Exclude checkpoints, waiting at most `wait`.
    pub fn lock(&self, wait: Duration) -> Result<MutexGuard<'_, ()>> {
        self.lock
            .try_lock_for(wait)
            .ok_or_else(|| LapisError::Busy("another checkpoint is running".into()))
    }

    pub fn meta(&self) -> CheckpointMeta {
        self.meta.lock().clone()
    }

    pub fn record(&self, name: Option<&str>) -> Option<CheckpointRecord> {
        self.meta.lock().record(name).cloned()
    }

    /// Names of the named checkpoints.
    pub fn names(&self) -> Vec<String> {
        self.meta.lock().records.iter().filter_map(|r| r.name.clone()).collect()
    }

    pub fn set_meta(&self, meta: CheckpointMeta) {
        *self.meta.lock() = meta;
    }

    fn has_readers(&self, name: &str) -> bool {
        self.readers.lock().values().any(|r| r.name.as_deref() == Some(name))
    }

    /// Register a reader of the record called `name`.
    pub(crate) fn open_reader(&self, name: Option<&str>) -> Result<(u64, CheckpointRecord)> {
        let meta = self.meta.lock();
        let record = meta.record(name).cloned().ok_or_else(|| {
            LapisError::NotFound(format!("checkpoint \"{}\"", name.unwrap_or("default")))
        })?;
        let id = self.next_reader.fetch_add(1, Ordering::AcqRel);
        self.readers.lock().insert(id, record.clone());
        Ok((id, record))
    }

    pub(crate) fn close_reader(&self, id: u64) {
        self.readers.lock().remove(&id);
    }

    pub fn reader_count(&self) -> usize {
        self.readers.lock().len()
    }
}

/// Clears the checkpoint read pin however the checkpoint ends.
struct PinGuard<'a>(&'a TxnGlobal);

impl Drop for PinGuard<'_> {
    fn drop(&mut self) {
        self.0.unpin_checkpoint();
    }
}

/// Take a checkpoint. Returns the new default (or named) record.
pub fn checkpoint(engine: &EngineState, config: &CheckpointConfig) -> Result<CheckpointRecord> {
    engine.check_panic()?;
    let _ckpt = engine
        .ckpt
        .lock(Duration::from_millis(engine.config.checkpoint_wait_ms))?;
    let started = Instant::now();

    if let Some(name) = &config.name {
        if name.is_empty() {
            return Err(LapisError::invalid("checkpoint name must not be empty"));
        }
        if engine.ckpt.has_readers(name) {
            return Err(LapisError::Busy(format!("checkpoint \"{}\" has open readers", name)));
        }
    }
    for name in &config.drop {
        if engine.ckpt.has_readers(name) {
            return Err(LapisError::Busy(format!("checkpoint \"{}\" has open readers", name)));
        }
    }

    // Watermarks first: a transaction missing from the snapshot then
    // commits after them, so with a timestamp newer than the checkpoint.
    let (stable, oldest, snapshot, wal_lsn) = {
        let _commit = engine.global.commit_lock();
        let stable = engine.global.stable_timestamp();
        let oldest = engine.global.oldest_timestamp();
        (stable, oldest, engine.global.snapshot(TXN_NONE), engine.wal.current_lsn())
    };
    let read_ts = (config.use_timestamp && stable != TS_NONE).then_some(stable);
    let checkpoint_ts = read_ts.unwrap_or(TS_NONE);

    engine.global.pin_checkpoint(CheckpointPin {
        snap_min: snapshot.snap_min,
        read_ts: checkpoint_ts,
    });
    let _pin = PinGuard(&engine.global);

    let tables = engine.tables();
    let gate = engine.history_gate.write();
    let roots = checkpoint_tables(engine, &tables, &snapshot, read_ts)?;

    let mut blocks = Vec::new();
    let mut table_roots = Vec::with_capacity(roots.len());
    let mut pages_written = 0;
    for (id, root, written) in roots {
        blocks.extend(root.entries.iter().map(|e| e.addr));
        let addr = engine.block.write(&encode(&root)?)?;
        Stats::incr(&engine.stats.block_writes);
        blocks.push(addr);
        table_roots.push((id, addr));
        pages_written += written;
    }

    let hs_root = write_history(engine)?;
    drop(gate);
    if let Some((root, leaves)) = &hs_root {
        blocks.extend(leaves.iter().copied());
        blocks.push(*root);
    }

    engine.block.sync()?;

    let mut meta = engine.ckpt.meta();
    let generation = meta.generation + 1;
    let record = CheckpointRecord {
        name: config.name.clone(),
        generation,
        checkpoint_ts,
        oldest_ts: oldest,
        stable_ts: stable,
        snapshot,
        tables: table_roots,
        hs_root: hs_root.map(|(root, _)| root),
        blocks,
        wal_lsn,
    };
    meta.generation = generation;
    for name in &config.drop {
        if meta.remove(name) {
            debug!(target: "lapis::checkpoint", name = name.as_str(), "checkpoint dropped");
        }
    }
    if record.name.is_some() {
        // A named checkpoint is also the newest recovery point.
        meta.put(CheckpointRecord {
            name: None,
            ..record.clone()
        });
    }
    meta.put(record.clone());
    meta.tables = tables
        .iter()
        .map(|t| TableEntry {
            id: t.id,
            name: t.name.clone(),
            config: t.config.clone(),
        })
        .collect();
    meta.next_txn_id = engine.global.current_id();
    meta.next_table_id = engine.next_table_id();
    engine.block.write_metadata(&meta.encode()?)?;
    engine.ckpt.set_meta(meta);

    engine.global.set_last_checkpoint_timestamp(checkpoint_ts);
    engine.wal.truncate_before(wal_lsn)?;
    debug!(target: "lapis::checkpoint", wal_lsn, wal_bytes = engine.wal.size_bytes(), "log truncated");
    let freed = collect_blocks(engine)?;

    Stats::incr(&engine.stats.checkpoints);
    Stats::add(&engine.stats.checkpoint_pages, pages_written as u64);
    info!(
        target: "lapis::checkpoint",
        name = record.display_name(),
        generation,
        checkpoint_ts = %ts_hex(checkpoint_ts),
        pages = pages_written,
        freed,
        elapsed_ms = started.elapsed().as_millis() as u64,
        "checkpoint complete"
    );
    Ok(record)
}

/// Record the table catalog without taking a checkpoint, so a table
/// created after the last checkpoint survives a restart (empty).
pub fn persist_catalog(engine: &EngineState) -> Result<()> {
    let _ckpt = engine
        .ckpt
        .lock(Duration::from_millis(engine.config.checkpoint_wait_ms))?;
    let mut meta = engine.ckpt.meta();
    meta.tables = engine
        .tables()
        .iter()
        .map(|t| TableEntry {
            id: t.id,
            name: t.name.clone(),
            config: t.config.clone(),
        })
        .collect();
    meta.next_table_id = engine.next_table_id();
    meta.next_txn_id = meta.next_txn_id.max(engine.global.current_id());
    engine.block.write_metadata(&meta.encode()?)?;
    engine.ckpt.set_meta(meta);
    Ok(())
}

type TableRoot = (TableId, RootImage, usize);

#[cfg(feature = "parallel")]
fn checkpoint_tables(
    engine: &EngineState,
    tables: &[Arc<Table>],
    snapshot: &Snapshot,
    read_ts: Option<Timestamp>,
) -> Result<Vec<TableRoot>> {
    use rayon::prelude::*;
    tables
        .par_iter()
        .map(|t| checkpoint_table(engine, t, snapshot, read_ts))
        .collect()
}

#[cfg(not(feature = "parallel"))]
fn checkpoint_tables(
    engine: &EngineState,
    tables: &[Arc<Table>],
    snapshot: &Snapshot,
    read_ts: Option<Timestamp>,
) -> Result<Vec<TableRoot>> {
    tables
        .iter()
        .map(|t| checkpoint_table(engine, t, snapshot, read_ts))
        .collect()
}

/// Write one table's dirty pages and build its root.
fn checkpoint_table(
    engine: &EngineState,
    table: &Table,
    snapshot: &Snapshot,
    read_ts: Option<Timestamp>,
) -> Result<TableRoot> {
    let read_ts = if engine.log_is_enabled(table) { None } else { read_ts };
    let ctx = ReconcileCtx {
        table: table.id,
        global: &engine.global,
        hs: &engine.hs,
        mode: ReconcileMode::Checkpoint { snapshot, read_ts },
        update_restore: false,
    };

    let pages = table.freeze();
    let mut root = RootImage::default();
    let mut written = 0;
    for (lower, page) in pages.iter() {
        let info = loop {
            if let (false, Some(info)) = (page.is_dirty(), page.image()) {
                break info;
            }
            if page.state() == PageState::OnDisk {
                if let Some(info) = page.image() {
                    break info;
                }
            }
            if !page.begin_reconcile() {
                std::thread::yield_now();
                continue;
            }
            let result = write_page(engine, &ctx, page);
            page.end_reconcile();
            written += 1;
            break result?;
        };
        root.entries.push(RootEntry {
            lower: lower.clone(),
            addr: info.addr,
            max_durable_ts: info.max_durable_ts,
            max_txn: info.max_txn,
            rows: info.rows,
        });
    }
    debug!(target: "lapis::checkpoint", table = table.id, pages = root.entries.len(), written, "table checkpointed");
    Ok((table.id, root, written))
}

/// Reconcile and write a page the caller has marked reconciling.
fn write_page(engine: &EngineState, ctx: &ReconcileCtx<'_>, page: &crate::btree::Page) -> Result<ImageInfo> {
    let gen = page.write_gen();
    let rows = page.rows().clone();
    let mut reconciled = reconcile_page(ctx, &rows)?;
    Stats::incr(&engine.stats.rec_pages);

    let info = {
        let _gc = engine.block_gc.read();
        let addr = engine.block.write(&encode(&reconciled.image)?)?;
        Stats::incr(&engine.stats.block_writes);
        let info = ImageInfo {
            addr,
            max_durable_ts: reconciled.image.max_durable_ts,
            max_txn: reconciled.image.max_txn,
            rows: reconciled.image.len() as u32,
        };
        page.set_image(info);
        info
    };
    engine.hs.apply(std::mem::take(&mut reconciled.hs_batch))?;
    reconciled.mark_in_hs();
    Stats::add(&engine.stats.hs_squashed, reconciled.squashed as u64);
    if !reconciled.retained {
        page.mark_clean(gen);
    }
    Ok(info)
}

/// Write the history store leaves that changed and a root listing every
/// leaf. Returns the root and the leaf blocks, or `None` when the store is
/// empty.
fn write_history(engine: &EngineState) -> Result<Option<(BlockAddr, Vec<BlockAddr>)>> {
    let (entries, written) = engine.hs.checkpoint()?;
    if entries.is_empty() {
        return Ok(None);
    }
    let root = engine.block.write(&encode(&entries)?)?;
    Stats::incr(&engine.stats.block_writes);
    debug!(
        target: "lapis::checkpoint",
        leaves = entries.len(),
        written,
        rows = engine.hs.len(),
        "history store written"
    );
    Ok(Some((root, entries.into_iter().map(|e| e.addr).collect())))
}

/// Release blocks nothing references any more: not a checkpoint record,
/// not an open reader, not a live page or history leaf image.
fn collect_blocks(engine: &EngineState) -> Result<usize> {
    let _gc = engine.block_gc.write();
    let mut keep: HashSet<BlockAddr> = HashSet::new();
    {
        let meta = engine.ckpt.meta.lock();
        keep.extend(meta.referenced_blocks().copied());
    }
    for record in engine.ckpt.readers.lock().values() {
        keep.extend(record.blocks.iter().copied());
    }
    for table in engine.tables() {
        for page in table.pages() {
            if let Some(info) = page.image() {
                keep.insert(info.addr);
            }
        }
    }
    keep.extend(engine.hs.images());
    let freed = engine.block.reclaim(&keep)?;
    if freed > 0 {
        Stats::add(&engine.stats.checkpoint_blocks_freed, freed as u64);
        Stats::add(&engine.stats.block_frees, freed as u64);
    }
    Ok(freed)
}
