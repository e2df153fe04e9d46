//! Eviction: write resident pages out and drop their rows from memory.
//!
//! A page is evicted by reconciling it, writing the image, applying the
//! history batch and only then releasing the rows. Any failure leaves the
//! page resident and dirty; history rows applied before a failure only copy
//! versions the page still holds.
//!
//! Cache use is tracked in two counters, total bytes and bytes held by
//! update chains; dirty bytes are computed from resident dirty pages when
//! needed. Resident history store leaves count toward the total and are
//! evicted alongside table pages when it is over. Each has a target (background eviction starts) and a trigger
//! (application threads help), both percentages of the cache size.

pub mod server;

use crate::btree::{ImageInfo, KeyEntry, Page, PageState, Table};
use crate::block::encode;
use crate::engine::EngineState;
use crate::error::{LapisError, Result};
use crate::reconcile::{reconcile_page, ReconcileCtx, ReconcileMode};
use crate::stats::Stats;
use crate::types::Key;
use parking_lot::{Condvar, Mutex};
use rand::Rng;
use std::collections::{BTreeMap, VecDeque};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use tracing::{debug, trace, warn};

pub use server::EvictServer;

// ============================================================================
// Cache accounting
// ============================================================================

#[derive(Debug, Default)]
pub struct CacheUsage {
    bytes: AtomicUsize,
    updates: AtomicUsize,
}

impl CacheUsage {
    pub fn bytes(&self) -> usize {
        self.bytes.load(Ordering::Acquire)
    }

    /// Bytes held by update chains.
    pub fn updates(&self) -> usize {
        self.updates.load(Ordering::Acquire)
    }

    pub fn add_bytes(&self, n: usize) {
        self.bytes.fetch_add(n, Ordering::AcqRel);
    }

    pub fn sub_bytes(&self, n: usize) {
        saturating_sub(&self.bytes, n);
    }

    /// An update of `n` bytes entered a chain.
    pub fn add_update(&self, n: usize) {
        self.bytes.fetch_add(n, Ordering::AcqRel);
        self.updates.fetch_add(n, Ordering::AcqRel);
    }

    pub fn sub_update(&self, n: usize) {
        saturating_sub(&self.bytes, n);
        saturating_sub(&self.updates, n);
    }
}

fn saturating_sub(cell: &AtomicUsize, n: usize) {
    let _ = cell.fetch_update(Ordering::AcqRel, Ordering::Acquire, |v| Some(v.saturating_sub(n)));
}

/// Which limits the cache is over.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Pressure {
    pub total: bool,
    pub dirty: bool,
    pub updates: bool,
}

impl Pressure {
    pub fn any(&self) -> bool {
        self.total || self.dirty || self.updates
    }

    /// Only clean pages relieve total pressure cheaply; dirty and update
    /// pressure need dirty pages written.
    fn wants_dirty(&self) -> bool {
        self.dirty || self.updates
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Level {
    /// Background eviction threshold
    Target,
    /// Application-assist threshold
    Trigger,
}

fn percent_of(cache_size: usize, pct: u8) -> usize {
    (cache_size / 100).saturating_mul(pct as usize)
}

pub fn pressure(engine: &EngineState, level: Level) -> Pressure {
    let c = &engine.config;
    let (total, dirty, updates) = match level {
        Level::Target => (c.eviction_target, c.eviction_dirty_target, c.eviction_updates_target),
        Level::Trigger => (c.eviction_trigger, c.eviction_dirty_trigger, c.eviction_updates_trigger),
    };
    let total = engine.cache_bytes() > percent_of(c.cache_size, total);
    let updates = engine.cache.updates() > percent_of(c.cache_size, updates);
    // Walking pages for dirty bytes is only worth it under some pressure
    let dirty = (total || updates || engine.cache.updates() > percent_of(c.cache_size, dirty))
        && engine.dirty_bytes() > percent_of(c.cache_size, dirty);
    Pressure { total, dirty, updates }
}

// ============================================================================
// Work queue
// ============================================================================

/// Pages picked by the coordinator, waiting for a worker.
#[derive(Default)]
pub struct EvictQueue {
    pub(crate) queue: Mutex<VecDeque<(Arc<Table>, Arc<Page>)>>,
    pub(crate) work: Condvar,
    /// Held by the single application thread assisting at a time
    pub(crate) assist: Mutex<()>,
}

impl EvictQueue {
    pub fn push(&self, table: Arc<Table>, page: Arc<Page>) {
        self.queue.lock().push_back((table, page));
        self.work.notify_one();
    }

    pub fn len(&self) -> usize {
        self.queue.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.queue.lock().is_empty()
    }
}

/// Up to `limit` evictable pages starting from a random table and page, so
/// repeated passes spread over the whole cache. Dirty pages first when
/// `pressure` asks for them.
pub fn candidates(engine: &EngineState, pressure: Pressure, limit: usize) -> Vec<(Arc<Table>, Arc<Page>)> {
    let tables = engine.tables();
    if tables.is_empty() || limit == 0 {
        return Vec::new();
    }
    let mut rng = rand::thread_rng();
    let first = rng.gen_range(0..tables.len());
    let mut clean = Vec::new();
    let mut dirty = Vec::new();
    for i in 0..tables.len() {
        let table = &tables[(first + i) % tables.len()];
        let pages = table.pages();
        if pages.is_empty() {
            continue;
        }
        let start = rng.gen_range(0..pages.len());
        for j in 0..pages.len() {
            let page = &pages[(start + j) % pages.len()];
            if page.state() != PageState::Resident || page.hazards() > 0 || page.is_retired() {
                continue;
            }
            let slot = if page.is_dirty() { &mut dirty } else { &mut clean };
            slot.push((Arc::clone(table), Arc::clone(page)));
        }
        if clean.len() + dirty.len() >= limit * 2 {
            break;
        }
    }
    let mut out = if pressure.wants_dirty() {
        dirty.extend(clean);
        dirty
    } else {
        clean.extend(dirty);
        clean
    };
    out.truncate(limit);
    out
}

// ============================================================================
// Evicting one page
// ============================================================================

/// Byte totals of a row map: everything, and just the chains.
fn row_usage(rows: &BTreeMap<Key, Arc<KeyEntry>>) -> (usize, usize) {
    rows.iter().fold((0, 0), |(total, chains), (key, entry)| {
        (total + key.len() + entry.mem_size(), chains + entry.chain.mem_size())
    })
}

/// Evict `page`. Returns the bytes released.
///
/// Fails with `EvictionBusy` if the page is pinned or holds updates that
/// cannot be written yet; the page is left exactly as it was.
pub fn evict_page(engine: &EngineState, table: &Table, page: &Arc<Page>) -> Result<usize> {
    if let Err(e) = page.lock_exclusive(0) {
        Stats::incr(&engine.stats.evict_busy);
        trace!(target: "lapis::evict", table = table.id, page = page.id(), "page busy");
        return Err(e);
    }

    // A clean page whose image is current is just dropped.
    if !page.is_dirty() && page.image().is_some() {
        let (_, chains) = row_usage(&page.rows());
        let freed = page.drop_rows();
        engine.cache.sub_update(chains);
        engine.cache.sub_bytes(freed.saturating_sub(chains));
        page.unlock(PageState::OnDisk);
        Stats::incr(&engine.stats.evict_pages);
        trace!(target: "lapis::evict", table = table.id, page = page.id(), freed, "clean page dropped");
        return Ok(freed);
    }

    let gen = page.write_gen();
    let ctx = ReconcileCtx {
        table: table.id,
        global: &engine.global,
        hs: &engine.hs,
        mode: ReconcileMode::Evict,
        update_restore: engine.config.update_restore,
    };
    let reconciled = {
        let rows = page.rows();
        reconcile_page(&ctx, &rows)
    };
    let mut reconciled = match reconciled {
        Ok(r) => r,
        Err(e) => {
            page.unlock(PageState::Resident);
            if matches!(e, LapisError::EvictionBusy) {
                Stats::incr(&engine.stats.evict_busy);
                trace!(target: "lapis::evict", table = table.id, page = page.id(), "uncommitted updates, page kept");
            } else {
                Stats::incr(&engine.stats.evict_failed);
            }
            return Err(e);
        }
    };
    Stats::incr(&engine.stats.rec_pages);

    // History rows may not land while a checkpoint is between its first
    // page write and its copy of the history store.
    let gate = if reconciled.hs_batch.is_empty() {
        None
    } else {
        match engine.history_gate.try_read() {
            Some(gate) => Some(gate),
            None => {
                page.unlock(PageState::Resident);
                Stats::incr(&engine.stats.evict_busy);
                trace!(target: "lapis::evict", table = table.id, page = page.id(), "checkpoint running, page kept");
                return Err(LapisError::EvictionBusy);
            }
        }
    };

    let info = {
        let _gc = engine.block_gc.read();
        let written = encode(&reconciled.image).and_then(|data| engine.block.write(&data));
        let addr = match written {
            Ok(addr) => addr,
            Err(e) => {
                page.unlock(PageState::Resident);
                Stats::incr(&engine.stats.evict_failed);
                warn!(target: "lapis::evict", table = table.id, page = page.id(), error = %e, "page write failed");
                return Err(e);
            }
        };
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

    let hs_rows = reconciled.hs_batch.len();
    if let Err(e) = engine.hs.apply(std::mem::take(&mut reconciled.hs_batch)) {
        // Still dirty, so the new image is never trusted on its own
        page.unlock(PageState::Resident);
        Stats::incr(&engine.stats.evict_failed);
        warn!(target: "lapis::evict", table = table.id, page = page.id(), error = %e, "history insert failed");
        return Err(e);
    }
    drop(gate);
    reconciled.mark_in_hs();
    Stats::add(&engine.stats.hs_squashed, reconciled.squashed as u64);

    if reconciled.residual.is_empty() {
        let (_, chains) = row_usage(&page.rows());
        let freed = page.drop_rows();
        engine.cache.sub_update(chains);
        engine.cache.sub_bytes(freed.saturating_sub(chains));
        page.mark_clean(gen);
        page.unlock(PageState::OnDisk);
        Stats::incr(&engine.stats.evict_pages);
        debug!(
            target: "lapis::evict",
            table = table.id,
            page = page.id(),
            rows = info.rows,
            hs_rows,
            freed,
            "page evicted"
        );
        return Ok(freed);
    }

    // Update/restore: written keys drop their chains, residual keys keep
    // theirs and the page stays resident and dirty.
    let (before_total, before_chains) = row_usage(&page.rows());
    {
        let mut rows = page.rows_mut();
        for (key, cell) in &reconciled.cells {
            if let Some(entry) = rows.get(key) {
                entry.chain.replace(None);
                entry.set_ondisk(cell.clone().map(Arc::new));
            }
        }
        rows.retain(|_, e| !e.chain.is_empty() || e.ondisk().is_some());
    }
    let (after_total, after_chains) = row_usage(&page.rows());
    page.set_mem(after_total);
    let chains_freed = before_chains.saturating_sub(after_chains);
    let freed = before_total.saturating_sub(after_total);
    engine.cache.sub_update(chains_freed);
    engine.cache.sub_bytes(freed.saturating_sub(chains_freed));
    page.unlock(PageState::Resident);
    Stats::add(&engine.stats.rec_residual_keys, reconciled.residual.len() as u64);
    debug!(
        target: "lapis::evict",
        table = table.id,
        page = page.id(),
        residual = reconciled.residual.len(),
        freed,
        "page written with residual updates"
    );
    Ok(freed)
}

/// Write out and drop up to `limit` history store leaves. Returns the
/// number evicted.
pub fn evict_history(engine: &EngineState, limit: usize) -> usize {
    match engine.hs.evict_leaves(limit, &engine.block_gc) {
        Ok(n) => n,
        Err(e) => {
            Stats::incr(&engine.stats.evict_failed);
            warn!(target: "lapis::evict", error = %e, "history leaf eviction failed");
            0
        }
    }
}

/// Evict every resident page of `table` that can be evicted. Returns the
/// number of pages written or dropped.
pub fn evict_table(engine: &EngineState, table: &Table) -> Result<usize> {
    let mut evicted = 0;
    for page in table.pages() {
        if page.state() != PageState::Resident || page.is_retired() {
            continue;
        }
        match evict_page(engine, table, &page) {
            Ok(_) => evicted += 1,
            Err(LapisError::EvictionBusy) => {}
            Err(e) => return Err(e),
        }
    }
    Ok(evicted)
}

/// Application-thread eviction once the cache is over its trigger. Only one
/// thread assists at a time; the rest carry on.
pub fn app_assist(engine: &EngineState) {
    if !engine.config.app_assist || !pressure(engine, Level::Trigger).any() {
        return;
    }
    let Some(_assist) = engine.evict.assist.try_lock() else {
        return;
    };
    Stats::incr(&engine.stats.evict_app_assist);
    loop {
        let p = pressure(engine, Level::Trigger);
        if !p.any() {
            break;
        }
        let mut progress = false;
        for (table, page) in candidates(engine, p, 8) {
            if let Ok(freed) = evict_page(engine, &table, &page) {
                progress |= freed > 0;
            }
        }
        if p.total {
            progress |= evict_history(engine, 8) > 0;
        }
        if !progress {
            trace!(target: "lapis::evict", bytes = engine.cache_bytes(), "assist made no progress");
            break;
        }
    }
}
