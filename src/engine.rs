//! Shared engine state.
//!
//! One `EngineState` lives behind an `Arc` and is handed to every
//! component: sessions, eviction threads, checkpoints, rollback-to-stable
//! and recovery. There is no ambient global state.

use crate::block::BlockManager;
use crate::btree::{KeyEntry, Page, PagePin, PinAttempt, Table};
use crate::checkpoint::{CheckpointMeta, CheckpointState};
use crate::config::{EngineConfig, TableConfig};
use crate::error::{LapisError, Result};
use crate::evict::{CacheUsage, EvictQueue};
use crate::history::HistoryStore;
use crate::mvcc::{resolve, Modify, ReadContext, Update, UpdateChain, UpdateValue, Visibility};
use crate::stats::Stats;
use crate::txn::{IsolationLevel, Transaction, TxnGlobal, TxnOp};
use crate::types::{TableId, TimeWindow, Value, TS_MAX, TS_NONE};
use crate::wal::WriteAheadLog;
use dashmap::DashMap;
use parking_lot::{Mutex, RwLock};
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use std::sync::Arc;
use tracing::{debug, error};

/// A user write before it becomes an update.
#[derive(Debug, Clone)]
pub enum WriteOp {
    Insert(Value),
    Remove,
    Modify(Modify),
}

pub struct EngineState {
    pub config: EngineConfig,
    pub global: TxnGlobal,
    pub hs: HistoryStore,
    pub block: Arc<dyn BlockManager>,
    pub wal: Arc<dyn WriteAheadLog>,
    pub stats: Arc<Stats>,
    pub cache: CacheUsage,
    pub evict: EvictQueue,
    pub ckpt: CheckpointState,
    /// Held shared from writing a page block until the page points at it, so
    /// block collection never frees an image about to be published
    pub block_gc: RwLock<()>,
    /// Held exclusively by a checkpoint from its first page write until it
    /// has copied the history store; eviction takes it shared to add rows
    pub history_gate: RwLock<()>,
    tables: RwLock<BTreeMap<TableId, Arc<Table>>>,
    names: DashMap<String, TableId, ahash::RandomState>,
    page_ids: AtomicU64,
    next_table_id: AtomicU32,
    panicked: Mutex<Option<String>>,
}

impl EngineState {
    pub fn new(
        config: EngineConfig,
        global: TxnGlobal,
        hs: HistoryStore,
        block: Arc<dyn BlockManager>,
        wal: Arc<dyn WriteAheadLog>,
        stats: Arc<Stats>,
        meta: CheckpointMeta,
    ) -> Self {
        let next_table_id = meta.next_table_id.max(1);
        Self {
            config,
            global,
            hs,
            block,
            wal,
            stats,
            cache: CacheUsage::default(),
            evict: EvictQueue::default(),
            ckpt: CheckpointState::new(meta),
            block_gc: RwLock::new(()),
            history_gate: RwLock::new(()),
            tables: RwLock::new(BTreeMap::new()),
            names: DashMap::with_hasher(ahash::RandomState::new()),
            page_ids: AtomicU64::new(1),
            next_table_id: AtomicU32::new(next_table_id),
            panicked: Mutex::new(None),
        }
    }

    // ------------------------------------------------------------------
    // Panic latch
    // ------------------------------------------------------------------

    /// Fail if an earlier invariant violation poisoned the engine.
    pub fn check_panic(&self) -> Result<()> {
        match self.panicked.lock().as_ref() {
            Some(msg) => Err(LapisError::Panic(msg.clone())),
            None => Ok(()),
        }
    }

    /// Latch the engine as panicked and return the error to propagate.
    pub fn panic(&self, msg: impl Into<String>) -> LapisError {
        let msg = msg.into();
        error!(target: "lapis::engine", reason = %msg, "invariant violated, engine is unusable");
        let mut latch = self.panicked.lock();
        if latch.is_none() {
            *latch = Some(msg.clone());
        }
        LapisError::Panic(msg)
    }

    // ------------------------------------------------------------------
    // Tables
    // ------------------------------------------------------------------

    pub fn page_ids(&self) -> &AtomicU64 {
        &self.page_ids
    }

    pub fn allocate_table_id(&self) -> TableId {
        self.next_table_id.fetch_add(1, Ordering::AcqRel)
    }

    pub fn next_table_id(&self) -> TableId {
        self.next_table_id.load(Ordering::Acquire)
    }

    pub fn insert_table(&self, table: Arc<Table>) {
        self.names.insert(table.name.clone(), table.id);
        let id = table.id;
        self.tables.write().insert(id, table);
        let next = id.saturating_add(1);
        self.next_table_id.fetch_max(next, Ordering::AcqRel);
    }

    /// New empty table registered under `name`.
    pub fn create_table(&self, name: &str, config: TableConfig) -> Result<Arc<Table>> {
        if self.names.contains_key(name) {
            return Err(LapisError::invalid(format!("table \"{}\" already exists", name)));
        }
        let id = self.allocate_table_id();
        let table = Arc::new(Table::new(id, name, config, &self.page_ids));
        self.insert_table(Arc::clone(&table));
        debug!(target: "lapis::engine", table = id, name, logged = table.is_logged(), "table created");
        Ok(table)
    }

    pub fn tables(&self) -> Vec<Arc<Table>> {
        self.tables.read().values().cloned().collect()
    }

    pub fn table(&self, id: TableId) -> Option<Arc<Table>> {
        self.tables.read().get(&id).cloned()
    }

    pub fn table_by_name(&self, name: &str) -> Result<Arc<Table>> {
        let id = self
            .names
            .get(name)
            .map(|r| *r.value())
            .ok_or_else(|| LapisError::NotFound(format!("table \"{}\"", name)))?;
        self.table(id)
            .ok_or_else(|| LapisError::NotFound(format!("table \"{}\"", name)))
    }

    /// Whether commits to `table` are written to the log.
    pub fn log_is_enabled(&self, table: &Table) -> bool {
        self.wal.is_enabled() && table.is_logged()
    }

    // ------------------------------------------------------------------
    // Pages
    // ------------------------------------------------------------------

    /// Pin the page holding `key`, loading it if needed.
    pub fn pin_page(&self, table: &Table, key: &[u8]) -> Result<PagePin> {
        loop {
            let page = table
                .page_for(key)
                .ok_or_else(|| self.panic(format!("table {} has no page for a key", table.id)))?;
            if let Some(pin) = self.pin_existing(&page)? {
                return Ok(pin);
            }
        }
    }

    /// Pin a specific page. `None` if a split retired it.
    pub fn pin_existing(&self, page: &Arc<Page>) -> Result<Option<PagePin>> {
        loop {
            match page.try_pin() {
                PinAttempt::Pinned(pin) => return Ok(Some(pin)),
                PinAttempt::Retired => return Ok(None),
                PinAttempt::Busy => std::thread::yield_now(),
                PinAttempt::NeedsLoad => {
                    let bytes = page.load(self.block.as_ref())?;
                    if bytes > 0 {
                        self.cache.add_bytes(bytes);
                        Stats::incr(&self.stats.page_reads);
                    }
                }
            }
        }
    }

    // ------------------------------------------------------------------
    // Reads and writes
    // ------------------------------------------------------------------

    /// Visibility context of a running transaction.
    pub fn txn_context<'a>(&'a self, txn: &'a Transaction) -> ReadContext<'a> {
        ReadContext {
            txn_id: txn.id(),
            isolation: txn.isolation,
            snapshot: txn.snapshot.as_ref(),
            read_ts: if txn.read_ts == TS_NONE { TS_MAX } else { txn.read_ts },
            global: Some(&self.global),
        }
    }

    /// Resolve `key` for `ctx`.
    pub fn read(&self, table: &Table, key: &[u8], ctx: &ReadContext<'_>) -> Result<Option<Value>> {
        let pin = self.pin_page(table, key)?;
        let history = self.hs.view(table.id, key);
        match pin.get(key) {
            Some(entry) => {
                let ondisk = entry.ondisk();
                resolve(ctx, &entry.chain, ondisk.as_deref(), &history)
            }
            None => resolve(ctx, &UpdateChain::new(), None, &history),
        }
    }

    /// Apply one write of `txn`.
    pub fn write(&self, txn: &mut Transaction, table: &Arc<Table>, key: &[u8], op: WriteOp) -> Result<()> {
        if txn.is_prepared() {
            return Err(LapisError::invalid("a prepared transaction cannot write"));
        }
        let pin = self.pin_page(table, key)?;
        let (entry, upd) = {
            let _latch = pin.latch();
            let (entry, created) = pin.entry(key);
            if created {
                self.cache.add_bytes(key.len() + std::mem::size_of::<KeyEntry>());
            }
            let value = self.stored_value(txn, table, key, &entry, op)?;
            let upd = Arc::new(Update::new(txn.id(), value));
            entry.chain.push(Arc::clone(&upd));

            let size = upd.mem_size();
            pin.add_mem(size);
            self.cache.add_update(size);
            pin.mark_dirty();

            let (removed, bytes) = entry.chain.truncate_obsolete(&self.global);
            if removed > 0 {
                pin.sub_mem(bytes);
                self.cache.sub_update(bytes);
                Stats::add(&self.stats.chain_truncated, removed as u64);
            }
            (entry, upd)
        };

        txn.ops.push(TxnOp {
            table: table.id,
            key: key.to_vec(),
            entry,
            update: upd,
        });

        if table.try_split(pin.page(), self.config.max_page_rows, 1, &self.page_ids) {
            Stats::incr(&self.stats.page_splits);
        }
        Ok(())
    }

    /// Payload for a write: inserts are stored as given, removes and
    /// modifies need the key to be visible to the writer. A modify is kept
    /// as a delta only over a base the writer can see directly.
    fn stored_value(
        &self,
        txn: &Transaction,
        table: &Table,
        key: &[u8],
        entry: &KeyEntry,
        op: WriteOp,
    ) -> Result<UpdateValue> {
        let m = match op {
            WriteOp::Insert(v) => return Ok(UpdateValue::Full(v)),
            WriteOp::Remove => {
                let ctx = self.txn_context(txn);
                let ondisk = entry.ondisk();
                let current = resolve(&ctx, &entry.chain, ondisk.as_deref(), &self.hs.view(table.id, key))?;
                if current.is_none() {
                    return Err(LapisError::NotFound("key".into()));
                }
                return Ok(UpdateValue::Tombstone);
            }
            WriteOp::Modify(m) => m,
        };

        let ctx = self.txn_context(txn);
        let ondisk = entry.ondisk();
        let current = resolve(&ctx, &entry.chain, ondisk.as_deref(), &self.hs.view(table.id, key))?
            .ok_or_else(|| LapisError::NotFound("key".into()))?;

        let direct_base = match entry.chain.first_live() {
            Some(head) => {
                head.txn_id() == txn.id()
                    || (self.global.is_committed(head.txn_id())
                        && ctx.update_visibility(&head) == Visibility::Visible)
            }
            None => ondisk.as_deref().is_some_and(|cell| ctx.tw_visible(&cell.tw)),
        };
        if direct_base && txn.isolation != IsolationLevel::ReadUncommitted {
            Ok(UpdateValue::Delta(m))
        } else {
            Ok(UpdateValue::Full(m.apply(&current)))
        }
    }

    /// Install an already-committed version, as recovery does for logged
    /// writes.
    pub fn apply_committed(&self, table: &Table, key: &[u8], value: UpdateValue, tw: &TimeWindow) -> Result<()> {
        let pin = self.pin_page(table, key)?;
        let _latch = pin.latch();
        let (entry, created) = pin.entry(key);
        if created {
            self.cache.add_bytes(key.len() + std::mem::size_of::<KeyEntry>());
        }
        let upd = Arc::new(Update::committed(tw, value, 0));
        let size = upd.mem_size();
        entry.chain.push(upd);
        pin.add_mem(size);
        self.cache.add_update(size);
        pin.mark_dirty();
        Ok(())
    }

    /// Resident bytes: table pages, update chains and history store leaves.
    pub fn cache_bytes(&self) -> usize {
        self.cache.bytes() + self.hs.bytes()
    }

    /// Bytes held by dirty resident pages.
    pub fn dirty_bytes(&self) -> usize {
        self.tables()
            .iter()
            .flat_map(|t| t.pages())
            .filter(|p| p.is_resident() && p.is_dirty())
            .map(|p| p.mem())
            .sum()
    }

    /// Resident page count across all tables.
    pub fn resident_pages(&self) -> usize {
        self.tables()
            .iter()
            .flat_map(|t| t.pages())
            .filter(|p| p.is_resident())
            .count()
    }

    pub fn is_logged_table(&self, id: TableId) -> bool {
        self.table(id).is_some_and(|t| self.log_is_enabled(&t))
    }
}

impl std::fmt::Debug for EngineState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EngineState")
            .field("tables", &self.tables.read().len())
            .field("cache", &self.cache)
            .finish()
    }
}
