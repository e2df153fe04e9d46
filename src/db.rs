//! LapisDB: open, recover, and run an engine.

use crate::block::{decode, BlockManager, FileBlockManager, MemBlockManager};
use crate::btree::{RootImage, Table};
use crate::checkpoint::{self, read_history_root, CheckpointMeta, CheckpointReader, CheckpointRecord};
use crate::config::{CheckpointConfig, EngineConfig, RtsConfig, TableConfig, TimestampConfig};
use crate::engine::EngineState;
use crate::error::{LapisError, Result};
use crate::evict::{self, EvictServer};
use crate::history::HistoryStore;
use crate::rts::{self, RtsReport};
use crate::session::Session;
use crate::stats::{Stats, StatsSnapshot};
use crate::txn::{TimestampQuery, TxnGlobal};
use crate::types::{ts_hex, TimeWindow, Timestamp, TS_NONE};
use crate::wal::{NoOpWAL, WriteAheadLog};
use parking_lot::{Condvar, Mutex};
use std::collections::HashSet;
use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};

/// A background task run every `period` until shutdown.
struct Periodic {
    shutdown: Arc<AtomicBool>,
    signal: Arc<(Mutex<()>, Condvar)>,
    handle: Option<JoinHandle<()>>,
}

impl Periodic {
    fn start<F>(name: &str, period: Duration, mut task: F) -> Option<Self>
    where
        F: FnMut() + Send + 'static,
    {
        let shutdown = Arc::new(AtomicBool::new(false));
        let signal = Arc::new((Mutex::new(()), Condvar::new()));
        let thread_shutdown = Arc::clone(&shutdown);
        let thread_signal = Arc::clone(&signal);
        let spawned = thread::Builder::new().name(name.to_string()).spawn(move || loop {
            {
                let mut guard = thread_signal.0.lock();
                if !thread_shutdown.load(Ordering::Acquire) {
                    let _ = thread_signal.1.wait_for(&mut guard, period);
                }
            }
            if thread_shutdown.load(Ordering::Acquire) {
                break;
            }
            task();
        });
        match spawned {
            Ok(handle) => Some(Self {
                shutdown,
                signal,
                handle: Some(handle),
            }),
            Err(e) => {
                warn!(target: "lapis::engine", thread = name, error = %e, "could not start background thread");
                None
            }
        }
    }

    fn stop(&mut self) {
        self.shutdown.store(true, Ordering::Release);
        {
            let _guard = self.signal.0.lock();
            self.signal.1.notify_all();
        }
        if let Some(handle) = self.handle.take() {
            let _ = handle.join();
        }
    }
}

/// An open database.
///
/// Dropping a `LapisDB` without `close` stops its threads and abandons
/// everything since the last checkpoint, like a crash.
pub struct LapisDB {
    engine: Arc<EngineState>,
    evict_server: Option<EvictServer>,
    workers: Vec<Periodic>,
    closed: bool,
}

impl LapisDB {
    /// Open (or create) a database in `path`.
    pub fn open(path: impl AsRef<Path>, config: EngineConfig) -> Result<Self> {
        let path = path.as_ref();
        config.validate()?;
        std::fs::create_dir_all(path)?;
        let block: Arc<dyn BlockManager> = Arc::new(FileBlockManager::open(path, config.block_file_mb)?);
        let wal = config.wal.build(Some(&path.join("wal")))?;
        Self::open_with(config, block, wal)
    }

    /// Open a heap-backed database with no log.
    pub fn open_in_memory(config: EngineConfig) -> Result<Self> {
        Self::open_with(config, Arc::new(MemBlockManager::new()), Arc::new(NoOpWAL::new()))
    }

    /// Open over caller-supplied storage. Sharing `block` and `wal` with a
    /// dropped database reopens it as after a crash.
    pub fn open_with(config: EngineConfig, block: Arc<dyn BlockManager>, wal: Arc<dyn WriteAheadLog>) -> Result<Self> {
        config.validate()?;
        let started = Instant::now();
        let engine = Arc::new(recover(config, block, wal)?);
        let report = rts::rollback_to_stable(&engine, &RtsConfig::default(), true)?;
        info!(
            target: "lapis::engine",
            tables = engine.tables().len(),
            stable = %ts_hex(engine.global.stable_timestamp()),
            rts_changed = report.changed(),
            elapsed_ms = started.elapsed().as_millis() as u64,
            "database opened"
        );

        let mut db = Self {
            evict_server: None,
            workers: Vec::new(),
            engine,
            closed: false,
        };
        db.start_background();
        Ok(db)
    }

    fn start_background(&mut self) {
        if self.engine.config.eviction_threads > 0 {
            self.evict_server = Some(EvictServer::start(Arc::clone(&self.engine)));
        }
        if self.engine.config.checkpoint_interval_ms > 0 {
            let engine = Arc::clone(&self.engine);
            let period = Duration::from_millis(self.engine.config.checkpoint_interval_ms);
            let worker = Periodic::start("lapis-checkpoint", period, move || {
                if engine.check_panic().is_err() {
                    return;
                }
                if let Err(e) = checkpoint::checkpoint(&engine, &CheckpointConfig::default()) {
                    warn!(target: "lapis::checkpoint", error = %e, "background checkpoint failed");
                }
            });
            self.workers.extend(worker);
        }
        if self.engine.config.hs_cleanup_interval_ms > 0 {
            let engine = Arc::clone(&self.engine);
            let period = Duration::from_millis(self.engine.config.hs_cleanup_interval_ms);
            let worker = Periodic::start("lapis-hs-cleanup", period, move || {
                if engine.check_panic().is_err() {
                    return;
                }
                match engine.hs.cleanup_obsolete(&engine.global) {
                    Ok((removed, rebased)) if removed + rebased > 0 => {
                        debug!(target: "lapis::history", removed, rebased, "history cleanup pass");
                    }
                    Ok(_) => {}
                    Err(e) => warn!(target: "lapis::history", error = %e, "history cleanup failed"),
                }
            });
            self.workers.extend(worker);
        }
    }

    fn stop_background(&mut self) {
        for worker in &mut self.workers {
            worker.stop();
        }
        self.workers.clear();
        if let Some(mut server) = self.evict_server.take() {
            server.stop(&self.engine);
        }
    }

    // ------------------------------------------------------------------
    // Tables and sessions
    // ------------------------------------------------------------------

    pub fn create_table(&self, name: &str, config: TableConfig) -> Result<()> {
        self.engine.check_panic()?;
        let table = self.engine.create_table(name, config)?;
        checkpoint::persist_catalog(&self.engine)?;
        debug!(target: "lapis::engine", table = table.id, name, logged = table.is_logged(), "table created");
        Ok(())
    }

    pub fn table_names(&self) -> Vec<String> {
        self.engine.tables().iter().map(|t| t.name.clone()).collect()
    }

    pub fn session(&self) -> Session {
        Session::new(Arc::clone(&self.engine))
    }

    // ------------------------------------------------------------------
    // Timestamps
    // ------------------------------------------------------------------

    /// Move the oldest and/or stable timestamps.
    pub fn set_timestamp(&self, config: &TimestampConfig) -> Result<()> {
        self.engine.check_panic()?;
        if config.has_txn() {
            return Err(LapisError::invalid(
                "commit, durable, read and prepare timestamps belong to a transaction",
            ));
        }
        self.engine
            .global
            .set_global(config.oldest_timestamp, config.stable_timestamp)
    }

    pub fn query_timestamp(&self, query: TimestampQuery) -> Timestamp {
        query.query(&self.engine.global)
    }

    // ------------------------------------------------------------------
    // Checkpoints, rollback, maintenance
    // ------------------------------------------------------------------

    pub fn checkpoint(&self, config: &CheckpointConfig) -> Result<CheckpointRecord> {
        checkpoint::checkpoint(&self.engine, config)
    }

    /// Names of the named checkpoints.
    pub fn checkpoint_names(&self) -> Vec<String> {
        self.engine.ckpt.names()
    }

    /// Open a read-only view of a checkpoint (`None` for the default one).
    pub fn open_checkpoint(&self, name: Option<&str>) -> Result<CheckpointReader> {
        self.engine.check_panic()?;
        CheckpointReader::open(Arc::clone(&self.engine), name)
    }

    pub fn rollback_to_stable(&self, config: &RtsConfig) -> Result<RtsReport> {
        rts::rollback_to_stable(&self.engine, config, false)
    }

    /// Evict every resident page that can be evicted. Returns pages evicted.
    pub fn evict_all(&self) -> Result<usize> {
        self.engine.check_panic()?;
        let mut evicted = 0;
        for table in self.engine.tables() {
            evicted += evict::evict_table(&self.engine, &table)?;
        }
        Ok(evicted)
    }

    pub fn evict_table(&self, name: &str) -> Result<usize> {
        self.engine.check_panic()?;
        let table = self.engine.table_by_name(name)?;
        evict::evict_table(&self.engine, &table)
    }

    /// Remove history no reader can need. Returns (removed, rebased).
    pub fn hs_cleanup(&self) -> Result<(usize, usize)> {
        self.engine.check_panic()?;
        self.engine.hs.cleanup_obsolete(&self.engine.global)
    }

    pub fn stats(&self) -> StatsSnapshot {
        self.engine.stats.snapshot()
    }

    pub fn engine(&self) -> &Arc<EngineState> {
        &self.engine
    }

    /// Stop background work, take a final checkpoint and sync.
    pub fn close(mut self) -> Result<()> {
        self.shutdown()
    }

    fn shutdown(&mut self) -> Result<()> {
        if self.closed {
            return Ok(());
        }
        self.closed = true;
        self.stop_background();
        self.engine.check_panic()?;
        checkpoint::checkpoint(&self.engine, &CheckpointConfig::default())?;
        self.engine.block.sync()?;
        self.engine.wal.sync()?;
        info!(target: "lapis::engine", "database closed");
        Ok(())
    }
}

impl Drop for LapisDB {
    fn drop(&mut self) {
        if !self.closed {
            self.stop_background();
        }
    }
}

impl std::fmt::Debug for LapisDB {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LapisDB")
            .field("engine", &self.engine)
            .field("background_workers", &self.workers.len())
            .finish()
    }
}

/// Rebuild engine state from the last default checkpoint plus the log.
fn recover(config: EngineConfig, block: Arc<dyn BlockManager>, wal: Arc<dyn WriteAheadLog>) -> Result<EngineState> {
    let meta = match block.read_metadata()? {
        Some(bytes) => CheckpointMeta::decode(&bytes)?,
        None => CheckpointMeta::default(),
    };
    let record = meta.record(None).cloned();
    let stats = Arc::new(Stats::default());
    let global = TxnGlobal::with_base(meta.next_txn_id);
    let history = match &record {
        Some(r) => read_history_root(block.as_ref(), r.hs_root)?,
        None => Vec::new(),
    };
    let hs = HistoryStore::open(Arc::clone(&block), config.hs_page_entries, &history, Arc::clone(&stats));
    let tables = meta.tables.clone();
    let keep: HashSet<_> = meta.referenced_blocks().copied().collect();
    let engine = EngineState::new(config, global, hs, Arc::clone(&block), Arc::clone(&wal), stats, meta);

    for entry in tables {
        let root = record.as_ref().and_then(|r| r.root_of(entry.id));
        let table = match root {
            Some(addr) => {
                let root: RootImage = decode(&block.read(&addr)?)?;
                Table::from_root(entry.id, entry.name, entry.config, &root, engine.page_ids())
            }
            None => Table::new(entry.id, entry.name, entry.config, engine.page_ids()),
        };
        engine.insert_table(Arc::new(table));
    }

    let reclaimed = block.reclaim(&keep)?;
    if reclaimed > 0 {
        debug!(target: "lapis::engine", reclaimed, "released blocks written after the last checkpoint");
    }

    let from = record.as_ref().map(|r| r.wal_lsn).unwrap_or(0);
    let replayed = replay_log(&engine, from)?;

    match &record {
        Some(r) => {
            engine.global.restore_watermarks(r.oldest_ts, r.stable_ts);
            engine.global.set_recovery_snapshot(Some(r.snapshot.clone()));
        }
        None => engine.global.restore_watermarks(TS_NONE, TS_NONE),
    }
    info!(
        target: "lapis::engine",
        checkpoint = record.as_ref().map(|r| r.generation).unwrap_or(0),
        replayed,
        "recovery complete"
    );
    Ok(engine)
}

/// Apply committed log records at or after `from` to the logged tables.
fn replay_log(engine: &EngineState, from: u64) -> Result<usize> {
    if !engine.wal.is_enabled() {
        return Ok(0);
    }
    let records = engine.wal.replay_from(from)?;
    let mut applied = 0;
    for record in &records {
        engine.global.reserve_ids(record.txn_id + 1);
        let tw = TimeWindow::new(record.commit_ts, record.durable_ts, record.txn_id);
        for op in &record.ops {
            let Some(table) = engine.table(op.table) else {
                warn!(target: "lapis::wal", table = op.table, lsn = record.lsn, "log record for unknown table");
                continue;
            };
            if !table.is_logged() {
                continue;
            }
            engine.apply_committed(&table, &op.key, op.value.clone(), &tw)?;
        }
        applied += 1;
    }
    Stats::add(&engine.stats.wal_records_replayed, applied as u64);
    if applied > 0 {
        debug!(target: "lapis::wal", from, applied, "replayed log");
    }
    Ok(applied)
}
