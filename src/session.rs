//! Sessions: the transactional API.
//!
//! A session runs at most one transaction at a time. Operations outside a
//! transaction run in their own autocommit transaction.

use crate::config::{BeginConfig, CommitConfig, TimestampConfig};
use crate::engine::{EngineState, WriteOp};
use crate::error::{LapisError, Result};
use crate::evict;
use crate::mvcc::{Modify, ReadContext, Visibility};
use crate::stats::Stats;
use crate::txn::{validate_commit, validate_prepare, validate_read, IsolationLevel, Transaction, TxnState};
use crate::types::{ts_hex, Timestamp, Value, TS_NONE};
use crate::wal::{LogOp, LogRecord};
use std::collections::HashSet;
use std::sync::Arc;
use tracing::{debug, trace};

pub struct Session {
    engine: Arc<EngineState>,
    txn: Option<Transaction>,
}

impl Session {
    pub(crate) fn new(engine: Arc<EngineState>) -> Self {
        Self { engine, txn: None }
    }

    pub fn in_transaction(&self) -> bool {
        self.txn.is_some()
    }

    /// Id of the running transaction.
    pub fn txn_id(&self) -> Option<u64> {
        self.txn.as_ref().map(|t| t.id())
    }

    // ------------------------------------------------------------------
    // Transaction lifecycle
    // ------------------------------------------------------------------

    pub fn begin(&mut self, config: &BeginConfig) -> Result<()> {
        self.engine.check_panic()?;
        if self.txn.is_some() {
            return Err(LapisError::invalid("a transaction is already running"));
        }
        let global = &self.engine.global;
        let read_ts = match config.read_timestamp {
            Some(ts) => validate_read(global, ts, config.round_to_oldest)?,
            None => TS_NONE,
        };
        let shared = global.begin(config.isolation, read_ts);
        let mut txn = Transaction::new(shared, config.isolation);
        txn.read_ts = read_ts;
        if config.isolation == IsolationLevel::Snapshot {
            txn.snapshot = Some(global.snapshot(txn.id()));
        }
        Stats::incr(&self.engine.stats.txn_begin);
        self.txn = Some(txn);
        Ok(())
    }

    /// Set timestamps on the running transaction.
    pub fn timestamp_transaction(&mut self, config: &TimestampConfig) -> Result<()> {
        if config.has_global() {
            return Err(LapisError::invalid(
                "oldest and stable timestamps are set on the database, not a transaction",
            ));
        }
        let global = &self.engine.global;
        let txn = self
            .txn
            .as_mut()
            .ok_or_else(|| LapisError::invalid("no transaction is running"))?;
        if let Some(ts) = config.read_timestamp {
            if txn.read_ts != TS_NONE {
                return Err(LapisError::invalid("read timestamp is already set"));
            }
            let ts = validate_read(global, ts, false)?;
            txn.read_ts = ts;
            txn.shared.set_read_ts(ts);
        }
        if let Some(ts) = config.prepare_timestamp {
            if txn.is_prepared() {
                return Err(LapisError::invalid("transaction is already prepared"));
            }
            txn.prepare_ts = ts;
        }
        if let Some(ts) = config.commit_timestamp {
            txn.commit_ts = ts;
        }
        if let Some(ts) = config.durable_timestamp {
            txn.durable_ts = ts;
        }
        Ok(())
    }

    /// Prepare the running transaction at `prepare_ts` (or the timestamp set
    /// earlier through `timestamp_transaction` when `TS_NONE`).
    pub fn prepare(&mut self, prepare_ts: Timestamp) -> Result<()> {
        self.engine.check_panic()?;
        let txn = self
            .txn
            .take()
            .ok_or_else(|| LapisError::invalid("no transaction is running"))?;
        if txn.is_prepared() {
            self.txn = Some(txn);
            return Err(LapisError::invalid("transaction is already prepared"));
        }
        let prepare_ts = if prepare_ts == TS_NONE { txn.prepare_ts } else { prepare_ts };
        if let Err(e) = validate_prepare(&self.engine.global, &txn, prepare_ts) {
            self.txn = Some(txn);
            return Err(e);
        }
        {
            let _commit = self.engine.global.commit_lock();
            if let Err(e) = self.validate_keys(&txn, prepare_ts) {
                drop(_commit);
                self.abort(txn);
                return Err(e);
            }
            for op in &txn.ops {
                op.update.set_prepared(prepare_ts);
            }
            txn.shared.set_prepare_ts(prepare_ts);
            txn.shared.set_state(TxnState::Prepared);
        }
        let mut txn = txn;
        txn.prepare_ts = prepare_ts;
        Stats::incr(&self.engine.stats.txn_prepare);
        debug!(target: "lapis::txn", txn = txn.id(), prepare_ts = %ts_hex(prepare_ts), "prepared");
        self.txn = Some(txn);
        Ok(())
    }

    pub fn commit(&mut self, config: &CommitConfig) -> Result<()> {
        self.engine.check_panic()?;
        let txn = self
            .txn
            .take()
            .ok_or_else(|| LapisError::invalid("no transaction is running"))?;
        if let Some(reason) = txn.doomed.clone() {
            Stats::incr(&self.engine.stats.txn_conflict);
            self.abort(txn);
            return Err(LapisError::conflict(reason));
        }
        let commit_ts = config.commit_timestamp.unwrap_or(txn.commit_ts);
        let durable_ts = config.durable_timestamp.unwrap_or(txn.durable_ts);
        let (commit_ts, durable_ts) = match validate_commit(&self.engine.global, &txn, commit_ts, durable_ts) {
            Ok(pair) => pair,
            Err(e) => {
                self.abort(txn);
                return Err(e);
            }
        };

        if let Err(e) = self.publish(&txn, commit_ts, durable_ts) {
            if matches!(e, LapisError::RollbackConflict { .. }) {
                Stats::incr(&self.engine.stats.txn_conflict);
            }
            self.abort(txn);
            return Err(e);
        }
        Stats::incr(&self.engine.stats.txn_commit);
        trace!(
            target: "lapis::txn",
            txn = txn.id(),
            commit_ts = %ts_hex(commit_ts),
            ops = txn.ops.len(),
            "committed"
        );
        drop(txn);
        evict::app_assist(&self.engine);
        Ok(())
    }

    pub fn rollback(&mut self) -> Result<()> {
        let txn = self
            .txn
            .take()
            .ok_or_else(|| LapisError::invalid("no transaction is running"))?;
        self.abort(txn);
        Ok(())
    }

    fn abort(&self, txn: Transaction) {
        for op in &txn.ops {
            op.update.mark_aborted();
        }
        self.engine.global.end(&txn.shared, TxnState::Aborted);
        Stats::incr(&self.engine.stats.txn_rollback);
        trace!(target: "lapis::txn", txn = txn.id(), ops = txn.ops.len(), "rolled back");
    }

    /// Validate, log and stamp a commit under the commit lock.
    fn publish(&self, txn: &Transaction, commit_ts: Timestamp, durable_ts: Timestamp) -> Result<()> {
        if txn.is_read_only() {
            self.engine.global.end(&txn.shared, TxnState::Committed);
            return Ok(());
        }
        let _commit = self.engine.global.commit_lock();
        if !txn.is_prepared() {
            self.validate_keys(txn, commit_ts)?;
        }
        self.log_commit(txn, commit_ts, durable_ts)?;
        for op in &txn.ops {
            op.update.set_committed(commit_ts, durable_ts);
        }
        txn.shared.set_commit_ts(commit_ts, durable_ts);
        self.engine.global.end(&txn.shared, TxnState::Committed);
        Ok(())
    }

    /// First-committer-wins check plus per-key timestamp order, for every
    /// key the transaction wrote. Caller holds the commit lock.
    fn validate_keys(&self, txn: &Transaction, ts: Timestamp) -> Result<()> {
        let global = &self.engine.global;
        let ctx = self.engine.txn_context(txn);
        let mut seen = HashSet::new();
        for op in &txn.ops {
            if !seen.insert(Arc::as_ptr(&op.entry) as usize) {
                continue;
            }
            let mut own = false;
            let mut previous: Option<Timestamp> = None;
            let mut checked_below = false;
            for upd in op.entry.chain.iter() {
                if upd.is_aborted() {
                    continue;
                }
                if upd.txn_id() == txn.id() {
                    own = true;
                    continue;
                }
                if !own {
                    if global.is_committed(upd.txn_id()) || upd.is_prepared_in_progress() {
                        return Err(LapisError::conflict("a newer version of the key was committed"));
                    }
                    continue;
                }
                if upd.is_prepared_in_progress() {
                    return Err(LapisError::conflict("the key has a prepared update"));
                }
                if global.is_committed(upd.txn_id()) {
                    if txn.isolation == IsolationLevel::Snapshot && ctx.update_visibility(&upd) != Visibility::Visible {
                        return Err(LapisError::conflict(
                            "the key was committed by a transaction outside the snapshot",
                        ));
                    }
                    previous = Some(upd.start_ts());
                }
                checked_below = true;
                break;
            }
            if !own {
                return Err(LapisError::conflict("the transaction's update is no longer in the chain"));
            }
            if !checked_below {
                if let Some(cell) = op.entry.ondisk() {
                    if txn.isolation == IsolationLevel::Snapshot && !ctx.tw_start_visible(&cell.tw) {
                        return Err(LapisError::conflict(
                            "the key was committed by a transaction outside the snapshot",
                        ));
                    }
                    previous = Some(cell.tw.start_ts);
                }
            }
            if let Some(prev) = previous {
                if ts != TS_NONE && ts < prev {
                    return Err(LapisError::invalid(format!(
                        "timestamp {} is older than the committed version it replaces at {}",
                        ts_hex(ts),
                        ts_hex(prev)
                    )));
                }
            }
        }
        Ok(())
    }

    fn log_commit(&self, txn: &Transaction, commit_ts: Timestamp, durable_ts: Timestamp) -> Result<()> {
        if !self.engine.wal.is_enabled() {
            return Ok(());
        }
        let ops: Vec<LogOp> = txn
            .ops
            .iter()
            .filter(|op| self.engine.is_logged_table(op.table))
            .map(|op| LogOp {
                table: op.table,
                key: op.key.clone(),
                value: op.update.value.clone(),
            })
            .collect();
        if ops.is_empty() {
            return Ok(());
        }
        let record = LogRecord {
            lsn: 0,
            txn_id: txn.id(),
            commit_ts,
            durable_ts,
            ops,
        };
        self.engine.wal.append(&record)?;
        // The record may already be durable, so a failed flush cannot be
        // rolled back.
        self.engine
            .wal
            .flush_commit()
            .map_err(|e| self.engine.panic(format!("commit log flush failed: {}", e)))
    }

    // ------------------------------------------------------------------
    // Data operations
    // ------------------------------------------------------------------

    /// Value of `key` visible to this session.
    pub fn get(&mut self, table: &str, key: &[u8]) -> Result<Option<Value>> {
        self.engine.check_panic()?;
        let table = self.engine.table_by_name(table)?;
        let result = match self.txn.as_mut() {
            Some(txn) => {
                if txn.isolation == IsolationLevel::ReadCommitted {
                    txn.snapshot = Some(self.engine.global.snapshot(txn.id()));
                }
                let ctx = self.engine.txn_context(txn);
                self.engine.read(&table, key, &ctx)
            }
            None => {
                let ctx = ReadContext::committed(&self.engine.global, None);
                self.engine.read(&table, key, &ctx)
            }
        };
        if matches!(result, Err(LapisError::PreparedConflict)) {
            Stats::incr(&self.engine.stats.prepared_conflict);
        }
        result
    }

    pub fn insert(&mut self, table: &str, key: &[u8], value: &[u8]) -> Result<()> {
        self.write(table, key, WriteOp::Insert(value.to_vec()))
    }

    /// Delete `key`. `NotFound` if no visible version exists.
    pub fn remove(&mut self, table: &str, key: &[u8]) -> Result<()> {
        self.write(table, key, WriteOp::Remove)
    }

    /// Apply a partial update to the visible value of `key`.
    pub fn modify(&mut self, table: &str, key: &[u8], modify: Modify) -> Result<()> {
        modify.validate()?;
        self.write(table, key, WriteOp::Modify(modify))
    }

    fn write(&mut self, table: &str, key: &[u8], op: WriteOp) -> Result<()> {
        self.engine.check_panic()?;
        let table = self.engine.table_by_name(table)?;
        if self.txn.is_some() {
            let engine = Arc::clone(&self.engine);
            let txn = self
                .txn
                .as_mut()
                .ok_or_else(|| LapisError::invalid("no transaction is running"))?;
            if txn.isolation == IsolationLevel::ReadCommitted {
                txn.snapshot = Some(engine.global.snapshot(txn.id()));
            }
            let result = engine.write(txn, &table, key, op);
            if matches!(result, Err(LapisError::PreparedConflict)) {
                Stats::incr(&engine.stats.prepared_conflict);
                txn.doom("write conflicted with a prepared transaction");
            }
            return result;
        }

        self.begin(&BeginConfig::default())?;
        let engine = Arc::clone(&self.engine);
        let written = match self.txn.as_mut() {
            Some(txn) => engine.write(txn, &table, key, op),
            None => Err(LapisError::invalid("no transaction is running")),
        };
        match written {
            Ok(()) => self.commit(&CommitConfig::default()),
            Err(e) => {
                if matches!(e, LapisError::PreparedConflict) {
                    Stats::incr(&engine.stats.prepared_conflict);
                }
                self.rollback()?;
                Err(e)
            }
        }
    }
}

impl Drop for Session {
    fn drop(&mut self) {
        if let Some(txn) = self.txn.take() {
            self.abort(txn);
        }
    }
}

impl std::fmt::Debug for Session {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Session")
            .field("txn", &self.txn_id())
            .finish()
    }
}
