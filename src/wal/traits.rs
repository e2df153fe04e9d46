//! WAL Trait Definitions

use crate::mvcc::UpdateValue;
use crate::types::{Key, TableId, Timestamp, TxnId};
use serde::{Deserialize, Serialize};
use std::io::Result;

/// Log Sequence Number
pub type Lsn = u64;

/// One committed transaction's writes to logged tables.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LogRecord {
    pub lsn: Lsn,
    pub txn_id: TxnId,
    pub commit_ts: Timestamp,
    pub durable_ts: Timestamp,
    pub ops: Vec<LogOp>,
}

/// A single logged write.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LogOp {
    pub table: TableId,
    pub key: Key,
    pub value: UpdateValue,
}

/// Write-Ahead Log trait
///
/// Implementations:
/// - `NoOpWAL`: Does nothing (no table is logged)
/// - `DiskWAL`: Appends to disk with group commit
pub trait WriteAheadLog: Send + Sync {
    /// Append a single record, returns its LSN
    fn append(&self, record: &LogRecord) -> Result<Lsn>;

    /// Force fsync to disk
    fn sync(&self) -> Result<()>;

    /// Make a just-appended commit as durable as the WAL mode promises
    fn flush_commit(&self) -> Result<()> {
        Ok(())
    }

    /// Records with LSN at or after `lsn`, in order (for crash recovery)
    fn replay_from(&self, lsn: Lsn) -> Result<Vec<LogRecord>>;

    /// Drop records before `lsn` (after a checkpoint)
    fn truncate_before(&self, lsn: Lsn) -> Result<()>;

    /// Current WAL size in bytes
    fn size_bytes(&self) -> u64;

    /// LSN the next record will receive
    fn current_lsn(&self) -> Lsn;

    /// Whether WAL is enabled
    fn is_enabled(&self) -> bool;
}
