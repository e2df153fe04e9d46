//! Transaction Table Module (MVCC)
//!
//! Process-wide registry of running transactions plus the global timestamp
//! watermarks (oldest, stable, pinned, recovery). Everything else in the
//! engine consults it to decide what a reader may see and what history must
//! be retained.
//!
//! # Example
//! ```ignore
//! use lapis::txn::{IsolationLevel, TxnGlobal};
//!
//! let global = TxnGlobal::new();
//! let shared = global.begin(IsolationLevel::Snapshot, 0);
//! let snapshot = global.snapshot(shared.id);
//! ```

mod global;
mod snapshot;
mod timestamp;
mod transaction;

pub use global::{CheckpointPin, TxnGlobal};
pub use snapshot::Snapshot;
pub use timestamp::{validate_commit, validate_prepare, validate_read, TimestampQuery};
pub use transaction::{PrepareState, Transaction, TxnOp, TxnShared, TxnState};

use crate::error::{LapisError, Result};

/// Isolation level for transactions
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum IsolationLevel {
    /// See uncommitted updates of other transactions
    ReadUncommitted,
    /// See whatever is committed when each operation starts
    ReadCommitted,
    /// See a snapshot taken when the transaction starts (default)
    #[default]
    Snapshot,
}

impl IsolationLevel {
    /// Parse from string (case-insensitive)
    pub fn from_str(s: &str) -> Result<Self> {
        match s.to_lowercase().as_str() {
            "read-uncommitted" | "read_uncommitted" => Ok(IsolationLevel::ReadUncommitted),
            "read-committed" | "read_committed" => Ok(IsolationLevel::ReadCommitted),
            "snapshot" => Ok(IsolationLevel::Snapshot),
            other => Err(LapisError::invalid(format!("unknown isolation level \"{}\"", other))),
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            IsolationLevel::ReadUncommitted => "read-uncommitted",
            IsolationLevel::ReadCommitted => "read-committed",
            IsolationLevel::Snapshot => "snapshot",
        }
    }
}
