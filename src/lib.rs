// Lapis v0.1.0 - Timestamp-Ordered MVCC Storage Engine Core
// Update chains, history store, eviction, checkpoints, rollback-to-stable

pub mod types;
pub mod error;
pub mod config;
pub mod stats;
pub mod txn;
pub mod mvcc;
pub mod history;
pub mod btree;
pub mod block;
pub mod wal;
pub mod reconcile;
pub mod evict;
pub mod checkpoint;
pub mod rts;
pub mod engine;
pub mod session;
pub mod db;

// Re-export main types
pub use db::LapisDB;
pub use session::Session;
pub use error::{LapisError, Result};
pub use config::{BeginConfig, CheckpointConfig, CommitConfig, EngineConfig, RtsConfig, TableConfig, TimestampConfig};
pub use types::{Key, TableId, Timestamp, TxnId, Value, TS_MAX, TS_NONE};
pub use txn::{IsolationLevel, TimestampQuery};
pub use mvcc::{Modify, ModifyEntry};
pub use checkpoint::{CheckpointReader, CheckpointRecord};
pub use rts::{RtsChecker, RtsEvent, RtsReport};
pub use stats::StatsSnapshot;
pub use wal::{WalConfig, WalMode};
