//! Write-Ahead Log (WAL) Module
//!
//! Pluggable durability layer with runtime selection.
//! Similar to SQLite's journal modes (DELETE, WAL, MEMORY, OFF).
//!
//! Only tables created with `log=(enabled=true)` write to the log. Their
//! commits are replayed at open after the checkpoint is loaded, and
//! rollback-to-stable leaves them alone.
//!
//! # Example
//! ```ignore
//! use lapis::wal::{WalConfig, WalMode};
//!
//! // No logging: recovery is checkpoint + rollback-to-stable only
//! let wal = WalConfig::new(WalMode::Disabled).build(None)?;
//!
//! // Crash-safe mode (with fsync on every commit)
//! let wal = WalConfig::new(WalMode::Sync).path("./data/wal").build(None)?;
//! ```

mod disk;
mod noop;
mod traits;

pub use disk::{DiskWAL, DiskWalConfig};
pub use noop::NoOpWAL;
pub use traits::{LogOp, LogRecord, Lsn, WriteAheadLog};

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::sync::Arc;

/// WAL mode - selectable at runtime
///
/// Similar to SQLite's journal modes:
/// - `Disabled` = SQLite OFF (no log; logged tables behave as unlogged)
/// - `Async` = group commit, fsync in the background
/// - `Sync` = SQLite WAL (crash-safe, slower)
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum WalMode {
    /// No WAL (like SQLite OFF) - DEFAULT
    #[default]
    Disabled,

    /// Buffered records flushed by the group commit thread
    Async,

    /// Synchronous WAL with fsync on commit (like SQLite WAL)
    Sync,
}

impl WalMode {
    /// Parse from string (case-insensitive)
    pub fn from_str(s: &str) -> Self {
        match s.to_lowercase().as_str() {
            "off" | "disabled" | "none" | "noop" => WalMode::Disabled,
            "async" | "memory" | "buffered" => WalMode::Async,
            "sync" | "wal" | "durable" | "disk" => WalMode::Sync,
            _ => WalMode::default(),
        }
    }
}

/// WAL configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct WalConfig {
    /// WAL mode
    pub mode: WalMode,
    /// Group commit interval in milliseconds
    pub group_commit_ms: u64,
    /// Max batch size before force flush
    pub max_batch: usize,
    /// WAL directory; defaults to `<db dir>/wal`
    pub path: Option<PathBuf>,
}

impl Default for WalConfig {
    fn default() -> Self {
        Self {
            mode: WalMode::default(),
            group_commit_ms: 10,
            max_batch: 10_000,
            path: None,
        }
    }
}

impl WalConfig {
    /// Create config with specific mode
    pub fn new(mode: WalMode) -> Self {
        Self {
            mode,
            ..Default::default()
        }
    }

    /// Set WAL mode
    pub fn mode(mut self, mode: WalMode) -> Self {
        self.mode = mode;
        self
    }

    /// Set WAL path
    pub fn path(mut self, path: impl AsRef<Path>) -> Self {
        self.path = Some(path.as_ref().to_path_buf());
        self
    }

    /// Create the WAL. `default_dir` is used when no path is configured; a
    /// disk mode with neither falls back to no logging.
    pub fn build(&self, default_dir: Option<&Path>) -> std::io::Result<Arc<dyn WriteAheadLog>> {
        let dir = self.path.as_deref().or(default_dir);
        let sync_on_commit = match self.mode {
            WalMode::Disabled => return Ok(Arc::new(NoOpWAL::new())),
            WalMode::Async => false,
            WalMode::Sync => true,
        };
        match dir {
            Some(dir) => {
                let config = DiskWalConfig {
                    group_commit_ms: self.group_commit_ms,
                    max_batch: self.max_batch,
                    sync_on_commit,
                    ..Default::default()
                };
                Ok(Arc::new(DiskWAL::with_config(dir, config)?))
            }
            None => Ok(Arc::new(NoOpWAL::new())),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_mode_parse() {
        assert_eq!(WalMode::from_str("OFF"), WalMode::Disabled);
        assert_eq!(WalMode::from_str("buffered"), WalMode::Async);
        assert_eq!(WalMode::from_str("durable"), WalMode::Sync);
        assert_eq!(WalMode::from_str("???"), WalMode::Disabled);
    }

    #[test]
    fn test_build_selects_implementation() {
        let dir = tempfile::tempdir().unwrap();
        assert!(!WalConfig::new(WalMode::Disabled).build(Some(dir.path())).unwrap().is_enabled());
        assert!(WalConfig::new(WalMode::Sync).build(Some(dir.path())).unwrap().is_enabled());
        assert!(!WalConfig::new(WalMode::Async).build(None).unwrap().is_enabled());
    }
}
