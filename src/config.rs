//! Engine and per-call configuration.
//!
//! Every config is a plain struct with `Default` and chainable setters. The
//! per-call configs also accept the classic `key=value,key=value` string form
//! where timestamps are hexadecimal:
//!
//! ```ignore
//! use lapis::config::{BeginConfig, CheckpointConfig};
//!
//! let begin = BeginConfig::parse("isolation=snapshot,read_timestamp=1e")?;
//! let ckpt = CheckpointConfig::default().name("nightly").use_timestamp(true);
//! ```

use crate::error::{LapisError, Result};
use crate::txn::IsolationLevel;
use crate::types::Timestamp;
use crate::wal::WalConfig;
use serde::{Deserialize, Serialize};
use std::path::Path;

// ============================================================================
// Config strings
// ============================================================================

/// Split a `key=value,...` string into pairs. Parenthesized values are kept
/// whole (`drop=(a,b)`, `log=(enabled=true)`); a bare key yields `"true"`.
pub fn parse_pairs(input: &str) -> Result<Vec<(String, String)>> {
    let mut pairs = Vec::new();
    let mut depth = 0usize;
    let mut start = 0usize;
    let bytes = input.as_bytes();
    let mut items = Vec::new();

    for (i, &b) in bytes.iter().enumerate() {
        match b {
            b'(' => depth += 1,
            b')' => {
                depth = depth
                    .checked_sub(1)
                    .ok_or_else(|| LapisError::invalid(format!("unbalanced ')' in \"{}\"", input)))?;
            }
            b',' if depth == 0 => {
                items.push(&input[start..i]);
                start = i + 1;
            }
            _ => {}
        }
    }
    if depth != 0 {
        return Err(LapisError::invalid(format!("unbalanced '(' in \"{}\"", input)));
    }
    items.push(&input[start..]);

    for item in items {
        let item = item.trim();
        if item.is_empty() {
            continue;
        }
        match item.split_once('=') {
            Some((k, v)) => pairs.push((k.trim().to_string(), v.trim().to_string())),
            None => pairs.push((item.to_string(), "true".to_string())),
        }
    }
    Ok(pairs)
}

/// Parse a hexadecimal timestamp value.
pub fn parse_ts(key: &str, value: &str) -> Result<Timestamp> {
    Timestamp::from_str_radix(value.trim_start_matches("0x"), 16)
        .map_err(|_| LapisError::invalid(format!("{}: illegal timestamp \"{}\"", key, value)))
}

pub fn parse_bool(key: &str, value: &str) -> Result<bool> {
    match value {
        "true" | "1" | "on" => Ok(true),
        "false" | "0" | "off" => Ok(false),
        _ => Err(LapisError::invalid(format!("{}: expected boolean, got \"{}\"", key, value))),
    }
}

/// Strip one level of parentheses: `(a,b)` becomes `a,b`.
fn unwrap_parens(value: &str) -> &str {
    value
        .strip_prefix('(')
        .and_then(|v| v.strip_suffix(')'))
        .unwrap_or(value)
}

fn unknown_key(key: &str) -> LapisError {
    LapisError::invalid(format!("unknown configuration key \"{}\"", key))
}

// ============================================================================
// Engine configuration
// ============================================================================

/// Engine-wide configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    /// Cache size in bytes
    pub cache_size: usize,
    /// Eviction starts when total cache use crosses this percentage
    pub eviction_target: u8,
    /// Application threads assist eviction above this percentage
    pub eviction_trigger: u8,
    pub eviction_dirty_target: u8,
    pub eviction_dirty_trigger: u8,
    pub eviction_updates_target: u8,
    pub eviction_updates_trigger: u8,
    /// Background eviction worker count (0 disables the eviction server)
    pub eviction_threads: usize,
    /// Let committing threads evict when the cache is over its trigger
    pub app_assist: bool,
    /// Keep residual in-memory chains for uncommitted keys instead of
    /// refusing eviction. Off means pages are always fully offloaded.
    pub update_restore: bool,
    /// Rows per in-memory page before it splits
    pub max_page_rows: usize,
    /// Rows a history store leaf holds before it splits
    pub hs_page_entries: usize,
    /// Background checkpoint period (0 disables)
    pub checkpoint_interval_ms: u64,
    /// Background history store cleanup period (0 disables)
    pub hs_cleanup_interval_ms: u64,
    /// Bound on waiting for a concurrent checkpoint
    pub checkpoint_wait_ms: u64,
    /// Initial block file size in MB for on-disk engines
    pub block_file_mb: usize,
    pub wal: WalConfig,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            cache_size: 64 * 1024 * 1024,
            eviction_target: 80,
            eviction_trigger: 95,
            eviction_dirty_target: 5,
            eviction_dirty_trigger: 20,
            eviction_updates_target: 3,
            eviction_updates_trigger: 10,
            eviction_threads: 1,
            app_assist: true,
            update_restore: false,
            max_page_rows: 256,
            hs_page_entries: 512,
            checkpoint_interval_ms: 0,
            hs_cleanup_interval_ms: 1000,
            checkpoint_wait_ms: 5000,
            block_file_mb: 4,
            wal: WalConfig::default(),
        }
    }
}

impl EngineConfig {
    pub fn new() -> Self {
        Self::default()
    }

    /// Load from a JSON file. Missing fields take their defaults.
    pub fn from_json_file(path: impl AsRef<Path>) -> Result<Self> {
        let text = std::fs::read_to_string(path)?;
        let config: EngineConfig = serde_json::from_str(&text)?;
        config.validate()?;
        Ok(config)
    }

    pub fn cache_size(mut self, bytes: usize) -> Self {
        self.cache_size = bytes;
        self
    }

    pub fn eviction_threads(mut self, n: usize) -> Self {
        self.eviction_threads = n;
        self
    }

    pub fn eviction(mut self, target: u8, trigger: u8) -> Self {
        self.eviction_target = target;
        self.eviction_trigger = trigger;
        self
    }

    pub fn eviction_dirty(mut self, target: u8, trigger: u8) -> Self {
        self.eviction_dirty_target = target;
        self.eviction_dirty_trigger = trigger;
        self
    }

    pub fn eviction_updates(mut self, target: u8, trigger: u8) -> Self {
        self.eviction_updates_target = target;
        self.eviction_updates_trigger = trigger;
        self
    }

    pub fn app_assist(mut self, on: bool) -> Self {
        self.app_assist = on;
        self
    }

    pub fn update_restore(mut self, on: bool) -> Self {
        self.update_restore = on;
        self
    }

    pub fn max_page_rows(mut self, rows: usize) -> Self {
        self.max_page_rows = rows;
        self
    }

    pub fn hs_page_entries(mut self, n: usize) -> Self {
        self.hs_page_entries = n;
        self
    }

    pub fn checkpoint_interval_ms(mut self, ms: u64) -> Self {
        self.checkpoint_interval_ms = ms;
        self
    }

    pub fn hs_cleanup_interval_ms(mut self, ms: u64) -> Self {
        self.hs_cleanup_interval_ms = ms;
        self
    }

    pub fn checkpoint_wait_ms(mut self, ms: u64) -> Self {
        self.checkpoint_wait_ms = ms;
        self
    }

    pub fn block_file_mb(mut self, mb: usize) -> Self {
        self.block_file_mb = mb;
        self
    }

    pub fn wal(mut self, wal: WalConfig) -> Self {
        self.wal = wal;
        self
    }

    /// Reject settings the eviction machinery cannot honour.
    pub fn validate(&self) -> Result<()> {
        let pairs = [
            ("eviction", self.eviction_target, self.eviction_trigger),
            ("eviction_dirty", self.eviction_dirty_target, self.eviction_dirty_trigger),
            ("eviction_updates", self.eviction_updates_target, self.eviction_updates_trigger),
        ];
        for (name, target, trigger) in pairs {
            if target == 0 || trigger > 100 || target > trigger {
                return Err(LapisError::invalid(format!(
                    "{}: target {} must be in 1..=trigger and trigger {} <= 100",
                    name, target, trigger
                )));
            }
        }
        if self.max_page_rows < 2 {
            return Err(LapisError::invalid("max_page_rows must be at least 2"));
        }
        if self.hs_page_entries == 0 {
            return Err(LapisError::invalid("hs_page_entries must be positive"));
        }
        if self.cache_size < 1024 * 1024 {
            return Err(LapisError::invalid("cache_size must be at least 1MB"));
        }
        Ok(())
    }
}

// ============================================================================
// Table configuration
// ============================================================================

/// Per-table configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct TableConfig {
    /// Commits to this table are written to the WAL and recovered by replay
    pub logged: bool,
}

impl TableConfig {
    pub fn logged(mut self, on: bool) -> Self {
        self.logged = on;
        self
    }

    /// Parse `log=(enabled=true)`.
    pub fn parse(input: &str) -> Result<Self> {
        let mut config = Self::default();
        for (key, value) in parse_pairs(input)? {
            match key.as_str() {
                "log" => {
                    for (k, v) in parse_pairs(unwrap_parens(&value))? {
                        match k.as_str() {
                            "enabled" => config.logged = parse_bool("log.enabled", &v)?,
                            _ => return Err(unknown_key(&format!("log.{}", k))),
                        }
                    }
                }
                _ => return Err(unknown_key(&key)),
            }
        }
        Ok(config)
    }
}

// ============================================================================
// Transaction configuration
// ============================================================================

/// Configuration for `begin_transaction`.
#[derive(Debug, Clone, Default)]
pub struct BeginConfig {
    pub isolation: IsolationLevel,
    pub read_timestamp: Option<Timestamp>,
    /// Silently raise a read timestamp older than oldest up to oldest
    pub round_to_oldest: bool,
}

impl BeginConfig {
    pub fn isolation(mut self, level: IsolationLevel) -> Self {
        self.isolation = level;
        self
    }

    pub fn read_timestamp(mut self, ts: Timestamp) -> Self {
        self.read_timestamp = Some(ts);
        self
    }

    pub fn round_to_oldest(mut self, on: bool) -> Self {
        self.round_to_oldest = on;
        self
    }

    pub fn parse(input: &str) -> Result<Self> {
        let mut config = Self::default();
        for (key, value) in parse_pairs(input)? {
            match key.as_str() {
                "isolation" => config.isolation = IsolationLevel::from_str(&value)?,
                "read_timestamp" => config.read_timestamp = Some(parse_ts(&key, &value)?),
                "round_to_oldest" => config.round_to_oldest = parse_bool(&key, &value)?,
                "roundup_timestamps" => {
                    for (k, v) in parse_pairs(unwrap_parens(&value))? {
                        match k.as_str() {
                            "read" => config.round_to_oldest = parse_bool("roundup_timestamps.read", &v)?,
                            "prepared" => {}
                            _ => return Err(unknown_key(&format!("roundup_timestamps.{}", k))),
                        }
                    }
                }
                _ => return Err(unknown_key(&key)),
            }
        }
        Ok(config)
    }
}

/// Configuration for `commit_transaction`.
#[derive(Debug, Clone, Default)]
pub struct CommitConfig {
    pub commit_timestamp: Option<Timestamp>,
    pub durable_timestamp: Option<Timestamp>,
}

impl CommitConfig {
    pub fn commit_timestamp(mut self, ts: Timestamp) -> Self {
        self.commit_timestamp = Some(ts);
        self
    }

    pub fn durable_timestamp(mut self, ts: Timestamp) -> Self {
        self.durable_timestamp = Some(ts);
        self
    }

    pub fn parse(input: &str) -> Result<Self> {
        let mut config = Self::default();
        for (key, value) in parse_pairs(input)? {
            match key.as_str() {
                "commit_timestamp" => config.commit_timestamp = Some(parse_ts(&key, &value)?),
                "durable_timestamp" => config.durable_timestamp = Some(parse_ts(&key, &value)?),
                _ => return Err(unknown_key(&key)),
            }
        }
        Ok(config)
    }
}

/// Timestamps settable either globally (`oldest`, `stable`) or on a running
/// transaction (`commit`, `durable`, `read`, `prepare`).
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TimestampConfig {
    pub oldest_timestamp: Option<Timestamp>,
    pub stable_timestamp: Option<Timestamp>,
    pub commit_timestamp: Option<Timestamp>,
    pub durable_timestamp: Option<Timestamp>,
    pub read_timestamp: Option<Timestamp>,
    pub prepare_timestamp: Option<Timestamp>,
}

impl TimestampConfig {
    pub fn oldest(mut self, ts: Timestamp) -> Self {
        self.oldest_timestamp = Some(ts);
        self
    }

    pub fn stable(mut self, ts: Timestamp) -> Self {
        self.stable_timestamp = Some(ts);
        self
    }

    pub fn commit(mut self, ts: Timestamp) -> Self {
        self.commit_timestamp = Some(ts);
        self
    }

    pub fn durable(mut self, ts: Timestamp) -> Self {
        self.durable_timestamp = Some(ts);
        self
    }

    pub fn read(mut self, ts: Timestamp) -> Self {
        self.read_timestamp = Some(ts);
        self
    }

    pub fn prepare(mut self, ts: Timestamp) -> Self {
        self.prepare_timestamp = Some(ts);
        self
    }

    pub fn parse(input: &str) -> Result<Self> {
        let mut config = Self::default();
        for (key, value) in parse_pairs(input)? {
            let ts = parse_ts(&key, &value)?;
            match key.as_str() {
                "oldest_timestamp" => config.oldest_timestamp = Some(ts),
                "stable_timestamp" => config.stable_timestamp = Some(ts),
                "commit_timestamp" => config.commit_timestamp = Some(ts),
                "durable_timestamp" => config.durable_timestamp = Some(ts),
                "read_timestamp" => config.read_timestamp = Some(ts),
                "prepare_timestamp" => config.prepare_timestamp = Some(ts),
                _ => return Err(unknown_key(&key)),
            }
        }
        Ok(config)
    }

    pub fn has_global(&self) -> bool {
        self.oldest_timestamp.is_some() || self.stable_timestamp.is_some()
    }

    pub fn has_txn(&self) -> bool {
        self.commit_timestamp.is_some()
            || self.durable_timestamp.is_some()
            || self.read_timestamp.is_some()
            || self.prepare_timestamp.is_some()
    }
}

// ============================================================================
// Checkpoint / RTS configuration
// ============================================================================

/// Configuration for `checkpoint`.
#[derive(Debug, Clone)]
pub struct CheckpointConfig {
    /// Named checkpoint to create or replace; `None` is the default checkpoint
    pub name: Option<String>,
    /// Checkpoint as of the stable timestamp
    pub use_timestamp: bool,
    /// Named checkpoints to drop
    pub drop: Vec<String>,
}

impl Default for CheckpointConfig {
    fn default() -> Self {
        Self {
            name: None,
            use_timestamp: true,
            drop: Vec::new(),
        }
    }
}

impl CheckpointConfig {
    pub fn name(mut self, name: impl Into<String>) -> Self {
        self.name = Some(name.into());
        self
    }

    pub fn use_timestamp(mut self, on: bool) -> Self {
        self.use_timestamp = on;
        self
    }

    pub fn drop_checkpoint(mut self, name: impl Into<String>) -> Self {
        self.drop.push(name.into());
        self
    }

    pub fn parse(input: &str) -> Result<Self> {
        let mut config = Self::default();
        for (key, value) in parse_pairs(input)? {
            match key.as_str() {
                "name" => config.name = Some(value),
                "use_timestamp" => config.use_timestamp = parse_bool(&key, &value)?,
                "drop" => {
                    config.drop = unwrap_parens(&value)
                        .split(',')
                        .map(str::trim)
                        .filter(|s| !s.is_empty())
                        .map(String::from)
                        .collect()
                }
                _ => return Err(unknown_key(&key)),
            }
        }
        Ok(config)
    }
}

/// Configuration for `rollback_to_stable`.
#[derive(Debug, Clone, Default)]
pub struct RtsConfig {
    /// Decide and report without changing anything
    pub dryrun: bool,
}

impl RtsConfig {
    pub fn dryrun(mut self, on: bool) -> Self {
        self.dryrun = on;
        self
    }

    pub fn parse(input: &str) -> Result<Self> {
        let mut config = Self::default();
        for (key, value) in parse_pairs(input)? {
            match key.as_str() {
                "dryrun" => config.dryrun = parse_bool(&key, &value)?,
                _ => return Err(unknown_key(&key)),
            }
        }
        Ok(config)
    }
}
