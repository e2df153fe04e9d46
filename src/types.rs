//! Core scalar types shared by every layer of the engine.

use serde::{Deserialize, Serialize};
use std::fmt;

/// Logical, wall-clock-free timestamp. Zero means "not assigned".
pub type Timestamp = u64;

/// Transaction identifier, allocated monotonically and never reused.
pub type TxnId = u64;

/// Identifier of a user table. The history store is not a user table.
pub type TableId = u32;

/// Owned user key / value bytes.
pub type Key = Vec<u8>;
pub type Value = Vec<u8>;

pub const TS_NONE: Timestamp = 0;
pub const TS_MAX: Timestamp = u64::MAX;

pub const TXN_NONE: TxnId = 0;
pub const TXN_MAX: TxnId = u64::MAX - 1;
/// Sentinel stored in an update's txn id once its writer aborted.
pub const TXN_ABORTED: TxnId = u64::MAX;

/// Render a timestamp the way timestamps are written in config strings.
pub fn ts_hex(ts: Timestamp) -> String {
    if ts == TS_MAX {
        "max".to_string()
    } else {
        format!("{:x}", ts)
    }
}

/// Validity window of a materialized version: when it became visible and,
/// if it was superseded, when it stopped being visible.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct TimeWindow {
    pub start_ts: Timestamp,
    pub durable_start_ts: Timestamp,
    pub start_txn: TxnId,
    pub stop_ts: Timestamp,
    pub durable_stop_ts: Timestamp,
    pub stop_txn: TxnId,
}

impl TimeWindow {
    pub fn new(start_ts: Timestamp, durable_start_ts: Timestamp, start_txn: TxnId) -> Self {
        Self {
            start_ts,
            durable_start_ts,
            start_txn,
            stop_ts: TS_MAX,
            durable_stop_ts: TS_NONE,
            stop_txn: TXN_MAX,
        }
    }

    /// True if a newer version (or tombstone) ended this one.
    #[inline]
    pub fn has_stop(&self) -> bool {
        self.stop_ts != TS_MAX || self.stop_txn != TXN_MAX
    }

    pub fn set_stop(&mut self, stop_ts: Timestamp, durable_stop_ts: Timestamp, stop_txn: TxnId) {
        self.stop_ts = stop_ts;
        self.durable_stop_ts = durable_stop_ts;
        self.stop_txn = stop_txn;
    }

    pub fn clear_stop(&mut self) {
        self.stop_ts = TS_MAX;
        self.durable_stop_ts = TS_NONE;
        self.stop_txn = TXN_MAX;
    }

    /// Largest durable timestamp carried by the window.
    pub fn max_durable_ts(&self) -> Timestamp {
        if self.has_stop() {
            self.durable_start_ts.max(self.durable_stop_ts)
        } else {
            self.durable_start_ts
        }
    }
}

impl Default for TimeWindow {
    fn default() -> Self {
        Self::new(TS_NONE, TS_NONE, TXN_NONE)
    }
}

impl fmt::Display for TimeWindow {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "start: {}/{}/{} stop: {}/{}/{}",
            ts_hex(self.start_ts),
            ts_hex(self.durable_start_ts),
            self.start_txn,
            ts_hex(self.stop_ts),
            ts_hex(self.durable_stop_ts),
            self.stop_txn
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_time_window_stop() {
        let mut tw = TimeWindow::new(10, 10, 3);
        assert!(!tw.has_stop());
        assert_eq!(tw.max_durable_ts(), 10);

        tw.set_stop(20, 25, 4);
        assert!(tw.has_stop());
        assert_eq!(tw.max_durable_ts(), 25);

        tw.clear_stop();
        assert!(!tw.has_stop());
    }

    #[test]
    fn test_ts_hex() {
        assert_eq!(ts_hex(0x1f), "1f");
        assert_eq!(ts_hex(TS_MAX), "max");
    }
}
