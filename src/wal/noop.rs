//! No-Op WAL Implementation
//!
//! Used when logging is off: tables are never logged and recovery relies
//! on checkpoints plus rollback-to-stable alone.

use super::{LogRecord, Lsn, WriteAheadLog};
use std::io::Result;
use std::sync::atomic::{AtomicU64, Ordering};

/// A WAL that does nothing (null object pattern)
pub struct NoOpWAL {
    lsn: AtomicU64,
}

impl NoOpWAL {
    pub fn new() -> Self {
        Self {
            lsn: AtomicU64::new(0),
        }
    }
}

impl Default for NoOpWAL {
    fn default() -> Self {
        Self::new()
    }
}

impl WriteAheadLog for NoOpWAL {
    fn append(&self, _record: &LogRecord) -> Result<Lsn> {
        Ok(self.lsn.fetch_add(1, Ordering::Relaxed))
    }

    fn sync(&self) -> Result<()> {
        Ok(())
    }

    fn replay_from(&self, _lsn: Lsn) -> Result<Vec<LogRecord>> {
        Ok(vec![])
    }

    fn truncate_before(&self, _lsn: Lsn) -> Result<()> {
        Ok(())
    }

    fn size_bytes(&self) -> u64 {
        0
    }

    fn current_lsn(&self) -> Lsn {
        self.lsn.load(Ordering::Relaxed)
    }

    fn is_enabled(&self) -> bool {
        false
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_noop_wal() {
        let wal = NoOpWAL::new();
        let record = LogRecord {
            lsn: 0,
            txn_id: 5,
            commit_ts: 10,
            durable_ts: 10,
            ops: vec![],
        };

        assert_eq!(wal.append(&record).unwrap(), 0);
        assert_eq!(wal.append(&record).unwrap(), 1);
        assert_eq!(wal.current_lsn(), 2);
        assert!(wal.replay_from(0).unwrap().is_empty());
        assert!(!wal.is_enabled());
    }
}
