//! Timestamp usage rules and queries.

use super::{Transaction, TxnGlobal};
use crate::error::{LapisError, Result};
use crate::types::{ts_hex, Timestamp, TS_NONE};

/// Global timestamps that can be queried.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TimestampQuery {
    AllDurable,
    Oldest,
    OldestReader,
    Pinned,
    Stable,
    Recovery,
    LastCheckpoint,
}

impl TimestampQuery {
    pub fn from_str(s: &str) -> Result<Self> {
        match s {
            "all_durable" => Ok(TimestampQuery::AllDurable),
            "oldest" | "oldest_timestamp" => Ok(TimestampQuery::Oldest),
            "oldest_reader" => Ok(TimestampQuery::OldestReader),
            "pinned" => Ok(TimestampQuery::Pinned),
            "stable" | "stable_timestamp" => Ok(TimestampQuery::Stable),
            "recovery" => Ok(TimestampQuery::Recovery),
            "last_checkpoint" => Ok(TimestampQuery::LastCheckpoint),
            other => Err(LapisError::invalid(format!("unknown timestamp query \"{}\"", other))),
        }
    }

    pub fn query(&self, global: &TxnGlobal) -> Timestamp {
        match self {
            TimestampQuery::AllDurable => global.all_durable_timestamp(),
            TimestampQuery::Oldest => global.oldest_timestamp(),
            TimestampQuery::OldestReader => global.oldest_reader_timestamp(),
            TimestampQuery::Pinned => global.pinned_timestamp(),
            TimestampQuery::Stable => global.stable_timestamp(),
            TimestampQuery::Recovery => global.recovery_timestamp(),
            TimestampQuery::LastCheckpoint => global.last_checkpoint_timestamp(),
        }
    }
}

/// Check a read timestamp against oldest, optionally rounding it up.
pub fn validate_read(global: &TxnGlobal, read_ts: Timestamp, round_to_oldest: bool) -> Result<Timestamp> {
    let oldest = global.oldest_timestamp();
    if read_ts == TS_NONE {
        return Err(LapisError::invalid("zero read timestamp"));
    }
    if oldest != TS_NONE && read_ts < oldest {
        if round_to_oldest {
            return Ok(oldest);
        }
        return Err(LapisError::invalid(format!(
            "read timestamp {} older than oldest timestamp {}",
            ts_hex(read_ts),
            ts_hex(oldest)
        )));
    }
    Ok(read_ts)
}

/// Check a prepare timestamp.
pub fn validate_prepare(global: &TxnGlobal, txn: &Transaction, prepare_ts: Timestamp) -> Result<()> {
    if prepare_ts == TS_NONE {
        return Err(LapisError::invalid("prepare timestamp is required"));
    }
    let stable = global.stable_timestamp();
    if stable != TS_NONE && prepare_ts <= stable {
        return Err(LapisError::invalid(format!(
            "prepare timestamp {} is not newer than the stable timestamp {}",
            ts_hex(prepare_ts),
            ts_hex(stable)
        )));
    }
    if txn.read_ts != TS_NONE && prepare_ts < txn.read_ts {
        return Err(LapisError::invalid(format!(
            "prepare timestamp {} is older than the read timestamp {}",
            ts_hex(prepare_ts),
            ts_hex(txn.read_ts)
        )));
    }
    Ok(())
}

/// Resolve and check commit/durable timestamps for a commit. Returns the
/// pair to stamp on the transaction's updates.
pub fn validate_commit(
    global: &TxnGlobal,
    txn: &Transaction,
    commit_ts: Timestamp,
    durable_ts: Timestamp,
) -> Result<(Timestamp, Timestamp)> {
    let stable = global.stable_timestamp();

    if txn.is_prepared() {
        if commit_ts == TS_NONE {
            return Err(LapisError::invalid("commit timestamp is required for a prepared transaction"));
        }
        if durable_ts == TS_NONE {
            return Err(LapisError::invalid("durable timestamp is required for a prepared transaction"));
        }
        if commit_ts < txn.prepare_ts {
            return Err(LapisError::invalid(format!(
                "commit timestamp {} is older than the prepare timestamp {}",
                ts_hex(commit_ts),
                ts_hex(txn.prepare_ts)
            )));
        }
        if durable_ts < commit_ts {
            return Err(LapisError::invalid(format!(
                "durable timestamp {} is older than the commit timestamp {}",
                ts_hex(durable_ts),
                ts_hex(commit_ts)
            )));
        }
        if stable != TS_NONE && durable_ts <= stable {
            return Err(LapisError::invalid(format!(
                "durable timestamp {} is not newer than the stable timestamp {}",
                ts_hex(durable_ts),
                ts_hex(stable)
            )));
        }
        return Ok((commit_ts, durable_ts));
    }

    if commit_ts == TS_NONE {
        if durable_ts != TS_NONE {
            return Err(LapisError::invalid("durable timestamp set without a commit timestamp"));
        }
        return Ok((TS_NONE, TS_NONE));
    }
    if stable != TS_NONE && commit_ts <= stable {
        return Err(LapisError::invalid(format!(
            "commit timestamp {} must be after the stable timestamp {}",
            ts_hex(commit_ts),
            ts_hex(stable)
        )));
    }
    if txn.read_ts != TS_NONE && commit_ts < txn.read_ts {
        return Err(LapisError::invalid(format!(
            "commit timestamp {} is older than the read timestamp {}",
            ts_hex(commit_ts),
            ts_hex(txn.read_ts)
        )));
    }
    let durable = if durable_ts == TS_NONE { commit_ts } else { durable_ts };
    if durable < commit_ts {
        return Err(LapisError::invalid(format!(
            "durable timestamp {} is older than the commit timestamp {}",
            ts_hex(durable),
            ts_hex(commit_ts)
        )));
    }
    Ok((commit_ts, durable))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::txn::{IsolationLevel, TxnState};

    fn txn(global: &TxnGlobal) -> Transaction {
        Transaction::new(global.begin(IsolationLevel::Snapshot, TS_NONE), IsolationLevel::Snapshot)
    }

    #[test]
    fn test_read_timestamp_rules() {
        let global = TxnGlobal::new();
        global.set_global(Some(10), Some(20)).unwrap();
        assert_eq!(validate_read(&global, 15, false).unwrap(), 15);
        assert!(validate_read(&global, 5, false).is_err());
        assert_eq!(validate_read(&global, 5, true).unwrap(), 10);
    }

    #[test]
    fn test_commit_after_stable() {
        let global = TxnGlobal::new();
        global.set_global(None, Some(20)).unwrap();
        let t = txn(&global);
        assert!(validate_commit(&global, &t, 20, TS_NONE).is_err());
        assert_eq!(validate_commit(&global, &t, 21, TS_NONE).unwrap(), (21, 21));
        assert_eq!(validate_commit(&global, &t, TS_NONE, TS_NONE).unwrap(), (0, 0));
        assert!(validate_commit(&global, &t, 25, 22).is_err());
    }

    #[test]
    fn test_prepared_commit_requires_durable() {
        let global = TxnGlobal::new();
        let mut t = txn(&global);
        t.prepare_ts = 30;
        t.shared.set_state(TxnState::Prepared);
        assert!(validate_commit(&global, &t, 35, TS_NONE).is_err());
        assert!(validate_commit(&global, &t, 25, 40).is_err());
        assert_eq!(validate_commit(&global, &t, 35, 40).unwrap(), (35, 40));
    }

    #[test]
    fn test_prepare_after_stable() {
        let global = TxnGlobal::new();
        global.set_global(None, Some(20)).unwrap();
        let t = txn(&global);
        assert!(validate_prepare(&global, &t, 20).is_err());
        assert!(validate_prepare(&global, &t, 21).is_ok());
    }

    #[test]
    fn test_query_parse() {
        assert_eq!(TimestampQuery::from_str("all_durable").unwrap(), TimestampQuery::AllDurable);
        assert!(TimestampQuery::from_str("bogus").is_err());
        let global = TxnGlobal::new();
        global.set_global(Some(3), Some(7)).unwrap();
        assert_eq!(TimestampQuery::Stable.query(&global), 7);
        assert_eq!(TimestampQuery::Oldest.query(&global), 3);
    }
}
