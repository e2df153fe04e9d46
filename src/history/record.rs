//! History store rows and the batches reconciliation builds.

use crate::block::BlockAddr;
use crate::mvcc::Modify;
use crate::types::{Key, TableId, Timestamp, TimeWindow, TxnId, Value};
use serde::{Deserialize, Serialize};

/// Row key: (table, user key, start timestamp, start txn).
///
/// Rows of one key sort oldest-first, so "newest at or before T" is a
/// reverse range scan. Equal timestamps order by txn id, which makes the
/// later writer win.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct HsKey {
    pub table: TableId,
    pub key: Key,
    pub start_ts: Timestamp,
    pub start_txn: TxnId,
}

impl HsKey {
    pub fn new(table: TableId, key: impl Into<Key>, start_ts: Timestamp, start_txn: TxnId) -> Self {
        Self {
            table,
            key: key.into(),
            start_ts,
            start_txn,
        }
    }

    /// Lowest possible row of `key`.
    pub fn first_of(table: TableId, key: &[u8]) -> Self {
        Self::new(table, key.to_vec(), 0, 0)
    }

    /// Highest possible row of `key`.
    pub fn last_of(table: TableId, key: &[u8]) -> Self {
        Self::new(table, key.to_vec(), Timestamp::MAX, TxnId::MAX)
    }

    pub fn same_key(&self, table: TableId, key: &[u8]) -> bool {
        self.table == table && self.key == key
    }
}

/// Stored payload. Deltas apply to the next-older row of the same key.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum HsValue {
    Full(Value),
    Delta(Modify),
}

impl HsValue {
    pub fn is_delta(&self) -> bool {
        matches!(self, HsValue::Delta(_))
    }

    pub fn mem_size(&self) -> usize {
        match self {
            HsValue::Full(v) => v.len(),
            HsValue::Delta(m) => m.mem_size(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HsRecord {
    /// Full validity window of the stored version
    pub tw: TimeWindow,
    pub value: HsValue,
}

/// Changes applied to the history store as one unit.
#[derive(Debug, Default)]
pub struct HsBatch {
    pub(crate) inserts: Vec<(HsKey, HsRecord)>,
    pub(crate) removes: Vec<HsKey>,
}

impl HsBatch {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, key: HsKey, record: HsRecord) {
        self.inserts.push((key, record));
    }

    pub fn remove(&mut self, key: HsKey) {
        self.removes.push(key);
    }

    pub fn is_empty(&self) -> bool {
        self.inserts.is_empty() && self.removes.is_empty()
    }

    pub fn len(&self) -> usize {
        self.inserts.len() + self.removes.len()
    }

    pub fn deltas(&self) -> usize {
        self.inserts.iter().filter(|(_, r)| r.value.is_delta()).count()
    }

    pub fn inserts(&self) -> impl Iterator<Item = &(HsKey, HsRecord)> {
        self.inserts.iter()
    }
}

/// One written leaf of history rows.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct HsPage {
    pub rows: Vec<(HsKey, HsRecord)>,
}

/// A leaf listed by a checkpoint's history root.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HsRootEntry {
    /// Lowest row the leaf can hold
    pub lower: HsKey,
    pub addr: BlockAddr,
    pub rows: u64,
}
