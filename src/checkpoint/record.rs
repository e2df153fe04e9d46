//! Checkpoint records and the metadata blob listing them.
//!
//! Metadata layout: `[magic u32][crc32 u32][len u32][bincode payload]`.
//! The block manager replaces it atomically, so a crash leaves either the
//! previous list or the new one.

use crate::block::{decode, encode, BlockAddr};
use crate::config::TableConfig;
use crate::error::{LapisError, Result};
use crate::txn::Snapshot;
use crate::types::{TableId, Timestamp, TxnId};
use crate::wal::Lsn;
use serde::{Deserialize, Serialize};

const META_MAGIC: u32 = 0x4C41_5043; // "LAPC"
const META_HEADER: usize = 12;

/// One completed checkpoint.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CheckpointRecord {
    /// `None` for the default checkpoint recovery starts from
    pub name: Option<String>,
    pub generation: u64,
    /// Read timestamp the checkpoint was taken at; `TS_NONE` if it ignored
    /// timestamps
    pub checkpoint_ts: Timestamp,
    pub oldest_ts: Timestamp,
    pub stable_ts: Timestamp,
    /// Transactions whose writes the checkpoint includes
    pub snapshot: Snapshot,
    /// Root block of every table
    pub tables: Vec<(TableId, BlockAddr)>,
    /// Block listing the history store pages
    pub hs_root: Option<BlockAddr>,
    /// Every block the checkpoint references
    pub blocks: Vec<BlockAddr>,
    /// Log records at or after this LSN are not in the checkpoint
    pub wal_lsn: Lsn,
}

impl CheckpointRecord {
    pub fn display_name(&self) -> &str {
        self.name.as_deref().unwrap_or("default")
    }

    pub fn root_of(&self, table: TableId) -> Option<BlockAddr> {
        self.tables.iter().find(|(id, _)| *id == table).map(|(_, addr)| *addr)
    }
}

/// Catalog entry for a table.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TableEntry {
    pub id: TableId,
    pub name: String,
    pub config: TableConfig,
}

/// Everything persisted outside of page blocks.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct CheckpointMeta {
    pub generation: u64,
    pub records: Vec<CheckpointRecord>,
    pub tables: Vec<TableEntry>,
    pub next_txn_id: TxnId,
    pub next_table_id: TableId,
}

impl CheckpointMeta {
    pub fn encode(&self) -> Result<Vec<u8>> {
        let payload = encode(self)?;
        let mut out = Vec::with_capacity(META_HEADER + payload.len());
        out.extend_from_slice(&META_MAGIC.to_le_bytes());
        out.extend_from_slice(&crc32fast::hash(&payload).to_le_bytes());
        out.extend_from_slice(&(payload.len() as u32).to_le_bytes());
        out.extend_from_slice(&payload);
        Ok(out)
    }

    pub fn decode(data: &[u8]) -> Result<Self> {
        if data.len() < META_HEADER {
            return Err(LapisError::Corruption("checkpoint metadata truncated".into()));
        }
        let word = |at: usize| u32::from_le_bytes([data[at], data[at + 1], data[at + 2], data[at + 3]]);
        if word(0) != META_MAGIC {
            return Err(LapisError::Corruption("checkpoint metadata has a bad magic number".into()));
        }
        let crc = word(4);
        let len = word(8) as usize;
        let payload = data
            .get(META_HEADER..META_HEADER + len)
            .ok_or_else(|| LapisError::Corruption("checkpoint metadata truncated".into()))?;
        if crc32fast::hash(payload) != crc {
            return Err(LapisError::Corruption("checkpoint metadata failed checksum".into()));
        }
        decode(payload)
    }

    pub fn record(&self, name: Option<&str>) -> Option<&CheckpointRecord> {
        self.records.iter().find(|r| r.name.as_deref() == name)
    }

    /// Replace any record of the same name.
    pub fn put(&mut self, record: CheckpointRecord) {
        self.records.retain(|r| r.name != record.name);
        self.records.push(record);
    }

    /// Remove a named checkpoint. Returns whether it existed.
    pub fn remove(&mut self, name: &str) -> bool {
        let before = self.records.len();
        self.records.retain(|r| r.name.as_deref() != Some(name));
        self.records.len() != before
    }

    /// Blocks referenced by any record.
    pub fn referenced_blocks(&self) -> impl Iterator<Item = &BlockAddr> {
        self.records.iter().flat_map(|r| r.blocks.iter())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn record(name: Option<&str>, generation: u64) -> CheckpointRecord {
        CheckpointRecord {
            name: name.map(String::from),
            generation,
            checkpoint_ts: 10,
            oldest_ts: 1,
            stable_ts: 10,
            snapshot: Snapshot::new(5, vec![3]),
            tables: vec![(1, BlockAddr { offset: 0, size: 8, checksum: 1 })],
            hs_root: None,
            blocks: vec![BlockAddr { offset: 0, size: 8, checksum: 1 }],
            wal_lsn: 0,
        }
    }

    #[test]
    fn test_meta_frame_detects_damage() {
        let mut meta = CheckpointMeta::default();
        meta.put(record(None, 1));
        let mut data = meta.encode().unwrap();
        let back = CheckpointMeta::decode(&data).unwrap();
        assert_eq!(back.records, meta.records);

        let last = data.len() - 1;
        data[last] ^= 0xff;
        assert!(matches!(CheckpointMeta::decode(&data), Err(LapisError::Corruption(_))));
        assert!(CheckpointMeta::decode(&data[..4]).is_err());
    }

    #[test]
    fn test_put_replaces_same_name() {
        let mut meta = CheckpointMeta::default();
        meta.put(record(Some("a"), 1));
        meta.put(record(None, 1));
        meta.put(record(Some("a"), 2));
        assert_eq!(meta.records.len(), 2);
        assert_eq!(meta.record(Some("a")).unwrap().generation, 2);
        assert!(meta.remove("a"));
        assert!(!meta.remove("a"));
        assert!(meta.record(None).is_some());
    }
}
