//! Block Manager
//!
//! Stores page images as checksummed blocks and keeps one atomically
//! replaced metadata blob (the checkpoint list). Two implementations:
//!
//! - `MemBlockManager`: heap-backed; shared through `Arc` it survives a
//!   dropped engine, which is how tests simulate a crash
//! - `FileBlockManager`: a growable memory-mapped block file plus a
//!   metadata file replaced by rename

mod arena;
mod file;
mod memory;

pub use arena::BlockArena;
pub use file::FileBlockManager;
pub use memory::MemBlockManager;

use crate::error::{LapisError, Result};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;

/// Location of a written block.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct BlockAddr {
    pub offset: u64,
    pub size: u32,
    pub checksum: u32,
}

impl BlockAddr {
    pub fn verify(&self, data: &[u8]) -> Result<()> {
        let actual = crc32fast::hash(data);
        if actual != self.checksum || data.len() != self.size as usize {
            return Err(LapisError::Corruption(format!(
                "block at {} failed checksum (expected {:08x}, found {:08x})",
                self.offset, self.checksum, actual
            )));
        }
        Ok(())
    }
}

/// Block sizes are stored as `u32`; larger payloads are rejected.
pub fn block_size(len: usize) -> Result<u32> {
    u32::try_from(len).map_err(|_| LapisError::invalid(format!("block of {} bytes exceeds {} bytes", len, u32::MAX)))
}

/// Block storage used by reconciliation, checkpoints and page reads.
pub trait BlockManager: Send + Sync {
    /// Write a block, returning its address.
    fn write(&self, data: &[u8]) -> Result<BlockAddr>;

    /// Read a block, verifying its checksum.
    fn read(&self, addr: &BlockAddr) -> Result<Vec<u8>>;

    /// Release a block's space.
    fn free(&self, addr: &BlockAddr) -> Result<()>;

    /// Make every written block durable.
    fn sync(&self) -> Result<()>;

    /// Atomically replace the metadata blob.
    fn write_metadata(&self, data: &[u8]) -> Result<()>;

    fn read_metadata(&self) -> Result<Option<Vec<u8>>>;

    /// Release every block not in `keep`. Used at open to drop blocks written
    /// after the last checkpoint of a crashed run.
    fn reclaim(&self, keep: &HashSet<BlockAddr>) -> Result<usize>;

    /// Number of allocated blocks.
    fn live_blocks(&self) -> usize;
}

/// Encode a value as a block payload.
pub fn encode<T: Serialize>(value: &T) -> Result<Vec<u8>> {
    Ok(bincode::serialize(value)?)
}

pub fn decode<T: for<'de> Deserialize<'de>>(data: &[u8]) -> Result<T> {
    Ok(bincode::deserialize(data)?)
}
