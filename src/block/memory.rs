//! Heap-backed block manager.

use super::{block_size, BlockAddr, BlockManager};
use crate::error::{LapisError, Result};
use parking_lot::RwLock;
use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};

pub struct MemBlockManager {
    blocks: RwLock<HashMap<u64, Vec<u8>, ahash::RandomState>>,
    next: AtomicU64,
    metadata: RwLock<Option<Vec<u8>>>,
    /// Fault injection: every block write fails while set
    fail_writes: AtomicBool,
}

impl MemBlockManager {
    pub fn new() -> Self {
        Self {
            blocks: RwLock::new(HashMap::with_hasher(ahash::RandomState::new())),
            next: AtomicU64::new(1),
            metadata: RwLock::new(None),
            fail_writes: AtomicBool::new(false),
        }
    }

    pub fn set_fail_writes(&self, on: bool) {
        self.fail_writes.store(on, Ordering::Release);
    }
}

impl Default for MemBlockManager {
    fn default() -> Self {
        Self::new()
    }
}

impl BlockManager for MemBlockManager {
    fn write(&self, data: &[u8]) -> Result<BlockAddr> {
        if self.fail_writes.load(Ordering::Acquire) {
            return Err(LapisError::Io(std::io::Error::new(
                std::io::ErrorKind::Other,
                "injected block write failure",
            )));
        }
        let size = block_size(data.len())?;
        let offset = self.next.fetch_add(1, Ordering::AcqRel);
        let addr = BlockAddr {
            offset,
            size,
            checksum: crc32fast::hash(data),
        };
        self.blocks.write().insert(offset, data.to_vec());
        Ok(addr)
    }

    fn read(&self, addr: &BlockAddr) -> Result<Vec<u8>> {
        let data = self
            .blocks
            .read()
            .get(&addr.offset)
            .cloned()
            .ok_or_else(|| LapisError::Corruption(format!("block {} is not allocated", addr.offset)))?;
        addr.verify(&data)?;
        Ok(data)
    }

    fn free(&self, addr: &BlockAddr) -> Result<()> {
        self.blocks.write().remove(&addr.offset);
        Ok(())
    }

    fn sync(&self) -> Result<()> {
        Ok(())
    }

    fn write_metadata(&self, data: &[u8]) -> Result<()> {
        *self.metadata.write() = Some(data.to_vec());
        Ok(())
    }

    fn read_metadata(&self) -> Result<Option<Vec<u8>>> {
        Ok(self.metadata.read().clone())
    }

    fn reclaim(&self, keep: &HashSet<BlockAddr>) -> Result<usize> {
        let keep: HashSet<u64> = keep.iter().map(|a| a.offset).collect();
        let mut blocks = self.blocks.write();
        let before = blocks.len();
        blocks.retain(|offset, _| keep.contains(offset));
        Ok(before - blocks.len())
    }

    fn live_blocks(&self) -> usize {
        self.blocks.read().len()
    }
}
