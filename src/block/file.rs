//! File-backed block manager.

use super::arena::HEADER_SIZE;
use super::{block_size, BlockAddr, BlockArena, BlockManager};
use crate::error::{LapisError, Result};
use parking_lot::{Mutex, RwLock};
use std::collections::HashSet;
use std::fs::{self, File};
use std::io::Write;
use std::path::{Path, PathBuf};
use tracing::debug;

const BLOCK_FILE: &str = "lapis.blocks";
const META_FILE: &str = "lapis.meta";
const META_TMP: &str = "lapis.meta.tmp";

pub struct FileBlockManager {
    dir: PathBuf,
    arena: RwLock<BlockArena>,
    /// Free extents (offset, len), first fit
    free: Mutex<Vec<(u64, u64)>>,
    live: Mutex<HashSet<u64>>,
}

impl FileBlockManager {
    pub fn open(dir: impl AsRef<Path>, size_mb: usize) -> Result<Self> {
        let dir = dir.as_ref().to_path_buf();
        fs::create_dir_all(&dir)?;
        let arena = BlockArena::open(&dir.join(BLOCK_FILE), size_mb)?;
        Ok(Self {
            dir,
            arena: RwLock::new(arena),
            free: Mutex::new(Vec::new()),
            live: Mutex::new(HashSet::new()),
        })
    }

    fn take_free(&self, len: u64) -> Option<u64> {
        let mut free = self.free.lock();
        let idx = free.iter().position(|(_, l)| *l >= len)?;
        let (offset, avail) = free[idx];
        if avail == len {
            free.swap_remove(idx);
        } else {
            free[idx] = (offset + len, avail - len);
        }
        Some(offset)
    }
}

impl BlockManager for FileBlockManager {
    fn write(&self, data: &[u8]) -> Result<BlockAddr> {
        let size = block_size(data.len())?;
        let len = u64::from(size);
        let offset = {
            let mut arena = self.arena.write();
            let reused = if len > 0 { self.take_free(len) } else { None };
            match reused {
                Some(offset) => {
                    arena.write_at(offset, data);
                    offset
                }
                None => arena.append(data)?,
            }
        };
        self.live.lock().insert(offset);
        Ok(BlockAddr {
            offset,
            size,
            checksum: crc32fast::hash(data),
        })
    }

    fn read(&self, addr: &BlockAddr) -> Result<Vec<u8>> {
        let arena = self.arena.read();
        let data = arena
            .read(addr.offset, addr.size)
            .ok_or_else(|| LapisError::Corruption(format!("block {} out of range", addr.offset)))?
            .to_vec();
        drop(arena);
        addr.verify(&data)?;
        Ok(data)
    }

    fn free(&self, addr: &BlockAddr) -> Result<()> {
        if self.live.lock().remove(&addr.offset) && addr.size > 0 {
            self.free.lock().push((addr.offset, addr.size as u64));
        }
        Ok(())
    }

    fn sync(&self) -> Result<()> {
        self.arena.read().flush()?;
        Ok(())
    }

    fn write_metadata(&self, data: &[u8]) -> Result<()> {
        let tmp = self.dir.join(META_TMP);
        {
            let mut file = File::create(&tmp)?;
            file.write_all(data)?;
            file.sync_all()?;
        }
        fs::rename(&tmp, self.dir.join(META_FILE))?;
        Ok(())
    }

    fn read_metadata(&self) -> Result<Option<Vec<u8>>> {
        let path = self.dir.join(META_FILE);
        if !path.exists() {
            return Ok(None);
        }
        Ok(Some(fs::read(path)?))
    }

    fn reclaim(&self, keep: &HashSet<BlockAddr>) -> Result<usize> {
        let end = self.arena.read().end();
        let mut used: Vec<(u64, u64)> = keep.iter().map(|a| (a.offset, a.size as u64)).collect();
        used.sort_unstable();

        let mut gaps = Vec::new();
        let mut cursor = HEADER_SIZE;
        for (offset, len) in &used {
            if *offset > cursor {
                gaps.push((cursor, offset - cursor));
            }
            cursor = cursor.max(offset + len);
        }
        if end > cursor {
            gaps.push((cursor, end - cursor));
        }

        let reclaimed = self.live.lock().len().saturating_sub(keep.len());
        *self.live.lock() = keep.iter().map(|a| a.offset).collect();
        debug!(target: "lapis::block", extents = gaps.len(), "block file free space rebuilt");
        *self.free.lock() = gaps;
        Ok(reclaimed)
    }

    fn live_blocks(&self) -> usize {
        self.live.lock().len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn test_write_read_reopen() {
        let dir = tempdir().unwrap();
        let addr = {
            let bm = FileBlockManager::open(dir.path(), 1).unwrap();
            let addr = bm.write(b"persisted").unwrap();
            bm.sync().unwrap();
            bm.write_metadata(b"meta-v1").unwrap();
            addr
        };
        let bm = FileBlockManager::open(dir.path(), 1).unwrap();
        assert_eq!(bm.read(&addr).unwrap(), b"persisted".to_vec());
        assert_eq!(bm.read_metadata().unwrap(), Some(b"meta-v1".to_vec()));
    }

    #[test]
    fn test_freed_space_is_reused() {
        let dir = tempdir().unwrap();
        let bm = FileBlockManager::open(dir.path(), 1).unwrap();
        let a = bm.write(&[1u8; 100]).unwrap();
        bm.free(&a).unwrap();
        let b = bm.write(&[2u8; 60]).unwrap();
        assert_eq!(b.offset, a.offset);
        assert_eq!(bm.read(&b).unwrap(), vec![2u8; 60]);
    }

    #[test]
    fn test_reclaim_rebuilds_free_list() {
        let dir = tempdir().unwrap();
        let bm = FileBlockManager::open(dir.path(), 1).unwrap();
        let a = bm.write(&[1u8; 10]).unwrap();
        let b = bm.write(&[2u8; 10]).unwrap();
        let keep: HashSet<BlockAddr> = [b].into_iter().collect();
        bm.reclaim(&keep).unwrap();
        assert_eq!(bm.live_blocks(), 1);
        let c = bm.write(&[3u8; 10]).unwrap();
        assert_eq!(c.offset, a.offset);
    }

    #[test]
    fn test_checksum_detects_damage() {
        let dir = tempdir().unwrap();
        let bm = FileBlockManager::open(dir.path(), 1).unwrap();
        let mut addr = bm.write(b"abc").unwrap();
        addr.checksum ^= 1;
        assert!(matches!(bm.read(&addr), Err(LapisError::Corruption(_))));
    }
}
