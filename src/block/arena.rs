use memmap2::MmapMut;
use std::fs::{File, OpenOptions};
use std::path::Path;

const MAGIC: u64 = 0x4C41_5049_5342_4C4B;
pub const HEADER_SIZE: u64 = 64;

/// Append-mostly memory-mapped block file.
///
/// Layout: a 64-byte header (magic, committed end offset) followed by block
/// bytes. The file only grows; freed extents are reused by the caller.
pub struct BlockArena {
    mmap: MmapMut,
    file: File,
    end: u64,
}

impl BlockArena {
    pub fn open(path: &Path, size_mb: usize) -> std::io::Result<Self> {
        let size = (size_mb.max(1) * 1024 * 1024) as u64;
        let file = OpenOptions::new().read(true).write(true).create(true).open(path)?;
        // Only grow, never truncate an existing block file
        if file.metadata()?.len() < size {
            file.set_len(size)?;
        }
        let mut mmap = unsafe { MmapMut::map_mut(&file)? };

        if read_u64(&mmap, 0) != MAGIC {
            write_u64(&mut mmap, 0, MAGIC);
            write_u64(&mut mmap, 8, HEADER_SIZE);
        }
        let end = read_u64(&mmap, 8).max(HEADER_SIZE);

        Ok(Self { mmap, file, end })
    }

    /// Offset one past the last byte ever allocated.
    pub fn end(&self) -> u64 {
        self.end
    }

    pub fn capacity(&self) -> u64 {
        self.mmap.len() as u64
    }

    /// Grow the mapping to at least `needed` bytes, doubling.
    fn ensure(&mut self, needed: u64) -> std::io::Result<()> {
        if needed <= self.capacity() {
            return Ok(());
        }
        let mut cap = self.capacity().max(HEADER_SIZE);
        while cap < needed {
            cap *= 2;
        }
        self.mmap.flush()?;
        self.file.set_len(cap)?;
        self.mmap = unsafe { MmapMut::map_mut(&self.file)? };
        Ok(())
    }

    /// Reserve `len` bytes at the end of the file.
    pub fn append(&mut self, data: &[u8]) -> std::io::Result<u64> {
        let offset = self.end;
        self.ensure(offset + data.len() as u64)?;
        self.write_at(offset, data);
        self.end = offset + data.len() as u64;
        write_u64(&mut self.mmap, 8, self.end);
        Ok(offset)
    }

    /// Overwrite bytes inside the allocated region.
    pub fn write_at(&mut self, offset: u64, data: &[u8]) {
        let start = offset as usize;
        self.mmap[start..start + data.len()].copy_from_slice(data);
    }

    pub fn read(&self, offset: u64, len: u32) -> Option<&[u8]> {
        let start = offset as usize;
        let end = start.checked_add(len as usize)?;
        if offset < HEADER_SIZE || end as u64 > self.end {
            return None;
        }
        Some(&self.mmap[start..end])
    }

    pub fn flush(&self) -> std::io::Result<()> {
        self.mmap.flush()
    }
}

fn read_u64(mmap: &MmapMut, at: usize) -> u64 {
    let mut buf = [0u8; 8];
    buf.copy_from_slice(&mmap[at..at + 8]);
    u64::from_le_bytes(buf)
}

fn write_u64(mmap: &mut MmapMut, at: usize, v: u64) {
    mmap[at..at + 8].copy_from_slice(&v.to_le_bytes());
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn test_append_and_reopen() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("blocks.lap");
        let offset = {
            let mut arena = BlockArena::open(&path, 1).unwrap();
            let offset = arena.append(b"block-one").unwrap();
            assert_eq!(offset, HEADER_SIZE);
            arena.flush().unwrap();
            offset
        };
        let arena = BlockArena::open(&path, 1).unwrap();
        assert_eq!(arena.read(offset, 9).unwrap(), b"block-one");
        assert_eq!(arena.end(), HEADER_SIZE + 9);
    }

    #[test]
    fn test_grows_past_initial_size() {
        let dir = tempdir().unwrap();
        let mut arena = BlockArena::open(&dir.path().join("b"), 1).unwrap();
        let big = vec![7u8; 3 * 1024 * 1024];
        let offset = arena.append(&big).unwrap();
        assert!(arena.capacity() >= HEADER_SIZE + big.len() as u64);
        assert_eq!(arena.read(offset, big.len() as u32).unwrap()[100], 7);
        assert!(arena.read(arena.end(), 1).is_none());
    }
}
