//! In-memory pages.
//!
//! A page owns the rows whose keys fall in `[lower, next page's lower)`.
//! Each row is a [`KeyEntry`]: the update chain plus the cell the page was
//! loaded from.
//!
//! # States
//!
//! ```text
//! OnDisk --load--> Locked --> Resident <--> Reconciling (checkpoint)
//!                               |
//!                               +--evict/split--> Locked --> OnDisk | retired
//! ```
//!
//! Readers and writers pin a page by bumping its hazard counter and then
//! re-checking the state. Exclusive operations (load, evict, split) CAS the
//! state to `Locked` and then check the hazard counter. Both sides use
//! `SeqCst`, so at least one of them observes the other and backs off.
//!
//! Dirtiness is tracked separately from the state by a write generation:
//! a page is dirty while `write_gen != clean_gen`.

use super::{Cell, PageImage};
use crate::block::{decode, BlockAddr, BlockManager};
use crate::error::{LapisError, Result};
use crate::mvcc::UpdateChain;
use crate::types::{Key, Timestamp, TxnId};
use arc_swap::ArcSwapOption;
use parking_lot::{Mutex, MutexGuard, RwLock, RwLockReadGuard, RwLockWriteGuard};
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicU8, AtomicUsize, Ordering};
use std::sync::Arc;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum PageState {
    /// Only the image exists; rows are not in memory
    OnDisk = 0,
    Resident = 1,
    /// A checkpoint is writing the page; readers and writers continue
    Reconciling = 2,
    /// Being loaded, evicted or split; no pins allowed
    Locked = 3,
}

impl PageState {
    fn from_u8(v: u8) -> Self {
        match v {
            0 => PageState::OnDisk,
            1 => PageState::Resident,
            2 => PageState::Reconciling,
            _ => PageState::Locked,
        }
    }
}

/// One key's versions on a page.
#[derive(Default)]
pub struct KeyEntry {
    pub chain: UpdateChain,
    ondisk: ArcSwapOption<Cell>,
}

impl KeyEntry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_cell(cell: Cell) -> Self {
        Self {
            chain: UpdateChain::new(),
            ondisk: ArcSwapOption::from_pointee(cell),
        }
    }

    #[inline]
    pub fn ondisk(&self) -> Option<Arc<Cell>> {
        self.ondisk.load_full()
    }

    /// Replace the on-disk cell. Caller holds the page latch or the page is
    /// locked.
    pub fn set_ondisk(&self, cell: Option<Arc<Cell>>) {
        self.ondisk.store(cell);
    }

    pub fn mem_size(&self) -> usize {
        std::mem::size_of::<KeyEntry>()
            + self.chain.mem_size()
            + self.ondisk().map(|c| c.mem_size()).unwrap_or(0)
    }
}

/// Where the page's last image lives.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ImageInfo {
    pub addr: BlockAddr,
    pub max_durable_ts: Timestamp,
    pub max_txn: TxnId,
    pub rows: u32,
}

/// Result of a pin attempt.
pub enum PinAttempt {
    Pinned(PagePin),
    /// Rows are on disk; load the page and retry
    NeedsLoad,
    /// Locked by an exclusive operation; retry shortly
    Busy,
    /// Replaced by a split; look the key up again
    Retired,
}

pub struct Page {
    id: u64,
    lower: Key,
    state: AtomicU8,
    hazard: AtomicUsize,
    retired: AtomicBool,
    /// Serializes chain and row mutation
    latch: Mutex<()>,
    rows: RwLock<BTreeMap<Key, Arc<KeyEntry>>>,
    image: Mutex<Option<ImageInfo>>,
    write_gen: AtomicU64,
    clean_gen: AtomicU64,
    mem: AtomicUsize,
}

impl Page {
    /// A new, empty resident page. It starts dirty since it has no image.
    pub fn resident(id: u64, lower: Key) -> Self {
        Self {
            id,
            lower,
            state: AtomicU8::new(PageState::Resident as u8),
            hazard: AtomicUsize::new(0),
            retired: AtomicBool::new(false),
            latch: Mutex::new(()),
            rows: RwLock::new(BTreeMap::new()),
            image: Mutex::new(None),
            write_gen: AtomicU64::new(1),
            clean_gen: AtomicU64::new(0),
            mem: AtomicUsize::new(0),
        }
    }

    /// A page known only by its image.
    pub fn on_disk(id: u64, lower: Key, info: ImageInfo) -> Self {
        let page = Self::resident(id, lower);
        page.state.store(PageState::OnDisk as u8, Ordering::Release);
        page.write_gen.store(0, Ordering::Release);
        *page.image.lock() = Some(info);
        page
    }

    #[inline]
    pub fn id(&self) -> u64 {
        self.id
    }

    #[inline]
    pub fn lower(&self) -> &[u8] {
        &self.lower
    }

    #[inline]
    pub fn state(&self) -> PageState {
        PageState::from_u8(self.state.load(Ordering::SeqCst))
    }

    pub fn is_resident(&self) -> bool {
        matches!(self.state(), PageState::Resident | PageState::Reconciling)
    }

    pub fn is_retired(&self) -> bool {
        self.retired.load(Ordering::Acquire)
    }

    pub fn hazards(&self) -> usize {
        self.hazard.load(Ordering::SeqCst)
    }

    // ------------------------------------------------------------------
    // Pins
    // ------------------------------------------------------------------

    pub fn try_pin(self: &Arc<Self>) -> PinAttempt {
        self.hazard.fetch_add(1, Ordering::SeqCst);
        let state = self.state();
        let retired = self.is_retired();
        match state {
            PageState::Resident | PageState::Reconciling if !retired => PinAttempt::Pinned(PagePin {
                page: Arc::clone(self),
            }),
            _ => {
                self.hazard.fetch_sub(1, Ordering::SeqCst);
                if retired {
                    PinAttempt::Retired
                } else if state == PageState::OnDisk {
                    PinAttempt::NeedsLoad
                } else {
                    PinAttempt::Busy
                }
            }
        }
    }

    /// Take the page for an exclusive operation. `own_pins` are pins held by
    /// the caller itself.
    pub fn lock_exclusive(&self, own_pins: usize) -> Result<()> {
        self.state
            .compare_exchange(
                PageState::Resident as u8,
                PageState::Locked as u8,
                Ordering::SeqCst,
                Ordering::SeqCst,
            )
            .map_err(|_| LapisError::EvictionBusy)?;
        if self.hazard.load(Ordering::SeqCst) > own_pins {
            self.state.store(PageState::Resident as u8, Ordering::SeqCst);
            return Err(LapisError::EvictionBusy);
        }
        Ok(())
    }

    /// Leave the locked state.
    pub fn unlock(&self, state: PageState) {
        self.state.store(state as u8, Ordering::SeqCst);
    }

    /// Mark the page replaced by a split. It stays locked forever.
    pub fn retire(&self) {
        self.retired.store(true, Ordering::Release);
    }

    pub fn begin_reconcile(&self) -> bool {
        self.state
            .compare_exchange(
                PageState::Resident as u8,
                PageState::Reconciling as u8,
                Ordering::SeqCst,
                Ordering::SeqCst,
            )
            .is_ok()
    }

    pub fn end_reconcile(&self) {
        self.state.store(PageState::Resident as u8, Ordering::SeqCst);
    }

    /// Read the image and make the page resident. Returns bytes loaded, or
    /// `Ok(0)` if someone else is already loading it.
    pub fn load(&self, block: &dyn BlockManager) -> Result<usize> {
        if self
            .state
            .compare_exchange(
                PageState::OnDisk as u8,
                PageState::Locked as u8,
                Ordering::SeqCst,
                Ordering::SeqCst,
            )
            .is_err()
        {
            return Ok(0);
        }
        let image = match self.read_image(block) {
            Ok(image) => image,
            Err(e) => {
                self.unlock(PageState::OnDisk);
                return Err(e);
            }
        };
        let mut bytes = 0;
        {
            let mut rows = self.rows.write();
            rows.clear();
            for (key, cell) in image.cells {
                let entry = KeyEntry::with_cell(cell);
                bytes += key.len() + entry.mem_size();
                rows.insert(key, Arc::new(entry));
            }
        }
        self.mem.store(bytes, Ordering::Release);
        self.unlock(PageState::Resident);
        Ok(bytes)
    }

    fn read_image(&self, block: &dyn BlockManager) -> Result<PageImage> {
        let info = self
            .image()
            .ok_or_else(|| LapisError::Corruption(format!("page {} has no image", self.id)))?;
        decode(&block.read(&info.addr)?)
    }

    /// Drop the rows of a locked page. Returns the bytes released.
    pub fn drop_rows(&self) -> usize {
        self.rows.write().clear();
        self.mem.swap(0, Ordering::AcqRel)
    }

    // ------------------------------------------------------------------
    // Rows
    // ------------------------------------------------------------------

    pub fn latch(&self) -> MutexGuard<'_, ()> {
        self.latch.lock()
    }

    pub fn rows(&self) -> RwLockReadGuard<'_, BTreeMap<Key, Arc<KeyEntry>>> {
        self.rows.read()
    }

    pub fn rows_mut(&self) -> RwLockWriteGuard<'_, BTreeMap<Key, Arc<KeyEntry>>> {
        self.rows.write()
    }

    pub fn get(&self, key: &[u8]) -> Option<Arc<KeyEntry>> {
        self.rows.read().get(key).cloned()
    }

    /// Entry for `key`, creating an empty one. Caller holds the latch.
    pub fn entry(&self, key: &[u8]) -> (Arc<KeyEntry>, bool) {
        if let Some(entry) = self.get(key) {
            return (entry, false);
        }
        let entry = Arc::new(KeyEntry::new());
        self.rows.write().insert(key.to_vec(), Arc::clone(&entry));
        self.add_mem(key.len() + std::mem::size_of::<KeyEntry>());
        (entry, true)
    }

    pub fn row_count(&self) -> usize {
        self.rows.read().len()
    }

    // ------------------------------------------------------------------
    // Dirty tracking and accounting
    // ------------------------------------------------------------------

    pub fn mark_dirty(&self) {
        self.write_gen.fetch_add(1, Ordering::AcqRel);
    }

    pub fn is_dirty(&self) -> bool {
        self.write_gen.load(Ordering::Acquire) != self.clean_gen.load(Ordering::Acquire)
    }

    pub fn write_gen(&self) -> u64 {
        self.write_gen.load(Ordering::Acquire)
    }

    /// Record that everything up to `gen` is in the current image.
    pub fn mark_clean(&self, gen: u64) {
        self.clean_gen.store(gen, Ordering::Release);
    }

    pub fn image(&self) -> Option<ImageInfo> {
        *self.image.lock()
    }

    pub fn set_image(&self, info: ImageInfo) {
        *self.image.lock() = Some(info);
    }

    pub fn mem(&self) -> usize {
        self.mem.load(Ordering::Acquire)
    }

    pub fn add_mem(&self, n: usize) {
        self.mem.fetch_add(n, Ordering::AcqRel);
    }

    pub fn sub_mem(&self, n: usize) {
        let _ = self
            .mem
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |m| Some(m.saturating_sub(n)));
    }

    pub fn set_mem(&self, n: usize) {
        self.mem.store(n, Ordering::Release);
    }
}

impl std::fmt::Debug for Page {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Page")
            .field("id", &self.id)
            .field("state", &self.state())
            .field("dirty", &self.is_dirty())
            .field("hazards", &self.hazards())
            .finish()
    }
}

/// A hazard pin; released on drop.
pub struct PagePin {
    page: Arc<Page>,
}

impl PagePin {
    pub fn page(&self) -> &Arc<Page> {
        &self.page
    }
}

impl std::ops::Deref for PagePin {
    type Target = Page;

    fn deref(&self) -> &Page {
        &self.page
    }
}

impl Drop for PagePin {
    fn drop(&mut self) {
        self.page.hazard.fetch_sub(1, Ordering::SeqCst);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::block::{encode, MemBlockManager};
    use crate::types::TimeWindow;

    #[test]
    fn test_pin_blocks_exclusive() {
        let page = Arc::new(Page::resident(1, Vec::new()));
        let pin = match page.try_pin() {
            PinAttempt::Pinned(p) => p,
            _ => panic!("expected pin"),
        };
        assert!(matches!(page.lock_exclusive(0), Err(LapisError::EvictionBusy)));
        assert_eq!(page.state(), PageState::Resident);
        // The pin holder itself may lock
        assert!(page.lock_exclusive(1).is_ok());
        page.unlock(PageState::Resident);
        drop(pin);
        assert_eq!(page.hazards(), 0);
        assert!(page.lock_exclusive(0).is_ok());
        assert!(matches!(page.try_pin(), PinAttempt::Busy));
    }

    #[test]
    fn test_reconciling_allows_pins() {
        let page = Arc::new(Page::resident(1, Vec::new()));
        assert!(page.begin_reconcile());
        assert!(matches!(page.try_pin(), PinAttempt::Pinned(_)));
        assert!(page.lock_exclusive(0).is_err());
        page.end_reconcile();
    }

    #[test]
    fn test_retired_page() {
        let page = Arc::new(Page::resident(1, Vec::new()));
        page.lock_exclusive(0).unwrap();
        page.retire();
        assert!(matches!(page.try_pin(), PinAttempt::Retired));
    }

    #[test]
    fn test_load_from_image() {
        let block = MemBlockManager::new();
        let image = PageImage::new(vec![(
            b"k".to_vec(),
            Cell::new(b"v".to_vec(), TimeWindow::new(5, 5, 1)),
        )]);
        let addr = block.write(&encode(&image).unwrap()).unwrap();
        let page = Arc::new(Page::on_disk(
            3,
            Vec::new(),
            ImageInfo {
                addr,
                max_durable_ts: 5,
                max_txn: 1,
                rows: 1,
            },
        ));
        assert!(matches!(page.try_pin(), PinAttempt::NeedsLoad));
        assert!(!page.is_dirty());
        assert!(page.load(&block).unwrap() > 0);
        assert_eq!(page.state(), PageState::Resident);
        let entry = page.get(b"k").unwrap();
        assert_eq!(entry.ondisk().unwrap().value, b"v".to_vec());
        assert!(entry.chain.is_empty());
    }

    #[test]
    fn test_dirty_generations() {
        let page = Page::resident(1, Vec::new());
        assert!(page.is_dirty());
        let gen = page.write_gen();
        page.mark_clean(gen);
        assert!(!page.is_dirty());
        page.mark_dirty();
        assert!(page.is_dirty());
    }
}
