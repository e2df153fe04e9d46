//! Tables: an ordered set of pages, each covering a key range.

use super::{ImageInfo, KeyEntry, Page, RootImage};
use crate::config::TableConfig;
use crate::types::{Key, TableId};
use parking_lot::RwLock;
use std::collections::BTreeMap;
use std::ops::Bound;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tracing::debug;

pub struct Table {
    pub id: TableId,
    pub name: String,
    pub config: TableConfig,
    /// Keyed by each page's lower bound; the first page's bound is empty
    pages: RwLock<BTreeMap<Key, Arc<Page>>>,
}

impl Table {
    /// A new, empty table with one resident page.
    pub fn new(id: TableId, name: impl Into<String>, config: TableConfig, page_ids: &AtomicU64) -> Self {
        let first = Arc::new(Page::resident(page_ids.fetch_add(1, Ordering::AcqRel), Vec::new()));
        let mut pages = BTreeMap::new();
        pages.insert(Vec::new(), first);
        Self {
            id,
            name: name.into(),
            config,
            pages: RwLock::new(pages),
        }
    }

    /// A table whose pages are all on disk, as recorded in `root`.
    pub fn from_root(
        id: TableId,
        name: impl Into<String>,
        config: TableConfig,
        root: &RootImage,
        page_ids: &AtomicU64,
    ) -> Self {
        if root.entries.is_empty() {
            return Self::new(id, name, config, page_ids);
        }
        let mut pages = BTreeMap::new();
        for entry in &root.entries {
            let info = ImageInfo {
                addr: entry.addr,
                max_durable_ts: entry.max_durable_ts,
                max_txn: entry.max_txn,
                rows: entry.rows,
            };
            let page = Page::on_disk(page_ids.fetch_add(1, Ordering::AcqRel), entry.lower.clone(), info);
            pages.insert(entry.lower.clone(), Arc::new(page));
        }
        Self {
            id,
            name: name.into(),
            config,
            pages: RwLock::new(pages),
        }
    }

    pub fn is_logged(&self) -> bool {
        self.config.logged
    }

    /// Page whose range holds `key`.
    pub fn page_for(&self, key: &[u8]) -> Option<Arc<Page>> {
        let pages = self.pages.read();
        pages
            .range::<[u8], _>((Bound::Unbounded, Bound::Included(key)))
            .next_back()
            .map(|(_, p)| Arc::clone(p))
    }

    /// Current pages in key order.
    pub fn pages(&self) -> Vec<Arc<Page>> {
        self.pages.read().values().cloned().collect()
    }

    pub fn page_count(&self) -> usize {
        self.pages.read().len()
    }

    /// Hold the page list stable (no splits) for the guard's lifetime.
    pub fn freeze(&self) -> parking_lot::RwLockReadGuard<'_, BTreeMap<Key, Arc<Page>>> {
        self.pages.read()
    }

    /// Split `page` in two if it holds more than `max_rows` rows. Gives up
    /// quietly if the page list or the page is busy. `own_pins` are the
    /// caller's pins on `page`.
    pub fn try_split(&self, page: &Arc<Page>, max_rows: usize, own_pins: usize, page_ids: &AtomicU64) -> bool {
        if page.row_count() <= max_rows {
            return false;
        }
        let Some(mut pages) = self.pages.try_write() else {
            return false;
        };
        if page.is_retired() || page.lock_exclusive(own_pins).is_err() {
            return false;
        }

        let rows: BTreeMap<Key, Arc<KeyEntry>> = std::mem::take(&mut *page.rows_mut());
        let total_mem = page.mem();
        let mid = rows.len() / 2;
        let split_key = match rows.keys().nth(mid) {
            Some(k) => k.clone(),
            None => {
                *page.rows_mut() = rows;
                page.unlock(super::PageState::Resident);
                return false;
            }
        };

        let left = Page::resident(page_ids.fetch_add(1, Ordering::AcqRel), page.lower().to_vec());
        let right = Page::resident(page_ids.fetch_add(1, Ordering::AcqRel), split_key.clone());
        let mut left_mem = 0usize;
        {
            let mut left_rows = left.rows_mut();
            let mut right_rows = right.rows_mut();
            for (key, entry) in rows {
                if key < split_key {
                    left_mem += key.len() + entry.mem_size();
                    left_rows.insert(key, entry);
                } else {
                    right_rows.insert(key, entry);
                }
            }
        }
        left.set_mem(left_mem.min(total_mem));
        right.set_mem(total_mem.saturating_sub(left_mem));

        page.set_mem(0);
        page.retire();
        pages.insert(page.lower().to_vec(), Arc::new(left));
        pages.insert(split_key, Arc::new(right));
        debug!(target: "lapis::btree", table = self.id, page = page.id(), "page split");
        true
    }
}
