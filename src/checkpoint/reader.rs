//! Read-only access to a checkpoint.

use super::CheckpointRecord;
use crate::block::{decode, BlockAddr, BlockManager};
use crate::btree::{Cell, PageImage, RootImage};
use crate::engine::EngineState;
use crate::error::Result;
use crate::history::{HsPage, HsRootEntry, HsRows, HsRowsView};
use crate::mvcc::{resolve, ReadContext, UpdateChain};
use crate::types::{TableId, Timestamp, Value, TS_NONE};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::Arc;

/// Leaves listed by a checkpoint's history root.
pub(crate) fn read_history_root(block: &dyn BlockManager, root: Option<BlockAddr>) -> Result<Vec<HsRootEntry>> {
    match root {
        Some(root) => decode(&block.read(&root)?),
        None => Ok(Vec::new()),
    }
}

/// Every history leaf a checkpoint recorded, read in full.
fn read_history_pages(block: &dyn BlockManager, root: Option<BlockAddr>) -> Result<Vec<HsPage>> {
    read_history_root(block, root)?
        .iter()
        .map(|entry| decode(&block.read(&entry.addr)?))
        .collect()
}

/// A view of the database as a checkpoint recorded it.
///
/// Reads see exactly what the checkpoint captured, whatever has happened
/// since. While a reader is open its checkpoint cannot be replaced or
/// dropped and its blocks are never reused.
pub struct CheckpointReader {
    engine: Arc<EngineState>,
    id: u64,
    record: CheckpointRecord,
    history: HsRows,
    roots: Mutex<HashMap<TableId, Arc<RootImage>>>,
    images: Mutex<HashMap<BlockAddr, Arc<PageImage>>>,
}

impl CheckpointReader {
    pub(crate) fn open(engine: Arc<EngineState>, name: Option<&str>) -> Result<Self> {
        let (id, record) = engine.ckpt.open_reader(name)?;
        let history = match read_history_pages(engine.block.as_ref(), record.hs_root) {
            Ok(pages) => pages.into_iter().flat_map(|p| p.rows).collect(),
            Err(e) => {
                engine.ckpt.close_reader(id);
                return Err(e);
            }
        };
        Ok(Self {
            engine,
            id,
            record,
            history,
            roots: Mutex::new(HashMap::new()),
            images: Mutex::new(HashMap::new()),
        })
    }

    pub fn record(&self) -> &CheckpointRecord {
        &self.record
    }

    pub fn checkpoint_ts(&self) -> Timestamp {
        self.record.checkpoint_ts
    }

    /// Value of `key` in `table` as of the checkpoint. Tables created after
    /// the checkpoint read as empty.
    pub fn get(&self, table: &str, key: &[u8]) -> Result<Option<Value>> {
        let table = self.engine.table_by_name(table)?;
        let cell = match self.root(table.id)? {
            Some(root) => self.cell(&root, key)?,
            None => return Ok(None),
        };
        let read_ts = (self.record.checkpoint_ts != TS_NONE).then_some(self.record.checkpoint_ts);
        let ctx = ReadContext::at_snapshot(&self.record.snapshot, read_ts);
        let history = HsRowsView {
            rows: &self.history,
            table: table.id,
            key,
        };
        resolve(&ctx, &UpdateChain::new(), cell.as_ref(), &history)
    }

    fn root(&self, table: TableId) -> Result<Option<Arc<RootImage>>> {
        if let Some(root) = self.roots.lock().get(&table) {
            return Ok(Some(Arc::clone(root)));
        }
        let Some(addr) = self.record.root_of(table) else {
            return Ok(None);
        };
        let root: Arc<RootImage> = Arc::new(decode(&self.engine.block.read(&addr)?)?);
        self.roots.lock().insert(table, Arc::clone(&root));
        Ok(Some(root))
    }

    fn cell(&self, root: &RootImage, key: &[u8]) -> Result<Option<Cell>> {
        let idx = root.entries.partition_point(|e| e.lower.as_slice() <= key);
        let Some(entry) = idx.checked_sub(1).and_then(|i| root.entries.get(i)) else {
            return Ok(None);
        };
        let image = {
            let cached = self.images.lock().get(&entry.addr).cloned();
            match cached {
                Some(image) => image,
                None => {
                    let image: Arc<PageImage> = Arc::new(decode(&self.engine.block.read(&entry.addr)?)?);
                    self.images.lock().insert(entry.addr, Arc::clone(&image));
                    image
                }
            }
        };
        Ok(image
            .cells
            .binary_search_by(|(k, _)| k.as_slice().cmp(key))
            .ok()
            .map(|i| image.cells[i].1.clone()))
    }
}

impl Drop for CheckpointReader {
    fn drop(&mut self) {
        self.engine.ckpt.close_reader(self.id);
    }
}
