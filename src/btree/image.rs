//! On-disk page and root images.

use crate::block::BlockAddr;
use crate::types::{Key, Timestamp, TimeWindow, TxnId, Value, TS_NONE, TXN_MAX, TXN_NONE};
use serde::{Deserialize, Serialize};

/// A materialized version stored in a page image.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Cell {
    pub value: Value,
    pub tw: TimeWindow,
}

impl Cell {
    pub fn new(value: Value, tw: TimeWindow) -> Self {
        Self { value, tw }
    }

    pub fn mem_size(&self) -> usize {
        std::mem::size_of::<Cell>() + self.value.len()
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PageImage {
    /// Sorted by key
    pub cells: Vec<(Key, Cell)>,
    pub max_durable_ts: Timestamp,
    /// Largest writer id recorded in a cell
    pub max_txn: TxnId,
}

impl PageImage {
    pub fn new(cells: Vec<(Key, Cell)>) -> Self {
        let mut max_durable_ts = TS_NONE;
        let mut max_txn = TXN_NONE;
        for (_, cell) in &cells {
            max_durable_ts = max_durable_ts.max(cell.tw.max_durable_ts());
            max_txn = max_txn.max(cell.tw.start_txn);
            if cell.tw.has_stop() && cell.tw.stop_txn != TXN_MAX {
                max_txn = max_txn.max(cell.tw.stop_txn);
            }
        }
        Self {
            cells,
            max_durable_ts,
            max_txn,
        }
    }

    pub fn len(&self) -> usize {
        self.cells.len()
    }

    pub fn is_empty(&self) -> bool {
        self.cells.is_empty()
    }
}

/// Where one page's image lives and what it holds, as recorded in the
/// table's root.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RootEntry {
    pub lower: Key,
    pub addr: BlockAddr,
    pub max_durable_ts: Timestamp,
    pub max_txn: TxnId,
    pub rows: u32,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RootImage {
    pub entries: Vec<RootEntry>,
}

impl RootImage {
    pub fn max_durable_ts(&self) -> Timestamp {
        self.entries.iter().map(|e| e.max_durable_ts).max().unwrap_or(TS_NONE)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_image_aggregates() {
        let mut stopped = TimeWindow::new(10, 12, 4);
        stopped.set_stop(30, 35, 9);
        let image = PageImage::new(vec![
            (b"a".to_vec(), Cell::new(b"1".to_vec(), TimeWindow::new(20, 20, 7))),
            (b"b".to_vec(), Cell::new(b"2".to_vec(), stopped)),
        ]);
        assert_eq!(image.max_durable_ts, 35);
        assert_eq!(image.max_txn, 9);
        assert_eq!(image.len(), 2);
    }
}
