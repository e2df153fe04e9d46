//! History Store
//!
//! Internal table of superseded versions pushed out of in-memory chains by
//! eviction and checkpoint reconciliation. Rows are keyed by
//! (table, key, start timestamp, start txn) and own a copy of their payload;
//! nothing here points back into live chains.
//!
//! Rows are kept in leaves that split at key boundaries. Leaves are written
//! to blocks, counted against the cache and evicted under pressure like
//! table pages; checkpoints rewrite only the leaves that changed.
//!
//! Only reconciliation writes rows, always as one [`HsBatch`]. Readers reach
//! the store through the visibility resolver once a key's chain and on-disk
//! cell are exhausted. Rollback-to-stable and the obsolete cleanup thread
//! remove rows.

mod record;
mod store;

pub use record::{HsBatch, HsKey, HsPage, HsRecord, HsRootEntry, HsValue};
pub use store::{HistoryStore, HsRowsView, HsView};
pub(crate) use store::HsRows;
