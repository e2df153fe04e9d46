//! Multi-version records: updates, per-key chains and the visibility
//! resolver that picks the version a reader sees.

mod chain;
mod modify;
mod update;
mod visibility;

pub use chain::{ChainIter, UpdateChain};
pub use modify::{Modify, ModifyEntry, MAX_MODIFY_SPAN};
pub use update::{Update, UpdateValue, UPD_IN_HS, UPD_RESTORED_FROM_DS, UPD_RESTORED_FROM_HS};
pub use visibility::{resolve, HistoryLookup, NoHistory, ReadContext, Visibility};
