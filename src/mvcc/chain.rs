//! Per-key update chains.
//!
//! Readers traverse without locks: the head and every `next` link are
//! `ArcSwapOption`s, so a reader holding an `Arc<Update>` keeps the rest of
//! its view alive even if the chain is truncated underneath it. Writers
//! (push, truncate, replace) must hold the owning page's latch.

use super::{Update, UpdateValue};
use crate::txn::TxnGlobal;
use arc_swap::ArcSwapOption;
use std::sync::Arc;

#[derive(Default)]
pub struct UpdateChain {
    head: ArcSwapOption<Update>,
}

impl UpdateChain {
    pub fn new() -> Self {
        Self {
            head: ArcSwapOption::empty(),
        }
    }

    #[inline]
    pub fn head(&self) -> Option<Arc<Update>> {
        self.head.load_full()
    }

    pub fn is_empty(&self) -> bool {
        self.head.load().is_none()
    }

    /// Publish `upd` as the newest version. Caller holds the page latch.
    pub fn push(&self, upd: Arc<Update>) {
        upd.set_next(self.head.load_full());
        self.head.store(Some(upd));
    }

    /// Swap in a different chain. Caller holds the page latch.
    pub fn replace(&self, head: Option<Arc<Update>>) {
        self.head.store(head);
    }

    pub fn iter(&self) -> ChainIter {
        ChainIter { cur: self.head() }
    }

    /// Newest update that has not been aborted.
    pub fn first_live(&self) -> Option<Arc<Update>> {
        self.iter().find(|u| !u.is_aborted())
    }

    pub fn len(&self) -> usize {
        self.iter().count()
    }

    /// Cut everything older than the newest self-contained update that every
    /// reader can see. Returns (updates removed, bytes removed). Caller holds
    /// the page latch.
    pub fn truncate_obsolete(&self, global: &TxnGlobal) -> (usize, usize) {
        let mut iter = self.iter();
        while let Some(upd) = iter.next() {
            if upd.is_aborted() || upd.is_prepared_in_progress() {
                continue;
            }
            let txn = upd.txn_id();
            if !global.is_committed(txn) {
                continue;
            }
            if matches!(upd.value, UpdateValue::Delta(_)) {
                continue;
            }
            if !global.visible_all(txn, upd.durable_ts().max(upd.start_ts())) {
                continue;
            }
            let tail = upd.next();
            upd.set_next(None);
            let mut count = 0usize;
            let mut bytes = 0usize;
            let mut cur = tail;
            while let Some(u) = cur {
                count += 1;
                bytes += u.mem_size();
                cur = u.next();
            }
            return (count, bytes);
        }
        (0, 0)
    }

    /// Bytes held by the chain.
    pub fn mem_size(&self) -> usize {
        self.iter().map(|u| u.mem_size()).sum()
    }
}

/// Newest-first iterator over a chain snapshot.
pub struct ChainIter {
    cur: Option<Arc<Update>>,
}

impl Iterator for ChainIter {
    type Item = Arc<Update>;

    fn next(&mut self) -> Option<Self::Item> {
        let cur = self.cur.take()?;
        self.cur = cur.next();
        Some(cur)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::txn::{IsolationLevel, TxnState};
    use crate::types::TS_NONE;

    fn full(writer: u64, v: &[u8]) -> Arc<Update> {
        Arc::new(Update::new(writer, UpdateValue::Full(v.to_vec())))
    }

    #[test]
    fn test_push_is_newest_first() {
        let chain = UpdateChain::new();
        chain.push(full(1, b"a"));
        chain.push(full(2, b"b"));
        chain.push(full(3, b"c"));
        let writers: Vec<u64> = chain.iter().map(|u| u.writer()).collect();
        assert_eq!(writers, vec![3, 2, 1]);
        assert_eq!(chain.len(), 3);
    }

    #[test]
    fn test_first_live_skips_aborted() {
        let chain = UpdateChain::new();
        chain.push(full(1, b"a"));
        let b = full(2, b"b");
        chain.push(Arc::clone(&b));
        b.mark_aborted();
        assert_eq!(chain.first_live().unwrap().writer(), 1);
    }

    #[test]
    fn test_reader_survives_truncate() {
        let global = TxnGlobal::new();
        let t1 = global.begin(IsolationLevel::Snapshot, TS_NONE);
        let t2 = global.begin(IsolationLevel::Snapshot, TS_NONE);
        let chain = UpdateChain::new();
        chain.push(full(t1.id, b"old"));
        chain.push(full(t2.id, b"new"));
        global.end(&t1, TxnState::Committed);
        global.end(&t2, TxnState::Committed);

        let reader_view: Vec<Arc<Update>> = chain.iter().collect();
        let (removed, bytes) = chain.truncate_obsolete(&global);
        assert_eq!(removed, 1);
        assert!(bytes > 0);
        assert_eq!(chain.len(), 1);
        // The reader's own Arcs still hold both versions
        assert_eq!(reader_view.len(), 2);
        assert_eq!(reader_view[1].value, UpdateValue::Full(b"old".to_vec()));
    }

    #[test]
    fn test_truncate_keeps_history_for_running_readers() {
        let global = TxnGlobal::new();
        let t1 = global.begin(IsolationLevel::Snapshot, TS_NONE);
        let chain = UpdateChain::new();
        chain.push(full(t1.id, b"old"));
        global.end(&t1, TxnState::Committed);

        let t2 = global.begin(IsolationLevel::Snapshot, TS_NONE);
        chain.push(full(t2.id, b"new"));
        global.end(&t2, TxnState::Committed);
        // A snapshot older than t2 is still running
        let _reader = global.begin(IsolationLevel::Snapshot, TS_NONE);
        let old_reader = global.begin(IsolationLevel::Snapshot, TS_NONE);
        old_reader.set_snap_min(t2.id);

        assert_eq!(chain.truncate_obsolete(&global), (0, 0));
        assert_eq!(chain.len(), 2);
    }
}
