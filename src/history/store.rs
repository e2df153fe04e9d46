//! The history store table.

use super::{HsBatch, HsKey, HsPage, HsRecord, HsRootEntry, HsValue};
use crate::block::{decode, encode, BlockAddr, BlockManager};
use crate::error::{LapisError, Result};
use crate::mvcc::{HistoryLookup, Modify, ReadContext};
use crate::stats::Stats;
use crate::txn::{IsolationLevel, Snapshot, TxnGlobal};
use crate::types::{Key, TableId, Timestamp, Value, TXN_NONE};
use parking_lot::{MappedRwLockReadGuard, MappedRwLockWriteGuard, Mutex, RwLock, RwLockReadGuard, RwLockWriteGuard};
use rand::Rng;
use roaring::RoaringBitmap;
use std::collections::BTreeMap;
use std::ops::{Bound, RangeBounds};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use tracing::{debug, trace};

pub(crate) type HsRows = BTreeMap<HsKey, HsRecord>;

/// Bookkeeping charged per row on top of its key and payload.
const ROW_OVERHEAD: usize = std::mem::size_of::<HsKey>() + std::mem::size_of::<HsRecord>();

fn row_size(key: &HsKey, record: &HsRecord) -> usize {
    ROW_OVERHEAD + key.key.len() + record.value.mem_size()
}

fn rows_size(rows: &HsRows) -> usize {
    rows.iter().map(|(k, r)| row_size(k, r)).sum()
}

/// Lower bound of the first leaf.
fn min_key() -> HsKey {
    HsKey::first_of(0, &[])
}

/// A run of rows between two key boundaries.
struct Leaf {
    /// `None` while evicted
    rows: RwLock<Option<HsRows>>,
    /// Last written image. Matches `rows` unless the leaf is dirty.
    image: Mutex<Option<BlockAddr>>,
    dirty: AtomicBool,
    /// Row count, kept while evicted
    len: AtomicUsize,
    /// Resident bytes
    mem: AtomicUsize,
}

impl Leaf {
    fn resident(rows: HsRows) -> Self {
        let len = rows.len();
        let mem = rows_size(&rows);
        Self {
            rows: RwLock::new(Some(rows)),
            image: Mutex::new(None),
            dirty: AtomicBool::new(len > 0),
            len: AtomicUsize::new(len),
            mem: AtomicUsize::new(mem),
        }
    }

    fn evicted(entry: &HsRootEntry) -> Self {
        Self {
            rows: RwLock::new(None),
            image: Mutex::new(Some(entry.addr)),
            dirty: AtomicBool::new(false),
            len: AtomicUsize::new(entry.rows as usize),
            mem: AtomicUsize::new(0),
        }
    }

    fn is_dirty(&self) -> bool {
        self.dirty.load(Ordering::Acquire)
    }
}

type Leaves = BTreeMap<HsKey, Arc<Leaf>>;

/// The leaf holding the rows of `at`'s key.
fn locate<'m>(leaves: &'m Leaves, at: &HsKey) -> Result<&'m Arc<Leaf>> {
    leaves
        .range(..=at.clone())
        .next_back()
        .map(|(_, leaf)| leaf)
        .ok_or_else(|| LapisError::Corruption(format!("history store has no leaf for table {}", at.table)))
}

/// Leaves that may hold rows of `table`.
fn leaves_of_table(leaves: &Leaves, table: TableId) -> Vec<Arc<Leaf>> {
    let start = HsKey::first_of(table, &[]);
    let mut out: Vec<Arc<Leaf>> = leaves.range(..=start.clone()).next_back().map(|(_, l)| Arc::clone(l)).into_iter().collect();
    out.extend(
        leaves
            .range((Bound::Excluded(start), Bound::Unbounded))
            .take_while(|(k, _)| k.table == table)
            .map(|(_, l)| Arc::clone(l)),
    );
    out
}

/// Where a leaf that grew too large splits: the first row of a key in its
/// upper half. `None` when every row belongs to one key.
fn split_point(rows: &HsRows) -> Option<HsKey> {
    let (first, _) = rows.iter().next()?;
    let (mid, _) = rows.iter().nth(rows.len() / 2)?;
    let at = if mid.same_key(first.table, &first.key) {
        rows.range((Bound::Excluded(HsKey::last_of(first.table, &first.key)), Bound::Unbounded))
            .next()
            .map(|(k, _)| k)?
    } else {
        mid
    };
    Some(HsKey::first_of(at.table, &at.key))
}

/// Superseded versions of every table, ordered by [`HsKey`].
///
/// All rows of one user key live in a single leaf, so per-key lookups take
/// one leaf latch. Lookups hold the leaf map shared until their leaf is
/// latched; only `apply` takes it exclusively, to split leaves.
pub struct HistoryStore {
    leaves: RwLock<Leaves>,
    block: Arc<dyn BlockManager>,
    /// Rows a leaf holds before it splits
    leaf_rows: usize,
    /// Resident bytes across all leaves
    bytes: AtomicUsize,
    stats: Arc<Stats>,
}

impl HistoryStore {
    pub fn new(block: Arc<dyn BlockManager>, leaf_rows: usize, stats: Arc<Stats>) -> Self {
        let mut leaves = Leaves::new();
        leaves.insert(min_key(), Arc::new(Leaf::resident(HsRows::new())));
        Self {
            leaves: RwLock::new(leaves),
            block,
            leaf_rows: leaf_rows.max(1),
            bytes: AtomicUsize::new(0),
            stats,
        }
    }

    /// Reopen from a checkpoint's history root. Leaves stay on disk until
    /// first used.
    pub fn open(block: Arc<dyn BlockManager>, leaf_rows: usize, root: &[HsRootEntry], stats: Arc<Stats>) -> Self {
        let hs = Self::new(block, leaf_rows, stats);
        {
            let mut leaves = hs.leaves.write();
            for entry in root {
                leaves.insert(entry.lower.clone(), Arc::new(Leaf::evicted(entry)));
            }
        }
        debug!(target: "lapis::history", leaves = root.len(), "history store opened");
        hs
    }

    pub fn len(&self) -> usize {
        self.leaves.read().values().map(|l| l.len.load(Ordering::Acquire)).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Resident bytes, counted toward cache pressure.
    pub fn bytes(&self) -> usize {
        self.bytes.load(Ordering::Acquire)
    }

    pub fn leaf_count(&self) -> usize {
        self.leaves.read().len()
    }

    pub fn resident_leaves(&self) -> usize {
        self.leaves.read().values().filter(|l| l.rows.read().is_some()).count()
    }

    /// Blocks holding current leaf images.
    pub fn images(&self) -> Vec<BlockAddr> {
        self.leaves.read().values().filter_map(|l| *l.image.lock()).collect()
    }

    fn add_bytes(&self, n: usize) {
        self.bytes.fetch_add(n, Ordering::AcqRel);
    }

    fn sub_bytes(&self, n: usize) {
        let _ = self
            .bytes
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |v| Some(v.saturating_sub(n)));
    }

    /// Record a change to a resident leaf's rows.
    fn touched(&self, leaf: &Leaf, rows: &HsRows) {
        let mem = rows_size(rows);
        let old = leaf.mem.swap(mem, Ordering::AcqRel);
        if mem >= old {
            self.add_bytes(mem - old);
        } else {
            self.sub_bytes(old - mem);
        }
        leaf.len.store(rows.len(), Ordering::Release);
        leaf.dirty.store(true, Ordering::Release);
    }

    /// Read an evicted leaf's image. Caller holds the leaf exclusively.
    fn read_image(&self, leaf: &Leaf) -> Result<HsRows> {
        let addr = (*leaf.image.lock())
            .ok_or_else(|| LapisError::Corruption("evicted history leaf has no image".into()))?;
        let page: HsPage = decode(&self.block.read(&addr)?)?;
        let rows: HsRows = page.rows.into_iter().collect();
        let mem = rows_size(&rows);
        leaf.mem.store(mem, Ordering::Release);
        self.add_bytes(mem);
        Stats::incr(&self.stats.hs_leaf_reads);
        trace!(target: "lapis::history", rows = rows.len(), "history leaf read");
        Ok(rows)
    }

    fn write_image(&self, rows: &HsRows) -> Result<BlockAddr> {
        let page = HsPage {
            rows: rows.iter().map(|(k, r)| (k.clone(), r.clone())).collect(),
        };
        let addr = self.block.write(&encode(&page)?)?;
        Stats::incr(&self.stats.block_writes);
        Stats::incr(&self.stats.hs_leaf_writes);
        Ok(addr)
    }

    /// Latch `leaf` shared, reading it back first if it was evicted.
    fn load<'l>(&self, leaf: &'l Leaf) -> Result<MappedRwLockReadGuard<'l, HsRows>> {
        let slot = leaf.rows.read();
        let slot = if slot.is_some() {
            slot
        } else {
            drop(slot);
            let mut slot = leaf.rows.write();
            if slot.is_none() {
                *slot = Some(self.read_image(leaf)?);
            }
            RwLockWriteGuard::downgrade(slot)
        };
        RwLockReadGuard::try_map(slot, |rows| rows.as_ref())
            .map_err(|_| LapisError::Corruption("history leaf is not resident".into()))
    }

    /// Latch `leaf` exclusively, reading it back first if it was evicted.
    fn load_mut<'l>(&self, leaf: &'l Leaf) -> Result<MappedRwLockWriteGuard<'l, HsRows>> {
        let mut slot = leaf.rows.write();
        if slot.is_none() {
            *slot = Some(self.read_image(leaf)?);
        }
        RwLockWriteGuard::try_map(slot, |rows| rows.as_mut())
            .map_err(|_| LapisError::Corruption("history leaf is not resident".into()))
    }

    /// Apply a batch. Re-inserting an existing row replaces it. Each key's
    /// changes land together; a leaf that grows past its limit splits.
    pub fn apply(&self, batch: HsBatch) -> Result<usize> {
        if batch.is_empty() {
            return Ok(0);
        }
        let deltas = batch.deltas() as u64;
        let inserts = batch.inserts.len() as u64;
        let n = batch.len();

        let mut leaves = self.leaves.write();
        let mut groups: BTreeMap<HsKey, (Vec<HsKey>, Vec<(HsKey, HsRecord)>)> = BTreeMap::new();
        for key in batch.removes {
            let lower = leaves.range(..=key.clone()).next_back().map(|(k, _)| k.clone()).unwrap_or_else(min_key);
            groups.entry(lower).or_default().0.push(key);
        }
        for (key, record) in batch.inserts {
            let lower = leaves.range(..=key.clone()).next_back().map(|(k, _)| k.clone()).unwrap_or_else(min_key);
            groups.entry(lower).or_default().1.push((key, record));
        }

        let mut splits = Vec::new();
        for (lower, (removes, inserts)) in groups {
            let leaf = Arc::clone(locate(&leaves, &lower)?);
            let mut rows = self.load_mut(&leaf)?;
            for key in removes {
                rows.remove(&key);
            }
            for (key, record) in inserts {
                rows.insert(key, record);
            }
            if rows.len() > self.leaf_rows {
                if let Some(at) = split_point(&rows) {
                    let upper = rows.split_off(&at);
                    splits.push((at, upper));
                }
            }
            self.touched(&leaf, &rows);
        }
        for (lower, rows) in splits {
            let leaf = Leaf::resident(rows);
            self.add_bytes(leaf.mem.load(Ordering::Acquire));
            trace!(target: "lapis::history", rows = leaf.len.load(Ordering::Acquire), "history leaf split");
            leaves.insert(lower, Arc::new(leaf));
            Stats::incr(&self.stats.hs_leaf_splits);
        }
        drop(leaves);

        Stats::add(&self.stats.hs_insert, inserts);
        Stats::add(&self.stats.hs_insert_delta, deltas);
        trace!(target: "lapis::history", rows = n, "history batch applied");
        Ok(n)
    }

    /// Lookup handle for one key.
    pub fn view<'a>(&'a self, table: TableId, key: &'a [u8]) -> HsView<'a> {
        HsView { hs: self, table, key }
    }

    /// Run `f` over the leaf holding `key`'s rows.
    fn with_key<R>(&self, table: TableId, key: &[u8], f: impl FnOnce(&HsRows) -> Result<R>) -> Result<R> {
        let leaves = self.leaves.read();
        let leaf = Arc::clone(locate(&leaves, &HsKey::first_of(table, key))?);
        let rows = self.load(&leaf)?;
        drop(leaves);
        f(&*rows)
    }

    /// Rows of one key, oldest first.
    pub fn key_rows(&self, table: TableId, key: &[u8]) -> Result<Vec<(HsKey, HsRecord)>> {
        self.with_key(table, key, |rows| {
            Ok(rows
                .range(HsKey::first_of(table, key)..=HsKey::last_of(table, key))
                .map(|(k, r)| (k.clone(), r.clone()))
                .collect())
        })
    }

    /// Newest version starting at or before `ts`, ignoring transaction
    /// visibility. Deltas are replayed onto their full base.
    pub fn read_newest_leq(&self, table: TableId, key: &[u8], ts: Timestamp) -> Result<Option<Value>> {
        let ctx = ReadContext {
            txn_id: TXN_NONE,
            isolation: IsolationLevel::Snapshot,
            snapshot: None,
            read_ts: ts,
            global: None,
        };
        self.view(table, key).newest_visible(&ctx)
    }

    /// Newest row whose start is durable at `stable` (and, during recovery,
    /// whose writer is visible to the checkpoint snapshot). Returns the row
    /// and its materialized value.
    pub fn newest_stable(
        &self,
        table: TableId,
        key: &[u8],
        stable: Timestamp,
        snapshot: Option<&Snapshot>,
    ) -> Result<Option<(HsKey, HsRecord, Value)>> {
        self.with_key(table, key, |rows| {
            let range = rows.range(HsKey::first_of(table, key)..=HsKey::last_of(table, key));
            for (k, r) in range.rev() {
                if r.tw.durable_start_ts > stable {
                    continue;
                }
                if let Some(snap) = snapshot {
                    if !snap.is_visible(r.tw.start_txn) {
                        continue;
                    }
                }
                let value = materialize(rows, k, r)?;
                return Ok(Some((k.clone(), r.clone(), value)));
            }
            Ok(None)
        })
    }

    /// Remove rows of `table` whose key falls in `keys` and whose start is at
    /// or after `min_start_ts`.
    pub fn remove_range<R: RangeBounds<Key>>(&self, table: TableId, keys: R, min_start_ts: Timestamp) -> Result<usize> {
        let candidates = leaves_of_table(&self.leaves.read(), table);
        let mut removed = 0;
        for leaf in candidates {
            let mut rows = self.load_mut(&leaf)?;
            let doomed: Vec<HsKey> = rows
                .keys()
                .filter(|k| k.table == table && keys.contains(&k.key) && k.start_ts >= min_start_ts)
                .cloned()
                .collect();
            if doomed.is_empty() {
                continue;
            }
            for k in &doomed {
                rows.remove(k);
            }
            self.touched(&leaf, &rows);
            removed += doomed.len();
        }
        Stats::add(&self.stats.hs_removed, removed as u64);
        Ok(removed)
    }

    /// Remove rows of a single key starting at or after `min_start_ts`.
    pub fn remove_key_from(&self, table: TableId, key: &[u8], min_start_ts: Timestamp) -> Result<usize> {
        let leaves = self.leaves.read();
        let leaf = Arc::clone(locate(&leaves, &HsKey::first_of(table, key))?);
        let mut rows = self.load_mut(&leaf)?;
        drop(leaves);
        let doomed: Vec<HsKey> = rows
            .range(HsKey::new(table, key.to_vec(), min_start_ts, 0)..=HsKey::last_of(table, key))
            .map(|(k, _)| k.clone())
            .collect();
        if doomed.is_empty() {
            return Ok(0);
        }
        for k in &doomed {
            rows.remove(k);
        }
        self.touched(&leaf, &rows);
        Stats::add(&self.stats.hs_removed, doomed.len() as u64);
        Ok(doomed.len())
    }

    pub fn remove_rows(&self, keys: &[HsKey]) -> Result<usize> {
        let mut removed = 0;
        for k in keys {
            let leaves = self.leaves.read();
            let leaf = Arc::clone(locate(&leaves, k)?);
            let mut rows = self.load_mut(&leaf)?;
            drop(leaves);
            if rows.remove(k).is_some() {
                self.touched(&leaf, &rows);
                removed += 1;
            }
        }
        Stats::add(&self.stats.hs_removed, removed as u64);
        Ok(removed)
    }

    /// Drop rows no reader can need: their stop is visible to everyone. A
    /// delta left without its base is rewritten as a full value. Only
    /// resident leaves are visited.
    ///
    /// Returns (rows removed, deltas rebased).
    pub fn cleanup_obsolete(&self, global: &TxnGlobal) -> Result<(usize, usize)> {
        let resident: Vec<Arc<Leaf>> = self.leaves.read().values().cloned().collect();
        let (mut removed, mut rebased) = (0, 0);
        for leaf in resident {
            let mut slot = leaf.rows.write();
            let Some(rows) = slot.as_mut() else {
                continue;
            };
            let (r, b) = cleanup_leaf(rows, global)?;
            if r + b > 0 {
                self.touched(&leaf, rows);
                removed += r;
                rebased += b;
            }
        }

        if removed + rebased > 0 {
            Stats::add(&self.stats.hs_obsolete_removed, removed as u64);
            Stats::add(&self.stats.hs_delta_rebased, rebased as u64);
            debug!(target: "lapis::history", removed, rebased, "obsolete history cleaned");
        }
        Ok((removed, rebased))
    }

    /// Rollback-to-stable sweep: delete rows that start after `stable` and
    /// clear stops after `stable` so those rows become current again. Tables
    /// in `skip` are left alone. Every leaf is visited.
    ///
    /// Returns (rows removed, stops cleared).
    pub fn sweep_unstable(&self, stable: Timestamp, skip: &RoaringBitmap, dryrun: bool) -> Result<(usize, usize)> {
        let all: Vec<Arc<Leaf>> = self.leaves.read().values().cloned().collect();
        let (mut removed, mut cleared) = (0, 0);
        for leaf in all {
            let (removes, clears) = {
                let rows = self.load(&leaf)?;
                let mut removes = Vec::new();
                let mut clears = Vec::new();
                for (k, r) in rows.iter() {
                    if skip.contains(k.table) {
                        continue;
                    }
                    if r.tw.durable_start_ts > stable {
                        removes.push(k.clone());
                    } else if r.tw.has_stop() && r.tw.durable_stop_ts > stable {
                        clears.push(k.clone());
                    }
                }
                (removes, clears)
            };
            removed += removes.len();
            cleared += clears.len();
            if dryrun || (removes.is_empty() && clears.is_empty()) {
                continue;
            }
            let mut rows = self.load_mut(&leaf)?;
            for k in &removes {
                rows.remove(k);
            }
            for k in &clears {
                if let Some(r) = rows.get_mut(k) {
                    r.tw.clear_stop();
                }
            }
            self.touched(&leaf, &rows);
        }
        if !dryrun {
            Stats::add(&self.stats.hs_removed, removed as u64);
        }
        Ok((removed, cleared))
    }

    /// Write every leaf that changed since its last image and list them all
    /// for a checkpoint's history root. Empty leaves are left out.
    ///
    /// Returns the root entries and the number of leaves written.
    pub fn checkpoint(&self) -> Result<(Vec<HsRootEntry>, usize)> {
        let leaves = self.leaves.read();
        let mut entries = Vec::with_capacity(leaves.len());
        let mut written = 0;
        for (lower, leaf) in leaves.iter() {
            let slot = leaf.rows.read();
            let addr = match slot.as_ref() {
                Some(rows) if rows.is_empty() => continue,
                Some(rows) => {
                    let image = *leaf.image.lock();
                    match image {
                        Some(addr) if !leaf.is_dirty() => addr,
                        _ => {
                            let addr = self.write_image(rows)?;
                            *leaf.image.lock() = Some(addr);
                            leaf.dirty.store(false, Ordering::Release);
                            written += 1;
                            addr
                        }
                    }
                }
                None => (*leaf.image.lock())
                    .ok_or_else(|| LapisError::Corruption("evicted history leaf has no image".into()))?,
            };
            entries.push(HsRootEntry {
                lower: lower.clone(),
                addr,
                rows: leaf.len.load(Ordering::Acquire) as u64,
            });
        }
        Ok((entries, written))
    }

    /// Evict up to `limit` resident leaves, starting from a random one.
    /// Dirty leaves are written first, holding `block_gc` shared until the
    /// leaf points at its new block. Busy leaves are skipped.
    ///
    /// Returns the number of leaves evicted.
    pub fn evict_leaves(&self, limit: usize, block_gc: &RwLock<()>) -> Result<usize> {
        let all: Vec<Arc<Leaf>> = self.leaves.read().values().cloned().collect();
        if all.is_empty() || limit == 0 {
            return Ok(0);
        }
        let start = rand::thread_rng().gen_range(0..all.len());
        let mut evicted = 0;
        let mut freed = 0;
        for i in 0..all.len() {
            if evicted == limit {
                break;
            }
            let leaf = &all[(start + i) % all.len()];
            let Some(mut slot) = leaf.rows.try_write() else {
                continue;
            };
            let Some(rows) = slot.as_ref() else {
                continue;
            };
            if rows.is_empty() {
                continue;
            }
            if leaf.is_dirty() || leaf.image.lock().is_none() {
                let _gc = block_gc.read();
                let addr = self.write_image(rows)?;
                *leaf.image.lock() = Some(addr);
                leaf.dirty.store(false, Ordering::Release);
            }
            *slot = None;
            let mem = leaf.mem.swap(0, Ordering::AcqRel);
            self.sub_bytes(mem);
            freed += mem;
            evicted += 1;
        }
        if evicted > 0 {
            Stats::add(&self.stats.hs_leaf_evicted, evicted as u64);
            trace!(target: "lapis::history", leaves = evicted, freed, "history leaves evicted");
        }
        Ok(evicted)
    }
}

/// Cleanup of one leaf's rows; see [`HistoryStore::cleanup_obsolete`].
fn cleanup_leaf(rows: &mut HsRows, global: &TxnGlobal) -> Result<(usize, usize)> {
    let mut removes: Vec<HsKey> = Vec::new();
    let mut rebases: Vec<(HsKey, Value)> = Vec::new();

    let mut current: Option<(TableId, Key)> = None;
    let mut prev_value: Option<Value> = None;
    let mut prev_removed = false;

    for (k, r) in rows.iter() {
        let same = current.as_ref().is_some_and(|(t, key)| k.same_key(*t, key));
        if !same {
            current = Some((k.table, k.key.clone()));
            prev_value = None;
            prev_removed = false;
        }
        let value = match &r.value {
            HsValue::Full(v) => Some(v.clone()),
            HsValue::Delta(m) => prev_value.as_ref().map(|base| m.apply(base)),
        };
        let obsolete =
            r.tw.has_stop() && global.visible_all(r.tw.stop_txn, r.tw.stop_ts.max(r.tw.durable_stop_ts));
        if obsolete {
            removes.push(k.clone());
            prev_removed = true;
        } else {
            if prev_removed && r.value.is_delta() {
                match &value {
                    Some(v) => rebases.push((k.clone(), v.clone())),
                    None => {
                        return Err(LapisError::Corruption(format!(
                            "history delta for table {} has no base",
                            k.table
                        )))
                    }
                }
            }
            prev_removed = false;
        }
        prev_value = value;
    }

    for k in &removes {
        rows.remove(k);
    }
    for (k, v) in &rebases {
        if let Some(r) = rows.get_mut(k) {
            r.value = HsValue::Full(v.clone());
        }
    }
    Ok((removes.len(), rebases.len()))
}

/// History of one key in the live store.
pub struct HsView<'a> {
    hs: &'a HistoryStore,
    table: TableId,
    key: &'a [u8],
}

impl HistoryLookup for HsView<'_> {
    fn newest_visible(&self, ctx: &ReadContext<'_>) -> Result<Option<Value>> {
        let found = self
            .hs
            .with_key(self.table, self.key, |rows| newest_visible_in(rows, self.table, self.key, ctx))?;
        if found.is_some() {
            Stats::incr(&self.hs.stats.hs_read);
        }
        Ok(found)
    }

    fn newest_full(&self) -> Result<Option<Value>> {
        self.hs
            .with_key(self.table, self.key, |rows| newest_full_in(rows, self.table, self.key))
    }
}

/// History of one key inside a frozen set of rows, such as the history
/// recorded by a checkpoint.
pub struct HsRowsView<'a> {
    pub(crate) rows: &'a HsRows,
    pub(crate) table: TableId,
    pub(crate) key: &'a [u8],
}

impl HistoryLookup for HsRowsView<'_> {
    fn newest_visible(&self, ctx: &ReadContext<'_>) -> Result<Option<Value>> {
        newest_visible_in(self.rows, self.table, self.key, ctx)
    }

    fn newest_full(&self) -> Result<Option<Value>> {
        newest_full_in(self.rows, self.table, self.key)
    }
}

pub(crate) fn newest_visible_in(
    rows: &HsRows,
    table: TableId,
    key: &[u8],
    ctx: &ReadContext<'_>,
) -> Result<Option<Value>> {
    let upper = HsKey::new(table, key.to_vec(), ctx.read_ts, crate::types::TxnId::MAX);
    for (k, r) in rows.range(HsKey::first_of(table, key)..=upper).rev() {
        if !ctx.tw_start_visible(&r.tw) {
            continue;
        }
        if ctx.tw_stop_visible(&r.tw) {
            return Ok(None);
        }
        return materialize(rows, k, r).map(Some);
    }
    Ok(None)
}

pub(crate) fn newest_full_in(rows: &HsRows, table: TableId, key: &[u8]) -> Result<Option<Value>> {
    match rows
        .range(HsKey::first_of(table, key)..=HsKey::last_of(table, key))
        .next_back()
    {
        Some((k, r)) => materialize(rows, k, r).map(Some),
        None => Ok(None),
    }
}

/// Full value of a row: deltas are collected walking to older rows of the
/// same key until a full value, then replayed oldest-first.
fn materialize(rows: &HsRows, at: &HsKey, record: &HsRecord) -> Result<Value> {
    let first = match &record.value {
        HsValue::Full(v) => return Ok(v.clone()),
        HsValue::Delta(m) => m,
    };
    let mut deltas: Vec<&Modify> = vec![first];
    for (_, older) in rows.range(HsKey::first_of(at.table, &at.key)..at.clone()).rev() {
        match &older.value {
            HsValue::Full(base) => return Ok(Modify::apply_all(base, deltas.into_iter().rev())),
            HsValue::Delta(m) => deltas.push(m),
        }
    }
    Err(LapisError::Corruption(format!(
        "history delta chain for table {} at {} has no full base",
        at.table,
        crate::types::ts_hex(at.start_ts)
    )))
}
