//! In-memory KV engine.
//!
//! The reference backend for tests and tooling. Ordered buckets live in
//! `BTreeMap`s; the committed state is an immutable value behind an
//! [`ArcSwap`], so read transactions capture a consistent snapshot without
//! holding locks, and the single writer publishes its changes with one
//! atomic pointer swap. Buckets are copied on first write within a
//! transaction (whole-bucket copy-on-write).

use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::sync::atomic::{AtomicBool, Ordering as AtomicOrdering};
use std::sync::Arc;

use arc_swap::ArcSwap;
use parking_lot::{Condvar, Mutex};

use crate::buckets;
use crate::error::{Error, Result};
use crate::kv::{Cursor, DupCursor, KvPair, KvStore, RwTx, Tx};

/// Contents of one bucket.
#[derive(Debug, Clone)]
enum BucketData {
    /// One value per key.
    Plain(BTreeMap<Vec<u8>, Vec<u8>>),
    /// Multiple sorted values per key.
    Dup(BTreeMap<Vec<u8>, BTreeSet<Vec<u8>>>),
}

impl BucketData {
    fn empty_for(bucket: &str) -> Self {
        if buckets::is_dup_sorted(bucket) {
            Self::Dup(BTreeMap::new())
        } else {
            Self::Plain(BTreeMap::new())
        }
    }

    /// Largest key currently in the bucket.
    fn last_key(&self) -> Option<&[u8]> {
        match self {
            Self::Plain(m) => m.keys().next_back().map(|k| k.as_slice()),
            Self::Dup(m) => m.keys().next_back().map(|k| k.as_slice()),
        }
    }
}

/// The committed database state. Immutable once published.
#[derive(Debug, Default)]
struct MemState {
    buckets: HashMap<String, Arc<BucketData>>,
    sequences: HashMap<String, u64>,
}

struct MemInner {
    committed: ArcSwap<MemState>,
    /// Writer gate: true while a write transaction is active.
    writer_active: Mutex<bool>,
    writer_cv: Condvar,
    closed: AtomicBool,
}

impl MemInner {
    fn acquire_writer(&self) {
        let mut active = self.writer_active.lock();
        while *active {
            self.writer_cv.wait(&mut active);
        }
        *active = true;
    }

    fn release_writer(&self) {
        let mut active = self.writer_active.lock();
        *active = false;
        self.writer_cv.notify_one();
    }
}

/// In-memory KV store with the full pipeline schema pre-created.
#[derive(Clone)]
pub struct MemKv {
    inner: Arc<MemInner>,
}

impl MemKv {
    /// Create an empty store with every registered bucket.
    pub fn new() -> Self {
        let mut state = MemState::default();
        for bucket in buckets::ALL {
            state
                .buckets
                .insert((*bucket).to_string(), Arc::new(BucketData::empty_for(bucket)));
        }
        Self {
            inner: Arc::new(MemInner {
                committed: ArcSwap::from_pointee(state),
                writer_active: Mutex::new(false),
                writer_cv: Condvar::new(),
                closed: AtomicBool::new(false),
            }),
        }
    }

    fn check_open(&self) -> Result<()> {
        if self.inner.closed.load(AtomicOrdering::Acquire) {
            return Err(Error::StoreClosed);
        }
        Ok(())
    }
}

impl Default for MemKv {
    fn default() -> Self {
        Self::new()
    }
}

impl KvStore for MemKv {
    fn begin_ro(&self) -> Result<Box<dyn Tx>> {
        self.check_open()?;
        Ok(Box::new(MemRoTx { state: self.inner.committed.load_full() }))
    }

    fn begin_rw(&self) -> Result<Box<dyn RwTx>> {
        self.check_open()?;
        self.inner.acquire_writer();
        let base = self.inner.committed.load_full();
        Ok(Box::new(MemRwTx {
            inner: Arc::clone(&self.inner),
            base,
            pending: Mutex::new(Pending::default()),
            finished: AtomicBool::new(false),
        }))
    }

    fn close(&self) {
        self.inner.closed.store(true, AtomicOrdering::Release);
    }
}

// ---------------------------------------------------------------------------
// Read transaction
// ---------------------------------------------------------------------------

struct MemRoTx {
    state: Arc<MemState>,
}

impl MemRoTx {
    fn bucket(&self, bucket: &str) -> Result<Arc<BucketData>> {
        self.state
            .buckets
            .get(bucket)
            .cloned()
            .ok_or_else(|| Error::BucketNotFound { bucket: bucket.to_string() })
    }
}

impl Tx for MemRoTx {
    fn get(&self, bucket: &str, key: &[u8]) -> Result<Option<Vec<u8>>> {
        Ok(bucket_get(&*self.bucket(bucket)?, key))
    }

    fn has(&self, bucket: &str, key: &[u8]) -> Result<bool> {
        Ok(self.get(bucket, key)?.is_some())
    }

    fn cursor<'tx>(&'tx self, bucket: &str) -> Result<Box<dyn Cursor + 'tx>> {
        let data = self.bucket(bucket)?;
        Ok(Box::new(MemCursor { view: RoView(data), pos: CursorPos::Unset }))
    }

    fn cursor_dup<'tx>(&'tx self, bucket: &str) -> Result<Box<dyn DupCursor + 'tx>> {
        let data = self.bucket(bucket)?;
        if !matches!(*data, BucketData::Dup(_)) {
            return Err(Error::NotDupSorted { bucket: bucket.to_string() });
        }
        Ok(Box::new(MemCursor { view: RoView(data), pos: CursorPos::Unset }))
    }

    fn read_sequence(&self, bucket: &str) -> Result<u64> {
        Ok(self.state.sequences.get(bucket).copied().unwrap_or(0))
    }

    fn bucket_exists(&self, bucket: &str) -> bool {
        self.state.buckets.contains_key(bucket)
    }

    fn list_buckets(&self) -> Vec<String> {
        let mut names: Vec<String> = self.state.buckets.keys().cloned().collect();
        names.sort();
        names
    }

    fn rollback(self: Box<Self>) {}
}

// ---------------------------------------------------------------------------
// Write transaction
// ---------------------------------------------------------------------------

#[derive(Default)]
struct Pending {
    /// Buckets touched by this transaction. `None` marks a dropped bucket.
    buckets: HashMap<String, Option<BucketData>>,
    sequences: HashMap<String, u64>,
}

struct MemRwTx {
    inner: Arc<MemInner>,
    base: Arc<MemState>,
    pending: Mutex<Pending>,
    finished: AtomicBool,
}

impl MemRwTx {
    /// Run `f` against the transaction's view of a bucket. `None` means the
    /// bucket does not exist (never created, or dropped in this tx).
    fn with_bucket<R>(&self, bucket: &str, f: impl FnOnce(Option<&BucketData>) -> R) -> R {
        let pending = self.pending.lock();
        match pending.buckets.get(bucket) {
            Some(entry) => f(entry.as_ref()),
            None => f(self.base.buckets.get(bucket).map(|b| b.as_ref())),
        }
    }

    /// Run `f` against a mutable copy of the bucket, cloning it into the
    /// pending set on first touch.
    fn with_bucket_mut<R>(
        &self,
        bucket: &str,
        f: impl FnOnce(&mut BucketData) -> Result<R>,
    ) -> Result<R> {
        let mut pending = self.pending.lock();
        if !pending.buckets.contains_key(bucket) {
            let copied = self
                .base
                .buckets
                .get(bucket)
                .map(|b| (**b).clone())
                .ok_or_else(|| Error::BucketNotFound { bucket: bucket.to_string() })?;
            pending.buckets.insert(bucket.to_string(), Some(copied));
        }
        match pending.buckets.get_mut(bucket) {
            Some(Some(data)) => f(data),
            _ => Err(Error::BucketNotFound { bucket: bucket.to_string() }),
        }
    }

    fn finish(&self) -> bool {
        !self.finished.swap(true, AtomicOrdering::AcqRel)
    }
}

impl Drop for MemRwTx {
    fn drop(&mut self) {
        if self.finish() {
            self.inner.release_writer();
        }
    }
}

impl Tx for MemRwTx {
    fn get(&self, bucket: &str, key: &[u8]) -> Result<Option<Vec<u8>>> {
        self.with_bucket(bucket, |data| match data {
            Some(data) => Ok(bucket_get(data, key)),
            None => Err(Error::BucketNotFound { bucket: bucket.to_string() }),
        })
    }

    fn has(&self, bucket: &str, key: &[u8]) -> Result<bool> {
        Ok(self.get(bucket, key)?.is_some())
    }

    fn cursor<'tx>(&'tx self, bucket: &str) -> Result<Box<dyn Cursor + 'tx>> {
        self.with_bucket(bucket, |data| {
            if data.is_none() {
                return Err(Error::BucketNotFound { bucket: bucket.to_string() });
            }
            Ok(())
        })?;
        Ok(Box::new(MemCursor {
            view: RwView { tx: self, bucket: bucket.to_string() },
            pos: CursorPos::Unset,
        }))
    }

    fn cursor_dup<'tx>(&'tx self, bucket: &str) -> Result<Box<dyn DupCursor + 'tx>> {
        let dup = self.with_bucket(bucket, |data| match data {
            Some(data) => Ok(matches!(data, BucketData::Dup(_))),
            None => Err(Error::BucketNotFound { bucket: bucket.to_string() }),
        })?;
        if !dup {
            return Err(Error::NotDupSorted { bucket: bucket.to_string() });
        }
        Ok(Box::new(MemCursor {
            view: RwView { tx: self, bucket: bucket.to_string() },
            pos: CursorPos::Unset,
        }))
    }

    fn read_sequence(&self, bucket: &str) -> Result<u64> {
        let pending = self.pending.lock();
        Ok(pending
            .sequences
            .get(bucket)
            .or_else(|| self.base.sequences.get(bucket))
            .copied()
            .unwrap_or(0))
    }

    fn bucket_exists(&self, bucket: &str) -> bool {
        self.with_bucket(bucket, |data| data.is_some())
    }

    fn list_buckets(&self) -> Vec<String> {
        let pending = self.pending.lock();
        let mut names: Vec<String> = self
            .base
            .buckets
            .keys()
            .filter(|name| !matches!(pending.buckets.get(*name), Some(None)))
            .cloned()
            .collect();
        for (name, entry) in pending.buckets.iter() {
            if entry.is_some() && !names.contains(name) {
                names.push(name.clone());
            }
        }
        names.sort();
        names
    }

    fn rollback(self: Box<Self>) {
        // Drop releases the writer gate; pending changes are discarded.
    }
}

impl RwTx for MemRwTx {
    fn put(&self, bucket: &str, key: &[u8], value: &[u8]) -> Result<()> {
        self.with_bucket_mut(bucket, |data| {
            match data {
                BucketData::Plain(m) => {
                    m.insert(key.to_vec(), value.to_vec());
                },
                BucketData::Dup(m) => {
                    m.entry(key.to_vec()).or_default().insert(value.to_vec());
                },
            }
            Ok(())
        })
    }

    fn append(&self, bucket: &str, key: &[u8], value: &[u8]) -> Result<()> {
        self.with_bucket_mut(bucket, |data| {
            if let Some(last) = data.last_key() {
                if key <= last {
                    return Err(Error::NotAppendable { bucket: bucket.to_string() });
                }
            }
            match data {
                BucketData::Plain(m) => {
                    m.insert(key.to_vec(), value.to_vec());
                },
                BucketData::Dup(m) => {
                    m.entry(key.to_vec()).or_default().insert(value.to_vec());
                },
            }
            Ok(())
        })
    }

    fn append_dup(&self, bucket: &str, key: &[u8], value: &[u8]) -> Result<()> {
        self.with_bucket_mut(bucket, |data| {
            let m = match data {
                BucketData::Dup(m) => m,
                BucketData::Plain(_) => {
                    return Err(Error::NotDupSorted { bucket: bucket.to_string() })
                },
            };
            if let Some(last) = m.keys().next_back() {
                if key < last.as_slice() {
                    return Err(Error::NotAppendable { bucket: bucket.to_string() });
                }
                if key == last.as_slice() {
                    // Appending to the tail key: the duplicate must extend the set.
                    if let Some(max_dup) = m.get(last).and_then(|s| s.iter().next_back()) {
                        if value <= max_dup.as_slice() {
                            return Err(Error::NotAppendable { bucket: bucket.to_string() });
                        }
                    }
                }
            }
            m.entry(key.to_vec()).or_default().insert(value.to_vec());
            Ok(())
        })
    }

    fn delete(&self, bucket: &str, key: &[u8]) -> Result<()> {
        self.with_bucket_mut(bucket, |data| {
            match data {
                BucketData::Plain(m) => {
                    m.remove(key);
                },
                BucketData::Dup(m) => {
                    m.remove(key);
                },
            }
            Ok(())
        })
    }

    fn delete_dup(&self, bucket: &str, key: &[u8], value: &[u8]) -> Result<()> {
        self.with_bucket_mut(bucket, |data| {
            let m = match data {
                BucketData::Dup(m) => m,
                BucketData::Plain(_) => {
                    return Err(Error::NotDupSorted { bucket: bucket.to_string() })
                },
            };
            if let Some(set) = m.get_mut(key) {
                set.remove(value);
                if set.is_empty() {
                    m.remove(key);
                }
            }
            Ok(())
        })
    }

    fn create_bucket(&self, bucket: &str) -> Result<()> {
        let mut pending = self.pending.lock();
        let exists = match pending.buckets.get(bucket) {
            Some(entry) => entry.is_some(),
            None => self.base.buckets.contains_key(bucket),
        };
        if !exists {
            pending.buckets.insert(bucket.to_string(), Some(BucketData::empty_for(bucket)));
        }
        Ok(())
    }

    fn drop_bucket(&self, bucket: &str) -> Result<()> {
        let mut pending = self.pending.lock();
        pending.buckets.insert(bucket.to_string(), None);
        Ok(())
    }

    fn clear_bucket(&self, bucket: &str) -> Result<()> {
        let mut pending = self.pending.lock();
        pending.buckets.insert(bucket.to_string(), Some(BucketData::empty_for(bucket)));
        Ok(())
    }

    fn increment_sequence(&self, bucket: &str, amount: u64) -> Result<u64> {
        let mut pending = self.pending.lock();
        let current = pending
            .sequences
            .get(bucket)
            .or_else(|| self.base.sequences.get(bucket))
            .copied()
            .unwrap_or(0);
        pending.sequences.insert(bucket.to_string(), current + amount);
        Ok(current)
    }

    fn commit(self: Box<Self>) -> Result<()> {
        let mut new_state = MemState {
            buckets: self.base.buckets.clone(),
            sequences: self.base.sequences.clone(),
        };
        {
            let mut pending = self.pending.lock();
            for (name, entry) in pending.buckets.drain() {
                match entry {
                    Some(data) => {
                        new_state.buckets.insert(name, Arc::new(data));
                    },
                    None => {
                        new_state.buckets.remove(&name);
                    },
                }
            }
            for (name, seq) in pending.sequences.drain() {
                new_state.sequences.insert(name, seq);
            }
        }
        self.inner.committed.store(Arc::new(new_state));
        if self.finish() {
            self.inner.release_writer();
        }
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Cursors
// ---------------------------------------------------------------------------

fn bucket_get(data: &BucketData, key: &[u8]) -> Option<Vec<u8>> {
    match data {
        BucketData::Plain(m) => m.get(key).cloned(),
        BucketData::Dup(m) => m.get(key).and_then(|set| set.iter().next().cloned()),
    }
}

/// Cursor position. `At` records the last key (and duplicate) the cursor
/// was positioned on; the entry is re-resolved on each access so write
/// cursors observe same-transaction mutations.
#[derive(Debug, Clone)]
enum CursorPos {
    Unset,
    At { key: Vec<u8>, dup: Option<Vec<u8>> },
    BeforeStart,
    AfterEnd,
}

/// Access to a bucket's current contents.
trait BucketView {
    fn with<R>(&self, f: impl FnOnce(Option<&BucketData>) -> R) -> R;
}

/// Snapshot view: the bucket as of transaction start.
struct RoView(Arc<BucketData>);

impl BucketView for RoView {
    fn with<R>(&self, f: impl FnOnce(Option<&BucketData>) -> R) -> R {
        f(Some(&self.0))
    }
}

/// Live view through a write transaction's pending state.
struct RwView<'tx> {
    tx: &'tx MemRwTx,
    bucket: String,
}

impl BucketView for RwView<'_> {
    fn with<R>(&self, f: impl FnOnce(Option<&BucketData>) -> R) -> R {
        self.tx.with_bucket(&self.bucket, f)
    }
}

struct MemCursor<V> {
    view: V,
    pos: CursorPos,
}

impl<V: BucketView> MemCursor<V> {
    fn resolve(
        &mut self,
        f: impl FnOnce(&BucketData) -> Option<(Vec<u8>, Option<Vec<u8>>, Vec<u8>)>,
    ) -> Result<Option<KvPair>> {
        let hit = self.view.with(|data| data.and_then(f));
        match hit {
            Some((key, dup, value)) => {
                self.pos = CursorPos::At { key: key.clone(), dup };
                Ok(Some((key, value)))
            },
            None => Ok(None),
        }
    }
}

/// First `(key, dup, value)` at or after the given bounds.
fn entry_first(data: &BucketData) -> Option<(Vec<u8>, Option<Vec<u8>>, Vec<u8>)> {
    match data {
        BucketData::Plain(m) => m.iter().next().map(|(k, v)| (k.clone(), None, v.clone())),
        BucketData::Dup(m) => m.iter().next().and_then(|(k, set)| {
            set.iter().next().map(|d| (k.clone(), Some(d.clone()), d.clone()))
        }),
    }
}

fn entry_last(data: &BucketData) -> Option<(Vec<u8>, Option<Vec<u8>>, Vec<u8>)> {
    match data {
        BucketData::Plain(m) => m.iter().next_back().map(|(k, v)| (k.clone(), None, v.clone())),
        BucketData::Dup(m) => m.iter().next_back().and_then(|(k, set)| {
            set.iter().next_back().map(|d| (k.clone(), Some(d.clone()), d.clone()))
        }),
    }
}

fn entry_seek(data: &BucketData, key: &[u8]) -> Option<(Vec<u8>, Option<Vec<u8>>, Vec<u8>)> {
    match data {
        BucketData::Plain(m) => {
            m.range(key.to_vec()..).next().map(|(k, v)| (k.clone(), None, v.clone()))
        },
        BucketData::Dup(m) => m.range(key.to_vec()..).next().and_then(|(k, set)| {
            set.iter().next().map(|d| (k.clone(), Some(d.clone()), d.clone()))
        }),
    }
}

fn entry_after(
    data: &BucketData,
    key: &[u8],
    dup: Option<&[u8]>,
) -> Option<(Vec<u8>, Option<Vec<u8>>, Vec<u8>)> {
    use std::ops::Bound::{Excluded, Unbounded};
    match data {
        BucketData::Plain(m) => m
            .range::<Vec<u8>, _>((Excluded(key.to_vec()), Unbounded))
            .next()
            .map(|(k, v)| (k.clone(), None, v.clone())),
        BucketData::Dup(m) => {
            if let (Some(set), Some(dup)) = (m.get(key), dup) {
                if let Some(d) =
                    set.range::<Vec<u8>, _>((Excluded(dup.to_vec()), Unbounded)).next()
                {
                    return Some((key.to_vec(), Some(d.clone()), d.clone()));
                }
            }
            m.range::<Vec<u8>, _>((Excluded(key.to_vec()), Unbounded)).next().and_then(
                |(k, set)| set.iter().next().map(|d| (k.clone(), Some(d.clone()), d.clone())),
            )
        },
    }
}

fn entry_before(
    data: &BucketData,
    key: &[u8],
    dup: Option<&[u8]>,
) -> Option<(Vec<u8>, Option<Vec<u8>>, Vec<u8>)> {
    match data {
        BucketData::Plain(m) => m
            .range::<Vec<u8>, _>(..key.to_vec())
            .next_back()
            .map(|(k, v)| (k.clone(), None, v.clone())),
        BucketData::Dup(m) => {
            if let (Some(set), Some(dup)) = (m.get(key), dup) {
                if let Some(d) = set.range::<Vec<u8>, _>(..dup.to_vec()).next_back() {
                    return Some((key.to_vec(), Some(d.clone()), d.clone()));
                }
            }
            m.range::<Vec<u8>, _>(..key.to_vec()).next_back().and_then(|(k, set)| {
                set.iter().next_back().map(|d| (k.clone(), Some(d.clone()), d.clone()))
            })
        },
    }
}

fn entry_current(
    data: &BucketData,
    key: &[u8],
    dup: Option<&[u8]>,
) -> Option<(Vec<u8>, Option<Vec<u8>>, Vec<u8>)> {
    match data {
        BucketData::Plain(m) => m.get(key).map(|v| (key.to_vec(), None, v.clone())),
        BucketData::Dup(m) => {
            let set = m.get(key)?;
            let dup = dup?;
            if set.contains(dup) {
                Some((key.to_vec(), Some(dup.to_vec()), dup.to_vec()))
            } else {
                None
            }
        },
    }
}

impl<V: BucketView> Cursor for MemCursor<V> {
    fn first(&mut self) -> Result<Option<KvPair>> {
        let out = self.resolve(|data| entry_first(data))?;
        if out.is_none() {
            self.pos = CursorPos::BeforeStart;
        }
        Ok(out)
    }

    fn last(&mut self) -> Result<Option<KvPair>> {
        let out = self.resolve(|data| entry_last(data))?;
        if out.is_none() {
            self.pos = CursorPos::AfterEnd;
        }
        Ok(out)
    }

    fn seek(&mut self, key: &[u8]) -> Result<Option<KvPair>> {
        let out = self.resolve(|data| entry_seek(data, key))?;
        if out.is_none() {
            self.pos = CursorPos::AfterEnd;
        }
        Ok(out)
    }

    fn seek_exact(&mut self, key: &[u8]) -> Result<Option<KvPair>> {
        let out = self.resolve(|data| match data {
            BucketData::Plain(m) => m.get(key).map(|v| (key.to_vec(), None, v.clone())),
            BucketData::Dup(m) => m.get(key).and_then(|set| {
                set.iter().next().map(|d| (key.to_vec(), Some(d.clone()), d.clone()))
            }),
        })?;
        Ok(out)
    }

    fn current(&mut self) -> Result<Option<KvPair>> {
        let pos = self.pos.clone();
        let hit = self.view.with(|data| {
            data.and_then(|data| match &pos {
                CursorPos::At { key, dup } => entry_current(data, key, dup.as_deref()),
                _ => None,
            })
        });
        Ok(hit.map(|(k, _, v)| (k, v)))
    }

    fn next(&mut self) -> Result<Option<KvPair>> {
        match self.pos.clone() {
            CursorPos::Unset | CursorPos::BeforeStart => self.first(),
            CursorPos::AfterEnd => Ok(None),
            CursorPos::At { key, dup } => {
                let out = self.resolve(|data| entry_after(data, &key, dup.as_deref()))?;
                if out.is_none() {
                    self.pos = CursorPos::AfterEnd;
                }
                Ok(out)
            },
        }
    }

    fn prev(&mut self) -> Result<Option<KvPair>> {
        match self.pos.clone() {
            CursorPos::Unset | CursorPos::AfterEnd => self.last(),
            CursorPos::BeforeStart => Ok(None),
            CursorPos::At { key, dup } => {
                let out = self.resolve(|data| entry_before(data, &key, dup.as_deref()))?;
                if out.is_none() {
                    self.pos = CursorPos::BeforeStart;
                }
                Ok(out)
            },
        }
    }
}

impl<V: BucketView> DupCursor for MemCursor<V> {
    fn seek_both_exact(&mut self, key: &[u8], value: &[u8]) -> Result<Option<KvPair>> {
        self.resolve(|data| match data {
            BucketData::Dup(m) => m.get(key).and_then(|set| {
                set.contains(value).then(|| (key.to_vec(), Some(value.to_vec()), value.to_vec()))
            }),
            BucketData::Plain(_) => None,
        })
    }

    fn seek_both_range(&mut self, key: &[u8], value: &[u8]) -> Result<Option<Vec<u8>>> {
        let out = self.resolve(|data| match data {
            BucketData::Dup(m) => m.get(key).and_then(|set| {
                set.range(value.to_vec()..)
                    .next()
                    .map(|d| (key.to_vec(), Some(d.clone()), d.clone()))
            }),
            BucketData::Plain(_) => None,
        })?;
        Ok(out.map(|(_, v)| v))
    }

    fn first_dup(&mut self) -> Result<Option<Vec<u8>>> {
        let key = match &self.pos {
            CursorPos::At { key, .. } => key.clone(),
            _ => return Ok(None),
        };
        let out = self.resolve(|data| match data {
            BucketData::Dup(m) => m.get(&key).and_then(|set| {
                set.iter().next().map(|d| (key.clone(), Some(d.clone()), d.clone()))
            }),
            BucketData::Plain(_) => None,
        })?;
        Ok(out.map(|(_, v)| v))
    }

    fn next_dup(&mut self) -> Result<Option<KvPair>> {
        let (key, dup) = match &self.pos {
            CursorPos::At { key, dup } => (key.clone(), dup.clone()),
            _ => return Ok(None),
        };
        self.resolve(|data| match data {
            BucketData::Dup(m) => {
                use std::ops::Bound::{Excluded, Unbounded};
                let set = m.get(&key)?;
                let dup = dup?;
                set.range::<Vec<u8>, _>((Excluded(dup), Unbounded))
                    .next()
                    .map(|d| (key.clone(), Some(d.clone()), d.clone()))
            },
            BucketData::Plain(_) => None,
        })
    }

    fn next_no_dup(&mut self) -> Result<Option<KvPair>> {
        let key = match &self.pos {
            CursorPos::At { key, .. } => key.clone(),
            CursorPos::Unset | CursorPos::BeforeStart => return self.first(),
            CursorPos::AfterEnd => return Ok(None),
        };
        let out = self.resolve(|data| match data {
            BucketData::Dup(m) => {
                use std::ops::Bound::{Excluded, Unbounded};
                m.range::<Vec<u8>, _>((Excluded(key.clone()), Unbounded)).next().and_then(
                    |(k, set)| set.iter().next().map(|d| (k.clone(), Some(d.clone()), d.clone())),
                )
            },
            BucketData::Plain(_) => None,
        })?;
        if out.is_none() {
            self.pos = CursorPos::AfterEnd;
        }
        Ok(out)
    }

    fn last_dup(&mut self) -> Result<Option<Vec<u8>>> {
        let key = match &self.pos {
            CursorPos::At { key, .. } => key.clone(),
            _ => return Ok(None),
        };
        let out = self.resolve(|data| match data {
            BucketData::Dup(m) => m.get(&key).and_then(|set| {
                set.iter().next_back().map(|d| (key.clone(), Some(d.clone()), d.clone()))
            }),
            BucketData::Plain(_) => None,
        })?;
        Ok(out.map(|(_, v)| v))
    }

    fn count_duplicates(&mut self) -> Result<u64> {
        let key = match &self.pos {
            CursorPos::At { key, .. } => key.clone(),
            _ => return Ok(0),
        };
        Ok(self.view.with(|data| match data {
            Some(BucketData::Dup(m)) => m.get(&key).map(|set| set.len() as u64).unwrap_or(0),
            _ => 0,
        }))
    }
}
