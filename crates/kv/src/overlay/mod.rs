//! Snapshot-overlay KV.
//!
//! [`SnapshotKv`] composes one mutable hot store with up to three immutable
//! read-only snapshot stores (headers, bodies, state) and presents them as a
//! single logical KV. All writes land in the hot store; deletes in
//! snapshot-routed buckets become tombstones so a later read or iteration
//! suppresses the snapshot value. Snapshot stores can be hot-swapped while
//! the overlay is live; the old store is closed on a background thread once
//! the swap is published, and in-flight transactions keep it alive through
//! their own references.

pub mod merge;

use std::sync::atomic::{AtomicBool, Ordering as AtomicOrdering};
use std::sync::{mpsc, Arc};

use parking_lot::RwLock;

use crate::buckets::{self, SnapshotTag, TOMBSTONE};
use crate::error::{Error, Result};
use crate::kv::{Cursor, DupCursor, KvStore, RwTx, Tx};
use merge::MergedCursor;

/// Builder for [`SnapshotKv`].
pub struct SnapshotKvBuilder {
    hot: Arc<dyn KvStore>,
    headers: Option<Arc<dyn KvStore>>,
    bodies: Option<Arc<dyn KvStore>>,
    state: Option<Arc<dyn KvStore>>,
}

impl SnapshotKvBuilder {
    /// Start a builder around the mutable hot store.
    pub fn new(hot: Arc<dyn KvStore>) -> Self {
        Self { hot, headers: None, bodies: None, state: None }
    }

    /// Attach a read-only headers snapshot.
    pub fn headers_snapshot(mut self, kv: Arc<dyn KvStore>) -> Self {
        self.headers = Some(kv);
        self
    }

    /// Attach a read-only bodies snapshot.
    pub fn bodies_snapshot(mut self, kv: Arc<dyn KvStore>) -> Self {
        self.bodies = Some(kv);
        self
    }

    /// Attach a read-only state snapshot.
    pub fn state_snapshot(mut self, kv: Arc<dyn KvStore>) -> Self {
        self.state = Some(kv);
        self
    }

    /// Build the overlay.
    pub fn open(self) -> SnapshotKv {
        SnapshotKv {
            hot: self.hot,
            snapshots: RwLock::new(Snapshots {
                headers: self.headers,
                bodies: self.bodies,
                state: self.state,
            }),
            closed: AtomicBool::new(false),
        }
    }
}

struct Snapshots {
    headers: Option<Arc<dyn KvStore>>,
    bodies: Option<Arc<dyn KvStore>>,
    state: Option<Arc<dyn KvStore>>,
}

impl Snapshots {
    fn slot(&self, tag: SnapshotTag) -> &Option<Arc<dyn KvStore>> {
        match tag {
            SnapshotTag::Headers => &self.headers,
            SnapshotTag::Bodies => &self.bodies,
            SnapshotTag::State => &self.state,
        }
    }

    fn slot_mut(&mut self, tag: SnapshotTag) -> &mut Option<Arc<dyn KvStore>> {
        match tag {
            SnapshotTag::Headers => &mut self.headers,
            SnapshotTag::Bodies => &mut self.bodies,
            SnapshotTag::State => &mut self.state,
        }
    }
}

/// The snapshot-overlay store.
pub struct SnapshotKv {
    hot: Arc<dyn KvStore>,
    snapshots: RwLock<Snapshots>,
    closed: AtomicBool,
}

impl SnapshotKv {
    /// The mutable hot store.
    pub fn hot(&self) -> Arc<dyn KvStore> {
        Arc::clone(&self.hot)
    }

    /// The currently configured snapshot for a tag, if any.
    pub fn snapshot(&self, tag: SnapshotTag) -> Option<Arc<dyn KvStore>> {
        self.snapshots.read().slot(tag).clone()
    }

    /// Replace the snapshot store for `tag`.
    ///
    /// The swap is published under the overlay lock, so no new transaction
    /// can observe a half-updated set. The previous store is closed on a
    /// background thread which then signals `done`; transactions opened
    /// before the swap keep the old store alive through their own
    /// references.
    pub fn update_snapshots(
        &self,
        tag: SnapshotTag,
        new: Arc<dyn KvStore>,
        done: mpsc::Sender<()>,
    ) {
        let old = {
            let mut snapshots = self.snapshots.write();
            std::mem::replace(snapshots.slot_mut(tag), Some(new))
        };
        std::thread::spawn(move || {
            if let Some(old) = old {
                old.close();
                drop(old);
            }
            let _ = done.send(());
            tracing::info!(tag = %tag, "old snapshot closed");
        });
    }

    /// Open read transactions on every configured snapshot.
    fn snapshot_txs(&self) -> Result<SnapTxs> {
        let snapshots = self.snapshots.read();
        let mut txs = SnapTxs::default();
        for (tag, slot) in [
            (SnapshotTag::Headers, &snapshots.headers),
            (SnapshotTag::Bodies, &snapshots.bodies),
            (SnapshotTag::State, &snapshots.state),
        ] {
            if let Some(store) = slot {
                let tx = store.begin_ro()?;
                txs.set(tag, tx, Arc::clone(store));
            }
        }
        Ok(txs)
    }

    fn check_open(&self) -> Result<()> {
        if self.closed.load(AtomicOrdering::Acquire) {
            return Err(Error::StoreClosed);
        }
        Ok(())
    }
}

impl KvStore for SnapshotKv {
    fn begin_ro(&self) -> Result<Box<dyn Tx>> {
        self.check_open()?;
        let hot = self.hot.begin_ro()?;
        let snaps = self.snapshot_txs()?;
        Ok(Box::new(SnapshotRoTx { hot, snaps }))
    }

    fn begin_rw(&self) -> Result<Box<dyn RwTx>> {
        self.check_open()?;
        let hot = self.hot.begin_rw()?;
        let snaps = self.snapshot_txs()?;
        Ok(Box::new(SnapshotRwTx { hot, snaps }))
    }

    fn close(&self) {
        if self.closed.swap(true, AtomicOrdering::AcqRel) {
            return;
        }
        self.hot.close();
        let snapshots = self.snapshots.read();
        for slot in [&snapshots.headers, &snapshots.bodies, &snapshots.state] {
            if let Some(store) = slot {
                store.close();
            }
        }
    }
}

/// Read transactions on the snapshot stores, plus owning references that
/// keep a swapped-out store alive for this transaction's lifetime.
#[derive(Default)]
struct SnapTxs {
    headers: Option<Box<dyn Tx>>,
    bodies: Option<Box<dyn Tx>>,
    state: Option<Box<dyn Tx>>,
    /// Keep-alive guards; never read.
    _stores: Vec<Arc<dyn KvStore>>,
}

impl SnapTxs {
    fn set(&mut self, tag: SnapshotTag, tx: Box<dyn Tx>, store: Arc<dyn KvStore>) {
        match tag {
            SnapshotTag::Headers => self.headers = Some(tx),
            SnapshotTag::Bodies => self.bodies = Some(tx),
            SnapshotTag::State => self.state = Some(tx),
        }
        self._stores.push(store);
    }

    /// The snapshot transaction serving `bucket`, if the bucket is routed
    /// and its snapshot is configured.
    fn route(&self, bucket: &str) -> Option<&dyn Tx> {
        let tx = match buckets::snapshot_tag(bucket)? {
            SnapshotTag::Headers => self.headers.as_ref()?,
            SnapshotTag::Bodies => self.bodies.as_ref()?,
            SnapshotTag::State => self.state.as_ref()?,
        };
        Some(tx.as_ref())
    }

    fn rollback(self) {
        if let Some(tx) = self.headers {
            tx.rollback();
        }
        if let Some(tx) = self.bodies {
            tx.rollback();
        }
        if let Some(tx) = self.state {
            tx.rollback();
        }
    }
}

/// Hot-over-snapshot point read.
fn overlay_get(hot: &dyn Tx, snaps: &SnapTxs, bucket: &str, key: &[u8]) -> Result<Option<Vec<u8>>> {
    match hot.get(bucket, key)? {
        Some(v) if v == TOMBSTONE && buckets::snapshot_tag(bucket).is_some() => Ok(None),
        Some(v) => Ok(Some(v)),
        None => match snaps.route(bucket) {
            Some(snap) => match snap.get(bucket, key)? {
                Some(v) if v == TOMBSTONE => Ok(None),
                other => Ok(other),
            },
            None => Ok(None),
        },
    }
}

fn overlay_cursor<'tx>(
    hot: &'tx dyn Tx,
    snaps: &'tx SnapTxs,
    bucket: &str,
) -> Result<Box<dyn Cursor + 'tx>> {
    match snaps.route(bucket) {
        Some(snap) => {
            let hot_cursor = hot.cursor(bucket)?;
            let snap_cursor = snap.cursor(bucket)?;
            Ok(Box::new(MergedCursor::new(hot_cursor, snap_cursor)))
        },
        None => hot.cursor(bucket),
    }
}

fn overlay_cursor_dup<'tx>(
    hot: &'tx dyn Tx,
    snaps: &'tx SnapTxs,
    bucket: &str,
) -> Result<Box<dyn DupCursor + 'tx>> {
    match snaps.route(bucket) {
        Some(snap) => {
            let hot_cursor = hot.cursor_dup(bucket)?;
            let snap_cursor = snap.cursor_dup(bucket)?;
            Ok(Box::new(MergedCursor::new(hot_cursor, snap_cursor)))
        },
        None => hot.cursor_dup(bucket),
    }
}

/// A composite read-only transaction.
struct SnapshotRoTx {
    hot: Box<dyn Tx>,
    snaps: SnapTxs,
}

impl Tx for SnapshotRoTx {
    fn get(&self, bucket: &str, key: &[u8]) -> Result<Option<Vec<u8>>> {
        overlay_get(self.hot.as_ref(), &self.snaps, bucket, key)
    }

    fn has(&self, bucket: &str, key: &[u8]) -> Result<bool> {
        Ok(self.get(bucket, key)?.is_some())
    }

    fn cursor<'tx>(&'tx self, bucket: &str) -> Result<Box<dyn Cursor + 'tx>> {
        overlay_cursor(self.hot.as_ref(), &self.snaps, bucket)
    }

    fn cursor_dup<'tx>(&'tx self, bucket: &str) -> Result<Box<dyn DupCursor + 'tx>> {
        overlay_cursor_dup(self.hot.as_ref(), &self.snaps, bucket)
    }

    fn read_sequence(&self, bucket: &str) -> Result<u64> {
        self.hot.read_sequence(bucket)
    }

    fn bucket_exists(&self, bucket: &str) -> bool {
        self.hot.bucket_exists(bucket)
    }

    fn list_buckets(&self) -> Vec<String> {
        self.hot.list_buckets()
    }

    fn rollback(self: Box<Self>) {
        self.hot.rollback();
        self.snaps.rollback();
    }
}

/// A composite read-write transaction: writes go to hot, snapshot readers
/// are rolled back on commit.
struct SnapshotRwTx {
    hot: Box<dyn RwTx>,
    snaps: SnapTxs,
}

impl Tx for SnapshotRwTx {
    fn get(&self, bucket: &str, key: &[u8]) -> Result<Option<Vec<u8>>> {
        overlay_get(&*self.hot, &self.snaps, bucket, key)
    }

    fn has(&self, bucket: &str, key: &[u8]) -> Result<bool> {
        Ok(self.get(bucket, key)?.is_some())
    }

    fn cursor<'tx>(&'tx self, bucket: &str) -> Result<Box<dyn Cursor + 'tx>> {
        overlay_cursor(&*self.hot, &self.snaps, bucket)
    }

    fn cursor_dup<'tx>(&'tx self, bucket: &str) -> Result<Box<dyn DupCursor + 'tx>> {
        overlay_cursor_dup(&*self.hot, &self.snaps, bucket)
    }

    fn read_sequence(&self, bucket: &str) -> Result<u64> {
        self.hot.read_sequence(bucket)
    }

    fn bucket_exists(&self, bucket: &str) -> bool {
        self.hot.bucket_exists(bucket)
    }

    fn list_buckets(&self) -> Vec<String> {
        self.hot.list_buckets()
    }

    fn rollback(self: Box<Self>) {
        self.hot.rollback();
        self.snaps.rollback();
    }
}

impl RwTx for SnapshotRwTx {
    fn put(&self, bucket: &str, key: &[u8], value: &[u8]) -> Result<()> {
        self.hot.put(bucket, key, value)
    }

    /// Append to the hot store. The key is validated against the hot tail
    /// only; appending a key at or below a snapshot's maximum is the
    /// caller's responsibility to avoid.
    fn append(&self, bucket: &str, key: &[u8], value: &[u8]) -> Result<()> {
        self.hot.append(bucket, key, value)
    }

    fn append_dup(&self, bucket: &str, key: &[u8], value: &[u8]) -> Result<()> {
        self.hot.append_dup(bucket, key, value)
    }

    fn delete(&self, bucket: &str, key: &[u8]) -> Result<()> {
        // Not a true delete for routed buckets: the tombstone shadows the
        // snapshot value until prune removes both.
        if buckets::snapshot_tag(bucket).is_some() {
            self.hot.put(bucket, key, TOMBSTONE)
        } else {
            self.hot.delete(bucket, key)
        }
    }

    fn delete_dup(&self, bucket: &str, key: &[u8], value: &[u8]) -> Result<()> {
        self.hot.delete_dup(bucket, key, value)
    }

    fn create_bucket(&self, bucket: &str) -> Result<()> {
        self.hot.create_bucket(bucket)
    }

    fn drop_bucket(&self, bucket: &str) -> Result<()> {
        self.hot.drop_bucket(bucket)
    }

    fn clear_bucket(&self, bucket: &str) -> Result<()> {
        self.hot.clear_bucket(bucket)
    }

    fn increment_sequence(&self, bucket: &str, amount: u64) -> Result<u64> {
        self.hot.increment_sequence(bucket, amount)
    }

    fn commit(self: Box<Self>) -> Result<()> {
        let out = self.hot.commit();
        self.snaps.rollback();
        out
    }
}
