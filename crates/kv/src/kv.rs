//! The KV contract.
//!
//! Object-safe traits describing what the sync pipeline requires from a
//! store: serialized writers, snapshot-isolated readers, ordered cursors
//! with dup-sort variants, bucket migration and per-bucket sequences.
//!
//! Production engines implement [`KvStore`]; the in-memory engine in
//! [`crate::mem`] is the reference implementation, and
//! [`crate::overlay::SnapshotKv`] composes several stores behind the same
//! traits.

use crate::error::Result;

/// An owned key/value pair as returned by cursors.
pub type KvPair = (Vec<u8>, Vec<u8>);

/// A key-value store that can open transactions.
///
/// Read transactions observe a consistent snapshot taken at `begin_ro`;
/// writers are serialized against each other.
pub trait KvStore: Send + Sync {
    /// Begin a read-only transaction.
    fn begin_ro(&self) -> Result<Box<dyn Tx>>;

    /// Begin a read-write transaction. Blocks until any active writer
    /// finishes.
    fn begin_rw(&self) -> Result<Box<dyn RwTx>>;

    /// Close the store. Idempotent; in-flight transactions keep their data
    /// alive, but no new transactions can be started.
    fn close(&self);
}

/// A read-only transaction.
pub trait Tx: Send {
    /// Point lookup. Returns `None` for a missing key.
    fn get(&self, bucket: &str, key: &[u8]) -> Result<Option<Vec<u8>>>;

    /// Existence check.
    fn has(&self, bucket: &str, key: &[u8]) -> Result<bool>;

    /// Open an ordered cursor over a bucket. For dup-sorted buckets the
    /// cursor iterates every `(key, value)` pair in order.
    fn cursor<'tx>(&'tx self, bucket: &str) -> Result<Box<dyn Cursor + 'tx>>;

    /// Open a dup-sort cursor. Fails with [`crate::Error::NotDupSorted`] for
    /// plain buckets.
    fn cursor_dup<'tx>(&'tx self, bucket: &str) -> Result<Box<dyn DupCursor + 'tx>>;

    /// Read the current value of a bucket's sequence counter.
    fn read_sequence(&self, bucket: &str) -> Result<u64>;

    /// Whether the bucket exists.
    fn bucket_exists(&self, bucket: &str) -> bool;

    /// Names of all existing buckets.
    fn list_buckets(&self) -> Vec<String>;

    /// Roll the transaction back, releasing its snapshot. Dropping the
    /// transaction has the same effect.
    fn rollback(self: Box<Self>);
}

/// A read-write transaction.
///
/// All mutation methods take `&self`: implementations use interior
/// mutability so cursors and writes can interleave, mirroring how the
/// underlying engines behave.
pub trait RwTx: Tx {
    /// Insert or overwrite a key.
    fn put(&self, bucket: &str, key: &[u8], value: &[u8]) -> Result<()>;

    /// Insert a key that the caller guarantees sorts strictly after every
    /// existing key in the bucket. Fails with
    /// [`crate::Error::NotAppendable`] otherwise.
    fn append(&self, bucket: &str, key: &[u8], value: &[u8]) -> Result<()>;

    /// Append a duplicate value under `key` in a dup-sorted bucket. The key
    /// must sort at or after the bucket tail.
    fn append_dup(&self, bucket: &str, key: &[u8], value: &[u8]) -> Result<()>;

    /// Delete a key (all duplicates for dup-sorted buckets). Deleting a
    /// missing key is a no-op.
    fn delete(&self, bucket: &str, key: &[u8]) -> Result<()>;

    /// Delete a single duplicate value from a dup-sorted bucket.
    fn delete_dup(&self, bucket: &str, key: &[u8], value: &[u8]) -> Result<()>;

    /// Create a bucket. Creating an existing bucket is a no-op.
    fn create_bucket(&self, bucket: &str) -> Result<()>;

    /// Drop a bucket and all its contents.
    fn drop_bucket(&self, bucket: &str) -> Result<()>;

    /// Remove every entry from a bucket, keeping the bucket itself.
    fn clear_bucket(&self, bucket: &str) -> Result<()>;

    /// Atomically add `amount` to the bucket's sequence counter, returning
    /// the value before the increment.
    fn increment_sequence(&self, bucket: &str, amount: u64) -> Result<u64>;

    /// Commit the transaction, atomically publishing all writes.
    fn commit(self: Box<Self>) -> Result<()>;
}

/// An ordered cursor over one bucket.
///
/// A fresh cursor is unpositioned: `current` returns `None` until a
/// positioning call succeeds.
pub trait Cursor {
    /// Position at the first (smallest) key.
    fn first(&mut self) -> Result<Option<KvPair>>;

    /// Position at the last (largest) key.
    fn last(&mut self) -> Result<Option<KvPair>>;

    /// Position at the smallest key `>= key`.
    fn seek(&mut self, key: &[u8]) -> Result<Option<KvPair>>;

    /// Position at `key` exactly, or return `None`.
    fn seek_exact(&mut self, key: &[u8]) -> Result<Option<KvPair>>;

    /// The entry at the current position, if any.
    fn current(&mut self) -> Result<Option<KvPair>>;

    /// Advance to the next entry.
    fn next(&mut self) -> Result<Option<KvPair>>;

    /// Step back to the previous entry.
    fn prev(&mut self) -> Result<Option<KvPair>>;
}

/// A cursor over a dup-sorted bucket.
pub trait DupCursor: Cursor {
    /// Position at `(key, value)` exactly.
    fn seek_both_exact(&mut self, key: &[u8], value: &[u8]) -> Result<Option<KvPair>>;

    /// Position at `key` and the smallest duplicate `>= value`, returning
    /// that duplicate.
    fn seek_both_range(&mut self, key: &[u8], value: &[u8]) -> Result<Option<Vec<u8>>>;

    /// First duplicate of the current key.
    fn first_dup(&mut self) -> Result<Option<Vec<u8>>>;

    /// Next duplicate of the current key.
    fn next_dup(&mut self) -> Result<Option<KvPair>>;

    /// First duplicate of the next key.
    fn next_no_dup(&mut self) -> Result<Option<KvPair>>;

    /// Last duplicate of the current key.
    fn last_dup(&mut self) -> Result<Option<Vec<u8>>>;

    /// Number of duplicates of the current key.
    fn count_duplicates(&mut self) -> Result<u64>;
}

/// Closure-driven transaction helpers, the `view`/`update` idiom.
///
/// Generic over the caller's error type so downstream crates can run their
/// own `Result`s through a transaction, as long as KV errors convert into
/// them.
pub trait KvStoreExt: KvStore {
    /// Run `f` inside a read-only transaction, rolling back afterwards.
    fn view<R, E>(&self, f: impl FnOnce(&dyn Tx) -> std::result::Result<R, E>) -> std::result::Result<R, E>
    where
        E: From<crate::Error>,
    {
        let tx = self.begin_ro().map_err(E::from)?;
        let out = f(tx.as_ref());
        tx.rollback();
        out
    }

    /// Run `f` inside a read-write transaction; commit on success, roll back
    /// on error.
    fn update<R, E>(&self, f: impl FnOnce(&dyn RwTx) -> std::result::Result<R, E>) -> std::result::Result<R, E>
    where
        E: From<crate::Error>,
    {
        let tx = self.begin_rw().map_err(E::from)?;
        match f(tx.as_ref()) {
            Ok(out) => {
                tx.commit().map_err(E::from)?;
                Ok(out)
            },
            Err(e) => {
                tx.rollback();
                Err(e)
            },
        }
    }
}

impl<S: KvStore + ?Sized> KvStoreExt for S {}

/// Iteration helpers over transactions.
pub trait TxExt: Tx {
    /// Walk entries starting at `from` (inclusive), calling `walker` for
    /// each. The walk stops when `walker` returns `false`.
    fn for_each(
        &self,
        bucket: &str,
        from: &[u8],
        walker: &mut dyn FnMut(&[u8], &[u8]) -> Result<bool>,
    ) -> Result<()> {
        let mut cursor = self.cursor(bucket)?;
        let mut entry = cursor.seek(from)?;
        while let Some((k, v)) = entry {
            if !walker(&k, &v)? {
                break;
            }
            entry = cursor.next()?;
        }
        Ok(())
    }

    /// Walk entries whose key starts with `prefix`.
    fn for_prefix(
        &self,
        bucket: &str,
        prefix: &[u8],
        walker: &mut dyn FnMut(&[u8], &[u8]) -> Result<bool>,
    ) -> Result<()> {
        self.for_each(bucket, prefix, &mut |k, v| {
            if !k.starts_with(prefix) {
                return Ok(false);
            }
            walker(k, v)
        })
    }
}

impl<T: Tx + ?Sized> TxExt for T {}
