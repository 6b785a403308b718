//! strata-kv: the ordered key-value layer of strata.
//!
//! This crate defines the KV contract the sync pipeline runs against and the
//! two stores the repository ships:
//!
//! - **Contract** ([`kv`]): read/write transactions, ordered cursors,
//!   dup-sort cursors, bucket migration and per-bucket sequences, all behind
//!   object-safe traits so production engines can be plugged in.
//! - **In-memory engine** ([`mem`]): the reference backend. Single writer,
//!   snapshot-isolated readers via an atomically swapped committed state.
//! - **Snapshot overlay** ([`overlay`]): composes one mutable hot store with
//!   up to three immutable snapshot stores (headers, bodies, state) into a
//!   single logical KV. Reads merge hot-over-snapshot, deletes become
//!   tombstones, and merged cursors preserve total ordering.
//!
//! ```text
//! ┌─────────────────────────────────────────────┐
//! │               SnapshotKv                    │
//! │   (routing, tombstones, merged cursors)     │
//! └───────┬──────────┬──────────┬───────────────┘
//!         │ hot (rw) │ headers  │ bodies │ state
//! ┌───────▼──┐  ┌────▼───┐ ┌────▼───┐ ┌──▼─────┐
//! │  MemKv   │  │ ro KV  │ │ ro KV  │ │ ro KV  │
//! └──────────┘  └────────┘ └────────┘ └────────┘
//! ```

#![deny(unsafe_code)]
#![warn(clippy::all)]

pub mod buckets;
pub mod error;
pub mod kv;
pub mod mem;
pub mod overlay;
pub mod storage_mode;

pub use buckets::{SnapshotTag, TOMBSTONE};
pub use error::{Error, Result};
pub use kv::{Cursor, DupCursor, KvPair, KvStore, KvStoreExt, RwTx, Tx, TxExt};
pub use mem::MemKv;
pub use overlay::{SnapshotKv, SnapshotKvBuilder};
pub use storage_mode::StorageMode;
