//! Error types for the KV layer.

use std::io;

use snafu::Snafu;

/// Result type alias for KV operations.
pub type Result<T> = std::result::Result<T, Error>;

/// Errors that can occur in KV stores, transactions and cursors.
#[derive(Debug, Snafu)]
#[snafu(visibility(pub(crate)))]
pub enum Error {
    /// I/O error from an underlying storage engine.
    #[snafu(display("I/O error: {source}"))]
    Io {
        /// The underlying I/O error.
        source: io::Error,
    },

    /// The named bucket is not part of the schema.
    #[snafu(display("Bucket {bucket} not found"))]
    BucketNotFound {
        /// The missing bucket.
        bucket: String,
    },

    /// A dup-sort operation was issued against a plain bucket.
    #[snafu(display("Bucket {bucket} is not dup-sorted"))]
    NotDupSorted {
        /// The offending bucket.
        bucket: String,
    },

    /// `append` was called with a key that does not sort after the bucket tail.
    #[snafu(display("Append to {bucket}: key is not greater than the last key"))]
    NotAppendable {
        /// The offending bucket.
        bucket: String,
    },

    /// The store has been closed; no new transactions can be started.
    #[snafu(display("Store is closed"))]
    StoreClosed,

    /// The operation is not implemented for this cursor or store.
    #[snafu(display("Unsupported operation: {op}"))]
    Unsupported {
        /// Name of the unimplemented operation.
        op: &'static str,
    },

    /// A storage-mode string contained a letter outside the allowed set (h, r, t, c, e).
    #[snafu(display("Invalid storage mode flag: {flag:?}"))]
    InvalidStorageMode {
        /// The unknown letter.
        flag: char,
    },

    /// A persisted storage-mode byte was neither 0 nor 1.
    #[snafu(display("Corrupted storage mode entry for {key}"))]
    CorruptedStorageMode {
        /// The `DbInfo` key that failed to decode.
        key: &'static str,
    },
}

impl From<io::Error> for Error {
    fn from(source: io::Error) -> Self {
        Error::Io { source }
    }
}
