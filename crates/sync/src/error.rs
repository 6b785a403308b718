//! Error types for the sync pipeline.

use snafu::Snafu;

use crate::progress::StageId;

/// Result type alias for sync operations.
pub type Result<T> = std::result::Result<T, SyncError>;

/// Errors surfaced by the orchestrator and the stages.
#[derive(Debug, Snafu)]
#[snafu(visibility(pub(crate)))]
pub enum SyncError {
    /// Error from the KV layer.
    #[snafu(context(false))]
    #[snafu(display("KV error: {source}"))]
    Kv {
        /// The underlying KV error.
        source: strata_kv::Error,
    },

    /// A bucket payload failed to encode or decode.
    #[snafu(display("Codec error in {bucket}: {source}"))]
    Codec {
        /// The bucket holding the payload.
        bucket: &'static str,
        /// The underlying postcard error.
        source: postcard::Error,
    },

    /// A persisted progress value had the wrong length.
    #[snafu(display("Invalid progress value for stage {stage}: {length} bytes"))]
    InvalidProgress {
        /// The stage whose progress is corrupt.
        stage: StageId,
        /// Length of the stored value.
        length: usize,
    },

    /// An unwind was requested below block zero.
    #[snafu(display("Stage {stage}: cannot unwind past 0 (progress {progress}, unwind {unwind})"))]
    UnwindPastZero {
        /// The stage being unwound.
        stage: StageId,
        /// Current progress.
        progress: u64,
        /// Requested unwind distance.
        unwind: u64,
    },

    /// A block-keyed entry had a key too short to hold a block number.
    #[snafu(display("Malformed block key: {length} bytes"))]
    MalformedKey {
        /// Length of the key.
        length: usize,
    },

    /// The cancellation token fired.
    #[snafu(display("Canceled"))]
    Canceled,

    /// An unknown chain name was configured.
    #[snafu(display("Unknown chain: {name}"))]
    UnknownChain {
        /// The offending name.
        name: String,
    },

    /// A stage order list referenced an undeclared stage, or an enabled
    /// stage is missing from an order list.
    #[snafu(display("Invalid stage order: {reason}"))]
    InvalidStageOrder {
        /// What was wrong with the list.
        reason: String,
    },

    /// A block's canonical hash is missing.
    #[snafu(display("No canonical hash for block {number}"))]
    MissingCanonicalHash {
        /// The block number.
        number: u64,
    },

    /// A stored block body is missing or malformed.
    #[snafu(display("Bad block body at {number}"))]
    BadBody {
        /// The block number.
        number: u64,
    },

    /// A collaborator (downloader, recoverer, executor) failed.
    #[snafu(display("{component}: {message}"))]
    Collaborator {
        /// Which collaborator failed.
        component: &'static str,
        /// Failure description.
        message: String,
    },

    /// The state root recomputation did not match the stored root.
    #[snafu(display("State root mismatch at block {number}"))]
    RootMismatch {
        /// The block whose root diverged.
        number: u64,
    },
}
