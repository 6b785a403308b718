//! Stage descriptors and per-invocation state handles.
//!
//! A stage is a name plus three callbacks: `forward` does the work,
//! `unwind` undoes it down to an unwind point, and the optional `prune`
//! drops data behind a horizon. Callbacks receive a small state handle
//! instead of a back-reference to the orchestrator; unwind requests flow
//! through the explicit [`Unwinder`] argument.

use strata_kv::RwTx;
use tokio_util::sync::CancellationToken;

use crate::error::Result;
use crate::keys::BlockHash;
use crate::progress::{save_stage_progress, StageId};

/// Forward callback: `(first_cycle, state, unwinder, external_tx, token)`.
///
/// With `external_tx` of `None` the stage begins and commits its own
/// transaction on the store it captured at construction.
pub type ForwardFn = Box<
    dyn Fn(bool, &StageState, &dyn Unwinder, Option<&dyn RwTx>, &CancellationToken) -> Result<()>
        + Send
        + Sync,
>;

/// Unwind callback: `(first_cycle, unwind_state, external_tx, token)`.
pub type UnwindFn =
    Box<dyn Fn(bool, &UnwindState, Option<&dyn RwTx>, &CancellationToken) -> Result<()> + Send + Sync>;

/// Prune callback: `(first_cycle, prune_state, external_tx, token)`.
pub type PruneFn =
    Box<dyn Fn(bool, &PruneState, Option<&dyn RwTx>, &CancellationToken) -> Result<()> + Send + Sync>;

/// One stage of the pipeline.
pub struct Stage {
    /// Unique stage id.
    pub id: StageId,
    /// Shown in logs.
    pub description: &'static str,
    /// Disabled stages keep their descriptor but are skipped by every pass.
    pub disabled: bool,
    /// Moves the stage forward. Mandatory.
    pub forward: ForwardFn,
    /// Undoes work in `(unwind_point, progress]`. Mandatory.
    pub unwind: UnwindFn,
    /// Drops data behind the prune horizon. Optional.
    pub prune: Option<PruneFn>,
}

/// Lets a stage request an unwind during its forward pass.
///
/// At most one request is outstanding per cycle; repeated calls keep the
/// minimum target and the first bad-block hash.
pub trait Unwinder {
    /// Request an unwind to `block`. `bad_block` is set when a bad block
    /// (rather than a reorg) triggered the request.
    fn unwind_to(&self, block: u64, bad_block: Option<BlockHash>);
}

/// Per-invocation state passed to a forward callback.
#[derive(Debug, Clone)]
pub struct StageState {
    /// The stage being run.
    pub id: StageId,
    /// Persisted progress at entry.
    pub block_number: u64,
    log_prefix: String,
}

impl StageState {
    pub(crate) fn new(id: StageId, block_number: u64, position: usize, total: usize) -> Self {
        Self { id, block_number, log_prefix: format!("[{position}/{total} {id}]") }
    }

    /// Human tag `[<position>/<total> <id>]` for log lines.
    pub fn log_prefix(&self) -> &str {
        &self.log_prefix
    }

    /// Persist new progress inside the caller's transaction. Can be called
    /// at every chunk boundary during a long forward run.
    pub fn update(&self, tx: &dyn RwTx, block: u64) -> Result<()> {
        save_stage_progress(tx, self.id, block)
    }

    /// Progress of the `Execution` stage, the canonical "current block" for
    /// dependent stages.
    pub fn execution_at(&self, tx: &dyn strata_kv::Tx) -> Result<u64> {
        crate::progress::get_stage_progress(tx, StageId::Execution)
    }
}

/// Per-invocation state passed to an unwind callback.
#[derive(Debug, Clone)]
pub struct UnwindState {
    /// The stage being unwound.
    pub id: StageId,
    /// Block to unwind to.
    pub unwind_point: u64,
    /// The stage's progress before unwinding.
    pub current_block_number: u64,
    /// Set when a bad block triggered the unwind.
    pub bad_block: Option<BlockHash>,
    log_prefix: String,
}

impl UnwindState {
    pub(crate) fn new(
        id: StageId,
        unwind_point: u64,
        current_block_number: u64,
        bad_block: Option<BlockHash>,
        position: usize,
        total: usize,
    ) -> Self {
        Self {
            id,
            unwind_point,
            current_block_number,
            bad_block,
            log_prefix: format!("[{position}/{total} {id}]"),
        }
    }

    /// Human tag for log lines.
    pub fn log_prefix(&self) -> &str {
        &self.log_prefix
    }

    /// Records the stage's progress as the unwind point. Every unwind
    /// callback ends with this inside its transaction.
    pub fn done(&self, tx: &dyn RwTx) -> Result<()> {
        save_stage_progress(tx, self.id, self.unwind_point)
    }
}

/// Resolves an unwind distance against current progress, rejecting unwinds
/// below block zero before any data is touched.
pub fn unwind_point(stage: StageId, progress: u64, distance: u64) -> Result<u64> {
    progress
        .checked_sub(distance)
        .ok_or(crate::error::SyncError::UnwindPastZero { stage, progress, unwind: distance })
}

/// Per-invocation state passed to a prune callback.
#[derive(Debug, Clone)]
pub struct PruneState {
    /// The stage being pruned.
    pub id: StageId,
    /// Data at or below this block may be dropped.
    pub prune_point: u64,
    /// The stage's current progress.
    pub current_block_number: u64,
    log_prefix: String,
}

impl PruneState {
    pub(crate) fn new(
        id: StageId,
        prune_point: u64,
        current_block_number: u64,
        position: usize,
        total: usize,
    ) -> Self {
        Self {
            id,
            prune_point,
            current_block_number,
            log_prefix: format!("[{position}/{total} {id}]"),
        }
    }

    /// Human tag for log lines.
    pub fn log_prefix(&self) -> &str {
        &self.log_prefix
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::SyncError;

    #[test]
    fn test_log_prefix_format() {
        let state = StageState::new(StageId::Senders, 42, 3, 12);
        assert_eq!(state.log_prefix(), "[3/12 Senders]");
    }

    #[test]
    fn test_unwind_point_subtracts() {
        assert_eq!(unwind_point(StageId::Bodies, 10, 4).unwrap(), 6);
        assert_eq!(unwind_point(StageId::Bodies, 10, 10).unwrap(), 0);
    }

    #[test]
    fn test_unwind_below_zero_rejected() {
        let err = unwind_point(StageId::Bodies, 10, 11).unwrap_err();
        assert!(matches!(
            err,
            SyncError::UnwindPastZero { progress: 10, unwind: 11, .. }
        ));
    }
}
