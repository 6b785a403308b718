//! The sync orchestrator.
//!
//! Drives one synchronization cycle: stages run sequentially in forward
//! order, each owning its transaction lifetime. A stage may request an
//! unwind mid-pass; the orchestrator finishes or breaks the forward loop,
//! runs the unwind pass in declared unwind order, and resumes forward.
//! Prune runs last and is advisory.

use std::sync::Arc;

use parking_lot::Mutex;
use strata_kv::{KvStore, KvStoreExt, Tx};
use tokio_util::sync::CancellationToken;

use crate::error::{Result, SyncError};
use crate::keys::BlockHash;
use crate::progress::{get_stage_progress, StageId};
use crate::stage::{PruneState, Stage, StageState, Unwinder, UnwindState};

/// A pending unwind request. At most one per cycle.
#[derive(Debug, Clone, Copy)]
struct UnwindRequest {
    target: u64,
    bad_block: Option<BlockHash>,
}

/// Prune configuration: how many blocks behind each stage's progress to
/// keep. `None` disables pruning.
#[derive(Debug, Clone, Copy, Default)]
pub struct PruneMode {
    /// Keep this many recent blocks of historical data.
    pub distance: Option<u64>,
}

/// The stage orchestrator.
pub struct Sync {
    db: Arc<dyn KvStore>,
    stages: Vec<Stage>,
    unwind_order: Vec<StageId>,
    prune_order: Vec<StageId>,
    prune: PruneMode,
    pending_unwind: Mutex<Option<UnwindRequest>>,
}

impl std::fmt::Debug for Sync {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Sync")
            .field("stages", &self.stages.iter().map(|s| s.id).collect::<Vec<_>>())
            .field("unwind_order", &self.unwind_order)
            .field("prune_order", &self.prune_order)
            .field("prune", &self.prune)
            .finish()
    }
}

impl Sync {
    /// Build an orchestrator over declared stages and explicit unwind and
    /// prune orders.
    ///
    /// Every id in the order lists must be declared, and every enabled
    /// stage must appear in the unwind order; prune order entries are only
    /// consulted for stages that carry a prune callback.
    pub fn new(
        db: Arc<dyn KvStore>,
        stages: Vec<Stage>,
        unwind_order: Vec<StageId>,
        prune_order: Vec<StageId>,
        prune: PruneMode,
    ) -> Result<Self> {
        for id in unwind_order.iter().chain(prune_order.iter()) {
            if !stages.iter().any(|s| s.id == *id) {
                return Err(SyncError::InvalidStageOrder {
                    reason: format!("{id} is not a declared stage"),
                });
            }
        }
        for stage in stages.iter().filter(|s| !s.disabled) {
            if !unwind_order.contains(&stage.id) {
                return Err(SyncError::InvalidStageOrder {
                    reason: format!("enabled stage {} missing from unwind order", stage.id),
                });
            }
        }
        Ok(Self { db, stages, unwind_order, prune_order, prune, pending_unwind: Mutex::new(None) })
    }

    /// The store this orchestrator runs against.
    pub fn db(&self) -> Arc<dyn KvStore> {
        Arc::clone(&self.db)
    }

    /// Declared stages, in forward order.
    pub fn stages(&self) -> &[Stage] {
        &self.stages
    }

    /// Looks up a declared stage.
    pub fn stage(&self, id: StageId) -> Option<&Stage> {
        self.stages.iter().find(|s| s.id == id)
    }

    /// Builds an unwind handle for driving one stage's unwind directly,
    /// outside a cycle.
    pub fn new_unwind_state(&self, id: StageId, unwind_point: u64, current: u64) -> UnwindState {
        let (position, total) = self.position_of(id);
        UnwindState::new(id, unwind_point, current, None, position, total)
    }

    /// Builds the per-callback handle for a stage from persisted progress.
    pub fn stage_state(&self, id: StageId, tx: &dyn Tx) -> Result<StageState> {
        let progress = get_stage_progress(tx, id)?;
        let (position, total) = self.position_of(id);
        Ok(StageState::new(id, progress, position, total))
    }

    /// 1-based position of a stage in forward order, with the total count.
    fn position_of(&self, id: StageId) -> (usize, usize) {
        let position = self.stages.iter().position(|s| s.id == id).map_or(0, |i| i + 1);
        (position, self.stages.len())
    }

    fn take_pending(&self) -> Option<UnwindRequest> {
        self.pending_unwind.lock().take()
    }

    fn peek_pending(&self) -> Option<UnwindRequest> {
        *self.pending_unwind.lock()
    }

    /// Executes one synchronization cycle.
    ///
    /// Runs the forward pass; when a stage requested an unwind, runs the
    /// unwind pass and starts the forward pass over. Returns once a full
    /// forward pass completes with no pending unwind. Pruning runs last and
    /// never fails the cycle.
    pub fn run_cycle(&self, first_cycle: bool, token: &CancellationToken) -> Result<()> {
        loop {
            self.run_forward(first_cycle, token)?;
            match self.take_pending() {
                Some(request) => self.run_unwind(first_cycle, request, token)?,
                None => break,
            }
        }
        self.run_prune(first_cycle, token);
        Ok(())
    }

    fn run_forward(&self, first_cycle: bool, token: &CancellationToken) -> Result<()> {
        for stage in &self.stages {
            if token.is_cancelled() {
                return Err(SyncError::Canceled);
            }
            if stage.disabled {
                continue;
            }
            let state = self.db.view(|tx| self.stage_state(stage.id, tx))?;
            // A pending unwind below this stage's progress makes further
            // forward work wasted; stop the pass and let the unwind run.
            if let Some(request) = self.peek_pending() {
                if request.target < state.block_number {
                    tracing::debug!(
                        stage = %stage.id,
                        target = request.target,
                        "breaking forward pass for pending unwind"
                    );
                    break;
                }
            }
            tracing::debug!(prefix = state.log_prefix(), progress = state.block_number, "forward");
            (stage.forward)(first_cycle, &state, self, None, token)?;
        }
        Ok(())
    }

    fn run_unwind(
        &self,
        first_cycle: bool,
        request: UnwindRequest,
        token: &CancellationToken,
    ) -> Result<()> {
        tracing::info!(target = request.target, "unwinding");
        for id in &self.unwind_order {
            if token.is_cancelled() {
                return Err(SyncError::Canceled);
            }
            // Membership is validated at construction.
            let Some(stage) = self.stages.iter().find(|s| s.id == *id) else {
                continue;
            };
            if stage.disabled {
                continue;
            }
            let progress = self.db.view(|tx| get_stage_progress(tx, *id))?;
            if progress <= request.target {
                continue;
            }
            let (position, total) = self.position_of(*id);
            let unwind_state = UnwindState::new(
                *id,
                request.target,
                progress,
                request.bad_block,
                position,
                total,
            );
            tracing::debug!(prefix = unwind_state.log_prefix(), from = progress, "unwind");
            (stage.unwind)(first_cycle, &unwind_state, None, token)?;
        }
        Ok(())
    }

    /// Advisory prune pass: failures are logged and do not fail the cycle.
    fn run_prune(&self, first_cycle: bool, token: &CancellationToken) {
        let Some(distance) = self.prune.distance else {
            return;
        };
        for id in &self.prune_order {
            if token.is_cancelled() {
                return;
            }
            let Some(stage) = self.stages.iter().find(|s| s.id == *id) else {
                continue;
            };
            if stage.disabled {
                continue;
            }
            let Some(prune) = &stage.prune else {
                continue;
            };
            let outcome = (|| -> Result<()> {
                let progress = self.db.view(|tx| get_stage_progress(tx, *id))?;
                let prune_point = progress.saturating_sub(distance);
                if prune_point == 0 {
                    return Ok(());
                }
                let (position, total) = self.position_of(*id);
                let state = PruneState::new(*id, prune_point, progress, position, total);
                prune(first_cycle, &state, None, token)
            })();
            if let Err(error) = outcome {
                tracing::warn!(stage = %id, %error, "prune failed");
            }
        }
    }
}

impl Unwinder for Sync {
    fn unwind_to(&self, block: u64, bad_block: Option<BlockHash>) {
        let mut pending = self.pending_unwind.lock();
        match pending.as_mut() {
            // The minimum target wins; the first caller's bad block sticks.
            Some(request) => {
                if block < request.target {
                    request.target = block;
                }
            },
            None => *pending = Some(UnwindRequest { target: block, bad_block }),
        }
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use std::sync::Arc;

    use strata_kv::{KvStoreExt, MemKv};

    use super::*;
    use crate::error::SyncError;
    use crate::progress::save_stage_progress;
    use crate::stage::Stage;

    type Trace = Arc<Mutex<Vec<String>>>;

    /// A stage that logs its invocations and advances to a fixed block.
    fn scripted_stage(
        id: StageId,
        advance_to: u64,
        trace: Trace,
        db: Arc<dyn KvStore>,
        unwind_at: Option<(u64, u64)>,
    ) -> Stage {
        let forward_trace = Arc::clone(&trace);
        let forward_db = Arc::clone(&db);
        let unwind_trace = trace;
        let unwind_db = db;
        Stage {
            id,
            description: "scripted",
            disabled: false,
            forward: Box::new(move |_first, state, unwinder, _tx, _token| {
                forward_trace.lock().push(format!("forward {id}"));
                if let Some((when, target)) = unwind_at {
                    if state.block_number == when {
                        unwinder.unwind_to(target, None);
                        return Ok(());
                    }
                }
                if state.block_number < advance_to {
                    forward_db.update(|tx| save_stage_progress(tx, id, advance_to))?;
                }
                Ok(())
            }),
            unwind: Box::new(move |_first, u, _tx, _token| {
                unwind_trace.lock().push(format!("unwind {id}"));
                unwind_db.update(|tx| u.done(tx))
            }),
            prune: None,
        }
    }

    fn ids(stages: &[Stage]) -> Vec<StageId> {
        stages.iter().map(|s| s.id).collect()
    }

    #[test]
    fn test_forward_runs_stages_in_order() {
        let db: Arc<dyn KvStore> = Arc::new(MemKv::new());
        let trace: Trace = Arc::default();
        let stages = vec![
            scripted_stage(StageId::Headers, 5, Arc::clone(&trace), Arc::clone(&db), None),
            scripted_stage(StageId::Bodies, 5, Arc::clone(&trace), Arc::clone(&db), None),
            scripted_stage(StageId::Finish, 5, Arc::clone(&trace), Arc::clone(&db), None),
        ];
        let unwind_order = ids(&stages).into_iter().rev().collect();
        let sync =
            Sync::new(db, stages, unwind_order, vec![], PruneMode::default()).unwrap();

        sync.run_cycle(true, &CancellationToken::new()).unwrap();
        assert_eq!(
            trace.lock().clone(),
            vec!["forward Headers", "forward Bodies", "forward Finish"]
        );
    }

    #[test]
    fn test_disabled_stage_skipped() {
        let db: Arc<dyn KvStore> = Arc::new(MemKv::new());
        let trace: Trace = Arc::default();
        let mut stages = vec![
            scripted_stage(StageId::Headers, 5, Arc::clone(&trace), Arc::clone(&db), None),
            scripted_stage(StageId::TxLookup, 5, Arc::clone(&trace), Arc::clone(&db), None),
        ];
        stages[1].disabled = true;
        let sync = Sync::new(db, stages, vec![StageId::Headers], vec![], PruneMode::default())
            .unwrap();

        sync.run_cycle(true, &CancellationToken::new()).unwrap();
        assert_eq!(trace.lock().clone(), vec!["forward Headers"]);
    }

    #[test]
    fn test_unwind_runs_in_unwind_order_then_reforwards() {
        let db: Arc<dyn KvStore> = Arc::new(MemKv::new());
        let trace: Trace = Arc::default();
        // Bodies requests an unwind to 2 on its first run (progress 0 -> 5,
        // second cycle sees 5 and triggers).
        let stages = vec![
            scripted_stage(StageId::Headers, 5, Arc::clone(&trace), Arc::clone(&db), None),
            scripted_stage(
                StageId::Bodies,
                5,
                Arc::clone(&trace),
                Arc::clone(&db),
                Some((5, 2)),
            ),
            scripted_stage(StageId::Finish, 5, Arc::clone(&trace), Arc::clone(&db), None),
        ];
        let sync = Sync::new(
            Arc::clone(&db),
            stages,
            vec![StageId::Finish, StageId::Bodies, StageId::Headers],
            vec![],
            PruneMode::default(),
        )
        .unwrap();

        // First cycle: everything reaches 5.
        sync.run_cycle(true, &CancellationToken::new()).unwrap();
        trace.lock().clear();

        // Second cycle: Bodies asks to unwind to 2 mid-pass; Finish is
        // skipped (its progress is above the target), the unwind pass runs
        // in declared order, then forward resumes and completes.
        sync.run_cycle(false, &CancellationToken::new()).unwrap();
        let log = trace.lock().clone();
        assert_eq!(
            log,
            vec![
                "forward Headers",
                "forward Bodies",
                "unwind Finish",
                "unwind Bodies",
                "unwind Headers",
                "forward Headers",
                "forward Bodies",
                "forward Finish",
            ]
        );

        // Progress was reset to the target before re-forwarding.
        let progress = db
            .view(|tx| crate::progress::get_stage_progress(tx, StageId::Finish))
            .unwrap();
        assert_eq!(progress, 5);
    }

    #[test]
    fn test_unwind_requests_merge_to_minimum() {
        let db: Arc<dyn KvStore> = Arc::new(MemKv::new());
        let sync = Sync::new(db, vec![], vec![], vec![], PruneMode::default()).unwrap();
        sync.unwind_to(10, Some([1; 32]));
        sync.unwind_to(4, Some([2; 32]));
        sync.unwind_to(7, None);
        let pending = sync.take_pending().unwrap();
        assert_eq!(pending.target, 4);
        // The first caller's bad block sticks.
        assert_eq!(pending.bad_block, Some([1; 32]));
    }

    #[test]
    fn test_cancellation_stops_before_stages() {
        let db: Arc<dyn KvStore> = Arc::new(MemKv::new());
        let trace: Trace = Arc::default();
        let stages = vec![scripted_stage(
            StageId::Headers,
            5,
            Arc::clone(&trace),
            Arc::clone(&db),
            None,
        )];
        let sync =
            Sync::new(db, stages, vec![StageId::Headers], vec![], PruneMode::default()).unwrap();

        let token = CancellationToken::new();
        token.cancel();
        let err = sync.run_cycle(true, &token).unwrap_err();
        assert!(matches!(err, SyncError::Canceled));
        assert!(trace.lock().is_empty());
    }

    #[test]
    fn test_prune_failure_is_advisory() {
        let db: Arc<dyn KvStore> = Arc::new(MemKv::new());
        let trace: Trace = Arc::default();
        let mut stage =
            scripted_stage(StageId::Headers, 5, Arc::clone(&trace), Arc::clone(&db), None);
        stage.prune = Some(Box::new(|_first, _state, _tx, _token| {
            Err(SyncError::Collaborator { component: "prune", message: "boom".into() })
        }));
        let sync = Sync::new(
            db,
            vec![stage],
            vec![StageId::Headers],
            vec![StageId::Headers],
            PruneMode { distance: Some(1) },
        )
        .unwrap();

        // The cycle still succeeds.
        sync.run_cycle(true, &CancellationToken::new()).unwrap();
    }

    #[test]
    fn test_order_validation() {
        let db: Arc<dyn KvStore> = Arc::new(MemKv::new());
        let trace: Trace = Arc::default();
        let stages =
            vec![scripted_stage(StageId::Headers, 5, Arc::clone(&trace), Arc::clone(&db), None)];
        // Unwind order references an undeclared stage.
        let err = Sync::new(
            Arc::clone(&db),
            stages,
            vec![StageId::Headers, StageId::Bodies],
            vec![],
            PruneMode::default(),
        )
        .unwrap_err();
        assert!(matches!(err, SyncError::InvalidStageOrder { .. }));

        // An enabled stage missing from the unwind order.
        let stages =
            vec![scripted_stage(StageId::Headers, 5, Arc::clone(&trace), db, None)];
        let err = Sync::new(
            Arc::new(MemKv::new()),
            stages,
            vec![],
            vec![],
            PruneMode::default(),
        )
        .unwrap_err();
        assert!(matches!(err, SyncError::InvalidStageOrder { .. }));
    }
}
