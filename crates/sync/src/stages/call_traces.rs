//! Call-traces stage.
//!
//! Splits the executor's `CallTraceSet` duplicates (`{address}{flags}`)
//! into caller and callee block indexes.

use std::collections::BTreeMap;
use std::sync::Arc;

use strata_kv::buckets::{CALL_FROM_INDEX, CALL_TO_INDEX, CALL_TRACE_SET};
use strata_kv::{KvStore, RwTx};
use tokio_util::sync::CancellationToken;

use crate::error::Result;
use crate::progress::{get_stage_progress, StageId};
use crate::stage::{Stage, StageState, UnwindState};

use super::hash_state::walk_change_sets;
use super::{check_canceled, index, run_in_tx, CALL_FROM, CALL_TO};

pub struct CallTracesCfg {
    pub db: Arc<dyn KvStore>,
}

pub(super) fn stage(cfg: CallTracesCfg, disabled: bool) -> Stage {
    let forward_db = Arc::clone(&cfg.db);
    let unwind_db = Arc::clone(&cfg.db);
    let prune_db = cfg.db;
    Stage {
        id: StageId::CallTraces,
        description: "Index call-trace senders and recipients",
        disabled,
        forward: Box::new(move |_first_cycle, state, _unwinder, tx, token| {
            run_in_tx(&forward_db, tx, |tx| forward(state, tx, token))
        }),
        unwind: Box::new(move |_first_cycle, unwind_state, tx, token| {
            run_in_tx(&unwind_db, tx, |tx| unwind(unwind_state, tx, token))
        }),
        prune: Some(Box::new(move |_first_cycle, prune_state, tx, _token| {
            run_in_tx(&prune_db, tx, |tx| {
                index::prune_bucket(tx, CALL_FROM_INDEX, prune_state.prune_point)?;
                index::prune_bucket(tx, CALL_TO_INDEX, prune_state.prune_point)
            })
        })),
    }
}

fn forward(state: &StageState, tx: &dyn RwTx, token: &CancellationToken) -> Result<()> {
    check_canceled(token)?;
    let target = get_stage_progress(tx, StageId::Execution)?;
    if state.block_number >= target {
        return Ok(());
    }

    let mut from_index: BTreeMap<Vec<u8>, Vec<u64>> = BTreeMap::new();
    let mut to_index: BTreeMap<Vec<u8>, Vec<u64>> = BTreeMap::new();
    walk_change_sets(tx, CALL_TRACE_SET, state.block_number, target, &mut |number, trace| {
        if trace.len() != 21 {
            return Ok(());
        }
        let address = trace[..20].to_vec();
        let flags = trace[20];
        if flags & CALL_FROM != 0 {
            from_index.entry(address.clone()).or_default().push(number);
        }
        if flags & CALL_TO != 0 {
            to_index.entry(address).or_default().push(number);
        }
        Ok(())
    })?;
    index::merge_additions(tx, CALL_FROM_INDEX, from_index)?;
    index::merge_additions(tx, CALL_TO_INDEX, to_index)?;
    state.update(tx, target)
}

fn unwind(state: &UnwindState, tx: &dyn RwTx, token: &CancellationToken) -> Result<()> {
    check_canceled(token)?;
    let mut touched = std::collections::BTreeSet::new();
    walk_change_sets(
        tx,
        CALL_TRACE_SET,
        state.unwind_point,
        state.current_block_number,
        &mut |_, trace| {
            if trace.len() == 21 {
                touched.insert(trace[..20].to_vec());
            }
            Ok(())
        },
    )?;
    index::unwind_keys(tx, CALL_FROM_INDEX, touched.clone(), state.unwind_point)?;
    index::unwind_keys(tx, CALL_TO_INDEX, touched, state.unwind_point)?;
    state.done(tx)
}
