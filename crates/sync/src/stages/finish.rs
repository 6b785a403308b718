//! Finish stage.
//!
//! Owns no data; records the cycle head once every other stage caught up,
//! which is what external observers read as "the node is at block N".

use std::sync::Arc;

use strata_kv::KvStore;

use crate::progress::{get_stage_progress, StageId};
use crate::stage::Stage;

use super::run_in_tx;

pub struct FinishCfg {
    pub db: Arc<dyn KvStore>,
}

pub(super) fn stage(cfg: FinishCfg) -> Stage {
    let forward_db = Arc::clone(&cfg.db);
    let unwind_db = cfg.db;
    Stage {
        id: StageId::Finish,
        description: "Record the completed cycle head",
        disabled: false,
        forward: Box::new(move |_first_cycle, state, _unwinder, tx, _token| {
            run_in_tx(&forward_db, tx, |tx| {
                let head = get_stage_progress(tx, StageId::Execution)?;
                if head > state.block_number {
                    tracing::info!(prefix = state.log_prefix(), head, "cycle complete");
                    state.update(tx, head)?;
                }
                Ok(())
            })
        }),
        unwind: Box::new(move |_first_cycle, unwind_state, tx, _token| {
            run_in_tx(&unwind_db, tx, |tx| unwind_state.done(tx))
        }),
        prune: None,
    }
}
