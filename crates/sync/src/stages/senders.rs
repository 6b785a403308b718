//! Senders stage.
//!
//! Recovers the sender of every transaction in the downloaded bodies and
//! stores them concatenated per block. Recovery itself is the collaborator's
//! business (ECDSA in production); this stage is the glue and the progress
//! bookkeeping.

use std::sync::Arc;

use strata_kv::buckets::SENDERS;
use strata_kv::{KvStore, RwTx};
use tokio_util::sync::CancellationToken;

use crate::error::Result;
use crate::keys::block_key;
use crate::progress::{get_stage_progress, StageId};
use crate::stage::{Stage, StageState, UnwindState};

use super::{
    canonical_hash, check_canceled, delete_block_keyed_above, prune_block_keyed, read_block_txs,
    read_body, run_in_tx, SenderRecovery,
};

pub struct SendersCfg {
    pub db: Arc<dyn KvStore>,
    pub recovery: Arc<dyn SenderRecovery>,
}

pub(super) fn stage(cfg: SendersCfg) -> Stage {
    let forward_cfg = SendersCfg { db: Arc::clone(&cfg.db), recovery: Arc::clone(&cfg.recovery) };
    let unwind_db = Arc::clone(&cfg.db);
    let prune_db = cfg.db;
    Stage {
        id: StageId::Senders,
        description: "Recover transaction senders",
        disabled: false,
        forward: Box::new(move |_first_cycle, state, _unwinder, tx, token| {
            forward(&forward_cfg, state, tx, token)
        }),
        unwind: Box::new(move |_first_cycle, unwind_state, tx, _token| {
            unwind(&unwind_db, unwind_state, tx)
        }),
        prune: Some(Box::new(move |_first_cycle, prune_state, tx, _token| {
            run_in_tx(&prune_db, tx, |tx| prune_block_keyed(tx, SENDERS, prune_state.prune_point))
        })),
    }
}

fn forward(
    cfg: &SendersCfg,
    state: &StageState,
    external: Option<&dyn RwTx>,
    token: &CancellationToken,
) -> Result<()> {
    run_in_tx(&cfg.db, external, |tx| {
        let target = get_stage_progress(tx, StageId::Bodies)?;
        if state.block_number >= target {
            return Ok(());
        }

        for number in state.block_number + 1..=target {
            check_canceled(token)?;
            let hash = canonical_hash(tx, number)?;
            let Some(body) = read_body(tx, number, &hash)? else {
                break;
            };
            let txs = read_block_txs(tx, number, &body)?;
            let mut senders = Vec::with_capacity(txs.len() * 20);
            for blob in &txs {
                senders.extend_from_slice(&cfg.recovery.recover(blob)?);
            }
            tx.put(SENDERS, &block_key(number, &hash), &senders)?;
            state.update(tx, number)?;
        }
        Ok(())
    })
}

fn unwind(db: &Arc<dyn KvStore>, state: &UnwindState, external: Option<&dyn RwTx>) -> Result<()> {
    run_in_tx(db, external, |tx| {
        delete_block_keyed_above(tx, SENDERS, state.unwind_point)?;
        state.done(tx)
    })
}
