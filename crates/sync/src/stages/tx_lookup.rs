//! Transaction lookup stage.
//!
//! Maps every transaction's content hash to its block number so point
//! queries skip the block scan.

use std::sync::Arc;

use strata_kv::buckets::TX_LOOKUP;
use strata_kv::{KvStore, RwTx};
use tokio_util::sync::CancellationToken;

use crate::error::Result;
use crate::keys::{encode_block_number, tx_hash};
use crate::progress::{get_stage_progress, StageId};
use crate::stage::{Stage, StageState, UnwindState};

use super::{canonical_hash, check_canceled, read_block_txs, read_body, run_in_tx};

pub struct TxLookupCfg {
    pub db: Arc<dyn KvStore>,
}

pub(super) fn stage(cfg: TxLookupCfg, disabled: bool) -> Stage {
    let forward_db = Arc::clone(&cfg.db);
    let unwind_db = Arc::clone(&cfg.db);
    let prune_db = cfg.db;
    Stage {
        id: StageId::TxLookup,
        description: "Map transaction hashes to block numbers",
        disabled,
        forward: Box::new(move |_first_cycle, state, _unwinder, tx, token| {
            run_in_tx(&forward_db, tx, |tx| forward(state, tx, token))
        }),
        unwind: Box::new(move |_first_cycle, unwind_state, tx, token| {
            run_in_tx(&unwind_db, tx, |tx| unwind(unwind_state, tx, token))
        }),
        prune: Some(Box::new(move |_first_cycle, prune_state, tx, token| {
            run_in_tx(&prune_db, tx, |tx| {
                // Remove lookups for blocks whose bodies fall behind the
                // horizon; already-pruned bodies have nothing left to map.
                delete_lookups(tx, 0, prune_state.prune_point, token)
            })
        })),
    }
}

fn forward(state: &StageState, tx: &dyn RwTx, token: &CancellationToken) -> Result<()> {
    let target = get_stage_progress(tx, StageId::Execution)?;
    if state.block_number >= target {
        return Ok(());
    }

    for number in state.block_number + 1..=target {
        check_canceled(token)?;
        let hash = canonical_hash(tx, number)?;
        let Some(body) = read_body(tx, number, &hash)? else {
            break;
        };
        for blob in read_block_txs(tx, number, &body)? {
            tx.put(TX_LOOKUP, &tx_hash(&blob), &encode_block_number(number))?;
        }
        state.update(tx, number)?;
    }
    Ok(())
}

fn unwind(state: &UnwindState, tx: &dyn RwTx, token: &CancellationToken) -> Result<()> {
    delete_lookups(tx, state.unwind_point + 1, state.current_block_number, token)?;
    state.done(tx)
}

/// Deletes the lookup entries of blocks in `[from, to]`, tolerating blocks
/// whose bodies are already gone.
fn delete_lookups(tx: &dyn RwTx, from: u64, to: u64, token: &CancellationToken) -> Result<()> {
    for number in from..=to {
        check_canceled(token)?;
        let Ok(hash) = canonical_hash(tx, number) else {
            continue;
        };
        let Some(body) = read_body(tx, number, &hash)? else {
            continue;
        };
        let Ok(txs) = read_block_txs(tx, number, &body) else {
            continue;
        };
        for blob in txs {
            tx.delete(TX_LOOKUP, &tx_hash(&blob))?;
        }
    }
    Ok(())
}
