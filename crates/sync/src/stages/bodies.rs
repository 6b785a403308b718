//! Bodies stage.
//!
//! Downloads block bodies up to the headers progress. Transactions are
//! appended to `EthTx` under ids drawn from the bucket sequence; the body
//! record keeps the base id and count.

use std::sync::Arc;

use strata_kv::buckets::{BLOCK_BODY, ETH_TX};
use strata_kv::{KvStore, RwTx};
use tokio_util::sync::CancellationToken;

use crate::error::Result;
use crate::keys::{block_key, encode_block_number};
use crate::progress::{get_stage_progress, StageId};
use crate::stage::{Stage, StageState, UnwindState};

use super::{
    canonical_hash, check_canceled, encode_payload, read_body, run_in_tx, BodyClient,
    BodyForStorage,
};

pub struct BodiesCfg {
    pub db: Arc<dyn KvStore>,
    pub client: Arc<dyn BodyClient>,
}

pub(super) fn stage(cfg: BodiesCfg) -> Stage {
    let forward_cfg = BodiesCfg { db: Arc::clone(&cfg.db), client: Arc::clone(&cfg.client) };
    let unwind_db = Arc::clone(&cfg.db);
    let prune_db = cfg.db;
    Stage {
        id: StageId::Bodies,
        description: "Download block bodies",
        disabled: false,
        forward: Box::new(move |_first_cycle, state, _unwinder, tx, token| {
            forward(&forward_cfg, state, tx, token)
        }),
        unwind: Box::new(move |_first_cycle, unwind_state, tx, token| {
            unwind(&unwind_db, unwind_state, tx, token)
        }),
        prune: Some(Box::new(move |_first_cycle, prune_state, tx, token| {
            run_in_tx(&prune_db, tx, |tx| prune(prune_state.prune_point, tx, token))
        })),
    }
}

fn forward(
    cfg: &BodiesCfg,
    state: &StageState,
    external: Option<&dyn RwTx>,
    token: &CancellationToken,
) -> Result<()> {
    run_in_tx(&cfg.db, external, |tx| {
        let target = get_stage_progress(tx, StageId::Headers)?;
        if state.block_number >= target {
            return Ok(());
        }

        let mut head = state.block_number;
        for number in state.block_number + 1..=target {
            check_canceled(token)?;
            let hash = canonical_hash(tx, number)?;
            let Some(txs) = cfg.client.body(number, &hash)? else {
                // Body not delivered yet; the next cycle resumes here.
                break;
            };
            let base_tx_id = tx.increment_sequence(ETH_TX, txs.len() as u64)?;
            for (i, blob) in txs.iter().enumerate() {
                tx.append(ETH_TX, &encode_block_number(base_tx_id + i as u64), blob)?;
            }
            let body = BodyForStorage { base_tx_id, tx_amount: txs.len() as u32 };
            tx.put(BLOCK_BODY, &block_key(number, &hash), &encode_payload(BLOCK_BODY, &body)?)?;
            head = number;
        }
        if head != state.block_number {
            state.update(tx, head)?;
        }
        Ok(())
    })
}

/// Drops bodies and their transactions at or below the horizon.
fn prune(prune_point: u64, tx: &dyn RwTx, token: &CancellationToken) -> Result<()> {
    for number in 1..=prune_point {
        check_canceled(token)?;
        let Ok(hash) = canonical_hash(tx, number) else {
            continue;
        };
        let Some(body) = read_body(tx, number, &hash)? else {
            continue;
        };
        for tx_id in body.base_tx_id..body.base_tx_id + u64::from(body.tx_amount) {
            tx.delete(ETH_TX, &encode_block_number(tx_id))?;
        }
        tx.delete(BLOCK_BODY, &block_key(number, &hash))?;
    }
    Ok(())
}

fn unwind(
    db: &Arc<dyn KvStore>,
    state: &UnwindState,
    external: Option<&dyn RwTx>,
    token: &CancellationToken,
) -> Result<()> {
    run_in_tx(db, external, |tx| {
        // Walk the doomed bodies to release their transactions too.
        for number in state.unwind_point + 1..=state.current_block_number {
            check_canceled(token)?;
            let Ok(hash) = canonical_hash(tx, number) else {
                continue;
            };
            let Some(body) = read_body(tx, number, &hash)? else {
                continue;
            };
            for tx_id in body.base_tx_id..body.base_tx_id + u64::from(body.tx_amount) {
                tx.delete(ETH_TX, &encode_block_number(tx_id))?;
            }
            tx.delete(BLOCK_BODY, &block_key(number, &hash))?;
        }
        state.done(tx)
    })
}
