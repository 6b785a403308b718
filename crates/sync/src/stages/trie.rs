//! Intermediate-hashes stage.
//!
//! Folds the hashed state into a per-block state root. The root is a
//! running SHA-256 over the ordered `(key, value)` stream of the hashed
//! buckets, recorded in `IntermediateHashes` under the block number.

use std::sync::Arc;

use sha2::{Digest, Sha256};
use strata_kv::buckets::{HASHED_ACCOUNTS, HASHED_STORAGE, INTERMEDIATE_HASHES};
use strata_kv::{KvStore, RwTx, Tx, TxExt};

use crate::error::{Result, SyncError};
use crate::keys::encode_block_number;
use crate::progress::{get_stage_progress, StageId};
use crate::stage::{Stage, StageState, UnwindState};

use super::{check_canceled, delete_block_keyed_above, run_in_tx};

pub struct TrieCfg {
    pub db: Arc<dyn KvStore>,
}

pub(super) fn stage(cfg: TrieCfg) -> Stage {
    let forward_db = Arc::clone(&cfg.db);
    let unwind_db = cfg.db;
    Stage {
        id: StageId::IntermediateHashes,
        description: "Maintain per-block state roots",
        disabled: false,
        forward: Box::new(move |_first_cycle, state, _unwinder, tx, token| {
            run_in_tx(&forward_db, tx, |tx| {
                check_canceled(token)?;
                forward(state, tx)
            })
        }),
        unwind: Box::new(move |_first_cycle, unwind_state, tx, token| {
            run_in_tx(&unwind_db, tx, |tx| {
                check_canceled(token)?;
                unwind(unwind_state, tx)
            })
        }),
        prune: None,
    }
}

fn forward(state: &StageState, tx: &dyn RwTx) -> Result<()> {
    let target = get_stage_progress(tx, StageId::HashState)?;
    if state.block_number >= target {
        return Ok(());
    }
    let root = state_root(tx)?;
    tx.put(INTERMEDIATE_HASHES, &encode_block_number(target), &root)?;
    state.update(tx, target)
}

fn unwind(state: &UnwindState, tx: &dyn RwTx) -> Result<()> {
    // The next forward pass recomputes the root at its target; nothing to
    // re-anchor here.
    delete_block_keyed_above(tx, INTERMEDIATE_HASHES, state.unwind_point)?;
    state.done(tx)
}

/// Streaming digest of the hashed state.
fn state_root(tx: &dyn Tx) -> Result<[u8; 32]> {
    let mut hasher = Sha256::new();
    for bucket in [HASHED_ACCOUNTS, HASHED_STORAGE] {
        tx.for_each(bucket, b"", &mut |k, v| {
            hasher.update((k.len() as u32).to_be_bytes());
            hasher.update(k);
            hasher.update((v.len() as u32).to_be_bytes());
            hasher.update(v);
            Ok(true)
        })?;
    }
    Ok(hasher.finalize().into())
}

/// Post-run integrity check: recomputes the root at `block` and compares it
/// with the stored one. Used by the integration tool's slow checks.
pub fn verify_root(tx: &dyn Tx, block: u64) -> Result<()> {
    let stored = tx.get(INTERMEDIATE_HASHES, &encode_block_number(block))?;
    let Some(stored) = stored else {
        return Err(SyncError::RootMismatch { number: block });
    };
    let computed = state_root(tx)?;
    if stored != computed {
        return Err(SyncError::RootMismatch { number: block });
    }
    Ok(())
}
