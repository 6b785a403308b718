//! Execution stage.
//!
//! Feeds blocks to the executor collaborator, which updates the flat state
//! and records change sets, receipts, logs and call traces inside the
//! stage's transaction. When the stage owns its transaction it commits at
//! the batch-size boundary so a crash never loses more than one batch;
//! progress is saved in the same transaction as the data it covers.
//!
//! Unwind replays the change sets newest-first, restoring every touched
//! key's previous value, then drops the per-block derived data.

use std::sync::Arc;

use strata_kv::buckets::{
    ACCOUNT_CHANGE_SET, CALL_TRACE_SET, LOGS, PLAIN_STATE, RECEIPTS, STORAGE_CHANGE_SET,
};
use strata_kv::{KvStore, RwTx, Tx};
use tokio_util::sync::CancellationToken;

use crate::error::{Result, SyncError};
use crate::keys::{encode_block_number, Address};
use crate::progress::{get_stage_progress, StageId};
use crate::stage::{Stage, StageState, UnwindState};

use super::{
    canonical_hash, check_canceled, prune_block_keyed, read_block_txs, read_body, run_in_tx,
    BlockExecutor, ExecutedBlock,
};

pub struct ExecutionCfg {
    pub db: Arc<dyn KvStore>,
    pub executor: Arc<dyn BlockExecutor>,
    /// Rough bytes of transaction payload to execute per owned transaction.
    pub batch_size: u64,
}

pub(super) fn stage(cfg: ExecutionCfg) -> Stage {
    let forward_cfg = ExecutionCfg {
        db: Arc::clone(&cfg.db),
        executor: Arc::clone(&cfg.executor),
        batch_size: cfg.batch_size,
    };
    let unwind_db = Arc::clone(&cfg.db);
    let prune_db = cfg.db;
    Stage {
        id: StageId::Execution,
        description: "Execute blocks against the flat state",
        disabled: false,
        forward: Box::new(move |_first_cycle, state, _unwinder, tx, token| {
            forward(&forward_cfg, state, tx, token)
        }),
        unwind: Box::new(move |_first_cycle, unwind_state, tx, token| {
            unwind(&unwind_db, unwind_state, tx, token)
        }),
        prune: Some(Box::new(move |_first_cycle, prune_state, tx, _token| {
            run_in_tx(&prune_db, tx, |tx| {
                for bucket in [ACCOUNT_CHANGE_SET, STORAGE_CHANGE_SET, RECEIPTS, LOGS, CALL_TRACE_SET]
                {
                    prune_block_keyed(tx, bucket, prune_state.prune_point)?;
                }
                Ok(())
            })
        })),
    }
}

fn forward(
    cfg: &ExecutionCfg,
    state: &StageState,
    external: Option<&dyn RwTx>,
    token: &CancellationToken,
) -> Result<()> {
    match external {
        // Caller owns the transaction: one uninterrupted run.
        Some(tx) => {
            let target = get_stage_progress(tx, StageId::Senders)?;
            execute_range(cfg, state, tx, state.block_number, target, None, token)?;
            Ok(())
        },
        // Own transactions, committed per batch.
        None => {
            let mut from = state.block_number;
            loop {
                check_canceled(token)?;
                let tx = cfg.db.begin_rw()?;
                let outcome = (|| {
                    let target = get_stage_progress(tx.as_ref(), StageId::Senders)?;
                    execute_range(
                        cfg,
                        state,
                        tx.as_ref(),
                        from,
                        target,
                        Some(cfg.batch_size),
                        token,
                    )
                })();
                match outcome {
                    Ok(done_through) => {
                        tx.commit()?;
                        if done_through.is_none() {
                            return Ok(());
                        }
                        if let Some(done_through) = done_through {
                            from = done_through;
                        }
                    },
                    Err(e) => {
                        tx.rollback();
                        return Err(e);
                    },
                }
            }
        },
    }
}

/// Executes blocks in `(from, target]`. Returns `Some(n)` when the batch
/// budget ran out at block `n` with more work remaining, `None` when the
/// range is complete.
fn execute_range(
    cfg: &ExecutionCfg,
    state: &StageState,
    tx: &dyn RwTx,
    from: u64,
    target: u64,
    batch_budget: Option<u64>,
    token: &CancellationToken,
) -> Result<Option<u64>> {
    if from >= target {
        return Ok(None);
    }
    let mut spent: u64 = 0;
    for number in from + 1..=target {
        check_canceled(token)?;
        let hash = canonical_hash(tx, number)?;
        let Some(body) = read_body(tx, number, &hash)? else {
            return Ok(None);
        };
        let txs = read_block_txs(tx, number, &body)?;
        let senders = read_senders(tx, number, &hash, txs.len())?;
        let block = ExecutedBlock { number, hash, txs: &txs, senders: &senders };
        cfg.executor.execute_block(tx, &block)?;
        state.update(tx, number)?;

        if let Some(budget) = batch_budget {
            spent += txs.iter().map(|t| t.len() as u64).sum::<u64>();
            if spent >= budget && number < target {
                return Ok(Some(number));
            }
        }
    }
    Ok(None)
}

fn read_senders(
    tx: &dyn Tx,
    number: u64,
    hash: &crate::keys::BlockHash,
    tx_count: usize,
) -> Result<Vec<Address>> {
    let raw = tx
        .get(strata_kv::buckets::SENDERS, &crate::keys::block_key(number, hash))?
        .unwrap_or_default();
    if raw.len() != tx_count * 20 {
        return Err(SyncError::BadBody { number });
    }
    Ok(raw.chunks_exact(20).map(|c| {
        let mut address = [0u8; 20];
        address.copy_from_slice(c);
        address
    }).collect())
}

fn unwind(
    db: &Arc<dyn KvStore>,
    state: &UnwindState,
    external: Option<&dyn RwTx>,
    token: &CancellationToken,
) -> Result<()> {
    run_in_tx(db, external, |tx| {
        // Newest first: each block's change set holds the value the key had
        // before that block, so descending application lands on the state
        // at the unwind point.
        for number in (state.unwind_point + 1..=state.current_block_number).rev() {
            check_canceled(token)?;
            rewind_changes(tx, ACCOUNT_CHANGE_SET, number, 20)?;
            rewind_changes(tx, STORAGE_CHANGE_SET, number, 52)?;
        }
        for number in state.unwind_point + 1..=state.current_block_number {
            let key = encode_block_number(number);
            for bucket in [ACCOUNT_CHANGE_SET, STORAGE_CHANGE_SET, RECEIPTS, LOGS, CALL_TRACE_SET] {
                tx.delete(bucket, &key)?;
            }
        }
        state.done(tx)
    })
}

/// Applies one block's change set to `PlainState`: each duplicate is
/// `{state_key}{previous_value}`; an empty previous value means the key did
/// not exist.
fn rewind_changes(tx: &dyn RwTx, bucket: &'static str, number: u64, key_len: usize) -> Result<()> {
    let block_key = encode_block_number(number);
    let mut changes = Vec::new();
    {
        let mut cursor = tx.cursor_dup(bucket)?;
        let mut entry = cursor.seek_exact(&block_key)?;
        while let Some((k, v)) = entry {
            if k != block_key {
                break;
            }
            changes.push(v);
            entry = cursor.next()?;
        }
    }
    for change in changes {
        if change.len() < key_len {
            return Err(SyncError::BadBody { number });
        }
        let (state_key, prev) = change.split_at(key_len);
        if prev.is_empty() {
            tx.delete(PLAIN_STATE, state_key)?;
        } else {
            tx.put(PLAIN_STATE, state_key, prev)?;
        }
    }
    Ok(())
}
