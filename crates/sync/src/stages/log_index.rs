//! Log index stage.
//!
//! Inverts the per-block `Logs` records into topic and address indexes so
//! filters can find relevant blocks without scanning receipts.

use std::collections::BTreeMap;
use std::sync::Arc;

use strata_kv::buckets::{LOGS, LOG_ADDRESS_INDEX, LOG_TOPIC_INDEX};
use strata_kv::{KvStore, RwTx, Tx, TxExt};
use tokio_util::sync::CancellationToken;

use crate::error::Result;
use crate::keys::{decode_block_number, encode_block_number};
use crate::progress::{get_stage_progress, StageId};
use crate::stage::{Stage, StageState, UnwindState};

use super::{check_canceled, decode_payload, index, run_in_tx, LogEntry};

pub struct LogIndexCfg {
    pub db: Arc<dyn KvStore>,
}

pub(super) fn stage(cfg: LogIndexCfg, disabled: bool) -> Stage {
    let forward_db = Arc::clone(&cfg.db);
    let unwind_db = Arc::clone(&cfg.db);
    let prune_db = cfg.db;
    Stage {
        id: StageId::LogIndex,
        description: "Index log topics and addresses",
        disabled,
        forward: Box::new(move |_first_cycle, state, _unwinder, tx, token| {
            run_in_tx(&forward_db, tx, |tx| forward(state, tx, token))
        }),
        unwind: Box::new(move |_first_cycle, unwind_state, tx, token| {
            run_in_tx(&unwind_db, tx, |tx| unwind(unwind_state, tx, token))
        }),
        prune: Some(Box::new(move |_first_cycle, prune_state, tx, _token| {
            run_in_tx(&prune_db, tx, |tx| {
                index::prune_bucket(tx, LOG_TOPIC_INDEX, prune_state.prune_point)?;
                index::prune_bucket(tx, LOG_ADDRESS_INDEX, prune_state.prune_point)
            })
        })),
    }
}

/// Topic and address keys referenced by blocks in `(from, to]`.
fn collect(
    tx: &dyn Tx,
    from: u64,
    to: u64,
    mut visit: impl FnMut(u64, &LogEntry),
) -> Result<()> {
    let mut decode_err = None;
    tx.for_each(LOGS, &encode_block_number(from + 1), &mut |k, v| {
        let number = match decode_block_number(k) {
            Ok(n) => n,
            Err(_) => return Ok(false),
        };
        if number > to {
            return Ok(false);
        }
        match decode_payload::<Vec<LogEntry>>(LOGS, v) {
            Ok(entries) => {
                for entry in &entries {
                    visit(number, entry);
                }
                Ok(true)
            },
            Err(e) => {
                decode_err = Some(e);
                Ok(false)
            },
        }
    })?;
    match decode_err {
        Some(e) => Err(e),
        None => Ok(()),
    }
}

fn forward(state: &StageState, tx: &dyn RwTx, token: &CancellationToken) -> Result<()> {
    check_canceled(token)?;
    let target = get_stage_progress(tx, StageId::Execution)?;
    if state.block_number >= target {
        return Ok(());
    }

    let mut topics: BTreeMap<Vec<u8>, Vec<u64>> = BTreeMap::new();
    let mut addresses: BTreeMap<Vec<u8>, Vec<u64>> = BTreeMap::new();
    collect(tx, state.block_number, target, |number, entry| {
        addresses.entry(entry.address.to_vec()).or_default().push(number);
        for topic in &entry.topics {
            topics.entry(topic.to_vec()).or_default().push(number);
        }
    })?;
    index::merge_additions(tx, LOG_TOPIC_INDEX, topics)?;
    index::merge_additions(tx, LOG_ADDRESS_INDEX, addresses)?;
    state.update(tx, target)
}

fn unwind(state: &UnwindState, tx: &dyn RwTx, token: &CancellationToken) -> Result<()> {
    check_canceled(token)?;
    let mut topics = std::collections::BTreeSet::new();
    let mut addresses = std::collections::BTreeSet::new();
    collect(tx, state.unwind_point, state.current_block_number, |_, entry| {
        addresses.insert(entry.address.to_vec());
        for topic in &entry.topics {
            topics.insert(topic.to_vec());
        }
    })?;
    index::unwind_keys(tx, LOG_TOPIC_INDEX, topics, state.unwind_point)?;
    index::unwind_keys(tx, LOG_ADDRESS_INDEX, addresses, state.unwind_point)?;
    state.done(tx)
}
