//! Account and storage history index stages.
//!
//! Inverts the change sets: for every touched state key, the index bucket
//! holds the ascending list of blocks that changed it. Both stages share
//! the implementation and differ only in the change-set/index bucket pair.

use std::collections::BTreeMap;
use std::sync::Arc;

use strata_kv::buckets::{
    ACCOUNT_CHANGE_SET, ACCOUNT_HISTORY, STORAGE_CHANGE_SET, STORAGE_HISTORY,
};
use strata_kv::{KvStore, RwTx};
use tokio_util::sync::CancellationToken;

use crate::error::Result;
use crate::progress::{get_stage_progress, StageId};
use crate::stage::{Stage, StageState, UnwindState};

use super::hash_state::walk_change_sets;
use super::index;
use super::{check_canceled, run_in_tx};

pub struct HistoryIndexCfg {
    pub db: Arc<dyn KvStore>,
}

struct Family {
    id: StageId,
    description: &'static str,
    change_set: &'static str,
    history: &'static str,
    key_len: usize,
}

const ACCOUNTS: Family = Family {
    id: StageId::AccountHistoryIndex,
    description: "Index account history",
    change_set: ACCOUNT_CHANGE_SET,
    history: ACCOUNT_HISTORY,
    key_len: 20,
};

const STORAGE: Family = Family {
    id: StageId::StorageHistoryIndex,
    description: "Index storage history",
    change_set: STORAGE_CHANGE_SET,
    history: STORAGE_HISTORY,
    key_len: 52,
};

pub(super) fn account_stage(cfg: HistoryIndexCfg, disabled: bool) -> Stage {
    family_stage(cfg, &ACCOUNTS, disabled)
}

pub(super) fn storage_stage(cfg: HistoryIndexCfg, disabled: bool) -> Stage {
    family_stage(cfg, &STORAGE, disabled)
}

fn family_stage(cfg: HistoryIndexCfg, family: &'static Family, disabled: bool) -> Stage {
    let forward_db = Arc::clone(&cfg.db);
    let unwind_db = Arc::clone(&cfg.db);
    let prune_db = cfg.db;
    Stage {
        id: family.id,
        description: family.description,
        disabled,
        forward: Box::new(move |_first_cycle, state, _unwinder, tx, token| {
            run_in_tx(&forward_db, tx, |tx| forward(family, state, tx, token))
        }),
        unwind: Box::new(move |_first_cycle, unwind_state, tx, token| {
            run_in_tx(&unwind_db, tx, |tx| unwind(family, unwind_state, tx, token))
        }),
        prune: Some(Box::new(move |_first_cycle, prune_state, tx, _token| {
            run_in_tx(&prune_db, tx, |tx| {
                index::prune_bucket(tx, family.history, prune_state.prune_point)
            })
        })),
    }
}

fn forward(
    family: &Family,
    state: &StageState,
    tx: &dyn RwTx,
    token: &CancellationToken,
) -> Result<()> {
    check_canceled(token)?;
    let target = get_stage_progress(tx, StageId::Execution)?;
    if state.block_number >= target {
        return Ok(());
    }

    let mut additions: BTreeMap<Vec<u8>, Vec<u64>> = BTreeMap::new();
    walk_change_sets(tx, family.change_set, state.block_number, target, &mut |number, change| {
        if change.len() >= family.key_len {
            additions.entry(change[..family.key_len].to_vec()).or_default().push(number);
        }
        Ok(())
    })?;
    index::merge_additions(tx, family.history, additions)?;
    state.update(tx, target)
}

fn unwind(
    family: &Family,
    state: &UnwindState,
    tx: &dyn RwTx,
    token: &CancellationToken,
) -> Result<()> {
    check_canceled(token)?;
    let mut touched = std::collections::BTreeSet::new();
    walk_change_sets(
        tx,
        family.change_set,
        state.unwind_point,
        state.current_block_number,
        &mut |_, change| {
            if change.len() >= family.key_len {
                touched.insert(change[..family.key_len].to_vec());
            }
            Ok(())
        },
    )?;
    index::unwind_keys(tx, family.history, touched, state.unwind_point)?;
    state.done(tx)
}
