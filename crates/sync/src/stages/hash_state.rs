//! Hashed-state stage.
//!
//! Mirrors `PlainState` into `HashedAccounts`/`HashedStorage` under hashed
//! keys. The first run copies the whole flat state; later runs are
//! incremental over the change sets. Unwind restores each touched key's
//! value at the unwind point from the oldest change-set entry in range.

use std::collections::BTreeMap;
use std::sync::Arc;

use strata_kv::buckets::{
    ACCOUNT_CHANGE_SET, HASHED_ACCOUNTS, HASHED_STORAGE, PLAIN_STATE, STORAGE_CHANGE_SET,
};
use strata_kv::{KvStore, RwTx, Tx, TxExt};

use crate::error::{Result, SyncError};
use crate::keys::{encode_block_number, hash_key};
use crate::progress::{get_stage_progress, StageId};
use crate::stage::{Stage, StageState, UnwindState};

use super::{check_canceled, run_in_tx};

pub struct HashStateCfg {
    pub db: Arc<dyn KvStore>,
}

pub(super) fn stage(cfg: HashStateCfg) -> Stage {
    let forward_db = Arc::clone(&cfg.db);
    let unwind_db = cfg.db;
    Stage {
        id: StageId::HashState,
        description: "Re-key the flat state by hashed keys",
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

/// Writes the hashed image of one plain-state entry, or removes it when the
/// plain entry is gone.
fn apply_hashed(tx: &dyn RwTx, state_key: &[u8], value: Option<&[u8]>) -> Result<()> {
    let (bucket, hashed_key) = hashed_location(state_key)?;
    match value {
        Some(v) => tx.put(bucket, &hashed_key, v)?,
        None => tx.delete(bucket, &hashed_key)?,
    }
    Ok(())
}

/// Hashed bucket and key for a plain-state key: 20-byte account addresses
/// re-key to `HashedAccounts`, 52-byte storage keys to `HashedStorage`.
fn hashed_location(state_key: &[u8]) -> Result<(&'static str, Vec<u8>)> {
    match state_key.len() {
        20 => Ok((HASHED_ACCOUNTS, hash_key(state_key).to_vec())),
        52 => {
            let mut key = Vec::with_capacity(64);
            key.extend_from_slice(&hash_key(&state_key[..20]));
            key.extend_from_slice(&hash_key(&state_key[20..]));
            Ok((HASHED_STORAGE, key))
        },
        other => Err(SyncError::MalformedKey { length: other }),
    }
}

fn forward(state: &StageState, tx: &dyn RwTx) -> Result<()> {
    let target = get_stage_progress(tx, StageId::Execution)?;
    if state.block_number >= target {
        return Ok(());
    }

    if state.block_number == 0 {
        // Promotion from scratch: hash the whole flat state.
        let mut entries = Vec::new();
        tx.for_each(PLAIN_STATE, b"", &mut |k, v| {
            entries.push((k.to_vec(), v.to_vec()));
            Ok(true)
        })?;
        for (k, v) in entries {
            apply_hashed(tx, &k, Some(&v))?;
        }
    } else {
        // Incremental: only keys touched since the last run.
        let changed = changed_keys(tx, state.block_number, target)?;
        for key in changed {
            let current = tx.get(PLAIN_STATE, &key)?;
            apply_hashed(tx, &key, current.as_deref())?;
        }
    }
    state.update(tx, target)
}

fn unwind(state: &UnwindState, tx: &dyn RwTx) -> Result<()> {
    // Oldest entry in range wins: it holds the value as of the unwind point.
    let restored = oldest_previous_values(tx, state.unwind_point, state.current_block_number)?;
    for (key, prev) in restored {
        let value = if prev.is_empty() { None } else { Some(prev.as_slice()) };
        apply_hashed(tx, &key, value)?;
    }
    state.done(tx)
}

/// State keys touched in `(from, to]`, deduplicated.
fn changed_keys(tx: &dyn Tx, from: u64, to: u64) -> Result<Vec<Vec<u8>>> {
    let mut keys = std::collections::BTreeSet::new();
    for (bucket, key_len) in [(ACCOUNT_CHANGE_SET, 20), (STORAGE_CHANGE_SET, 52)] {
        walk_change_sets(tx, bucket, from, to, &mut |_, change| {
            if change.len() >= key_len {
                keys.insert(change[..key_len].to_vec());
            }
            Ok(())
        })?;
    }
    Ok(keys.into_iter().collect())
}

/// For every key touched in `(unwind_point, progress]`, its value as of the
/// unwind point (empty when the key did not exist).
fn oldest_previous_values(
    tx: &dyn Tx,
    unwind_point: u64,
    progress: u64,
) -> Result<BTreeMap<Vec<u8>, Vec<u8>>> {
    let mut restored = BTreeMap::new();
    for (bucket, key_len) in [(ACCOUNT_CHANGE_SET, 20), (STORAGE_CHANGE_SET, 52)] {
        walk_change_sets(tx, bucket, unwind_point, progress, &mut |_, change| {
            if change.len() >= key_len {
                let key = change[..key_len].to_vec();
                // Ascending walk: keep the first (oldest) entry per key.
                restored.entry(key).or_insert_with(|| change[key_len..].to_vec());
            }
            Ok(())
        })?;
    }
    Ok(restored)
}

/// Walks change-set duplicates for blocks in `(from, to]`, ascending.
pub(super) fn walk_change_sets(
    tx: &dyn Tx,
    bucket: &'static str,
    from: u64,
    to: u64,
    f: &mut dyn FnMut(u64, &[u8]) -> Result<()>,
) -> Result<()> {
    let mut cursor = tx.cursor_dup(bucket)?;
    let mut entry = cursor.seek(&encode_block_number(from + 1))?;
    while let Some((k, v)) = entry {
        let number = crate::keys::decode_block_number(&k)?;
        if number > to {
            break;
        }
        f(number, &v)?;
        entry = cursor.next()?;
    }
    Ok(())
}
