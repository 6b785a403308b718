//! Block-number list indexes.
//!
//! History, log and call-trace indexes share one shape: an indexed key
//! (address, storage key, topic) maps to the ascending list of block
//! numbers that touched it, postcard-encoded.

use std::collections::BTreeMap;

use strata_kv::{RwTx, Tx, TxExt};

use crate::error::Result;

use super::{decode_payload, encode_payload};

/// Loads an index list; a missing key is an empty list.
pub(crate) fn load_list(tx: &dyn Tx, bucket: &'static str, key: &[u8]) -> Result<Vec<u64>> {
    match tx.get(bucket, key)? {
        None => Ok(Vec::new()),
        Some(raw) => decode_payload(bucket, &raw),
    }
}

/// Stores an index list, deleting the key when the list drained.
pub(crate) fn store_list(
    tx: &dyn RwTx,
    bucket: &'static str,
    key: &[u8],
    list: &[u64],
) -> Result<()> {
    if list.is_empty() {
        tx.delete(bucket, key)?;
        Ok(())
    } else {
        tx.put(bucket, key, &encode_payload(bucket, &list)?)?;
        Ok(())
    }
}

/// Merges collected `key -> blocks` additions into the index bucket.
pub(crate) fn merge_additions(
    tx: &dyn RwTx,
    bucket: &'static str,
    additions: BTreeMap<Vec<u8>, Vec<u64>>,
) -> Result<()> {
    for (key, blocks) in additions {
        let mut list = load_list(tx, bucket, &key)?;
        for block in blocks {
            if list.last() != Some(&block) {
                list.push(block);
            }
        }
        store_list(tx, bucket, &key, &list)?;
    }
    Ok(())
}

/// Drops block numbers above `unwind_point` from the given keys.
pub(crate) fn unwind_keys(
    tx: &dyn RwTx,
    bucket: &'static str,
    keys: impl IntoIterator<Item = Vec<u8>>,
    unwind_point: u64,
) -> Result<()> {
    for key in keys {
        let mut list = load_list(tx, bucket, &key)?;
        list.retain(|&block| block <= unwind_point);
        store_list(tx, bucket, &key, &list)?;
    }
    Ok(())
}

/// Drops block numbers at or below `prune_point` from the whole bucket.
pub(crate) fn prune_bucket(tx: &dyn RwTx, bucket: &'static str, prune_point: u64) -> Result<()> {
    let mut keys = Vec::new();
    tx.for_each(bucket, b"", &mut |k, _| {
        keys.push(k.to_vec());
        Ok(true)
    })?;
    for key in keys {
        let mut list = load_list(tx, bucket, &key)?;
        let before = list.len();
        list.retain(|&block| block > prune_point);
        if list.len() != before {
            store_list(tx, bucket, &key, &list)?;
        }
    }
    Ok(())
}
