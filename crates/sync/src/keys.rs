//! Key encodings shared across stages.
//!
//! Block-keyed buckets use an 8-byte big-endian block number so numeric
//! order equals lexicographic order; block data buckets append the 32-byte
//! header hash.

use sha2::{Digest, Sha256};

use crate::error::{Result, SyncError};

/// A 32-byte block or transaction hash.
pub type BlockHash = [u8; 32];

/// A 20-byte account address.
pub type Address = [u8; 20];

/// Big-endian block number.
pub fn encode_block_number(number: u64) -> [u8; 8] {
    number.to_be_bytes()
}

/// Parses the leading 8 bytes of a block-keyed entry.
pub fn decode_block_number(key: &[u8]) -> Result<u64> {
    let bytes: [u8; 8] = key
        .get(..8)
        .and_then(|s| s.try_into().ok())
        .ok_or(SyncError::MalformedKey { length: key.len() })?;
    Ok(u64::from_be_bytes(bytes))
}

/// `{block_num:8BE}{hash:32}` key for headers, bodies and senders.
pub fn block_key(number: u64, hash: &BlockHash) -> [u8; 40] {
    let mut key = [0u8; 40];
    key[..8].copy_from_slice(&number.to_be_bytes());
    key[8..].copy_from_slice(hash);
    key
}

/// Content hash of a raw transaction blob.
pub fn tx_hash(blob: &[u8]) -> BlockHash {
    let mut hasher = Sha256::new();
    hasher.update(blob);
    hasher.finalize().into()
}

/// Hash of a plain-state key part (address or storage slot).
pub fn hash_key(part: &[u8]) -> [u8; 32] {
    let mut hasher = Sha256::new();
    hasher.update(part);
    hasher.finalize().into()
}
