//! Deterministic in-process chain.
//!
//! Stands in for the network and execution collaborators in tests and the
//! integration tool's dev mode. Blocks, transactions and state transitions
//! are derived from the chain spec and block number alone, so two nodes
//! replaying the same chain produce byte-identical buckets.
//!
//! The model is a toy balance ledger: a transaction moves `amount` from
//! one account to another, bumps the recipient's receive counter in a
//! storage slot, emits one log, and traces the caller and callee.

use std::collections::BTreeMap;
use std::sync::Arc;

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use strata_kv::buckets::{
    ACCOUNT_CHANGE_SET, CALL_TRACE_SET, LOGS, PLAIN_STATE, RECEIPTS, STORAGE_CHANGE_SET,
};
use strata_kv::RwTx;

use crate::chain::ChainSpec;
use crate::error::{Result, SyncError};
use crate::keys::{encode_block_number, tx_hash, Address, BlockHash};
use crate::stages::{
    encode_payload, BlockExecutor, BodyClient, ExecutedBlock, HeaderClient, LogEntry, NewHeader,
    SenderRecovery, CALL_FROM, CALL_TO,
};

/// A raw dev transaction, postcard-encoded into the `EthTx` bucket.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DevTx {
    pub from: Address,
    pub to: Address,
    pub amount: u64,
    pub nonce: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct DevHeader {
    number: u64,
    parent_hash: BlockHash,
    tx_root: BlockHash,
    /// Distinguishes forks of the same height.
    salt: u64,
}

#[derive(Debug, Clone)]
struct DevBlock {
    number: u64,
    hash: BlockHash,
    parent_hash: BlockHash,
    raw_header: Vec<u8>,
    txs: Vec<Vec<u8>>,
}

/// The canonical dev chain, extendable and forkable from tests.
pub struct DevChain {
    spec: ChainSpec,
    blocks: Mutex<Vec<DevBlock>>,
    /// Lowest fork ancestor so far; headers above it are re-announced so a
    /// syncing node can discover the divergence, as a real downloader
    /// would.
    fork_base: Mutex<Option<u64>>,
}

impl DevChain {
    /// A chain of `length` blocks above genesis, `txs_per_block` each.
    pub fn new(spec: ChainSpec, length: u64, txs_per_block: usize) -> Arc<Self> {
        let chain = Arc::new(Self { spec, blocks: Mutex::new(Vec::new()), fork_base: Mutex::new(None) });
        chain.extend(length, txs_per_block);
        chain
    }

    /// Current head block number.
    pub fn head(&self) -> u64 {
        self.blocks.lock().last().map_or(0, |b| b.number)
    }

    /// Appends `count` blocks to the head.
    pub fn extend(&self, count: u64, txs_per_block: usize) {
        let mut blocks = self.blocks.lock();
        for _ in 0..count {
            let (number, parent_hash) = match blocks.last() {
                Some(parent) => (parent.number + 1, parent.hash),
                None => (1, self.spec.genesis_hash),
            };
            blocks.push(make_block(number, parent_hash, txs_per_block, 0));
        }
    }

    /// Replaces everything above `ancestor` with a diverging branch of
    /// `count` blocks, as a reorg would.
    pub fn fork_from(&self, ancestor: u64, count: u64, txs_per_block: usize) {
        let mut base = self.fork_base.lock();
        *base = Some(base.map_or(ancestor, |b| b.min(ancestor)));
        let mut blocks = self.blocks.lock();
        blocks.retain(|b| b.number <= ancestor);
        for _ in 0..count {
            let (number, parent_hash) = match blocks.last() {
                Some(parent) => (parent.number + 1, parent.hash),
                None => (1, self.spec.genesis_hash),
            };
            blocks.push(make_block(number, parent_hash, txs_per_block, 1));
        }
    }
}

fn dev_address(index: u64) -> Address {
    let digest = Sha256::digest(index.to_be_bytes());
    let mut address = [0u8; 20];
    address.copy_from_slice(&digest[..20]);
    address
}

fn make_block(number: u64, parent_hash: BlockHash, tx_count: usize, salt: u64) -> DevBlock {
    let mut txs = Vec::with_capacity(tx_count);
    for j in 0..tx_count as u64 {
        let tx = DevTx {
            from: dev_address((number + j) % 5 + 1),
            to: dev_address((number + 2 * j) % 5 + 1),
            amount: (number * 10 + j) % 7 + 1,
            nonce: number * 1_000 + j + salt * 1_000_000,
        };
        // Infallible for a plain struct of integers and arrays.
        txs.push(postcard::to_allocvec(&tx).unwrap_or_default());
    }

    let mut root = Sha256::new();
    for tx in &txs {
        root.update(tx);
    }
    let header = DevHeader { number, parent_hash, tx_root: root.finalize().into(), salt };
    let raw_header = postcard::to_allocvec(&header).unwrap_or_default();
    let hash = Sha256::digest(&raw_header).into();
    DevBlock { number, hash, parent_hash, raw_header, txs }
}

impl HeaderClient for DevChain {
    fn next_headers(&self, from: u64, target: Option<u64>) -> Result<Vec<NewHeader>> {
        let from = match *self.fork_base.lock() {
            Some(base) => from.min(base),
            None => from,
        };
        let blocks = self.blocks.lock();
        Ok(blocks
            .iter()
            .filter(|b| b.number > from && target.is_none_or(|t| b.number <= t))
            .map(|b| NewHeader {
                number: b.number,
                hash: b.hash,
                parent_hash: b.parent_hash,
                raw: b.raw_header.clone(),
            })
            .collect())
    }
}

impl BodyClient for DevChain {
    fn body(&self, number: u64, hash: &BlockHash) -> Result<Option<Vec<Vec<u8>>>> {
        let blocks = self.blocks.lock();
        Ok(blocks.iter().find(|b| b.number == number && b.hash == *hash).map(|b| b.txs.clone()))
    }
}

/// Reads the sender straight out of the dev transaction encoding.
pub struct DevSenderRecovery;

impl SenderRecovery for DevSenderRecovery {
    fn recover(&self, tx_blob: &[u8]) -> Result<Address> {
        let tx: DevTx = postcard::from_bytes(tx_blob).map_err(|e| SyncError::Collaborator {
            component: "dev sender recovery",
            message: e.to_string(),
        })?;
        Ok(tx.from)
    }
}

/// Applies the toy balance ledger and records every artifact the index
/// stages consume.
pub struct DevExecutor;

impl DevExecutor {
    fn balance(raw: Option<&[u8]>) -> u64 {
        raw.and_then(|v| v.get(..8))
            .and_then(|s| s.try_into().ok())
            .map_or(0, u64::from_be_bytes)
    }
}

impl BlockExecutor for DevExecutor {
    fn execute_block(&self, tx: &dyn RwTx, block: &ExecutedBlock<'_>) -> Result<()> {
        let mut previous: BTreeMap<Vec<u8>, Vec<u8>> = BTreeMap::new();
        let mut logs = Vec::new();
        let mut traces = std::collections::BTreeSet::new();
        let mut gas = Vec::new();

        let mut touch = |tx: &dyn RwTx, key: &[u8]| -> Result<()> {
            if !previous.contains_key(key) {
                previous.insert(key.to_vec(), tx.get(PLAIN_STATE, key)?.unwrap_or_default());
            }
            Ok(())
        };

        for (blob, sender) in block.txs.iter().zip(block.senders) {
            let dev_tx: DevTx = postcard::from_bytes(blob).map_err(|e| SyncError::Collaborator {
                component: "dev executor",
                message: e.to_string(),
            })?;

            // Balances.
            touch(tx, &dev_tx.from)?;
            touch(tx, &dev_tx.to)?;
            let from_balance = Self::balance(tx.get(PLAIN_STATE, &dev_tx.from)?.as_deref());
            let to_balance = Self::balance(tx.get(PLAIN_STATE, &dev_tx.to)?.as_deref());
            let moved = dev_tx.amount.min(from_balance).max(1);
            tx.put(
                PLAIN_STATE,
                &dev_tx.from,
                &from_balance.saturating_sub(moved).to_be_bytes(),
            )?;
            tx.put(PLAIN_STATE, &dev_tx.to, &(to_balance + moved).to_be_bytes())?;

            // Recipient receive counter in storage slot 0.
            let mut slot_key = Vec::with_capacity(52);
            slot_key.extend_from_slice(&dev_tx.to);
            slot_key.extend_from_slice(&[0u8; 32]);
            touch(tx, &slot_key)?;
            let count = Self::balance(tx.get(PLAIN_STATE, &slot_key)?.as_deref());
            tx.put(PLAIN_STATE, &slot_key, &(count + 1).to_be_bytes())?;

            logs.push(LogEntry { address: dev_tx.to, topics: vec![tx_hash(blob)] });
            traces.insert((*sender, CALL_FROM));
            traces.insert((dev_tx.to, CALL_TO));
            gas.push(moved);
        }

        // Change sets: one `{key}{previous_value}` duplicate per touched key.
        let block_key = encode_block_number(block.number);
        for (key, prev) in previous {
            let bucket = if key.len() == 20 { ACCOUNT_CHANGE_SET } else { STORAGE_CHANGE_SET };
            let mut change = key;
            change.extend_from_slice(&prev);
            tx.put(bucket, &block_key, &change)?;
        }
        tx.put(RECEIPTS, &block_key, &encode_payload(RECEIPTS, &gas)?)?;
        tx.put(LOGS, &block_key, &encode_payload(LOGS, &logs)?)?;
        for (address, flag) in traces {
            let mut trace = address.to_vec();
            trace.push(flag);
            tx.put(CALL_TRACE_SET, &block_key, &trace)?;
        }
        Ok(())
    }
}
