//! The default stage pipeline.
//!
//! Forward order: Headers → Bodies → Senders → Execution → HashState →
//! IntermediateHashes → AccountHistoryIndex → StorageHistoryIndex →
//! LogIndex → CallTraces → TxLookup → Finish.
//!
//! Heavy kernels stay behind the collaborator traits below; the remaining
//! stages are bucket transforms. Every stage follows the same transaction
//! idiom: use the caller's transaction when one is passed, otherwise begin
//! and commit its own.

mod bodies;
mod call_traces;
mod execution;
mod finish;
mod hash_state;
mod headers;
mod history_index;
mod index;
mod log_index;
mod senders;
mod trie;
mod tx_lookup;

pub use bodies::BodiesCfg;
pub use call_traces::CallTracesCfg;
pub use execution::ExecutionCfg;
pub use finish::FinishCfg;
pub use hash_state::HashStateCfg;
pub use headers::HeadersCfg;
pub use history_index::HistoryIndexCfg;
pub use log_index::LogIndexCfg;
pub use senders::SendersCfg;
pub use trie::{verify_root, TrieCfg};
pub use tx_lookup::TxLookupCfg;

use std::sync::Arc;

use serde::{Deserialize, Serialize};
use strata_kv::buckets::{
    self, ACCOUNT_CHANGE_SET, BLOCK_BODY, CALL_FROM_INDEX, CALL_TO_INDEX, CALL_TRACE_SET, CODE,
    ETH_TX, HASHED_ACCOUNTS, HASHED_STORAGE, HEADERS, HEADER_CANONICAL, INTERMEDIATE_HASHES, LOGS,
    LOG_ADDRESS_INDEX, LOG_TOPIC_INDEX, PLAIN_CONTRACT_CODE, PLAIN_STATE, RECEIPTS, SENDERS,
    STORAGE_CHANGE_SET, TX_LOOKUP,
};
use strata_kv::{KvStore, RwTx, StorageMode, Tx, TxExt};

use crate::error::{Result, SyncError};
use crate::keys::{block_key, decode_block_number, encode_block_number, Address, BlockHash};
use crate::progress::{save_stage_progress, StageId};
use crate::stage::Stage;

// ---------------------------------------------------------------------------
// Collaborator traits (external kernels)
// ---------------------------------------------------------------------------

/// A header delivered by the network layer.
#[derive(Debug, Clone)]
pub struct NewHeader {
    pub number: u64,
    pub hash: BlockHash,
    pub parent_hash: BlockHash,
    /// Encoded header, stored opaquely.
    pub raw: Vec<u8>,
}

/// Source of canonical headers (the P2P download server in production).
pub trait HeaderClient: Send + Sync {
    /// Headers strictly above `from`, in ascending order, up to `target`
    /// when set. An empty vec means nothing new is available.
    fn next_headers(&self, from: u64, target: Option<u64>) -> Result<Vec<NewHeader>>;
}

/// Source of block bodies.
pub trait BodyClient: Send + Sync {
    /// Raw transactions of the given block, or `None` while the body is
    /// still in flight.
    fn body(&self, number: u64, hash: &BlockHash) -> Result<Option<Vec<Vec<u8>>>>;
}

/// Recovers the sender address of a raw transaction.
pub trait SenderRecovery: Send + Sync {
    fn recover(&self, tx_blob: &[u8]) -> Result<Address>;
}

/// A block handed to the executor.
pub struct ExecutedBlock<'a> {
    pub number: u64,
    pub hash: BlockHash,
    pub txs: &'a [Vec<u8>],
    pub senders: &'a [Address],
}

/// Executes one block against the flat state.
///
/// Contract: inside the given transaction the executor updates `PlainState`
/// (and code buckets), records the previous value of every touched key in
/// the change-set buckets, and writes `Receipts`, `Logs` and `CallTraceSet`
/// for the block as configured by the storage mode.
pub trait BlockExecutor: Send + Sync {
    fn execute_block(&self, tx: &dyn RwTx, block: &ExecutedBlock<'_>) -> Result<()>;
}

// ---------------------------------------------------------------------------
// Stored payloads
// ---------------------------------------------------------------------------

/// Body metadata: transactions live in `EthTx` under sequential ids.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct BodyForStorage {
    pub base_tx_id: u64,
    pub tx_amount: u32,
}

/// One log record, stored per block under `Logs`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LogEntry {
    pub address: Address,
    pub topics: Vec<[u8; 32]>,
}

/// Call-trace flag bits appended to the address in `CallTraceSet` values.
pub const CALL_FROM: u8 = 0b01;
/// See [`CALL_FROM`].
pub const CALL_TO: u8 = 0b10;

pub(crate) fn encode_payload<T: Serialize>(bucket: &'static str, value: &T) -> Result<Vec<u8>> {
    postcard::to_allocvec(value).map_err(|source| SyncError::Codec { bucket, source })
}

pub(crate) fn decode_payload<T: for<'de> Deserialize<'de>>(
    bucket: &'static str,
    bytes: &[u8],
) -> Result<T> {
    postcard::from_bytes(bytes).map_err(|source| SyncError::Codec { bucket, source })
}

// ---------------------------------------------------------------------------
// Shared stage plumbing
// ---------------------------------------------------------------------------

/// Runs `f` in the external transaction when one was passed, otherwise in a
/// fresh transaction committed on success.
pub(crate) fn run_in_tx(
    db: &Arc<dyn KvStore>,
    external: Option<&dyn RwTx>,
    f: impl FnOnce(&dyn RwTx) -> Result<()>,
) -> Result<()> {
    match external {
        Some(tx) => f(tx),
        None => {
            let tx = db.begin_rw()?;
            match f(tx.as_ref()) {
                Ok(()) => {
                    tx.commit()?;
                    Ok(())
                },
                Err(e) => {
                    tx.rollback();
                    Err(e)
                },
            }
        },
    }
}

/// Canonical header hash of a block.
pub(crate) fn canonical_hash(tx: &dyn Tx, number: u64) -> Result<BlockHash> {
    let value = tx
        .get(HEADER_CANONICAL, &encode_block_number(number))?
        .ok_or(SyncError::MissingCanonicalHash { number })?;
    value.as_slice().try_into().map_err(|_| SyncError::MissingCanonicalHash { number })
}

/// Body metadata for a block, if stored.
pub(crate) fn read_body(tx: &dyn Tx, number: u64, hash: &BlockHash) -> Result<Option<BodyForStorage>> {
    match tx.get(BLOCK_BODY, &block_key(number, hash))? {
        None => Ok(None),
        Some(raw) => Ok(Some(decode_payload(BLOCK_BODY, &raw)?)),
    }
}

/// The raw transactions referenced by a body.
pub(crate) fn read_block_txs(tx: &dyn Tx, number: u64, body: &BodyForStorage) -> Result<Vec<Vec<u8>>> {
    let mut txs = Vec::with_capacity(body.tx_amount as usize);
    for tx_id in body.base_tx_id..body.base_tx_id + u64::from(body.tx_amount) {
        let blob = tx
            .get(ETH_TX, &encode_block_number(tx_id))?
            .ok_or(SyncError::BadBody { number })?;
        txs.push(blob);
    }
    Ok(txs)
}

/// Deletes every entry of a block-keyed bucket with number strictly above
/// `unwind_point`.
pub(crate) fn delete_block_keyed_above(
    tx: &dyn RwTx,
    bucket: &'static str,
    unwind_point: u64,
) -> Result<()> {
    let keys = collect_block_keyed(tx, bucket, unwind_point + 1, None)?;
    for key in keys {
        tx.delete(bucket, &key)?;
    }
    Ok(())
}

/// Deletes every entry of a block-keyed bucket with number at or below
/// `prune_point`.
pub(crate) fn prune_block_keyed(tx: &dyn RwTx, bucket: &'static str, prune_point: u64) -> Result<()> {
    let keys = collect_block_keyed(tx, bucket, 0, Some(prune_point))?;
    for key in keys {
        tx.delete(bucket, &key)?;
    }
    Ok(())
}

/// Keys of a block-keyed bucket in `[from, to]` (`to` unbounded when None).
fn collect_block_keyed(
    tx: &dyn Tx,
    bucket: &str,
    from: u64,
    to: Option<u64>,
) -> Result<Vec<Vec<u8>>> {
    let mut keys = Vec::new();
    let mut walk_err = None;
    tx.for_each(bucket, &encode_block_number(from), &mut |k, _| {
        let number = match decode_block_number(k) {
            Ok(n) => n,
            Err(e) => {
                walk_err = Some(e);
                return Ok(false);
            },
        };
        if let Some(to) = to {
            if number > to {
                return Ok(false);
            }
        }
        keys.push(k.to_vec());
        Ok(true)
    })?;
    match walk_err {
        Some(e) => Err(e),
        None => Ok(keys),
    }
}

// ---------------------------------------------------------------------------
// Pipeline wiring
// ---------------------------------------------------------------------------

/// Everything the default pipeline needs.
pub struct StageConfigs {
    pub db: Arc<dyn KvStore>,
    pub headers: Arc<dyn HeaderClient>,
    pub bodies: Arc<dyn BodyClient>,
    pub senders: Arc<dyn SenderRecovery>,
    pub executor: Arc<dyn BlockExecutor>,
    /// Execution commit budget in bytes when the stage owns its
    /// transaction.
    pub batch_size: u64,
    pub storage_mode: StorageMode,
    /// Optional forward target override (CLI `--block`).
    pub target_block: Option<u64>,
}

/// The twelve stages in forward order, wired from `cfg`.
///
/// Stages excluded by the storage mode keep their descriptors but are
/// disabled.
pub fn default_stages(cfg: &StageConfigs) -> Vec<Stage> {
    let mode = cfg.storage_mode;
    vec![
        headers::stage(HeadersCfg {
            db: Arc::clone(&cfg.db),
            client: Arc::clone(&cfg.headers),
            target: cfg.target_block,
        }),
        bodies::stage(BodiesCfg { db: Arc::clone(&cfg.db), client: Arc::clone(&cfg.bodies) }),
        senders::stage(SendersCfg { db: Arc::clone(&cfg.db), recovery: Arc::clone(&cfg.senders) }),
        execution::stage(ExecutionCfg {
            db: Arc::clone(&cfg.db),
            executor: Arc::clone(&cfg.executor),
            batch_size: cfg.batch_size,
        }),
        hash_state::stage(HashStateCfg { db: Arc::clone(&cfg.db) }),
        trie::stage(TrieCfg { db: Arc::clone(&cfg.db) }),
        history_index::account_stage(
            HistoryIndexCfg { db: Arc::clone(&cfg.db) },
            !mode.history,
        ),
        history_index::storage_stage(
            HistoryIndexCfg { db: Arc::clone(&cfg.db) },
            !mode.history,
        ),
        log_index::stage(LogIndexCfg { db: Arc::clone(&cfg.db) }, !mode.receipts),
        call_traces::stage(CallTracesCfg { db: Arc::clone(&cfg.db) }, !mode.call_traces),
        tx_lookup::stage(TxLookupCfg { db: Arc::clone(&cfg.db) }, !mode.tx_index),
        finish::stage(FinishCfg { db: Arc::clone(&cfg.db) }),
    ]
}

/// Default unwind order: derived data first, headers last. HashState and
/// IntermediateHashes share the hashed-state position ahead of Execution.
pub const DEFAULT_UNWIND_ORDER: [StageId; 12] = [
    StageId::Finish,
    StageId::TxLookup,
    StageId::CallTraces,
    StageId::LogIndex,
    StageId::StorageHistoryIndex,
    StageId::AccountHistoryIndex,
    StageId::HashState,
    StageId::IntermediateHashes,
    StageId::Execution,
    StageId::Senders,
    StageId::Bodies,
    StageId::Headers,
];

/// Default prune order: same as the unwind order, so derived data is
/// dropped before the source data it would need to interpret.
pub const DEFAULT_PRUNE_ORDER: [StageId; 12] = DEFAULT_UNWIND_ORDER;

/// Buckets owned by each stage, for `--reset`.
pub fn stage_buckets(id: StageId) -> &'static [&'static str] {
    match id {
        StageId::Headers => &[HEADERS, HEADER_CANONICAL],
        StageId::Bodies => &[BLOCK_BODY, ETH_TX],
        StageId::Senders => &[SENDERS],
        StageId::Execution => &[
            PLAIN_STATE,
            PLAIN_CONTRACT_CODE,
            CODE,
            ACCOUNT_CHANGE_SET,
            STORAGE_CHANGE_SET,
            RECEIPTS,
            LOGS,
            CALL_TRACE_SET,
        ],
        StageId::HashState => &[HASHED_ACCOUNTS, HASHED_STORAGE],
        StageId::IntermediateHashes => &[INTERMEDIATE_HASHES],
        StageId::AccountHistoryIndex => &[buckets::ACCOUNT_HISTORY],
        StageId::StorageHistoryIndex => &[buckets::STORAGE_HISTORY],
        StageId::LogIndex => &[LOG_TOPIC_INDEX, LOG_ADDRESS_INDEX],
        StageId::CallTraces => &[CALL_FROM_INDEX, CALL_TO_INDEX],
        StageId::TxLookup => &[TX_LOOKUP],
        StageId::Finish => &[],
    }
}

/// Clears a stage's buckets and zeroes its progress.
pub fn reset_stage(tx: &dyn RwTx, id: StageId) -> Result<()> {
    for bucket in stage_buckets(id) {
        tx.clear_bucket(bucket)?;
    }
    save_stage_progress(tx, id, 0)
}

/// Cancellation check used at stage loop boundaries.
pub(crate) fn check_canceled(token: &tokio_util::sync::CancellationToken) -> Result<()> {
    if token.is_cancelled() {
        return Err(SyncError::Canceled);
    }
    Ok(())
}
