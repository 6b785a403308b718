//! Fixed bucket registry for the sync pipeline.
//!
//! Every bucket the pipeline touches is known at compile time. The registry
//! also carries the two pieces of overlay metadata: which buckets are
//! dup-sorted, and which buckets are served by a snapshot store.

/// Block headers: `{block_num:8BE}{header_hash:32}` -> encoded header.
pub const HEADERS: &str = "Headers";
/// Canonical chain markers: `{block_num:8BE}` -> `{header_hash:32}`.
pub const HEADER_CANONICAL: &str = "HeaderCanonical";
/// Block bodies: `{block_num:8BE}{header_hash:32}` -> body metadata.
pub const BLOCK_BODY: &str = "BlockBody";
/// Transactions by sequential id: `{tx_id:8BE}` -> raw transaction.
pub const ETH_TX: &str = "EthTx";
/// Recovered senders: `{block_num:8BE}{header_hash:32}` -> concatenated addresses.
pub const SENDERS: &str = "Senders";
/// Flat current state: address / address+slot -> value.
pub const PLAIN_STATE: &str = "PlainState";
/// Contract code hash by address.
pub const PLAIN_CONTRACT_CODE: &str = "PlainContractCode";
/// Contract code by code hash.
pub const CODE: &str = "Code";
/// State re-keyed by hashed address.
pub const HASHED_ACCOUNTS: &str = "HashedAccounts";
/// Storage re-keyed by hashed address and hashed slot.
pub const HASHED_STORAGE: &str = "HashedStorage";
/// Per-block state roots: `{block_num:8BE}` -> 32-byte root.
pub const INTERMEDIATE_HASHES: &str = "IntermediateHashes";
/// Dup-sorted account change sets: `{block_num:8BE}` -> `{address:20}{prev_value}`.
pub const ACCOUNT_CHANGE_SET: &str = "AccountChangeSet";
/// Dup-sorted storage change sets: `{block_num:8BE}` -> `{address:20}{slot:32}{prev_value}`.
pub const STORAGE_CHANGE_SET: &str = "StorageChangeSet";
/// Account history index: address -> block-number list.
pub const ACCOUNT_HISTORY: &str = "AccountHistory";
/// Storage history index: address+slot -> block-number list.
pub const STORAGE_HISTORY: &str = "StorageHistory";
/// Per-block logs: `{block_num:8BE}` -> encoded log entries.
pub const LOGS: &str = "Logs";
/// Log topic index: topic -> block-number list.
pub const LOG_TOPIC_INDEX: &str = "LogTopicIndex";
/// Log address index: address -> block-number list.
pub const LOG_ADDRESS_INDEX: &str = "LogAddressIndex";
/// Dup-sorted call traces: `{block_num:8BE}` -> `{address:20}{flags:1}`.
pub const CALL_TRACE_SET: &str = "CallTraceSet";
/// Call-from index: address -> block-number list.
pub const CALL_FROM_INDEX: &str = "CallFromIndex";
/// Call-to index: address -> block-number list.
pub const CALL_TO_INDEX: &str = "CallToIndex";
/// Per-block receipts: `{block_num:8BE}` -> encoded receipts.
pub const RECEIPTS: &str = "Receipts";
/// Transaction lookup: `{tx_hash:32}` -> `{block_num:8BE}`.
pub const TX_LOOKUP: &str = "TxLookup";
/// Per-stage sync progress: stage id (ASCII) -> `{block_num:8BE}`.
pub const SYNC_STAGE_PROGRESS: &str = "SyncStageProgress";
/// Applied migrations: migration name (ASCII) -> optional payload.
pub const MIGRATIONS: &str = "Migrations";
/// Database metadata: storage mode flags and friends.
pub const DB_INFO: &str = "DbInfo";
/// Reserved bucket backing the per-bucket sequence counters.
pub const SEQUENCES: &str = "Sequences";

/// Every bucket, in schema order.
pub const ALL: &[&str] = &[
    HEADERS,
    HEADER_CANONICAL,
    BLOCK_BODY,
    ETH_TX,
    SENDERS,
    PLAIN_STATE,
    PLAIN_CONTRACT_CODE,
    CODE,
    HASHED_ACCOUNTS,
    HASHED_STORAGE,
    INTERMEDIATE_HASHES,
    ACCOUNT_CHANGE_SET,
    STORAGE_CHANGE_SET,
    ACCOUNT_HISTORY,
    STORAGE_HISTORY,
    LOGS,
    LOG_TOPIC_INDEX,
    LOG_ADDRESS_INDEX,
    CALL_TRACE_SET,
    CALL_FROM_INDEX,
    CALL_TO_INDEX,
    RECEIPTS,
    TX_LOOKUP,
    SYNC_STAGE_PROGRESS,
    MIGRATIONS,
    DB_INFO,
    SEQUENCES,
];

/// Buckets that store multiple sorted values per key.
pub const DUP_SORTED: &[&str] = &[ACCOUNT_CHANGE_SET, STORAGE_CHANGE_SET, CALL_TRACE_SET];

/// Returns true if the bucket is dup-sorted.
pub fn is_dup_sorted(bucket: &str) -> bool {
    DUP_SORTED.contains(&bucket)
}

/// The snapshot store family a bucket can be served from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SnapshotTag {
    /// Header data.
    Headers,
    /// Block bodies and transactions.
    Bodies,
    /// Flat state and contract code.
    State,
}

impl SnapshotTag {
    /// Short name used in logs and the overlay API.
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Headers => "headers",
            Self::Bodies => "bodies",
            Self::State => "state",
        }
    }
}

impl std::fmt::Display for SnapshotTag {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Routing table: which snapshot store (if any) serves this bucket.
///
/// Buckets not listed here are hot-only and never consult a snapshot.
pub fn snapshot_tag(bucket: &str) -> Option<SnapshotTag> {
    match bucket {
        HEADERS => Some(SnapshotTag::Headers),
        BLOCK_BODY | ETH_TX => Some(SnapshotTag::Bodies),
        PLAIN_STATE | PLAIN_CONTRACT_CODE | CODE => Some(SnapshotTag::State),
        _ => None,
    }
}

/// The one-byte sentinel marking a key deleted in the hot store while a
/// snapshot still holds a value for it.
///
/// Buckets routed to snapshots must never store the literal value `[0x00]`;
/// the overlay cannot distinguish it from a deletion.
pub const TOMBSTONE: &[u8] = &[0x00];

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_all_buckets_unique() {
        let mut names: Vec<&str> = ALL.to_vec();
        names.sort_unstable();
        names.dedup();
        assert_eq!(names.len(), ALL.len());
    }

    #[test]
    fn test_dup_sorted_buckets_are_registered() {
        for bucket in DUP_SORTED {
            assert!(ALL.contains(bucket), "{bucket} missing from ALL");
        }
    }

    #[test]
    fn test_routing_table() {
        assert_eq!(snapshot_tag(HEADERS), Some(SnapshotTag::Headers));
        assert_eq!(snapshot_tag(BLOCK_BODY), Some(SnapshotTag::Bodies));
        assert_eq!(snapshot_tag(ETH_TX), Some(SnapshotTag::Bodies));
        assert_eq!(snapshot_tag(PLAIN_STATE), Some(SnapshotTag::State));
        assert_eq!(snapshot_tag(PLAIN_CONTRACT_CODE), Some(SnapshotTag::State));
        assert_eq!(snapshot_tag(CODE), Some(SnapshotTag::State));
        assert_eq!(snapshot_tag(SYNC_STAGE_PROGRESS), None);
        assert_eq!(snapshot_tag(TX_LOOKUP), None);
    }

    #[test]
    fn test_tombstone_is_single_zero_byte() {
        assert_eq!(TOMBSTONE, &[0u8]);
    }
}
