//! Stage identifiers and the persistent progress registry.
//!
//! Progress is the only source of truth for resumption: an 8-byte
//! big-endian block number per stage in the `SyncStageProgress` bucket,
//! keyed by the stage's ASCII id.

use strata_kv::buckets::{MIGRATIONS, SYNC_STAGE_PROGRESS};
use strata_kv::{RwTx, Tx, TxExt};

use crate::error::{Result, SyncError};

/// The canonical sync stages.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum StageId {
    /// Download and link block headers.
    Headers,
    /// Download block bodies.
    Bodies,
    /// Recover transaction senders.
    Senders,
    /// Execute blocks against the flat state.
    Execution,
    /// Re-key the flat state by hashed keys.
    HashState,
    /// Maintain per-block state roots.
    IntermediateHashes,
    /// Invert account change sets into a history index.
    AccountHistoryIndex,
    /// Invert storage change sets into a history index.
    StorageHistoryIndex,
    /// Index log topics and addresses.
    LogIndex,
    /// Index call-trace senders and recipients.
    CallTraces,
    /// Map transaction hashes to block numbers.
    TxLookup,
    /// Record the completed cycle head.
    Finish,
}

impl StageId {
    /// All stages in canonical pipeline order.
    pub const ALL: [StageId; 12] = [
        Self::Headers,
        Self::Bodies,
        Self::Senders,
        Self::Execution,
        Self::HashState,
        Self::IntermediateHashes,
        Self::AccountHistoryIndex,
        Self::StorageHistoryIndex,
        Self::LogIndex,
        Self::CallTraces,
        Self::TxLookup,
        Self::Finish,
    ];

    /// Stable ASCII id, also the progress bucket key.
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Headers => "Headers",
            Self::Bodies => "Bodies",
            Self::Senders => "Senders",
            Self::Execution => "Execution",
            Self::HashState => "HashState",
            Self::IntermediateHashes => "IntermediateHashes",
            Self::AccountHistoryIndex => "AccountHistoryIndex",
            Self::StorageHistoryIndex => "StorageHistoryIndex",
            Self::LogIndex => "LogIndex",
            Self::CallTraces => "CallTraces",
            Self::TxLookup => "TxLookup",
            Self::Finish => "Finish",
        }
    }
}

impl std::fmt::Display for StageId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Reads a stage's persisted progress. A missing key means block 0.
pub fn get_stage_progress(tx: &dyn Tx, stage: StageId) -> Result<u64> {
    match tx.get(SYNC_STAGE_PROGRESS, stage.as_str().as_bytes())? {
        None => Ok(0),
        Some(v) => {
            let bytes: [u8; 8] = v
                .as_slice()
                .try_into()
                .map_err(|_| SyncError::InvalidProgress { stage, length: v.len() })?;
            Ok(u64::from_be_bytes(bytes))
        },
    }
}

/// Persists a stage's progress.
pub fn save_stage_progress(tx: &dyn RwTx, stage: StageId, block: u64) -> Result<()> {
    tx.put(SYNC_STAGE_PROGRESS, stage.as_str().as_bytes(), &block.to_be_bytes())?;
    Ok(())
}

/// Names of all applied migrations, sorted.
pub fn applied_migrations(tx: &dyn Tx) -> Result<Vec<String>> {
    let mut names = Vec::new();
    tx.for_each(MIGRATIONS, b"", &mut |k, _| {
        names.push(String::from_utf8_lossy(k).into_owned());
        Ok(true)
    })?;
    names.sort();
    Ok(names)
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use strata_kv::buckets::SYNC_STAGE_PROGRESS;
    use strata_kv::{KvStoreExt, MemKv};

    use super::*;

    #[test]
    fn test_stage_ids_unique() {
        let mut names: Vec<&str> = StageId::ALL.iter().map(|s| s.as_str()).collect();
        names.sort_unstable();
        names.dedup();
        assert_eq!(names.len(), StageId::ALL.len());
    }

    #[test]
    fn test_missing_progress_is_zero() {
        let kv = MemKv::new();
        let got = kv.view(|tx| get_stage_progress(tx, StageId::Execution)).unwrap();
        assert_eq!(got, 0);
    }

    #[test]
    fn test_progress_round_trip_bytes() {
        let kv = MemKv::new();
        kv.update(|tx| save_stage_progress(tx, StageId::Execution, 1_000_000)).unwrap();

        let raw = kv
            .view(|tx| tx.get(SYNC_STAGE_PROGRESS, b"Execution").map_err(SyncError::from))
            .unwrap()
            .unwrap();
        assert_eq!(raw, vec![0x00, 0x00, 0x00, 0x00, 0x00, 0x0F, 0x42, 0x40]);

        let got = kv.view(|tx| get_stage_progress(tx, StageId::Execution)).unwrap();
        assert_eq!(got, 1_000_000);
    }

    #[test]
    fn test_short_progress_value_is_an_error() {
        let kv = MemKv::new();
        kv.update(|tx| {
            tx.put(SYNC_STAGE_PROGRESS, b"Bodies", &[1, 2, 3])?;
            Ok::<(), strata_kv::Error>(())
        })
        .unwrap();
        let err = kv.view(|tx| get_stage_progress(tx, StageId::Bodies)).unwrap_err();
        assert!(matches!(err, SyncError::InvalidProgress { length: 3, .. }));
    }

    #[test]
    fn test_applied_migrations_sorted() {
        let kv = MemKv::new();
        kv.update(|tx| {
            tx.put(strata_kv::buckets::MIGRATIONS, b"zeta", b"")?;
            tx.put(strata_kv::buckets::MIGRATIONS, b"alpha", b"")?;
            Ok::<(), strata_kv::Error>(())
        })
        .unwrap();
        let names = kv.view(|tx| applied_migrations(tx)).unwrap();
        assert_eq!(names, vec!["alpha".to_string(), "zeta".to_string()]);
    }
}
