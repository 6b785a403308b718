//! End-to-end pipeline tests over the deterministic dev chain: full
//! forward cycles, reorg unwinds, reversibility and pruning.

use std::sync::Arc;

use strata_kv::buckets::{
    ACCOUNT_CHANGE_SET, ACCOUNT_HISTORY, CALL_FROM_INDEX, HASHED_ACCOUNTS, INTERMEDIATE_HASHES,
    LOGS, LOG_ADDRESS_INDEX, PLAIN_STATE, RECEIPTS, SENDERS, STORAGE_CHANGE_SET, TX_LOOKUP,
};
use strata_kv::{KvStore, KvStoreExt, MemKv, TxExt};
use strata_sync::dev::{DevChain, DevExecutor, DevSenderRecovery};
use strata_sync::progress::get_stage_progress;
use strata_sync::stages::{
    default_stages, verify_root, StageConfigs, DEFAULT_PRUNE_ORDER, DEFAULT_UNWIND_ORDER,
};
use strata_sync::sync::PruneMode;
use strata_sync::{ChainName, ChainSpec, StageId, Sync, SyncError, Unwinder};
use tokio_util::sync::CancellationToken;

fn dev_sync(chain: &Arc<DevChain>, prune: PruneMode) -> (Sync, Arc<dyn KvStore>) {
    let db: Arc<dyn KvStore> = Arc::new(MemKv::new());
    let cfg = StageConfigs {
        db: Arc::clone(&db),
        headers: Arc::clone(chain) as Arc<dyn strata_sync::stages::HeaderClient>,
        bodies: Arc::clone(chain) as Arc<dyn strata_sync::stages::BodyClient>,
        senders: Arc::new(DevSenderRecovery),
        executor: Arc::new(DevExecutor),
        batch_size: 1 << 20,
        storage_mode: "hrtce".parse().expect("storage mode"),
        target_block: None,
    };
    let sync = Sync::new(
        db.clone(),
        default_stages(&cfg),
        DEFAULT_UNWIND_ORDER.to_vec(),
        DEFAULT_PRUNE_ORDER.to_vec(),
        prune,
    )
    .expect("orchestrator");
    (sync, db)
}

fn progress(db: &Arc<dyn KvStore>, id: StageId) -> u64 {
    db.view(|tx| get_stage_progress(tx, id)).expect("progress")
}

fn dump(db: &Arc<dyn KvStore>, bucket: &str) -> Vec<(Vec<u8>, Vec<u8>)> {
    db.view(|tx| {
        let mut out = Vec::new();
        tx.for_each(bucket, b"", &mut |k, v| {
            out.push((k.to_vec(), v.to_vec()));
            Ok(true)
        })?;
        Ok::<_, SyncError>(out)
    })
    .expect("dump")
}

#[test]
fn full_cycle_reaches_head() {
    let chain = DevChain::new(ChainSpec::preset(ChainName::Mainnet), 6, 3);
    let (sync, db) = dev_sync(&chain, PruneMode::default());

    sync.run_cycle(true, &CancellationToken::new()).expect("cycle");

    for id in StageId::ALL {
        assert_eq!(progress(&db, id), 6, "stage {id} progress");
    }

    // Every derived family is populated.
    assert_eq!(dump(&db, SENDERS).len(), 6);
    assert_eq!(dump(&db, RECEIPTS).len(), 6);
    assert_eq!(dump(&db, LOGS).len(), 6);
    assert_eq!(dump(&db, TX_LOOKUP).len(), 18);
    assert!(!dump(&db, PLAIN_STATE).is_empty());
    assert!(!dump(&db, HASHED_ACCOUNTS).is_empty());
    assert!(!dump(&db, ACCOUNT_HISTORY).is_empty());
    assert!(!dump(&db, LOG_ADDRESS_INDEX).is_empty());
    assert!(!dump(&db, CALL_FROM_INDEX).is_empty());
    assert_eq!(dump(&db, INTERMEDIATE_HASHES).len(), 1);

    // The stored root verifies against a recomputation.
    db.view(|tx| verify_root(tx, 6)).expect("root verifies");
}

#[test]
fn progress_is_monotonic_across_cycles() {
    let chain = DevChain::new(ChainSpec::preset(ChainName::Mainnet), 4, 2);
    let (sync, db) = dev_sync(&chain, PruneMode::default());

    sync.run_cycle(true, &CancellationToken::new()).expect("first cycle");
    assert_eq!(progress(&db, StageId::Finish), 4);

    chain.extend(3, 2);
    sync.run_cycle(false, &CancellationToken::new()).expect("second cycle");
    assert_eq!(progress(&db, StageId::Finish), 7);
    for id in StageId::ALL {
        assert_eq!(progress(&db, id), 7, "stage {id} progress");
    }
}

#[test]
fn reorg_unwinds_and_follows_the_new_branch() {
    let chain = DevChain::new(ChainSpec::preset(ChainName::Mainnet), 6, 2);
    let (sync, db) = dev_sync(&chain, PruneMode::default());
    sync.run_cycle(true, &CancellationToken::new()).expect("initial sync");

    // The chain reorganizes below our head.
    chain.fork_from(3, 4, 2);
    sync.run_cycle(false, &CancellationToken::new()).expect("reorg cycle");

    for id in StageId::ALL {
        assert_eq!(progress(&db, id), 7, "stage {id} progress");
    }

    // State matches a node that synced the final chain from scratch.
    let fresh_chain = DevChain::new(ChainSpec::preset(ChainName::Mainnet), 0, 0);
    fresh_chain.extend(3, 2);
    fresh_chain.fork_from(3, 4, 2);
    let (fresh_sync, fresh_db) = dev_sync(&fresh_chain, PruneMode::default());
    fresh_sync.run_cycle(true, &CancellationToken::new()).expect("fresh sync");

    for bucket in [
        PLAIN_STATE,
        HASHED_ACCOUNTS,
        SENDERS,
        RECEIPTS,
        LOGS,
        TX_LOOKUP,
        ACCOUNT_HISTORY,
        ACCOUNT_CHANGE_SET,
        STORAGE_CHANGE_SET,
        INTERMEDIATE_HASHES,
    ] {
        assert_eq!(dump(&db, bucket), dump(&fresh_db, bucket), "bucket {bucket}");
    }
}

#[test]
fn unwind_then_forward_is_reversible() {
    // Unwinding and re-running forward lands on the same bytes as the
    // uninterrupted sync, for every content-addressed bucket. (`BlockBody`
    // re-assigns transaction ids from the monotonic sequence, so it is
    // excluded, as in the original.)
    let chain = DevChain::new(ChainSpec::preset(ChainName::Mainnet), 8, 2);

    let (straight_sync, straight_db) = dev_sync(&chain, PruneMode::default());
    straight_sync.run_cycle(true, &CancellationToken::new()).expect("straight sync");

    let (replay_sync, replay_db) = dev_sync(&chain, PruneMode::default());
    replay_sync.run_cycle(true, &CancellationToken::new()).expect("replay sync");
    replay_sync.unwind_to(4, None);
    replay_sync.run_cycle(false, &CancellationToken::new()).expect("unwind and reforward");

    assert_eq!(progress(&replay_db, StageId::Finish), 8);
    for bucket in [
        PLAIN_STATE,
        HASHED_ACCOUNTS,
        SENDERS,
        RECEIPTS,
        LOGS,
        TX_LOOKUP,
        ACCOUNT_HISTORY,
        ACCOUNT_CHANGE_SET,
        STORAGE_CHANGE_SET,
        INTERMEDIATE_HASHES,
    ] {
        assert_eq!(
            dump(&straight_db, bucket),
            dump(&replay_db, bucket),
            "bucket {bucket}"
        );
    }
}

#[test]
fn prune_drops_data_behind_the_horizon() {
    let chain = DevChain::new(ChainSpec::preset(ChainName::Mainnet), 6, 2);
    let (sync, db) = dev_sync(&chain, PruneMode { distance: Some(2) });

    sync.run_cycle(true, &CancellationToken::new()).expect("cycle");

    // Changesets and receipts at or below block 4 are gone; recent ones
    // survive. Progress is untouched.
    let changesets = dump(&db, ACCOUNT_CHANGE_SET);
    assert!(!changesets.is_empty());
    for (key, _) in &changesets {
        let number = u64::from_be_bytes(key[..8].try_into().expect("block key"));
        assert!(number > 4, "changeset for block {number} should be pruned");
    }
    let receipts = dump(&db, RECEIPTS);
    for (key, _) in &receipts {
        let number = u64::from_be_bytes(key[..8].try_into().expect("block key"));
        assert!(number > 4, "receipt for block {number} should be pruned");
    }
    assert_eq!(progress(&db, StageId::Execution), 6);
}

#[test]
fn cancellation_leaves_consistent_progress() {
    let chain = DevChain::new(ChainSpec::preset(ChainName::Mainnet), 5, 2);
    let (sync, db) = dev_sync(&chain, PruneMode::default());

    let token = CancellationToken::new();
    token.cancel();
    let err = sync.run_cycle(true, &token).expect_err("canceled");
    assert!(matches!(err, SyncError::Canceled));
    for id in StageId::ALL {
        assert_eq!(progress(&db, id), 0);
    }

    // A later cycle with a live token completes normally.
    sync.run_cycle(true, &CancellationToken::new()).expect("cycle");
    assert_eq!(progress(&db, StageId::Finish), 5);
}

#[test]
fn disabled_stages_keep_descriptors_but_do_not_run() {
    let chain = DevChain::new(ChainSpec::preset(ChainName::Mainnet), 4, 2);
    let db: Arc<dyn KvStore> = Arc::new(MemKv::new());
    let cfg = StageConfigs {
        db: Arc::clone(&db),
        headers: Arc::clone(&chain) as Arc<dyn strata_sync::stages::HeaderClient>,
        bodies: Arc::clone(&chain) as Arc<dyn strata_sync::stages::BodyClient>,
        senders: Arc::new(DevSenderRecovery),
        executor: Arc::new(DevExecutor),
        batch_size: 1 << 20,
        // No tx index, no call traces.
        storage_mode: "hr".parse().expect("storage mode"),
        target_block: None,
    };
    let stages = default_stages(&cfg);
    assert_eq!(stages.len(), 12);
    let sync = Sync::new(
        db.clone(),
        stages,
        DEFAULT_UNWIND_ORDER.to_vec(),
        DEFAULT_PRUNE_ORDER.to_vec(),
        PruneMode::default(),
    )
    .expect("orchestrator");

    sync.run_cycle(true, &CancellationToken::new()).expect("cycle");
    assert_eq!(progress(&db, StageId::Execution), 4);
    assert_eq!(progress(&db, StageId::TxLookup), 0);
    assert_eq!(progress(&db, StageId::CallTraces), 0);
    assert!(dump(&db, TX_LOOKUP).is_empty());
    assert!(dump(&db, CALL_FROM_INDEX).is_empty());
}
