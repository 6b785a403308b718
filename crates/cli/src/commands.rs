//! Command implementations.

use std::path::Path;
use std::sync::Arc;

use strata_kv::{KvStore, KvStoreExt, MemKv, SnapshotKvBuilder, StorageMode};
use strata_sync::dev::{DevChain, DevExecutor, DevSenderRecovery};
use strata_sync::progress::{applied_migrations, get_stage_progress, save_stage_progress};
use strata_sync::stage::unwind_point;
use strata_sync::stages::{
    default_stages, reset_stage, verify_root, StageConfigs, DEFAULT_PRUNE_ORDER,
    DEFAULT_UNWIND_ORDER,
};
use strata_sync::sync::PruneMode;
use strata_sync::{migrations, ChainName, ChainSpec, Result, StageId, Sync, SyncError};
use tokio_util::sync::CancellationToken;

use crate::{Cli, Command, StageArgs};

/// Parses a byte size with an optional binary suffix (`512M`, `2G`).
pub(crate) fn parse_byte_size(s: &str) -> std::result::Result<u64, String> {
    let s = s.trim();
    let (digits, multiplier) = match s.chars().last() {
        Some(suffix) if suffix.is_ascii_alphabetic() => {
            let multiplier: u64 = match suffix.to_ascii_uppercase() {
                'B' => 1,
                'K' => 1 << 10,
                'M' => 1 << 20,
                'G' => 1 << 30,
                'T' => 1 << 40,
                other => return Err(format!("unknown size suffix {other:?}")),
            };
            (&s[..s.len() - 1], multiplier)
        },
        _ => (s, 1),
    };
    digits
        .parse::<u64>()
        .map(|n| n * multiplier)
        .map_err(|e| format!("invalid byte size {s:?}: {e}"))
}

/// An opened database plus the orchestrator wired over it.
struct Env {
    db: Arc<dyn KvStore>,
    sync: Sync,
    token: CancellationToken,
}

fn open_env(cli: &Cli, batch_size: u64) -> Result<Env> {
    let chain: ChainName = cli.chain.parse()?;
    let spec = ChainSpec::preset(chain);

    let datadir = cli.datadir.as_deref().ok_or_else(|| SyncError::Collaborator {
        component: "cli",
        message: "--datadir is required".into(),
    })?;
    let snapshot_dir = datadir.join("strata").join("snapshot");
    let etl_dir = datadir.join("etl-temp");
    ensure_dir(&snapshot_dir)?;
    ensure_dir(&etl_dir)?;
    tracing::debug!(
        snapshot_dir = %snapshot_dir.display(),
        etl_dir = %etl_dir.display(),
        chain = %chain,
        "opening database"
    );

    // The on-disk engine is pluggable behind `KvStore`; the tool runs the
    // reference engine wrapped in the snapshot overlay, which is the same
    // code path the node uses.
    let hot: Arc<dyn KvStore> = Arc::new(MemKv::new());
    let db: Arc<dyn KvStore> = Arc::new(SnapshotKvBuilder::new(hot).open());

    let applied = migrations::run_pending(&db, &migrations::registered())?;
    if applied > 0 {
        tracing::info!(applied, "migrations applied");
    }

    let storage_mode = db.view(|tx| StorageMode::read(tx).map_err(SyncError::from))?;
    let dev_chain = DevChain::new(spec, 0, 0);
    let cfg = StageConfigs {
        db: Arc::clone(&db),
        headers: dev_chain.clone(),
        bodies: dev_chain,
        senders: Arc::new(DevSenderRecovery),
        executor: Arc::new(DevExecutor),
        batch_size,
        storage_mode,
        target_block: None,
    };
    let sync = Sync::new(
        Arc::clone(&db),
        default_stages(&cfg),
        DEFAULT_UNWIND_ORDER.to_vec(),
        DEFAULT_PRUNE_ORDER.to_vec(),
        PruneMode::default(),
    )?;
    Ok(Env { db, sync, token: CancellationToken::new() })
}

fn ensure_dir(path: &Path) -> Result<()> {
    std::fs::create_dir_all(path).map_err(|e| SyncError::Collaborator {
        component: "cli",
        message: format!("create {}: {e}", path.display()),
    })
}

pub(crate) fn run(cli: Cli) -> Result<()> {
    match cli.command {
        Command::StageBodies { args } => {
            let env = open_env(&cli, 0)?;
            stage_bodies(&env, args)
        },
        Command::StageSenders { args } => {
            let env = open_env(&cli, 0)?;
            run_stage(&env, StageId::Senders, args)
        },
        Command::StageExec { args, batch_size } => {
            let env = open_env(&cli, batch_size)?;
            run_stage(&env, StageId::Execution, args)
        },
        Command::StageHashState { args } => {
            let env = open_env(&cli, 0)?;
            run_stage(&env, StageId::HashState, args)
        },
        Command::StageTrie { args, integrity_slow } => {
            let env = open_env(&cli, 0)?;
            run_stage(&env, StageId::IntermediateHashes, args)?;
            if integrity_slow {
                let progress =
                    env.db.view(|tx| get_stage_progress(tx, StageId::IntermediateHashes))?;
                env.db.view(|tx| verify_root(tx, progress))?;
                tracing::info!(progress, "state root verified");
            }
            Ok(())
        },
        Command::StageHistory { args } => {
            let env = open_env(&cli, 0)?;
            if args.unwind > 0 {
                // Indexes unwind storage first, mirroring the unwind order.
                run_stage(&env, StageId::StorageHistoryIndex, args)?;
                run_stage(&env, StageId::AccountHistoryIndex, args)
            } else {
                run_stage(&env, StageId::AccountHistoryIndex, args)?;
                run_stage(&env, StageId::StorageHistoryIndex, args)
            }
        },
        Command::StageLogIndex { args } => {
            let env = open_env(&cli, 0)?;
            run_stage(&env, StageId::LogIndex, args)
        },
        Command::StageCallTraces { args } => {
            let env = open_env(&cli, 0)?;
            run_stage(&env, StageId::CallTraces, args)
        },
        Command::StageTxLookup { args } => {
            let env = open_env(&cli, 0)?;
            run_stage(&env, StageId::TxLookup, args)
        },
        Command::PrintStages => {
            let env = open_env(&cli, 0)?;
            print_stages(&env)
        },
        Command::PrintMigrations => {
            let env = open_env(&cli, 0)?;
            let names = env.db.view(|tx| applied_migrations(tx))?;
            tracing::info!(migrations = %names.join(" "), "applied");
            Ok(())
        },
        Command::RemoveMigration { ref migration } => {
            let env = open_env(&cli, 0)?;
            migrations::remove(&env.db, &migration)
        },
        Command::RunMigrations => {
            // Opening the environment applies anything pending.
            open_env(&cli, 0).map(|_| ())
        },
        Command::SetStorageMode { ref storage_mode } => {
            let env = open_env(&cli, 0)?;
            let mode: StorageMode = storage_mode.parse().map_err(SyncError::from)?;
            env.db.update(|tx| mode.write(tx).map_err(SyncError::from))?;
            let stored = env.db.view(|tx| StorageMode::read(tx).map_err(SyncError::from))?;
            tracing::info!(mode = %stored, "storage mode set");
            Ok(())
        },
    }
}

/// Runs one stage's forward or unwind callback, the way the node would.
fn run_stage(env: &Env, id: StageId, args: StageArgs) -> Result<()> {
    let tx = env.db.begin_rw()?;

    if args.reset {
        reset_stage(tx.as_ref(), id)?;
        tracing::info!(stage = %id, "reset");
        return Ok(tx.commit()?);
    }

    let mut state = env.sync.stage_state(id, tx.as_ref())?;
    if args.block > 0 {
        tracing::info!(stage = %id, block = args.block, "overriding initial state");
        state.block_number = args.block;
    }
    tracing::info!(stage = %id, progress = state.block_number, "stage");

    let stage = env.sync.stage(id).ok_or_else(|| SyncError::InvalidStageOrder {
        reason: format!("{id} is not wired into the pipeline"),
    })?;

    if args.unwind > 0 {
        let target = unwind_point(id, state.block_number, args.unwind)?;
        let unwind_state = env.sync.new_unwind_state(id, target, state.block_number);
        (stage.unwind)(false, &unwind_state, Some(tx.as_ref()), &env.token)?;
    } else {
        (stage.forward)(false, &state, &env.sync, Some(tx.as_ref()), &env.token)?;
    }
    Ok(tx.commit()?)
}

/// The Bodies command only rewinds progress; forward body download runs
/// inside the node, not the tool.
fn stage_bodies(env: &Env, args: StageArgs) -> Result<()> {
    if args.unwind == 0 {
        tracing::info!("this command only works with --unwind");
        return Ok(());
    }
    env.db.update(|tx| {
        let progress = get_stage_progress(tx, StageId::Bodies)?;
        let target = unwind_point(StageId::Bodies, progress, args.unwind)?;
        save_stage_progress(tx, StageId::Bodies, target)?;
        tracing::info!(bodies = target, "progress");
        Ok(())
    })
}

fn print_stages(env: &Env) -> Result<()> {
    env.db.view(|tx| {
        for id in StageId::ALL {
            let progress = get_stage_progress(tx, id)?;
            println!("{:<22} {progress:>12}", id.as_str());
        }
        Ok(())
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn cli_for(datadir: Option<&Path>, chain: &str, command: Command) -> Cli {
        Cli { datadir: datadir.map(Into::into), chain: chain.to_string(), command }
    }

    #[test]
    fn test_set_storage_mode_round_trips() {
        let dir = tempfile::tempdir().expect("tempdir");
        let cli = cli_for(
            Some(dir.path()),
            "mainnet",
            Command::SetStorageMode { storage_mode: "hc".into() },
        );
        run(cli).expect("set_storage_mode");
    }

    #[test]
    fn test_print_stages_on_fresh_datadir() {
        let dir = tempfile::tempdir().expect("tempdir");
        let cli = cli_for(Some(dir.path()), "goerli", Command::PrintStages);
        run(cli).expect("print_stages");
    }

    #[test]
    fn test_missing_datadir_is_an_error() {
        let cli = cli_for(None, "mainnet", Command::PrintStages);
        assert!(run(cli).is_err());
    }

    #[test]
    fn test_unknown_chain_fails_before_opening() {
        let dir = tempfile::tempdir().expect("tempdir");
        let cli = cli_for(Some(dir.path()), "testnet9", Command::PrintStages);
        assert!(matches!(run(cli).unwrap_err(), SyncError::UnknownChain { .. }));
    }

    #[test]
    fn test_unwind_past_zero_rejected() {
        // Fresh database: Bodies progress is 0, any unwind distance is too
        // far.
        let dir = tempfile::tempdir().expect("tempdir");
        let cli = cli_for(
            Some(dir.path()),
            "mainnet",
            Command::StageBodies { args: crate::StageArgs { unwind: 11, ..Default::default() } },
        );
        assert!(matches!(run(cli).unwrap_err(), SyncError::UnwindPastZero { .. }));
    }

    #[test]
    fn test_parse_byte_size_suffixes() {
        assert_eq!(parse_byte_size("512M").unwrap(), 512 << 20);
        assert_eq!(parse_byte_size("2G").unwrap(), 2 << 30);
        assert_eq!(parse_byte_size("1024").unwrap(), 1024);
        assert_eq!(parse_byte_size("64k").unwrap(), 64 << 10);
        assert_eq!(parse_byte_size("7B").unwrap(), 7);
    }

    #[test]
    fn test_parse_byte_size_rejects_garbage() {
        assert!(parse_byte_size("12Q").is_err());
        assert!(parse_byte_size("lots").is_err());
        assert!(parse_byte_size("").is_err());
    }
}
