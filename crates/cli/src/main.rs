//! strata integration tool.
//!
//! Drives individual sync stages against a data directory, prints stage
//! progress and applied migrations, and overrides the storage mode.
//!
//! # Usage
//!
//! ```bash
//! # Show every stage and its progress
//! strata --datadir /var/lib/strata print_stages
//!
//! # Re-run sender recovery for the last 100 blocks
//! strata --datadir /var/lib/strata stage_senders --unwind 100
//! strata --datadir /var/lib/strata stage_senders
//!
//! # Execute with a bigger memory budget
//! strata --datadir /var/lib/strata stage_exec --batch-size 1G
//! ```

mod commands;

use std::path::PathBuf;

use clap::{Args, Parser, Subcommand};
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "strata", version, about = "strata staged-sync integration tool")]
pub(crate) struct Cli {
    /// Root data directory.
    #[arg(long, global = true)]
    pub(crate) datadir: Option<PathBuf>,

    /// Chain preset: mainnet|ropsten|goerli|rinkeby|calaveras|sokol.
    #[arg(long, global = true, default_value = "mainnet")]
    pub(crate) chain: String,

    #[command(subcommand)]
    pub(crate) command: Command,
}

/// Flags shared by the stage commands.
#[derive(Args, Clone, Copy, Default)]
pub(crate) struct StageArgs {
    /// Unwind this many blocks instead of running forward.
    #[arg(long, default_value_t = 0)]
    pub(crate) unwind: u64,

    /// Clear the stage's buckets and progress before running.
    #[arg(long)]
    pub(crate) reset: bool,

    /// Override the starting block for the run.
    #[arg(long, default_value_t = 0)]
    pub(crate) block: u64,
}

#[derive(Subcommand)]
#[command(rename_all = "snake_case")]
pub(crate) enum Command {
    /// Rewind the Bodies stage progress (forward runs inside the node).
    StageBodies {
        #[command(flatten)]
        args: StageArgs,
    },
    /// Run or unwind sender recovery.
    StageSenders {
        #[command(flatten)]
        args: StageArgs,
    },
    /// Run or unwind block execution.
    StageExec {
        #[command(flatten)]
        args: StageArgs,
        /// Execution memory budget, e.g. 512M.
        #[arg(long, default_value = "512M", value_parser = commands::parse_byte_size)]
        batch_size: u64,
    },
    /// Run or unwind the hashed-state promotion.
    StageHashState {
        #[command(flatten)]
        args: StageArgs,
    },
    /// Run or unwind the state-root stage.
    StageTrie {
        #[command(flatten)]
        args: StageArgs,
        /// Run expensive post-run integrity checks.
        #[arg(long = "integrity.slow")]
        integrity_slow: bool,
    },
    /// Run or unwind both history index stages.
    StageHistory {
        #[command(flatten)]
        args: StageArgs,
    },
    /// Run or unwind the log index.
    StageLogIndex {
        #[command(flatten)]
        args: StageArgs,
    },
    /// Run or unwind the call-trace indexes.
    StageCallTraces {
        #[command(flatten)]
        args: StageArgs,
    },
    /// Run or unwind the transaction lookup index.
    StageTxLookup {
        #[command(flatten)]
        args: StageArgs,
    },
    /// List every stage and its progress.
    PrintStages,
    /// List applied migrations.
    PrintMigrations,
    /// Delete one entry from the migrations bucket.
    RemoveMigration {
        /// Name of the migration to forget.
        #[arg(long)]
        migration: String,
    },
    /// Open the database, applying any pending migrations, and exit.
    RunMigrations,
    /// Override the storage mode.
    SetStorageMode {
        /// Subset of "hrtce": history, receipts, tx-index, call-traces, TEVM.
        #[arg(long, default_value = "htre")]
        storage_mode: String,
    },
}

fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into()))
        .init();

    let cli = Cli::parse();
    if let Err(error) = commands::run(cli) {
        tracing::error!(%error, "command failed");
        std::process::exit(1);
    }
}
