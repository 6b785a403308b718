//! strata-sync: the staged synchronization pipeline.
//!
//! A node reaches the chain head through a fixed sequence of
//! data-transformation stages. Each stage persists its own progress (a block
//! number), can unwind its work when the chain reorganizes, and can prune
//! data behind a configured horizon. The [`Sync`] orchestrator drives one
//! cycle at a time: a forward pass in pipeline order, an unwind pass in
//! declared unwind order when a stage requests one, and an advisory prune
//! pass at the end.
//!
//! Heavy per-stage kernels (header/body acquisition, sender recovery, block
//! execution) stay behind collaborator traits in [`stages`]; the mechanical
//! stages are bucket transforms over the KV layer.

pub mod chain;
pub mod dev;
pub mod error;
pub mod keys;
pub mod migrations;
pub mod progress;
pub mod stage;
pub mod stages;
pub mod sync;

pub use chain::{ChainName, ChainSpec};
pub use error::{Result, SyncError};
pub use progress::StageId;
pub use stage::{PruneState, Stage, StageState, Unwinder, UnwindState};
pub use sync::Sync;
