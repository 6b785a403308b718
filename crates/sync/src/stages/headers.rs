//! Headers stage.
//!
//! Pulls canonical headers from the network collaborator, links them
//! against the stored chain, and writes `Headers` plus the canonical
//! marker. A parent mismatch at the attach point means the chain
//! reorganized: the stage requests an unwind to the fork block and stops.

use std::sync::Arc;

use strata_kv::buckets::{HEADERS, HEADER_CANONICAL};
use strata_kv::{KvStore, RwTx};
use tokio_util::sync::CancellationToken;

use crate::error::Result;
use crate::keys::{block_key, encode_block_number};
use crate::progress::StageId;
use crate::stage::{Stage, StageState, Unwinder, UnwindState};

use super::{
    canonical_hash, check_canceled, delete_block_keyed_above, run_in_tx, HeaderClient, NewHeader,
};

pub struct HeadersCfg {
    pub db: Arc<dyn KvStore>,
    pub client: Arc<dyn HeaderClient>,
    /// Optional target override; the client decides otherwise.
    pub target: Option<u64>,
}

pub(super) fn stage(cfg: HeadersCfg) -> Stage {
    let forward_cfg = HeadersCfg {
        db: Arc::clone(&cfg.db),
        client: Arc::clone(&cfg.client),
        target: cfg.target,
    };
    let unwind_db = Arc::clone(&cfg.db);
    Stage {
        id: StageId::Headers,
        description: "Download and link headers",
        disabled: false,
        forward: Box::new(move |_first_cycle, state, unwinder, tx, token| {
            forward(&forward_cfg, state, unwinder, tx, token)
        }),
        unwind: Box::new(move |_first_cycle, unwind_state, tx, _token| {
            unwind(&unwind_db, unwind_state, tx)
        }),
        prune: None,
    }
}

fn forward(
    cfg: &HeadersCfg,
    state: &StageState,
    unwinder: &dyn Unwinder,
    external: Option<&dyn RwTx>,
    token: &CancellationToken,
) -> Result<()> {
    let headers = cfg.client.next_headers(state.block_number, cfg.target)?;
    if headers.is_empty() {
        return Ok(());
    }

    run_in_tx(&cfg.db, external, |tx| {
        let mut head = state.block_number;
        for header in &headers {
            check_canceled(token)?;
            match link(tx, header)? {
                Link::Known => {
                    head = head.max(header.number);
                },
                Link::Extends => {
                    tx.put(HEADERS, &block_key(header.number, &header.hash), &header.raw)?;
                    tx.put(
                        HEADER_CANONICAL,
                        &encode_block_number(header.number),
                        &header.hash,
                    )?;
                    head = head.max(header.number);
                },
                Link::Fork(fork) => {
                    tracing::info!(
                        prefix = state.log_prefix(),
                        fork,
                        hash = ?header.hash,
                        "chain reorganized, requesting unwind"
                    );
                    unwinder.unwind_to(fork, Some(header.hash));
                    break;
                },
                Link::Detached => break,
            }
        }
        if head != state.block_number {
            state.update(tx, head)?;
        }
        Ok(())
    })
}

enum Link {
    /// Already the canonical header at this height.
    Known,
    /// Extends the stored chain.
    Extends,
    /// Disagrees with the stored chain; unwind to the contained block.
    Fork(u64),
    /// Does not attach to anything stored; wait for the missing headers.
    Detached,
}

/// Decides how `header` relates to the stored chain.
fn link(tx: &dyn RwTx, header: &NewHeader) -> Result<Link> {
    if let Ok(existing) = canonical_hash(tx, header.number) {
        if existing == header.hash {
            return Ok(Link::Known);
        }
        // A different canonical header at the same height: everything from
        // here up belongs to the losing branch.
        return Ok(Link::Fork(header.number.saturating_sub(1)));
    }
    if header.number <= 1 {
        // A genesis child attaches freely.
        return Ok(Link::Extends);
    }
    match canonical_hash(tx, header.number - 1) {
        Ok(parent) if parent == header.parent_hash => Ok(Link::Extends),
        Ok(_) => Ok(Link::Fork(header.number - 1)),
        Err(_) => Ok(Link::Detached),
    }
}

fn unwind(db: &Arc<dyn KvStore>, state: &UnwindState, external: Option<&dyn RwTx>) -> Result<()> {
    run_in_tx(db, external, |tx| {
        delete_block_keyed_above(tx, HEADERS, state.unwind_point)?;
        delete_block_keyed_above(tx, HEADER_CANONICAL, state.unwind_point)?;
        state.done(tx)
    })
}
