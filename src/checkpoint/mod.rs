//! Checkpoint operations that span the database and the JSON mirror.
//!
//! The storage functions in [`crate::storage::checkpoints`] compose inside a
//! caller's transaction. The functions here own the transaction and keep
//! the on-disk mirror in step after commit.

pub mod mirror;

use crate::error::Result;
use crate::model::{Checkpoint, CheckpointInput, PruneOptions};
use crate::storage::{checkpoints, SqliteStorage};
use serde::Serialize;
use std::collections::BTreeSet;
use std::path::Path;
use tracing::info;

/// Save a checkpoint and mirror it to `mirror_root` when one is given.
///
/// # Errors
///
/// Returns an error if the save fails. Mirror failures are only logged.
pub fn create(
    storage: &mut SqliteStorage,
    input: &CheckpointInput,
    actor: &str,
    mirror_root: Option<&Path>,
    now_ms: i64,
) -> Result<Checkpoint> {
    let checkpoint = storage.mutate_at("checkpoint_save", actor, now_ms, |tx, ctx| {
        checkpoints::save(tx, ctx, input)
    })?;
    info!(
        checkpoint_id = %checkpoint.id,
        mission_id = %checkpoint.mission_id,
        trigger = checkpoint.trigger.as_str(),
        "Checkpoint saved"
    );

    mirror::refresh_or_warn(mirror_root, storage.conn(), &checkpoint.mission_id);
    Ok(checkpoint)
}

/// What a prune pass selected, and whether it deleted it.
#[derive(Debug, Clone, Serialize)]
pub struct PruneReport {
    pub dry_run: bool,
    pub checkpoint_ids: Vec<String>,
}

/// Delete prune candidates in one transaction, or only list them on a dry run.
///
/// # Errors
///
/// Returns an error if the query or a delete fails.
pub fn prune(
    storage: &mut SqliteStorage,
    opts: &PruneOptions,
    dry_run: bool,
    mirror_root: Option<&Path>,
    now_ms: i64,
) -> Result<PruneReport> {
    if dry_run {
        let candidates =
            storage.read(|conn| checkpoints::find_prune_candidates(conn, opts, now_ms))?;
        return Ok(PruneReport {
            dry_run,
            checkpoint_ids: candidates.into_iter().map(|c| c.id).collect(),
        });
    }

    let deleted = storage.mutate_at("checkpoint_prune", "prune", now_ms, |tx, _ctx| {
        let candidates = checkpoints::find_prune_candidates(tx, opts, now_ms)?;
        for cp in &candidates {
            checkpoints::delete(tx, &cp.id)?;
        }
        Ok(candidates)
    })?;

    let missions: BTreeSet<&str> = deleted.iter().map(|c| c.mission_id.as_str()).collect();
    for mission_id in missions {
        mirror::refresh_or_warn(mirror_root, storage.conn(), mission_id);
    }
    info!(deleted = deleted.len(), "Pruned checkpoints");

    Ok(PruneReport {
        dry_run,
        checkpoint_ids: deleted.into_iter().map(|c| c.id).collect(),
    })
}
