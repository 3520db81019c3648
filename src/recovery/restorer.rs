//! Applying a checkpoint back onto live state.
//!
//! A restore runs in one IMMEDIATE transaction: sortie overwrite, lock
//! re-acquisition, message requeue, the consumed marker, and the
//! `fleet_recovered` event either all commit or none do. A dry run walks the
//! same classification inside a read snapshot and mutates nothing.

use crate::error::{Error, Result};
use crate::model::{AcquireRequest, Checkpoint, Lock, LockSnapshot, RecoveryContext};
use crate::storage::events::{EventType, MISSION_STREAM};
use crate::storage::{checkpoints, locks, mailbox, missions, SqliteStorage};
use rusqlite::Connection;
use serde::Serialize;
use serde_json::json;
use tracing::{info, warn};

/// Restore options. Forcing locks is always an explicit opt-in.
#[derive(Debug, Clone, Copy, Default)]
pub struct RestoreOptions {
    pub dry_run: bool,
    pub force_locks: bool,
}

/// How many items a restore applied (or would apply, on a dry run).
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct RestoredCounts {
    pub sorties: usize,
    pub locks: usize,
    pub messages: usize,
}

/// Outcome of a restore attempt.
#[derive(Debug, Clone, Serialize)]
pub struct RestoreResult {
    pub success: bool,
    pub dry_run: bool,
    pub mission_id: String,
    pub checkpoint_id: String,
    pub progress_percent: u8,
    pub restored: RestoredCounts,
    pub warnings: Vec<String>,
    pub errors: Vec<String>,
    /// The checkpoint's context, with lock conflicts appended to `blockers`
    pub recovery_context: RecoveryContext,
}

impl RestoreResult {
    fn new(checkpoint: &Checkpoint, dry_run: bool) -> Self {
        Self {
            success: true,
            dry_run,
            mission_id: checkpoint.mission_id.clone(),
            checkpoint_id: checkpoint.id.clone(),
            progress_percent: checkpoint.progress_percent,
            restored: RestoredCounts::default(),
            warnings: Vec::new(),
            errors: Vec::new(),
            recovery_context: checkpoint.recovery_context.clone(),
        }
    }
}

enum LockPlan {
    Expired,
    Available,
    /// Same holder already has a lock lasting at least as long
    Held,
    Conflict(Lock),
}

fn classify(conn: &Connection, snap: &LockSnapshot, now_ms: i64) -> Result<LockPlan> {
    if snap.remaining_ms(now_ms) <= 0 {
        return Ok(LockPlan::Expired);
    }
    let deadline = snap.acquired_at.saturating_add(snap.timeout_ms);
    Ok(match locks::get_by_resource(conn, &snap.resource, now_ms)? {
        Some(held) if held.holder_id != snap.holder_id => LockPlan::Conflict(held),
        Some(held) if held.expires_at() >= deadline => LockPlan::Held,
        _ => LockPlan::Available,
    })
}

fn expired_warning(snap: &LockSnapshot) -> String {
    format!(
        "LockExpired: lock on {} held by {} expired at {}; not re-acquired",
        snap.resource,
        snap.holder_id,
        snap.acquired_at.saturating_add(snap.timeout_ms)
    )
}

fn conflict_blocker(snap: &LockSnapshot, held: &Lock) -> String {
    format!(
        "Lock on {} (wanted by {}) is held by {}",
        snap.resource, snap.holder_id, held.holder_id
    )
}

fn reacquire(conn: &Connection, snap: &LockSnapshot, now_ms: i64) -> Result<bool> {
    let req = AcquireRequest {
        resource: snap.resource.clone(),
        holder_id: snap.holder_id.clone(),
        // Keep the original deadline
        timeout_ms: snap.remaining_ms(now_ms),
        purpose: snap.purpose.clone(),
    };
    Ok(locks::acquire(conn, &req, now_ms)?.granted)
}

fn dry_run(conn: &Connection, checkpoint: &Checkpoint, opts: RestoreOptions, now_ms: i64) -> Result<RestoreResult> {
    let mut result = RestoreResult::new(checkpoint, true);
    if let Some(at) = checkpoint.consumed_at {
        result.warnings.push(format!("Checkpoint was already consumed at {at}"));
    }

    for snap in &checkpoint.sorties {
        if missions::get_sortie(conn, &snap.id)?.is_none() {
            result.errors.push(format!("Sortie not found: {}", snap.id));
        }
    }
    result.restored.sorties = checkpoint.sorties.len();

    for snap in &checkpoint.active_locks {
        match classify(conn, snap, now_ms)? {
            LockPlan::Expired => result.warnings.push(expired_warning(snap)),
            LockPlan::Available | LockPlan::Held => result.restored.locks += 1,
            LockPlan::Conflict(held) if opts.force_locks => {
                result.warnings.push(format!(
                    "Would force-release lock on {} held by {}",
                    held.resource, held.holder_id
                ));
                result.restored.locks += 1;
            }
            LockPlan::Conflict(held) => {
                let blocker = conflict_blocker(snap, &held);
                result.warnings.push(blocker.clone());
                result.recovery_context.blockers.push(blocker);
            }
        }
    }

    result.restored.messages = checkpoint
        .pending_messages
        .iter()
        .filter(|m| !m.delivered)
        .count();

    result.success = result.errors.is_empty();
    Ok(result)
}

/// Apply a checkpoint by ID.
///
/// Failures inside the restore transaction are reported in the result with
/// `success: false`, and the database is left exactly as before. Shells
/// surface them as `TransactionRollback`.
///
/// # Errors
///
/// Returns `CheckpointNotFound` if the checkpoint does not exist, or a
/// database error if it cannot be read.
pub fn restore_from_checkpoint(
    storage: &mut SqliteStorage,
    checkpoint_id: &str,
    opts: RestoreOptions,
    actor: &str,
    now_ms: i64,
) -> Result<RestoreResult> {
    let checkpoint = checkpoints::require(storage.conn(), checkpoint_id)?;
    restore(storage, &checkpoint, opts, actor, now_ms)
}

/// Apply the newest unconsumed checkpoint of a mission.
///
/// # Errors
///
/// Returns `CheckpointNotFound` when the mission has no unconsumed checkpoint.
pub fn restore_latest(
    storage: &mut SqliteStorage,
    mission_id: &str,
    opts: RestoreOptions,
    actor: &str,
    now_ms: i64,
) -> Result<RestoreResult> {
    let checkpoint = checkpoints::get_latest_unconsumed(storage.conn(), mission_id)?.ok_or_else(
        || Error::NoCheckpointForMission {
            mission_id: mission_id.to_string(),
        },
    )?;
    restore(storage, &checkpoint, opts, actor, now_ms)
}

fn restore(
    storage: &mut SqliteStorage,
    checkpoint: &Checkpoint,
    opts: RestoreOptions,
    actor: &str,
    now_ms: i64,
) -> Result<RestoreResult> {
    if opts.dry_run {
        return storage.read(|conn| dry_run(conn, checkpoint, opts, now_ms));
    }

    let outcome = storage.mutate_at("restore", actor, now_ms, |tx, ctx| {
        let mut result = RestoreResult::new(checkpoint, false);
        if let Some(at) = checkpoint.consumed_at {
            result.warnings.push(format!("Checkpoint was already consumed at {at}"));
        }

        for snap in &checkpoint.sorties {
            missions::apply_sortie_snapshot(tx, snap, now_ms)?;
            result.restored.sorties += 1;
        }

        for snap in &checkpoint.active_locks {
            match classify(tx, snap, now_ms)? {
                LockPlan::Expired => result.warnings.push(expired_warning(snap)),
                LockPlan::Available => {
                    if reacquire(tx, snap, now_ms)? {
                        result.restored.locks += 1;
                    }
                }
                LockPlan::Held => result.restored.locks += 1,
                LockPlan::Conflict(held) if opts.force_locks => {
                    locks::force_release(tx, &held.id, now_ms)?;
                    if reacquire(tx, snap, now_ms)? {
                        result.restored.locks += 1;
                    }
                    result.warnings.push(format!(
                        "Force-released lock on {} held by {}",
                        held.resource, held.holder_id
                    ));
                }
                LockPlan::Conflict(held) => {
                    let blocker = conflict_blocker(snap, &held);
                    result.warnings.push(blocker.clone());
                    result.recovery_context.blockers.push(blocker);
                }
            }
        }

        for snap in checkpoint.pending_messages.iter().filter(|m| !m.delivered) {
            mailbox::requeue(tx, ctx, snap)?;
            result.restored.messages += 1;
        }

        checkpoints::mark_consumed(tx, &checkpoint.id, now_ms)?;
        missions::recompute_counts(tx, &checkpoint.mission_id, now_ms)?;

        ctx.record_event(
            MISSION_STREAM,
            &checkpoint.mission_id,
            EventType::FleetRecovered,
            json!({
                "checkpoint_id": checkpoint.id,
                "restored": result.restored,
                "warnings": result.warnings.len(),
                "errors": 0,
                "forced_locks": opts.force_locks,
            }),
        );
        Ok(result)
    });

    match outcome {
        Ok(result) => {
            info!(
                checkpoint_id = %checkpoint.id,
                mission_id = %checkpoint.mission_id,
                sorties = result.restored.sorties,
                locks = result.restored.locks,
                messages = result.restored.messages,
                warnings = result.warnings.len(),
                "Restored from checkpoint"
            );
            Ok(result)
        }
        Err(e) => {
            warn!(
                checkpoint_id = %checkpoint.id,
                mission_id = %checkpoint.mission_id,
                error = %e,
                "Restore rolled back"
            );
            let mut result = RestoreResult::new(checkpoint, false);
            result.success = false;
            result.errors.push(e.to_string());
            Ok(result)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{CheckpointInput, MissionStatus, SendMessage, SortieStatus, SortieUpdate};
    use crate::storage::events;

    const T: i64 = 1_700_000_000_000;

    struct Seeded {
        storage: SqliteStorage,
        checkpoint_id: String,
        sortie_ids: Vec<String>,
        message_id: String,
    }

    /// Three sorties, two captured locks (one short-lived), one undelivered message.
    fn seeded() -> Seeded {
        let mut storage = SqliteStorage::open_memory().unwrap();
        let (sortie_ids, message_id) = storage
            .mutate_at("seed", "lead", T, |tx, ctx| {
                missions::create_mission(tx, ctx, Some("msn-1"), "Parser", None)?;
                missions::update_mission_status(tx, ctx, "msn-1", MissionStatus::InProgress)?;
                let mut ids = Vec::new();
                for (title, file) in [("Lexer", "a.rs"), ("Grammar", "b.rs"), ("Docs", "c.md")] {
                    ids.push(missions::create_sortie(tx, ctx, "msn-1", title, &[file.into()])?.id);
                }
                missions::assign_sortie(tx, ctx, &ids[0], "agent-a")?;
                missions::update_sortie_progress(
                    tx,
                    ctx,
                    &ids[0],
                    "agent-a",
                    &SortieUpdate {
                        status: Some(SortieStatus::InProgress),
                        progress: Some(40),
                        notes: Some("tokens done".into()),
                    },
                )?;
                locks::acquire(tx, &AcquireRequest::new("a.rs", "agent-a", 1_000), T)?;
                locks::acquire(tx, &AcquireRequest::new("b.rs", "agent-a", 600_000), T)?;
                let msg = mailbox::send(
                    tx,
                    ctx,
                    &SendMessage {
                        mission_id: Some("msn-1".into()),
                        from: "lead".into(),
                        to: vec!["agent-a".into()],
                        subject: "check grammar".into(),
                        body: String::new(),
                    },
                )?;
                Ok((ids, msg.id))
            })
            .unwrap();

        let checkpoint = storage
            .mutate_at("checkpoint", "lead", T + 10, |tx, ctx| {
                checkpoints::save(
                    tx,
                    ctx,
                    &CheckpointInput {
                        mission_id: "msn-1".into(),
                        next_steps: vec!["finish lexer".into()],
                        ..CheckpointInput::default()
                    },
                )
            })
            .unwrap();
        assert_eq!(checkpoint.active_locks.len(), 2);

        Seeded {
            storage,
            checkpoint_id: checkpoint.id,
            sortie_ids,
            message_id,
        }
    }

    /// Agent "crashes": its sortie regresses and it acks its mail.
    fn drift(s: &mut Seeded, at: i64) {
        let sortie = s.sortie_ids[0].clone();
        let message = s.message_id.clone();
        s.storage
            .mutate_at("drift", "agent-a", at, |tx, ctx| {
                missions::update_sortie_progress(
                    tx,
                    ctx,
                    &sortie,
                    "agent-a",
                    &SortieUpdate {
                        status: Some(SortieStatus::Blocked),
                        progress: Some(5),
                        notes: None,
                    },
                )?;
                mailbox::ack(tx, "agent-a", &message, at)?;
                Ok(())
            })
            .unwrap();
    }

    fn dump(conn: &Connection) -> Vec<String> {
        let mut out = Vec::new();
        for sql in [
            "SELECT id || status || IFNULL(assigned_to,'') || progress || IFNULL(progress_notes,'') FROM sorties ORDER BY id",
            "SELECT id || resource || IFNULL(released_at,'') || IFNULL(release_reason,'') FROM locks ORDER BY id",
            "SELECT id || delivered || sent_at FROM messages ORDER BY id",
            "SELECT id || IFNULL(consumed_at,'') FROM checkpoints ORDER BY id",
            "SELECT COUNT(*) FROM events",
        ] {
            let mut stmt = conn.prepare(sql).unwrap();
            let rows = stmt
                .query_map([], |row| row.get::<_, rusqlite::types::Value>(0))
                .unwrap();
            out.extend(rows.map(|r| format!("{:?}", r.unwrap())));
        }
        out
    }

    #[test]
    fn test_dry_run_counts_and_mutates_nothing() {
        let mut s = seeded();
        let before = dump(s.storage.conn());

        let result = restore_from_checkpoint(
            &mut s.storage,
            &s.checkpoint_id,
            RestoreOptions { dry_run: true, force_locks: false },
            "lead",
            T + 2_000,
        )
        .unwrap();

        assert!(result.success && result.dry_run);
        assert_eq!(result.restored, RestoredCounts { sorties: 3, locks: 1, messages: 1 });
        assert_eq!(result.warnings.len(), 1);
        assert!(result.warnings[0].starts_with("LockExpired"));
        assert_eq!(dump(s.storage.conn()), before);
    }

    #[test]
    fn test_restore_applies_snapshot() {
        let mut s = seeded();
        drift(&mut s, T + 1_500);

        let result = restore_from_checkpoint(
            &mut s.storage,
            &s.checkpoint_id,
            RestoreOptions::default(),
            "lead",
            T + 2_000,
        )
        .unwrap();
        assert!(result.success, "{:?}", result.errors);
        assert_eq!(result.restored, RestoredCounts { sorties: 3, locks: 1, messages: 1 });

        let conn = s.storage.conn();
        let sortie = missions::require_sortie(conn, &s.sortie_ids[0]).unwrap();
        assert_eq!(sortie.status, SortieStatus::InProgress);
        assert_eq!(sortie.progress, 40);

        // Deadline preserved: acquired T, 600s timeout
        let lock = locks::get_by_resource(conn, "b.rs", T + 2_000).unwrap().unwrap();
        assert_eq!(lock.expires_at(), T + 600_000);
        assert!(locks::get_by_resource(conn, "a.rs", T + 2_000).unwrap().is_none());

        let msg = mailbox::get_message(conn, &s.message_id).unwrap().unwrap();
        assert!(!msg.delivered);
        assert_eq!(msg.sent_at, T + 2_000);

        assert!(checkpoints::require(conn, &s.checkpoint_id).unwrap().is_consumed());
        let latest = events::get_latest(conn, MISSION_STREAM, "msn-1").unwrap().unwrap();
        assert_eq!(latest.event_type, "fleet_recovered");
        assert_eq!(latest.data["restored"]["locks"], 1);
    }

    #[test]
    fn test_restore_keeps_longer_renewed_lease() {
        let mut s = seeded();
        s.storage
            .mutate_at("renew", "agent-a", T + 1_500, |tx, _| {
                locks::acquire(tx, &AcquireRequest::new("b.rs", "agent-a", 1_200_000), T + 1_500)
            })
            .unwrap();
        let renewed = locks::get_by_resource(s.storage.conn(), "b.rs", T + 1_500).unwrap().unwrap();

        let result = restore_from_checkpoint(
            &mut s.storage,
            &s.checkpoint_id,
            RestoreOptions::default(),
            "lead",
            T + 2_000,
        )
        .unwrap();
        assert!(result.success, "{:?}", result.errors);
        assert_eq!(result.restored.locks, 1);

        let lock = locks::get_by_resource(s.storage.conn(), "b.rs", T + 2_000).unwrap().unwrap();
        assert_eq!(lock.id, renewed.id);
        assert_eq!(lock.expires_at(), T + 1_201_500);
    }

    #[test]
    fn test_restore_is_idempotent_for_sorties() {
        let mut s = seeded();
        drift(&mut s, T + 1_500);

        let first = restore_from_checkpoint(
            &mut s.storage,
            &s.checkpoint_id,
            RestoreOptions::default(),
            "lead",
            T + 2_000,
        )
        .unwrap();
        let after_first = missions::list_sorties(s.storage.conn(), "msn-1").unwrap();

        let second = restore_from_checkpoint(
            &mut s.storage,
            &s.checkpoint_id,
            RestoreOptions::default(),
            "lead",
            T + 3_000,
        )
        .unwrap();
        let after_second = missions::list_sorties(s.storage.conn(), "msn-1").unwrap();

        assert!(first.success && second.success);
        assert!(second.warnings.iter().any(|w| w.contains("already consumed")));
        let fields = |v: &[crate::model::Sortie]| {
            v.iter()
                .map(|s| (s.id.clone(), s.status, s.assigned_to.clone(), s.progress, s.progress_notes.clone()))
                .collect::<Vec<_>>()
        };
        assert_eq!(fields(&after_first), fields(&after_second));
    }

    #[test]
    fn test_restore_is_all_or_nothing() {
        let mut s = seeded();
        drift(&mut s, T + 1_500);
        // Last sortie disappears after the checkpoint was taken
        s.storage
            .conn()
            .execute("DELETE FROM sorties WHERE id = ?1", [&s.sortie_ids[2]])
            .unwrap();
        let before = dump(s.storage.conn());

        let result = restore_from_checkpoint(
            &mut s.storage,
            &s.checkpoint_id,
            RestoreOptions::default(),
            "lead",
            T + 2_000,
        )
        .unwrap();

        assert!(!result.success);
        assert_eq!(result.errors.len(), 1);
        assert!(result.errors[0].contains("Sortie not found"));
        assert_eq!(dump(s.storage.conn()), before);
    }

    #[test]
    fn test_conflict_becomes_blocker_unless_forced() {
        let mut s = seeded();
        s.storage
            .mutate_at("steal", "agent-z", T + 1_000, |tx, _ctx| {
                let held = locks::get_by_resource(tx, "b.rs", T + 1_000)?.unwrap();
                locks::release(tx, &held.id, "agent-a", T + 1_000)?;
                locks::acquire(tx, &AcquireRequest::new("b.rs", "agent-z", 600_000), T + 1_000)?;
                Ok(())
            })
            .unwrap();

        let preview = restore_from_checkpoint(
            &mut s.storage,
            &s.checkpoint_id,
            RestoreOptions { dry_run: true, force_locks: false },
            "lead",
            T + 2_000,
        )
        .unwrap();
        assert_eq!(preview.restored.locks, 0);
        assert_eq!(preview.recovery_context.blockers.len(), 1);

        let forced = restore_from_checkpoint(
            &mut s.storage,
            &s.checkpoint_id,
            RestoreOptions { dry_run: false, force_locks: true },
            "lead",
            T + 2_000,
        )
        .unwrap();
        assert!(forced.success);
        assert_eq!(forced.restored.locks, 1);
        assert!(forced.warnings.iter().any(|w| w.contains("held by agent-z")));
        let lock = locks::get_by_resource(s.storage.conn(), "b.rs", T + 2_000)
            .unwrap()
            .unwrap();
        assert_eq!(lock.holder_id, "agent-a");
    }

    #[test]
    fn test_restore_latest_skips_consumed() {
        let mut s = seeded();
        restore_latest(&mut s.storage, "msn-1", RestoreOptions::default(), "lead", T + 2_000).unwrap();

        let err = restore_latest(&mut s.storage, "msn-1", RestoreOptions::default(), "lead", T + 3_000)
            .unwrap_err();
        assert_eq!(err.error_code().as_str(), "CHECKPOINT_NOT_FOUND");
    }

    #[test]
    fn test_unknown_checkpoint_is_not_found() {
        let mut s = seeded();
        let err = restore_from_checkpoint(
            &mut s.storage,
            "ckpt_missing",
            RestoreOptions::default(),
            "lead",
            T,
        )
        .unwrap_err();
        assert!(matches!(err, Error::CheckpointNotFound { .. }));
    }
}
