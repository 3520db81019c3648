//! Checkpoint store.
//!
//! `save` captures sorties, relevant locks and undelivered messages in the
//! caller's transaction, so all three reflect one instant.

use crate::error::{Error, Result};
use crate::model::mission::percent;
use crate::model::{
    Checkpoint, CheckpointInput, CheckpointQuery, LockSnapshot, MessageSnapshot, PruneOptions,
    RecoveryContext, SortieSnapshot, SortieStatus,
};
use crate::storage::events::{self, EventType, MISSION_STREAM};
use crate::storage::{locks, mailbox, missions, MutationContext};
use rusqlite::{Connection, OptionalExtension};
use serde_json::json;
use std::collections::HashSet;

const DAY_MS: i64 = 86_400_000;

const CHECKPOINT_COLUMNS: &str = "id, mission_id, timestamp, trigger, trigger_details, progress_percent,
     sorties, active_locks, pending_messages, recovery_context, created_by, consumed_at";

fn map_checkpoint(row: &rusqlite::Row<'_>) -> rusqlite::Result<Checkpoint> {
    let trigger: String = row.get(3)?;
    let sorties: String = row.get(6)?;
    let active_locks: String = row.get(7)?;
    let pending_messages: String = row.get(8)?;
    let recovery_context: String = row.get(9)?;
    Ok(Checkpoint {
        id: row.get(0)?,
        mission_id: row.get(1)?,
        timestamp: row.get(2)?,
        trigger: super::parse_col(3, &trigger)?,
        trigger_details: row.get(4)?,
        progress_percent: row.get(5)?,
        sorties: super::json_col(6, &sorties)?,
        active_locks: super::json_col(7, &active_locks)?,
        pending_messages: super::json_col(8, &pending_messages)?,
        recovery_context: super::json_col(9, &recovery_context)?,
        created_by: row.get(10)?,
        consumed_at: row.get(11)?,
    })
}

/// Snapshot a mission's current state.
///
/// # Errors
///
/// Returns `MissionNotFound`, or `InvalidArgument` when a caller-supplied
/// progress falls outside `[0, 100]`.
pub fn save(conn: &Connection, ctx: &mut MutationContext, input: &CheckpointInput) -> Result<Checkpoint> {
    let now = ctx.now_ms;
    let mission = missions::require_mission(conn, &input.mission_id)?;
    let live_sorties = missions::list_sorties(conn, &mission.id)?;

    let progress_percent = match input.progress_percent {
        Some(p) => u8::try_from(p)
            .ok()
            .filter(|p| *p <= 100)
            .ok_or_else(|| {
                Error::InvalidArgument(format!("progress must be between 0 and 100, got {p}"))
            })?,
        None => {
            let done = live_sorties
                .iter()
                .filter(|s| s.status == SortieStatus::Completed)
                .count();
            percent(
                i64::try_from(done).unwrap_or(i64::MAX),
                i64::try_from(live_sorties.len()).unwrap_or(i64::MAX),
            )
        }
    };

    let holders: HashSet<&str> = live_sorties
        .iter()
        .filter_map(|s| s.assigned_to.as_deref())
        .collect();
    let files: HashSet<&str> = live_sorties
        .iter()
        .flat_map(|s| s.files.iter().map(String::as_str))
        .collect();
    let active_locks: Vec<LockSnapshot> = locks::get_active(conn, now)?
        .iter()
        .filter(|l| holders.contains(l.holder_id.as_str()) || files.contains(l.resource.as_str()))
        .map(LockSnapshot::from)
        .collect();

    let pending_messages: Vec<MessageSnapshot> = mailbox::undelivered_for_mission(conn, &mission.id)?
        .iter()
        .map(MessageSnapshot::from)
        .collect();

    let sorties: Vec<SortieSnapshot> = live_sorties.iter().map(SortieSnapshot::from).collect();

    let latest = events::get_latest(conn, MISSION_STREAM, &mission.id)?;
    let last_activity_at = latest.as_ref().map_or(mission.updated_at, |e| e.occurred_at);

    let files_modified = if input.files_modified.is_empty() {
        let mut seen = HashSet::new();
        live_sorties
            .iter()
            .filter(|s| {
                matches!(
                    s.status,
                    SortieStatus::InProgress | SortieStatus::Review | SortieStatus::Completed
                )
            })
            .flat_map(|s| s.files.iter())
            .filter(|f| seen.insert(f.as_str()))
            .cloned()
            .collect()
    } else {
        input.files_modified.clone()
    };

    let completed = sorties
        .iter()
        .filter(|s| s.status == SortieStatus::Completed)
        .count();
    let recovery_context = RecoveryContext {
        last_action: input
            .last_action
            .clone()
            .or_else(|| latest.map(|e| e.event_type))
            .unwrap_or_default(),
        next_steps: input.next_steps.clone(),
        blockers: input.blockers.clone(),
        files_modified,
        mission_summary: input.mission_summary.clone().unwrap_or_else(|| {
            format!(
                "{}: {completed}/{} sorties complete ({})",
                mission.title,
                sorties.len(),
                mission.status
            )
        }),
        elapsed_time_ms: now - mission.started_at.unwrap_or(mission.created_at),
        last_activity_at,
    };

    let created_by = if input.created_by.trim().is_empty() {
        ctx.actor.clone()
    } else {
        input.created_by.clone()
    };

    let checkpoint = Checkpoint {
        id: format!("ckpt_{}", &uuid::Uuid::new_v4().to_string()[..12]),
        mission_id: mission.id.clone(),
        timestamp: now,
        trigger: input.trigger,
        trigger_details: input.trigger_details.clone(),
        progress_percent,
        sorties,
        active_locks,
        pending_messages,
        recovery_context,
        created_by,
        consumed_at: None,
    };
    insert(conn, &checkpoint)?;

    ctx.record_event(
        MISSION_STREAM,
        &mission.id,
        EventType::CheckpointCreated,
        json!({
            "checkpoint_id": checkpoint.id,
            "trigger": checkpoint.trigger,
            "progress_percent": checkpoint.progress_percent,
        }),
    );

    Ok(checkpoint)
}

/// Insert a fully-formed checkpoint row.
///
/// # Errors
///
/// Returns an error if serialization or the insert fails.
pub fn insert(conn: &Connection, cp: &Checkpoint) -> Result<()> {
    conn.execute(
        &format!(
            "INSERT INTO checkpoints ({CHECKPOINT_COLUMNS})
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12)"
        ),
        rusqlite::params![
            cp.id,
            cp.mission_id,
            cp.timestamp,
            cp.trigger.as_str(),
            cp.trigger_details,
            cp.progress_percent,
            serde_json::to_string(&cp.sorties)?,
            serde_json::to_string(&cp.active_locks)?,
            serde_json::to_string(&cp.pending_messages)?,
            serde_json::to_string(&cp.recovery_context)?,
            cp.created_by,
            cp.consumed_at,
        ],
    )?;
    Ok(())
}

/// Get a checkpoint by ID.
///
/// # Errors
///
/// Returns an error if the query fails or a snapshot column is malformed.
pub fn get_by_id(conn: &Connection, id: &str) -> Result<Option<Checkpoint>> {
    let checkpoint = conn
        .query_row(
            &format!("SELECT {CHECKPOINT_COLUMNS} FROM checkpoints WHERE id = ?1"),
            [id],
            map_checkpoint,
        )
        .optional()?;
    Ok(checkpoint)
}

/// Get a checkpoint by ID or fail with `CheckpointNotFound`.
///
/// # Errors
///
/// Returns `CheckpointNotFound` if it does not exist.
pub fn require(conn: &Connection, id: &str) -> Result<Checkpoint> {
    get_by_id(conn, id)?.ok_or_else(|| Error::CheckpointNotFound { id: id.to_string() })
}

/// Newest checkpoint of a mission, consumed or not.
///
/// # Errors
///
/// Returns an error if the query fails.
pub fn get_latest_by_mission(conn: &Connection, mission_id: &str) -> Result<Option<Checkpoint>> {
    let checkpoint = conn
        .query_row(
            &format!(
                "SELECT {CHECKPOINT_COLUMNS} FROM checkpoints WHERE mission_id = ?1
                 ORDER BY timestamp DESC, id DESC LIMIT 1"
            ),
            [mission_id],
            map_checkpoint,
        )
        .optional()?;
    Ok(checkpoint)
}

/// Newest checkpoint of a mission that has not been consumed yet.
///
/// # Errors
///
/// Returns an error if the query fails.
pub fn get_latest_unconsumed(conn: &Connection, mission_id: &str) -> Result<Option<Checkpoint>> {
    let checkpoint = conn
        .query_row(
            &format!(
                "SELECT {CHECKPOINT_COLUMNS} FROM checkpoints
                 WHERE mission_id = ?1 AND consumed_at IS NULL
                 ORDER BY timestamp DESC, id DESC LIMIT 1"
            ),
            [mission_id],
            map_checkpoint,
        )
        .optional()?;
    Ok(checkpoint)
}

/// List checkpoints, newest first.
///
/// # Errors
///
/// Returns an error if the query fails.
pub fn list(conn: &Connection, query: &CheckpointQuery) -> Result<Vec<Checkpoint>> {
    let limit = query.limit.unwrap_or(20);
    let mut stmt = conn.prepare(&format!(
        "SELECT {CHECKPOINT_COLUMNS} FROM checkpoints
         WHERE ?1 IS NULL OR mission_id = ?1
         ORDER BY timestamp DESC, id DESC
         LIMIT ?2"
    ))?;
    let rows = stmt.query_map(rusqlite::params![query.mission_id, limit], map_checkpoint)?;
    rows.collect::<std::result::Result<Vec<_>, _>>()
        .map_err(Error::from)
}

/// Set `consumed_at` if it is still unset. Returns whether it was set now.
///
/// # Errors
///
/// Returns `CheckpointNotFound` if the checkpoint does not exist.
pub fn mark_consumed(conn: &Connection, id: &str, now_ms: i64) -> Result<bool> {
    let rows = conn.execute(
        "UPDATE checkpoints SET consumed_at = ?2 WHERE id = ?1 AND consumed_at IS NULL",
        rusqlite::params![id, now_ms],
    )?;
    if rows == 0 && get_by_id(conn, id)?.is_none() {
        return Err(Error::CheckpointNotFound { id: id.to_string() });
    }
    Ok(rows == 1)
}

/// Checkpoints eligible for pruning.
///
/// Per mission, the `keep_per_mission` newest always survive; of the rest,
/// only those strictly older than `older_than_days` are returned.
///
/// # Errors
///
/// Returns an error if the query fails.
pub fn find_prune_candidates(
    conn: &Connection,
    opts: &PruneOptions,
    now_ms: i64,
) -> Result<Vec<Checkpoint>> {
    let cutoff = now_ms - i64::from(opts.older_than_days) * DAY_MS;
    let mut stmt = conn.prepare(&format!(
        "SELECT {CHECKPOINT_COLUMNS} FROM checkpoints
         WHERE ?1 IS NULL OR mission_id = ?1
         ORDER BY mission_id ASC, timestamp DESC, id DESC"
    ))?;
    let all = stmt
        .query_map([opts.mission_id.as_deref()], map_checkpoint)?
        .collect::<std::result::Result<Vec<_>, _>>()?;

    let mut kept_per_mission: std::collections::HashMap<String, u32> =
        std::collections::HashMap::new();
    let mut candidates = Vec::new();
    for cp in all {
        let kept = kept_per_mission.entry(cp.mission_id.clone()).or_insert(0);
        if *kept < opts.keep_per_mission {
            *kept += 1;
            continue;
        }
        if cp.timestamp < cutoff {
            candidates.push(cp);
        }
    }
    Ok(candidates)
}

/// Delete a checkpoint.
///
/// # Errors
///
/// Returns `CheckpointNotFound` if nothing was deleted.
pub fn delete(conn: &Connection, id: &str) -> Result<()> {
    let rows = conn.execute("DELETE FROM checkpoints WHERE id = ?1", [id])?;
    if rows == 0 {
        return Err(Error::CheckpointNotFound { id: id.to_string() });
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{AcquireRequest, CheckpointTrigger, SendMessage};
    use crate::storage::SqliteStorage;

    const T: i64 = 1_700_000_000_000;

    fn seed(storage: &mut SqliteStorage) {
        storage
            .mutate_at("seed", "lead", T, |tx, ctx| {
                missions::create_mission(tx, ctx, Some("msn-1"), "Parser rewrite", None)?;
                let a = missions::create_sortie(tx, ctx, "msn-1", "Lexer", &["src/lexer.rs".into()])?;
                missions::create_sortie(tx, ctx, "msn-1", "Grammar", &["src/grammar.rs".into()])?;
                missions::assign_sortie(tx, ctx, &a.id, "agent-a")?;
                // Held by the assignee
                locks::acquire(tx, &AcquireRequest::new("docs/notes.md", "agent-a", 60_000), T)?;
                // Covers a sortie file
                locks::acquire(tx, &AcquireRequest::new("src/grammar.rs", "agent-x", 60_000), T)?;
                // Unrelated
                locks::acquire(tx, &AcquireRequest::new("other.rs", "agent-z", 60_000), T)?;
                mailbox::send(
                    tx,
                    ctx,
                    &SendMessage {
                        mission_id: Some("msn-1".into()),
                        from: "lead".into(),
                        to: vec!["agent-a".into()],
                        subject: "status?".into(),
                        body: String::new(),
                    },
                )?;
                Ok(())
            })
            .unwrap();
    }

    fn save_at(storage: &mut SqliteStorage, at: i64) -> Checkpoint {
        storage
            .mutate_at("checkpoint", "lead", at, |tx, ctx| {
                save(
                    tx,
                    ctx,
                    &CheckpointInput {
                        mission_id: "msn-1".into(),
                        ..CheckpointInput::default()
                    },
                )
            })
            .unwrap()
    }

    #[test]
    fn test_save_captures_mission_state() {
        let mut storage = SqliteStorage::open_memory().unwrap();
        seed(&mut storage);
        let cp = save_at(&mut storage, T + 100);

        assert_eq!(cp.sorties.len(), 2);
        assert_eq!(cp.progress_percent, 0);
        assert_eq!(cp.trigger, CheckpointTrigger::Manual);
        let mut resources: Vec<_> = cp.active_locks.iter().map(|l| l.resource.as_str()).collect();
        resources.sort_unstable();
        assert_eq!(resources, vec!["docs/notes.md", "src/grammar.rs"]);
        assert_eq!(cp.pending_messages.len(), 1);
        assert_eq!(cp.created_by, "lead");
        assert!(cp.recovery_context.mission_summary.contains("0/2"));

        let reread = require(storage.conn(), &cp.id).unwrap();
        assert_eq!(reread, cp);

        let latest = events::get_latest(storage.conn(), MISSION_STREAM, "msn-1").unwrap().unwrap();
        assert_eq!(latest.event_type, "checkpoint_created");
    }

    #[test]
    fn test_save_rejects_out_of_range_progress() {
        let mut storage = SqliteStorage::open_memory().unwrap();
        seed(&mut storage);
        let err = storage
            .mutate_at("checkpoint", "lead", T + 1, |tx, ctx| {
                save(
                    tx,
                    ctx,
                    &CheckpointInput {
                        mission_id: "msn-1".into(),
                        progress_percent: Some(101),
                        ..CheckpointInput::default()
                    },
                )
            })
            .unwrap_err();
        assert!(matches!(err, Error::InvalidArgument(_)));
        assert!(list(storage.conn(), &CheckpointQuery::default()).unwrap().is_empty());
    }

    #[test]
    fn test_mark_consumed_only_once() {
        let mut storage = SqliteStorage::open_memory().unwrap();
        seed(&mut storage);
        let cp = save_at(&mut storage, T + 1);

        assert!(mark_consumed(storage.conn(), &cp.id, T + 2).unwrap());
        assert!(!mark_consumed(storage.conn(), &cp.id, T + 3).unwrap());
        assert_eq!(require(storage.conn(), &cp.id).unwrap().consumed_at, Some(T + 2));
        assert!(get_latest_unconsumed(storage.conn(), "msn-1").unwrap().is_none());
        assert!(get_latest_by_mission(storage.conn(), "msn-1").unwrap().is_some());
    }

    #[test]
    fn test_list_is_newest_first() {
        let mut storage = SqliteStorage::open_memory().unwrap();
        seed(&mut storage);
        let older = save_at(&mut storage, T + 1);
        let newer = save_at(&mut storage, T + 2);

        let all = list(storage.conn(), &CheckpointQuery::default()).unwrap();
        assert_eq!(all[0].id, newer.id);
        assert_eq!(all[1].id, older.id);

        let limited = list(
            storage.conn(),
            &CheckpointQuery {
                mission_id: Some("msn-1".into()),
                limit: Some(1),
            },
        )
        .unwrap();
        assert_eq!(limited.len(), 1);
    }

    #[test]
    fn test_prune_keeps_recent_and_young() {
        let mut storage = SqliteStorage::open_memory().unwrap();
        seed(&mut storage);
        let now = T + 30 * DAY_MS;
        let mut by_age = Vec::new();
        for days in [20, 10, 8, 3, 1] {
            by_age.push((days, save_at(&mut storage, now - days * DAY_MS)));
        }

        let candidates = find_prune_candidates(
            storage.conn(),
            &PruneOptions {
                mission_id: None,
                older_than_days: 7,
                keep_per_mission: 3,
            },
            now,
        )
        .unwrap();

        let mut ids: Vec<_> = candidates.iter().map(|c| c.id.clone()).collect();
        ids.sort();
        let mut expected: Vec<_> = by_age
            .iter()
            .filter(|(d, _)| *d >= 10)
            .map(|(_, c)| c.id.clone())
            .collect();
        expected.sort();
        assert_eq!(ids, expected);

        for c in &candidates {
            delete(storage.conn(), &c.id).unwrap();
        }
        assert_eq!(list(storage.conn(), &CheckpointQuery::default()).unwrap().len(), 3);
        assert!(matches!(
            delete(storage.conn(), &candidates[0].id),
            Err(Error::CheckpointNotFound { .. })
        ));
    }
}
