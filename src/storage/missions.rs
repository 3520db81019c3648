//! Mission and sortie persistence.
//!
//! Every mutation records a domain event on the mission's stream through
//! the [`MutationContext`]; those events are what the recovery detector
//! reads as activity.

use crate::error::{Error, Result};
use crate::model::{
    Mission, MissionStatus, Sortie, SortieSnapshot, SortieStatus, SortieUpdate,
};
use crate::storage::events::{self, EventType, MISSION_STREAM};
use crate::storage::MutationContext;
use rusqlite::{Connection, OptionalExtension};
use serde_json::json;
use tracing::debug;

const MISSION_COLUMNS: &str = "id, title, description, status, total_sorties, completed_sorties,
     created_at, updated_at, started_at, completed_at";

const SORTIE_COLUMNS: &str = "id, mission_id, title, status, assigned_to, files, progress,
     progress_notes, created_at, updated_at";

fn map_mission(row: &rusqlite::Row<'_>) -> rusqlite::Result<Mission> {
    let status: String = row.get(3)?;
    Ok(Mission {
        id: row.get(0)?,
        title: row.get(1)?,
        description: row.get(2)?,
        status: super::parse_col(3, &status)?,
        total_sorties: row.get(4)?,
        completed_sorties: row.get(5)?,
        created_at: row.get(6)?,
        updated_at: row.get(7)?,
        started_at: row.get(8)?,
        completed_at: row.get(9)?,
    })
}

fn map_sortie(row: &rusqlite::Row<'_>) -> rusqlite::Result<Sortie> {
    let status: String = row.get(3)?;
    let files: String = row.get(5)?;
    Ok(Sortie {
        id: row.get(0)?,
        mission_id: row.get(1)?,
        title: row.get(2)?,
        status: super::parse_col(3, &status)?,
        assigned_to: row.get(4)?,
        files: super::json_col(5, &files)?,
        progress: row.get(6)?,
        progress_notes: row.get(7)?,
        created_at: row.get(8)?,
        updated_at: row.get(9)?,
    })
}

// ==================
// Missions
// ==================

/// Create a mission in `pending`.
///
/// # Errors
///
/// Returns `InvalidArgument` for an empty title or a duplicate ID.
pub fn create_mission(
    conn: &Connection,
    ctx: &mut MutationContext,
    id: Option<&str>,
    title: &str,
    description: Option<&str>,
) -> Result<Mission> {
    if title.trim().is_empty() {
        return Err(Error::InvalidArgument("mission title must not be empty".into()));
    }
    let id = id.map_or_else(
        || format!("msn_{}", &uuid::Uuid::new_v4().to_string()[..12]),
        str::to_string,
    );
    if get_mission(conn, &id)?.is_some() {
        return Err(Error::InvalidArgument(format!("mission '{id}' already exists")));
    }

    let now = ctx.now_ms;
    conn.execute(
        "INSERT INTO missions (id, title, description, status, created_at, updated_at)
         VALUES (?1, ?2, ?3, 'pending', ?4, ?4)",
        rusqlite::params![id, title, description, now],
    )?;

    ctx.record_event(
        MISSION_STREAM,
        &id,
        EventType::MissionCreated,
        json!({ "title": title }),
    );

    require_mission(conn, &id)
}

/// Get a mission by ID.
///
/// # Errors
///
/// Returns an error if the query fails.
pub fn get_mission(conn: &Connection, id: &str) -> Result<Option<Mission>> {
    let mission = conn
        .query_row(
            &format!("SELECT {MISSION_COLUMNS} FROM missions WHERE id = ?1"),
            [id],
            map_mission,
        )
        .optional()?;
    Ok(mission)
}

/// Get a mission by ID or fail with `MissionNotFound`.
///
/// # Errors
///
/// Returns `MissionNotFound` if it does not exist.
pub fn require_mission(conn: &Connection, id: &str) -> Result<Mission> {
    get_mission(conn, id)?.ok_or_else(|| Error::MissionNotFound { id: id.to_string() })
}

/// List missions, newest first, optionally filtered by status.
///
/// # Errors
///
/// Returns an error if the query fails.
pub fn list_missions(conn: &Connection, status: Option<MissionStatus>) -> Result<Vec<Mission>> {
    let mut stmt = conn.prepare(&format!(
        "SELECT {MISSION_COLUMNS} FROM missions
         WHERE ?1 IS NULL OR status = ?1
         ORDER BY created_at DESC, id ASC"
    ))?;
    let rows = stmt.query_map([status.map(|s| s.as_str())], map_mission)?;
    rows.collect::<std::result::Result<Vec<_>, _>>()
        .map_err(Error::from)
}

/// Move a mission to a new status.
///
/// # Errors
///
/// Returns `MissionNotFound`, or `InvalidTransition` for a backward move or
/// a move out of a terminal state.
pub fn update_mission_status(
    conn: &Connection,
    ctx: &mut MutationContext,
    id: &str,
    next: MissionStatus,
) -> Result<Mission> {
    let mission = require_mission(conn, id)?;
    if !mission.status.can_transition_to(next) {
        return Err(Error::InvalidTransition {
            entity: "mission",
            from: mission.status.to_string(),
            to: next.to_string(),
        });
    }

    let now = ctx.now_ms;
    let started_at = match (mission.started_at, next) {
        (None, MissionStatus::InProgress | MissionStatus::Review | MissionStatus::Completed) => {
            Some(now)
        }
        (existing, _) => existing,
    };
    let completed_at = (next == MissionStatus::Completed).then_some(now);

    conn.execute(
        "UPDATE missions SET status = ?2, started_at = ?3, completed_at = COALESCE(?4, completed_at),
                updated_at = ?5
         WHERE id = ?1",
        rusqlite::params![id, next.as_str(), started_at, completed_at, now],
    )?;

    ctx.record_event(
        MISSION_STREAM,
        id,
        EventType::MissionStatusChanged,
        json!({ "from": mission.status, "to": next }),
    );

    require_mission(conn, id)
}

/// Recompute `total_sorties` / `completed_sorties` from live sorties.
///
/// # Errors
///
/// Returns an error if the update fails.
pub fn recompute_counts(conn: &Connection, mission_id: &str, now_ms: i64) -> Result<()> {
    conn.execute(
        "UPDATE missions SET
            total_sorties = (SELECT COUNT(*) FROM sorties WHERE mission_id = ?1),
            completed_sorties = (SELECT COUNT(*) FROM sorties WHERE mission_id = ?1 AND status = 'completed'),
            updated_at = ?2
         WHERE id = ?1",
        rusqlite::params![mission_id, now_ms],
    )?;
    Ok(())
}

/// Last observed activity for a mission: the newest event on its stream,
/// or `updated_at` when the stream is empty.
///
/// # Errors
///
/// Returns an error if the query fails.
pub fn last_activity(conn: &Connection, mission: &Mission) -> Result<i64> {
    Ok(events::get_latest(conn, MISSION_STREAM, &mission.id)?
        .map_or(mission.updated_at, |e| e.occurred_at))
}

// ==================
// Sorties
// ==================

/// Add a sortie to a mission.
///
/// # Errors
///
/// Returns `MissionNotFound`, or `InvalidArgument` if the mission is
/// already terminal or the title is empty.
pub fn create_sortie(
    conn: &Connection,
    ctx: &mut MutationContext,
    mission_id: &str,
    title: &str,
    files: &[String],
) -> Result<Sortie> {
    if title.trim().is_empty() {
        return Err(Error::InvalidArgument("sortie title must not be empty".into()));
    }
    let mission = require_mission(conn, mission_id)?;
    if mission.status.is_terminal() {
        return Err(Error::InvalidArgument(format!(
            "mission {mission_id} is {} and cannot take new sorties",
            mission.status
        )));
    }

    let id = format!("srt_{}", &uuid::Uuid::new_v4().to_string()[..12]);
    let now = ctx.now_ms;
    conn.execute(
        "INSERT INTO sorties (id, mission_id, title, status, files, progress, created_at, updated_at)
         VALUES (?1, ?2, ?3, 'pending', ?4, 0, ?5, ?5)",
        rusqlite::params![id, mission_id, title, serde_json::to_string(files)?, now],
    )?;
    recompute_counts(conn, mission_id, now)?;

    ctx.record_event(
        MISSION_STREAM,
        mission_id,
        EventType::SortieCreated,
        json!({ "sortie_id": id, "title": title, "files": files }),
    );

    require_sortie(conn, &id)
}

/// Get a sortie by ID.
///
/// # Errors
///
/// Returns an error if the query fails.
pub fn get_sortie(conn: &Connection, id: &str) -> Result<Option<Sortie>> {
    let sortie = conn
        .query_row(
            &format!("SELECT {SORTIE_COLUMNS} FROM sorties WHERE id = ?1"),
            [id],
            map_sortie,
        )
        .optional()?;
    Ok(sortie)
}

/// Get a sortie by ID or fail with `SortieNotFound`.
///
/// # Errors
///
/// Returns `SortieNotFound` if it does not exist.
pub fn require_sortie(conn: &Connection, id: &str) -> Result<Sortie> {
    get_sortie(conn, id)?.ok_or_else(|| Error::SortieNotFound { id: id.to_string() })
}

/// Sorties of a mission in creation order.
///
/// # Errors
///
/// Returns an error if the query fails.
pub fn list_sorties(conn: &Connection, mission_id: &str) -> Result<Vec<Sortie>> {
    let mut stmt = conn.prepare(&format!(
        "SELECT {SORTIE_COLUMNS} FROM sorties WHERE mission_id = ?1
         ORDER BY created_at ASC, rowid ASC"
    ))?;
    let rows = stmt.query_map([mission_id], map_sortie)?;
    rows.collect::<std::result::Result<Vec<_>, _>>()
        .map_err(Error::from)
}

/// Assign a sortie to an agent.
///
/// # Errors
///
/// Returns `SortieNotFound`, or `InvalidTransition` if the sortie is
/// already finished.
pub fn assign_sortie(
    conn: &Connection,
    ctx: &mut MutationContext,
    sortie_id: &str,
    agent_id: &str,
) -> Result<Sortie> {
    let sortie = require_sortie(conn, sortie_id)?;
    if matches!(
        sortie.status,
        SortieStatus::Completed | SortieStatus::Cancelled | SortieStatus::Failed
    ) {
        return Err(Error::InvalidTransition {
            entity: "sortie",
            from: sortie.status.to_string(),
            to: SortieStatus::Assigned.to_string(),
        });
    }

    conn.execute(
        "UPDATE sorties SET assigned_to = ?2, status = 'assigned', updated_at = ?3 WHERE id = ?1",
        rusqlite::params![sortie_id, agent_id, ctx.now_ms],
    )?;

    ctx.record_event(
        MISSION_STREAM,
        &sortie.mission_id,
        EventType::SortieAssigned,
        json!({ "sortie_id": sortie_id, "agent_id": agent_id }),
    );

    require_sortie(conn, sortie_id)
}

/// Report progress on a sortie. Only the assigned agent may do this.
///
/// # Errors
///
/// Returns `SortieNotFound`, `NotAssigned`, or `InvalidArgument` for a
/// progress value above 100.
pub fn update_sortie_progress(
    conn: &Connection,
    ctx: &mut MutationContext,
    sortie_id: &str,
    agent_id: &str,
    update: &SortieUpdate,
) -> Result<Sortie> {
    let sortie = require_sortie(conn, sortie_id)?;
    if sortie.assigned_to.as_deref() != Some(agent_id) {
        return Err(Error::NotAssigned {
            sortie_id: sortie_id.to_string(),
            agent_id: agent_id.to_string(),
        });
    }
    if let Some(p) = update.progress {
        if p > 100 {
            return Err(Error::InvalidArgument(format!(
                "progress must be between 0 and 100, got {p}"
            )));
        }
    }

    let status = update.status.unwrap_or(sortie.status);
    let progress = match (update.progress, status) {
        (Some(p), _) => p,
        (None, SortieStatus::Completed) => 100,
        (None, _) => sortie.progress,
    };
    let notes = update.notes.clone().or(sortie.progress_notes);

    conn.execute(
        "UPDATE sorties SET status = ?2, progress = ?3, progress_notes = ?4, updated_at = ?5
         WHERE id = ?1",
        rusqlite::params![sortie_id, status.as_str(), progress, notes, ctx.now_ms],
    )?;
    recompute_counts(conn, &sortie.mission_id, ctx.now_ms)?;

    if status.is_terminal() && !sortie.status.is_terminal() {
        if let Some(agent) = super::agents::release_load(conn, agent_id)? {
            debug!(agent_id, load = agent.current_load, "Released agent load");
        }
    }

    ctx.record_event(
        MISSION_STREAM,
        &sortie.mission_id,
        EventType::SortieProgress,
        json!({
            "sortie_id": sortie_id,
            "agent_id": agent_id,
            "status": status,
            "progress": progress,
        }),
    );

    require_sortie(conn, sortie_id)
}

/// Overwrite a live sortie with snapshot values (recovery path).
///
/// # Errors
///
/// Returns `SortieNotFound` if the live sortie is gone.
pub fn apply_sortie_snapshot(conn: &Connection, snap: &SortieSnapshot, now_ms: i64) -> Result<()> {
    let rows = conn.execute(
        "UPDATE sorties SET status = ?2, assigned_to = ?3, progress = ?4, progress_notes = ?5,
                updated_at = ?6
         WHERE id = ?1",
        rusqlite::params![
            snap.id,
            snap.status.as_str(),
            snap.assigned_to,
            snap.progress,
            snap.progress_notes,
            now_ms
        ],
    )?;
    if rows == 0 {
        return Err(Error::SortieNotFound {
            id: snap.id.clone(),
        });
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::SqliteStorage;

    const T: i64 = 1_700_000_000_000;

    #[test]
    fn test_mission_lifecycle_emits_events() {
        let mut storage = SqliteStorage::open_memory().unwrap();
        let mission = storage
            .mutate_at("create_mission", "lead", T, |tx, ctx| {
                create_mission(tx, ctx, Some("msn-1"), "Ship it", None)
            })
            .unwrap();
        assert_eq!(mission.status, MissionStatus::Pending);

        let mission = storage
            .mutate_at("status", "lead", T + 10, |tx, ctx| {
                update_mission_status(tx, ctx, "msn-1", MissionStatus::InProgress)
            })
            .unwrap();
        assert_eq!(mission.started_at, Some(T + 10));

        let err = storage
            .mutate_at("status", "lead", T + 20, |tx, ctx| {
                update_mission_status(tx, ctx, "msn-1", MissionStatus::Pending)
            })
            .unwrap_err();
        assert!(matches!(err, Error::InvalidTransition { .. }));

        let stream = events::query_by_stream(storage.conn(), MISSION_STREAM, "msn-1", None).unwrap();
        let kinds: Vec<_> = stream.iter().map(|e| e.event_type.as_str()).collect();
        assert_eq!(kinds, vec!["mission_created", "mission_status_changed"]);
        assert_eq!(stream[1].data["actor"], "lead");
    }

    #[test]
    fn test_sortie_progress_requires_assignee() {
        let mut storage = SqliteStorage::open_memory().unwrap();
        let sortie = storage
            .mutate_at("setup", "lead", T, |tx, ctx| {
                create_mission(tx, ctx, Some("msn-1"), "M", None)?;
                let s = create_sortie(tx, ctx, "msn-1", "Parser", &["src/parser.rs".into()])?;
                assign_sortie(tx, ctx, &s.id, "agent-a")
            })
            .unwrap();
        assert_eq!(sortie.status, SortieStatus::Assigned);

        let err = storage
            .mutate_at("progress", "agent-b", T + 1, |tx, ctx| {
                update_sortie_progress(tx, ctx, &sortie.id, "agent-b", &SortieUpdate::default())
            })
            .unwrap_err();
        assert!(matches!(err, Error::NotAssigned { .. }));

        let done = storage
            .mutate_at("progress", "agent-a", T + 2, |tx, ctx| {
                update_sortie_progress(
                    tx,
                    ctx,
                    &sortie.id,
                    "agent-a",
                    &SortieUpdate {
                        status: Some(SortieStatus::Completed),
                        ..SortieUpdate::default()
                    },
                )
            })
            .unwrap();
        assert_eq!(done.progress, 100);

        let mission = require_mission(storage.conn(), "msn-1").unwrap();
        assert_eq!((mission.total_sorties, mission.completed_sorties), (1, 1));
    }

    #[test]
    fn test_last_activity_falls_back_to_updated_at() {
        let storage = SqliteStorage::open_memory().unwrap();
        storage
            .conn()
            .execute(
                "INSERT INTO missions (id, title, status, created_at, updated_at)
                 VALUES ('m', 't', 'in_progress', 5, 42)",
                [],
            )
            .unwrap();
        let mission = require_mission(storage.conn(), "m").unwrap();
        assert_eq!(last_activity(storage.conn(), &mission).unwrap(), 42);
    }
}
