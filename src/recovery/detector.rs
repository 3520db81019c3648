//! Stale-mission detection.

use crate::error::Result;
use crate::model::{Checkpoint, MissionStatus};
use crate::storage::{checkpoints, missions};
use rusqlite::Connection;
use serde::Serialize;

/// Default inactivity window before a mission counts as stale (5 minutes).
pub const DEFAULT_ACTIVITY_THRESHOLD_MS: i64 = 300_000;

/// A stale mission with a checkpoint to resume from.
#[derive(Debug, Clone, Serialize)]
pub struct RecoveryCandidate {
    pub mission_id: String,
    pub mission_title: String,
    pub last_activity_at: i64,
    pub inactive_ms: i64,
    pub checkpoint: Checkpoint,
}

/// A stale mission with no usable checkpoint.
#[derive(Debug, Clone, Serialize)]
pub struct StaleMission {
    pub mission_id: String,
    pub mission_title: String,
    pub last_activity_at: i64,
    pub inactive_ms: i64,
}

/// Result of a detection pass.
#[derive(Debug, Clone, Default, Serialize)]
pub struct Detection {
    pub candidates: Vec<RecoveryCandidate>,
    pub unrecoverable: Vec<StaleMission>,
}

/// Summary returned by [`check_for_recovery`].
#[derive(Debug, Clone, Serialize)]
pub struct RecoveryCheck {
    pub needed: bool,
    pub candidates: Vec<RecoveryCandidate>,
}

/// Find in-progress missions idle for strictly longer than `threshold_ms`.
///
/// # Errors
///
/// Returns an error if a query fails.
pub fn detect_recovery_candidates(
    conn: &Connection,
    threshold_ms: i64,
    now_ms: i64,
) -> Result<Detection> {
    let mut detection = Detection::default();

    for mission in missions::list_missions(conn, Some(MissionStatus::InProgress))? {
        let last_activity_at = missions::last_activity(conn, &mission)?;
        let inactive_ms = now_ms - last_activity_at;
        if inactive_ms <= threshold_ms {
            continue;
        }

        match checkpoints::get_latest_unconsumed(conn, &mission.id)? {
            Some(checkpoint) => detection.candidates.push(RecoveryCandidate {
                mission_id: mission.id,
                mission_title: mission.title,
                last_activity_at,
                inactive_ms,
                checkpoint,
            }),
            None => detection.unrecoverable.push(StaleMission {
                mission_id: mission.id,
                mission_title: mission.title,
                last_activity_at,
                inactive_ms,
            }),
        }
    }

    Ok(detection)
}

/// Whether any stale mission can be resumed.
///
/// # Errors
///
/// Returns an error if a query fails.
pub fn check_for_recovery(conn: &Connection, threshold_ms: i64, now_ms: i64) -> Result<RecoveryCheck> {
    let detection = detect_recovery_candidates(conn, threshold_ms, now_ms)?;
    Ok(RecoveryCheck {
        needed: !detection.candidates.is_empty(),
        candidates: detection.candidates,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::CheckpointInput;
    use crate::storage::SqliteStorage;

    const T: i64 = 1_700_000_000_000;

    fn start(storage: &mut SqliteStorage, id: &str) {
        storage
            .mutate_at("seed", "lead", T, |tx, ctx| {
                missions::create_mission(tx, ctx, Some(id), id, None)?;
                missions::update_mission_status(tx, ctx, id, MissionStatus::InProgress)?;
                Ok(())
            })
            .unwrap();
    }

    fn checkpoint(storage: &mut SqliteStorage, id: &str) {
        // Same instant as the last event so activity stays at T
        storage
            .mutate_at("checkpoint", "lead", T, |tx, ctx| {
                checkpoints::save(
                    tx,
                    ctx,
                    &CheckpointInput {
                        mission_id: id.into(),
                        ..CheckpointInput::default()
                    },
                )
            })
            .unwrap();
    }

    #[test]
    fn test_threshold_is_strict() {
        let mut storage = SqliteStorage::open_memory().unwrap();
        start(&mut storage, "msn-1");
        checkpoint(&mut storage, "msn-1");

        let before = detect_recovery_candidates(storage.conn(), 300_000, T + 299_999).unwrap();
        assert!(before.candidates.is_empty());

        let exact = detect_recovery_candidates(storage.conn(), 300_000, T + 300_000).unwrap();
        assert!(exact.candidates.is_empty());

        let after = detect_recovery_candidates(storage.conn(), 300_000, T + 300_001).unwrap();
        assert_eq!(after.candidates.len(), 1);
        assert_eq!(after.candidates[0].mission_id, "msn-1");
        assert_eq!(after.candidates[0].inactive_ms, 300_001);
    }

    #[test]
    fn test_stale_without_checkpoint_is_unrecoverable() {
        let mut storage = SqliteStorage::open_memory().unwrap();
        start(&mut storage, "msn-bare");

        let detection = detect_recovery_candidates(storage.conn(), 1_000, T + 5_000).unwrap();
        assert!(detection.candidates.is_empty());
        assert_eq!(detection.unrecoverable.len(), 1);

        let check = check_for_recovery(storage.conn(), 1_000, T + 5_000).unwrap();
        assert!(!check.needed);
    }

    #[test]
    fn test_only_in_progress_missions_are_considered() {
        let mut storage = SqliteStorage::open_memory().unwrap();
        storage
            .mutate_at("seed", "lead", T, |tx, ctx| {
                missions::create_mission(tx, ctx, Some("msn-idle"), "Idle", None)?;
                Ok(())
            })
            .unwrap();
        checkpoint(&mut storage, "msn-idle");

        let detection = detect_recovery_candidates(storage.conn(), 1, T + 10_000).unwrap();
        assert!(detection.candidates.is_empty() && detection.unrecoverable.is_empty());
    }

    #[test]
    fn test_consumed_checkpoint_is_not_a_candidate() {
        let mut storage = SqliteStorage::open_memory().unwrap();
        start(&mut storage, "msn-1");
        checkpoint(&mut storage, "msn-1");
        let cp = checkpoints::get_latest_by_mission(storage.conn(), "msn-1")
            .unwrap()
            .unwrap();
        checkpoints::mark_consumed(storage.conn(), &cp.id, T).unwrap();

        let check = check_for_recovery(storage.conn(), 1_000, T + 5_000).unwrap();
        assert!(!check.needed);
    }
}
