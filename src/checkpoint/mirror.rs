//! JSON mirror of the latest checkpoint per mission.
//!
//! The database is authoritative. The mirror at
//! `<root>/<mission_id>/latest.json` exists so a human (or a fresh agent
//! without database access) can read the last known state. Writes are
//! atomic: temp file, fsync, rename.

use crate::error::Result;
use crate::model::Checkpoint;
use crate::storage::checkpoints;
use rusqlite::Connection;
use std::fs::{self, File};
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};
use tracing::{debug, warn};

const LATEST_FILE: &str = "latest.json";

/// Path of the mirror file for a mission.
#[must_use]
pub fn latest_path(root: &Path, mission_id: &str) -> PathBuf {
    root.join(mission_id).join(LATEST_FILE)
}

/// Write `content` to `path` atomically, creating parent directories.
///
/// If any step fails, the previous file (if any) is left untouched.
///
/// # Errors
///
/// Returns an error if any file operation fails.
pub fn atomic_write(path: &Path, content: &str) -> Result<()> {
    let temp_path = path.with_extension("json.tmp");

    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)?;
    }

    {
        let file = File::create(&temp_path)?;
        let mut writer = BufWriter::new(file);
        writer.write_all(content.as_bytes())?;
        writer.flush()?;
        writer.get_ref().sync_all()?;
    }

    fs::rename(&temp_path, path)?;
    Ok(())
}

/// Write a checkpoint as its mission's latest mirror.
///
/// # Errors
///
/// Returns an error if serialization or the write fails.
pub fn write_latest(root: &Path, checkpoint: &Checkpoint) -> Result<PathBuf> {
    let path = latest_path(root, &checkpoint.mission_id);
    let content = serde_json::to_string_pretty(checkpoint)?;
    atomic_write(&path, &content)?;
    debug!(mission_id = %checkpoint.mission_id, path = %path.display(), "Mirrored checkpoint");
    Ok(path)
}

/// Read a mission's mirror, `None` if it was never written.
///
/// # Errors
///
/// Returns an error if the file exists but cannot be read or parsed.
pub fn read_latest(root: &Path, mission_id: &str) -> Result<Option<Checkpoint>> {
    let path = latest_path(root, mission_id);
    if !path.exists() {
        return Ok(None);
    }
    let content = fs::read_to_string(&path)?;
    Ok(Some(serde_json::from_str(&content)?))
}

/// Bring a mission's mirror in line with the database: rewrite it from the
/// newest stored checkpoint, or remove it when none remain.
///
/// # Errors
///
/// Returns an error if the query or a file operation fails.
pub fn refresh(root: &Path, conn: &Connection, mission_id: &str) -> Result<()> {
    match checkpoints::get_latest_by_mission(conn, mission_id)? {
        Some(cp) => {
            write_latest(root, &cp)?;
        }
        None => {
            let path = latest_path(root, mission_id);
            if path.exists() {
                fs::remove_file(&path)?;
            }
        }
    }
    Ok(())
}

/// [`refresh`], logging instead of failing. Mirror problems never fail the
/// database operation that triggered them.
pub fn refresh_or_warn(root: Option<&Path>, conn: &Connection, mission_id: &str) {
    let Some(root) = root else { return };
    if let Err(e) = refresh(root, conn, mission_id) {
        warn!(mission_id, error = %e, "Failed to update checkpoint mirror");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{CheckpointTrigger, RecoveryContext};

    fn checkpoint(id: &str, mission_id: &str) -> Checkpoint {
        Checkpoint {
            id: id.into(),
            mission_id: mission_id.into(),
            timestamp: 1_000,
            trigger: CheckpointTrigger::Progress,
            trigger_details: None,
            progress_percent: 50,
            sorties: vec![],
            active_locks: vec![],
            pending_messages: vec![],
            recovery_context: RecoveryContext::default(),
            created_by: "tester".into(),
            consumed_at: None,
        }
    }

    #[test]
    fn test_write_then_read_latest() {
        let dir = tempfile::tempdir().unwrap();
        let path = write_latest(dir.path(), &checkpoint("ckpt_a", "msn_1")).unwrap();
        assert_eq!(path, dir.path().join("msn_1").join("latest.json"));
        assert!(!path.with_extension("json.tmp").exists());

        write_latest(dir.path(), &checkpoint("ckpt_b", "msn_1")).unwrap();
        let read = read_latest(dir.path(), "msn_1").unwrap().unwrap();
        assert_eq!(read.id, "ckpt_b");
    }

    #[test]
    fn test_read_missing_is_none() {
        let dir = tempfile::tempdir().unwrap();
        assert!(read_latest(dir.path(), "nope").unwrap().is_none());
    }

    #[test]
    fn test_refresh_removes_mirror_without_checkpoints() {
        let dir = tempfile::tempdir().unwrap();
        let storage = crate::storage::SqliteStorage::open_memory().unwrap();
        write_latest(dir.path(), &checkpoint("ckpt_gone", "msn_1")).unwrap();

        refresh(dir.path(), storage.conn(), "msn_1").unwrap();
        assert!(!latest_path(dir.path(), "msn_1").exists());
    }
}
