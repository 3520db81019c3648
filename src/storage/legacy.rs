//! Import of checkpoints written by older builds as loose JSON files.
//!
//! Files under `<data_dir>/legacy-checkpoints/*.json` are imported one per
//! transaction. Imported files are recorded in `legacy_imports` and skipped
//! afterwards. A file that fails is left untouched and unrecorded, so the
//! import is retried on the next start. Files are never moved or deleted.

use crate::error::{Error, Result};
use crate::model::{
    Checkpoint, CheckpointTrigger, LockSnapshot, MessageSnapshot, RecoveryContext, SortieSnapshot,
};
use crate::storage::{checkpoints, SqliteStorage};
use rusqlite::OptionalExtension;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::path::{Path, PathBuf};
use tracing::{info, warn};

/// On-disk shape of a legacy checkpoint. Accepts camelCase or snake_case.
#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct LegacyCheckpoint {
    #[serde(default)]
    id: Option<String>,
    #[serde(alias = "mission_id")]
    mission_id: String,
    #[serde(alias = "created_at", alias = "createdAt")]
    timestamp: i64,
    #[serde(default)]
    trigger: Option<String>,
    #[serde(default, alias = "trigger_details")]
    trigger_details: Option<String>,
    #[serde(default, alias = "progress_percent")]
    progress_percent: Option<u8>,
    #[serde(default)]
    sorties: Vec<SortieSnapshot>,
    #[serde(default, alias = "active_locks")]
    active_locks: Vec<LockSnapshot>,
    #[serde(default, alias = "pending_messages")]
    pending_messages: Vec<MessageSnapshot>,
    #[serde(default, alias = "recovery_context")]
    recovery_context: RecoveryContext,
    #[serde(default, alias = "created_by")]
    created_by: Option<String>,
    #[serde(default, alias = "consumed_at")]
    consumed_at: Option<i64>,
}

/// Outcome of one import pass.
#[derive(Debug, Default, Serialize)]
pub struct LegacyImportReport {
    pub imported: Vec<String>,
    pub skipped: usize,
    pub failed: Vec<String>,
}

/// SHA-256 of raw file bytes, hex-encoded.
#[must_use]
pub fn file_hash(bytes: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(bytes);
    format!("{:x}", hasher.finalize())
}

fn parse(bytes: &[u8], hash: &str) -> std::result::Result<Checkpoint, String> {
    let legacy: LegacyCheckpoint = serde_json::from_slice(bytes).map_err(|e| e.to_string())?;
    if legacy.mission_id.trim().is_empty() {
        return Err("missionId is empty".into());
    }
    let trigger = match legacy.trigger.as_deref() {
        Some(t) => t.parse().map_err(|e: Error| e.to_string())?,
        None => CheckpointTrigger::Manual,
    };
    let progress_percent = legacy.progress_percent.unwrap_or(0);
    if progress_percent > 100 {
        return Err(format!("progressPercent {progress_percent} out of range"));
    }

    Ok(Checkpoint {
        id: legacy
            .id
            .unwrap_or_else(|| format!("ckpt_{}", &hash[..12])),
        mission_id: legacy.mission_id,
        timestamp: legacy.timestamp,
        trigger,
        trigger_details: legacy.trigger_details,
        progress_percent,
        sorties: legacy.sorties,
        active_locks: legacy.active_locks,
        pending_messages: legacy.pending_messages,
        recovery_context: legacy.recovery_context,
        created_by: legacy.created_by.unwrap_or_else(|| "legacy-import".to_string()),
        consumed_at: legacy.consumed_at,
    })
}

fn import_file(storage: &mut SqliteStorage, path: &Path, now_ms: i64) -> Result<Option<String>> {
    let source = path.display().to_string();
    let already: Option<String> = storage
        .conn()
        .query_row(
            "SELECT checkpoint_id FROM legacy_imports WHERE source_path = ?1",
            [&source],
            |row| row.get(0),
        )
        .optional()?;
    if already.is_some() {
        return Ok(None);
    }

    let failure = |reason: String| Error::MigrationFailure {
        source_path: path.to_path_buf(),
        reason,
    };

    let bytes = std::fs::read(path).map_err(|e| failure(e.to_string()))?;
    let hash = file_hash(&bytes);
    let checkpoint = parse(&bytes, &hash).map_err(failure)?;

    storage
        .mutate_at("legacy_import", "legacy-import", now_ms, |tx, _ctx| {
            if checkpoints::get_by_id(tx, &checkpoint.id)?.is_none() {
                checkpoints::insert(tx, &checkpoint)?;
            }
            tx.execute(
                "INSERT INTO legacy_imports (source_path, content_hash, checkpoint_id, imported_at)
                 VALUES (?1, ?2, ?3, ?4)",
                rusqlite::params![source, hash, checkpoint.id, now_ms],
            )?;
            Ok(())
        })
        .map_err(|e| failure(e.to_string()))?;

    Ok(Some(checkpoint.id))
}

fn json_files(dir: &Path) -> Result<Vec<PathBuf>> {
    let mut files: Vec<PathBuf> = std::fs::read_dir(dir)?
        .filter_map(std::result::Result::ok)
        .map(|entry| entry.path())
        .filter(|p| p.is_file() && p.extension().is_some_and(|e| e == "json"))
        .collect();
    files.sort();
    Ok(files)
}

/// Import every not-yet-imported JSON checkpoint in `dir`.
///
/// A missing directory is not an error. Per-file failures are logged and
/// reported, never propagated.
///
/// # Errors
///
/// Returns an error only if the directory exists but cannot be listed.
pub fn import_legacy_checkpoints(
    storage: &mut SqliteStorage,
    dir: &Path,
    now_ms: i64,
) -> Result<LegacyImportReport> {
    let mut report = LegacyImportReport::default();
    if !dir.is_dir() {
        return Ok(report);
    }

    for path in json_files(dir)? {
        match import_file(storage, &path, now_ms) {
            Ok(Some(id)) => {
                info!(checkpoint_id = %id, path = %path.display(), "Imported legacy checkpoint");
                report.imported.push(id);
            }
            Ok(None) => report.skipped += 1,
            Err(e) => {
                warn!(path = %path.display(), error = %e, "Legacy checkpoint import failed");
                report.failed.push(path.display().to_string());
            }
        }
    }
    Ok(report)
}

#[cfg(test)]
mod tests {
    use super::*;

    const VALID: &str = r#"{
        "missionId": "msn-old",
        "timestamp": 1700000000000,
        "trigger": "compaction",
        "progressPercent": 40,
        "sorties": [{"id": "s1", "status": "in_progress", "progress": 40}],
        "recoveryContext": {"last_action": "edited lexer"}
    }"#;

    #[test]
    fn test_imports_once_and_leaves_files() {
        let dir = tempfile::tempdir().unwrap();
        let file = dir.path().join("msn-old.json");
        std::fs::write(&file, VALID).unwrap();
        let mut storage = SqliteStorage::open_memory().unwrap();

        let first = import_legacy_checkpoints(&mut storage, dir.path(), 1).unwrap();
        assert_eq!(first.imported.len(), 1);
        assert!(file.exists());

        let cp = checkpoints::require(storage.conn(), &first.imported[0]).unwrap();
        assert_eq!(cp.trigger, CheckpointTrigger::Compaction);
        assert_eq!(cp.sorties.len(), 1);
        assert_eq!(cp.recovery_context.last_action, "edited lexer");

        let second = import_legacy_checkpoints(&mut storage, dir.path(), 2).unwrap();
        assert!(second.imported.is_empty());
        assert_eq!(second.skipped, 1);
    }

    #[test]
    fn test_bad_file_is_retried_after_fix() {
        let dir = tempfile::tempdir().unwrap();
        let file = dir.path().join("broken.json");
        std::fs::write(&file, "{ not json").unwrap();
        let mut storage = SqliteStorage::open_memory().unwrap();

        let report = import_legacy_checkpoints(&mut storage, dir.path(), 1).unwrap();
        assert_eq!(report.failed.len(), 1);
        assert_eq!(std::fs::read_to_string(&file).unwrap(), "{ not json");

        std::fs::write(&file, VALID).unwrap();
        let report = import_legacy_checkpoints(&mut storage, dir.path(), 2).unwrap();
        assert_eq!(report.imported.len(), 1);
        assert!(report.failed.is_empty());
    }

    #[test]
    fn test_import_file_reports_migration_failure() {
        let dir = tempfile::tempdir().unwrap();
        let file = dir.path().join("bad.json");
        std::fs::write(&file, r#"{"missionId": "m", "timestamp": 1, "trigger": "nope"}"#).unwrap();
        let mut storage = SqliteStorage::open_memory().unwrap();

        let err = import_file(&mut storage, &file, 1).unwrap_err();
        assert!(matches!(err, Error::MigrationFailure { .. }));
        assert_eq!(err.exit_code(), 6);
    }

    #[test]
    fn test_missing_dir_is_empty_report() {
        let mut storage = SqliteStorage::open_memory().unwrap();
        let report =
            import_legacy_checkpoints(&mut storage, Path::new("/nonexistent/fleet-legacy"), 1).unwrap();
        assert!(report.imported.is_empty() && report.failed.is_empty());
    }
}
