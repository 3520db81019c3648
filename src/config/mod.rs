//! Configuration management.
//!
//! Fleet keeps one database per installation. Everything else lives beside
//! it: the checkpoint mirror under `checkpoints/` and legacy JSON imports
//! under `legacy-checkpoints/`.
//!
//! Resolution order for every setting: explicit flag, environment variable,
//! then the global default under the home directory.

use crate::error::{Error, Result};
use crate::recovery::DEFAULT_ACTIVITY_THRESHOLD_MS;

use std::path::{Path, PathBuf};

/// Default lock timeout for CLI acquisitions (30 minutes).
pub const DEFAULT_LOCK_TIMEOUT_MS: i64 = 1_800_000;

const DB_FILE: &str = "fleet.db";
const MIRROR_DIR: &str = "checkpoints";
const LEGACY_DIR: &str = "legacy-checkpoints";

/// The global Fleet directory, `~/.fleet/`.
#[must_use]
pub fn global_fleet_dir() -> Option<PathBuf> {
    directories::BaseDirs::new().map(|b| b.home_dir().join(".fleet"))
}

/// Resolve the database path.
///
/// Priority:
/// 1. `explicit_path` (the `--db` flag)
/// 2. `FLEET_DB` environment variable
/// 3. `~/.fleet/data/fleet.db`
#[must_use]
pub fn resolve_db_path(explicit_path: Option<&Path>) -> Option<PathBuf> {
    if let Some(path) = explicit_path {
        return Some(path.to_path_buf());
    }

    if let Ok(db_path) = std::env::var("FLEET_DB") {
        if !db_path.trim().is_empty() {
            return Some(PathBuf::from(db_path));
        }
    }

    global_fleet_dir().map(|dir| dir.join("data").join(DB_FILE))
}

/// Directory holding the database file.
#[must_use]
pub fn data_dir(db_path: &Path) -> PathBuf {
    db_path
        .parent()
        .map_or_else(|| PathBuf::from("."), Path::to_path_buf)
}

/// Root of the JSON checkpoint mirror.
#[must_use]
pub fn mirror_dir(db_path: &Path) -> PathBuf {
    data_dir(db_path).join(MIRROR_DIR)
}

/// Where checkpoints from older installations are picked up.
#[must_use]
pub fn legacy_dir(db_path: &Path) -> PathBuf {
    data_dir(db_path).join(LEGACY_DIR)
}

/// Parse a millisecond setting. Unset or blank means `default`.
fn parse_ms(name: &str, raw: Option<String>, default: i64) -> Result<i64> {
    let Some(raw) = raw.filter(|v| !v.trim().is_empty()) else {
        return Ok(default);
    };
    match raw.trim().parse::<i64>() {
        Ok(v) if v > 0 => Ok(v),
        _ => Err(Error::Config(format!(
            "{name} must be a positive number of milliseconds, got '{raw}'"
        ))),
    }
}

/// Recovery detector threshold from `FLEET_ACTIVITY_THRESHOLD_MS`.
///
/// # Errors
///
/// Returns `Config` if the variable is set but not a positive integer.
pub fn activity_threshold_ms() -> Result<i64> {
    parse_ms(
        "FLEET_ACTIVITY_THRESHOLD_MS",
        std::env::var("FLEET_ACTIVITY_THRESHOLD_MS").ok(),
        DEFAULT_ACTIVITY_THRESHOLD_MS,
    )
}

/// Default lock timeout from `FLEET_LOCK_TIMEOUT_MS`.
///
/// # Errors
///
/// Returns `Config` if the variable is set but not a positive integer.
pub fn default_lock_timeout_ms() -> Result<i64> {
    parse_ms(
        "FLEET_LOCK_TIMEOUT_MS",
        std::env::var("FLEET_LOCK_TIMEOUT_MS").ok(),
        DEFAULT_LOCK_TIMEOUT_MS,
    )
}

/// Get the default actor name.
///
/// Priority:
/// 1. `FLEET_ACTOR` environment variable
/// 2. Git user name
/// 3. System username
/// 4. "unknown"
#[must_use]
pub fn default_actor() -> String {
    if let Ok(actor) = std::env::var("FLEET_ACTOR") {
        if !actor.is_empty() {
            return actor;
        }
    }

    if let Ok(output) = std::process::Command::new("git")
        .args(["config", "user.name"])
        .output()
    {
        if output.status.success() {
            let name = String::from_utf8_lossy(&output.stdout).trim().to_string();
            if !name.is_empty() {
                return name;
            }
        }
    }

    if let Ok(user) = std::env::var("USER") {
        return user;
    }

    "unknown".to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_actor() {
        assert!(!default_actor().is_empty());
    }

    #[test]
    fn test_resolve_db_path_with_explicit() {
        let explicit = PathBuf::from("/custom/path/fleet.db");
        assert_eq!(resolve_db_path(Some(&explicit)), Some(explicit));
    }

    #[test]
    fn test_sibling_dirs_follow_db() {
        let db = Path::new("/srv/fleet/data/fleet.db");
        assert_eq!(data_dir(db), PathBuf::from("/srv/fleet/data"));
        assert_eq!(mirror_dir(db), PathBuf::from("/srv/fleet/data/checkpoints"));
        assert_eq!(legacy_dir(db), PathBuf::from("/srv/fleet/data/legacy-checkpoints"));
    }

    #[test]
    fn test_parse_ms() {
        assert_eq!(parse_ms("X", None, 300_000).unwrap(), 300_000);
        assert_eq!(parse_ms("X", Some("  ".into()), 7).unwrap(), 7);
        assert_eq!(parse_ms("X", Some("1500".into()), 7).unwrap(), 1_500);

        let err = parse_ms("X", Some("soon".into()), 7).unwrap_err();
        assert!(matches!(err, Error::Config(_)));
        assert_eq!(err.exit_code(), 7);
        assert!(parse_ms("X", Some("-1".into()), 7).is_err());
    }
}
