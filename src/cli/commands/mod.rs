//! Command implementations.
//!
//! Every handler takes a [`CommandContext`] carrying the global flags and
//! opens its own [`SqliteStorage`]. Output is JSON when `--json` is set or
//! stdout is not a terminal, otherwise human-readable.

pub mod agent;
pub mod checkpoint;
pub mod completions;
pub mod dispatch;
pub mod events;
pub mod init;
pub mod lock;
pub mod mail;
pub mod mission;
pub mod recover;
#[cfg(feature = "server")]
pub mod serve;
pub mod version;

use crate::config::{default_actor, legacy_dir, mirror_dir, resolve_db_path};
use crate::error::{Error, Result};
use crate::storage::legacy::import_legacy_checkpoints;
use crate::storage::SqliteStorage;
use serde::Serialize;
use std::io::{BufRead, IsTerminal, Write};
use std::path::{Path, PathBuf};

/// Global flags shared by every command.
#[derive(Debug, Clone, Copy)]
pub struct CommandContext<'a> {
    pub db: Option<&'a Path>,
    pub actor: Option<&'a str>,
    pub json: bool,
    pub quiet: bool,
}

impl CommandContext<'_> {
    /// Resolved database path (may not exist yet).
    ///
    /// # Errors
    ///
    /// Returns `NotInitialized` if no location can be determined.
    pub fn db_path(&self) -> Result<PathBuf> {
        resolve_db_path(self.db).ok_or(Error::NotInitialized)
    }

    /// Open an initialized database and pick up any legacy checkpoints.
    ///
    /// # Errors
    ///
    /// Returns `NotInitialized` if the database file does not exist.
    pub fn open(&self) -> Result<SqliteStorage> {
        let db_path = self.db_path()?;
        if !db_path.exists() {
            return Err(Error::NotInitialized);
        }
        let mut storage = SqliteStorage::open(&db_path)?;
        import_legacy_checkpoints(&mut storage, &legacy_dir(&db_path), now_ms())?;
        Ok(storage)
    }

    /// Acting agent: `--actor`, then `FLEET_ACTOR`, git user, `$USER`.
    #[must_use]
    pub fn actor(&self) -> String {
        self.actor.map_or_else(default_actor, ToString::to_string)
    }

    /// Root of the checkpoint mirror for the resolved database.
    ///
    /// # Errors
    ///
    /// Returns `NotInitialized` if no location can be determined.
    pub fn mirror_root(&self) -> Result<PathBuf> {
        Ok(mirror_dir(&self.db_path()?))
    }
}

/// Current wall-clock time in Unix milliseconds.
#[must_use]
pub fn now_ms() -> i64 {
    chrono::Utc::now().timestamp_millis()
}

/// Format a Unix-millisecond timestamp for humans.
#[must_use]
pub fn format_ts(ms: i64) -> String {
    chrono::DateTime::from_timestamp_millis(ms).map_or_else(
        || ms.to_string(),
        |dt| dt.format("%Y-%m-%d %H:%M:%S").to_string(),
    )
}

/// Print a value as one line of JSON.
///
/// # Errors
///
/// Returns an error if serialization fails.
pub fn print_json<T: Serialize>(value: &T) -> Result<()> {
    println!("{}", serde_json::to_string(value)?);
    Ok(())
}

/// Ask before a destructive action.
///
/// `-y` skips the prompt. Without a terminal to ask on, the action is
/// refused with `ConfirmationRequired`. Returns `false` if the user declines.
///
/// # Errors
///
/// Returns `ConfirmationRequired` when stdin is not a terminal.
pub fn confirm(action: &str, yes: bool) -> Result<bool> {
    if yes {
        return Ok(true);
    }
    if !std::io::stdin().is_terminal() {
        return Err(Error::ConfirmationRequired {
            action: action.to_string(),
        });
    }

    eprint!("{action}? [y/N] ");
    std::io::stderr().flush()?;
    let mut answer = String::new();
    std::io::stdin().lock().read_line(&mut answer)?;
    Ok(matches!(answer.trim().to_lowercase().as_str(), "y" | "yes"))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_yes_skips_prompt() {
        assert!(confirm("Delete everything", true).unwrap());
    }

    #[test]
    fn test_open_requires_existing_db() {
        let dir = tempfile::tempdir().unwrap();
        let db = dir.path().join("missing.db");
        let ctx = CommandContext {
            db: Some(&db),
            actor: Some("tester"),
            json: true,
            quiet: false,
        };
        assert!(matches!(ctx.open(), Err(Error::NotInitialized)));
        assert_eq!(ctx.actor(), "tester");
        assert_eq!(ctx.mirror_root().unwrap(), dir.path().join("checkpoints"));
    }

    #[test]
    fn test_format_ts() {
        assert_eq!(format_ts(0), "1970-01-01 00:00:00");
    }
}
