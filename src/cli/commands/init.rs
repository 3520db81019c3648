//! Initialize the Fleet database.
//!
//! Creates the database (schema and migrations are applied on open) and the
//! checkpoint mirror directory beside it, then imports any legacy JSON
//! checkpoints found under `legacy-checkpoints/`.

use crate::cli::commands::{now_ms, print_json, CommandContext};
use crate::config::{data_dir, legacy_dir, mirror_dir};
use crate::error::{Error, Result};
use crate::storage::legacy::{import_legacy_checkpoints, LegacyImportReport};
use crate::storage::SqliteStorage;
use serde::Serialize;
use std::fs;
use std::path::PathBuf;

#[derive(Serialize)]
struct InitOutput {
    database: PathBuf,
    mirror_dir: PathBuf,
    legacy_import: LegacyImportReport,
}

/// Execute the init command.
///
/// # Errors
///
/// Returns `AlreadyInitialized` if the database exists and `force` is not
/// set, or an error if the directory or database cannot be created.
pub fn execute(ctx: &CommandContext<'_>, force: bool) -> Result<()> {
    let db_path = ctx.db_path()?;
    if db_path.exists() && !force {
        return Err(Error::AlreadyInitialized { path: db_path });
    }

    fs::create_dir_all(data_dir(&db_path))?;
    let mirror = mirror_dir(&db_path);
    fs::create_dir_all(&mirror)?;

    let mut storage = SqliteStorage::open(&db_path)?;
    let report = import_legacy_checkpoints(&mut storage, &legacy_dir(&db_path), now_ms())?;

    if ctx.json {
        return print_json(&InitOutput {
            database: db_path,
            mirror_dir: mirror,
            legacy_import: report,
        });
    }

    if !ctx.quiet {
        println!("Initialized Fleet database");
        println!("  Database: {}", db_path.display());
        println!("  Mirror:   {}", mirror.display());
        if !report.imported.is_empty() {
            println!("  Imported {} legacy checkpoint(s)", report.imported.len());
        }
        if !report.failed.is_empty() {
            println!(
                "  {} legacy file(s) failed to import and will be retried",
                report.failed.len()
            );
        }
    }
    Ok(())
}
