//! Lock command implementations.

use crate::cli::commands::{confirm, format_ts, now_ms, print_json, CommandContext};
use crate::cli::LockCommands;
use crate::config::default_lock_timeout_ms;
use crate::error::Result;
use crate::model::{AcquireRequest, Lock};
use colored::Colorize;
use serde::Serialize;

#[derive(Serialize)]
struct LockListOutput {
    locks: Vec<Lock>,
    count: usize,
}

#[derive(Serialize)]
struct AbortedOutput {
    aborted: bool,
}

/// Execute lock commands.
///
/// # Errors
///
/// Returns `LockConflict` when an acquire is denied, `LockNotHeld` when
/// releasing someone else's lock, or `ConfirmationRequired`.
pub fn execute(command: &LockCommands, ctx: &CommandContext<'_>) -> Result<()> {
    match command {
        LockCommands::Acquire {
            resource,
            timeout_ms,
            purpose,
        } => {
            let timeout_ms = match timeout_ms {
                Some(t) => *t,
                None => default_lock_timeout_ms()?,
            };
            let mut req = AcquireRequest::new(resource.as_str(), ctx.actor(), timeout_ms);
            if let Some(p) = purpose {
                req = req.with_purpose(p.as_str());
            }
            let mut storage = ctx.open()?;
            let outcome = storage.acquire_lock(&req, now_ms())?;

            if ctx.json && outcome.granted {
                return print_json(&outcome);
            }
            let lock = outcome.into_result()?;
            if !ctx.quiet {
                println!(
                    "Locked {} as {} until {}",
                    lock.resource.bold(),
                    lock.id,
                    format_ts(lock.expires_at())
                );
            }
            Ok(())
        }
        LockCommands::Release { id } => {
            let mut storage = ctx.open()?;
            let lock = storage.release_lock(id, &ctx.actor(), now_ms())?;
            if ctx.json {
                return print_json(&lock);
            }
            if !ctx.quiet {
                println!("Released {} ({})", lock.resource.bold(), lock.id);
            }
            Ok(())
        }
        LockCommands::ForceRelease { id, yes } => {
            let mut storage = ctx.open()?;
            let now = now_ms();
            if let Some(lock) = crate::storage::locks::get(storage.conn(), id)? {
                let action = format!(
                    "Force-release lock on {} held by {}",
                    lock.resource, lock.holder_id
                );
                if !confirm(&action, *yes)? {
                    if ctx.json {
                        return print_json(&AbortedOutput { aborted: true });
                    }
                    println!("Aborted.");
                    return Ok(());
                }
            }
            let lock = storage.force_release_lock(id, &ctx.actor(), now)?;
            if ctx.json {
                return print_json(&lock);
            }
            if !ctx.quiet {
                println!(
                    "Force-released {} (was held by {})",
                    lock.resource.bold(),
                    lock.holder_id.yellow()
                );
            }
            Ok(())
        }
        LockCommands::List => {
            let storage = ctx.open()?;
            let locks = storage.active_locks(now_ms())?;
            if ctx.json {
                let count = locks.len();
                return print_json(&LockListOutput { locks, count });
            }
            if locks.is_empty() {
                println!("No active locks.");
            }
            for l in &locks {
                println!(
                    "{} {} held by {} until {}{}",
                    l.id.dimmed(),
                    l.resource.bold(),
                    l.holder_id,
                    format_ts(l.expires_at()),
                    l.purpose
                        .as_deref()
                        .map(|p| format!(" ({p})"))
                        .unwrap_or_default()
                );
            }
            Ok(())
        }
    }
}
