//! Recovery detection command.

use crate::cli::commands::{format_ts, now_ms, print_json, CommandContext};
use crate::cli::RecoverCommands;
use crate::config::activity_threshold_ms;
use crate::error::Result;
use crate::recovery::{detect_recovery_candidates, prompt::format_elapsed, Detection};
use colored::Colorize;
use serde::Serialize;

#[derive(Serialize)]
struct DetectOutput {
    threshold_ms: i64,
    needed: bool,
    #[serde(flatten)]
    detection: Detection,
}

/// Execute recover commands.
///
/// # Errors
///
/// Returns `Config` for a bad `FLEET_ACTIVITY_THRESHOLD_MS`, or a database error.
pub fn execute(command: &RecoverCommands, ctx: &CommandContext<'_>) -> Result<()> {
    let RecoverCommands::Detect { threshold_ms } = command;
    let threshold_ms = match threshold_ms {
        Some(t) => *t,
        None => activity_threshold_ms()?,
    };

    let storage = ctx.open()?;
    let detection = detect_recovery_candidates(storage.conn(), threshold_ms, now_ms())?;

    if ctx.json {
        return print_json(&DetectOutput {
            threshold_ms,
            needed: !detection.candidates.is_empty(),
            detection,
        });
    }

    if detection.candidates.is_empty() && detection.unrecoverable.is_empty() {
        println!("No stalled missions.");
        return Ok(());
    }
    for c in &detection.candidates {
        println!(
            "{} {} idle {} (last activity {}); resume from {}",
            c.mission_id.bold(),
            c.mission_title,
            format_elapsed(c.inactive_ms).yellow(),
            format_ts(c.last_activity_at).dimmed(),
            c.checkpoint.id.green()
        );
    }
    for s in &detection.unrecoverable {
        println!(
            "{} {} idle {}; {}",
            s.mission_id.bold(),
            s.mission_title,
            format_elapsed(s.inactive_ms).yellow(),
            "stale, no checkpoint".red()
        );
    }
    Ok(())
}
