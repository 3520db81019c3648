//! Checkpoint, resume and prune command implementations.

use crate::checkpoint::{self, PruneReport};
use crate::cli::commands::{confirm, format_ts, now_ms, print_json, CommandContext};
use crate::cli::{CheckpointArgs, CheckpointsCommands, ResumeArgs};
use crate::error::{Error, Result};
use crate::model::{Checkpoint, CheckpointInput, CheckpointQuery, MissionStatus, PruneOptions};
use crate::recovery::{
    self, format_recovery_prompt, RestoreOptions, RestoreResult,
};
use crate::config::activity_threshold_ms;
use crate::storage::{checkpoints, missions, SqliteStorage};
use colored::Colorize;
use serde::Serialize;

#[derive(Serialize)]
struct CheckpointListOutput {
    checkpoints: Vec<CheckpointInfo>,
    count: usize,
}

#[derive(Serialize)]
struct CheckpointInfo {
    id: String,
    mission_id: String,
    timestamp: i64,
    trigger: String,
    progress_percent: u8,
    consumed: bool,
}

impl From<&Checkpoint> for CheckpointInfo {
    fn from(cp: &Checkpoint) -> Self {
        Self {
            id: cp.id.clone(),
            mission_id: cp.mission_id.clone(),
            timestamp: cp.timestamp,
            trigger: cp.trigger.as_str().to_string(),
            progress_percent: cp.progress_percent,
            consumed: cp.is_consumed(),
        }
    }
}

#[derive(Serialize)]
struct ResumeOutput {
    #[serde(flatten)]
    result: RestoreResult,
    prompt: String,
}

#[derive(Serialize)]
struct AbortedOutput {
    aborted: bool,
}

/// The mission a bare `fleet checkpoint` refers to: the only in-progress one.
fn implied_mission(storage: &SqliteStorage) -> Result<String> {
    let active = missions::list_missions(storage.conn(), Some(MissionStatus::InProgress))?;
    match active.as_slice() {
        [only] => Ok(only.id.clone()),
        [] => Err(Error::InvalidArgument(
            "no in-progress mission; pass --mission".into(),
        )),
        _ => Err(Error::InvalidArgument(format!(
            "{} missions are in progress; pass --mission",
            active.len()
        ))),
    }
}

/// Execute `fleet checkpoint`.
///
/// # Errors
///
/// Returns `MissionNotFound`, `InvalidArgument`, or a database error.
pub fn execute_create(args: &CheckpointArgs, ctx: &CommandContext<'_>) -> Result<()> {
    let mut storage = ctx.open()?;
    let mission_id = match &args.mission {
        Some(id) => id.clone(),
        None => implied_mission(&storage)?,
    };
    let actor = ctx.actor();
    let input = CheckpointInput {
        mission_id,
        trigger: args.trigger.parse()?,
        progress_percent: args.progress,
        last_action: args.note.clone(),
        next_steps: args.next_steps.clone(),
        blockers: args.blockers.clone(),
        created_by: actor.clone(),
        ..CheckpointInput::default()
    };

    let mirror = ctx.mirror_root()?;
    let cp = checkpoint::create(&mut storage, &input, &actor, Some(&mirror), now_ms())?;

    if ctx.json {
        return print_json(&cp);
    }
    if !ctx.quiet {
        println!("Saved checkpoint {} for {}", cp.id.bold(), cp.mission_id);
        println!(
            "  {}% | {} sorties, {} locks, {} pending messages",
            cp.progress_percent,
            cp.sorties.len(),
            cp.active_locks.len(),
            cp.pending_messages.len()
        );
    }
    Ok(())
}

/// Execute `fleet checkpoints ...`.
///
/// # Errors
///
/// Returns `CheckpointNotFound`, `ConfirmationRequired`, or a database error.
pub fn execute(command: &CheckpointsCommands, ctx: &CommandContext<'_>) -> Result<()> {
    match command {
        CheckpointsCommands::List { mission, limit } => list(ctx, mission.clone(), *limit),
        CheckpointsCommands::Show { id } => show(ctx, id),
        CheckpointsCommands::Prune {
            mission,
            older_than,
            keep,
            dry_run,
            yes,
        } => prune(
            ctx,
            &PruneOptions {
                mission_id: mission.clone(),
                older_than_days: *older_than,
                keep_per_mission: *keep,
            },
            *dry_run,
            *yes,
        ),
    }
}

fn list(ctx: &CommandContext<'_>, mission_id: Option<String>, limit: u32) -> Result<()> {
    let storage = ctx.open()?;
    let cps = checkpoints::list(
        storage.conn(),
        &CheckpointQuery {
            mission_id,
            limit: Some(limit),
        },
    )?;

    if ctx.json {
        let checkpoints: Vec<CheckpointInfo> = cps.iter().map(CheckpointInfo::from).collect();
        let count = checkpoints.len();
        return print_json(&CheckpointListOutput { checkpoints, count });
    }

    if cps.is_empty() {
        println!("No checkpoints.");
        return Ok(());
    }
    for cp in &cps {
        let consumed = if cp.is_consumed() {
            " consumed".dimmed().to_string()
        } else {
            String::new()
        };
        println!(
            "{} {} {} {:>3}% [{}]{consumed}",
            cp.id.bold(),
            format_ts(cp.timestamp).dimmed(),
            cp.mission_id,
            cp.progress_percent,
            cp.trigger.as_str()
        );
    }
    Ok(())
}

fn show(ctx: &CommandContext<'_>, id: &str) -> Result<()> {
    let storage = ctx.open()?;
    let cp = checkpoints::require(storage.conn(), id)?;

    if ctx.json {
        return print_json(&cp);
    }

    println!("{} ({})", cp.id.bold(), cp.trigger.as_str());
    println!("  Mission:  {}", cp.mission_id);
    println!("  Taken:    {} by {}", format_ts(cp.timestamp), cp.created_by);
    println!("  Progress: {}%", cp.progress_percent);
    if let Some(at) = cp.consumed_at {
        println!("  Consumed: {}", format_ts(at));
    }
    if let Some(details) = &cp.trigger_details {
        println!("  Details:  {details}");
    }
    println!();
    println!("{}", "Sorties".bold());
    for s in &cp.sorties {
        println!("  {} [{}] {:>3}% {}", s.id.dimmed(), s.status, s.progress, s.title);
    }
    println!("{}", "Locks".bold());
    for l in &cp.active_locks {
        println!("  {} held by {}", l.resource, l.holder_id);
    }
    println!("{}", "Pending messages".bold());
    for m in &cp.pending_messages {
        println!("  {} from {}: {}", m.id.dimmed(), m.from, m.subject);
    }
    if !cp.recovery_context.mission_summary.is_empty() {
        println!();
        println!("{}", cp.recovery_context.mission_summary);
    }
    Ok(())
}

fn prune(ctx: &CommandContext<'_>, opts: &PruneOptions, dry_run: bool, yes: bool) -> Result<()> {
    let mut storage = ctx.open()?;
    let mirror = ctx.mirror_root()?;
    let now = now_ms();

    let preview = checkpoint::prune(&mut storage, opts, true, Some(&mirror), now)?;
    let report = if dry_run || preview.checkpoint_ids.is_empty() {
        preview
    } else {
        let action = format!("Delete {} checkpoint(s)", preview.checkpoint_ids.len());
        if !confirm(&action, yes)? {
            if ctx.json {
                return print_json(&AbortedOutput { aborted: true });
            }
            println!("Aborted.");
            return Ok(());
        }
        checkpoint::prune(&mut storage, opts, false, Some(&mirror), now)?
    };

    print_prune(ctx, &report)
}

fn print_prune(ctx: &CommandContext<'_>, report: &PruneReport) -> Result<()> {
    if ctx.json {
        return print_json(report);
    }
    if ctx.quiet {
        return Ok(());
    }
    let verb = if report.dry_run { "Would delete" } else { "Deleted" };
    println!("{verb} {} checkpoint(s)", report.checkpoint_ids.len());
    for id in &report.checkpoint_ids {
        println!("  {id}");
    }
    Ok(())
}

/// Execute `fleet resume`.
///
/// Without `--checkpoint` or `--mission`, resumes the single stalled mission
/// the detector finds.
///
/// # Errors
///
/// Returns `CheckpointNotFound`, `ConfirmationRequired` for an unconfirmed
/// forced resume, or `TransactionRollback` when the restore rolled back.
pub fn execute_resume(args: &ResumeArgs, ctx: &CommandContext<'_>) -> Result<()> {
    let mut storage = ctx.open()?;
    let actor = ctx.actor();
    let now = now_ms();

    if args.force_locks && !args.dry_run {
        let action = "Resume and take over locks held by other agents";
        if !confirm(action, args.yes)? {
            if ctx.json {
                return print_json(&AbortedOutput { aborted: true });
            }
            println!("Aborted.");
            return Ok(());
        }
    }

    let opts = RestoreOptions {
        dry_run: args.dry_run,
        force_locks: args.force_locks,
    };
    let result = match (&args.checkpoint, &args.mission) {
        (Some(id), _) => recovery::restore_from_checkpoint(&mut storage, id, opts, &actor, now)?,
        (None, Some(mission)) => recovery::restore_latest(&mut storage, mission, opts, &actor, now)?,
        (None, None) => {
            let check = recovery::check_for_recovery(storage.conn(), activity_threshold_ms()?, now)?;
            match check.candidates.as_slice() {
                [only] => {
                    let id = only.checkpoint.id.clone();
                    recovery::restore_from_checkpoint(&mut storage, &id, opts, &actor, now)?
                }
                [] => {
                    return Err(Error::InvalidArgument(
                        "no stalled mission with a checkpoint; pass --checkpoint or --mission".into(),
                    ))
                }
                many => {
                    return Err(Error::InvalidArgument(format!(
                        "{} stalled missions; pass --mission (see `fleet recover detect`)",
                        many.len()
                    )))
                }
            }
        }
    };

    if !result.dry_run {
        checkpoint::mirror::refresh_or_warn(
            Some(&ctx.mirror_root()?),
            storage.conn(),
            &result.mission_id,
        );
    }

    let prompt = format_recovery_prompt(&result);
    let failed = (!result.success).then(|| result.errors.join("; "));

    if ctx.json {
        print_json(&ResumeOutput { result, prompt })?;
    } else if !ctx.quiet {
        print!("{prompt}");
    }

    match failed {
        Some(reason) => Err(Error::TransactionRollback { reason }),
        None => Ok(()),
    }
}
