//! Dispatch command implementation.

use crate::cli::commands::{print_json, CommandContext};
use crate::cli::DispatchArgs;
use crate::dispatch::{self, Assignment};
use crate::error::Result;
use crate::model::Priority;
use colored::Colorize;
use serde::Serialize;

#[derive(Serialize)]
struct DispatchOutput {
    assigned: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    assignment: Option<Assignment>,
}

/// Execute the dispatch command.
///
/// # Errors
///
/// Returns `InvalidArgument` for an unknown priority, `SortieNotFound`, or
/// a database error.
pub fn execute(args: &DispatchArgs, ctx: &CommandContext<'_>) -> Result<()> {
    let priority: Priority = args.priority.parse()?;
    let mut storage = ctx.open()?;

    let assignment = storage.mutate("dispatch", &ctx.actor(), |tx, mctx| match &args.sortie {
        Some(sortie_id) => dispatch::assign_sortie(tx, mctx, sortie_id, &args.work_type, priority),
        None => dispatch::assign(tx, &args.work_type, &args.description, priority),
    })?;

    if ctx.json {
        return print_json(&DispatchOutput {
            assigned: assignment.is_some(),
            assignment,
        });
    }
    if ctx.quiet {
        return Ok(());
    }
    match assignment {
        Some(a) => println!(
            "Assigned to {} (score {:.3}){}",
            a.agent_id.bold(),
            a.score,
            a.sortie_id.map(|s| format!(" for {s}")).unwrap_or_default()
        ),
        None => println!("{}", "No idle agent with spare capacity.".yellow()),
    }
    Ok(())
}
