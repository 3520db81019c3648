//! Mission and sortie command implementations.

use crate::cli::commands::{format_ts, now_ms, print_json, CommandContext};
use crate::cli::{MissionCommands, SortieCommands};
use crate::error::Result;
use crate::model::{Mission, MissionStatus, Sortie, SortieStatus, SortieUpdate};
use crate::storage::missions;
use colored::Colorize;
use serde::Serialize;

#[derive(Serialize)]
struct MissionListOutput {
    missions: Vec<Mission>,
    count: usize,
}

#[derive(Serialize)]
struct MissionShowOutput {
    mission: Mission,
    progress_percent: u8,
    sorties: Vec<Sortie>,
}

#[derive(Serialize)]
struct SortieListOutput {
    sorties: Vec<Sortie>,
    count: usize,
}

fn status_colored(status: MissionStatus) -> colored::ColoredString {
    match status {
        MissionStatus::Pending => status.as_str().normal(),
        MissionStatus::InProgress => status.as_str().cyan(),
        MissionStatus::Review => status.as_str().yellow(),
        MissionStatus::Completed => status.as_str().green(),
        MissionStatus::Cancelled => status.as_str().dimmed(),
    }
}

fn sortie_line(s: &Sortie) {
    let status = match s.status {
        SortieStatus::Completed => s.status.as_str().green(),
        SortieStatus::Blocked | SortieStatus::Failed => s.status.as_str().red(),
        SortieStatus::InProgress => s.status.as_str().cyan(),
        _ => s.status.as_str().normal(),
    };
    println!(
        "  {} [{}] {:>3}% {} {}",
        s.id.dimmed(),
        status,
        s.progress,
        s.title,
        s.assigned_to
            .as_deref()
            .map(|a| format!("@{a}"))
            .unwrap_or_default()
            .dimmed()
    );
}

/// Execute mission commands.
///
/// # Errors
///
/// Returns an error if the database cannot be opened or the operation fails.
pub fn execute(command: &MissionCommands, ctx: &CommandContext<'_>) -> Result<()> {
    match command {
        MissionCommands::Create {
            title,
            id,
            description,
        } => create(ctx, title, id.as_deref(), description.as_deref()),
        MissionCommands::List { status } => list(ctx, status.as_deref()),
        MissionCommands::Show { id } => show(ctx, id),
        MissionCommands::Status { id, status } => set_status(ctx, id, status),
    }
}

fn create(ctx: &CommandContext<'_>, title: &str, id: Option<&str>, description: Option<&str>) -> Result<()> {
    let mut storage = ctx.open()?;
    let mission = storage.mutate("mission_create", &ctx.actor(), |tx, mctx| {
        missions::create_mission(tx, mctx, id, title, description)
    })?;

    if ctx.json {
        return print_json(&mission);
    }
    if !ctx.quiet {
        println!("Created mission {} {}", mission.id.bold(), mission.title);
    }
    Ok(())
}

fn list(ctx: &CommandContext<'_>, status: Option<&str>) -> Result<()> {
    let storage = ctx.open()?;
    let status = status.map(str::parse::<MissionStatus>).transpose()?;
    let missions = missions::list_missions(storage.conn(), status)?;

    if ctx.json {
        let count = missions.len();
        return print_json(&MissionListOutput { missions, count });
    }

    if missions.is_empty() {
        println!("No missions.");
        return Ok(());
    }
    for m in &missions {
        println!(
            "{} [{}] {} ({}/{} sorties)",
            m.id.bold(),
            status_colored(m.status),
            m.title,
            m.completed_sorties,
            m.total_sorties
        );
    }
    Ok(())
}

fn show(ctx: &CommandContext<'_>, id: &str) -> Result<()> {
    let storage = ctx.open()?;
    let mission = missions::require_mission(storage.conn(), id)?;
    let sorties = missions::list_sorties(storage.conn(), id)?;

    if ctx.json {
        return print_json(&MissionShowOutput {
            progress_percent: mission.progress_percent(),
            mission,
            sorties,
        });
    }

    println!("{} {}", mission.id.bold(), mission.title);
    println!("  Status:   {}", status_colored(mission.status));
    println!("  Progress: {}%", mission.progress_percent());
    println!("  Created:  {}", format_ts(mission.created_at));
    if let Some(desc) = &mission.description {
        println!("  {desc}");
    }
    if !sorties.is_empty() {
        println!();
        for s in &sorties {
            sortie_line(s);
        }
    }
    Ok(())
}

fn set_status(ctx: &CommandContext<'_>, id: &str, status: &str) -> Result<()> {
    let next: MissionStatus = status.parse()?;
    let mut storage = ctx.open()?;
    let mission = storage.mutate("mission_status", &ctx.actor(), |tx, mctx| {
        missions::update_mission_status(tx, mctx, id, next)
    })?;

    if ctx.json {
        return print_json(&mission);
    }
    if !ctx.quiet {
        println!("Mission {} is now {}", mission.id.bold(), status_colored(mission.status));
    }
    Ok(())
}

/// Execute sortie commands.
///
/// # Errors
///
/// Returns an error if the database cannot be opened or the operation fails.
pub fn execute_sortie(command: &SortieCommands, ctx: &CommandContext<'_>) -> Result<()> {
    match command {
        SortieCommands::Add {
            mission,
            title,
            files,
        } => {
            let mut storage = ctx.open()?;
            let sortie = storage.mutate("sortie_create", &ctx.actor(), |tx, mctx| {
                missions::create_sortie(tx, mctx, mission, title, files)
            })?;
            if ctx.json {
                return print_json(&sortie);
            }
            if !ctx.quiet {
                println!("Added sortie {} to {mission}", sortie.id.bold());
            }
            Ok(())
        }
        SortieCommands::List { mission } => {
            let storage = ctx.open()?;
            missions::require_mission(storage.conn(), mission)?;
            let sorties = missions::list_sorties(storage.conn(), mission)?;
            if ctx.json {
                let count = sorties.len();
                return print_json(&SortieListOutput { sorties, count });
            }
            if sorties.is_empty() {
                println!("No sorties.");
            }
            for s in &sorties {
                sortie_line(s);
            }
            Ok(())
        }
        SortieCommands::Assign { id, agent } => {
            let mut storage = ctx.open()?;
            let sortie = storage.mutate("sortie_assign", &ctx.actor(), |tx, mctx| {
                missions::assign_sortie(tx, mctx, id, agent)
            })?;
            if ctx.json {
                return print_json(&sortie);
            }
            if !ctx.quiet {
                println!("Assigned {} to {agent}", sortie.id.bold());
            }
            Ok(())
        }
        SortieCommands::Progress {
            id,
            status,
            progress,
            notes,
        } => {
            let update = SortieUpdate {
                status: status.as_deref().map(str::parse).transpose()?,
                progress: *progress,
                notes: notes.clone(),
            };
            let agent = ctx.actor();
            let mut storage = ctx.open()?;
            let sortie = storage.mutate_at("sortie_progress", &agent, now_ms(), |tx, mctx| {
                missions::update_sortie_progress(tx, mctx, id, &agent, &update)
            })?;
            if ctx.json {
                return print_json(&sortie);
            }
            if !ctx.quiet {
                sortie_line(&sortie);
            }
            Ok(())
        }
    }
}
