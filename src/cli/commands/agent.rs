//! Agent registry command implementations.

use crate::cli::commands::{now_ms, print_json, CommandContext};
use crate::cli::AgentCommands;
use crate::error::Result;
use crate::model::Agent;
use crate::storage::agents;
use colored::Colorize;
use serde::Serialize;

#[derive(Serialize)]
struct AgentListOutput {
    agents: Vec<Agent>,
    count: usize,
}

/// Execute agent commands.
///
/// # Errors
///
/// Returns `InvalidArgument` for a bad registration, or a database error.
pub fn execute(command: &AgentCommands, ctx: &CommandContext<'_>) -> Result<()> {
    match command {
        AgentCommands::Register {
            id,
            name,
            capabilities,
            capacity,
        } => {
            let mut storage = ctx.open()?;
            let now = now_ms();
            let agent = storage.mutate_at("agent_register", &ctx.actor(), now, |tx, _mctx| {
                agents::register(tx, id, name, capabilities, *capacity, now)
            })?;
            if ctx.json {
                return print_json(&agent);
            }
            if !ctx.quiet {
                println!("Registered {} ({})", agent.id.bold(), agent.capabilities.join(", "));
            }
            Ok(())
        }
        AgentCommands::List => {
            let storage = ctx.open()?;
            let agents = agents::list(storage.conn())?;
            if ctx.json {
                let count = agents.len();
                return print_json(&AgentListOutput { agents, count });
            }
            if agents.is_empty() {
                println!("No agents registered.");
            }
            for a in &agents {
                println!(
                    "{} [{}] {}/{} {}",
                    a.id.bold(),
                    a.status.as_str(),
                    a.current_load,
                    a.max_capacity,
                    a.capabilities.join(", ").dimmed()
                );
            }
            Ok(())
        }
    }
}
