//! Weighted assignment of work to idle agents.
//!
//! ```text
//! score = capability_match * 0.4 + (1 - load / capacity) * 0.3 + priority_weight * 0.3
//! ```
//!
//! Only idle agents with spare capacity are scored. Ties go to the agent
//! registered first.

use crate::error::Result;
use crate::model::{Agent, AgentStatus, Priority};
use crate::storage::{agents, missions, MutationContext};
use rusqlite::Connection;
use serde::Serialize;
use tracing::debug;

const CAPABILITY_WEIGHT: f64 = 0.4;
const LOAD_WEIGHT: f64 = 0.3;
const PRIORITY_WEIGHT: f64 = 0.3;

/// The agent chosen for a piece of work.
#[derive(Debug, Clone, Serialize)]
pub struct Assignment {
    pub agent_id: String,
    pub score: f64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub sortie_id: Option<String>,
}

/// 1.0 for an exact capability match on the work type, 0.5 when a
/// capability appears as a word of the description, otherwise 0.
#[must_use]
pub fn capability_match(agent: &Agent, work_type: &str, description: &str) -> f64 {
    if agent
        .capabilities
        .iter()
        .any(|c| c.eq_ignore_ascii_case(work_type))
    {
        return 1.0;
    }
    let words: Vec<String> = description
        .split(|c: char| !c.is_alphanumeric() && c != '-' && c != '_')
        .filter(|w| !w.is_empty())
        .map(str::to_lowercase)
        .collect();
    if agent
        .capabilities
        .iter()
        .any(|c| words.contains(&c.to_lowercase()))
    {
        0.5
    } else {
        0.0
    }
}

/// Score an agent, `None` when it cannot take work.
#[must_use]
pub fn score(agent: &Agent, work_type: &str, description: &str, priority: Priority) -> Option<f64> {
    if agent.status != AgentStatus::Idle || agent.current_load >= agent.max_capacity {
        return None;
    }
    let load_ratio = f64::from(agent.current_load) / f64::from(agent.max_capacity);
    Some(
        capability_match(agent, work_type, description) * CAPABILITY_WEIGHT
            + (1.0 - load_ratio) * LOAD_WEIGHT
            + priority.weight() * PRIORITY_WEIGHT,
    )
}

/// Pick the best agent and bump its load. `None` when nobody is available.
///
/// # Errors
///
/// Returns an error if the registry cannot be read or updated.
pub fn assign(
    conn: &Connection,
    work_type: &str,
    description: &str,
    priority: Priority,
) -> Result<Option<Assignment>> {
    let mut best: Option<(Agent, f64)> = None;
    for agent in agents::list(conn)? {
        let Some(s) = score(&agent, work_type, description, priority) else {
            continue;
        };
        // Strictly greater keeps the earlier registration on ties
        if best.as_ref().is_none_or(|(_, top)| s > *top) {
            best = Some((agent, s));
        }
    }

    let Some((agent, score)) = best else {
        debug!(work_type, "No agent available");
        return Ok(None);
    };

    let load = agent.current_load + 1;
    let status = if load >= agent.max_capacity {
        AgentStatus::Busy
    } else {
        AgentStatus::Idle
    };
    agents::set_load(conn, &agent.id, load, status)?;
    debug!(agent_id = %agent.id, score, load, "Dispatched work");

    Ok(Some(Assignment {
        agent_id: agent.id,
        score,
        sortie_id: None,
    }))
}

/// Pick an agent for a sortie and persist the assignment.
///
/// The sortie title serves as the description.
///
/// # Errors
///
/// Returns `SortieNotFound`, or an error from the assignment.
pub fn assign_sortie(
    conn: &Connection,
    ctx: &mut MutationContext,
    sortie_id: &str,
    work_type: &str,
    priority: Priority,
) -> Result<Option<Assignment>> {
    let sortie = missions::require_sortie(conn, sortie_id)?;
    let Some(mut assignment) = assign(conn, work_type, &sortie.title, priority)? else {
        return Ok(None);
    };
    missions::assign_sortie(conn, ctx, sortie_id, &assignment.agent_id)?;
    assignment.sortie_id = Some(sortie.id);
    Ok(Some(assignment))
}
