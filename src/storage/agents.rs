//! Agent registry backing the dispatcher.

use crate::error::{Error, Result};
use crate::model::{Agent, AgentStatus};
use rusqlite::{Connection, OptionalExtension};

const AGENT_COLUMNS: &str =
    "id, name, capabilities, status, current_load, max_capacity, registered_at";

fn map_agent(row: &rusqlite::Row<'_>) -> rusqlite::Result<Agent> {
    let capabilities: String = row.get(2)?;
    let status: String = row.get(3)?;
    Ok(Agent {
        id: row.get(0)?,
        name: row.get(1)?,
        capabilities: super::json_col(2, &capabilities)?,
        status: super::parse_col(3, &status)?,
        current_load: row.get(4)?,
        max_capacity: row.get(5)?,
        registered_at: row.get(6)?,
    })
}

/// Register an agent, or refresh name/capabilities/capacity of an existing one.
///
/// Re-registering keeps the original registration order.
///
/// # Errors
///
/// Returns `InvalidArgument` for an empty id or zero capacity.
pub fn register(
    conn: &Connection,
    id: &str,
    name: &str,
    capabilities: &[String],
    max_capacity: u32,
    now_ms: i64,
) -> Result<Agent> {
    if id.trim().is_empty() {
        return Err(Error::InvalidArgument("agent id must not be empty".into()));
    }
    if max_capacity == 0 {
        return Err(Error::InvalidArgument("agent capacity must be at least 1".into()));
    }

    conn.execute(
        "INSERT INTO agents (id, name, capabilities, status, current_load, max_capacity, registered_at, seq)
         VALUES (?1, ?2, ?3, 'idle', 0, ?4, ?5, (SELECT COALESCE(MAX(seq), 0) + 1 FROM agents))
         ON CONFLICT(id) DO UPDATE SET
           name = excluded.name,
           capabilities = excluded.capabilities,
           max_capacity = excluded.max_capacity",
        rusqlite::params![
            id,
            if name.trim().is_empty() { id } else { name },
            serde_json::to_string(capabilities)?,
            max_capacity,
            now_ms
        ],
    )?;

    require(conn, id)
}

/// Get an agent by ID.
///
/// # Errors
///
/// Returns an error if the query fails.
pub fn get(conn: &Connection, id: &str) -> Result<Option<Agent>> {
    let agent = conn
        .query_row(
            &format!("SELECT {AGENT_COLUMNS} FROM agents WHERE id = ?1"),
            [id],
            map_agent,
        )
        .optional()?;
    Ok(agent)
}

/// Get an agent by ID or fail with `AgentNotFound`.
///
/// # Errors
///
/// Returns `AgentNotFound` if it does not exist.
pub fn require(conn: &Connection, id: &str) -> Result<Agent> {
    get(conn, id)?.ok_or_else(|| Error::AgentNotFound { id: id.to_string() })
}

/// All agents in registration order.
///
/// # Errors
///
/// Returns an error if the query fails.
pub fn list(conn: &Connection) -> Result<Vec<Agent>> {
    let mut stmt = conn.prepare(&format!("SELECT {AGENT_COLUMNS} FROM agents ORDER BY seq ASC"))?;
    let rows = stmt.query_map([], map_agent)?;
    rows.collect::<std::result::Result<Vec<_>, _>>()
        .map_err(Error::from)
}

/// Update an agent's load and status.
///
/// # Errors
///
/// Returns `AgentNotFound` if no row was updated.
pub fn set_load(conn: &Connection, id: &str, load: u32, status: AgentStatus) -> Result<()> {
    let rows = conn.execute(
        "UPDATE agents SET current_load = ?2, status = ?3 WHERE id = ?1",
        rusqlite::params![id, load, status.as_str()],
    )?;
    if rows == 0 {
        return Err(Error::AgentNotFound { id: id.to_string() });
    }
    Ok(())
}

/// Give back one unit of an agent's load.
///
/// A busy agent drops back to idle once it is under capacity. Unknown
/// agents are ignored, since sorties can be assigned to unregistered ones.
///
/// # Errors
///
/// Returns an error if the update fails.
pub fn release_load(conn: &Connection, id: &str) -> Result<Option<Agent>> {
    let Some(agent) = get(conn, id)? else {
        return Ok(None);
    };
    let load = agent.current_load.saturating_sub(1);
    let status = if agent.status == AgentStatus::Busy && load < agent.max_capacity {
        AgentStatus::Idle
    } else {
        agent.status
    };
    set_load(conn, id, load, status)?;
    get(conn, id)
}
