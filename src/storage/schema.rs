//! Database schema definitions.
//!
//! The complete schema for a fresh Fleet database. Incremental changes for
//! databases created by older builds live in [`super::migrations`].

use rusqlite::{Connection, Result};

/// Current schema version for migration tracking.
pub const CURRENT_SCHEMA_VERSION: i32 = 1;

/// The complete SQL schema for the Fleet database.
///
/// Timestamps are INTEGER Unix milliseconds. JSON-valued columns are TEXT
/// and are validated by serde when read back.
pub const SCHEMA_SQL: &str = r"
-- ====================
-- Schema Version Tracking
-- ====================

CREATE TABLE IF NOT EXISTS schema_migrations (
    version TEXT PRIMARY KEY,
    applied_at INTEGER NOT NULL
);

-- ====================
-- Event Log
-- ====================

-- Append-only, positions are gapless per (stream_type, stream_id)
CREATE TABLE IF NOT EXISTS events (
    id TEXT PRIMARY KEY,
    stream_type TEXT NOT NULL,
    stream_id TEXT NOT NULL,
    event_type TEXT NOT NULL,
    data TEXT NOT NULL DEFAULT '{}',
    occurred_at INTEGER NOT NULL,
    position INTEGER NOT NULL CHECK (position >= 1),
    causation_id TEXT,
    correlation_id TEXT,
    UNIQUE (stream_type, stream_id, position)
);

CREATE INDEX IF NOT EXISTS idx_events_stream_id ON events(stream_id, position);
CREATE INDEX IF NOT EXISTS idx_events_occurred ON events(occurred_at);

-- Consumer read positions
CREATE TABLE IF NOT EXISTS cursors (
    consumer_id TEXT NOT NULL,
    stream_id TEXT NOT NULL,
    position INTEGER NOT NULL DEFAULT 0 CHECK (position >= 0),
    updated_at INTEGER NOT NULL,
    PRIMARY KEY (consumer_id, stream_id)
);

-- ====================
-- Locks
-- ====================

CREATE TABLE IF NOT EXISTS locks (
    id TEXT PRIMARY KEY,
    resource TEXT NOT NULL,
    holder_id TEXT NOT NULL,
    acquired_at INTEGER NOT NULL,
    timeout_ms INTEGER NOT NULL CHECK (timeout_ms > 0),
    purpose TEXT,
    released_at INTEGER,
    release_reason TEXT CHECK (release_reason IN ('released', 'expired', 'forced', 'renewed'))
);

-- At most one unreleased row per resource
CREATE UNIQUE INDEX IF NOT EXISTS idx_locks_live_resource
    ON locks(resource) WHERE released_at IS NULL;
CREATE INDEX IF NOT EXISTS idx_locks_holder ON locks(holder_id);

-- ====================
-- Missions & Sorties
-- ====================

CREATE TABLE IF NOT EXISTS missions (
    id TEXT PRIMARY KEY,
    title TEXT NOT NULL,
    description TEXT,
    status TEXT NOT NULL DEFAULT 'pending'
        CHECK (status IN ('pending', 'in_progress', 'review', 'completed', 'cancelled')),
    total_sorties INTEGER NOT NULL DEFAULT 0,
    completed_sorties INTEGER NOT NULL DEFAULT 0,
    created_at INTEGER NOT NULL,
    updated_at INTEGER NOT NULL,
    started_at INTEGER,
    completed_at INTEGER
);

CREATE INDEX IF NOT EXISTS idx_missions_status ON missions(status);

CREATE TABLE IF NOT EXISTS sorties (
    id TEXT PRIMARY KEY,
    mission_id TEXT NOT NULL REFERENCES missions(id) ON DELETE CASCADE,
    title TEXT NOT NULL,
    status TEXT NOT NULL DEFAULT 'pending'
        CHECK (status IN ('pending', 'assigned', 'in_progress', 'blocked', 'review', 'completed', 'failed', 'cancelled')),
    assigned_to TEXT,
    files TEXT NOT NULL DEFAULT '[]',
    progress INTEGER NOT NULL DEFAULT 0 CHECK (progress >= 0 AND progress <= 100),
    progress_notes TEXT,
    created_at INTEGER NOT NULL,
    updated_at INTEGER NOT NULL
);

CREATE INDEX IF NOT EXISTS idx_sorties_mission ON sorties(mission_id, created_at);
CREATE INDEX IF NOT EXISTS idx_sorties_assignee ON sorties(assigned_to);

-- ====================
-- Mailbox
-- ====================

CREATE TABLE IF NOT EXISTS messages (
    id TEXT PRIMARY KEY,
    mission_id TEXT,
    from_agent TEXT NOT NULL,
    recipients TEXT NOT NULL DEFAULT '[]',
    subject TEXT NOT NULL,
    body TEXT NOT NULL DEFAULT '',
    sent_at INTEGER NOT NULL,
    delivered INTEGER NOT NULL DEFAULT 0,
    delivered_at INTEGER
);

-- One row per recipient that acknowledged the message
CREATE TABLE IF NOT EXISTS message_deliveries (
    message_id TEXT NOT NULL REFERENCES messages(id) ON DELETE CASCADE,
    agent_id TEXT NOT NULL,
    delivered_at INTEGER NOT NULL,
    PRIMARY KEY (message_id, agent_id)
);

-- ====================
-- Checkpoints
-- ====================

-- Snapshots are point-in-time copies, so mission_id is not a live foreign key
CREATE TABLE IF NOT EXISTS checkpoints (
    id TEXT PRIMARY KEY,
    mission_id TEXT NOT NULL,
    timestamp INTEGER NOT NULL,
    trigger TEXT NOT NULL CHECK (trigger IN ('progress', 'error', 'manual', 'compaction')),
    trigger_details TEXT,
    progress_percent INTEGER NOT NULL CHECK (progress_percent >= 0 AND progress_percent <= 100),
    sorties TEXT NOT NULL DEFAULT '[]',
    active_locks TEXT NOT NULL DEFAULT '[]',
    pending_messages TEXT NOT NULL DEFAULT '[]',
    recovery_context TEXT NOT NULL,
    created_by TEXT NOT NULL,
    consumed_at INTEGER
);

CREATE INDEX IF NOT EXISTS idx_checkpoints_mission ON checkpoints(mission_id, timestamp DESC);

-- ====================
-- Agents (dispatch)
-- ====================

CREATE TABLE IF NOT EXISTS agents (
    id TEXT PRIMARY KEY,
    name TEXT NOT NULL,
    capabilities TEXT NOT NULL DEFAULT '[]',
    status TEXT NOT NULL DEFAULT 'idle' CHECK (status IN ('idle', 'busy', 'offline')),
    current_load INTEGER NOT NULL DEFAULT 0 CHECK (current_load >= 0),
    max_capacity INTEGER NOT NULL DEFAULT 1 CHECK (max_capacity > 0),
    registered_at INTEGER NOT NULL,
    seq INTEGER NOT NULL
);

-- ====================
-- Legacy Import Tracking
-- ====================

CREATE TABLE IF NOT EXISTS legacy_imports (
    source_path TEXT PRIMARY KEY,
    content_hash TEXT NOT NULL,
    checkpoint_id TEXT NOT NULL,
    imported_at INTEGER NOT NULL
);
";

/// Indexes over columns that older databases only gain through a migration.
///
/// Runs after [`super::migrations::run_migrations`].
pub const POST_MIGRATION_SQL: &str = r"
CREATE INDEX IF NOT EXISTS idx_messages_mission ON messages(mission_id, delivered);
";

/// Apply the schema and pending migrations to a connection.
///
/// Safe to call on every open.
///
/// # Errors
///
/// Returns an error if a pragma, the DDL, or a migration fails.
pub fn apply_schema(conn: &Connection) -> Result<()> {
    conn.pragma_update(None, "journal_mode", "WAL")?;
    conn.pragma_update(None, "foreign_keys", "ON")?;
    conn.pragma_update(None, "synchronous", "NORMAL")?;
    conn.pragma_update(None, "temp_store", "MEMORY")?;

    conn.execute_batch(SCHEMA_SQL)?;

    super::migrations::run_migrations(conn)?;
    conn.execute_batch(POST_MIGRATION_SQL)?;

    conn.execute(
        "INSERT OR IGNORE INTO schema_migrations (version, applied_at) VALUES (?1, ?2)",
        rusqlite::params![
            format!("v{CURRENT_SCHEMA_VERSION}"),
            chrono::Utc::now().timestamp_millis()
        ],
    )?;

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_apply_schema() {
        let conn = Connection::open_in_memory().unwrap();
        apply_schema(&conn).expect("Failed to apply schema");

        let tables: Vec<String> = conn
            .prepare("SELECT name FROM sqlite_master WHERE type='table' ORDER BY name")
            .unwrap()
            .query_map([], |row| row.get(0))
            .unwrap()
            .collect::<Result<Vec<_>, _>>()
            .unwrap();

        for table in [
            "events",
            "cursors",
            "locks",
            "missions",
            "sorties",
            "messages",
            "message_deliveries",
            "checkpoints",
            "agents",
            "legacy_imports",
        ] {
            assert!(tables.contains(&table.to_string()), "missing table {table}");
        }
    }

    #[test]
    fn test_schema_is_idempotent() {
        let conn = Connection::open_in_memory().unwrap();
        apply_schema(&conn).expect("First apply failed");
        apply_schema(&conn).expect("Second apply failed");
    }

    #[test]
    fn test_live_lock_index_rejects_second_row() {
        let conn = Connection::open_in_memory().unwrap();
        apply_schema(&conn).unwrap();

        conn.execute(
            "INSERT INTO locks (id, resource, holder_id, acquired_at, timeout_ms)
             VALUES ('l1', 'src/a.rs', 'agent-1', 0, 1000)",
            [],
        )
        .unwrap();
        let second = conn.execute(
            "INSERT INTO locks (id, resource, holder_id, acquired_at, timeout_ms)
             VALUES ('l2', 'src/a.rs', 'agent-2', 0, 1000)",
            [],
        );
        assert!(second.is_err());

        // Released rows do not count
        conn.execute(
            "UPDATE locks SET released_at = 10, release_reason = 'released' WHERE id = 'l1'",
            [],
        )
        .unwrap();
        conn.execute(
            "INSERT INTO locks (id, resource, holder_id, acquired_at, timeout_ms)
             VALUES ('l2', 'src/a.rs', 'agent-2', 20, 1000)",
            [],
        )
        .unwrap();
    }

    #[test]
    fn test_event_position_unique_per_stream() {
        let conn = Connection::open_in_memory().unwrap();
        apply_schema(&conn).unwrap();

        let insert = "INSERT INTO events (id, stream_type, stream_id, event_type, occurred_at, position)
                      VALUES (?1, 'mission', ?2, 'x', 0, ?3)";
        conn.execute(insert, rusqlite::params!["e1", "m1", 1]).unwrap();
        conn.execute(insert, rusqlite::params!["e2", "m2", 1]).unwrap();
        assert!(conn.execute(insert, rusqlite::params!["e3", "m1", 1]).is_err());
    }
}
