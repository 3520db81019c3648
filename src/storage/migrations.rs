//! Database migrations embedded at compile time.
//!
//! Migrations are sourced from `/migrations/` at the repo root and
//! embedded into the binary using `include_str!`. A fresh database already
//! has every column from [`super::schema::SCHEMA_SQL`], so migrations only
//! do real work on files created by older builds.

use rusqlite::{Connection, Result};
use tracing::{info, warn};

/// A single migration with version identifier and SQL content.
struct Migration {
    version: &'static str,
    sql: &'static str,
}

/// All migrations in order. Version names match the SQL filenames.
const MIGRATIONS: &[Migration] = &[
    Migration {
        version: "001_lock_release_reason",
        sql: include_str!("../../migrations/001_lock_release_reason.sql"),
    },
    Migration {
        version: "002_message_mission_tag",
        sql: include_str!("../../migrations/002_message_mission_tag.sql"),
    },
    Migration {
        version: "003_legacy_imports",
        sql: include_str!("../../migrations/003_legacy_imports.sql"),
    },
    Migration {
        version: "004_message_deliveries",
        sql: include_str!("../../migrations/004_message_deliveries.sql"),
    },
];

/// Run all pending migrations on the database.
///
/// Already-applied migrations (tracked in `schema_migrations`) are skipped,
/// so this is safe to call on every open.
///
/// # Errors
///
/// Returns an error if a migration fails for any reason other than the
/// column already existing.
pub fn run_migrations(conn: &Connection) -> Result<()> {
    conn.execute(
        "CREATE TABLE IF NOT EXISTS schema_migrations (
            version TEXT PRIMARY KEY,
            applied_at INTEGER NOT NULL
        )",
        [],
    )?;

    let applied: std::collections::HashSet<String> = conn
        .prepare("SELECT version FROM schema_migrations")?
        .query_map([], |row| row.get(0))?
        .collect::<Result<_, _>>()?;

    for migration in MIGRATIONS {
        if applied.contains(migration.version) {
            continue;
        }

        info!(version = migration.version, "Applying migration");

        if let Err(e) = conn.execute_batch(migration.sql) {
            if e.to_string().contains("duplicate column name") {
                warn!(
                    version = migration.version,
                    "Migration partially applied (columns exist), marking complete"
                );
            } else {
                return Err(e);
            }
        }

        conn.execute(
            "INSERT INTO schema_migrations (version, applied_at) VALUES (?1, ?2)",
            rusqlite::params![migration.version, chrono::Utc::now().timestamp_millis()],
        )?;
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::schema::SCHEMA_SQL;

    fn count_applied(conn: &Connection) -> i32 {
        conn.query_row("SELECT COUNT(*) FROM schema_migrations", [], |row| row.get(0))
            .unwrap()
    }

    #[test]
    fn test_run_migrations_fresh_db() {
        let conn = Connection::open_in_memory().unwrap();
        conn.execute_batch(SCHEMA_SQL).unwrap();
        run_migrations(&conn).expect("Migrations should apply to fresh database");
        assert_eq!(count_applied(&conn), 4);
    }

    #[test]
    fn test_run_migrations_idempotent() {
        let conn = Connection::open_in_memory().unwrap();
        conn.execute_batch(SCHEMA_SQL).unwrap();
        run_migrations(&conn).unwrap();
        run_migrations(&conn).unwrap();
        assert_eq!(count_applied(&conn), 4);
    }

    #[test]
    fn test_upgrades_pre_reason_locks_table() {
        let conn = Connection::open_in_memory().unwrap();
        conn.execute_batch(
            "CREATE TABLE locks (
                id TEXT PRIMARY KEY,
                resource TEXT NOT NULL,
                holder_id TEXT NOT NULL,
                acquired_at INTEGER NOT NULL,
                timeout_ms INTEGER NOT NULL,
                purpose TEXT,
                released_at INTEGER
            );
            INSERT INTO locks VALUES ('l1', 'a.rs', 'agent-1', 0, 100, NULL, 50);
            CREATE TABLE messages (
                id TEXT PRIMARY KEY,
                from_agent TEXT NOT NULL,
                recipients TEXT NOT NULL,
                subject TEXT NOT NULL,
                body TEXT NOT NULL,
                sent_at INTEGER NOT NULL,
                delivered INTEGER NOT NULL,
                delivered_at INTEGER
            );",
        )
        .unwrap();

        run_migrations(&conn).unwrap();

        let reason: String = conn
            .query_row("SELECT release_reason FROM locks WHERE id = 'l1'", [], |row| {
                row.get(0)
            })
            .unwrap();
        assert_eq!(reason, "released");
    }

    #[test]
    fn test_backfills_deliveries_for_delivered_messages() {
        let conn = Connection::open_in_memory().unwrap();
        conn.execute_batch(
            "CREATE TABLE messages (
                id TEXT PRIMARY KEY,
                from_agent TEXT NOT NULL,
                recipients TEXT NOT NULL,
                subject TEXT NOT NULL,
                body TEXT NOT NULL,
                sent_at INTEGER NOT NULL,
                delivered INTEGER NOT NULL,
                delivered_at INTEGER
            );
            INSERT INTO messages VALUES ('m1', 'lead', '[\"a\",\"b\"]', 's', '', 10, 1, 20);
            INSERT INTO messages VALUES ('m2', 'lead', '[\"a\"]', 's', '', 10, 0, NULL);",
        )
        .unwrap();

        run_migrations(&conn).unwrap();

        let rows: i64 = conn
            .query_row("SELECT COUNT(*) FROM message_deliveries", [], |row| row.get(0))
            .unwrap();
        assert_eq!(rows, 2);
    }

    #[test]
    fn test_open_upgrades_pre_mission_tag_database() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("old.db");
        {
            let conn = Connection::open(&path).unwrap();
            conn.execute_batch(
                "CREATE TABLE locks (
                    id TEXT PRIMARY KEY,
                    resource TEXT NOT NULL,
                    holder_id TEXT NOT NULL,
                    acquired_at INTEGER NOT NULL,
                    timeout_ms INTEGER NOT NULL,
                    purpose TEXT,
                    released_at INTEGER
                );
                CREATE TABLE messages (
                    id TEXT PRIMARY KEY,
                    from_agent TEXT NOT NULL,
                    recipients TEXT NOT NULL,
                    subject TEXT NOT NULL,
                    body TEXT NOT NULL,
                    sent_at INTEGER NOT NULL,
                    delivered INTEGER NOT NULL,
                    delivered_at INTEGER
                );
                INSERT INTO messages VALUES ('m1', 'lead', '[\"a\"]', 's', '', 10, 0, NULL);",
            )
            .unwrap();
        }

        let storage = crate::storage::SqliteStorage::open(&path).expect("old database should open");
        let conn = storage.conn();

        let mission: Option<String> = conn
            .query_row("SELECT mission_id FROM messages WHERE id = 'm1'", [], |row| row.get(0))
            .unwrap();
        assert!(mission.is_none());

        let index: i64 = conn
            .query_row(
                "SELECT COUNT(*) FROM sqlite_master WHERE type = 'index' AND name = 'idx_messages_mission'",
                [],
                |row| row.get(0),
            )
            .unwrap();
        assert_eq!(index, 1);
    }
}
