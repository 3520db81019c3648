//! Event log and consumer cursors.
//!
//! Events are appended to streams keyed by `(stream_type, stream_id)`.
//! Each event gets the next position in its stream, starting at 1, with no
//! gaps. The `UNIQUE(stream_type, stream_id, position)` constraint backs
//! this up at the database level, so a racing writer that slips past the
//! head read fails with `StreamWriteConflict` instead of duplicating a
//! position.
//!
//! Functions here take a plain `&Connection` so they compose inside a
//! caller's transaction.

use crate::error::{Error, Result};
use rusqlite::{Connection, OptionalExtension};
use serde::{Deserialize, Serialize};

/// Stream type for per-mission domain events.
pub const MISSION_STREAM: &str = "mission";
/// Stream type for per-agent mailboxes.
pub const MAILBOX_STREAM: &str = "mailbox";

/// Domain event types written by Fleet itself.
///
/// Callers appending through the API may use any event type string.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EventType {
    MissionCreated,
    MissionStatusChanged,
    SortieCreated,
    SortieAssigned,
    SortieProgress,
    CheckpointCreated,
    FleetRecovered,
    MessageSent,
    MessageRequeued,
}

impl EventType {
    /// Get the string representation for storage.
    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::MissionCreated => "mission_created",
            Self::MissionStatusChanged => "mission_status_changed",
            Self::SortieCreated => "sortie_created",
            Self::SortieAssigned => "sortie_assigned",
            Self::SortieProgress => "sortie_progress",
            Self::CheckpointCreated => "checkpoint_created",
            Self::FleetRecovered => "fleet_recovered",
            Self::MessageSent => "message_sent",
            Self::MessageRequeued => "message_requeued",
        }
    }
}

/// An event waiting to be appended.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NewEvent {
    #[serde(alias = "event_type", alias = "type")]
    pub event_type: String,
    #[serde(default)]
    pub data: serde_json::Value,
    #[serde(default, alias = "causation_id")]
    pub causation_id: Option<String>,
    #[serde(default, alias = "correlation_id")]
    pub correlation_id: Option<String>,
}

impl NewEvent {
    #[must_use]
    pub fn new(event_type: impl Into<String>, data: serde_json::Value) -> Self {
        Self {
            event_type: event_type.into(),
            data,
            causation_id: None,
            correlation_id: None,
        }
    }

    #[must_use]
    pub fn with_correlation(mut self, correlation_id: impl Into<String>) -> Self {
        self.correlation_id = Some(correlation_id.into());
        self
    }

    #[must_use]
    pub fn with_causation(mut self, causation_id: impl Into<String>) -> Self {
        self.causation_id = Some(causation_id.into());
        self
    }
}

/// A stored event. Immutable once appended.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Event {
    pub id: String,
    pub stream_type: String,
    pub stream_id: String,
    pub event_type: String,
    pub data: serde_json::Value,
    pub occurred_at: i64,
    pub position: i64,
    pub causation_id: Option<String>,
    pub correlation_id: Option<String>,
}

/// A consumer's read position in a stream.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Cursor {
    pub consumer_id: String,
    pub stream_id: String,
    pub position: i64,
    pub updated_at: i64,
}

const EVENT_COLUMNS: &str =
    "id, stream_type, stream_id, event_type, data, occurred_at, position, causation_id, correlation_id";

fn map_event(row: &rusqlite::Row<'_>) -> rusqlite::Result<Event> {
    let raw: String = row.get(4)?;
    Ok(Event {
        id: row.get(0)?,
        stream_type: row.get(1)?,
        stream_id: row.get(2)?,
        event_type: row.get(3)?,
        data: super::json_col(4, &raw)?,
        occurred_at: row.get(5)?,
        position: row.get(6)?,
        causation_id: row.get(7)?,
        correlation_id: row.get(8)?,
    })
}

/// Current head position of a stream, or 0 if it is empty.
///
/// # Errors
///
/// Returns an error if the query fails.
pub fn stream_head(conn: &Connection, stream_type: &str, stream_id: &str) -> Result<i64> {
    let head: i64 = conn.query_row(
        "SELECT COALESCE(MAX(position), 0) FROM events WHERE stream_type = ?1 AND stream_id = ?2",
        rusqlite::params![stream_type, stream_id],
        |row| row.get(0),
    )?;
    Ok(head)
}

/// Append a batch of events; returns their positions in order.
///
/// The batch is atomic: every event gets a sequential position or none is
/// stored. Run inside an IMMEDIATE transaction to serialize concurrent
/// appenders; [`crate::storage::SqliteStorage::append`] does this.
///
/// # Errors
///
/// Returns `StreamWriteConflict` if a position is already taken, or a
/// database error.
pub fn append(
    conn: &Connection,
    stream_type: &str,
    stream_id: &str,
    events: &[NewEvent],
    now_ms: i64,
) -> Result<Vec<i64>> {
    let head = stream_head(conn, stream_type, stream_id)?;
    insert_batch(conn, stream_type, stream_id, head, events, now_ms)
}

/// Append only if the stream head is still `expected_head`.
///
/// # Errors
///
/// Returns `StreamWriteConflict` when the head has moved.
pub fn append_expecting(
    conn: &Connection,
    stream_type: &str,
    stream_id: &str,
    expected_head: i64,
    events: &[NewEvent],
    now_ms: i64,
) -> Result<Vec<i64>> {
    let head = stream_head(conn, stream_type, stream_id)?;
    if head != expected_head {
        return Err(Error::StreamWriteConflict {
            stream: format!("{stream_type}/{stream_id}"),
            expected: expected_head,
            actual: head,
        });
    }
    insert_batch(conn, stream_type, stream_id, head, events, now_ms)
}

fn insert_batch(
    conn: &Connection,
    stream_type: &str,
    stream_id: &str,
    head: i64,
    events: &[NewEvent],
    now_ms: i64,
) -> Result<Vec<i64>> {
    validate_stream(stream_type, stream_id)?;
    if events.is_empty() {
        return Ok(Vec::new());
    }

    // Savepoint keeps the batch atomic even when the caller has no transaction open
    conn.execute_batch("SAVEPOINT fleet_append")?;
    match insert_rows(conn, stream_type, stream_id, head, events, now_ms) {
        Ok(positions) => {
            conn.execute_batch("RELEASE fleet_append")?;
            Ok(positions)
        }
        Err(e) => {
            conn.execute_batch("ROLLBACK TO fleet_append; RELEASE fleet_append")?;
            Err(e)
        }
    }
}

fn insert_rows(
    conn: &Connection,
    stream_type: &str,
    stream_id: &str,
    head: i64,
    events: &[NewEvent],
    now_ms: i64,
) -> Result<Vec<i64>> {
    let mut stmt = conn.prepare_cached(
        "INSERT INTO events (id, stream_type, stream_id, event_type, data, occurred_at, position, causation_id, correlation_id)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)",
    )?;

    let mut positions = Vec::with_capacity(events.len());
    for (offset, event) in (1_i64..).zip(events) {
        if event.event_type.trim().is_empty() {
            return Err(Error::InvalidArgument("event type must not be empty".into()));
        }
        let position = head + offset;
        let id = format!("evt_{}", uuid::Uuid::new_v4().simple());
        let data = serde_json::to_string(&event.data)?;
        let inserted = stmt.execute(rusqlite::params![
            id,
            stream_type,
            stream_id,
            event.event_type,
            data,
            now_ms,
            position,
            event.causation_id,
            event.correlation_id,
        ]);
        match inserted {
            Ok(_) => positions.push(position),
            Err(e) if is_unique_violation(&e) => {
                let actual = stream_head(conn, stream_type, stream_id)?;
                return Err(Error::StreamWriteConflict {
                    stream: format!("{stream_type}/{stream_id}"),
                    expected: position - 1,
                    actual,
                });
            }
            Err(e) => return Err(e.into()),
        }
    }
    Ok(positions)
}

fn is_unique_violation(err: &rusqlite::Error) -> bool {
    matches!(
        err,
        rusqlite::Error::SqliteFailure(e, _) if e.code == rusqlite::ErrorCode::ConstraintViolation
    )
}

fn validate_stream(stream_type: &str, stream_id: &str) -> Result<()> {
    if stream_type.trim().is_empty() || stream_id.trim().is_empty() {
        return Err(Error::InvalidArgument(
            "stream type and stream id must not be empty".into(),
        ));
    }
    Ok(())
}

/// Events with `position > from_position`, ascending.
///
/// # Errors
///
/// Returns an error if the query fails or stored data is not valid JSON.
pub fn query_by_stream(
    conn: &Connection,
    stream_type: &str,
    stream_id: &str,
    from_position: Option<i64>,
) -> Result<Vec<Event>> {
    let mut stmt = conn.prepare(&format!(
        "SELECT {EVENT_COLUMNS} FROM events
         WHERE stream_type = ?1 AND stream_id = ?2 AND position > ?3
         ORDER BY position ASC"
    ))?;
    let rows = stmt.query_map(
        rusqlite::params![stream_type, stream_id, from_position.unwrap_or(0)],
        map_event,
    )?;
    rows.collect::<std::result::Result<Vec<_>, _>>()
        .map_err(Error::from)
}

/// The highest-position event in a stream.
///
/// # Errors
///
/// Returns an error if the query fails.
pub fn get_latest(conn: &Connection, stream_type: &str, stream_id: &str) -> Result<Option<Event>> {
    let event = conn
        .query_row(
            &format!(
                "SELECT {EVENT_COLUMNS} FROM events
                 WHERE stream_type = ?1 AND stream_id = ?2
                 ORDER BY position DESC LIMIT 1"
            ),
            rusqlite::params![stream_type, stream_id],
            map_event,
        )
        .optional()?;
    Ok(event)
}

/// Read a cursor position; 0 when the consumer has never advanced.
///
/// # Errors
///
/// Returns an error if the query fails.
pub fn cursor_get(conn: &Connection, consumer_id: &str, stream_id: &str) -> Result<i64> {
    let position: Option<i64> = conn
        .query_row(
            "SELECT position FROM cursors WHERE consumer_id = ?1 AND stream_id = ?2",
            rusqlite::params![consumer_id, stream_id],
            |row| row.get(0),
        )
        .optional()?;
    Ok(position.unwrap_or(0))
}

/// Advance a cursor.
///
/// Moving to a position at or below the current one is a no-op, so replays
/// are harmless. A cursor may not pass the highest position appended to any
/// stream with this id.
///
/// # Errors
///
/// Returns `CursorOutOfRange` past the head, `InvalidArgument` for a
/// negative position.
pub fn cursor_advance(
    conn: &Connection,
    consumer_id: &str,
    stream_id: &str,
    position: i64,
    now_ms: i64,
) -> Result<Cursor> {
    if position < 0 {
        return Err(Error::InvalidArgument(format!(
            "cursor position must be >= 0, got {position}"
        )));
    }

    let current = conn
        .query_row(
            "SELECT position, updated_at FROM cursors WHERE consumer_id = ?1 AND stream_id = ?2",
            rusqlite::params![consumer_id, stream_id],
            |row| Ok((row.get::<_, i64>(0)?, row.get::<_, i64>(1)?)),
        )
        .optional()?;

    if let Some((pos, updated_at)) = current {
        if position <= pos {
            return Ok(Cursor {
                consumer_id: consumer_id.to_string(),
                stream_id: stream_id.to_string(),
                position: pos,
                updated_at,
            });
        }
    }

    let head: i64 = conn.query_row(
        "SELECT COALESCE(MAX(position), 0) FROM events WHERE stream_id = ?1",
        [stream_id],
        |row| row.get(0),
    )?;
    if position > head {
        return Err(Error::CursorOutOfRange {
            consumer_id: consumer_id.to_string(),
            stream_id: stream_id.to_string(),
            position,
            head,
        });
    }

    conn.execute(
        "INSERT INTO cursors (consumer_id, stream_id, position, updated_at)
         VALUES (?1, ?2, ?3, ?4)
         ON CONFLICT(consumer_id, stream_id) DO UPDATE SET
           position = MAX(cursors.position, excluded.position),
           updated_at = excluded.updated_at",
        rusqlite::params![consumer_id, stream_id, position, now_ms],
    )?;

    Ok(Cursor {
        consumer_id: consumer_id.to_string(),
        stream_id: stream_id.to_string(),
        position,
        updated_at: now_ms,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::schema::apply_schema;
    use serde_json::json;

    fn conn() -> Connection {
        let conn = Connection::open_in_memory().unwrap();
        apply_schema(&conn).unwrap();
        conn
    }

    fn ev(kind: &str) -> NewEvent {
        NewEvent::new(kind, json!({"k": kind}))
    }

    #[test]
    fn test_positions_start_at_one_and_are_gapless() {
        let conn = conn();
        let first = append(&conn, "mission", "msn-1", &[ev("a"), ev("b")], 10).unwrap();
        let second = append(&conn, "mission", "msn-1", &[ev("c")], 20).unwrap();
        assert_eq!(first, vec![1, 2]);
        assert_eq!(second, vec![3]);

        // Independent stream starts over
        let other = append(&conn, "mailbox", "msn-1", &[ev("x")], 30).unwrap();
        assert_eq!(other, vec![1]);
    }

    #[test]
    fn test_query_from_position() {
        let conn = conn();
        append(&conn, "mission", "m", &[ev("a"), ev("b"), ev("c")], 1).unwrap();

        let all = query_by_stream(&conn, "mission", "m", None).unwrap();
        assert_eq!(all.iter().map(|e| e.position).collect::<Vec<_>>(), vec![1, 2, 3]);

        let tail = query_by_stream(&conn, "mission", "m", Some(1)).unwrap();
        assert_eq!(tail.len(), 2);
        assert_eq!(tail[0].event_type, "b");
        assert_eq!(tail[0].data, json!({"k": "b"}));
    }

    #[test]
    fn test_get_latest() {
        let conn = conn();
        assert!(get_latest(&conn, "mission", "m").unwrap().is_none());
        append(&conn, "mission", "m", &[ev("a"), ev("b")], 5).unwrap();
        let latest = get_latest(&conn, "mission", "m").unwrap().unwrap();
        assert_eq!(latest.position, 2);
        assert_eq!(latest.occurred_at, 5);
    }

    #[test]
    fn test_append_expecting_conflict() {
        let conn = conn();
        append(&conn, "mission", "m", &[ev("a")], 1).unwrap();

        let err = append_expecting(&conn, "mission", "m", 0, &[ev("b")], 2).unwrap_err();
        assert!(matches!(err, Error::StreamWriteConflict { expected: 0, actual: 1, .. }));

        let ok = append_expecting(&conn, "mission", "m", 1, &[ev("b")], 2).unwrap();
        assert_eq!(ok, vec![2]);
    }

    #[test]
    fn test_failed_batch_leaves_no_events() {
        let conn = conn();
        let batch = [ev("a"), ev("")];
        assert!(append(&conn, "mission", "m", &batch, 1).is_err());
        assert_eq!(stream_head(&conn, "mission", "m").unwrap(), 0);
    }

    #[test]
    fn test_cursor_is_monotone_and_bounded() {
        let conn = conn();
        assert_eq!(cursor_get(&conn, "agent-1", "m").unwrap(), 0);

        append(&conn, "mission", "m", &[ev("a"), ev("b"), ev("c")], 1).unwrap();

        cursor_advance(&conn, "agent-1", "m", 2, 10).unwrap();
        assert_eq!(cursor_get(&conn, "agent-1", "m").unwrap(), 2);

        // Replaying an older position is a no-op
        let c = cursor_advance(&conn, "agent-1", "m", 1, 11).unwrap();
        assert_eq!(c.position, 2);
        assert_eq!(cursor_get(&conn, "agent-1", "m").unwrap(), 2);

        let err = cursor_advance(&conn, "agent-1", "m", 4, 12).unwrap_err();
        assert!(matches!(err, Error::CursorOutOfRange { head: 3, .. }));
        assert_eq!(cursor_get(&conn, "agent-1", "m").unwrap(), 2);
    }
}
