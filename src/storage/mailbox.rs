//! Agent mailboxes on top of the event log.
//!
//! Each agent's inbox is the `("mailbox", agent_id)` stream. Message bodies
//! live in the `messages` table; the stream only carries references. The
//! agent's cursor on its own stream marks how far it has acknowledged.
//!
//! Acknowledgements are tracked per recipient in `message_deliveries`. A
//! message only counts as delivered once every recipient has acked it.

use crate::error::{Error, Result};
use crate::model::{Message, MessageSnapshot, SendMessage};
use crate::storage::events::{self, EventType, MAILBOX_STREAM};
use crate::storage::MutationContext;
use rusqlite::{Connection, OptionalExtension};
use serde_json::json;
use std::collections::HashSet;

const MESSAGE_COLUMNS: &str =
    "id, mission_id, from_agent, recipients, subject, body, sent_at, delivered, delivered_at";

const SELECT_COLUMNS: &str = "id, mission_id, from_agent, recipients, subject, body, sent_at, \
     delivered, delivered_at, \
     (SELECT json_group_array(d.agent_id) FROM message_deliveries d WHERE d.message_id = messages.id)";

fn map_message(row: &rusqlite::Row<'_>) -> rusqlite::Result<Message> {
    let to: String = row.get(3)?;
    let acked: String = row.get(9)?;
    let to: Vec<String> = super::json_col(3, &to)?;
    let acked: Vec<String> = super::json_col(9, &acked)?;
    let pending = to.iter().filter(|r| !acked.contains(r)).cloned().collect();
    Ok(Message {
        id: row.get(0)?,
        mission_id: row.get(1)?,
        from: row.get(2)?,
        to,
        subject: row.get(4)?,
        body: row.get(5)?,
        sent_at: row.get(6)?,
        delivered: row.get(7)?,
        delivered_at: row.get(8)?,
        pending,
    })
}

fn unique_recipients(to: &[String]) -> Vec<String> {
    let mut seen = HashSet::new();
    to.iter()
        .map(|r| r.trim().to_string())
        .filter(|r| !r.is_empty() && seen.insert(r.clone()))
        .collect()
}

/// Store a message and drop a reference into each recipient's mailbox.
///
/// # Errors
///
/// Returns `InvalidArgument` if sender, recipients, or subject are missing.
pub fn send(conn: &Connection, ctx: &mut MutationContext, msg: &SendMessage) -> Result<Message> {
    let to = unique_recipients(&msg.to);
    if msg.from.trim().is_empty() {
        return Err(Error::InvalidArgument("message sender must not be empty".into()));
    }
    if to.is_empty() {
        return Err(Error::InvalidArgument("message needs at least one recipient".into()));
    }
    if msg.subject.trim().is_empty() {
        return Err(Error::InvalidArgument("message subject must not be empty".into()));
    }

    let message = Message {
        id: format!("msg_{}", &uuid::Uuid::new_v4().to_string()[..12]),
        mission_id: msg.mission_id.clone(),
        from: msg.from.clone(),
        pending: to.clone(),
        to,
        subject: msg.subject.clone(),
        body: msg.body.clone(),
        sent_at: ctx.now_ms,
        delivered: false,
        delivered_at: None,
    };

    conn.execute(
        &format!("INSERT INTO messages ({MESSAGE_COLUMNS}) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, 0, NULL)"),
        rusqlite::params![
            message.id,
            message.mission_id,
            message.from,
            serde_json::to_string(&message.to)?,
            message.subject,
            message.body,
            message.sent_at,
        ],
    )?;

    for recipient in &message.to {
        ctx.record_event(
            MAILBOX_STREAM,
            recipient,
            EventType::MessageSent,
            json!({ "message_id": message.id, "from": message.from, "subject": message.subject }),
        );
    }

    Ok(message)
}

/// Get a message by ID.
///
/// # Errors
///
/// Returns an error if the query fails.
pub fn get_message(conn: &Connection, id: &str) -> Result<Option<Message>> {
    let message = conn
        .query_row(
            &format!("SELECT {SELECT_COLUMNS} FROM messages WHERE id = ?1"),
            [id],
            map_message,
        )
        .optional()?;
    Ok(message)
}

fn is_delivered_to(conn: &Connection, message_id: &str, agent_id: &str) -> Result<bool> {
    let found = conn
        .query_row(
            "SELECT 1 FROM message_deliveries WHERE message_id = ?1 AND agent_id = ?2",
            [message_id, agent_id],
            |_| Ok(()),
        )
        .optional()?;
    Ok(found.is_some())
}

/// Messages addressed to an agent that it has not acknowledged, in
/// mailbox order.
///
/// Only looks past the agent's cursor. A message that appears more than
/// once (sent, then requeued) is returned once.
///
/// # Errors
///
/// Returns an error if a query fails.
pub fn inbox(conn: &Connection, agent_id: &str) -> Result<Vec<Message>> {
    let cursor = events::cursor_get(conn, agent_id, agent_id)?;
    let mut seen = HashSet::new();
    let mut out = Vec::new();

    for event in events::query_by_stream(conn, MAILBOX_STREAM, agent_id, Some(cursor))? {
        let Some(message_id) = event.data.get("message_id").and_then(|v| v.as_str()) else {
            continue;
        };
        if !seen.insert(message_id.to_string()) {
            continue;
        }
        if let Some(message) = get_message(conn, message_id)? {
            if message.pending.iter().any(|r| r == agent_id) {
                out.push(message);
            }
        }
    }
    Ok(out)
}

/// Record that `agent_id` received a message and move its cursor over
/// every leading mailbox entry it has acknowledged.
///
/// The message itself flips to delivered once the last recipient acks.
///
/// # Errors
///
/// Returns `MessageNotFound` if the message does not exist or is not
/// addressed to `agent_id`.
pub fn ack(conn: &Connection, agent_id: &str, message_id: &str, now_ms: i64) -> Result<Message> {
    let message = get_message(conn, message_id)?
        .filter(|m| m.to.iter().any(|r| r == agent_id))
        .ok_or_else(|| Error::MessageNotFound {
            id: message_id.to_string(),
        })?;

    conn.execute(
        "INSERT OR IGNORE INTO message_deliveries (message_id, agent_id, delivered_at)
         VALUES (?1, ?2, ?3)",
        rusqlite::params![message_id, agent_id, now_ms],
    )?;
    let last = message.pending.iter().all(|r| r == agent_id);
    if last && !message.delivered {
        conn.execute(
            "UPDATE messages SET delivered = 1, delivered_at = ?2 WHERE id = ?1",
            rusqlite::params![message_id, now_ms],
        )?;
    }

    let cursor = events::cursor_get(conn, agent_id, agent_id)?;
    let mut advance_to = cursor;
    for event in events::query_by_stream(conn, MAILBOX_STREAM, agent_id, Some(cursor))? {
        let delivered = match event.data.get("message_id").and_then(|v| v.as_str()) {
            Some(id) => get_message(conn, id)?.is_none() || is_delivered_to(conn, id, agent_id)?,
            None => true,
        };
        if !delivered {
            break;
        }
        advance_to = event.position;
    }
    if advance_to > cursor {
        events::cursor_advance(conn, agent_id, agent_id, advance_to, now_ms)?;
    }

    get_message(conn, message_id)?.ok_or_else(|| Error::MessageNotFound {
        id: message_id.to_string(),
    })
}

/// Messages tagged with a mission that some recipient has not
/// acknowledged, oldest first.
///
/// # Errors
///
/// Returns an error if the query fails.
pub fn undelivered_for_mission(conn: &Connection, mission_id: &str) -> Result<Vec<Message>> {
    let mut stmt = conn.prepare(&format!(
        "SELECT {SELECT_COLUMNS} FROM messages
         WHERE mission_id = ?1 AND delivered = 0
         ORDER BY sent_at ASC, id ASC"
    ))?;
    let rows = stmt.query_map([mission_id], map_message)?;
    rows.collect::<std::result::Result<Vec<_>, _>>()
        .map_err(Error::from)
}

/// Put a snapshotted message back in the mailboxes of the recipients that
/// were still owed it.
///
/// Upserts the message with delivery reset and `sent_at` refreshed, clears
/// those recipients' acknowledgements, then appends a `message_requeued`
/// reference for each of them. A snapshot without `pending` targets every
/// recipient.
///
/// # Errors
///
/// Returns an error if the upsert fails.
pub fn requeue(conn: &Connection, ctx: &mut MutationContext, snap: &MessageSnapshot) -> Result<()> {
    let now = ctx.now_ms;
    conn.execute(
        &format!(
            "INSERT INTO messages ({MESSAGE_COLUMNS}) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, 0, NULL)
             ON CONFLICT(id) DO UPDATE SET delivered = 0, delivered_at = NULL, sent_at = excluded.sent_at"
        ),
        rusqlite::params![
            snap.id,
            snap.mission_id,
            snap.from,
            serde_json::to_string(&snap.to)?,
            snap.subject,
            snap.body,
            now,
        ],
    )?;

    let targets = if snap.pending.is_empty() {
        unique_recipients(&snap.to)
    } else {
        unique_recipients(&snap.pending)
    };
    for recipient in &targets {
        conn.execute(
            "DELETE FROM message_deliveries WHERE message_id = ?1 AND agent_id = ?2",
            rusqlite::params![snap.id, recipient],
        )?;
    }

    for recipient in targets {
        ctx.record_event(
            MAILBOX_STREAM,
            &recipient,
            EventType::MessageRequeued,
            json!({ "message_id": snap.id, "from": snap.from, "subject": snap.subject }),
        );
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::SqliteStorage;

    fn send_to(storage: &mut SqliteStorage, to: &[&str], subject: &str, at: i64) -> Message {
        let msg = SendMessage {
            mission_id: Some("msn-1".into()),
            from: "lead".into(),
            to: to.iter().map(|s| (*s).to_string()).collect(),
            subject: subject.into(),
            body: String::new(),
        };
        storage
            .mutate_at("send", "lead", at, |tx, ctx| send(tx, ctx, &msg))
            .unwrap()
    }

    #[test]
    fn test_send_and_inbox() {
        let mut storage = SqliteStorage::open_memory().unwrap();
        send_to(&mut storage, &["agent-a", "agent-b"], "hello", 1);
        send_to(&mut storage, &["agent-a"], "second", 2);

        let a = inbox(storage.conn(), "agent-a").unwrap();
        assert_eq!(
            a.iter().map(|m| m.subject.as_str()).collect::<Vec<_>>(),
            vec!["hello", "second"]
        );
        assert_eq!(inbox(storage.conn(), "agent-b").unwrap().len(), 1);
    }

    #[test]
    fn test_ack_advances_contiguous_prefix() {
        let mut storage = SqliteStorage::open_memory().unwrap();
        let first = send_to(&mut storage, &["agent-a"], "one", 1);
        let second = send_to(&mut storage, &["agent-a"], "two", 2);

        // Acking out of order leaves the cursor behind the gap
        ack(storage.conn(), "agent-a", &second.id, 3).unwrap();
        assert_eq!(events::cursor_get(storage.conn(), "agent-a", "agent-a").unwrap(), 0);
        assert_eq!(inbox(storage.conn(), "agent-a").unwrap().len(), 1);

        ack(storage.conn(), "agent-a", &first.id, 4).unwrap();
        assert_eq!(events::cursor_get(storage.conn(), "agent-a", "agent-a").unwrap(), 2);
        assert!(inbox(storage.conn(), "agent-a").unwrap().is_empty());
    }

    #[test]
    fn test_ack_rejects_non_recipient() {
        let mut storage = SqliteStorage::open_memory().unwrap();
        let msg = send_to(&mut storage, &["agent-a"], "one", 1);
        let err = ack(storage.conn(), "agent-z", &msg.id, 2).unwrap_err();
        assert!(matches!(err, Error::MessageNotFound { .. }));
    }

    #[test]
    fn test_requeue_resurfaces_delivered_message() {
        let mut storage = SqliteStorage::open_memory().unwrap();
        let msg = send_to(&mut storage, &["agent-a"], "one", 1);
        ack(storage.conn(), "agent-a", &msg.id, 2).unwrap();
        assert!(inbox(storage.conn(), "agent-a").unwrap().is_empty());

        let snap = MessageSnapshot::from(&msg);
        storage
            .mutate_at("requeue", "fleet", 10, |tx, ctx| requeue(tx, ctx, &snap))
            .unwrap();

        let again = inbox(storage.conn(), "agent-a").unwrap();
        assert_eq!(again.len(), 1);
        assert_eq!(again[0].sent_at, 10);
        assert!(!again[0].delivered);
    }

    #[test]
    fn test_ack_is_per_recipient() {
        let mut storage = SqliteStorage::open_memory().unwrap();
        let msg = send_to(&mut storage, &["agent-a", "agent-b"], "rebase", 1);

        let after_a = ack(storage.conn(), "agent-a", &msg.id, 2).unwrap();
        assert!(!after_a.delivered);
        assert_eq!(after_a.pending, vec!["agent-b".to_string()]);
        assert!(inbox(storage.conn(), "agent-a").unwrap().is_empty());
        assert_eq!(events::cursor_get(storage.conn(), "agent-a", "agent-a").unwrap(), 1);

        let b = inbox(storage.conn(), "agent-b").unwrap();
        assert_eq!(b.len(), 1);
        assert_eq!(b[0].id, msg.id);
        assert_eq!(undelivered_for_mission(storage.conn(), "msn-1").unwrap().len(), 1);

        let after_b = ack(storage.conn(), "agent-b", &msg.id, 3).unwrap();
        assert!(after_b.delivered);
        assert_eq!(after_b.delivered_at, Some(3));
        assert!(after_b.pending.is_empty());
        assert!(undelivered_for_mission(storage.conn(), "msn-1").unwrap().is_empty());
    }

    #[test]
    fn test_requeue_only_targets_pending_recipients() {
        let mut storage = SqliteStorage::open_memory().unwrap();
        let msg = send_to(&mut storage, &["agent-a", "agent-b"], "rebase", 1);
        ack(storage.conn(), "agent-a", &msg.id, 2).unwrap();

        let pending = undelivered_for_mission(storage.conn(), "msn-1").unwrap();
        let snap = MessageSnapshot::from(&pending[0]);
        assert_eq!(snap.pending, vec!["agent-b".to_string()]);

        ack(storage.conn(), "agent-b", &msg.id, 3).unwrap();
        storage
            .mutate_at("requeue", "fleet", 10, |tx, ctx| requeue(tx, ctx, &snap))
            .unwrap();

        assert!(inbox(storage.conn(), "agent-a").unwrap().is_empty());
        let b = inbox(storage.conn(), "agent-b").unwrap();
        assert_eq!(b.len(), 1);
        assert_eq!(b[0].pending, vec!["agent-b".to_string()]);
    }

    #[test]
    fn test_send_validation() {
        let mut storage = SqliteStorage::open_memory().unwrap();
        let msg = SendMessage {
            from: "lead".into(),
            to: vec![" ".into()],
            subject: "x".into(),
            ..SendMessage::default()
        };
        let err = storage
            .mutate_at("send", "lead", 1, |tx, ctx| send(tx, ctx, &msg))
            .unwrap_err();
        assert!(matches!(err, Error::InvalidArgument(_)));
    }
}
