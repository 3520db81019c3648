//! SQLite storage implementation.
//!
//! `SqliteStorage` owns one connection. Writes go through [`SqliteStorage::mutate`],
//! which opens an IMMEDIATE transaction, hands the closure a
//! [`MutationContext`] to record domain events into, appends those events,
//! and commits. Each process or thread opens its own `SqliteStorage` on the
//! shared file; SQLite's locking is the only serialization.

use crate::error::Result;
use crate::model::{AcquireOutcome, AcquireRequest, Lock};
use crate::storage::events::{self, Cursor, Event, EventType, NewEvent};
use crate::storage::locks;
use crate::storage::schema::apply_schema;
use rusqlite::{Connection, Transaction, TransactionBehavior};
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::{debug, warn};

/// Default busy timeout applied to every connection.
pub const DEFAULT_BUSY_TIMEOUT_MS: u64 = 5_000;

/// Attempts at taking the write lock before giving up.
const MAX_BUSY_ATTEMPTS: u32 = 8;

/// SQLite-based storage backend.
#[derive(Debug)]
pub struct SqliteStorage {
    conn: Connection,
    path: Option<PathBuf>,
}

#[derive(Debug, Clone)]
struct PendingEvent {
    stream_type: String,
    stream_id: String,
    event: NewEvent,
}

/// Context for a mutation, collecting the events it produces.
///
/// Events are appended in record order just before commit, all tagged
/// with the same correlation ID.
#[derive(Debug)]
pub struct MutationContext {
    /// Name of the operation being performed.
    pub op_name: String,
    /// Actor performing the operation (agent ID, user, etc.).
    pub actor: String,
    /// The instant this mutation happens at (Unix milliseconds).
    pub now_ms: i64,
    /// Shared by every event this mutation appends.
    pub correlation_id: String,
    events: Vec<PendingEvent>,
}

impl MutationContext {
    /// Create a new mutation context.
    #[must_use]
    pub fn new(op_name: &str, actor: &str, now_ms: i64) -> Self {
        Self {
            op_name: op_name.to_string(),
            actor: actor.to_string(),
            now_ms,
            correlation_id: format!("corr_{}", &uuid::Uuid::new_v4().to_string()[..12]),
            events: Vec::new(),
        }
    }

    /// Record a domain event for this operation.
    ///
    /// The actor is stamped into the payload when it is a JSON object.
    pub fn record_event(
        &mut self,
        stream_type: &str,
        stream_id: &str,
        event_type: EventType,
        mut data: serde_json::Value,
    ) {
        if let Some(obj) = data.as_object_mut() {
            obj.entry("actor")
                .or_insert_with(|| serde_json::Value::String(self.actor.clone()));
        }
        self.events.push(PendingEvent {
            stream_type: stream_type.to_string(),
            stream_id: stream_id.to_string(),
            event: NewEvent::new(event_type.as_str(), data)
                .with_correlation(self.correlation_id.clone()),
        });
    }

    /// Number of events waiting to be appended.
    #[must_use]
    pub fn pending_events(&self) -> usize {
        self.events.len()
    }

    fn flush(&mut self, conn: &Connection) -> Result<()> {
        for pending in self.events.drain(..) {
            events::append(
                conn,
                &pending.stream_type,
                &pending.stream_id,
                std::slice::from_ref(&pending.event),
                self.now_ms,
            )?;
        }
        Ok(())
    }
}

/// True when an error means another connection holds the write lock.
fn is_busy(err: &rusqlite::Error) -> bool {
    matches!(
        err,
        rusqlite::Error::SqliteFailure(e, _)
            if matches!(e.code, rusqlite::ErrorCode::DatabaseBusy | rusqlite::ErrorCode::DatabaseLocked)
    )
}

impl SqliteStorage {
    /// Open a database at the given path.
    ///
    /// Creates the database and applies schema if it doesn't exist.
    ///
    /// # Errors
    ///
    /// Returns an error if the connection cannot be established or schema fails.
    pub fn open(path: &Path) -> Result<Self> {
        Self::open_with_timeout(path, None)
    }

    /// Open a database with an optional busy timeout.
    ///
    /// # Errors
    ///
    /// Returns an error if the connection cannot be established or schema fails.
    pub fn open_with_timeout(path: &Path, timeout_ms: Option<u64>) -> Result<Self> {
        let conn = Connection::open(path)?;
        conn.busy_timeout(Duration::from_millis(
            timeout_ms.unwrap_or(DEFAULT_BUSY_TIMEOUT_MS),
        ))?;

        apply_schema(&conn)?;
        Ok(Self {
            conn,
            path: Some(path.to_path_buf()),
        })
    }

    /// Open an in-memory database (for testing).
    ///
    /// # Errors
    ///
    /// Returns an error if the connection cannot be established.
    pub fn open_memory() -> Result<Self> {
        let conn = Connection::open_in_memory()?;
        apply_schema(&conn)?;
        Ok(Self { conn, path: None })
    }

    /// Get a reference to the underlying connection (for read operations).
    #[must_use]
    pub fn conn(&self) -> &Connection {
        &self.conn
    }

    /// Path of the database file, `None` for in-memory databases.
    #[must_use]
    pub fn path(&self) -> Option<&Path> {
        self.path.as_deref()
    }

    /// Begin an IMMEDIATE transaction, retrying while another writer holds
    /// the lock. The busy timeout already waits inside each attempt.
    fn begin_immediate(&self) -> Result<Transaction<'_>> {
        let mut attempt = 1;
        loop {
            match Transaction::new_unchecked(&self.conn, TransactionBehavior::Immediate) {
                Ok(tx) => return Ok(tx),
                Err(e) if is_busy(&e) && attempt < MAX_BUSY_ATTEMPTS => {
                    let backoff = Duration::from_millis(u64::from(attempt) * 25);
                    warn!(attempt, ?backoff, "Database busy, retrying write");
                    std::thread::sleep(backoff);
                    attempt += 1;
                }
                Err(e) => return Err(e.into()),
            }
        }
    }

    /// Execute a mutation with the transaction protocol.
    ///
    /// This method:
    /// 1. Begins an IMMEDIATE transaction (retrying on BUSY)
    /// 2. Executes the mutation closure
    /// 3. Appends the recorded domain events
    /// 4. Commits (or rolls back on error)
    ///
    /// # Errors
    ///
    /// Returns an error if any step fails. The transaction is rolled back on error.
    pub fn mutate<F, R>(&mut self, op: &str, actor: &str, f: F) -> Result<R>
    where
        F: FnOnce(&Transaction, &mut MutationContext) -> Result<R>,
    {
        self.mutate_at(op, actor, chrono::Utc::now().timestamp_millis(), f)
    }

    /// [`Self::mutate`] at a fixed instant.
    ///
    /// # Errors
    ///
    /// Returns an error if any step fails. The transaction is rolled back on error.
    pub fn mutate_at<F, R>(&mut self, op: &str, actor: &str, now_ms: i64, f: F) -> Result<R>
    where
        F: FnOnce(&Transaction, &mut MutationContext) -> Result<R>,
    {
        let tx = self.begin_immediate()?;
        let mut ctx = MutationContext::new(op, actor, now_ms);

        // Dropping `tx` on the error path rolls back
        let result = f(&tx, &mut ctx)?;
        ctx.flush(&tx)?;
        tx.commit()?;

        debug!(op, actor, "Mutation committed");
        Ok(result)
    }

    /// Run a read-only closure inside a deferred transaction so every query
    /// sees the same snapshot. Always rolled back.
    ///
    /// # Errors
    ///
    /// Returns whatever the closure returns, or a database error.
    pub fn read<F, R>(&self, f: F) -> Result<R>
    where
        F: FnOnce(&Connection) -> Result<R>,
    {
        let tx = Transaction::new_unchecked(&self.conn, TransactionBehavior::Deferred)?;
        let result = f(&tx);
        tx.rollback()?;
        result
    }

    // ==================
    // Event Log
    // ==================

    /// Append events to a stream atomically.
    ///
    /// # Errors
    ///
    /// Returns `StreamWriteConflict` or a database error.
    pub fn append(
        &mut self,
        stream_type: &str,
        stream_id: &str,
        batch: &[NewEvent],
        now_ms: i64,
    ) -> Result<Vec<i64>> {
        self.mutate_at("append", "api", now_ms, |tx, _ctx| {
            events::append(tx, stream_type, stream_id, batch, now_ms)
        })
    }

    /// Append with an optimistic head check.
    ///
    /// # Errors
    ///
    /// Returns `StreamWriteConflict` when the head moved.
    pub fn append_expecting(
        &mut self,
        stream_type: &str,
        stream_id: &str,
        expected_head: i64,
        batch: &[NewEvent],
        now_ms: i64,
    ) -> Result<Vec<i64>> {
        self.mutate_at("append", "api", now_ms, |tx, _ctx| {
            events::append_expecting(tx, stream_type, stream_id, expected_head, batch, now_ms)
        })
    }

    /// Events after `from_position`, ascending.
    ///
    /// # Errors
    ///
    /// Returns an error if the query fails.
    pub fn query_by_stream(
        &self,
        stream_type: &str,
        stream_id: &str,
        from_position: Option<i64>,
    ) -> Result<Vec<Event>> {
        events::query_by_stream(&self.conn, stream_type, stream_id, from_position)
    }

    /// Newest event of a stream.
    ///
    /// # Errors
    ///
    /// Returns an error if the query fails.
    pub fn get_latest(&self, stream_type: &str, stream_id: &str) -> Result<Option<Event>> {
        events::get_latest(&self.conn, stream_type, stream_id)
    }

    /// Advance a consumer cursor.
    ///
    /// # Errors
    ///
    /// Returns `CursorOutOfRange` past the stream head.
    pub fn cursor_advance(
        &mut self,
        consumer_id: &str,
        stream_id: &str,
        position: i64,
        now_ms: i64,
    ) -> Result<Cursor> {
        self.mutate_at("cursor_advance", consumer_id, now_ms, |tx, _ctx| {
            events::cursor_advance(tx, consumer_id, stream_id, position, now_ms)
        })
    }

    /// Read a consumer cursor.
    ///
    /// # Errors
    ///
    /// Returns an error if the query fails.
    pub fn cursor_get(&self, consumer_id: &str, stream_id: &str) -> Result<i64> {
        events::cursor_get(&self.conn, consumer_id, stream_id)
    }

    // ==================
    // Locks
    // ==================

    /// Try to acquire a lock. Conflicts come back as data.
    ///
    /// # Errors
    ///
    /// Returns `InvalidArgument` for bad input, or a database error.
    pub fn acquire_lock(&mut self, req: &AcquireRequest, now_ms: i64) -> Result<AcquireOutcome> {
        self.mutate_at("lock_acquire", &req.holder_id, now_ms, |tx, _ctx| {
            locks::acquire(tx, req, now_ms)
        })
    }

    /// Release a held lock.
    ///
    /// # Errors
    ///
    /// Returns `LockNotFound` or `LockNotHeld`.
    pub fn release_lock(&mut self, lock_id: &str, holder_id: &str, now_ms: i64) -> Result<Lock> {
        self.mutate_at("lock_release", holder_id, now_ms, |tx, _ctx| {
            locks::release(tx, lock_id, holder_id, now_ms)
        })
    }

    /// Release a lock regardless of holder.
    ///
    /// # Errors
    ///
    /// Returns `LockNotFound`.
    pub fn force_release_lock(&mut self, lock_id: &str, actor: &str, now_ms: i64) -> Result<Lock> {
        self.mutate_at("lock_force_release", actor, now_ms, |tx, _ctx| {
            locks::force_release(tx, lock_id, now_ms)
        })
    }

    /// Live locks at `now_ms`.
    ///
    /// # Errors
    ///
    /// Returns an error if the query fails.
    pub fn active_locks(&self, now_ms: i64) -> Result<Vec<Lock>> {
        locks::get_active(&self.conn, now_ms)
    }

    /// Live lock on a resource.
    ///
    /// # Errors
    ///
    /// Returns an error if the query fails.
    pub fn lock_by_resource(&self, resource: &str, now_ms: i64) -> Result<Option<Lock>> {
        locks::get_by_resource(&self.conn, resource, now_ms)
    }
}
