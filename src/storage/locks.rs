//! Resource lock manager.
//!
//! At most one unreleased lock row exists per resource (partial unique
//! index). Expiry is lazy: a timed-out lock stays unreleased until the next
//! `acquire` on its resource closes it with reason `expired`.

use crate::error::{Error, Result};
use crate::model::{AcquireOutcome, AcquireRequest, Lock, ReleaseReason};
use rusqlite::{Connection, OptionalExtension};
use tracing::{debug, info};

const LOCK_COLUMNS: &str =
    "id, resource, holder_id, acquired_at, timeout_ms, purpose, released_at, release_reason";

fn map_lock(row: &rusqlite::Row<'_>) -> rusqlite::Result<Lock> {
    let reason: Option<String> = row.get(7)?;
    Ok(Lock {
        id: row.get(0)?,
        resource: row.get(1)?,
        holder_id: row.get(2)?,
        acquired_at: row.get(3)?,
        timeout_ms: row.get(4)?,
        purpose: row.get(5)?,
        released_at: row.get(6)?,
        release_reason: reason
            .map(|r| super::parse_col(7, &r))
            .transpose()?,
    })
}

fn unreleased_for(conn: &Connection, resource: &str) -> Result<Option<Lock>> {
    let lock = conn
        .query_row(
            &format!("SELECT {LOCK_COLUMNS} FROM locks WHERE resource = ?1 AND released_at IS NULL"),
            [resource],
            map_lock,
        )
        .optional()?;
    Ok(lock)
}

fn close(conn: &Connection, lock_id: &str, at: i64, reason: ReleaseReason) -> Result<()> {
    conn.execute(
        "UPDATE locks SET released_at = ?2, release_reason = ?3
         WHERE id = ?1 AND released_at IS NULL",
        rusqlite::params![lock_id, at, reason.as_str()],
    )?;
    Ok(())
}

/// Try to take an exclusive lock on a resource.
///
/// Never blocks. A live lock held by someone else comes back as
/// `granted: false` with the conflicting lock attached. A live lock held by
/// the same holder is renewed. Run inside an IMMEDIATE transaction so the
/// existence check and the insert are serialized.
///
/// # Errors
///
/// Returns `InvalidArgument` for an empty resource/holder or a
/// non-positive timeout, or a database error.
pub fn acquire(conn: &Connection, req: &AcquireRequest, now_ms: i64) -> Result<AcquireOutcome> {
    if req.resource.trim().is_empty() {
        return Err(Error::InvalidArgument("lock resource must not be empty".into()));
    }
    if req.holder_id.trim().is_empty() {
        return Err(Error::InvalidArgument("lock holder must not be empty".into()));
    }
    if req.timeout_ms <= 0 {
        return Err(Error::InvalidArgument(format!(
            "lock timeout must be > 0 ms, got {}",
            req.timeout_ms
        )));
    }

    if let Some(existing) = unreleased_for(conn, &req.resource)? {
        if !existing.is_live_at(now_ms) {
            debug!(lock_id = %existing.id, resource = %existing.resource, "Closing expired lock");
            close(conn, &existing.id, existing.expires_at(), ReleaseReason::Expired)?;
        } else if existing.holder_id == req.holder_id {
            close(conn, &existing.id, now_ms, ReleaseReason::Renewed)?;
        } else {
            return Ok(AcquireOutcome::denied(existing));
        }
    }

    let lock = Lock {
        id: format!("lock_{}", &uuid::Uuid::new_v4().to_string()[..12]),
        resource: req.resource.clone(),
        holder_id: req.holder_id.clone(),
        acquired_at: now_ms,
        timeout_ms: req.timeout_ms,
        purpose: req.purpose.clone(),
        released_at: None,
        release_reason: None,
    };

    let inserted = conn.execute(
        "INSERT INTO locks (id, resource, holder_id, acquired_at, timeout_ms, purpose)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
        rusqlite::params![
            lock.id,
            lock.resource,
            lock.holder_id,
            lock.acquired_at,
            lock.timeout_ms,
            lock.purpose
        ],
    );

    match inserted {
        Ok(_) => Ok(AcquireOutcome::granted(lock)),
        // Another writer won the race outside an IMMEDIATE transaction
        Err(rusqlite::Error::SqliteFailure(e, _))
            if e.code == rusqlite::ErrorCode::ConstraintViolation =>
        {
            match unreleased_for(conn, &req.resource)? {
                Some(winner) => Ok(AcquireOutcome::denied(winner)),
                None => Err(Error::Other(format!(
                    "lock insert for {} conflicted but no holder was found",
                    req.resource
                ))),
            }
        }
        Err(e) => Err(e.into()),
    }
}

/// Release a lock. Only its holder may do this.
///
/// # Errors
///
/// Returns `LockNotFound` if there is no unreleased lock with this id, or
/// `LockNotHeld` if `holder_id` does not hold it.
pub fn release(conn: &Connection, lock_id: &str, holder_id: &str, now_ms: i64) -> Result<Lock> {
    let mut lock = get_unreleased(conn, lock_id)?;
    if lock.holder_id != holder_id {
        return Err(Error::LockNotHeld {
            lock_id: lock_id.to_string(),
            holder_id: lock.holder_id,
            caller: holder_id.to_string(),
        });
    }
    close(conn, lock_id, now_ms, ReleaseReason::Released)?;
    lock.released_at = Some(now_ms);
    lock.release_reason = Some(ReleaseReason::Released);
    Ok(lock)
}

/// Release a lock regardless of holder. Administrative and recovery use only.
///
/// # Errors
///
/// Returns `LockNotFound` if there is no unreleased lock with this id.
pub fn force_release(conn: &Connection, lock_id: &str, now_ms: i64) -> Result<Lock> {
    let mut lock = get_unreleased(conn, lock_id)?;
    close(conn, lock_id, now_ms, ReleaseReason::Forced)?;
    info!(lock_id, resource = %lock.resource, holder = %lock.holder_id, "Force-released lock");
    lock.released_at = Some(now_ms);
    lock.release_reason = Some(ReleaseReason::Forced);
    Ok(lock)
}

fn get_unreleased(conn: &Connection, lock_id: &str) -> Result<Lock> {
    conn.query_row(
        &format!("SELECT {LOCK_COLUMNS} FROM locks WHERE id = ?1 AND released_at IS NULL"),
        [lock_id],
        map_lock,
    )
    .optional()?
    .ok_or_else(|| Error::LockNotFound {
        id: lock_id.to_string(),
    })
}

/// Get a lock by ID in any state.
///
/// # Errors
///
/// Returns an error if the query fails.
pub fn get(conn: &Connection, lock_id: &str) -> Result<Option<Lock>> {
    let lock = conn
        .query_row(
            &format!("SELECT {LOCK_COLUMNS} FROM locks WHERE id = ?1"),
            [lock_id],
            map_lock,
        )
        .optional()?;
    Ok(lock)
}

/// All live locks at `now_ms`, oldest first.
///
/// # Errors
///
/// Returns an error if the query fails.
pub fn get_active(conn: &Connection, now_ms: i64) -> Result<Vec<Lock>> {
    let mut stmt = conn.prepare(&format!(
        "SELECT {LOCK_COLUMNS} FROM locks
         WHERE released_at IS NULL AND acquired_at + timeout_ms > ?1
         ORDER BY acquired_at ASC, id ASC"
    ))?;
    let rows = stmt.query_map([now_ms], map_lock)?;
    rows.collect::<std::result::Result<Vec<_>, _>>()
        .map_err(Error::from)
}

/// The live lock on a resource, if any.
///
/// # Errors
///
/// Returns an error if the query fails.
pub fn get_by_resource(conn: &Connection, resource: &str, now_ms: i64) -> Result<Option<Lock>> {
    Ok(unreleased_for(conn, resource)?.filter(|l| l.is_live_at(now_ms)))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::schema::apply_schema;

    const T: i64 = 1_700_000_000_000;

    fn conn() -> Connection {
        let conn = Connection::open_in_memory().unwrap();
        apply_schema(&conn).unwrap();
        conn
    }

    #[test]
    fn test_conflict_then_expiry() {
        let conn = conn();
        let first = acquire(&conn, &AcquireRequest::new("file.ts", "agent-a", 1_000), T).unwrap();
        assert!(first.granted);

        let denied = acquire(&conn, &AcquireRequest::new("file.ts", "agent-b", 1_000), T + 500).unwrap();
        assert!(!denied.granted);
        assert_eq!(denied.conflict.unwrap().holder_id, "agent-a");

        let granted = acquire(&conn, &AcquireRequest::new("file.ts", "agent-b", 1_000), T + 1_500).unwrap();
        assert!(granted.granted);

        let old = get(&conn, &first.lock.unwrap().id).unwrap().unwrap();
        assert_eq!(old.release_reason, Some(ReleaseReason::Expired));
        assert_eq!(old.released_at, Some(T + 1_000));
    }

    #[test]
    fn test_expiry_boundary_is_exclusive() {
        let conn = conn();
        acquire(&conn, &AcquireRequest::new("a.rs", "agent-a", 1_000), T).unwrap();
        // now == acquired_at + timeout: no longer valid
        let outcome = acquire(&conn, &AcquireRequest::new("a.rs", "agent-b", 1_000), T + 1_000).unwrap();
        assert!(outcome.granted);
    }

    #[test]
    fn test_same_holder_renews() {
        let conn = conn();
        let first = acquire(&conn, &AcquireRequest::new("a.rs", "agent-a", 1_000), T).unwrap();
        let second = acquire(&conn, &AcquireRequest::new("a.rs", "agent-a", 5_000), T + 100).unwrap();
        assert!(second.granted);
        let renewed = second.lock.unwrap();
        assert_eq!(renewed.timeout_ms, 5_000);

        let old = get(&conn, &first.lock.unwrap().id).unwrap().unwrap();
        assert_eq!(old.release_reason, Some(ReleaseReason::Renewed));
        assert_eq!(get_active(&conn, T + 200).unwrap().len(), 1);
    }

    #[test]
    fn test_release_requires_holder() {
        let conn = conn();
        let lock = acquire(&conn, &AcquireRequest::new("a.rs", "agent-a", 1_000), T)
            .unwrap()
            .lock
            .unwrap();

        let err = release(&conn, &lock.id, "agent-b", T + 1).unwrap_err();
        assert!(matches!(err, Error::LockNotHeld { .. }));

        release(&conn, &lock.id, "agent-a", T + 2).unwrap();
        let err = release(&conn, &lock.id, "agent-a", T + 3).unwrap_err();
        assert!(matches!(err, Error::LockNotFound { .. }));
        assert!(get_by_resource(&conn, "a.rs", T + 4).unwrap().is_none());
    }

    #[test]
    fn test_force_release_bypasses_holder() {
        let conn = conn();
        let lock = acquire(&conn, &AcquireRequest::new("a.rs", "agent-a", 1_000), T)
            .unwrap()
            .lock
            .unwrap();
        let forced = force_release(&conn, &lock.id, T + 10).unwrap();
        assert_eq!(forced.release_reason, Some(ReleaseReason::Forced));
        assert!(acquire(&conn, &AcquireRequest::new("a.rs", "agent-b", 1_000), T + 11)
            .unwrap()
            .granted);
    }

    #[test]
    fn test_validation() {
        let conn = conn();
        assert!(acquire(&conn, &AcquireRequest::new("", "a", 10), T).is_err());
        assert!(acquire(&conn, &AcquireRequest::new("x", " ", 10), T).is_err());
        assert!(acquire(&conn, &AcquireRequest::new("x", "a", 0), T).is_err());
    }

    #[test]
    fn test_active_excludes_expired() {
        let conn = conn();
        acquire(&conn, &AcquireRequest::new("a.rs", "agent-a", 100), T).unwrap();
        acquire(&conn, &AcquireRequest::new("b.rs", "agent-a", 10_000), T).unwrap();
        let active = get_active(&conn, T + 500).unwrap();
        assert_eq!(active.len(), 1);
        assert_eq!(active[0].resource, "b.rs");
        assert!(get_by_resource(&conn, "a.rs", T + 500).unwrap().is_none());
    }
}
