//! SQLite storage layer for Fleet.
//!
//! This module provides the persistence layer using SQLite with:
//! - WAL mode so readers never wait on a writer
//! - IMMEDIATE transactions with bounded busy retry for writes
//! - Domain events appended in the same transaction as the change
//!
//! # Submodules
//!
//! - [`events`] - Event log and consumer cursors
//! - [`locks`] - Resource lock manager
//! - [`missions`] - Mission and sortie persistence
//! - [`mailbox`] - Agent mailboxes
//! - [`checkpoints`] - Checkpoint store
//! - [`agents`] - Agent registry for dispatch
//! - [`legacy`] - Import of pre-database JSON checkpoints
//! - [`schema`] / [`migrations`] - Database schema
//! - [`sqlite`] - Connection wrapper and transaction protocol

pub mod agents;
pub mod checkpoints;
pub mod events;
pub mod legacy;
pub mod locks;
pub mod mailbox;
pub mod migrations;
pub mod missions;
pub mod schema;
pub mod sqlite;

pub use sqlite::{MutationContext, SqliteStorage, DEFAULT_BUSY_TIMEOUT_MS};

use rusqlite::types::Type;
use serde::de::DeserializeOwned;
use std::str::FromStr;

/// Decode a JSON TEXT column.
pub(crate) fn json_col<T: DeserializeOwned>(idx: usize, raw: &str) -> rusqlite::Result<T> {
    serde_json::from_str(raw)
        .map_err(|e| rusqlite::Error::FromSqlConversionFailure(idx, Type::Text, Box::new(e)))
}

/// Parse an enum stored as TEXT.
pub(crate) fn parse_col<T>(idx: usize, raw: &str) -> rusqlite::Result<T>
where
    T: FromStr<Err = crate::error::Error>,
{
    raw.parse()
        .map_err(|e| rusqlite::Error::FromSqlConversionFailure(idx, Type::Text, Box::new(e)))
}
