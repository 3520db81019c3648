//! Error types for Fleet.
//!
//! Provides structured error handling with:
//! - Machine-readable error codes (`ErrorCode`)
//! - Category-based exit codes (2=db, 3=not_found, 4=validation, 5=conflict, ...)
//! - Retryability flags for agent self-correction
//! - Context-aware recovery hints
//! - Structured JSON output for piped / non-TTY consumers

use std::path::PathBuf;
use thiserror::Error;

/// Result type alias for Fleet operations.
pub type Result<T> = std::result::Result<T, Error>;

// ── Error Code ────────────────────────────────────────────────

/// Machine-readable error codes grouped by category.
///
/// Each code maps to a SCREAMING_SNAKE string and a category-based
/// exit code. Agents match on the string; shell scripts on the exit code.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorCode {
    // Database (exit 2)
    NotInitialized,
    AlreadyInitialized,
    DatabaseError,

    // Not Found (exit 3)
    MissionNotFound,
    SortieNotFound,
    CheckpointNotFound,
    LockNotFound,
    AgentNotFound,
    MessageNotFound,

    // Validation (exit 4)
    InvalidArgument,
    InvalidTransition,
    CursorOutOfRange,
    ConfirmationRequired,

    // Conflict (exit 5)
    StreamWriteConflict,
    LockConflict,
    LockNotHeld,
    NotAssigned,

    // Recovery (exit 6)
    TransactionRollback,
    MigrationFailure,

    // Config (exit 7)
    ConfigError,

    // I/O (exit 8)
    IoError,
    JsonError,

    // Internal (exit 1)
    InternalError,
}

impl ErrorCode {
    /// Machine-readable SCREAMING_SNAKE code string.
    #[must_use]
    pub const fn as_str(&self) -> &str {
        match self {
            Self::NotInitialized => "NOT_INITIALIZED",
            Self::AlreadyInitialized => "ALREADY_INITIALIZED",
            Self::DatabaseError => "DATABASE_ERROR",
            Self::MissionNotFound => "MISSION_NOT_FOUND",
            Self::SortieNotFound => "SORTIE_NOT_FOUND",
            Self::CheckpointNotFound => "CHECKPOINT_NOT_FOUND",
            Self::LockNotFound => "LOCK_NOT_FOUND",
            Self::AgentNotFound => "AGENT_NOT_FOUND",
            Self::MessageNotFound => "MESSAGE_NOT_FOUND",
            Self::InvalidArgument => "INVALID_ARGUMENT",
            Self::InvalidTransition => "INVALID_TRANSITION",
            Self::CursorOutOfRange => "CURSOR_OUT_OF_RANGE",
            Self::ConfirmationRequired => "CONFIRMATION_REQUIRED",
            Self::StreamWriteConflict => "STREAM_WRITE_CONFLICT",
            Self::LockConflict => "LOCK_CONFLICT",
            Self::LockNotHeld => "LOCK_NOT_HELD",
            Self::NotAssigned => "NOT_ASSIGNED",
            Self::TransactionRollback => "TRANSACTION_ROLLBACK",
            Self::MigrationFailure => "MIGRATION_FAILURE",
            Self::ConfigError => "CONFIG_ERROR",
            Self::IoError => "IO_ERROR",
            Self::JsonError => "JSON_ERROR",
            Self::InternalError => "INTERNAL_ERROR",
        }
    }

    /// Category-based exit code (1-8).
    #[must_use]
    pub const fn exit_code(&self) -> u8 {
        match self {
            Self::InternalError => 1,
            Self::NotInitialized | Self::AlreadyInitialized | Self::DatabaseError => 2,
            Self::MissionNotFound
            | Self::SortieNotFound
            | Self::CheckpointNotFound
            | Self::LockNotFound
            | Self::AgentNotFound
            | Self::MessageNotFound => 3,
            Self::InvalidArgument
            | Self::InvalidTransition
            | Self::CursorOutOfRange
            | Self::ConfirmationRequired => 4,
            Self::StreamWriteConflict
            | Self::LockConflict
            | Self::LockNotHeld
            | Self::NotAssigned => 5,
            Self::TransactionRollback | Self::MigrationFailure => 6,
            Self::ConfigError => 7,
            Self::IoError | Self::JsonError => 8,
        }
    }

    /// Whether a caller should retry (possibly after a backoff or corrected input).
    ///
    /// Stream write conflicts and held locks resolve themselves once the
    /// competing writer finishes or the lock expires.
    #[must_use]
    pub const fn is_retryable(&self) -> bool {
        matches!(
            self,
            Self::InvalidArgument
                | Self::CursorOutOfRange
                | Self::StreamWriteConflict
                | Self::LockConflict
                | Self::DatabaseError
                | Self::MigrationFailure
        )
    }
}

// ── Error Enum ────────────────────────────────────────────────

/// Errors that can occur in Fleet operations.
#[derive(Error, Debug)]
pub enum Error {
    #[error("Not initialized: run `fleet init` first")]
    NotInitialized,

    #[error("Already initialized at {path}")]
    AlreadyInitialized { path: PathBuf },

    #[error("Mission not found: {id}")]
    MissionNotFound { id: String },

    #[error("Sortie not found: {id}")]
    SortieNotFound { id: String },

    #[error("Checkpoint not found: {id}")]
    CheckpointNotFound { id: String },

    #[error("No usable checkpoint for mission: {mission_id}")]
    NoCheckpointForMission { mission_id: String },

    #[error("Lock not found: {id}")]
    LockNotFound { id: String },

    #[error("Agent not found: {id}")]
    AgentNotFound { id: String },

    #[error("Message not found: {id}")]
    MessageNotFound { id: String },

    #[error("Invalid transition for {entity}: {from} -> {to}")]
    InvalidTransition {
        entity: &'static str,
        from: String,
        to: String,
    },

    #[error("Cursor for {consumer_id} cannot move to {position}: stream {stream_id} ends at {head}")]
    CursorOutOfRange {
        consumer_id: String,
        stream_id: String,
        position: i64,
        head: i64,
    },

    #[error("Stream write conflict on {stream}: expected head {expected}, found {actual}")]
    StreamWriteConflict {
        stream: String,
        expected: i64,
        actual: i64,
    },

    #[error("Resource {resource} is locked by {holder_id} (lock {lock_id})")]
    LockConflict {
        resource: String,
        holder_id: String,
        lock_id: String,
    },

    #[error("Lock {lock_id} is held by {holder_id}, not {caller}")]
    LockNotHeld {
        lock_id: String,
        holder_id: String,
        caller: String,
    },

    #[error("Sortie {sortie_id} is not assigned to {agent_id}")]
    NotAssigned { sortie_id: String, agent_id: String },

    #[error("Confirmation required: {action}")]
    ConfirmationRequired { action: String },

    #[error("Transaction rolled back: {reason}")]
    TransactionRollback { reason: String },

    #[error("Migration failed for {source_path}: {reason}")]
    MigrationFailure { source_path: PathBuf, reason: String },

    #[error("Database error: {0}")]
    Database(#[from] rusqlite::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Invalid argument: {0}")]
    InvalidArgument(String),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("{0}")]
    Other(String),
}

impl Error {
    /// Map this error to its structured `ErrorCode`.
    #[must_use]
    pub const fn error_code(&self) -> ErrorCode {
        match self {
            Self::NotInitialized => ErrorCode::NotInitialized,
            Self::AlreadyInitialized { .. } => ErrorCode::AlreadyInitialized,
            Self::Database(_) => ErrorCode::DatabaseError,
            Self::MissionNotFound { .. } => ErrorCode::MissionNotFound,
            Self::SortieNotFound { .. } => ErrorCode::SortieNotFound,
            Self::CheckpointNotFound { .. } | Self::NoCheckpointForMission { .. } => {
                ErrorCode::CheckpointNotFound
            }
            Self::LockNotFound { .. } => ErrorCode::LockNotFound,
            Self::AgentNotFound { .. } => ErrorCode::AgentNotFound,
            Self::MessageNotFound { .. } => ErrorCode::MessageNotFound,
            Self::InvalidTransition { .. } => ErrorCode::InvalidTransition,
            Self::CursorOutOfRange { .. } => ErrorCode::CursorOutOfRange,
            Self::StreamWriteConflict { .. } => ErrorCode::StreamWriteConflict,
            Self::LockConflict { .. } => ErrorCode::LockConflict,
            Self::LockNotHeld { .. } => ErrorCode::LockNotHeld,
            Self::NotAssigned { .. } => ErrorCode::NotAssigned,
            Self::ConfirmationRequired { .. } => ErrorCode::ConfirmationRequired,
            Self::TransactionRollback { .. } => ErrorCode::TransactionRollback,
            Self::MigrationFailure { .. } => ErrorCode::MigrationFailure,
            Self::InvalidArgument(_) => ErrorCode::InvalidArgument,
            Self::Config(_) => ErrorCode::ConfigError,
            Self::Io(_) => ErrorCode::IoError,
            Self::Json(_) => ErrorCode::JsonError,
            Self::Other(_) => ErrorCode::InternalError,
        }
    }

    /// Category-based exit code, delegating to the `ErrorCode`.
    #[must_use]
    pub const fn exit_code(&self) -> u8 {
        self.error_code().exit_code()
    }

    /// True when SQLite reported the database as busy or locked.
    ///
    /// These are the only storage errors retried locally.
    #[must_use]
    pub fn is_busy(&self) -> bool {
        match self {
            Self::Database(rusqlite::Error::SqliteFailure(err, _)) => matches!(
                err.code,
                rusqlite::ErrorCode::DatabaseBusy | rusqlite::ErrorCode::DatabaseLocked
            ),
            _ => false,
        }
    }

    /// Context-aware recovery hint for agents and humans.
    ///
    /// Returns `None` if no actionable suggestion exists.
    #[must_use]
    pub fn hint(&self) -> Option<String> {
        match self {
            Self::NotInitialized => Some("Run `fleet init` to initialize the database".to_string()),

            Self::AlreadyInitialized { path } => Some(format!(
                "Database already exists at {}. Use `--force` to reinitialize.",
                path.display()
            )),

            Self::MissionNotFound { id } => Some(format!(
                "No mission with ID '{id}'. Use `fleet mission list` to see missions."
            )),

            Self::SortieNotFound { id } => Some(format!(
                "No sortie with ID '{id}'. Use `fleet sortie list --mission <id>` to see sorties."
            )),

            Self::CheckpointNotFound { id } => Some(format!(
                "No checkpoint with ID '{id}'. Use `fleet checkpoints list` to see available checkpoints."
            )),

            Self::NoCheckpointForMission { mission_id } => Some(format!(
                "Every checkpoint for '{mission_id}' is consumed or none exist.\n  \
                 Create one: fleet checkpoint --mission {mission_id}\n  \
                 Or resume a specific one: fleet resume --checkpoint <id>"
            )),

            Self::LockNotFound { id } => Some(format!(
                "No live lock with ID '{id}'. It may have expired or been released. \
                 Use `fleet lock list` to see active locks."
            )),

            Self::LockConflict { holder_id, .. } => Some(format!(
                "Wait for {holder_id} to release the lock or for it to expire, then retry."
            )),

            Self::LockNotHeld { .. } => Some(
                "Only the holder can release a lock. Administrators can use `fleet lock force-release`."
                    .to_string(),
            ),

            Self::NotAssigned { sortie_id, .. } => Some(format!(
                "Only the assigned agent may update a sortie. Check `fleet sortie list` for the assignee of {sortie_id}."
            )),

            Self::InvalidTransition { entity, .. } => Some(format!(
                "{entity} status only moves forward (pending → in_progress → review → completed) \
                 or to cancelled from a non-terminal state."
            )),

            Self::CursorOutOfRange { head, .. } => Some(format!(
                "A cursor can not pass the last appended position ({head})."
            )),

            Self::StreamWriteConflict { .. } => {
                Some("Another writer appended first. Re-read the stream head and retry.".to_string())
            }

            Self::ConfirmationRequired { .. } => {
                Some("Re-run with `-y` to confirm, or run interactively.".to_string())
            }

            Self::TransactionRollback { .. } => Some(
                "Nothing was changed. Inspect with `fleet resume --dry-run` before retrying."
                    .to_string(),
            ),

            Self::MigrationFailure { .. } => Some(
                "The original file was left untouched; the import is retried on next startup."
                    .to_string(),
            ),

            Self::InvalidArgument(msg) => {
                if msg.contains("status") {
                    Some(
                        "Mission statuses: pending, in_progress, review, completed, cancelled. \
                         Sortie statuses: pending, assigned, in_progress, blocked, review, completed, failed, cancelled"
                            .to_string(),
                    )
                } else if msg.contains("trigger") {
                    Some("Valid triggers: progress, error, manual, compaction".to_string())
                } else if msg.contains("priority") {
                    Some("Valid priorities: low, medium, high, critical".to_string())
                } else {
                    None
                }
            }

            Self::AgentNotFound { .. } => {
                Some("Use `fleet agent list` to see registered agents.".to_string())
            }

            Self::MessageNotFound { .. } => {
                Some("Use `fleet mail inbox --agent <id>` to see pending messages.".to_string())
            }

            Self::Database(_)
            | Self::Io(_)
            | Self::Json(_)
            | Self::Config(_)
            | Self::Other(_) => None,
        }
    }

    /// Structured JSON representation for machine consumption.
    ///
    /// Includes error code, message, retryability, exit code, and
    /// optional recovery hint. Agents parse this instead of stderr text.
    #[must_use]
    pub fn to_structured_json(&self) -> serde_json::Value {
        let code = self.error_code();
        let mut obj = serde_json::json!({
            "error": {
                "code": code.as_str(),
                "message": self.to_string(),
                "retryable": code.is_retryable(),
                "exit_code": code.exit_code(),
            }
        });

        if let Some(hint) = self.hint() {
            obj["error"]["hint"] = serde_json::Value::String(hint);
        }

        obj
    }
}
