//! Checkpoint model and typed snapshot structs.
//!
//! A checkpoint is a point-in-time copy of a mission's state. Snapshots
//! are stored as JSON columns and validated here, at the serde boundary,
//! rather than trusted at every read site.

use crate::error::{Error, Result};
use crate::model::{Lock, Message, Sortie, SortieStatus};
use serde::{Deserialize, Serialize};
use std::str::FromStr;

/// What caused a checkpoint to be taken.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CheckpointTrigger {
    Progress,
    Error,
    #[default]
    Manual,
    Compaction,
}

impl CheckpointTrigger {
    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::Progress => "progress",
            Self::Error => "error",
            Self::Manual => "manual",
            Self::Compaction => "compaction",
        }
    }
}

impl FromStr for CheckpointTrigger {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_lowercase().as_str() {
            "progress" => Ok(Self::Progress),
            "error" => Ok(Self::Error),
            "manual" => Ok(Self::Manual),
            "compaction" => Ok(Self::Compaction),
            other => Err(Error::InvalidArgument(format!("unknown trigger '{other}'"))),
        }
    }
}

/// Sortie state as captured in a checkpoint.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SortieSnapshot {
    pub id: String,
    #[serde(default)]
    pub title: String,
    pub status: SortieStatus,
    #[serde(default)]
    pub assigned_to: Option<String>,
    #[serde(default)]
    pub files: Vec<String>,
    #[serde(default)]
    pub progress: u8,
    #[serde(default)]
    pub progress_notes: Option<String>,
}

impl From<&Sortie> for SortieSnapshot {
    fn from(s: &Sortie) -> Self {
        Self {
            id: s.id.clone(),
            title: s.title.clone(),
            status: s.status,
            assigned_to: s.assigned_to.clone(),
            files: s.files.clone(),
            progress: s.progress,
            progress_notes: s.progress_notes.clone(),
        }
    }
}

/// A held lock as captured in a checkpoint.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LockSnapshot {
    pub id: String,
    pub resource: String,
    pub holder_id: String,
    pub acquired_at: i64,
    pub timeout_ms: i64,
    #[serde(default)]
    pub purpose: Option<String>,
}

impl LockSnapshot {
    /// Time left before the original deadline; non-positive means expired.
    #[must_use]
    pub const fn remaining_ms(&self, now_ms: i64) -> i64 {
        self.acquired_at.saturating_add(self.timeout_ms) - now_ms
    }
}

impl From<&Lock> for LockSnapshot {
    fn from(l: &Lock) -> Self {
        Self {
            id: l.id.clone(),
            resource: l.resource.clone(),
            holder_id: l.holder_id.clone(),
            acquired_at: l.acquired_at,
            timeout_ms: l.timeout_ms,
            purpose: l.purpose.clone(),
        }
    }
}

/// A message as captured in a checkpoint.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MessageSnapshot {
    pub id: String,
    #[serde(default)]
    pub mission_id: Option<String>,
    pub from: String,
    pub to: Vec<String>,
    pub subject: String,
    #[serde(default)]
    pub body: String,
    pub sent_at: i64,
    #[serde(default)]
    pub delivered: bool,
    /// Recipients still owed the message. Empty means all of `to`.
    #[serde(default)]
    pub pending: Vec<String>,
}

impl From<&Message> for MessageSnapshot {
    fn from(m: &Message) -> Self {
        Self {
            id: m.id.clone(),
            mission_id: m.mission_id.clone(),
            from: m.from.clone(),
            to: m.to.clone(),
            subject: m.subject.clone(),
            body: m.body.clone(),
            sent_at: m.sent_at,
            delivered: m.delivered,
            pending: m.pending.clone(),
        }
    }
}

/// Human/LLM-readable summary bundled into a checkpoint to guide resumption.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RecoveryContext {
    pub last_action: String,
    pub next_steps: Vec<String>,
    pub blockers: Vec<String>,
    pub files_modified: Vec<String>,
    pub mission_summary: String,
    pub elapsed_time_ms: i64,
    pub last_activity_at: i64,
}

/// A stored checkpoint.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Checkpoint {
    /// Unique identifier (e.g. "ckpt_1a2b3c4d5e6f")
    pub id: String,
    pub mission_id: String,
    /// Creation timestamp (Unix milliseconds)
    pub timestamp: i64,
    pub trigger: CheckpointTrigger,
    pub trigger_details: Option<String>,
    pub progress_percent: u8,
    pub sorties: Vec<SortieSnapshot>,
    pub active_locks: Vec<LockSnapshot>,
    pub pending_messages: Vec<MessageSnapshot>,
    pub recovery_context: RecoveryContext,
    pub created_by: String,
    pub consumed_at: Option<i64>,
}

impl Checkpoint {
    #[must_use]
    pub const fn is_consumed(&self) -> bool {
        self.consumed_at.is_some()
    }
}

/// Caller-supplied part of a checkpoint. Everything else is captured from
/// live state at save time.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct CheckpointInput {
    pub mission_id: String,
    pub trigger: CheckpointTrigger,
    pub trigger_details: Option<String>,
    /// Overrides the sortie-derived percentage when set
    pub progress_percent: Option<i64>,
    pub last_action: Option<String>,
    pub next_steps: Vec<String>,
    pub blockers: Vec<String>,
    pub files_modified: Vec<String>,
    pub mission_summary: Option<String>,
    pub created_by: String,
}

/// Filter for `list`.
#[derive(Debug, Clone, Default)]
pub struct CheckpointQuery {
    pub mission_id: Option<String>,
    pub limit: Option<u32>,
}

/// Options for `find_prune_candidates`.
#[derive(Debug, Clone)]
pub struct PruneOptions {
    pub mission_id: Option<String>,
    pub older_than_days: u32,
    pub keep_per_mission: u32,
}

impl Default for PruneOptions {
    fn default() -> Self {
        Self {
            mission_id: None,
            older_than_days: 7,
            keep_per_mission: 3,
        }
    }
}
