//! Data models for Fleet.
//!
//! This module contains the domain models:
//! - Mission / Sortie
//! - Lock
//! - Message
//! - Checkpoint and its snapshots
//! - Agent

pub mod agent;
pub mod checkpoint;
pub mod lock;
pub mod message;
pub mod mission;

pub use agent::{Agent, AgentStatus, Priority};
pub use checkpoint::{
    Checkpoint, CheckpointInput, CheckpointQuery, CheckpointTrigger, LockSnapshot,
    MessageSnapshot, PruneOptions, RecoveryContext, SortieSnapshot,
};
pub use lock::{AcquireOutcome, AcquireRequest, Lock, ReleaseReason};
pub use message::{Message, SendMessage};
pub use mission::{Mission, MissionStatus, Sortie, SortieStatus, SortieUpdate};
