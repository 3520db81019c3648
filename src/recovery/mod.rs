//! Crash recovery: finding stalled missions and resuming them from checkpoints.
//!
//! - [`detector`] - which in-progress missions have gone quiet
//! - [`restorer`] - transactional application of a checkpoint
//! - [`prompt`] - text handed to the agent that picks the mission back up

pub mod detector;
pub mod prompt;
pub mod restorer;

pub use detector::{
    check_for_recovery, detect_recovery_candidates, Detection, RecoveryCandidate, RecoveryCheck,
    StaleMission, DEFAULT_ACTIVITY_THRESHOLD_MS,
};
pub use prompt::format_recovery_prompt;
pub use restorer::{
    restore_from_checkpoint, restore_latest, RestoreOptions, RestoreResult, RestoredCounts,
};
