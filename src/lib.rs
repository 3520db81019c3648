//! Fleet - crash-safe coordination for multi-agent coding missions
//!
//! This crate provides the core functionality for the `fleet` CLI tool.
//!
//! # Architecture
//!
//! - [`storage`] - SQLite event log, cursors, locks, mailboxes, checkpoints
//! - [`checkpoint`] - Checkpoint save/prune plus the JSON mirror
//! - [`recovery`] - Stall detection, restore, recovery prompt
//! - [`dispatch`] - Capability-scored work assignment
//! - [`model`] - Data types (Mission, Sortie, Lock, Message, Checkpoint, Agent)
//! - [`cli`] - Command-line interface using clap
//! - [`config`] - Paths and environment settings
//! - [`error`] - Error types and handling

#![forbid(unsafe_code)]
#![warn(clippy::pedantic)]
#![allow(clippy::module_name_repetitions)]

pub mod checkpoint;
pub mod cli;
pub mod config;
pub mod dispatch;
pub mod error;
pub mod model;
pub mod recovery;
#[cfg(feature = "server")]
pub mod server;
pub mod storage;

pub use error::{Error, Result};
