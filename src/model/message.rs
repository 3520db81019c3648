//! Mailbox message model.

use serde::{Deserialize, Serialize};

/// A message between agents.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Message {
    pub id: String,
    /// Mission the message belongs to, if any
    pub mission_id: Option<String>,
    pub from: String,
    pub to: Vec<String>,
    pub subject: String,
    pub body: String,
    pub sent_at: i64,
    /// Set once every recipient has acknowledged
    pub delivered: bool,
    pub delivered_at: Option<i64>,
    /// Recipients that have not acknowledged yet
    #[serde(default)]
    pub pending: Vec<String>,
}

/// Input to `send`.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SendMessage {
    #[serde(default)]
    pub mission_id: Option<String>,
    pub from: String,
    pub to: Vec<String>,
    pub subject: String,
    #[serde(default)]
    pub body: String,
}
