//! Resource lock model.

use crate::error::{Error, Result};
use serde::{Deserialize, Serialize};
use std::str::FromStr;

/// Why a lock stopped being live.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ReleaseReason {
    /// Released by its holder
    Released,
    /// Timed out; closed lazily by a later acquire
    Expired,
    /// Force-released by an administrator or recovery
    Forced,
    /// Replaced by a fresh lock for the same holder
    Renewed,
}

impl ReleaseReason {
    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::Released => "released",
            Self::Expired => "expired",
            Self::Forced => "forced",
            Self::Renewed => "renewed",
        }
    }
}

impl FromStr for ReleaseReason {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "released" => Ok(Self::Released),
            "expired" => Ok(Self::Expired),
            "forced" => Ok(Self::Forced),
            "renewed" => Ok(Self::Renewed),
            other => Err(Error::InvalidArgument(format!("unknown release reason '{other}'"))),
        }
    }
}

/// An exclusive, time-bounded reservation on a resource.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Lock {
    pub id: String,
    /// Usually a file path
    pub resource: String,
    pub holder_id: String,
    pub acquired_at: i64,
    pub timeout_ms: i64,
    pub purpose: Option<String>,
    pub released_at: Option<i64>,
    pub release_reason: Option<ReleaseReason>,
}

impl Lock {
    /// Instant at which the lock stops being valid.
    #[must_use]
    pub const fn expires_at(&self) -> i64 {
        self.acquired_at.saturating_add(self.timeout_ms)
    }

    /// A lock is live while unreleased and `now < acquired_at + timeout_ms`.
    #[must_use]
    pub const fn is_live_at(&self, now_ms: i64) -> bool {
        self.released_at.is_none() && now_ms < self.expires_at()
    }
}

/// Input to `acquire`.
#[derive(Debug, Clone)]
pub struct AcquireRequest {
    pub resource: String,
    pub holder_id: String,
    pub timeout_ms: i64,
    pub purpose: Option<String>,
}

impl AcquireRequest {
    #[must_use]
    pub fn new(resource: impl Into<String>, holder_id: impl Into<String>, timeout_ms: i64) -> Self {
        Self {
            resource: resource.into(),
            holder_id: holder_id.into(),
            timeout_ms,
            purpose: None,
        }
    }

    #[must_use]
    pub fn with_purpose(mut self, purpose: impl Into<String>) -> Self {
        self.purpose = Some(purpose.into());
        self
    }
}

/// Result of an acquire attempt. A conflict is data, not an error.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AcquireOutcome {
    pub granted: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub lock: Option<Lock>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub conflict: Option<Lock>,
}

impl AcquireOutcome {
    #[must_use]
    pub const fn granted(lock: Lock) -> Self {
        Self {
            granted: true,
            lock: Some(lock),
            conflict: None,
        }
    }

    #[must_use]
    pub const fn denied(conflict: Lock) -> Self {
        Self {
            granted: false,
            lock: None,
            conflict: Some(conflict),
        }
    }

    /// Convert a denial into `Error::LockConflict` for shells that need one.
    ///
    /// # Errors
    ///
    /// Returns `LockConflict` when the lock was not granted.
    pub fn into_result(self) -> Result<Lock> {
        match (self.lock, self.conflict) {
            (Some(lock), _) => Ok(lock),
            (None, Some(held)) => Err(Error::LockConflict {
                resource: held.resource,
                holder_id: held.holder_id,
                lock_id: held.id,
            }),
            (None, None) => Err(Error::Other("acquire returned neither lock nor conflict".into())),
        }
    }
}
