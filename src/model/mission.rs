//! Mission and sortie models.
//!
//! A mission is the top-level unit of work; sorties are the agent-sized
//! slices it is split into.

use crate::error::{Error, Result};
use serde::{Deserialize, Serialize};
use std::str::FromStr;

/// Mission status values.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MissionStatus {
    Pending,
    InProgress,
    Review,
    Completed,
    Cancelled,
}

impl MissionStatus {
    /// Get the string representation for storage.
    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::InProgress => "in_progress",
            Self::Review => "review",
            Self::Completed => "completed",
            Self::Cancelled => "cancelled",
        }
    }

    /// Terminal states accept no further transitions.
    #[must_use]
    pub const fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed | Self::Cancelled)
    }

    const fn rank(self) -> u8 {
        match self {
            Self::Pending => 0,
            Self::InProgress => 1,
            Self::Review => 2,
            Self::Completed => 3,
            Self::Cancelled => 4,
        }
    }

    /// Whether `self -> next` is allowed.
    ///
    /// Forward moves (including skips) are allowed along
    /// pending → in_progress → review → completed, and any non-terminal
    /// state may move to cancelled.
    #[must_use]
    pub fn can_transition_to(self, next: Self) -> bool {
        if self.is_terminal() {
            return false;
        }
        if next == Self::Cancelled {
            return true;
        }
        next.rank() > self.rank()
    }
}

impl FromStr for MissionStatus {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_lowercase().replace('-', "_").as_str() {
            "pending" => Ok(Self::Pending),
            "in_progress" | "active" => Ok(Self::InProgress),
            "review" => Ok(Self::Review),
            "completed" | "done" => Ok(Self::Completed),
            "cancelled" | "canceled" => Ok(Self::Cancelled),
            other => Err(Error::InvalidArgument(format!("unknown mission status '{other}'"))),
        }
    }
}

impl std::fmt::Display for MissionStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Sortie status values.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SortieStatus {
    Pending,
    Assigned,
    InProgress,
    Blocked,
    Review,
    Completed,
    Failed,
    Cancelled,
}

impl SortieStatus {
    /// Get the string representation for storage.
    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Assigned => "assigned",
            Self::InProgress => "in_progress",
            Self::Blocked => "blocked",
            Self::Review => "review",
            Self::Completed => "completed",
            Self::Failed => "failed",
            Self::Cancelled => "cancelled",
        }
    }

    /// Completed, failed or cancelled.
    #[must_use]
    pub const fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed | Self::Failed | Self::Cancelled)
    }
}

impl FromStr for SortieStatus {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_lowercase().replace('-', "_").as_str() {
            "pending" => Ok(Self::Pending),
            "assigned" => Ok(Self::Assigned),
            "in_progress" => Ok(Self::InProgress),
            "blocked" => Ok(Self::Blocked),
            "review" => Ok(Self::Review),
            "completed" | "done" => Ok(Self::Completed),
            "failed" => Ok(Self::Failed),
            "cancelled" | "canceled" => Ok(Self::Cancelled),
            other => Err(Error::InvalidArgument(format!("unknown sortie status '{other}'"))),
        }
    }
}

impl std::fmt::Display for SortieStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A mission.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Mission {
    /// Unique identifier (e.g. "msn_1a2b3c4d5e6f")
    pub id: String,
    pub title: String,
    pub description: Option<String>,
    pub status: MissionStatus,
    pub total_sorties: i64,
    pub completed_sorties: i64,
    /// Creation timestamp (Unix milliseconds)
    pub created_at: i64,
    /// Last update timestamp (Unix milliseconds)
    pub updated_at: i64,
    pub started_at: Option<i64>,
    pub completed_at: Option<i64>,
}

impl Mission {
    /// Completed share of sorties, floored, in `[0, 100]`.
    #[must_use]
    pub fn progress_percent(&self) -> u8 {
        percent(self.completed_sorties, self.total_sorties)
    }
}

/// `floor(100 * done / total)`, or 0 when there is nothing to do.
#[must_use]
pub fn percent(done: i64, total: i64) -> u8 {
    if total <= 0 {
        return 0;
    }
    let pct = (done.clamp(0, total) * 100) / total;
    u8::try_from(pct).unwrap_or(100)
}

/// A sortie: one agent-assignable slice of a mission.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Sortie {
    pub id: String,
    pub mission_id: String,
    pub title: String,
    pub status: SortieStatus,
    pub assigned_to: Option<String>,
    /// Files this sortie expects to touch
    pub files: Vec<String>,
    /// 0-100
    pub progress: u8,
    pub progress_notes: Option<String>,
    pub created_at: i64,
    pub updated_at: i64,
}

/// Fields an assigned agent may change on its sortie.
#[derive(Debug, Clone, Default)]
pub struct SortieUpdate {
    pub status: Option<SortieStatus>,
    pub progress: Option<u8>,
    pub notes: Option<String>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_mission_transitions() {
        use MissionStatus::*;
        assert!(Pending.can_transition_to(InProgress));
        assert!(Pending.can_transition_to(Completed));
        assert!(InProgress.can_transition_to(Cancelled));
        assert!(Review.can_transition_to(Completed));
        assert!(!Review.can_transition_to(InProgress));
        assert!(!InProgress.can_transition_to(InProgress));
        assert!(!Completed.can_transition_to(Cancelled));
        assert!(!Cancelled.can_transition_to(Pending));
    }

    #[test]
    fn test_status_parsing() {
        assert_eq!("in-progress".parse::<MissionStatus>().unwrap(), MissionStatus::InProgress);
        assert_eq!("Blocked".parse::<SortieStatus>().unwrap(), SortieStatus::Blocked);
        assert!("sideways".parse::<MissionStatus>().is_err());
    }

    #[test]
    fn test_percent_floors() {
        assert_eq!(percent(0, 0), 0);
        assert_eq!(percent(1, 3), 33);
        assert_eq!(percent(2, 3), 66);
        assert_eq!(percent(3, 3), 100);
    }
}
