//! Participant Status
//!
//! Observable state of an election participant, published on a watch
//! channel for embedders and operators.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Lifecycle of a participant
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ParticipantState {
    /// No session yet
    Unregistered,
    /// Session live, candidate node being created
    Registering,
    /// Lowest live candidate
    Leader,
    /// Any other live candidate
    Follower,
    /// Session ended
    Terminated,
}

impl std::fmt::Display for ParticipantState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ParticipantState::Unregistered => write!(f, "UNREGISTERED"),
            ParticipantState::Registering => write!(f, "REGISTERING"),
            ParticipantState::Leader => write!(f, "LEADER"),
            ParticipantState::Follower => write!(f, "FOLLOWER"),
            ParticipantState::Terminated => write!(f, "TERMINATED"),
        }
    }
}

/// The one watch a settled participant relies on
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum WatchBinding {
    /// Leader: any change to the root's children
    GroupMembership { root: String },
    /// Follower: deletion of the candidate just ahead
    Predecessor { path: String },
}

impl WatchBinding {
    /// Path the watch is registered on
    pub fn target(&self) -> &str {
        match self {
            WatchBinding::GroupMembership { root } => root,
            WatchBinding::Predecessor { path } => path,
        }
    }
}

/// Snapshot of a participant
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ElectionStatus {
    pub state: ParticipantState,
    /// Our candidate node, once registered
    pub node_path: Option<String>,
    /// Current leader as of the last resolution
    pub leader: Option<String>,
    pub watching: Option<WatchBinding>,
    /// Completed rank resolutions
    pub resolutions: u64,
    /// Last state transition
    pub changed_at: DateTime<Utc>,
}

impl Default for ElectionStatus {
    fn default() -> Self {
        Self {
            state: ParticipantState::Unregistered,
            node_path: None,
            leader: None,
            watching: None,
            resolutions: 0,
            changed_at: Utc::now(),
        }
    }
}

impl ElectionStatus {
    pub fn is_leader(&self) -> bool {
        self.state == ParticipantState::Leader
    }

    /// Leader or Follower with a live watch
    pub fn is_settled(&self) -> bool {
        matches!(
            self.state,
            ParticipantState::Leader | ParticipantState::Follower
        ) && self.watching.is_some()
    }

    /// Move to `state`, stamping the time only when it changes
    pub fn transition(&mut self, state: ParticipantState) -> bool {
        if self.state == state {
            return false;
        }
        self.state = state;
        self.changed_at = Utc::now();
        true
    }
}
