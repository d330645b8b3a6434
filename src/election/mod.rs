//! Leader Election
//!
//! Participants register an ephemeral sequential node under a shared root.
//! The lowest node leads. Each follower watches only the node just ahead of
//! it, so a departure wakes one participant instead of the whole group.

pub mod participant;
pub mod rank;
pub mod status;

pub use participant::{ElectionParticipant, ParticipantHandle, Trigger};
pub use rank::{Rank, Ranking};
pub use status::{ElectionStatus, ParticipantState, WatchBinding};
