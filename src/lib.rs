//! WolfElect - Leader Election on a Coordination Service
//!
//! A group of equivalent processes agrees on exactly one leader without a
//! dedicated master. All consensus, durability and notification guarantees
//! come from an external ZooKeeper-style coordination service; this crate
//! supplies the election algorithm on top of it.
//!
//! # Architecture
//!
//! Each participant registers an ephemeral sequential candidate node under
//! a shared root. The candidate with the lowest sequence suffix leads and
//! watches the whole group. Every other candidate watches only the node
//! immediately ahead of it, so a departure wakes a single successor.
//!
//! # Features
//!
//! - Asynchronous ZooKeeper client speaking the jute wire protocol
//! - In-process ensemble for tests and simulation
//! - Watch chaining with one watch per participant
//! - Automatic re-registration when a candidate node disappears
//! - Status reporting over a watch channel

pub mod config;
pub mod coordination;
pub mod election;
pub mod error;

pub use config::ElectConfig;
pub use error::{Error, Result};

/// Re-export commonly used types
pub mod prelude {
    pub use crate::config::{ElectConfig, ElectionConfig};
    pub use crate::coordination::{Connector, Coordinator, MemoryEnsemble, ZkConnector};
    pub use crate::election::{
        ElectionParticipant, ElectionStatus, ParticipantHandle, ParticipantState, WatchBinding,
    };
    pub use crate::error::{Error, Result};
}
