//! ZooKeeper Backend
//!
//! A small asynchronous client for the ZooKeeper wire protocol, covering
//! the calls an election participant makes.

mod client;
pub mod proto;

pub use client::{ZkClient, ZkConnector};

/// Port assumed when an address omits one
pub const DEFAULT_PORT: u16 = 2181;
