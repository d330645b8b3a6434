//! Coordination Service Contract
//!
//! The election runs on top of a hierarchical coordination service with
//! ephemeral/sequential nodes and one-shot watches. This module defines the
//! operations the election needs from such a service, plus two backends:
//! a ZooKeeper wire client and an in-process ensemble.

pub mod memory;
pub mod zookeeper;

pub use memory::{MemoryEnsemble, MemorySession};
pub use zookeeper::{ZkClient, ZkConnector};

use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;

use crate::error::Result;

/// How a node is created
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum CreateMode {
    /// Survives the creating session
    Persistent,
    /// Removed when the creating session ends
    Ephemeral,
    /// Ephemeral, with a service-assigned sequence suffix
    EphemeralSequential,
}

impl CreateMode {
    /// Wire flag value
    pub fn flags(&self) -> i32 {
        match self {
            CreateMode::Persistent => 0,
            CreateMode::Ephemeral => 1,
            CreateMode::EphemeralSequential => 3,
        }
    }

    pub fn is_ephemeral(&self) -> bool {
        matches!(self, CreateMode::Ephemeral | CreateMode::EphemeralSequential)
    }

    pub fn is_sequential(&self) -> bool {
        matches!(self, CreateMode::EphemeralSequential)
    }
}

/// Access control entry
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Acl {
    pub perms: i32,
    pub scheme: String,
    pub id: String,
}

impl Acl {
    /// All permissions
    pub const PERM_ALL: i32 = 0x1f;

    /// Anyone may do anything
    pub fn open_unsafe() -> Vec<Acl> {
        vec![Acl {
            perms: Self::PERM_ALL,
            scheme: "world".to_string(),
            id: "anyone".to_string(),
        }]
    }
}

/// Node metadata
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Stat {
    pub czxid: i64,
    pub mzxid: i64,
    pub ctime: i64,
    pub mtime: i64,
    pub version: i32,
    pub cversion: i32,
    pub aversion: i32,
    pub ephemeral_owner: i64,
    pub data_length: i32,
    pub num_children: i32,
    pub pzxid: i64,
}

/// Kind of change a watch reports
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum EventType {
    /// Session state change, not tied to a node
    None,
    NodeCreated,
    NodeDeleted,
    NodeDataChanged,
    NodeChildrenChanged,
}

impl EventType {
    pub fn from_code(code: i32) -> Option<Self> {
        match code {
            -1 => Some(EventType::None),
            1 => Some(EventType::NodeCreated),
            2 => Some(EventType::NodeDeleted),
            3 => Some(EventType::NodeDataChanged),
            4 => Some(EventType::NodeChildrenChanged),
            _ => None,
        }
    }
}

/// Session connectivity state
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum SessionState {
    Disconnected,
    SyncConnected,
    AuthFailed,
    ConnectedReadOnly,
    Expired,
    Closed,
}

impl SessionState {
    pub fn from_code(code: i32) -> Option<Self> {
        match code {
            0 => Some(SessionState::Disconnected),
            3 => Some(SessionState::SyncConnected),
            4 => Some(SessionState::AuthFailed),
            5 => Some(SessionState::ConnectedReadOnly),
            -112 => Some(SessionState::Expired),
            7 => Some(SessionState::Closed),
            _ => None,
        }
    }
}

impl std::fmt::Display for SessionState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SessionState::Disconnected => write!(f, "DISCONNECTED"),
            SessionState::SyncConnected => write!(f, "SYNC_CONNECTED"),
            SessionState::AuthFailed => write!(f, "AUTH_FAILED"),
            SessionState::ConnectedReadOnly => write!(f, "CONNECTED_READ_ONLY"),
            SessionState::Expired => write!(f, "EXPIRED"),
            SessionState::Closed => write!(f, "CLOSED"),
        }
    }
}

/// A notification delivered to a watcher
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WatchedEvent {
    pub event_type: EventType,
    pub state: SessionState,
    /// Node path, `None` for session events
    pub path: Option<String>,
}

impl WatchedEvent {
    /// Session level event
    pub fn session(state: SessionState) -> Self {
        Self {
            event_type: EventType::None,
            state,
            path: None,
        }
    }

    /// Node level event on a live session
    pub fn node(event_type: EventType, path: impl Into<String>) -> Self {
        Self {
            event_type,
            state: SessionState::SyncConnected,
            path: Some(path.into()),
        }
    }
}

/// Receiving end of watch notifications.
///
/// Every watch registered with the same `Watcher` lands in one queue, so a
/// single consumer sees notifications in delivery order.
#[derive(Debug, Clone)]
pub struct Watcher {
    tx: mpsc::UnboundedSender<WatchedEvent>,
}

impl Watcher {
    /// Create a watcher and the queue it feeds
    pub fn channel() -> (Watcher, mpsc::UnboundedReceiver<WatchedEvent>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Watcher { tx }, rx)
    }

    /// Deliver an event; returns false if the consumer is gone
    pub fn notify(&self, event: WatchedEvent) -> bool {
        self.tx.send(event).is_ok()
    }

    /// Two watchers are the same if they feed the same queue
    pub fn same(&self, other: &Watcher) -> bool {
        self.tx.same_channel(&other.tx)
    }
}

/// Add `watcher` to `list` unless it is already registered
pub(crate) fn register_watcher(list: &mut Vec<Watcher>, watcher: Watcher) {
    if !list.iter().any(|w| w.same(&watcher)) {
        list.push(watcher);
    }
}

/// Operations on a live coordination session
#[async_trait]
pub trait Coordinator: Send + Sync {
    /// Service-assigned session identifier
    fn session_id(&self) -> i64;

    /// Create a node, returning the assigned path
    async fn create(&self, path: &str, data: &[u8], acl: &[Acl], mode: CreateMode) -> Result<String>;

    /// Delete a node, `None` matches any version
    async fn delete(&self, path: &str, version: Option<i32>) -> Result<()>;

    /// Stat a node, optionally leaving a one-shot watch on it. The watch is
    /// registered even when the node does not exist.
    async fn exists(&self, path: &str, watch: Option<Watcher>) -> Result<Option<Stat>>;

    /// List child names, optionally leaving a one-shot children watch
    async fn get_children(&self, path: &str, watch: Option<Watcher>) -> Result<Vec<String>>;

    /// Replace a node's payload, `None` matches any version
    async fn set_data(&self, path: &str, data: &[u8], version: Option<i32>) -> Result<Stat>;

    /// Close the session, removing its ephemeral nodes
    async fn close(&self) -> Result<()>;
}

/// Opens sessions against a coordination service
#[async_trait]
pub trait Connector: Send + Sync {
    type Session: Coordinator + 'static;

    /// Human readable description of where sessions are opened
    fn address(&self) -> String;

    /// Open a session. `watcher` becomes the session's default watcher and
    /// receives `SyncConnected` once the session is live.
    async fn connect(&self, timeout: Duration, watcher: Watcher) -> Result<Self::Session>;
}

/// Parent of a node path
pub(crate) fn parent_path(path: &str) -> &str {
    match path.rfind('/') {
        Some(0) | None => "/",
        Some(idx) => &path[..idx],
    }
}

/// Check that `path` is an absolute node path
pub(crate) fn validate_path(path: &str, sequential: bool) -> Result<()> {
    let bad = !path.starts_with('/')
        || (path.len() > 1 && path.ends_with('/') && !sequential)
        || path.contains("//")
        || path.split('/').any(|seg| seg == "." || seg == "..");
    if bad {
        return Err(crate::Error::Coordination {
            path: path.to_string(),
            code: -8,
        });
    }
    Ok(())
}
