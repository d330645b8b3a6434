//! WolfElect Error Types

use thiserror::Error;

/// Result type alias for WolfElect operations
pub type Result<T> = std::result::Result<T, Error>;

/// WolfElect error types
#[derive(Error, Debug)]
pub enum Error {
    // Configuration errors
    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Invalid configuration file: {0}")]
    ConfigParse(#[from] toml::de::Error),

    // Connection errors
    #[error("Connection failed to {address}: {reason}")]
    ConnectionFailed { address: String, reason: String },

    #[error("Connection timeout to {0}")]
    ConnectionTimeout(String),

    #[error("Connection to {0} lost")]
    ConnectionLost(String),

    // Session errors
    #[error("Session expired")]
    SessionExpired,

    #[error("Session closed")]
    SessionClosed,

    #[error("Authentication failed")]
    AuthFailed,

    #[error("Protocol error: {0}")]
    Protocol(String),

    // Node errors reported by the coordination service
    #[error("Node does not exist: {0}")]
    NoNode(String),

    #[error("Node already exists: {0}")]
    NodeExists(String),

    #[error("Not authorized to access {0}")]
    NoAuth(String),

    #[error("Version mismatch on {0}")]
    BadVersion(String),

    #[error("Node has children: {0}")]
    NotEmpty(String),

    #[error("Ephemeral node cannot have children: {0}")]
    NoChildrenForEphemerals(String),

    #[error("Coordination error {code} on {path}")]
    Coordination { path: String, code: i32 },

    // Election errors
    #[error("Candidate node {0} is no longer registered")]
    SelfNodeMissing(String),

    #[error("Registration failed: {0}")]
    Registration(String),

    // I/O errors
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    // Internal errors
    #[error("Internal error: {0}")]
    Internal(String),
}

/// Broad classification of errors, used to decide how the election reacts
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    /// Bad or unreadable configuration
    Configuration,
    /// The session cannot be established or has ended
    Connection,
    /// The root or candidate node could not be created
    Registration,
    /// Our own candidate node vanished from the group
    SelfNodeMissing,
    /// Anything that may succeed when tried again
    Transient,
}

/// What the election worker does after a failed resolution
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Recovery {
    /// Stop the participant and surface the error
    Fatal,
    /// Create a fresh candidate node and resolve again
    Reregister,
    /// Back off, then resolve again
    Retry,
}

impl Error {
    /// Map a coordination service error code onto an error for `path`
    pub fn from_code(code: i32, path: &str) -> Self {
        let path = path.to_string();
        match code {
            -4 => Error::ConnectionLost(path),
            -101 => Error::NoNode(path),
            -102 => Error::NoAuth(path),
            -103 => Error::BadVersion(path),
            -108 => Error::NoChildrenForEphemerals(path),
            -110 => Error::NodeExists(path),
            -111 => Error::NotEmpty(path),
            -112 => Error::SessionExpired,
            -115 => Error::AuthFailed,
            code => Error::Coordination { path, code },
        }
    }

    /// Classify this error
    pub fn kind(&self) -> ErrorKind {
        match self {
            Error::Config(_) | Error::ConfigParse(_) => ErrorKind::Configuration,
            Error::ConnectionFailed { .. }
            | Error::ConnectionTimeout(_)
            | Error::SessionExpired
            | Error::SessionClosed
            | Error::AuthFailed
            | Error::Io(_) => ErrorKind::Connection,
            Error::NoAuth(_)
            | Error::NoChildrenForEphemerals(_)
            | Error::Registration(_) => ErrorKind::Registration,
            Error::SelfNodeMissing(_) => ErrorKind::SelfNodeMissing,
            // The session outlives a dropped socket; the request is retried
            // once the client has reattached
            Error::ConnectionLost(_)
            | Error::Protocol(_)
            | Error::NoNode(_)
            | Error::NodeExists(_)
            | Error::BadVersion(_)
            | Error::NotEmpty(_)
            | Error::Coordination { .. }
            | Error::Internal(_) => ErrorKind::Transient,
        }
    }

    /// Recovery policy for an error raised while resolving rank
    pub fn recovery(&self) -> Recovery {
        match self.kind() {
            ErrorKind::Configuration | ErrorKind::Connection | ErrorKind::Registration => {
                Recovery::Fatal
            }
            ErrorKind::SelfNodeMissing => Recovery::Reregister,
            ErrorKind::Transient => Recovery::Retry,
        }
    }
}
