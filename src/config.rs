//! WolfElect Configuration
//!
//! This module provides configuration structures for an election
//! participant and the coordination session it runs on.

use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;

/// Main WolfElect configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ElectConfig {
    /// Coordination session configuration
    #[serde(default)]
    pub session: SessionConfig,

    /// Election group configuration
    #[serde(default)]
    pub election: ElectionConfig,

    /// Logging configuration
    #[serde(default)]
    pub logging: LoggingConfig,
}

/// Coordination session configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionConfig {
    /// Comma separated list of `host[:port]` coordination servers
    #[serde(default = "default_address")]
    pub address: String,

    /// Session timeout in milliseconds, also bounds the initial liveness wait
    #[serde(default = "default_session_timeout_ms")]
    pub timeout_ms: u64,
}

/// Election group configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ElectionConfig {
    /// Durable root node all candidates register under
    #[serde(default = "default_root")]
    pub root: String,

    /// Name prefix of candidate nodes; the service appends the sequence
    #[serde(default = "default_node_prefix")]
    pub node_prefix: String,

    /// Payload written when the root node is first created
    #[serde(default = "default_root_payload")]
    pub root_payload: String,

    /// Status payload written by the leader onto its own node
    #[serde(default = "default_leader_payload")]
    pub leader_payload: String,

    /// Status payload written by followers onto their own nodes
    #[serde(default = "default_follower_payload")]
    pub follower_payload: String,

    /// Minimum backoff before retrying a failed resolution
    #[serde(default = "default_retry_backoff_min_ms")]
    pub retry_backoff_min_ms: u64,

    /// Maximum backoff before retrying a failed resolution
    #[serde(default = "default_retry_backoff_max_ms")]
    pub retry_backoff_max_ms: u64,
}

/// Logging configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    /// Log level (trace, debug, info, warn, error)
    #[serde(default = "default_log_level")]
    pub level: String,

    /// Log format (pretty, compact)
    #[serde(default = "default_log_format")]
    pub format: String,
}

// Default value functions
fn default_address() -> String {
    "localhost:2181".to_string()
}

fn default_session_timeout_ms() -> u64 {
    5000
}

fn default_root() -> String {
    "/ELECTION".to_string()
}

fn default_node_prefix() -> String {
    "NODE-".to_string()
}

fn default_root_payload() -> String {
    "This node is used for election.".to_string()
}

fn default_leader_payload() -> String {
    "LEADER".to_string()
}

fn default_follower_payload() -> String {
    "FOLLOWER".to_string()
}

fn default_retry_backoff_min_ms() -> u64 {
    100
}

fn default_retry_backoff_max_ms() -> u64 {
    2000
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_log_format() -> String {
    "pretty".to_string()
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            address: default_address(),
            timeout_ms: default_session_timeout_ms(),
        }
    }
}

impl Default for ElectionConfig {
    fn default() -> Self {
        Self {
            root: default_root(),
            node_prefix: default_node_prefix(),
            root_payload: default_root_payload(),
            leader_payload: default_leader_payload(),
            follower_payload: default_follower_payload(),
            retry_backoff_min_ms: default_retry_backoff_min_ms(),
            retry_backoff_max_ms: default_retry_backoff_max_ms(),
        }
    }
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            format: default_log_format(),
        }
    }
}

impl ElectionConfig {
    /// Path prefix passed to sequential creates, e.g. `/ELECTION/NODE-`
    pub fn candidate_prefix(&self) -> String {
        format!("{}/{}", self.root, self.node_prefix)
    }

    /// Full path of a child of the root
    pub fn child_path(&self, name: &str) -> String {
        format!("{}/{}", self.root, name)
    }

    /// Validate the election settings
    pub fn validate(&self) -> crate::Result<()> {
        if !self.root.starts_with('/') {
            return Err(crate::Error::Config("election.root must be an absolute path".into()));
        }

        if self.root == "/" || self.root.ends_with('/') {
            return Err(crate::Error::Config(
                "election.root must name a node below / without a trailing slash".into(),
            ));
        }

        if self.root.split('/').skip(1).any(str::is_empty) {
            return Err(crate::Error::Config(
                "election.root must not contain empty path segments".into(),
            ));
        }

        if self.node_prefix.is_empty() || self.node_prefix.contains('/') {
            return Err(crate::Error::Config(
                "election.node_prefix must be a non-empty name without '/'".into(),
            ));
        }

        if self.retry_backoff_min_ms > self.retry_backoff_max_ms {
            return Err(crate::Error::Config(
                "election.retry_backoff_min_ms exceeds retry_backoff_max_ms".into(),
            ));
        }

        Ok(())
    }
}

impl ElectConfig {
    /// Load configuration from a TOML file
    pub fn from_file(path: &std::path::Path) -> crate::Result<Self> {
        let content = std::fs::read_to_string(path)?;
        let config: ElectConfig = toml::from_str(&content)?;
        config.validate()?;
        Ok(config)
    }

    /// Load configuration from a TOML string
    pub fn from_str(content: &str) -> crate::Result<Self> {
        let config: ElectConfig = toml::from_str(content)?;
        config.validate()?;
        Ok(config)
    }

    /// Validate the configuration
    pub fn validate(&self) -> crate::Result<()> {
        if self.session.address.trim().is_empty() {
            return Err(crate::Error::Config("session.address cannot be empty".into()));
        }

        if self.session.timeout_ms == 0 {
            return Err(crate::Error::Config("session.timeout_ms must be positive".into()));
        }

        self.election.validate()
    }

    /// Get session timeout as Duration
    pub fn session_timeout(&self) -> Duration {
        Duration::from_millis(self.session.timeout_ms)
    }

    /// Get the retry backoff bounds as Durations
    pub fn retry_backoff(&self) -> (Duration, Duration) {
        (
            Duration::from_millis(self.election.retry_backoff_min_ms),
            Duration::from_millis(self.election.retry_backoff_max_ms),
        )
    }

    /// Default location of the configuration file
    pub fn default_path() -> PathBuf {
        PathBuf::from("wolfelect.toml")
    }
}
