//! Rank Resolution
//!
//! Ordering rules for the election group. The lowest live candidate leads;
//! everyone else follows the candidate immediately ahead of it.

use crate::config::ElectionConfig;
use crate::error::{Error, Result};

/// Width of the sequence suffix the service appends to candidate names
const SEQUENCE_WIDTH: usize = 10;

/// Where a candidate stands in the group
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Rank {
    /// Lowest live candidate
    Leader,
    /// Any other candidate, with the full path of the one just ahead
    Follower { predecessor: String },
}

/// Outcome of ranking one listing of the root
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Ranking {
    pub rank: Rank,
    /// Full path of the current leader
    pub leader: String,
    /// Zero-based position of our node
    pub position: usize,
    /// Number of live candidates
    pub group_size: usize,
}

/// Sequence suffix of a candidate name or path, kept as an opaque token
fn sequence_suffix(name: &str) -> Option<&str> {
    let split = name.len().checked_sub(SEQUENCE_WIDTH)?;
    let suffix = name.get(split..)?;
    suffix.bytes().all(|b| b.is_ascii_digit()).then_some(suffix)
}

/// Keep only our candidates and put them in creation order.
///
/// A candidate is the node prefix followed by exactly one sequence suffix.
/// Suffixes are fixed width and zero padded, so plain byte order of names
/// sharing one prefix is creation order.
pub fn sort_candidates(config: &ElectionConfig, children: Vec<String>) -> Vec<String> {
    let mut candidates: Vec<String> = children
        .into_iter()
        .filter(|name| {
            name.strip_prefix(config.node_prefix.as_str())
                .map_or(false, |rest| sequence_suffix(rest) == Some(rest))
        })
        .collect();
    candidates.sort_unstable();
    candidates
}

/// Rank `own_path` within a listing of the election root
pub fn rank(config: &ElectionConfig, children: Vec<String>, own_path: &str) -> Result<Ranking> {
    let sorted = sort_candidates(config, children);

    let position = sorted
        .iter()
        .position(|name| config.child_path(name) == own_path)
        .ok_or_else(|| Error::SelfNodeMissing(own_path.to_string()))?;

    let rank = match position {
        0 => Rank::Leader,
        i => Rank::Follower {
            predecessor: config.child_path(&sorted[i - 1]),
        },
    };

    Ok(Ranking {
        rank,
        leader: config.child_path(&sorted[0]),
        position,
        group_size: sorted.len(),
    })
}
