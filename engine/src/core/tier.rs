//! Tier identifiers and the fixed dependency graph between tiers.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::error::StateParseError;

/// Capability tier `T0`..`T6`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub enum TierId {
    T0,
    T1,
    T2,
    T3,
    T4,
    T5,
    T6,
}

impl TierId {
    pub const ALL: [TierId; 7] = [
        TierId::T0,
        TierId::T1,
        TierId::T2,
        TierId::T3,
        TierId::T4,
        TierId::T5,
        TierId::T6,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            TierId::T0 => "T0",
            TierId::T1 => "T1",
            TierId::T2 => "T2",
            TierId::T3 => "T3",
            TierId::T4 => "T4",
            TierId::T5 => "T5",
            TierId::T6 => "T6",
        }
    }

    /// Tiers whose best selection this tier inherits, in merge order.
    pub fn dependencies(self) -> &'static [TierId] {
        match self {
            TierId::T5 => &[TierId::T0, TierId::T1, TierId::T2, TierId::T3, TierId::T4],
            TierId::T6 => &[TierId::T5],
            _ => &[],
        }
    }

    /// Depth in the dependency graph.
    fn rank(self) -> u8 {
        match self {
            TierId::T5 => 1,
            TierId::T6 => 2,
            _ => 0,
        }
    }
}

impl fmt::Display for TierId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for TierId {
    type Err = StateParseError;

    fn from_str(token: &str) -> Result<Self, Self::Err> {
        TierId::ALL
            .iter()
            .copied()
            .find(|tier| tier.as_str().eq_ignore_ascii_case(token.trim()))
            .ok_or_else(|| StateParseError::new("tier id", token))
    }
}

impl TryFrom<String> for TierId {
    type Error = StateParseError;

    fn try_from(token: String) -> Result<Self, Self::Error> {
        token.parse()
    }
}

impl From<TierId> for String {
    fn from(tier: TierId) -> String {
        tier.as_str().to_string()
    }
}

/// Topological execution order for the requested tiers (duplicates removed).
pub fn execution_order(tiers: &[TierId]) -> Vec<TierId> {
    let mut ordered: Vec<TierId> = tiers.to_vec();
    ordered.sort_by_key(|tier| (tier.rank(), *tier));
    ordered.dedup();
    ordered
}

/// Union of `existing` and `requested`, preserving the existing order and
/// appending new tiers in request order.
pub fn union_tiers(existing: &[TierId], requested: &[TierId]) -> Vec<TierId> {
    let mut merged = existing.to_vec();
    for tier in requested {
        if !merged.contains(tier) {
            merged.push(*tier);
        }
    }
    merged
}
