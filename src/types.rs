//! Positions, orders and participant identities as reported by peers.

use std::fmt;

use serde::{Deserialize, Serialize};

/// Stable key for a network participant (typically a public key).
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Identity(String);

impl Identity {
    pub fn new(s: impl Into<String>) -> Self {
        Self(s.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for Identity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for Identity {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

impl From<String> for Identity {
    fn from(s: String) -> Self {
        Self(s)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OrderSide {
    Long,
    Short,
    Flat,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OrderRecord {
    pub side: OrderSide,
    pub size: f64,
    pub price: f64,
    pub processed_ms: u64,
}

/// One position as held by a replying peer. The reconciler never mutates these;
/// it only selects a whole peer's list.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PositionRecord {
    pub identity_owner: Identity,
    pub symbol: String,
    pub net_leverage: f64,
    #[serde(default)]
    pub orders: Vec<OrderRecord>,
    pub is_open: bool,
    pub open_ms: u64,
    #[serde(default)]
    pub close_ms: Option<u64>,
}

impl PositionRecord {
    pub fn order_count(&self) -> usize {
        self.orders.len()
    }

    /// Closed positions order by close time; open ones sort last.
    pub fn close_sort_key(&self) -> u64 {
        match (self.is_open, self.close_ms) {
            (false, Some(ms)) => ms,
            _ => u64::MAX,
        }
    }
}

/// Total order count across a reply; the primary reconciliation signal.
pub fn order_count(positions: &[PositionRecord]) -> usize {
    positions.iter().map(PositionRecord::order_count).sum()
}

pub fn total_abs_leverage(positions: &[PositionRecord]) -> f64 {
    positions.iter().map(|p| p.net_leverage.abs()).sum()
}
