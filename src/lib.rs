//! Position recovery and membership-filtered risk state for a trading network node.

pub mod cache;
pub mod config;
pub mod error;
pub mod logging;
pub mod peer;
pub mod reconcile;
pub mod registry;
pub mod risk;
pub mod store;
pub mod types;
