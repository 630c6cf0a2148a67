//! Peer position reconciliation.
//!
//! Several peers each hold a replica of this node's positions. They can lag,
//! fail or disagree; [`PositionReconciler`] polls them with retry and picks a
//! single canonical reply via [`replica::reconcile`].

pub mod reconciler;
pub mod replica;

pub use reconciler::{
    EligibilityPolicy, FetchOutcome, PositionReconciler, ReconcilerConfig, RefreshResult,
};
pub use replica::{reconcile, Reconciliation, ReplicaSet, ReplicaStats};
