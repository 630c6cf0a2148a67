use sha2::{Digest, Sha256};

use crate::types::{order_count, total_abs_leverage, Identity, PositionRecord};

#[derive(Debug, Clone)]
struct Replica {
    identity: Identity,
    trust: f64,
    positions: Vec<PositionRecord>,
}

/// Successful replies from one polling call, keyed by peer.
///
/// Iteration follows the canonical peer order fixed at construction (the
/// order peers were selected from the registry), never arrival order.
#[derive(Debug, Clone, Default)]
pub struct ReplicaSet {
    order: Vec<Identity>,
    slots: Vec<Option<Replica>>,
}

impl ReplicaSet {
    pub fn with_order<I>(order: I) -> Self
    where
        I: IntoIterator<Item = Identity>,
    {
        let mut seen = Vec::new();
        for id in order {
            if !seen.contains(&id) {
                seen.push(id);
            }
        }
        let slots = vec![None; seen.len()];
        Self { order: seen, slots }
    }

    /// Record a peer's reply. The first successful reply wins; identities
    /// outside the canonical order are ignored.
    pub fn record(&mut self, identity: &Identity, trust: f64, positions: Vec<PositionRecord>) -> bool {
        let Some(i) = self.order.iter().position(|id| id == identity) else {
            return false;
        };
        if self.slots[i].is_some() {
            return false;
        }
        self.slots[i] = Some(Replica {
            identity: identity.clone(),
            trust,
            positions,
        });
        true
    }

    pub fn contains(&self, identity: &Identity) -> bool {
        self.iter().any(|r| &r.identity == identity)
    }

    pub fn len(&self) -> usize {
        self.slots.iter().filter(|s| s.is_some()).count()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Peers that answered, in canonical order.
    pub fn acked(&self) -> Vec<Identity> {
        self.iter().map(|r| r.identity.clone()).collect()
    }

    pub fn positions(&self, identity: &Identity) -> Option<&[PositionRecord]> {
        self.iter()
            .find(|r| &r.identity == identity)
            .map(|r| r.positions.as_slice())
    }

    fn iter(&self) -> impl Iterator<Item = &Replica> {
        self.slots.iter().flatten()
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct ReplicaStats {
    pub identity: Identity,
    pub trust: f64,
    pub order_count: usize,
    pub total_abs_leverage: f64,
    pub fingerprint: String,
}

#[derive(Debug, Clone, Default)]
pub struct Reconciliation {
    pub canonical: Vec<PositionRecord>,
    pub source: Option<Identity>,
    pub stats: Vec<ReplicaStats>,
    /// Replying peers disagree on total order count.
    pub desynced: bool,
    pub high_leverage: Vec<Identity>,
}

impl Reconciliation {
    pub fn source_stats(&self) -> Option<&ReplicaStats> {
        let source = self.source.as_ref()?;
        self.stats.iter().find(|s| &s.identity == source)
    }
}

/// Short content hash of a reply, for telling replicas apart in diagnostics.
pub fn fingerprint(positions: &[PositionRecord]) -> String {
    let bytes = serde_json::to_vec(positions).unwrap_or_default();
    let digest = Sha256::digest(&bytes);
    hex::encode(&digest[..6])
}

/// Pick the canonical reply: the peer with the strictly greatest total order
/// count, ties going to the earliest peer in canonical order. A reply set in
/// which nobody reports any order yields an empty canonical list.
pub fn reconcile(replicas: &ReplicaSet, high_leverage_threshold: f64) -> Reconciliation {
    let mut out = Reconciliation::default();
    let mut max_orders = 0usize;
    let mut best: Option<&Replica> = None;

    for replica in replicas.iter() {
        let stats = ReplicaStats {
            identity: replica.identity.clone(),
            trust: replica.trust,
            order_count: order_count(&replica.positions),
            total_abs_leverage: total_abs_leverage(&replica.positions),
            fingerprint: fingerprint(&replica.positions),
        };
        if stats.total_abs_leverage >= high_leverage_threshold {
            out.high_leverage.push(replica.identity.clone());
        }
        if stats.order_count > max_orders {
            max_orders = stats.order_count;
            best = Some(replica);
        }
        out.stats.push(stats);
    }

    if let Some(first) = out.stats.first() {
        out.desynced = out.stats.iter().any(|s| s.order_count != first.order_count);
    }
    if let Some(b) = best {
        out.canonical = b.positions.clone();
        out.source = Some(b.identity.clone());
    }
    out
}
