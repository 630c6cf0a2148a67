use std::sync::Arc;
use std::time::Duration;

use serde_json::{json, Value};
use tokio::sync::watch;
use tokio::time::{sleep, Instant};

use crate::logging::{obj, v_num, v_str, Domain, Level, Logger};
use crate::peer::retry::RetryConfig;
use crate::peer::{query_all, PeerClient, PeerFailure, PeerRef, PeerReply, PositionsRequest};
use crate::registry::{RegistrySnapshot, RegistrySource};
use crate::types::{Identity, PositionRecord};

use super::replica::{reconcile, ReplicaSet};

/// Which registry members get queried.
#[derive(Debug, Clone, Default)]
pub struct EligibilityPolicy {
    /// Members must have trust strictly above this.
    pub min_trust: f64,
    /// Query every member with a routable address, regardless of trust (testnet).
    pub open_access: bool,
    /// This node's own identity; never queried.
    pub self_identity: Option<Identity>,
}

impl EligibilityPolicy {
    /// Eligible peers in registry order.
    pub fn select(&self, snapshot: &RegistrySnapshot) -> Vec<PeerRef> {
        snapshot
            .entries()
            .iter()
            .filter(|m| self.self_identity.as_ref() != Some(&m.identity))
            .filter(|m| self.open_access || m.trust > self.min_trust)
            .filter_map(|m| {
                let address = m.address.as_ref().filter(|a| a.is_routable())?;
                Some(PeerRef {
                    identity: m.identity.clone(),
                    address: address.clone(),
                    trust: m.trust,
                })
            })
            .collect()
    }
}

#[derive(Debug, Clone)]
pub struct ReconcilerConfig {
    pub retry: RetryConfig,
    pub refresh_interval: Duration,
    pub peer_timeout: Duration,
    pub high_trust_threshold: f64,
    pub high_leverage_threshold: f64,
    pub eligibility: EligibilityPolicy,
}

impl Default for ReconcilerConfig {
    fn default() -> Self {
        Self {
            retry: RetryConfig::default(),
            refresh_interval: Duration::from_secs(5 * 60),
            peer_timeout: Duration::from_secs(12),
            high_trust_threshold: 0.5,
            high_leverage_threshold: 10.0,
            eligibility: EligibilityPolicy::default(),
        }
    }
}

/// Result of one polling call.
#[derive(Debug, Clone, Default)]
pub struct FetchOutcome {
    pub canonical: Vec<PositionRecord>,
    /// Peer whose reply was selected.
    pub source: Option<Identity>,
    /// Peers that answered, in canonical order.
    pub acked_peers: Vec<Identity>,
    pub attempts: u32,
    /// Backoff sleeps actually taken, in order.
    pub delays: Vec<Duration>,
    pub desynced: bool,
}

impl FetchOutcome {
    pub fn open_positions(&self) -> Vec<&PositionRecord> {
        self.canonical.iter().filter(|p| p.is_open).collect()
    }

    /// Closed positions by close time, then open positions in reply order.
    pub fn sorted_by_close(&self) -> Vec<PositionRecord> {
        let mut out = self.canonical.clone();
        out.sort_by_key(PositionRecord::close_sort_key);
        out
    }
}

#[derive(Debug, Clone)]
pub enum RefreshResult {
    Refreshed(Arc<FetchOutcome>),
    /// Inside the refresh interval; carries the last computed outcome, if any.
    Skipped(Option<Arc<FetchOutcome>>),
}

impl RefreshResult {
    pub fn outcome(&self) -> Option<&Arc<FetchOutcome>> {
        match self {
            RefreshResult::Refreshed(o) => Some(o),
            RefreshResult::Skipped(o) => o.as_ref(),
        }
    }
}

/// Recovers this node's positions by polling peers and reconciling their
/// replies into one canonical list.
pub struct PositionReconciler {
    client: Arc<dyn PeerClient>,
    registry: Arc<dyn RegistrySource>,
    cfg: ReconcilerConfig,
    request: PositionsRequest,
    logger: Logger,
    last_refresh: Option<Instant>,
    last_outcome: Option<Arc<FetchOutcome>>,
}

impl PositionReconciler {
    pub fn new(
        client: Arc<dyn PeerClient>,
        registry: Arc<dyn RegistrySource>,
        cfg: ReconcilerConfig,
        logger: Logger,
    ) -> Self {
        let request = PositionsRequest {
            requester: cfg.eligibility.self_identity.clone(),
        };
        Self {
            client,
            registry,
            cfg,
            request,
            logger,
            last_refresh: None,
            last_outcome: None,
        }
    }

    pub fn config(&self) -> &ReconcilerConfig {
        &self.cfg
    }

    /// Re-evaluated against the current registry snapshot on every call.
    pub fn get_queryable_peers(&self) -> Vec<PeerRef> {
        let snapshot = self.registry.snapshot();
        self.cfg.eligibility.select(&snapshot)
    }

    /// Poll `peers` with retry/backoff and reconcile the replies. Peer failures
    /// are absorbed; if nobody answers the canonical list is empty.
    pub async fn fetch_canonical_positions(&self, peers: &[PeerRef]) -> FetchOutcome {
        let mut replicas = ReplicaSet::with_order(peers.iter().map(|p| p.identity.clone()));
        let mut remaining: Vec<PeerRef> = Vec::with_capacity(peers.len());
        for p in peers {
            if !remaining.iter().any(|r| r.identity == p.identity) {
                remaining.push(p.clone());
            }
        }

        let max_attempts = self.cfg.retry.max_attempts.max(1);
        let mut attempts = 0u32;
        let mut delays = Vec::new();

        while attempts < max_attempts && !remaining.is_empty() {
            if let Some(delay) = self.cfg.retry.delay_before(attempts) {
                sleep(delay).await;
                delays.push(delay);
            }

            let outcomes = query_all(
                self.client.as_ref(),
                &remaining,
                &self.request,
                self.cfg.peer_timeout,
            )
            .await;

            for outcome in outcomes {
                let peer = &outcome.peer;
                if let Some(msg) = outcome.error_message.as_deref() {
                    self.log_peer_error(peer, msg);
                }
                match outcome.reply {
                    PeerReply::Success(positions) => {
                        replicas.record(&peer.identity, peer.trust, positions);
                    }
                    PeerReply::Failed(failure) => {
                        if let PeerFailure::Rejected { error_message: None } = &failure {
                            self.log_peer_error(peer, "request not processed");
                        }
                        self.logger.log(
                            Level::Debug,
                            Domain::Peer,
                            "peer_failed",
                            obj(&[
                                ("peer", v_str(peer.identity.as_str())),
                                ("attempt", json!(attempts + 1)),
                                ("failure", v_str(&format!("{:?}", failure))),
                            ]),
                        );
                    }
                }
            }

            remaining.retain(|p| !replicas.contains(&p.identity));
            attempts += 1;
        }

        let acked_peers = replicas.acked();
        self.logger.log(
            Level::Info,
            Domain::Reconcile,
            "peers_polled",
            obj(&[
                ("queried", json!(peers.len())),
                ("acked", json!(acked_peers.len())),
                ("attempts", json!(attempts)),
            ]),
        );

        let result = reconcile(&replicas, self.cfg.high_leverage_threshold);

        for id in &result.high_leverage {
            let lev = result
                .stats
                .iter()
                .find(|s| &s.identity == id)
                .map(|s| s.total_abs_leverage)
                .unwrap_or_default();
            self.logger.log(
                Level::Warn,
                Domain::Reconcile,
                "high_leverage",
                obj(&[
                    ("peer", v_str(id.as_str())),
                    ("total_abs_leverage", v_num(lev)),
                    ("threshold", v_num(self.cfg.high_leverage_threshold)),
                ]),
            );
        }

        if result.desynced {
            let peers_json: Vec<Value> = result
                .stats
                .iter()
                .map(|s| {
                    json!({
                        "peer": s.identity.as_str(),
                        "order_count": s.order_count,
                        "trust": s.trust,
                        "fingerprint": s.fingerprint,
                    })
                })
                .collect();
            self.logger.log(
                Level::Warn,
                Domain::Reconcile,
                "peers_desynced",
                obj(&[("peers", Value::Array(peers_json))]),
            );
        }

        match result.source_stats() {
            Some(s) => self.logger.log(
                Level::Info,
                Domain::Reconcile,
                "canonical_selected",
                obj(&[
                    ("peer", v_str(s.identity.as_str())),
                    ("order_count", json!(s.order_count)),
                    ("trust", v_num(s.trust)),
                    ("positions", json!(result.canonical.len())),
                ]),
            ),
            None => self.logger.log(
                Level::Info,
                Domain::Reconcile,
                "positions_empty",
                obj(&[("acked", json!(acked_peers.len()))]),
            ),
        }

        FetchOutcome {
            canonical: result.canonical,
            source: result.source,
            acked_peers,
            attempts,
            delays,
            desynced: result.desynced,
        }
    }

    pub fn refresh_allowed(&self) -> bool {
        match self.last_refresh {
            Some(at) => at.elapsed() >= self.cfg.refresh_interval,
            None => true,
        }
    }

    /// Rate-limited poll of the currently eligible peers.
    pub async fn refresh(&mut self) -> RefreshResult {
        if !self.refresh_allowed() {
            self.logger.log(Level::Debug, Domain::Reconcile, "refresh_skipped", obj(&[]));
            return RefreshResult::Skipped(self.last_outcome.clone());
        }
        let peers = self.get_queryable_peers();
        self.logger.log(
            Level::Info,
            Domain::Reconcile,
            "refresh_started",
            obj(&[("eligible", json!(peers.len()))]),
        );
        let outcome = Arc::new(self.fetch_canonical_positions(&peers).await);
        self.last_outcome = Some(Arc::clone(&outcome));
        self.last_refresh = Some(Instant::now());
        RefreshResult::Refreshed(outcome)
    }

    pub fn last_outcome(&self) -> Option<Arc<FetchOutcome>> {
        self.last_outcome.clone()
    }

    /// Peers that answered the most recent completed poll.
    pub fn recently_acked_peers(&self) -> &[Identity] {
        self.last_outcome
            .as_deref()
            .map(|o| o.acked_peers.as_slice())
            .unwrap_or(&[])
    }

    /// Refresh repeatedly until `stop` flips to true. The stop request is seen
    /// between refreshes, at most one pause late.
    pub async fn run_update_loop(&mut self, mut stop: watch::Receiver<bool>) {
        self.logger.log(Level::Info, Domain::System, "update_loop_started", obj(&[]));
        loop {
            if *stop.borrow() {
                break;
            }
            self.refresh().await;
            tokio::select! {
                changed = stop.changed() => {
                    if changed.is_err() {
                        break;
                    }
                }
                _ = sleep(Duration::from_secs(1)) => {}
            }
        }
        self.logger.log(Level::Info, Domain::System, "update_loop_stopped", obj(&[]));
    }

    fn log_peer_error(&self, peer: &PeerRef, message: &str) {
        if peer.trust >= self.cfg.high_trust_threshold {
            self.logger.log(
                Level::Warn,
                Domain::Peer,
                "peer_error_high_trust",
                obj(&[
                    ("peer", v_str(peer.identity.as_str())),
                    ("address", v_str(&peer.address.to_string())),
                    ("trust", v_num(peer.trust)),
                    ("error", v_str(message)),
                ]),
            );
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::registry::member;

    #[test]
    fn test_eligibility_filters_trust_address_and_self() {
        let snap = RegistrySnapshot::new(vec![
            member("low", 0.0, Some(8091)),
            member("good", 0.4, Some(8091)),
            member("noaddr", 0.9, None),
            member("me", 0.9, Some(8091)),
        ]);
        let policy = EligibilityPolicy {
            min_trust: 0.0,
            open_access: false,
            self_identity: Some(Identity::new("me")),
        };
        let ids: Vec<String> = policy
            .select(&snap)
            .into_iter()
            .map(|p| p.identity.to_string())
            .collect();
        assert_eq!(ids, vec!["good"]);

        let open = EligibilityPolicy {
            open_access: true,
            ..policy
        };
        let ids: Vec<String> = open
            .select(&snap)
            .into_iter()
            .map(|p| p.identity.to_string())
            .collect();
        assert_eq!(ids, vec!["low", "good"]);
    }

    #[test]
    fn test_sorted_by_close() {
        let mk = |sym: &str, close: Option<u64>| PositionRecord {
            identity_owner: Identity::new("me"),
            symbol: sym.to_string(),
            net_leverage: 1.0,
            orders: vec![],
            is_open: close.is_none(),
            open_ms: 0,
            close_ms: close,
        };
        let outcome = FetchOutcome {
            canonical: vec![mk("open", None), mk("late", Some(20)), mk("early", Some(10))],
            ..Default::default()
        };
        let syms: Vec<String> = outcome.sorted_by_close().into_iter().map(|p| p.symbol).collect();
        assert_eq!(syms, vec!["early", "late", "open"]);
        assert_eq!(outcome.open_positions().len(), 1);
    }
}
