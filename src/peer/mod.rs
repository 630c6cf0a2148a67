use std::time::Duration;

use async_trait::async_trait;
use futures_util::future::join_all;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::registry::Endpoint;
use crate::types::{Identity, PositionRecord};

pub mod http;
pub mod retry;

/// A peer selected for querying, resolved against one registry snapshot.
#[derive(Debug, Clone, PartialEq)]
pub struct PeerRef {
    pub identity: Identity,
    pub address: Endpoint,
    pub trust: f64,
}

/// Query payload asking a peer for this node's positions.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct PositionsRequest {
    #[serde(default)]
    pub requester: Option<Identity>,
}

/// What a peer sends back.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct PeerResponse {
    #[serde(default)]
    pub identity: Option<Identity>,
    pub successfully_processed: bool,
    #[serde(default)]
    pub positions: Option<Vec<PositionRecord>>,
    #[serde(default)]
    pub error_message: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Error)]
pub enum PeerError {
    #[error("no response within {0:?}")]
    Timeout(Duration),
    #[error("transport: {0}")]
    Transport(String),
    #[error("undecodable reply: {0}")]
    Decode(String),
    #[error("peer has no usable address")]
    NoAddress,
}

/// Why a peer contributed nothing this attempt.
#[derive(Debug, Clone, PartialEq)]
pub enum PeerFailure {
    Unavailable(PeerError),
    Rejected { error_message: Option<String> },
}

/// Per-peer result of one attempt. An empty `Success` is a real answer
/// ("no positions"), distinct from a failure to answer.
#[derive(Debug, Clone, PartialEq)]
pub enum PeerReply {
    Success(Vec<PositionRecord>),
    Failed(PeerFailure),
}

impl PeerReply {
    pub fn is_success(&self) -> bool {
        matches!(self, PeerReply::Success(_))
    }
}

impl From<PeerResponse> for PeerReply {
    fn from(resp: PeerResponse) -> Self {
        if resp.successfully_processed {
            PeerReply::Success(resp.positions.unwrap_or_default())
        } else {
            PeerReply::Failed(PeerFailure::Rejected {
                error_message: resp.error_message,
            })
        }
    }
}

#[derive(Debug, Clone)]
pub struct PeerOutcome {
    pub peer: PeerRef,
    pub reply: PeerReply,
    /// Application-level error text, reported even alongside a success.
    pub error_message: Option<String>,
}

#[async_trait]
pub trait PeerClient: Send + Sync {
    async fn query_peer(
        &self,
        peer: &PeerRef,
        request: &PositionsRequest,
    ) -> Result<PeerResponse, PeerError>;
}

/// Query every peer concurrently, each bounded by `timeout`. Outcomes come back
/// in the order of `peers`, whatever order the replies arrived in.
pub async fn query_all<C>(
    client: &C,
    peers: &[PeerRef],
    request: &PositionsRequest,
    timeout: Duration,
) -> Vec<PeerOutcome>
where
    C: PeerClient + ?Sized,
{
    let calls = peers.iter().map(|peer| async move {
        let result = match tokio::time::timeout(timeout, client.query_peer(peer, request)).await {
            Ok(r) => r,
            Err(_) => Err(PeerError::Timeout(timeout)),
        };
        match result {
            Ok(resp) => {
                let error_message = resp.error_message.clone();
                PeerOutcome {
                    peer: peer.clone(),
                    reply: PeerReply::from(resp),
                    error_message,
                }
            }
            Err(e) => PeerOutcome {
                peer: peer.clone(),
                reply: PeerReply::Failed(PeerFailure::Unavailable(e)),
                error_message: None,
            },
        }
    });
    join_all(calls).await
}
