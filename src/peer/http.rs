use std::time::Duration;

use async_trait::async_trait;
use reqwest::Client;

use super::{PeerClient, PeerError, PeerRef, PeerResponse, PositionsRequest};

/// JSON-over-HTTP transport: `POST http://<host>:<port>/positions`.
#[derive(Clone)]
pub struct HttpPeerClient {
    client: Client,
    timeout: Duration,
}

impl HttpPeerClient {
    pub fn new(timeout: Duration) -> Result<Self, PeerError> {
        let client = Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| PeerError::Transport(e.to_string()))?;
        Ok(Self { client, timeout })
    }

    fn classify(&self, err: reqwest::Error) -> PeerError {
        if err.is_timeout() {
            PeerError::Timeout(self.timeout)
        } else {
            PeerError::Transport(err.to_string())
        }
    }
}

#[async_trait]
impl PeerClient for HttpPeerClient {
    async fn query_peer(
        &self,
        peer: &PeerRef,
        request: &PositionsRequest,
    ) -> Result<PeerResponse, PeerError> {
        if !peer.address.is_routable() {
            return Err(PeerError::NoAddress);
        }
        let url = peer
            .address
            .base_url()
            .and_then(|base| base.join("positions"))
            .map_err(|_| PeerError::NoAddress)?;

        let resp = self
            .client
            .post(url)
            .json(request)
            .send()
            .await
            .map_err(|e| self.classify(e))?;

        if !resp.status().is_success() {
            let status = resp.status().as_u16();
            let body = resp.text().await.unwrap_or_default();
            return Err(PeerError::Transport(format!("status {}: {}", status, body)));
        }

        resp.json::<PeerResponse>().await.map_err(|e| {
            if e.is_timeout() {
                PeerError::Timeout(self.timeout)
            } else {
                PeerError::Decode(e.to_string())
            }
        })
    }
}
