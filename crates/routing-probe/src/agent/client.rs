//! Scheduler-side proxy of one remote agent.

use super::api::{
    HEADER_SCHEDULER_ID, ProvideRequest, ProvideResponse, ReadinessResponse, RetrievalResponse,
    RetrieveRequest,
};
use crate::content::{Content, ContentId};
use crate::routing::RoutingStrategy;
use serde::Serialize;
use serde::de::DeserializeOwned;
use std::time::Duration;
use tokio::time::Instant;
use tracing::{debug, info};

/// Default period between readiness probes.
pub const DEFAULT_POLL_INTERVAL: Duration = Duration::from_secs(5);

/// Failures talking to an agent. Routing errors are not among them: those
/// arrive inside successfully decoded responses.
#[derive(Debug, thiserror::Error)]
pub enum ProxyError {
    #[error("request to {url} failed")]
    Transport {
        url: String,
        #[source]
        source: reqwest::Error,
    },
    #[error("{url} answered HTTP {status}: {body}")]
    Status {
        url: String,
        status: u16,
        body: String,
    },
    #[error("malformed response from {url}")]
    Decode {
        url: String,
        #[source]
        source: reqwest::Error,
    },
    #[error("agent at {url} not ready after {waited:?}")]
    Deadline { url: String, waited: Duration },
}

#[derive(Debug, Clone)]
pub struct AgentClient {
    client: reqwest::Client,
    base_url: String,
    scheduler_id: String,
    poll_interval: Duration,
}

impl AgentClient {
    /// `request_timeout` bounds every single round trip.
    pub fn new(
        base_url: &str,
        scheduler_id: impl Into<String>,
        request_timeout: Duration,
    ) -> Result<Self, reqwest::Error> {
        let client = reqwest::Client::builder()
            .timeout(request_timeout)
            .build()?;

        Ok(Self {
            client,
            base_url: base_url.trim_end_matches('/').to_string(),
            scheduler_id: scheduler_id.into(),
            poll_interval: DEFAULT_POLL_INTERVAL,
        })
    }

    pub fn with_poll_interval(mut self, poll_interval: Duration) -> Self {
        self.poll_interval = poll_interval;
        self
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    pub fn provide_url(&self) -> String {
        format!("{}/provide", self.base_url)
    }

    pub fn retrieve_url(&self, cid: &ContentId) -> String {
        format!("{}/retrieve/{}", self.base_url, cid)
    }

    pub fn readiness_url(&self) -> String {
        format!("{}/readiness", self.base_url)
    }

    pub async fn provide(&self, content: &Content) -> Result<ProvideResponse, ProxyError> {
        self.post_json(self.provide_url(), &ProvideRequest::new(content))
            .await
    }

    pub async fn retrieve(
        &self,
        cid: &ContentId,
        routing: RoutingStrategy,
    ) -> Result<RetrievalResponse, ProxyError> {
        self.post_json(self.retrieve_url(cid), &RetrieveRequest { routing })
            .await
    }

    /// Probe readiness once.
    pub async fn readiness(&self) -> Result<ReadinessResponse, ProxyError> {
        let url = self.readiness_url();
        let resp = self
            .client
            .get(&url)
            .header(HEADER_SCHEDULER_ID, &self.scheduler_id)
            .send()
            .await
            .map_err(|source| ProxyError::Transport {
                url: url.clone(),
                source,
            })?;

        decode(url, resp).await
    }

    /// Poll readiness every poll interval until the agent reports healthy or
    /// `deadline` passes.
    pub async fn wait_for_api(&self, deadline: Instant) -> Result<ReadinessResponse, ProxyError> {
        let started = Instant::now();

        let poll = async {
            let mut ticker = tokio::time::interval(self.poll_interval);
            loop {
                ticker.tick().await;
                match self.readiness().await {
                    Ok(readiness) if readiness.healthy => return readiness,
                    Ok(_) => debug!(url = %self.base_url, "Agent not healthy yet"),
                    Err(e) => debug!(url = %self.base_url, "Agent not reachable yet: {}", e),
                }
            }
        };

        match tokio::time::timeout_at(deadline, poll).await {
            Ok(readiness) => {
                info!(
                    url = %self.base_url,
                    peer_id = %readiness.peer_id.short(),
                    host = %readiness.host,
                    build = %readiness.build,
                    "Agent API available"
                );
                Ok(readiness)
            }
            Err(_) => Err(ProxyError::Deadline {
                url: self.base_url.clone(),
                waited: started.elapsed(),
            }),
        }
    }

    async fn post_json<B: Serialize, T: DeserializeOwned>(
        &self,
        url: String,
        body: &B,
    ) -> Result<T, ProxyError> {
        debug!("POST {}", url);
        let resp = self
            .client
            .post(&url)
            .header(HEADER_SCHEDULER_ID, &self.scheduler_id)
            .json(body)
            .send()
            .await
            .map_err(|source| ProxyError::Transport {
                url: url.clone(),
                source,
            })?;

        decode(url, resp).await
    }
}

async fn decode<T: DeserializeOwned>(
    url: String,
    resp: reqwest::Response,
) -> Result<T, ProxyError> {
    let status = resp.status();
    if !status.is_success() {
        let body = resp.text().await.unwrap_or_default();
        return Err(ProxyError::Status {
            url,
            status: status.as_u16(),
            body,
        });
    }

    resp.json::<T>()
        .await
        .map_err(|source| ProxyError::Decode { url, source })
}
