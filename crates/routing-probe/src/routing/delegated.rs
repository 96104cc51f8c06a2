//! HTTP delegated routing backend.
//!
//! Provider lookups go to a delegated routing endpoint
//! (`GET /routing/v1/providers/{cid}`) and index lookups to an IPNI style
//! indexer (`GET /cid/{cid}`). There is no local routing table behind this
//! backend, so its size is always reported as zero.

use super::{ContentRouting, IndexerResponse, PeerId, RoutingError};
use crate::content::ContentId;
use async_trait::async_trait;
use rand::RngCore;
use reqwest::StatusCode;
use serde::Deserialize;
use std::time::Duration;
use tracing::debug;

/// Public delegated routing endpoint.
pub const DEFAULT_ROUTING_ENDPOINT: &str = "https://delegated-ipfs.dev";
/// Public IPNI indexer.
pub const DEFAULT_INDEXER_ENDPOINT: &str = "https://cid.contact";

#[derive(Debug, Deserialize)]
struct ProvidersResponse {
    #[serde(rename = "Providers", default)]
    providers: Option<Vec<ProviderRecord>>,
}

#[derive(Debug, Deserialize)]
struct ProviderRecord {
    #[serde(rename = "ID", default)]
    id: Option<PeerId>,
}

/// Routing capability backed by remote HTTP endpoints.
#[derive(Debug, Clone)]
pub struct DelegatedRouting {
    client: reqwest::Client,
    routing_endpoint: String,
    indexer_endpoint: String,
    peer_id: PeerId,
}

impl DelegatedRouting {
    pub fn new(
        routing_endpoint: &str,
        indexer_endpoint: &str,
        request_timeout: Duration,
    ) -> Result<Self, RoutingError> {
        let client = reqwest::Client::builder()
            .timeout(request_timeout)
            .build()?;

        let mut bytes = [0u8; 16];
        rand::thread_rng().fill_bytes(&mut bytes);

        Ok(Self {
            client,
            routing_endpoint: routing_endpoint.trim_end_matches('/').to_string(),
            indexer_endpoint: indexer_endpoint.trim_end_matches('/').to_string(),
            peer_id: PeerId::new(format!("http{}", hex::encode(bytes))),
        })
    }

    async fn get_json<T: for<'de> Deserialize<'de>>(
        &self,
        url: &str,
    ) -> Result<Option<T>, RoutingError> {
        let resp = self
            .client
            .get(url)
            .header(reqwest::header::ACCEPT, "application/json")
            .send()
            .await?;

        match resp.status() {
            StatusCode::NOT_FOUND => Ok(None),
            status if status.is_success() => Ok(Some(resp.json::<T>().await?)),
            status => Err(RoutingError::UnexpectedStatus {
                status: status.as_u16(),
                url: url.to_string(),
            }),
        }
    }
}

#[async_trait]
impl ContentRouting for DelegatedRouting {
    fn local_peer_id(&self) -> PeerId {
        self.peer_id.clone()
    }

    fn routing_table_size(&self) -> usize {
        0
    }

    async fn provide(&self, _cid: &ContentId) -> Result<(), RoutingError> {
        Err(RoutingError::Unsupported(
            "delegated routing backend cannot announce content",
        ))
    }

    async fn find_first_provider(&self, cid: &ContentId) -> Result<PeerId, RoutingError> {
        let url = format!("{}/routing/v1/providers/{}", self.routing_endpoint, cid);
        let Some(resp) = self.get_json::<ProvidersResponse>(&url).await? else {
            return Ok(PeerId::empty());
        };

        let first = resp
            .providers
            .unwrap_or_default()
            .into_iter()
            .filter_map(|p| p.id)
            .find(|id| id.validate().is_ok());

        Ok(first.unwrap_or_default())
    }

    async fn indexer_lookup(&self, cid: &ContentId) -> Result<IndexerResponse, RoutingError> {
        let url = format!("{}/cid/{}", self.indexer_endpoint, cid);
        Ok(self
            .get_json::<IndexerResponse>(&url)
            .await?
            .unwrap_or_default())
    }

    fn forget_peer(&self, peer: &PeerId) {
        // No connections are held; lookups never dial the provider.
        debug!(peer_id = %peer.short(), "Nothing to release for delegated lookup");
    }
}
