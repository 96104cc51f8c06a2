//! Content routing capability.
//!
//! The agent never talks to a DHT or an indexer directly. It consumes both
//! through [`ContentRouting`] and picks the path per request from the
//! [`RoutingStrategy`] tag carried in the retrieve request.
//!
//! Two backends exist:
//!
//! - [`memory::MemoryNetwork`]: a shared, in-process simulation used by local
//!   fleets and tests
//! - [`delegated::DelegatedRouting`]: HTTP delegated-routing and indexer
//!   endpoints for agents deployed against a live network

pub mod delegated;
pub mod memory;

use crate::content::ContentId;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::fmt;

/// Which routing subsystem a retrieval goes through.
#[derive(
    Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize, clap::ValueEnum,
)]
#[serde(rename_all = "lowercase")]
pub enum RoutingStrategy {
    /// Kademlia provider-record lookup.
    #[default]
    Dht,
    /// Advertisement index lookup.
    Indexer,
}

impl fmt::Display for RoutingStrategy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RoutingStrategy::Dht => write!(f, "dht"),
            RoutingStrategy::Indexer => write!(f, "indexer"),
        }
    }
}

/// Peer identity as reported by the routing layer.
///
/// An empty identity is what a DHT lookup yields when no provider was found.
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct PeerId(String);

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum PeerIdError {
    #[error("empty peer id")]
    Empty,
    #[error("peer id contains whitespace")]
    Whitespace,
}

impl PeerId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// The identity of "no provider".
    pub fn empty() -> Self {
        Self(String::new())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub fn validate(&self) -> Result<(), PeerIdError> {
        if self.0.is_empty() {
            return Err(PeerIdError::Empty);
        }
        if self.0.chars().any(char::is_whitespace) {
            return Err(PeerIdError::Whitespace);
        }
        Ok(())
    }

    /// Abbreviated form for log lines.
    pub fn short(&self) -> &str {
        let end = self
            .0
            .char_indices()
            .nth(16)
            .map(|(i, _)| i)
            .unwrap_or(self.0.len());
        &self.0[..end]
    }
}

impl fmt::Display for PeerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Response of an indexer lookup, shaped like the IPNI `/cid/{cid}` answer.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct IndexerResponse {
    #[serde(default)]
    pub multihash_results: Vec<MultihashResult>,
}

impl IndexerResponse {
    pub fn is_empty(&self) -> bool {
        self.multihash_results.is_empty()
    }

    pub fn providers(&self) -> impl Iterator<Item = &PeerId> {
        self.multihash_results
            .iter()
            .flat_map(|r| r.provider_results.iter())
            .map(|p| &p.provider.id)
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct MultihashResult {
    #[serde(default)]
    pub multihash: String,
    #[serde(default)]
    pub provider_results: Vec<ProviderResult>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct ProviderResult {
    pub provider: AddrInfo,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct AddrInfo {
    #[serde(rename = "ID")]
    pub id: PeerId,
    #[serde(rename = "Addrs", default)]
    pub addrs: Vec<String>,
}

/// Failures inside the routing layer. These become recorded outcomes, never
/// protocol errors of the agent API.
#[derive(Debug, thiserror::Error)]
pub enum RoutingError {
    #[error("lookup failed: {0}")]
    Lookup(String),
    #[error("provide failed: {0}")]
    Provide(String),
    #[error("{0}")]
    Unsupported(&'static str),
    #[error("routing request failed: {0}")]
    Http(#[from] reqwest::Error),
    #[error("routing endpoint {url} answered HTTP {status}")]
    UnexpectedStatus { status: u16, url: String },
}

/// The routing capability an agent measures.
#[async_trait]
pub trait ContentRouting: Send + Sync {
    fn local_peer_id(&self) -> PeerId;

    /// Whether the backend is bootstrapped far enough to produce meaningful
    /// measurements.
    fn is_ready(&self) -> bool {
        true
    }

    /// Current number of entries in the local routing table.
    fn routing_table_size(&self) -> usize;

    /// Announce `cid` as provided by this peer.
    async fn provide(&self, cid: &ContentId) -> Result<(), RoutingError>;

    /// Wait for the first provider record of `cid`. An empty [`PeerId`] means
    /// the lookup finished without finding one.
    async fn find_first_provider(&self, cid: &ContentId) -> Result<PeerId, RoutingError>;

    async fn indexer_lookup(&self, cid: &ContentId) -> Result<IndexerResponse, RoutingError>;

    /// Close connections to `peer` and drop it from the address book.
    fn forget_peer(&self, peer: &PeerId);
}
