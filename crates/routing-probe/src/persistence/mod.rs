//! Persistence gateway for measurement results.
//!
//! Persistence is best effort: the scheduler logs and ignores every
//! [`PersistenceError`], so a store outage never stops a run.

pub mod jsonl;
pub mod memory;

pub use jsonl::JsonlStore;
pub use memory::MemoryStore;

use crate::agent::api::{ProvideResponse, RetrievalResponse};
use crate::build_info::BuildInfo;
use crate::content::ContentId;
use crate::routing::{PeerId, RoutingStrategy};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::time::Duration;
use uuid::Uuid;

#[derive(Debug, thiserror::Error)]
pub enum PersistenceError {
    #[error("store I/O failed: {0}")]
    Io(#[from] std::io::Error),
    #[error("record serialization failed: {0}")]
    Serialization(#[from] serde_json::Error),
    #[error("unknown node {0}")]
    UnknownNode(Uuid),
    #[error("store unavailable: {0}")]
    Unavailable(String),
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Run {
    pub id: Uuid,
    pub started_at: DateTime<Utc>,
    pub build: BuildInfo,
}

impl Run {
    pub fn new(build: BuildInfo) -> Self {
        Self {
            id: Uuid::new_v4(),
            started_at: Utc::now(),
            build,
        }
    }
}

/// Static description of a fleet member.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NodeMetadata {
    pub region: String,
    pub instance_type: String,
    pub build: BuildInfo,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Node {
    pub id: Uuid,
    pub run_id: Uuid,
    pub peer_id: PeerId,
    pub region: String,
    pub instance_type: String,
    pub build: BuildInfo,
    pub created_at: DateTime<Utc>,
    #[serde(default)]
    pub last_heartbeat: Option<DateTime<Utc>>,
    #[serde(default)]
    pub offline_since: Option<DateTime<Utc>>,
}

impl Node {
    pub fn new(run_id: Uuid, peer_id: PeerId, metadata: NodeMetadata) -> Self {
        Self {
            id: Uuid::new_v4(),
            run_id,
            peer_id,
            region: metadata.region,
            instance_type: metadata.instance_type,
            build: metadata.build,
            created_at: Utc::now(),
            last_heartbeat: None,
            offline_since: None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProvideRecord {
    pub id: Uuid,
    pub node_id: Uuid,
    pub cid: ContentId,
    #[serde(with = "humantime_serde")]
    pub duration: Duration,
    pub routing_table_size: usize,
    #[serde(default)]
    pub error: Option<String>,
    pub created_at: DateTime<Utc>,
}

impl ProvideRecord {
    pub fn new(node_id: Uuid, provide: &ProvideResponse) -> Self {
        Self {
            id: Uuid::new_v4(),
            node_id,
            cid: provide.cid.clone(),
            duration: provide.duration,
            routing_table_size: provide.routing_table_size,
            error: provide.error.clone(),
            created_at: Utc::now(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RetrievalRecord {
    pub id: Uuid,
    pub node_id: Uuid,
    pub cid: ContentId,
    pub routing: RoutingStrategy,
    #[serde(with = "humantime_serde")]
    pub duration: Duration,
    pub routing_table_size: usize,
    #[serde(default)]
    pub error: Option<String>,
    pub created_at: DateTime<Utc>,
}

impl RetrievalRecord {
    pub fn new(node_id: Uuid, retrieval: &RetrievalResponse) -> Self {
        Self {
            id: Uuid::new_v4(),
            node_id,
            cid: retrieval.cid.clone(),
            routing: retrieval.routing,
            duration: retrieval.duration,
            routing_table_size: retrieval.routing_table_size,
            error: retrieval.error.clone(),
            created_at: Utc::now(),
        }
    }
}

/// Everything a store holds, as plain data.
#[derive(Debug, Clone, Default)]
pub struct StoreSnapshot {
    pub runs: Vec<Run>,
    pub nodes: Vec<Node>,
    pub provides: Vec<ProvideRecord>,
    pub retrievals: Vec<RetrievalRecord>,
}

impl StoreSnapshot {
    pub fn node(&self, id: Uuid) -> Option<&Node> {
        self.nodes.iter().find(|n| n.id == id)
    }
}

#[async_trait]
pub trait Persistence: Send + Sync {
    async fn insert_run(&self, build: &BuildInfo) -> Result<Run, PersistenceError>;

    async fn insert_node(
        &self,
        run_id: Uuid,
        peer_id: &PeerId,
        metadata: NodeMetadata,
    ) -> Result<Node, PersistenceError>;

    async fn insert_provide(
        &self,
        node_id: Uuid,
        provide: &ProvideResponse,
    ) -> Result<ProvideRecord, PersistenceError>;

    async fn insert_retrieval(
        &self,
        node_id: Uuid,
        retrieval: &RetrievalResponse,
    ) -> Result<RetrievalRecord, PersistenceError>;

    /// Record `node.last_heartbeat` (now, if unset).
    async fn update_heartbeat(&self, node: &Node) -> Result<(), PersistenceError>;

    /// Record `node.offline_since` (now, if unset).
    async fn update_offline_since(&self, node: &Node) -> Result<(), PersistenceError>;
}
