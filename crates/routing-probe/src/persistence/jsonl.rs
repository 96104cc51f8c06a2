//! Append-only JSON lines store.
//!
//! One file per record kind inside a directory. Node heartbeats and offline
//! timestamps are appended as update events and folded back into the nodes
//! when the store is loaded.

use super::{
    Node, NodeMetadata, Persistence, PersistenceError, ProvideRecord, RetrievalRecord, Run,
    StoreSnapshot,
};
use crate::agent::api::{ProvideResponse, RetrievalResponse};
use crate::build_info::BuildInfo;
use crate::routing::PeerId;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use tokio::io::AsyncWriteExt;
use tokio::sync::Mutex;
use tracing::{debug, warn};
use uuid::Uuid;

const RUNS_FILE: &str = "runs.jsonl";
const NODES_FILE: &str = "nodes.jsonl";
const NODE_UPDATES_FILE: &str = "node_updates.jsonl";
const PROVIDES_FILE: &str = "provides.jsonl";
const RETRIEVALS_FILE: &str = "retrievals.jsonl";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
enum NodeUpdateKind {
    Heartbeat,
    Offline,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct NodeUpdate {
    node_id: Uuid,
    kind: NodeUpdateKind,
    at: DateTime<Utc>,
}

#[derive(Debug)]
pub struct JsonlStore {
    dir: PathBuf,
    write_lock: Mutex<()>,
}

impl JsonlStore {
    /// Open (and create if needed) a store directory.
    pub async fn open(dir: impl Into<PathBuf>) -> Result<Self, PersistenceError> {
        let dir = dir.into();
        tokio::fs::create_dir_all(&dir).await?;
        debug!("Opened JSONL store at {:?}", dir);
        Ok(Self {
            dir,
            write_lock: Mutex::new(()),
        })
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// Read every record of the store at `dir`.
    pub async fn load(dir: impl AsRef<Path>) -> Result<StoreSnapshot, PersistenceError> {
        let dir = dir.as_ref();

        let mut nodes: Vec<Node> = read_lines(&dir.join(NODES_FILE)).await?;
        let updates: Vec<NodeUpdate> = read_lines(&dir.join(NODE_UPDATES_FILE)).await?;
        for update in updates {
            let Some(node) = nodes.iter_mut().find(|n| n.id == update.node_id) else {
                warn!(node_id = %update.node_id, "Update for unknown node");
                continue;
            };
            match update.kind {
                NodeUpdateKind::Heartbeat => node.last_heartbeat = Some(update.at),
                NodeUpdateKind::Offline => node.offline_since = Some(update.at),
            }
        }

        Ok(StoreSnapshot {
            runs: read_lines(&dir.join(RUNS_FILE)).await?,
            nodes,
            provides: read_lines(&dir.join(PROVIDES_FILE)).await?,
            retrievals: read_lines(&dir.join(RETRIEVALS_FILE)).await?,
        })
    }

    async fn append<T: Serialize>(&self, file: &str, record: &T) -> Result<(), PersistenceError> {
        let mut line = serde_json::to_vec(record)?;
        line.push(b'\n');

        let _guard = self.write_lock.lock().await;
        let mut out = tokio::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(self.dir.join(file))
            .await?;
        out.write_all(&line).await?;
        out.flush().await?;
        Ok(())
    }
}

async fn read_lines<T: DeserializeOwned>(path: &Path) -> Result<Vec<T>, PersistenceError> {
    let text = match tokio::fs::read_to_string(path).await {
        Ok(text) => text,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
        Err(e) => return Err(e.into()),
    };

    text.lines()
        .filter(|line| !line.trim().is_empty())
        .map(|line| serde_json::from_str(line).map_err(PersistenceError::from))
        .collect()
}

#[async_trait]
impl Persistence for JsonlStore {
    async fn insert_run(&self, build: &BuildInfo) -> Result<Run, PersistenceError> {
        let run = Run::new(build.clone());
        self.append(RUNS_FILE, &run).await?;
        Ok(run)
    }

    async fn insert_node(
        &self,
        run_id: Uuid,
        peer_id: &PeerId,
        metadata: NodeMetadata,
    ) -> Result<Node, PersistenceError> {
        let node = Node::new(run_id, peer_id.clone(), metadata);
        self.append(NODES_FILE, &node).await?;
        Ok(node)
    }

    async fn insert_provide(
        &self,
        node_id: Uuid,
        provide: &ProvideResponse,
    ) -> Result<ProvideRecord, PersistenceError> {
        let record = ProvideRecord::new(node_id, provide);
        self.append(PROVIDES_FILE, &record).await?;
        Ok(record)
    }

    async fn insert_retrieval(
        &self,
        node_id: Uuid,
        retrieval: &RetrievalResponse,
    ) -> Result<RetrievalRecord, PersistenceError> {
        let record = RetrievalRecord::new(node_id, retrieval);
        self.append(RETRIEVALS_FILE, &record).await?;
        Ok(record)
    }

    async fn update_heartbeat(&self, node: &Node) -> Result<(), PersistenceError> {
        let update = NodeUpdate {
            node_id: node.id,
            kind: NodeUpdateKind::Heartbeat,
            at: node.last_heartbeat.unwrap_or_else(Utc::now),
        };
        self.append(NODE_UPDATES_FILE, &update).await
    }

    async fn update_offline_since(&self, node: &Node) -> Result<(), PersistenceError> {
        let update = NodeUpdate {
            node_id: node.id,
            kind: NodeUpdateKind::Offline,
            at: node.offline_since.unwrap_or_else(Utc::now),
        };
        self.append(NODE_UPDATES_FILE, &update).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::content::ContentId;
    use crate::routing::RoutingStrategy;
    use std::time::Duration;

    #[tokio::test]
    async fn test_records_survive_reload() {
        let dir = tempfile::tempdir().unwrap();
        let store = JsonlStore::open(dir.path().join("results")).await.unwrap();

        let run = store.insert_run(&BuildInfo::current()).await.unwrap();
        let node = store
            .insert_node(
                run.id,
                &PeerId::new("p1"),
                NodeMetadata {
                    region: "us-east-1".to_string(),
                    instance_type: "t3.small".to_string(),
                    build: BuildInfo::current(),
                },
            )
            .await
            .unwrap();

        let cid = ContentId::from_payload(b"persist");
        store
            .insert_provide(
                node.id,
                &ProvideResponse {
                    cid: cid.clone(),
                    duration: Duration::from_millis(800),
                    routing_table_size: 210,
                    error: None,
                },
            )
            .await
            .unwrap();
        store
            .insert_retrieval(
                node.id,
                &RetrievalResponse {
                    cid: cid.clone(),
                    routing: RoutingStrategy::Indexer,
                    duration: Duration::from_millis(120),
                    routing_table_size: 205,
                    error: Some("not found".to_string()),
                },
            )
            .await
            .unwrap();
        store.update_heartbeat(&node).await.unwrap();

        let snapshot = JsonlStore::load(store.dir()).await.unwrap();
        assert_eq!(snapshot.runs, vec![run]);
        assert_eq!(snapshot.provides.len(), 1);
        assert_eq!(snapshot.provides[0].duration, Duration::from_millis(800));
        assert_eq!(snapshot.retrievals[0].routing, RoutingStrategy::Indexer);
        assert_eq!(snapshot.retrievals[0].error.as_deref(), Some("not found"));

        let loaded = snapshot.node(node.id).unwrap();
        assert!(loaded.last_heartbeat.is_some());
        assert!(loaded.offline_since.is_none());
    }

    #[tokio::test]
    async fn test_load_of_empty_dir_is_empty() {
        let dir = tempfile::tempdir().unwrap();
        let snapshot = JsonlStore::load(dir.path()).await.unwrap();
        assert!(snapshot.runs.is_empty());
        assert!(snapshot.retrievals.is_empty());
    }
}
