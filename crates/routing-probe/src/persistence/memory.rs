use super::{
    Node, NodeMetadata, Persistence, PersistenceError, ProvideRecord, RetrievalRecord, Run,
    StoreSnapshot,
};
use crate::agent::api::{ProvideResponse, RetrievalResponse};
use crate::build_info::BuildInfo;
use crate::routing::PeerId;
use async_trait::async_trait;
use chrono::Utc;
use std::sync::Mutex;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use uuid::Uuid;

/// In-process store. Counts every call it receives and can be switched into
/// a failing mode.
#[derive(Debug, Default)]
pub struct MemoryStore {
    state: Mutex<StoreSnapshot>,
    calls: AtomicUsize,
    failing: AtomicBool,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn snapshot(&self) -> StoreSnapshot {
        self.lock().clone()
    }

    /// Number of gateway calls received, failed ones included.
    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    pub fn set_failing(&self, failing: bool) {
        self.failing.store(failing, Ordering::SeqCst);
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, StoreSnapshot> {
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn enter(&self) -> Result<(), PersistenceError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        if self.failing.load(Ordering::SeqCst) {
            return Err(PersistenceError::Unavailable(
                "memory store switched off".to_string(),
            ));
        }
        Ok(())
    }
}

#[async_trait]
impl Persistence for MemoryStore {
    async fn insert_run(&self, build: &BuildInfo) -> Result<Run, PersistenceError> {
        self.enter()?;
        let run = Run::new(build.clone());
        self.lock().runs.push(run.clone());
        Ok(run)
    }

    async fn insert_node(
        &self,
        run_id: Uuid,
        peer_id: &PeerId,
        metadata: NodeMetadata,
    ) -> Result<Node, PersistenceError> {
        self.enter()?;
        let node = Node::new(run_id, peer_id.clone(), metadata);
        self.lock().nodes.push(node.clone());
        Ok(node)
    }

    async fn insert_provide(
        &self,
        node_id: Uuid,
        provide: &ProvideResponse,
    ) -> Result<ProvideRecord, PersistenceError> {
        self.enter()?;
        let record = ProvideRecord::new(node_id, provide);
        self.lock().provides.push(record.clone());
        Ok(record)
    }

    async fn insert_retrieval(
        &self,
        node_id: Uuid,
        retrieval: &RetrievalResponse,
    ) -> Result<RetrievalRecord, PersistenceError> {
        self.enter()?;
        let record = RetrievalRecord::new(node_id, retrieval);
        self.lock().retrievals.push(record.clone());
        Ok(record)
    }

    async fn update_heartbeat(&self, node: &Node) -> Result<(), PersistenceError> {
        self.enter()?;
        let mut state = self.lock();
        let stored = state
            .nodes
            .iter_mut()
            .find(|n| n.id == node.id)
            .ok_or(PersistenceError::UnknownNode(node.id))?;
        stored.last_heartbeat = Some(node.last_heartbeat.unwrap_or_else(Utc::now));
        Ok(())
    }

    async fn update_offline_since(&self, node: &Node) -> Result<(), PersistenceError> {
        self.enter()?;
        let mut state = self.lock();
        let stored = state
            .nodes
            .iter_mut()
            .find(|n| n.id == node.id)
            .ok_or(PersistenceError::UnknownNode(node.id))?;
        stored.offline_since = Some(node.offline_since.unwrap_or_else(Utc::now));
        Ok(())
    }
}
