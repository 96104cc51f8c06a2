//! In-process simulated routing network.
//!
//! All hosts joined to one [`MemoryNetwork`] share its provider records and
//! advertisement index, so a provide on one host becomes visible to lookups
//! on every other host. Lookups sleep for a random latency up to
//! [`MemoryNetworkConfig::max_lookup_latency`] to give measurements a spread.

use super::{
    AddrInfo, ContentRouting, IndexerResponse, MultihashResult, PeerId, ProviderResult,
    RoutingError,
};
use crate::content::ContentId;
use async_trait::async_trait;
use dashmap::DashMap;
use rand::{Rng, RngCore};
use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tracing::debug;

/// Simulation parameters.
#[derive(Debug, Clone)]
pub struct MemoryNetworkConfig {
    /// Upper bound of the simulated lookup latency.
    pub max_lookup_latency: Duration,
    /// Whether provides are also advertised to the index.
    pub advertise_to_index: bool,
    /// Number of distinct cids kept. The oldest cid expires first.
    pub max_records: usize,
}

impl Default for MemoryNetworkConfig {
    fn default() -> Self {
        Self {
            max_lookup_latency: Duration::from_millis(50),
            advertise_to_index: true,
            max_records: 10_000,
        }
    }
}

/// Shared state of the simulated network.
#[derive(Debug)]
pub struct MemoryNetwork {
    config: MemoryNetworkConfig,
    /// DHT provider records.
    records: DashMap<ContentId, Vec<PeerId>>,
    /// Indexer advertisements.
    advertisements: DashMap<ContentId, Vec<PeerId>>,
    /// Provided cids, oldest first.
    expiry: Mutex<VecDeque<ContentId>>,
    hosts: DashMap<PeerId, ()>,
    indexer_down: AtomicBool,
}

impl MemoryNetwork {
    pub fn new(config: MemoryNetworkConfig) -> Arc<Self> {
        Arc::new(Self {
            config,
            records: DashMap::new(),
            advertisements: DashMap::new(),
            expiry: Mutex::new(VecDeque::new()),
            hosts: DashMap::new(),
            indexer_down: AtomicBool::new(false),
        })
    }

    /// Join a new host with a fresh random identity.
    pub fn join(self: &Arc<Self>) -> MemoryHost {
        let mut bytes = [0u8; 16];
        rand::thread_rng().fill_bytes(&mut bytes);
        let peer_id = PeerId::new(format!("mem{}", hex::encode(bytes)));

        self.hosts.insert(peer_id.clone(), ());
        debug!(peer_id = %peer_id.short(), "Host joined memory network");

        MemoryHost {
            peer_id,
            network: Arc::clone(self),
            address_book: DashMap::new(),
            forgotten: AtomicUsize::new(0),
        }
    }

    pub fn peer_count(&self) -> usize {
        self.hosts.len()
    }

    pub fn provider_count(&self, cid: &ContentId) -> usize {
        self.records.get(cid).map(|r| r.len()).unwrap_or(0)
    }

    /// Number of cids with provider records or advertisements.
    pub fn record_count(&self) -> usize {
        self.expiry.lock().unwrap_or_else(|e| e.into_inner()).len()
    }

    /// Remember `cid` and expire the oldest cids beyond `max_records`.
    fn track(&self, cid: &ContentId) {
        let mut expiry = self.expiry.lock().unwrap_or_else(|e| e.into_inner());
        if expiry.contains(cid) {
            return;
        }
        expiry.push_back(cid.clone());

        while expiry.len() > self.config.max_records.max(1) {
            let Some(old) = expiry.pop_front() else { break };
            self.records.remove(&old);
            self.advertisements.remove(&old);
            debug!(cid = %old, "Expired provider records");
        }
    }

    /// Make every indexer lookup fail until switched back.
    pub fn set_indexer_down(&self, down: bool) {
        self.indexer_down.store(down, Ordering::SeqCst);
    }

    async fn simulate_latency(&self) {
        let max = self.config.max_lookup_latency.as_micros() as u64;
        if max == 0 {
            return;
        }
        let micros = rand::thread_rng().gen_range(0..=max);
        tokio::time::sleep(Duration::from_micros(micros)).await;
    }
}

/// One agent's view of a [`MemoryNetwork`].
#[derive(Debug)]
pub struct MemoryHost {
    peer_id: PeerId,
    network: Arc<MemoryNetwork>,
    address_book: DashMap<PeerId, ()>,
    forgotten: AtomicUsize,
}

impl MemoryHost {
    pub fn network(&self) -> &Arc<MemoryNetwork> {
        &self.network
    }

    pub fn knows(&self, peer: &PeerId) -> bool {
        self.address_book.contains_key(peer)
    }

    /// Number of peers released through [`ContentRouting::forget_peer`].
    pub fn forgotten(&self) -> usize {
        self.forgotten.load(Ordering::SeqCst)
    }
}

impl Drop for MemoryHost {
    fn drop(&mut self) {
        self.network.hosts.remove(&self.peer_id);
    }
}

#[async_trait]
impl ContentRouting for MemoryHost {
    fn local_peer_id(&self) -> PeerId {
        self.peer_id.clone()
    }

    fn routing_table_size(&self) -> usize {
        self.network.peer_count().saturating_sub(1)
    }

    async fn provide(&self, cid: &ContentId) -> Result<(), RoutingError> {
        self.network.simulate_latency().await;

        self.network
            .records
            .entry(cid.clone())
            .or_default()
            .push(self.peer_id.clone());

        if self.network.config.advertise_to_index {
            self.network
                .advertisements
                .entry(cid.clone())
                .or_default()
                .push(self.peer_id.clone());
        }
        self.network.track(cid);

        Ok(())
    }

    async fn find_first_provider(&self, cid: &ContentId) -> Result<PeerId, RoutingError> {
        self.network.simulate_latency().await;

        let provider = self
            .network
            .records
            .get(cid)
            .and_then(|providers| providers.first().cloned());

        match provider {
            Some(peer) => {
                self.address_book.insert(peer.clone(), ());
                Ok(peer)
            }
            None => Ok(PeerId::empty()),
        }
    }

    async fn indexer_lookup(&self, cid: &ContentId) -> Result<IndexerResponse, RoutingError> {
        self.network.simulate_latency().await;

        if self.network.indexer_down.load(Ordering::SeqCst) {
            return Err(RoutingError::Lookup("indexer unavailable".to_string()));
        }

        let Some(providers) = self.network.advertisements.get(cid) else {
            return Ok(IndexerResponse::default());
        };

        Ok(IndexerResponse {
            multihash_results: vec![MultihashResult {
                multihash: hex::encode(cid.digest()),
                provider_results: providers
                    .iter()
                    .map(|id| ProviderResult {
                        provider: AddrInfo {
                            id: id.clone(),
                            addrs: Vec::new(),
                        },
                    })
                    .collect(),
            }],
        })
    }

    fn forget_peer(&self, peer: &PeerId) {
        if self.address_book.remove(peer).is_some() {
            self.forgotten.fetch_add(1, Ordering::SeqCst);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn instant_network() -> Arc<MemoryNetwork> {
        MemoryNetwork::new(MemoryNetworkConfig {
            max_lookup_latency: Duration::ZERO,
            advertise_to_index: true,
            max_records: 100,
        })
    }

    #[tokio::test]
    async fn test_provide_visible_to_other_hosts() {
        let network = instant_network();
        let a = network.join();
        let b = network.join();
        let cid = ContentId::from_payload(b"round 1");

        assert_eq!(b.find_first_provider(&cid).await.unwrap(), PeerId::empty());

        a.provide(&cid).await.unwrap();
        assert_eq!(network.provider_count(&cid), 1);

        let found = b.find_first_provider(&cid).await.unwrap();
        assert_eq!(found, a.local_peer_id());
        assert!(b.knows(&found));

        let indexed = b.indexer_lookup(&cid).await.unwrap();
        assert_eq!(
            indexed.providers().collect::<Vec<_>>(),
            vec![&a.local_peer_id()]
        );
    }

    #[tokio::test]
    async fn test_forget_peer_clears_address_book() {
        let network = instant_network();
        let a = network.join();
        let b = network.join();
        let cid = ContentId::from_payload(b"forget");

        a.provide(&cid).await.unwrap();
        let found = b.find_first_provider(&cid).await.unwrap();
        b.forget_peer(&found);

        assert!(!b.knows(&found));
        assert_eq!(b.forgotten(), 1);

        // Forgetting an unknown peer is a no-op.
        b.forget_peer(&found);
        assert_eq!(b.forgotten(), 1);
    }

    #[tokio::test]
    async fn test_routing_table_tracks_membership() {
        let network = instant_network();
        let a = network.join();
        assert_eq!(a.routing_table_size(), 0);

        let b = network.join();
        let c = network.join();
        assert_eq!(a.routing_table_size(), 2);

        drop(b);
        drop(c);
        assert_eq!(a.routing_table_size(), 0);
    }

    #[tokio::test]
    async fn test_indexer_down_is_a_lookup_error() {
        let network = instant_network();
        let a = network.join();
        network.set_indexer_down(true);

        let err = a
            .indexer_lookup(&ContentId::from_payload(b"x"))
            .await
            .unwrap_err();
        assert!(matches!(err, RoutingError::Lookup(_)));
    }

    #[tokio::test]
    async fn test_index_can_be_disabled() {
        let network = MemoryNetwork::new(MemoryNetworkConfig {
            max_lookup_latency: Duration::ZERO,
            advertise_to_index: false,
            ..MemoryNetworkConfig::default()
        });
        let a = network.join();
        let cid = ContentId::from_payload(b"dht only");
        a.provide(&cid).await.unwrap();

        assert!(a.indexer_lookup(&cid).await.unwrap().is_empty());
        assert_eq!(network.provider_count(&cid), 1);
    }

    #[tokio::test]
    async fn test_oldest_records_expire_beyond_cap() {
        let network = MemoryNetwork::new(MemoryNetworkConfig {
            max_lookup_latency: Duration::ZERO,
            max_records: 2,
            ..MemoryNetworkConfig::default()
        });
        let a = network.join();
        let b = network.join();
        let cids: Vec<ContentId> = (0..3u8).map(|i| ContentId::from_payload(&[i])).collect();

        for cid in &cids {
            a.provide(cid).await.unwrap();
        }
        // A second provider of a known cid does not take another slot.
        b.provide(&cids[2]).await.unwrap();

        assert_eq!(network.record_count(), 2);
        assert_eq!(network.provider_count(&cids[0]), 0);
        assert!(b.indexer_lookup(&cids[0]).await.unwrap().is_empty());
        assert_eq!(network.provider_count(&cids[1]), 1);
        assert_eq!(network.provider_count(&cids[2]), 2);
    }
}
