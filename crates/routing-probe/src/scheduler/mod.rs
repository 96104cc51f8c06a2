//! Measurement coordinator.
//!
//! The scheduler waits until every agent of the fleet answers readiness and
//! then runs rounds until shutdown:
//!
//! ```text
//!   round r, fleet of n, provider p = r mod n
//!
//!             provide(content)
//!   agent[p] ◄──────────────── scheduler
//!                                  │ retrieve(cid), after provide returned
//!            ┌─────────────────────┼─────────────────────┐
//!            ▼                     ▼                     ▼
//!     agent[p+1 mod n]      agent[p+2 mod n]  …   agent[p+n-1 mod n]
//! ```
//!
//! A failed provide ends the run. Failed retrievals either end the run or are
//! recorded as per-agent failures, depending on [`RetrievalFailurePolicy`].

pub mod registry;

pub use registry::{NodeRegistry, RegistryError};

use crate::agent::api::{Outcome, ProvideResponse, ReadinessResponse, RetrievalResponse};
use crate::agent::client::{AgentClient, DEFAULT_POLL_INTERVAL};
use crate::build_info::BuildInfo;
use crate::content::{Content, ContentId};
use crate::persistence::{Node, NodeMetadata, Persistence, PersistenceError, Run};
use crate::routing::RoutingStrategy;
use crate::shutdown::ShutdownSignal;
use anyhow::{Context, bail};
use chrono::Utc;
use futures::future::join_all;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinSet;
use tokio::time::Instant;
use tracing::{debug, info, warn};
use uuid::Uuid;

/// What to do when an agent cannot be reached for a retrieval.
#[derive(
    Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize, clap::ValueEnum,
)]
#[serde(rename_all = "lowercase")]
pub enum RetrievalFailurePolicy {
    /// Cancel the remaining retrievals and fail the run.
    #[default]
    Abort,
    /// Record the agent as failed for this round and keep going.
    Isolate,
}

/// One agent of the fleet.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FleetMember {
    pub url: String,
    #[serde(default = "default_region")]
    pub region: String,
    #[serde(default = "default_instance_type")]
    pub instance_type: String,
}

fn default_region() -> String {
    "unknown".to_string()
}

fn default_instance_type() -> String {
    "unknown".to_string()
}

impl FleetMember {
    pub fn new(url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            region: default_region(),
            instance_type: default_instance_type(),
        }
    }
}

#[derive(Debug, Clone)]
pub struct SchedulerConfig {
    pub routing: RoutingStrategy,
    pub max_content_size: usize,
    /// Bound of a single provide or retrieve round trip.
    pub round_timeout: Duration,
    /// Shared deadline of the whole readiness barrier.
    pub readiness_timeout: Duration,
    pub readiness_poll_interval: Duration,
    pub retrieval_failure: RetrievalFailurePolicy,
    /// Skip every persistence call.
    pub dry_run: bool,
    pub max_rounds: Option<u64>,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            routing: RoutingStrategy::Dht,
            max_content_size: 1024,
            round_timeout: Duration::from_secs(120),
            readiness_timeout: Duration::from_secs(20 * 60),
            readiness_poll_interval: DEFAULT_POLL_INTERVAL,
            retrieval_failure: RetrievalFailurePolicy::Abort,
            dry_run: false,
            max_rounds: None,
        }
    }
}

/// An agent that could not be reached during a round.
#[derive(Debug, Clone)]
pub struct NodeFailure {
    pub index: usize,
    pub url: String,
    pub error: String,
}

#[derive(Debug, Clone)]
pub struct RoundReport {
    pub round: u64,
    pub provider: usize,
    pub cid: ContentId,
    pub provide: ProvideResponse,
    /// Successful retrievals in visiting order, keyed by agent index.
    pub retrievals: Vec<(usize, RetrievalResponse)>,
    pub failures: Vec<NodeFailure>,
}

impl RoundReport {
    pub fn not_found(&self) -> usize {
        self.retrievals
            .iter()
            .filter(|(_, r)| r.outcome() == Outcome::NotFound)
            .count()
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct RunSummary {
    pub run_id: Uuid,
    pub rounds: u64,
    pub provides: u64,
    pub retrievals: u64,
    pub not_found: u64,
    pub failures: u64,
}

impl RunSummary {
    fn record(&mut self, report: &RoundReport) {
        self.rounds += 1;
        self.provides += 1;
        self.retrievals += report.retrievals.len() as u64;
        self.not_found += report.not_found() as u64;
        self.failures += report.failures.len() as u64;
    }
}

struct FleetAgent {
    member: FleetMember,
    client: AgentClient,
}

pub struct Scheduler {
    config: SchedulerConfig,
    agents: Vec<FleetAgent>,
    store: Option<Arc<dyn Persistence>>,
    run: Run,
    registry: NodeRegistry,
    provider: usize,
    summary: RunSummary,
}

impl Scheduler {
    /// Open a run and prepare one proxy per fleet member.
    ///
    /// `store` is ignored in dry-run mode.
    pub async fn new(
        config: SchedulerConfig,
        fleet: Vec<FleetMember>,
        store: Option<Arc<dyn Persistence>>,
    ) -> anyhow::Result<Self> {
        if fleet.is_empty() {
            bail!("fleet is empty, nothing to schedule");
        }

        let store = if config.dry_run { None } else { store };
        let build = BuildInfo::current();

        let run = match &store {
            Some(store) => match store.insert_run(&build).await {
                Ok(run) => run,
                Err(e) => {
                    store_failed("insert run", &e);
                    Run::new(build)
                }
            },
            None => Run::new(build),
        };

        let agents = fleet
            .into_iter()
            .map(|member| {
                let client = AgentClient::new(&member.url, run.id.to_string(), config.round_timeout)
                    .with_context(|| format!("create client for {}", member.url))?
                    .with_poll_interval(config.readiness_poll_interval);
                Ok(FleetAgent { member, client })
            })
            .collect::<anyhow::Result<Vec<_>>>()?;

        info!(
            run_id = %run.id,
            agents = agents.len(),
            routing = %config.routing,
            dry_run = config.dry_run,
            "Initialized scheduler"
        );

        Ok(Self {
            registry: NodeRegistry::new(agents.len()),
            summary: RunSummary {
                run_id: run.id,
                ..RunSummary::default()
            },
            config,
            agents,
            store,
            run,
            provider: 0,
        })
    }

    pub fn run_info(&self) -> &Run {
        &self.run
    }

    pub fn registry(&self) -> &NodeRegistry {
        &self.registry
    }

    /// Index of the agent providing in the next round.
    pub fn provider_index(&self) -> usize {
        self.provider
    }

    pub fn summary(&self) -> &RunSummary {
        &self.summary
    }

    /// Wait for the fleet, then run rounds until shutdown or `max_rounds`.
    pub async fn run(&mut self, mut shutdown: ShutdownSignal) -> anyhow::Result<RunSummary> {
        let ready = self
            .wait_for_fleet(&mut shutdown)
            .await
            .context("waiting for agent APIs");

        let result = match ready {
            Ok(true) => self.round_loop(&shutdown).await,
            Ok(false) => {
                info!("Shutdown requested while waiting for agents");
                Ok(())
            }
            Err(e) => Err(e),
        };

        self.mark_offline().await;

        match &result {
            Ok(()) => info!(
                run_id = %self.summary.run_id,
                rounds = self.summary.rounds,
                retrievals = self.summary.retrievals,
                not_found = self.summary.not_found,
                failures = self.summary.failures,
                "Run finished"
            ),
            Err(e) => warn!(run_id = %self.summary.run_id, "Run failed: {:#}", e),
        }

        result.map(|()| self.summary.clone())
    }

    /// Readiness barrier. Returns `false` when shutdown interrupted it.
    pub async fn wait_for_fleet(&mut self, shutdown: &mut ShutdownSignal) -> anyhow::Result<bool> {
        let deadline = Instant::now() + self.config.readiness_timeout;
        info!(
            agents = self.agents.len(),
            timeout = ?self.config.readiness_timeout,
            "Waiting for agent APIs"
        );

        let mut tasks = JoinSet::new();
        for (index, agent) in self.agents.iter().enumerate() {
            let client = agent.client.clone();
            tasks.spawn(async move { (index, client.wait_for_api(deadline).await) });
        }

        let mut ready = Vec::with_capacity(self.agents.len());
        loop {
            tokio::select! {
                _ = shutdown.wait() => {
                    tasks.abort_all();
                    return Ok(false);
                }
                joined = tasks.join_next() => {
                    let Some(joined) = joined else { break };
                    let (index, result) = joined.context("readiness task failed")?;
                    match result {
                        Ok(readiness) => ready.push((index, readiness)),
                        Err(e) => {
                            tasks.abort_all();
                            let url = &self.agents[index].member.url;
                            return Err(e).with_context(|| format!("agent {}", url));
                        }
                    }
                }
            }
        }

        ready.sort_by_key(|(index, _)| *index);
        for (index, readiness) in ready {
            self.register(index, readiness).await?;
        }

        info!(agents = self.registry.registered(), "All agent APIs available");
        Ok(true)
    }

    async fn register(&mut self, index: usize, readiness: ReadinessResponse) -> anyhow::Result<()> {
        let member = &self.agents[index].member;
        let metadata = NodeMetadata {
            region: member.region.clone(),
            instance_type: member.instance_type.clone(),
            build: readiness.build,
        };

        let node = match &self.store {
            Some(store) => match store
                .insert_node(self.run.id, &readiness.peer_id, metadata.clone())
                .await
            {
                Ok(node) => node,
                Err(e) => {
                    store_failed("insert node", &e);
                    Node::new(self.run.id, readiness.peer_id, metadata)
                }
            },
            None => Node::new(self.run.id, readiness.peer_id, metadata),
        };

        let node = self.registry.register(index, node)?;
        debug!(
            index,
            node_id = %node.id,
            peer_id = %node.peer_id.short(),
            region = %node.region,
            "Registered node"
        );
        Ok(())
    }

    async fn round_loop(&mut self, shutdown: &ShutdownSignal) -> anyhow::Result<()> {
        loop {
            if shutdown.is_triggered() {
                info!("Shutdown requested, stopping rounds");
                return Ok(());
            }
            if let Some(max) = self.config.max_rounds {
                if self.summary.rounds >= max {
                    info!(rounds = max, "Reached round limit");
                    return Ok(());
                }
            }

            self.run_round().await?;
        }
    }

    /// One provide on the current provider followed by a retrieval on every
    /// other agent.
    pub async fn run_round(&mut self) -> anyhow::Result<RoundReport> {
        let n = self.agents.len();
        let round = self.summary.rounds;
        let provider = self.provider;
        let content = Content::random(self.config.max_content_size);

        info!(
            round,
            provider,
            cid = %content.cid,
            size = content.len(),
            "Starting round"
        );

        let provider_url = self.agents[provider].member.url.clone();
        let provide = self.agents[provider]
            .client
            .provide(&content)
            .await
            .with_context(|| format!("provide content on {}", provider_url))?;

        info!(
            cid = %provide.cid,
            dur = provide.duration.as_secs_f64(),
            rt_size = provide.routing_table_size,
            error = provide.error.as_deref().unwrap_or(""),
            "Provided content"
        );

        if let (Some(store), Some(node)) = (&self.store, self.registry.get(provider)) {
            if let Err(e) = store.insert_provide(node.id, &provide).await {
                store_failed("insert provide", &e);
            }
        }

        let mut tasks = JoinSet::new();
        for i in 0..n - 1 {
            let index = (provider + i + 1) % n;
            let client = self.agents[index].client.clone();
            let cid = content.cid.clone();
            let routing = self.config.routing;
            tasks.spawn(async move { (index, client.retrieve(&cid, routing).await) });
        }

        let mut retrievals = Vec::with_capacity(n - 1);
        let mut failures = Vec::new();
        while let Some(joined) = tasks.join_next().await {
            let (index, result) = joined.context("retrieval task failed")?;
            let url = &self.agents[index].member.url;
            match result {
                Ok(response) => {
                    debug!(
                        index,
                        dur = response.duration.as_secs_f64(),
                        error = response.error.as_deref().unwrap_or(""),
                        "Retrieval finished"
                    );
                    retrievals.push((index, response));
                }
                Err(e) => match self.config.retrieval_failure {
                    RetrievalFailurePolicy::Abort => {
                        tasks.abort_all();
                        return Err(e).with_context(|| format!("retrieve content on {}", url));
                    }
                    RetrievalFailurePolicy::Isolate => {
                        let error = format!("{:#}", anyhow::Error::new(e));
                        warn!(index, url = %url, "Retrieval failed: {}", error);
                        failures.push(NodeFailure {
                            index,
                            url: url.clone(),
                            error,
                        });
                    }
                },
            }
        }
        retrievals.sort_by_key(|(index, _)| (index + n - provider - 1) % n);
        failures.sort_by_key(|f| (f.index + n - provider - 1) % n);

        if let Some(store) = &self.store {
            for (index, response) in &retrievals {
                let Some(node) = self.registry.get(*index) else {
                    continue;
                };
                if let Err(e) = store.insert_retrieval(node.id, response).await {
                    store_failed("insert retrieval", &e);
                }
            }
        }

        self.heartbeat(
            std::iter::once(provider)
                .chain(retrievals.iter().map(|(index, _)| *index))
                .collect(),
        )
        .await;

        self.provider = (provider + 1) % n;

        let report = RoundReport {
            round,
            provider,
            cid: content.cid,
            provide,
            retrievals,
            failures,
        };
        info!(
            round,
            retrievals = report.retrievals.len(),
            not_found = report.not_found(),
            failures = report.failures.len(),
            "Finished round"
        );
        self.summary.record(&report);
        Ok(report)
    }

    async fn heartbeat(&mut self, answered: Vec<usize>) {
        let now = Utc::now();
        let touched: Vec<Node> = answered
            .into_iter()
            .filter_map(|index| self.registry.touch(index, now).cloned())
            .collect();

        let Some(store) = &self.store else { return };
        let results = join_all(touched.iter().map(|node| store.update_heartbeat(node))).await;
        for e in results.into_iter().filter_map(Result::err) {
            store_failed("update heartbeat", &e);
        }
    }

    async fn mark_offline(&mut self) {
        let offline = self.registry.mark_offline(Utc::now());
        let Some(store) = &self.store else { return };
        let results = join_all(offline.iter().map(|node| store.update_offline_since(node))).await;
        for e in results.into_iter().filter_map(Result::err) {
            store_failed("update offline since", &e);
        }
    }
}

fn store_failed(op: &str, e: &PersistenceError) {
    warn!(op, "Persistence failed: {}", e);
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::agent::server::Agent;
    use crate::persistence::MemoryStore;
    use crate::routing::memory::{MemoryNetwork, MemoryNetworkConfig};
    use crate::shutdown::Shutdown;
    use crate::telemetry::TelemetrySink;

    async fn spawn_fleet(n: usize) -> (Vec<FleetMember>, Shutdown) {
        let network = MemoryNetwork::new(MemoryNetworkConfig {
            max_lookup_latency: Duration::from_millis(5),
            ..MemoryNetworkConfig::default()
        });
        let shutdown = Shutdown::new();
        let mut fleet = Vec::new();
        for _ in 0..n {
            let agent = Arc::new(Agent::new(
                Arc::new(network.join()),
                TelemetrySink::noop(),
                Duration::from_secs(5),
            ));
            let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
            let url = format!("http://{}", listener.local_addr().unwrap());
            tokio::spawn(agent.serve(listener, shutdown.to_signal()));
            fleet.push(FleetMember::new(url));
        }
        (fleet, shutdown)
    }

    fn config() -> SchedulerConfig {
        SchedulerConfig {
            round_timeout: Duration::from_secs(10),
            readiness_timeout: Duration::from_secs(10),
            readiness_poll_interval: Duration::from_millis(20),
            ..SchedulerConfig::default()
        }
    }

    #[tokio::test]
    async fn test_empty_fleet_is_rejected() {
        let err = Scheduler::new(config(), Vec::new(), None).await.err().unwrap();
        assert!(err.to_string().contains("fleet is empty"));
    }

    #[tokio::test]
    async fn test_provider_rotates_and_records_per_round() {
        let (fleet, _agents) = spawn_fleet(3).await;
        let store = Arc::new(MemoryStore::new());
        let mut scheduler = Scheduler::new(config(), fleet, Some(store.clone()))
            .await
            .unwrap();

        let shutdown = Shutdown::new();
        assert!(scheduler.wait_for_fleet(&mut shutdown.to_signal()).await.unwrap());
        assert_eq!(scheduler.registry().registered(), 3);

        for round in 0..4u64 {
            assert_eq!(scheduler.provider_index(), (round % 3) as usize);
            let report = scheduler.run_round().await.unwrap();
            assert_eq!(report.round, round);

            assert_eq!(report.provider, (round % 3) as usize);
            let visited: Vec<usize> = report.retrievals.iter().map(|(i, _)| *i).collect();
            let p = report.provider;
            assert_eq!(visited, vec![(p + 1) % 3, (p + 2) % 3]);
            assert!(report.failures.is_empty());
        }

        let snapshot = store.snapshot();
        assert_eq!(snapshot.runs.len(), 1);
        assert_eq!(snapshot.nodes.len(), 3);
        assert_eq!(snapshot.provides.len(), 4);
        assert_eq!(snapshot.retrievals.len(), 8);
        assert!(snapshot.nodes.iter().all(|n| n.last_heartbeat.is_some()));
    }

    #[tokio::test]
    async fn test_single_agent_rounds_have_no_retrievals() {
        let (fleet, _agents) = spawn_fleet(1).await;
        let mut scheduler = Scheduler::new(
            SchedulerConfig {
                max_rounds: Some(2),
                ..config()
            },
            fleet,
            None,
        )
        .await
        .unwrap();

        let shutdown = Shutdown::new();
        let summary = scheduler.run(shutdown.to_signal()).await.unwrap();
        assert_eq!(summary.rounds, 2);
        assert_eq!(summary.provides, 2);
        assert_eq!(summary.retrievals, 0);
    }

    async fn unused_url() -> String {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let url = format!("http://{}", listener.local_addr().unwrap());
        drop(listener);
        url
    }

    #[tokio::test]
    async fn test_unreachable_retriever_aborts_round_by_default() {
        let (fleet, _agents) = spawn_fleet(2).await;
        let store = Arc::new(MemoryStore::new());
        let mut scheduler = Scheduler::new(config(), fleet, Some(store.clone()))
            .await
            .unwrap();
        assert_eq!(scheduler.config.retrieval_failure, RetrievalFailurePolicy::Abort);
        let shutdown = Shutdown::new();
        assert!(scheduler.wait_for_fleet(&mut shutdown.to_signal()).await.unwrap());

        // Replace agent 1's proxy with one pointing nowhere.
        let dead = unused_url().await;
        scheduler.agents[1].client =
            AgentClient::new(&dead, "test", Duration::from_secs(2)).unwrap();
        scheduler.agents[1].member.url = dead;

        let err = scheduler.run_round().await.unwrap_err();
        assert!(format!("{err:#}").contains("retrieve content"));
        assert_eq!(scheduler.summary().rounds, 0);
        assert!(store.snapshot().retrievals.is_empty());
    }

    #[tokio::test]
    async fn test_unreachable_retriever_is_isolated_when_opted_in() {
        let (fleet, _agents) = spawn_fleet(2).await;
        let store = Arc::new(MemoryStore::new());
        let mut scheduler = Scheduler::new(
            SchedulerConfig {
                retrieval_failure: RetrievalFailurePolicy::Isolate,
                ..config()
            },
            fleet,
            Some(store.clone()),
        )
        .await
        .unwrap();
        let shutdown = Shutdown::new();
        assert!(scheduler.wait_for_fleet(&mut shutdown.to_signal()).await.unwrap());

        let dead = unused_url().await;
        scheduler.agents[1].client =
            AgentClient::new(&dead, "test", Duration::from_secs(2)).unwrap();
        scheduler.agents[1].member.url = dead;

        let report = scheduler.run_round().await.unwrap();
        assert_eq!(report.provider, 0);
        assert!(report.retrievals.is_empty());
        assert_eq!(report.failures.len(), 1);
        assert_eq!(report.failures[0].index, 1);
        assert!(store.snapshot().retrievals.is_empty());
    }

    #[tokio::test]
    async fn test_default_run_fails_on_failing_retriever() {
        use axum::http::StatusCode;
        use axum::routing::{get, post};
        use axum::{Json, Router};

        let (mut fleet, _agents) = spawn_fleet(2).await;
        // Passes the readiness barrier, then fails every retrieval.
        let broken = Router::new()
            .route(
                "/readiness",
                get(|| async {
                    Json(ReadinessResponse {
                        healthy: true,
                        peer_id: crate::routing::PeerId::new("broken"),
                        build: BuildInfo::current(),
                        host: "broken".to_string(),
                    })
                }),
            )
            .route(
                "/retrieve/{cid}",
                post(|| async { (StatusCode::BAD_GATEWAY, "gone") }),
            );
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let url = format!("http://{}", listener.local_addr().unwrap());
        tokio::spawn(async move { axum::serve(listener, broken).await.unwrap() });
        fleet.insert(1, FleetMember::new(url));

        let store = Arc::new(MemoryStore::new());
        let mut scheduler = Scheduler::new(config(), fleet, Some(store.clone()))
            .await
            .unwrap();

        let shutdown = Shutdown::new();
        let err = scheduler.run(shutdown.to_signal()).await.unwrap_err();
        assert!(format!("{err:#}").contains("retrieve content"));
        assert_eq!(scheduler.summary().rounds, 0);

        let snapshot = store.snapshot();
        assert_eq!(snapshot.provides.len(), 1);
        assert!(snapshot.retrievals.is_empty());
        assert!(snapshot.nodes.iter().all(|n| n.offline_since.is_some()));
    }

    #[tokio::test]
    async fn test_readiness_failure_aborts_startup() {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let dead = format!("http://{}", listener.local_addr().unwrap());
        drop(listener);

        let mut scheduler = Scheduler::new(
            SchedulerConfig {
                readiness_timeout: Duration::from_millis(200),
                ..config()
            },
            vec![FleetMember::new(dead)],
            None,
        )
        .await
        .unwrap();

        let shutdown = Shutdown::new();
        let err = scheduler.run(shutdown.to_signal()).await.unwrap_err();
        assert!(format!("{err:#}").contains("waiting for agent APIs"));
        assert_eq!(scheduler.registry().registered(), 0);
    }

    #[tokio::test]
    async fn test_shutdown_interrupts_readiness_barrier() {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let dead = format!("http://{}", listener.local_addr().unwrap());
        drop(listener);

        let mut scheduler = Scheduler::new(config(), vec![FleetMember::new(dead)], None)
            .await
            .unwrap();

        let shutdown = Shutdown::new();
        let signal = shutdown.to_signal();
        let stopper = tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(100)).await;
            shutdown.trigger();
            shutdown
        });

        let summary = tokio::time::timeout(Duration::from_secs(5), scheduler.run(signal))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(summary.rounds, 0);
        drop(stopper.await.unwrap());
    }

    #[tokio::test]
    async fn test_store_failures_do_not_stop_rounds() {
        let (fleet, _agents) = spawn_fleet(2).await;
        let store = Arc::new(MemoryStore::new());
        store.set_failing(true);

        let mut scheduler = Scheduler::new(
            SchedulerConfig {
                max_rounds: Some(3),
                ..config()
            },
            fleet,
            Some(store.clone()),
        )
        .await
        .unwrap();

        let shutdown = Shutdown::new();
        let summary = scheduler.run(shutdown.to_signal()).await.unwrap();
        assert_eq!(summary.rounds, 3);
        assert_eq!(summary.retrievals, 3);
        assert!(store.calls() > 0);
        assert_eq!(summary.run_id, scheduler.run_info().id);
    }
}
