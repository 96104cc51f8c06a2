//! Content Routing Measurement Infrastructure
//!
//! This crate measures how long it takes to announce content and to find a
//! provider for it again, comparing two routing subsystems:
//!
//! - **DHT**: Kademlia provider records, time to first provider
//! - **Indexer**: lookup in an advertisement index
//!
//! A fleet of measurement agents (`probe-agent`) is driven by a central
//! scheduler (`probectl schedule`). Every round one agent provides a fresh
//! random content item and every other agent retrieves it.
//!
//! # Architecture
//!
//! ```text
//!                  ┌──────────────────────────────┐
//!                  │          Scheduler           │
//!                  │  readiness barrier, rounds   │──────► Persistence
//!                  └──────────────┬───────────────┘        (JSONL store)
//!                                 │ HTTP (AgentClient)
//!         ┌───────────────────────┼───────────────────────┐
//!         ▼                       ▼                       ▼
//!    ┌─────────┐             ┌─────────┐             ┌─────────┐
//!    │ Agent A │             │ Agent B │             │ Agent C │──► Telemetry
//!    │ provide │             │retrieve │             │retrieve │
//!    └────┬────┘             └────┬────┘             └────┬────┘
//!         └───────────────── ContentRouting ──────────────┘
//!                         (DHT / indexer backend)
//! ```
//!
//! # Usage
//!
//! ```bash
//! probe-agent --listen 0.0.0.0:7070
//! probectl schedule --agent http://10.0.0.1:7070 --agent http://10.0.0.2:7070
//! probectl local-run --agents 5 --rounds 20
//! probectl report --store ./results --min-rt-size 200
//! ```

pub mod agent;
pub mod build_info;
pub mod config;
pub mod content;
pub mod persistence;
pub mod report;
pub mod routing;
pub mod scheduler;
pub mod shutdown;
pub mod telemetry;

pub use agent::client::{AgentClient, ProxyError};
pub use agent::server::Agent;
pub use build_info::BuildInfo;
pub use content::{Content, ContentId};
pub use persistence::{JsonlStore, MemoryStore, Persistence};
pub use routing::{ContentRouting, PeerId, RoutingStrategy};
pub use scheduler::{FleetMember, RetrievalFailurePolicy, RunSummary, Scheduler, SchedulerConfig};
pub use shutdown::{Shutdown, ShutdownSignal};
pub use telemetry::{TelemetryConfig, TelemetrySink};
