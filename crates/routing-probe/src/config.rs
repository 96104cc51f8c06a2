//! Configuration files for `probectl schedule` and `probe-agent`.
//!
//! Files may be JSON or YAML. Every field has a default, so an empty file is
//! a valid configuration; command line flags override file values.

use crate::agent::server::DEFAULT_LOOKUP_TIMEOUT;
use crate::routing::RoutingStrategy;
use crate::routing::delegated::{DEFAULT_INDEXER_ENDPOINT, DEFAULT_ROUTING_ENDPOINT};
use crate::scheduler::{FleetMember, RetrievalFailurePolicy, SchedulerConfig};
use crate::telemetry::TelemetryConfig;
use anyhow::Context;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::time::Duration;

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum ConfigError {
    #[error("no agents configured")]
    EmptyFleet,
    #[error("agent url {0:?} is not an http(s) url")]
    InvalidUrl(String),
    #[error("{0} must be greater than zero")]
    Zero(&'static str),
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ScheduleConfig {
    pub fleet: Vec<FleetMember>,
    pub routing: RoutingStrategy,
    pub max_content_size: usize,
    #[serde(with = "humantime_serde")]
    pub round_timeout: Duration,
    #[serde(with = "humantime_serde")]
    pub readiness_timeout: Duration,
    #[serde(with = "humantime_serde")]
    pub readiness_poll_interval: Duration,
    pub dry_run: bool,
    /// Directory of the JSON lines store. Nothing is stored when unset.
    pub store_dir: Option<PathBuf>,
    pub retrieval_failure: RetrievalFailurePolicy,
    pub max_rounds: Option<u64>,
}

impl Default for ScheduleConfig {
    fn default() -> Self {
        let scheduler = SchedulerConfig::default();
        Self {
            fleet: Vec::new(),
            routing: scheduler.routing,
            max_content_size: scheduler.max_content_size,
            round_timeout: scheduler.round_timeout,
            readiness_timeout: scheduler.readiness_timeout,
            readiness_poll_interval: scheduler.readiness_poll_interval,
            dry_run: scheduler.dry_run,
            store_dir: None,
            retrieval_failure: scheduler.retrieval_failure,
            max_rounds: scheduler.max_rounds,
        }
    }
}

impl ScheduleConfig {
    pub fn load(path: &Path) -> anyhow::Result<Self> {
        load_file(path)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.fleet.is_empty() {
            return Err(ConfigError::EmptyFleet);
        }
        if let Some(member) = self
            .fleet
            .iter()
            .find(|m| !(m.url.starts_with("http://") || m.url.starts_with("https://")))
        {
            return Err(ConfigError::InvalidUrl(member.url.clone()));
        }
        if self.max_content_size == 0 {
            return Err(ConfigError::Zero("max_content_size"));
        }
        if self.round_timeout.is_zero() {
            return Err(ConfigError::Zero("round_timeout"));
        }
        if self.readiness_poll_interval.is_zero() {
            return Err(ConfigError::Zero("readiness_poll_interval"));
        }
        Ok(())
    }

    pub fn scheduler_config(&self) -> SchedulerConfig {
        SchedulerConfig {
            routing: self.routing,
            max_content_size: self.max_content_size,
            round_timeout: self.round_timeout,
            readiness_timeout: self.readiness_timeout,
            readiness_poll_interval: self.readiness_poll_interval,
            retrieval_failure: self.retrieval_failure,
            dry_run: self.dry_run,
            max_rounds: self.max_rounds,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct TelemetrySettings {
    pub batch_size: usize,
    #[serde(with = "humantime_serde")]
    pub batch_time: Duration,
    /// JSON lines file for telemetry batches. Batches are logged when unset.
    pub file: Option<PathBuf>,
}

impl Default for TelemetrySettings {
    fn default() -> Self {
        let defaults = TelemetryConfig::default();
        Self {
            batch_size: defaults.batch_size,
            batch_time: defaults.batch_time,
            file: None,
        }
    }
}

impl TelemetrySettings {
    pub fn telemetry_config(&self) -> TelemetryConfig {
        TelemetryConfig {
            batch_size: self.batch_size.max(1),
            batch_time: self.batch_time,
            ..TelemetryConfig::default()
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AgentConfig {
    pub listen_addr: SocketAddr,
    #[serde(with = "humantime_serde")]
    pub lookup_timeout: Duration,
    pub delegated_endpoint: String,
    pub indexer_endpoint: String,
    pub telemetry: TelemetrySettings,
}

impl Default for AgentConfig {
    fn default() -> Self {
        Self {
            listen_addr: SocketAddr::from(([0, 0, 0, 0], 7070)),
            lookup_timeout: DEFAULT_LOOKUP_TIMEOUT,
            delegated_endpoint: DEFAULT_ROUTING_ENDPOINT.to_string(),
            indexer_endpoint: DEFAULT_INDEXER_ENDPOINT.to_string(),
            telemetry: TelemetrySettings::default(),
        }
    }
}

impl AgentConfig {
    pub fn load(path: &Path) -> anyhow::Result<Self> {
        load_file(path)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.lookup_timeout.is_zero() {
            return Err(ConfigError::Zero("lookup_timeout"));
        }
        if self.telemetry.batch_size == 0 {
            return Err(ConfigError::Zero("telemetry.batch_size"));
        }
        if self.telemetry.batch_time.is_zero() {
            return Err(ConfigError::Zero("telemetry.batch_time"));
        }
        Ok(())
    }
}

fn load_file<T: DeserializeOwned>(path: &Path) -> anyhow::Result<T> {
    let content = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read config file {}", path.display()))?;
    if content.trim().is_empty() {
        return serde_yaml::from_str("{}").context("Failed to build default config");
    }
    serde_json::from_str(&content)
        .or_else(|_| serde_yaml::from_str(&content))
        .with_context(|| format!("Failed to parse config file {}", path.display()))
}
