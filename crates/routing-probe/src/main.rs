//! Content routing measurement agent.
//!
//! Serves the provide / retrieve / readiness API the scheduler drives and
//! measures each call against the configured routing endpoints.

use anyhow::{Context, Result};
use clap::Parser;
use humantime_serde::re::humantime;
use routing_probe::{
    Agent, Shutdown,
    config::AgentConfig,
    routing::delegated::DelegatedRouting,
    shutdown::os_signal,
    telemetry::{JsonlExporter, LogExporter, TelemetryExporter, TelemetrySink},
};
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpListener;
use tracing::{info, warn};

const LONG_ABOUT: &str = "\
Measurement agent for DHT and indexer content routing.

Lookups go through a delegated routing endpoint and an IPNI indexer over HTTP.
This backend cannot announce content: every provide is answered with an error
in the response body, so DHT retrievals of scheduler content report \"not found\"
unless another node announced the same CID. Use `probectl local-run` to measure
full provide/retrieve rounds on a simulated network.";

#[derive(Parser, Debug)]
#[command(name = "probe-agent")]
#[command(about = "Measurement agent for DHT and indexer content routing")]
#[command(long_about = LONG_ABOUT)]
#[command(version)]
struct Cli {
    /// YAML or JSON configuration file
    #[arg(long, env = "PROBE_CONFIG")]
    config: Option<PathBuf>,

    /// Address of the agent API
    #[arg(long, env = "PROBE_LISTEN")]
    listen: Option<SocketAddr>,

    /// Bound of a single provider or index lookup (e.g. "1m", "30s")
    #[arg(long, env = "PROBE_LOOKUP_TIMEOUT", value_parser = humantime::parse_duration)]
    lookup_timeout: Option<Duration>,

    /// Delegated routing endpoint used for DHT lookups
    #[arg(long, env = "PROBE_DELEGATED_ENDPOINT")]
    delegated_endpoint: Option<String>,

    /// Indexer endpoint used for index lookups
    #[arg(long, env = "PROBE_INDEXER_ENDPOINT")]
    indexer_endpoint: Option<String>,

    /// Append telemetry batches to this JSON lines file instead of the log
    #[arg(long, env = "PROBE_TELEMETRY_FILE")]
    telemetry_file: Option<PathBuf>,

    #[arg(long, env = "PROBE_LOG_LEVEL", default_value = "info")]
    log_level: String,
}

impl Cli {
    fn agent_config(&self) -> Result<AgentConfig> {
        let mut config = match &self.config {
            Some(path) => AgentConfig::load(path)?,
            None => AgentConfig::default(),
        };

        if let Some(listen) = self.listen {
            config.listen_addr = listen;
        }
        if let Some(timeout) = self.lookup_timeout {
            config.lookup_timeout = timeout;
        }
        if let Some(endpoint) = &self.delegated_endpoint {
            config.delegated_endpoint = endpoint.clone();
        }
        if let Some(endpoint) = &self.indexer_endpoint {
            config.indexer_endpoint = endpoint.clone();
        }
        if let Some(file) = &self.telemetry_file {
            config.telemetry.file = Some(file.clone());
        }
        Ok(config)
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    tracing_subscriber::fmt()
        .with_env_filter(&cli.log_level)
        .init();

    let config = cli.agent_config()?;
    config.validate().context("Invalid agent configuration")?;
    info!(
        listen = %config.listen_addr,
        lookup_timeout = ?config.lookup_timeout,
        routing = %config.delegated_endpoint,
        indexer = %config.indexer_endpoint,
        "Starting probe agent"
    );

    let routing = DelegatedRouting::new(
        &config.delegated_endpoint,
        &config.indexer_endpoint,
        config.lookup_timeout,
    )
    .context("Failed to set up routing backend")?;
    warn!("Delegated routing cannot announce content, provides will report an error");

    let exporter: Arc<dyn TelemetryExporter> = match &config.telemetry.file {
        Some(path) => Arc::new(JsonlExporter::new(path)),
        None => Arc::new(LogExporter),
    };
    let (telemetry, telemetry_task) =
        TelemetrySink::spawn(config.telemetry.telemetry_config(), exporter);

    let agent = Arc::new(Agent::new(
        Arc::new(routing),
        telemetry,
        config.lookup_timeout,
    ));

    let listener = TcpListener::bind(config.listen_addr)
        .await
        .with_context(|| format!("Failed to bind {}", config.listen_addr))?;

    let shutdown = Shutdown::new();
    let mut server = tokio::spawn(agent.serve(listener, shutdown.to_signal()));

    let served = tokio::select! {
        _ = os_signal() => {
            shutdown.trigger();
            (&mut server).await
        }
        res = &mut server => res,
    };
    served.context("Agent task panicked")??;

    // The server owned the last telemetry sink, so the batcher flushes and exits.
    telemetry_task.await.context("Telemetry task panicked")?;
    info!("Probe agent stopped");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::CommandFactory;

    #[test]
    fn test_help_states_provide_limitation() {
        let help = Cli::command().render_long_help().to_string();
        assert!(help.contains("cannot announce content"));
        assert!(help.contains("local-run"));
    }

    #[test]
    fn test_cli_overrides_config_defaults() {
        let cli = Cli::parse_from([
            "probe-agent",
            "--listen",
            "127.0.0.1:9100",
            "--lookup-timeout",
            "15s",
        ]);
        let config = cli.agent_config().unwrap();
        assert_eq!(config.listen_addr.port(), 9100);
        assert_eq!(config.lookup_timeout, Duration::from_secs(15));
        assert!(config.validate().is_ok());
    }
}
