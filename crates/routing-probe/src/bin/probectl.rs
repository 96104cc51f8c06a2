use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use clap::{Parser, Subcommand, ValueEnum};
use humantime_serde::re::humantime;
use routing_probe::{
    Agent, FleetMember, JsonlStore, MemoryStore, Persistence, RetrievalFailurePolicy,
    RoutingStrategy, RunSummary, Scheduler, SchedulerConfig, Shutdown, ShutdownSignal,
    config::ScheduleConfig,
    report::{Report, ReportFilter},
    routing::memory::{MemoryNetwork, MemoryNetworkConfig},
    shutdown::os_signal,
    telemetry::{LogExporter, TelemetryConfig, TelemetrySink},
};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpListener;
use tokio::task::JoinSet;
use tracing::{info, warn};

#[derive(Parser)]
#[command(name = "probectl")]
#[command(about = "Scheduler and tooling for content routing measurements")]
#[command(version)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    #[arg(long, env = "PROBE_LOG_LEVEL", default_value = "info")]
    log_level: String,
}

#[derive(Clone, Copy, Debug, ValueEnum)]
enum OutputFormat {
    Text,
    Json,
}

#[derive(Subcommand)]
enum Commands {
    /// Drive provide/retrieve rounds across a fleet of remote agents
    Schedule {
        /// YAML or JSON schedule configuration
        #[arg(long, env = "PROBE_CONFIG")]
        config: Option<PathBuf>,

        /// Agent base URL; repeat for every agent (replaces the configured fleet)
        #[arg(long = "agent")]
        agents: Vec<String>,

        #[arg(long, env = "PROBE_ROUTING")]
        routing: Option<RoutingStrategy>,

        /// Upper bound of the random content size in bytes
        #[arg(long, env = "PROBE_MAX_CONTENT_SIZE")]
        max_content_size: Option<usize>,

        #[arg(long, env = "PROBE_ROUND_TIMEOUT", value_parser = humantime::parse_duration)]
        round_timeout: Option<Duration>,

        #[arg(long, env = "PROBE_READINESS_TIMEOUT", value_parser = humantime::parse_duration)]
        readiness_timeout: Option<Duration>,

        #[arg(long, env = "PROBE_RETRIEVAL_FAILURE")]
        retrieval_failure: Option<RetrievalFailurePolicy>,

        /// Directory of the JSON lines result store
        #[arg(long, env = "PROBE_STORE_DIR")]
        store_dir: Option<PathBuf>,

        /// Run without persisting anything
        #[arg(long, env = "PROBE_DRY_RUN")]
        dry_run: bool,

        /// Stop after this many rounds
        #[arg(long)]
        max_rounds: Option<u64>,
    },

    /// Run rounds against in-process agents sharing a simulated network
    LocalRun {
        /// Number of local agents to spawn
        #[arg(long, default_value = "3")]
        agents: usize,

        #[arg(long, default_value = "10")]
        rounds: u64,

        #[arg(long, value_enum, default_value_t = RoutingStrategy::Dht)]
        routing: RoutingStrategy,

        #[arg(long, default_value = "1024")]
        max_content_size: usize,

        /// Upper bound of the simulated lookup latency
        #[arg(long, default_value = "50ms", value_parser = humantime::parse_duration)]
        max_lookup_latency: Duration,

        /// Keep the results in a JSON lines store instead of memory
        #[arg(long)]
        store_dir: Option<PathBuf>,

        #[arg(long)]
        dry_run: bool,
    },

    /// Summarize stored results per region
    Report {
        /// Directory of the JSON lines result store
        #[arg(long, env = "PROBE_STORE_DIR")]
        store: PathBuf,

        /// Ignore records taken with a smaller routing table
        #[arg(long, default_value = "0")]
        min_rt_size: usize,

        #[arg(long)]
        instance_type: Option<String>,

        /// RFC 3339 lower bound of the record timestamps
        #[arg(long)]
        since: Option<DateTime<Utc>>,

        /// RFC 3339 upper bound (exclusive) of the record timestamps
        #[arg(long)]
        until: Option<DateTime<Utc>>,

        #[arg(long, value_enum, default_value_t = OutputFormat::Text)]
        format: OutputFormat,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    tracing_subscriber::fmt()
        .with_env_filter(&cli.log_level)
        .init();

    match cli.command {
        Commands::Schedule {
            config,
            agents,
            routing,
            max_content_size,
            round_timeout,
            readiness_timeout,
            retrieval_failure,
            store_dir,
            dry_run,
            max_rounds,
        } => {
            let mut config = match config {
                Some(path) => ScheduleConfig::load(&path)?,
                None => ScheduleConfig::default(),
            };
            if !agents.is_empty() {
                config.fleet = agents.into_iter().map(FleetMember::new).collect();
            }
            if let Some(routing) = routing {
                config.routing = routing;
            }
            if let Some(size) = max_content_size {
                config.max_content_size = size;
            }
            if let Some(timeout) = round_timeout {
                config.round_timeout = timeout;
            }
            if let Some(timeout) = readiness_timeout {
                config.readiness_timeout = timeout;
            }
            if let Some(policy) = retrieval_failure {
                config.retrieval_failure = policy;
            }
            if store_dir.is_some() {
                config.store_dir = store_dir;
            }
            config.dry_run |= dry_run;
            if max_rounds.is_some() {
                config.max_rounds = max_rounds;
            }

            let summary = schedule(config).await?;
            print_summary(&summary)?;
        }

        Commands::LocalRun {
            agents,
            rounds,
            routing,
            max_content_size,
            max_lookup_latency,
            store_dir,
            dry_run,
        } => {
            if agents == 0 {
                anyhow::bail!("At least one local agent required (--agents)");
            }
            info!("Starting local run with {} agents", agents);

            let network = MemoryNetwork::new(MemoryNetworkConfig {
                max_lookup_latency,
                ..MemoryNetworkConfig::default()
            });
            let (telemetry, telemetry_task) = TelemetrySink::spawn(
                TelemetryConfig {
                    batch_time: Duration::from_secs(5),
                    ..TelemetryConfig::default()
                },
                Arc::new(LogExporter),
            );

            let agents_shutdown = Shutdown::new();
            let mut servers = JoinSet::new();
            let mut fleet = Vec::with_capacity(agents);
            for i in 0..agents {
                let agent = Arc::new(Agent::new(
                    Arc::new(network.join()),
                    telemetry.clone(),
                    Duration::from_secs(10),
                ));
                let listener = TcpListener::bind("127.0.0.1:0").await?;
                let url = format!("http://{}", listener.local_addr()?);
                info!("Created local agent {} at {}", i, url);
                servers.spawn(agent.serve(listener, agents_shutdown.to_signal()));
                fleet.push(FleetMember {
                    url,
                    region: "local".to_string(),
                    instance_type: "in-process".to_string(),
                });
            }
            drop(telemetry);

            let memory = Arc::new(MemoryStore::new());
            let store: Arc<dyn Persistence> = match &store_dir {
                Some(dir) => Arc::new(JsonlStore::open(dir).await?),
                None => memory.clone(),
            };

            let config = SchedulerConfig {
                routing,
                max_content_size,
                round_timeout: Duration::from_secs(30),
                readiness_timeout: Duration::from_secs(30),
                readiness_poll_interval: Duration::from_millis(100),
                dry_run,
                max_rounds: Some(rounds),
                ..SchedulerConfig::default()
            };
            let result: Result<RunSummary> = async {
                let mut scheduler = Scheduler::new(config, fleet, Some(store)).await?;
                scheduler.run(shutdown_on_os_signal()).await
            }
            .await;

            agents_shutdown.trigger();
            while let Some(joined) = servers.join_next().await {
                match joined {
                    Ok(Ok(())) => {}
                    Ok(Err(e)) => warn!("Local agent failed: {:#}", e),
                    Err(e) => warn!("Local agent task panicked: {}", e),
                }
            }
            telemetry_task.await.context("Telemetry task panicked")?;

            let summary = result?;
            print_summary(&summary)?;

            if !dry_run {
                let snapshot = match &store_dir {
                    Some(dir) => JsonlStore::load(dir).await?,
                    None => memory.snapshot(),
                };
                println!("{}", Report::build(&snapshot, &ReportFilter::default()).render());
            }
        }

        Commands::Report {
            store,
            min_rt_size,
            instance_type,
            since,
            until,
            format,
        } => {
            let snapshot = JsonlStore::load(&store)
                .await
                .with_context(|| format!("Failed to load store {}", store.display()))?;
            let report = Report::build(
                &snapshot,
                &ReportFilter {
                    min_rt_size,
                    instance_type,
                    since,
                    until,
                },
            );
            if report.is_empty() {
                warn!("No records matched in {}", store.display());
            }

            match format {
                OutputFormat::Text => print!("{}", report.render()),
                OutputFormat::Json => println!("{}", serde_json::to_string_pretty(&report)?),
            }
        }
    }

    Ok(())
}

async fn schedule(config: ScheduleConfig) -> Result<RunSummary> {
    config.validate().context("Invalid schedule configuration")?;

    let store: Option<Arc<dyn Persistence>> = match (&config.store_dir, config.dry_run) {
        (Some(dir), false) => Some(Arc::new(
            JsonlStore::open(dir)
                .await
                .with_context(|| format!("Failed to open store {}", dir.display()))?,
        )),
        (None, false) => {
            warn!("No store directory configured, results are only logged");
            None
        }
        (_, true) => None,
    };

    let mut scheduler = Scheduler::new(config.scheduler_config(), config.fleet, store).await?;
    scheduler.run(shutdown_on_os_signal()).await
}

/// A shutdown signal that fires on SIGINT/SIGTERM.
fn shutdown_on_os_signal() -> ShutdownSignal {
    let shutdown = Shutdown::new();
    let signal = shutdown.to_signal();
    tokio::spawn(async move {
        os_signal().await;
        shutdown.trigger();
    });
    signal
}

fn print_summary(summary: &RunSummary) -> Result<()> {
    println!("{}", serde_json::to_string_pretty(summary)?);
    Ok(())
}
