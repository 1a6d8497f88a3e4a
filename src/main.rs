//! Cluster Storage Orchestrator
//!
//! Runs storage commands read from a JSON file against a hypervisor
//! cluster and prints one answer per command. In standalone mode the
//! cluster is simulated in memory.

use anyhow::{bail, Context};
use clap::Parser;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{info, warn, Level};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

use cluster_storage_orchestrator::{
    OrchestratorConfig, OrchestratorContext, SessionPool, SimulatedCluster, StorageCommand, StorageOrchestrator,
};

// =============================================================================
// CLI Arguments
// =============================================================================

/// Cluster Storage Orchestrator - volumes, templates and snapshots on hypervisor clusters
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// YAML configuration file
    #[arg(long, env = "ORCHESTRATOR_CONFIG")]
    config: Option<PathBuf>,

    /// JSON file holding one command or an array of commands
    #[arg(long, env = "ORCHESTRATOR_COMMAND")]
    command: PathBuf,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, env = "LOG_LEVEL", default_value = "info")]
    log_level: String,

    /// Output logs as JSON
    #[arg(long, env = "LOG_JSON")]
    log_json: bool,

    /// Run against a simulated cluster
    #[arg(long, env = "STANDALONE")]
    standalone: bool,

    /// Cluster name of the simulated cluster
    #[arg(long, env = "SIM_CLUSTER", default_value = "cluster1")]
    cluster: String,

    /// Number of hosts in the simulated cluster
    #[arg(long, env = "SIM_HOSTS", default_value = "3")]
    hosts: usize,

    /// Shared local datastore of the simulated cluster
    #[arg(long, env = "SIM_DATASTORE", default_value = "datastore1")]
    datastore: String,

    /// Print the metrics exposition after the last command
    #[arg(long, env = "PRINT_METRICS")]
    print_metrics: bool,
}

// =============================================================================
// Main
// =============================================================================

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    init_logging(&args);

    info!("Starting Cluster Storage Orchestrator");
    info!("  Version: {}", cluster_storage_orchestrator::VERSION);
    info!("  Standalone mode: {}", args.standalone);

    let config = match &args.config {
        Some(path) => OrchestratorConfig::load(path)
            .with_context(|| format!("loading configuration from {}", path.display()))?,
        None => OrchestratorConfig::default(),
    };
    let commands = read_commands(&args.command)?;
    info!("Loaded {} command(s) from {}", commands.len(), args.command.display());

    if !args.standalone {
        bail!("no hypervisor connector is built in; run with --standalone to use the simulated cluster");
    }

    let sim = SimulatedCluster::builder()
        .cluster(&args.cluster, args.hosts)
        .local_datastore(&args.datastore, &args.cluster, 4 << 40)
        .build();
    info!(
        "Simulated cluster {} with {} hosts and datastore {}",
        args.cluster, args.hosts, args.datastore
    );

    let pool = Arc::new(SessionPool::new(Arc::new(sim.clone())));
    pool.open();
    let context = OrchestratorContext::new(config.endpoint.clone(), pool.clone());
    let orchestrator = StorageOrchestrator::new(config, context)?;

    let mut failures = 0;
    for command in commands {
        let answer = orchestrator.execute(command).await;
        if !answer.success {
            failures += 1;
        }
        println!("{}", serde_json::to_string_pretty(&answer)?);
    }

    if args.print_metrics {
        print!("{}", orchestrator.metrics().render()?);
    }

    pool.close();
    if failures > 0 {
        warn!("{} command(s) failed", failures);
        bail!("{} command(s) failed", failures);
    }
    info!("All commands completed");
    Ok(())
}

fn read_commands(path: &Path) -> anyhow::Result<Vec<StorageCommand>> {
    let text = std::fs::read_to_string(path).with_context(|| format!("reading {}", path.display()))?;
    let value: serde_json::Value =
        serde_json::from_str(&text).with_context(|| format!("parsing {}", path.display()))?;

    let commands = if value.is_array() {
        serde_json::from_value(value)?
    } else {
        vec![serde_json::from_value(value)?]
    };
    Ok(commands)
}

// =============================================================================
// Logging Setup
// =============================================================================

fn init_logging(args: &Args) {
    let level = match args.log_level.to_lowercase().as_str() {
        "trace" => Level::TRACE,
        "debug" => Level::DEBUG,
        "info" => Level::INFO,
        "warn" => Level::WARN,
        "error" => Level::ERROR,
        _ => Level::INFO,
    };

    let filter = EnvFilter::from_default_env().add_directive(level.into());

    // Answers go to stdout, so logs go to stderr
    if args.log_json {
        tracing_subscriber::registry()
            .with(filter)
            .with(fmt::layer().json().with_writer(std::io::stderr))
            .init();
    } else {
        tracing_subscriber::registry()
            .with(filter)
            .with(fmt::layer().with_target(true).with_writer(std::io::stderr))
            .init();
    }
}
