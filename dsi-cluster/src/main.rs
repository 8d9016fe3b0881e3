//! cluster-setup
//!
//! Starts, restarts, stops and tears down the clusters described in a setup
//! configuration, running the configured command phases around them.

use anyhow::{Context, Result, bail};
use clap::{Parser, Subcommand, ValueEnum};
use std::path::PathBuf;
use std::sync::Arc;
use tracing::{error, info, warn};

use dsi_cluster::host::HostFactory;
use dsi_cluster::logging::init_tracing;
use dsi_cluster::{
    ClusterRestart, ClusterSetup, CommandDispatcher, FailurePolicy, NodeFilter, SetupConfig,
    ShellHostFactory,
};

#[derive(Parser)]
#[command(name = "cluster-setup")]
#[command(about = "Start the configured clusters in a distributed environment", long_about = None)]
#[command(version)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Path to the setup configuration
    #[arg(short, long, global = true, default_value = "cluster_setup.yml")]
    config: PathBuf,

    /// Enable debug output
    #[arg(short, long, global = true)]
    debug: bool,

    /// Append log output to this file instead of stdout
    #[arg(long, global = true)]
    log_file: Option<PathBuf>,
}

#[derive(Subcommand)]
enum Commands {
    /// Kill leftovers and start every cluster from scratch
    Start,

    /// Stop and start again, optionally on a subset of nodes
    Restart {
        /// Wipe data directories (defaults to the configured value)
        #[arg(long)]
        clean_db_dir: Option<bool>,

        /// Wipe logs and diagnostic data (defaults to the configured value)
        #[arg(long)]
        clean_logs: Option<bool>,

        /// Restrict the restart to these node, replica set or cluster ids
        #[arg(long, value_delimiter = ',')]
        nodes: Vec<String>,
    },

    /// Graceful shutdown
    Shutdown {
        #[arg(long, value_delimiter = ',')]
        nodes: Vec<String>,
    },

    /// Kill every cluster process
    Destroy {
        #[arg(long, value_delimiter = ',')]
        nodes: Vec<String>,
    },

    /// Run one command phase (e.g. post_cluster_start)
    RunCommands {
        phase: String,

        /// What a failing entry does to the rest of the phase
        #[arg(long, value_enum, default_value = "reraise")]
        on_failure: PolicyArg,
    },
}

#[derive(Clone, Copy, ValueEnum)]
enum PolicyArg {
    Continue,
    Reraise,
    Exit,
}

impl From<PolicyArg> for FailurePolicy {
    fn from(policy: PolicyArg) -> Self {
        match policy {
            PolicyArg::Continue => FailurePolicy::Continue,
            PolicyArg::Reraise => FailurePolicy::Reraise,
            PolicyArg::Exit => FailurePolicy::Exit,
        }
    }
}

fn node_filter(nodes: Vec<String>) -> NodeFilter {
    if nodes.is_empty() {
        NodeFilter::all()
    } else {
        NodeFilter::only(nodes)
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let config = Arc::new(
        SetupConfig::from_file(&cli.config)
            .with_context(|| format!("Failed to load {}", cli.config.display()))?,
    );
    init_tracing(&config.logging, cli.log_file.as_deref(), cli.debug)
        .context("Failed to initialize logging")?;

    info!("Starting cluster-setup v{}", env!("CARGO_PKG_VERSION"));

    let hosts: Arc<dyn HostFactory> = Arc::new(ShellHostFactory::new(
        config.ssh.clone(),
        config.control_shell(),
    ));
    let setup = Arc::new(
        ClusterSetup::new(Arc::clone(&config), Arc::clone(&hosts))
            .context("Invalid topology")?,
    );
    let restart: Arc<dyn ClusterRestart> = Arc::clone(&setup) as _;
    let dispatcher = CommandDispatcher::new(&config, hosts, setup.host_groups(), Some(restart))
        .context("Invalid command configuration")?;

    // Delays are normally removed after each run, unless that run died
    dispatcher.reset_all_delays().await;

    let outcome = run(cli.command, &config, &setup, &dispatcher).await;
    setup.close().await;
    outcome
}

async fn run(
    command: Commands,
    config: &SetupConfig,
    setup: &ClusterSetup,
    dispatcher: &CommandDispatcher,
) -> Result<()> {
    match command {
        Commands::Start => {
            let started = matches!(setup.start(dispatcher).await, Ok(true));
            if !started {
                error!("Error in cluster_setup");
                warn!("Attempting to execute error handling tasks");
                if let Err(e) = dispatcher
                    .run_upon_error("cluster_setup", FailurePolicy::Exit)
                    .await
                {
                    error!("upon_error failed: {}", e);
                }
                setup.close().await;
                std::process::exit(1);
            }
            info!("All clusters started");
        }

        Commands::Restart {
            clean_db_dir,
            clean_logs,
            nodes,
        } => {
            let filter = node_filter(nodes);
            if !setup
                .restart(clean_db_dir, clean_logs, &filter)
                .await
                .context("Restart refused")?
            {
                bail!("Restart failed");
            }
            info!("Restart completed");
        }

        Commands::Shutdown { nodes } => {
            let filter = node_filter(nodes);
            if !setup
                .shutdown(config.timeouts.shutdown(), None, &filter)
                .await
            {
                bail!("Shutdown failed");
            }
        }

        Commands::Destroy { nodes } => {
            let filter = node_filter(nodes);
            if !setup.destroy(config.timeouts.sigterm(), &filter).await {
                bail!("Destroy failed");
            }
        }

        Commands::RunCommands { phase, on_failure } => {
            dispatcher
                .run_phase(&phase, on_failure.into())
                .await
                .with_context(|| format!("Phase {} failed", phase))?;
        }
    }

    Ok(())
}
