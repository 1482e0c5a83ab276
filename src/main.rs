//! gossip-consensus binary
//!
//! `master` runs the rendezvous server with the statistics processor;
//! `agent` runs one consensus agent driving the reference trainer.

use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use clap::Parser;
use tracing::{info, warn};

use gossip_consensus::agent::ConsensusAgent;
use gossip_consensus::cli::{Cli, Commands, ConfigSubcommand};
use gossip_consensus::config::{self, resolve_addr, ConsensusConfig};
use gossip_consensus::error::{Error, Result};
use gossip_consensus::logging::{self, LogGuards};
use gossip_consensus::telemetry::{AggregatingProcessor, StatisticsSink};
use gossip_consensus::topology::Topology;
use gossip_consensus::trainer::{run_training, SyntheticTrainer};
use gossip_consensus::{master, version};

/// Time a finished agent keeps its links open so neighbors receive its last vector
const FINISH_GRACE: Duration = Duration::from_secs(2);

fn main() {
    let cli = Cli::parse();

    if let Err(e) = run(cli) {
        eprint!("{}", e.format_for_terminal());
        std::process::exit(e.exit_code());
    }
}

fn run(cli: Cli) -> Result<()> {
    match cli.command {
        Commands::Version => {
            version::print_version();
            Ok(())
        }
        Commands::Config { subcommand } => {
            logging::init_simple(tracing::Level::WARN)?;
            handle_config_command(subcommand)
        }
        Commands::Master(args) => {
            let mut config = ConsensusConfig::load(args.config.as_deref())?;
            args.apply(&mut config);
            config.expand_paths();
            config.validate()?;
            let _log_guards = init_logging(&config, cli.verbose, cli.quiet)?;
            runtime()?.block_on(run_master(config))
        }
        Commands::Agent(args) => {
            let mut config = ConsensusConfig::load(args.config.as_deref())?;
            args.apply(&mut config);
            config.validate()?;
            let _log_guards = init_logging(&config, cli.verbose, cli.quiet)?;
            runtime()?.block_on(run_agent(config))
        }
    }
}

fn init_logging(config: &ConsensusConfig, verbose: u8, quiet: bool) -> Result<LogGuards> {
    let guards = logging::init_logging(&config.logging, verbose, quiet)?;

    let build = version::build_info();
    info!(
        version = %build.full_version(),
        target = %build.target,
        profile = %build.profile,
        "Starting gossip-consensus"
    );
    Ok(guards)
}

fn runtime() -> Result<tokio::runtime::Runtime> {
    tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .worker_threads(num_cpus::get().clamp(2, 8))
        .thread_name("gossip-consensus")
        .build()
        .map_err(|e| Error::Internal(format!("Failed to create async runtime: {}", e)))
}

async fn run_master(config: ConsensusConfig) -> Result<()> {
    let topology = Topology::load(Path::new(&config.master.topology))?;
    let bind = resolve_addr("master.bind", &config.master.bind)?;

    let sink = match config.telemetry.stats_file {
        Some(ref path) => StatisticsSink::with_file(Path::new(path))?,
        None => StatisticsSink::in_memory(),
    };
    let processor = AggregatingProcessor::new(topology.agents(), sink).with_stale_after(config.stale_after());

    info!(
        topology = %config.master.topology,
        stats_file = ?config.telemetry.stats_file,
        stale_bucket_secs = config.telemetry.stale_bucket_secs,
        "Master configuration loaded"
    );

    let handle = master::start(bind, topology, processor, config.master_config()).await?;
    let stop = handle.shutdown_token();

    tokio::select! {
        _ = tokio::signal::ctrl_c() => {
            info!("Shutdown signal received");
        }
        _ = stop.cancelled() => {}
    }
    handle.shutdown().await;
    Ok(())
}

async fn run_agent(config: ConsensusConfig) -> Result<()> {
    let agent_config = config.agent_config()?;
    let agent = Arc::new(ConsensusAgent::bind(agent_config).await?);
    agent.serve();

    info!(
        token = agent.token(),
        listen = %agent.local_addr(),
        advertise = %agent.advertised_addr(),
        master = %config.agent.master,
        leader = config.agent.leader,
        "Agent listening"
    );

    let training = {
        let agent = Arc::clone(&agent);
        let config = config.clone();
        async move {
            let table = agent.register().await?;
            let total_agents = config.agent.total_agents.unwrap_or(table.agent_count);
            if total_agents != table.agent_count {
                warn!(
                    configured = total_agents,
                    topology = table.agent_count,
                    "Agent count differs from the topology"
                );
            }
            let mut trainer = SyntheticTrainer::new(agent.token(), total_agents, &config.trainer)?;
            run_training(&*agent, &mut trainer, &config.trainer, config.agent.leader).await
        }
    };

    let result = tokio::select! {
        _ = tokio::signal::ctrl_c() => {
            info!("Shutdown signal received");
            Ok(false)
        }
        summary = training => summary.map(|summary| {
            info!(
                batches = summary.batches,
                skipped_mixes = summary.skipped_mixes,
                final_loss = summary.final_loss,
                initial_round_converged = summary.initial_round_converged,
                "Training finished"
            );
            true
        }),
    };

    if let Ok(true) = result {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {}
            _ = tokio::time::sleep(FINISH_GRACE) => {}
        }
    }
    agent.shutdown().await;
    result.map(|_| ())
}

fn handle_config_command(subcommand: ConfigSubcommand) -> Result<()> {
    match subcommand {
        ConfigSubcommand::Show { config } => {
            let cfg = ConsensusConfig::load(config.as_deref())?;
            println!("{}", toml::to_string_pretty(&cfg)?);
        }
        ConfigSubcommand::Init { path, force } => {
            let path = config::init_config(path.as_deref(), force)?;
            println!("Configuration written to {}", path.display());
        }
        ConfigSubcommand::Validate { config } => {
            ConsensusConfig::load(config.as_deref())?;
            println!("Configuration is valid.");
        }
    }

    Ok(())
}
