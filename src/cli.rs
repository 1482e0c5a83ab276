//! CLI argument parsing using clap v4

use std::path::PathBuf;

use clap::{Args, Parser, Subcommand};

use crate::config::ConsensusConfig;
use crate::topology::Token;

/// Gossip consensus - rendezvous master and averaging agents
///
/// The master hands every agent its neighbors and aggregates telemetry;
/// agents average their parameter vectors with their neighbors directly.
#[derive(Parser, Debug)]
#[command(name = "gossip-consensus")]
#[command(author, version, about, long_about = None)]
#[command(propagate_version = true)]
pub struct Cli {
    /// Increase logging verbosity (-v for debug, -vv for trace)
    #[arg(short, long, action = clap::ArgAction::Count, global = true)]
    pub verbose: u8,

    /// Suppress all output except errors
    #[arg(short, long, global = true)]
    pub quiet: bool,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Run the rendezvous master
    Master(MasterArgs),

    /// Run one consensus agent with the reference trainer
    Agent(AgentArgs),

    /// Configuration management
    Config {
        #[command(subcommand)]
        subcommand: ConfigSubcommand,
    },

    /// Display version and build information
    Version,
}

#[derive(Args, Debug, Clone, Default)]
pub struct MasterArgs {
    /// Path to configuration file
    #[arg(short, long, env = "GOSSIP_CONFIG")]
    pub config: Option<String>,

    /// Address to listen on (host:port)
    #[arg(long)]
    pub bind: Option<String>,

    /// Topology edge-list file
    #[arg(long)]
    pub topology: Option<PathBuf>,

    /// Append aggregated statistics to this JSON-lines file
    #[arg(long)]
    pub stats: Option<PathBuf>,
}

#[derive(Args, Debug, Clone, Default)]
pub struct AgentArgs {
    /// Path to configuration file
    #[arg(short, long, env = "GOSSIP_CONFIG")]
    pub config: Option<String>,

    /// This agent's token in the topology
    #[arg(long)]
    pub token: Option<Token>,

    /// Address to accept peer connections on (host:port)
    #[arg(long)]
    pub listen: Option<String>,

    /// Master address (host:port)
    #[arg(long)]
    pub master: Option<String>,

    /// Number of agents in the network
    #[arg(long)]
    pub total_agents: Option<usize>,

    /// Seed every agent's initial parameters from this one
    #[arg(long)]
    pub leader: bool,

    /// Convergence threshold for the initial averaging round
    #[arg(long)]
    pub epsilon: Option<f32>,

    /// Step cap for the initial averaging round
    #[arg(long)]
    pub steps: Option<u32>,
}

/// Configuration subcommands
#[derive(Subcommand, Debug, Clone)]
pub enum ConfigSubcommand {
    /// Display the current configuration
    Show {
        /// Path to configuration file
        #[arg(short, long)]
        config: Option<String>,
    },

    /// Initialize a new configuration file
    Init {
        /// Path where to create the config file
        #[arg(short, long)]
        path: Option<String>,

        /// Overwrite existing configuration
        #[arg(short, long)]
        force: bool,
    },

    /// Validate a configuration file
    Validate {
        /// Path to configuration file to validate
        #[arg(short, long)]
        config: Option<String>,
    },
}

impl MasterArgs {
    /// CLI values take precedence over file and environment
    pub fn apply(&self, config: &mut ConsensusConfig) {
        if let Some(ref bind) = self.bind {
            config.master.bind = bind.clone();
        }
        if let Some(ref topology) = self.topology {
            config.master.topology = topology.display().to_string();
        }
        if let Some(ref stats) = self.stats {
            config.telemetry.stats_file = Some(stats.display().to_string());
        }
    }
}

impl AgentArgs {
    pub fn apply(&self, config: &mut ConsensusConfig) {
        if let Some(token) = self.token {
            config.agent.token = Some(token);
        }
        if let Some(ref listen) = self.listen {
            config.agent.listen = listen.clone();
        }
        if let Some(ref master) = self.master {
            config.agent.master = master.clone();
        }
        if let Some(n) = self.total_agents {
            config.agent.total_agents = Some(n);
        }
        if self.leader {
            config.agent.leader = true;
        }
        if let Some(epsilon) = self.epsilon {
            config.agent.epsilon = epsilon;
        }
        if let Some(steps) = self.steps {
            config.agent.round_cap = steps;
        }
    }
}
