//! Configuration system for gossip-consensus
//!
//! Supports multiple configuration sources with the following precedence (highest to lowest):
//! 1. CLI arguments
//! 2. Environment variables (GOSSIP_* prefix)
//! 3. Configuration file (TOML)
//! 4. Default values

use std::fs;
use std::net::{SocketAddr, ToSocketAddrs};
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use crate::agent::{AgentConfig, EngineConfig, MeshConfig};
use crate::error::{Error, Result};
use crate::master::MasterConfig;
use crate::protocol::DEFAULT_MAX_FRAME_BYTES;
use crate::topology::Token;
use crate::trainer::TrainerConfig;

/// Main configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ConsensusConfig {
    /// Rendezvous master settings
    pub master: MasterSettings,

    /// Consensus agent settings
    pub agent: AgentSettings,

    /// Timeouts and limits shared by every connection
    pub network: NetworkSettings,

    /// Telemetry aggregation
    pub telemetry: TelemetrySettings,

    /// Reference trainer driven by the `agent` command
    pub trainer: TrainerConfig,

    /// Logging configuration
    pub logging: LoggingSettings,
}

/// Master settings
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct MasterSettings {
    /// Address to accept agent connections on
    pub bind: String,

    /// Edge-list file describing the agent graph
    pub topology: String,

    /// Time a new connection has to send REGISTER, in milliseconds
    pub register_timeout_ms: u64,
}

/// Agent settings
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AgentSettings {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub token: Option<Token>,

    /// Address to accept peer connections on
    pub listen: String,

    /// Address neighbors should dial (defaults to `listen`)
    #[serde(skip_serializing_if = "Option::is_none")]
    pub advertise: Option<String>,

    /// Master address
    pub master: String,

    /// Number of agents in the network, used to size the data shard
    #[serde(skip_serializing_if = "Option::is_none")]
    pub total_agents: Option<usize>,

    /// Seed the initial parameters of every agent
    pub leader: bool,

    /// Residual below which a mixing step counts as converged
    pub epsilon: f32,

    /// Steps after which a converging round gives up
    pub round_cap: u32,

    /// Retries when a neighbor sends NaN or infinity
    pub max_poison_retries: u32,
}

/// Network settings
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct NetworkSettings {
    pub connect_timeout_ms: u64,
    pub handshake_timeout_ms: u64,
    pub initial_reconnect_delay_ms: u64,
    pub max_reconnect_delay_ms: u64,

    /// Master reconnection attempts (0 = infinite)
    pub max_reconnect_attempts: u32,

    /// Largest frame accepted on any connection
    pub max_frame_bytes: usize,

    /// Events buffered between peer readers and the mixing engine
    pub inbound_queue: usize,
}

/// Telemetry settings
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct TelemetrySettings {
    /// JSON-lines statistics output (empty = in memory only)
    #[serde(skip_serializing_if = "Option::is_none")]
    pub stats_file: Option<String>,

    /// Drop incomplete buckets older than this many seconds (0 = never)
    pub stale_bucket_secs: u64,

    /// Facts buffered ahead of the processor
    pub queue_size: usize,
}

/// Logging settings
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingSettings {
    /// Log level: trace, debug, info, warn, error
    pub level: String,

    /// Log file path (empty = no file logging)
    #[serde(skip_serializing_if = "Option::is_none")]
    pub file: Option<String>,

    /// Number of rotated log files to keep
    pub max_files: u32,

    /// Enable JSON formatted logging
    pub json_format: bool,
}

// ─────────────────────────────────────────────────────────────────
// Default implementations
// ─────────────────────────────────────────────────────────────────

impl Default for ConsensusConfig {
    fn default() -> Self {
        Self {
            master: MasterSettings::default(),
            agent: AgentSettings::default(),
            network: NetworkSettings::default(),
            telemetry: TelemetrySettings::default(),
            trainer: TrainerConfig::default(),
            logging: LoggingSettings::default(),
        }
    }
}

impl Default for MasterSettings {
    fn default() -> Self {
        Self {
            bind: "127.0.0.1:7000".to_string(),
            topology: "topology.txt".to_string(),
            register_timeout_ms: 30_000,
        }
    }
}

impl Default for AgentSettings {
    fn default() -> Self {
        let engine = EngineConfig::default();
        Self {
            token: None,
            listen: "127.0.0.1:0".to_string(),
            advertise: None,
            master: "127.0.0.1:7000".to_string(),
            total_agents: None,
            leader: false,
            epsilon: engine.epsilon,
            round_cap: engine.round_cap,
            max_poison_retries: engine.max_poison_retries,
        }
    }
}

impl Default for NetworkSettings {
    fn default() -> Self {
        Self {
            connect_timeout_ms: 10_000,
            handshake_timeout_ms: 10_000,
            initial_reconnect_delay_ms: 100,
            max_reconnect_delay_ms: 5_000,
            max_reconnect_attempts: 0,
            max_frame_bytes: DEFAULT_MAX_FRAME_BYTES,
            inbound_queue: 1024,
        }
    }
}

impl Default for TelemetrySettings {
    fn default() -> Self {
        Self {
            stats_file: None,
            stale_bucket_secs: 0,
            queue_size: 1024,
        }
    }
}

impl Default for LoggingSettings {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            file: None,
            max_files: 5,
            json_format: false,
        }
    }
}

impl ConsensusConfig {
    /// Load configuration from file with environment variable overrides
    pub fn load(config_path: Option<&str>) -> Result<Self> {
        let mut config = Self::default();

        // 1. Load from config file if it exists
        if let Some(path) = Self::find_config_file(config_path)? {
            config = Self::from_file(&path)?;
            info!(path = %path.display(), "Configuration loaded from file");
        }

        // 2. Apply environment variable overrides
        config.apply_env_overrides();

        // 3. Expand paths
        config.expand_paths();

        // 4. Validate
        config.validate()?;

        Ok(config)
    }

    /// Parse one TOML file without overrides or validation
    pub fn from_file(path: &Path) -> Result<Self> {
        debug!(path = %path.display(), "Loading configuration file");
        let content = fs::read_to_string(path).map_err(|source| Error::IoRead {
            path: path.to_path_buf(),
            source,
        })?;
        toml::from_str(&content).map_err(|e| Error::ConfigParse {
            message: format!("{}: {}", path.display(), e.message()),
            source: Some(e),
        })
    }

    /// Find the configuration file to use
    pub fn find_config_file(explicit_path: Option<&str>) -> Result<Option<PathBuf>> {
        // An explicit path must exist
        if let Some(path) = explicit_path {
            let path = PathBuf::from(expand_path(path));
            if path.exists() {
                return Ok(Some(path));
            }
            return Err(Error::ConfigNotFound { path });
        }

        let search_paths = [
            // Current directory
            Some(PathBuf::from("gossip-consensus.toml")),
            // User config directory
            dirs::config_dir().map(|p| p.join("gossip-consensus").join("config.toml")),
            // Home directory
            dirs::home_dir().map(|p| p.join(".gossip-consensus").join("config.toml")),
        ];

        for path in search_paths.into_iter().flatten() {
            if path.exists() {
                debug!(path = %path.display(), "Found configuration file");
                return Ok(Some(path));
            }
        }

        debug!("No configuration file found, using defaults");
        Ok(None)
    }

    /// Apply environment variable overrides
    pub fn apply_env_overrides(&mut self) {
        // Master settings
        if let Ok(val) = std::env::var("GOSSIP_MASTER_BIND") {
            self.master.bind = val;
        }
        if let Ok(val) = std::env::var("GOSSIP_TOPOLOGY") {
            self.master.topology = val;
        }

        // Agent settings
        if let Some(n) = env_parse("GOSSIP_AGENT_TOKEN") {
            self.agent.token = Some(n);
        }
        if let Ok(val) = std::env::var("GOSSIP_AGENT_LISTEN") {
            self.agent.listen = val;
        }
        if let Ok(val) = std::env::var("GOSSIP_AGENT_ADVERTISE") {
            self.agent.advertise = Some(val);
        }
        if let Ok(val) = std::env::var("GOSSIP_MASTER_ADDR") {
            self.agent.master = val;
        }
        if let Some(n) = env_parse("GOSSIP_TOTAL_AGENTS") {
            self.agent.total_agents = Some(n);
        }
        if let Ok(val) = std::env::var("GOSSIP_LEADER") {
            self.agent.leader = env_flag(&val);
        }
        if let Some(n) = env_parse("GOSSIP_EPSILON") {
            self.agent.epsilon = n;
        }
        if let Some(n) = env_parse("GOSSIP_ROUND_CAP") {
            self.agent.round_cap = n;
        }

        // Network settings
        if let Some(n) = env_parse("GOSSIP_CONNECT_TIMEOUT_MS") {
            self.network.connect_timeout_ms = n;
        }
        if let Some(n) = env_parse("GOSSIP_MAX_RECONNECT_ATTEMPTS") {
            self.network.max_reconnect_attempts = n;
        }
        if let Some(n) = env_parse("GOSSIP_MAX_FRAME_BYTES") {
            self.network.max_frame_bytes = n;
        }

        // Telemetry settings
        if let Ok(val) = std::env::var("GOSSIP_STATS_FILE") {
            self.telemetry.stats_file = Some(val);
        }
        if let Some(n) = env_parse("GOSSIP_STALE_BUCKET_SECS") {
            self.telemetry.stale_bucket_secs = n;
        }

        // Logging settings
        if let Ok(val) = std::env::var("GOSSIP_LOG_LEVEL") {
            self.logging.level = val;
        }
        if let Ok(val) = std::env::var("GOSSIP_LOG_FILE") {
            self.logging.file = Some(val);
        }
        if let Ok(val) = std::env::var("GOSSIP_LOG_JSON") {
            self.logging.json_format = env_flag(&val);
        }
    }

    /// Expand ~ and environment variables in paths
    pub fn expand_paths(&mut self) {
        self.master.topology = expand_path(&self.master.topology);
        if let Some(ref file) = self.telemetry.stats_file {
            self.telemetry.stats_file = Some(expand_path(file));
        }
        if let Some(ref file) = self.logging.file {
            self.logging.file = Some(expand_path(file));
        }
    }

    /// Validate the configuration
    pub fn validate(&self) -> Result<()> {
        for (field, value) in [
            ("master.bind", &self.master.bind),
            ("agent.listen", &self.agent.listen),
            ("agent.master", &self.agent.master),
        ] {
            if value.trim().is_empty() {
                return Err(Error::config_field_invalid(field, "address cannot be empty"));
            }
        }
        if self.master.topology.trim().is_empty() {
            return Err(Error::config_field_invalid("master.topology", "path cannot be empty"));
        }

        if !(self.agent.epsilon > 0.0) {
            return Err(Error::config_field_invalid("agent.epsilon", "epsilon must be positive"));
        }
        if self.agent.round_cap == 0 {
            return Err(Error::config_field_invalid("agent.round_cap", "round cap must be at least 1"));
        }
        if self.agent.total_agents == Some(0) {
            return Err(Error::config_field_invalid("agent.total_agents", "must be positive"));
        }

        if self.network.max_frame_bytes < 16 {
            return Err(Error::config_field_invalid("network.max_frame_bytes", "frame limit is too small"));
        }

        if self.trainer.batch_size == 0 {
            return Err(Error::config_field_invalid("trainer.batch_size", "batch size must be positive"));
        }
        if !(self.trainer.noise >= 0.0) {
            return Err(Error::config_field_invalid("trainer.noise", "noise must not be negative"));
        }

        // Validate log level
        let valid_levels = ["trace", "debug", "info", "warn", "error"];
        if !valid_levels.contains(&self.logging.level.to_lowercase().as_str()) {
            return Err(Error::config_field_invalid(
                "logging.level",
                format!(
                    "Invalid log level '{}'. Must be one of: {}",
                    self.logging.level,
                    valid_levels.join(", ")
                ),
            ));
        }

        Ok(())
    }

    /// Master server settings
    pub fn master_config(&self) -> MasterConfig {
        MasterConfig {
            max_frame_bytes: self.network.max_frame_bytes,
            register_timeout: Duration::from_millis(self.master.register_timeout_ms),
            telemetry_queue: self.telemetry.queue_size,
        }
    }

    /// Agent settings; the token must be set by now
    pub fn agent_config(&self) -> Result<AgentConfig> {
        let token = self
            .agent
            .token
            .ok_or_else(|| Error::config_field_invalid("agent.token", "an agent token is required"))?;
        let listen = resolve_addr("agent.listen", &self.agent.listen)?;
        let master = resolve_addr("agent.master", &self.agent.master)?;
        let advertise = self
            .agent
            .advertise
            .as_deref()
            .map(|a| resolve_addr("agent.advertise", a))
            .transpose()?;

        let network = &self.network;
        let mut config = AgentConfig::new(token, listen, master);
        config.advertise = advertise;
        config.master_connect_timeout = Duration::from_millis(network.connect_timeout_ms);
        config.max_reconnect_attempts = network.max_reconnect_attempts;
        config.engine = EngineConfig {
            epsilon: self.agent.epsilon,
            round_cap: self.agent.round_cap,
            max_poison_retries: self.agent.max_poison_retries,
        };
        config.mesh = MeshConfig {
            connect_timeout: Duration::from_millis(network.connect_timeout_ms),
            handshake_timeout: Duration::from_millis(network.handshake_timeout_ms),
            initial_reconnect_delay: Duration::from_millis(network.initial_reconnect_delay_ms),
            max_reconnect_delay: Duration::from_millis(network.max_reconnect_delay_ms),
            max_frame_bytes: network.max_frame_bytes,
            inbound_queue: network.inbound_queue,
        };
        Ok(config)
    }

    /// Staleness limit for telemetry buckets
    pub fn stale_after(&self) -> Option<Duration> {
        (self.telemetry.stale_bucket_secs > 0).then(|| Duration::from_secs(self.telemetry.stale_bucket_secs))
    }
}

/// Resolve `host:port`, accepting hostnames
pub fn resolve_addr(field: &str, value: &str) -> Result<SocketAddr> {
    if let Ok(addr) = value.parse() {
        return Ok(addr);
    }
    value
        .to_socket_addrs()
        .ok()
        .and_then(|mut addrs| addrs.next())
        .ok_or_else(|| Error::config_field_invalid(field, format!("'{}' is not a valid address", value)))
}

fn env_parse<T: std::str::FromStr>(key: &str) -> Option<T> {
    std::env::var(key).ok().and_then(|v| v.parse().ok())
}

fn env_flag(val: &str) -> bool {
    val.eq_ignore_ascii_case("true") || val == "1"
}

/// Expand ~ and environment variables in paths
fn expand_path(path: &str) -> String {
    shellexpand::full(path)
        .unwrap_or_else(|_| std::borrow::Cow::Borrowed(path))
        .into_owned()
}

/// Default location for `config init`
pub fn default_config_path() -> PathBuf {
    dirs::home_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join(".gossip-consensus")
        .join("config.toml")
}

/// Initialize a new configuration file
pub fn init_config(path: Option<&str>, force: bool) -> Result<PathBuf> {
    let config_path = path
        .map(|p| PathBuf::from(expand_path(p)))
        .unwrap_or_else(default_config_path);

    if config_path.exists() && !force {
        return Err(Error::config_validation(format!(
            "Configuration file already exists: {}. Use --force to overwrite.",
            config_path.display()
        )));
    }

    if let Some(parent) = config_path.parent().filter(|p| !p.as_os_str().is_empty()) {
        fs::create_dir_all(parent).map_err(|source| Error::IoWrite {
            path: parent.to_path_buf(),
            source,
        })?;
    }

    fs::write(&config_path, generate_default_config()).map_err(|source| Error::IoWrite {
        path: config_path.clone(),
        source,
    })?;

    Ok(config_path)
}

/// Generate default configuration content with comments
pub fn generate_default_config() -> String {
    r#"# gossip-consensus configuration

[master]
# Address to accept agent connections on
bind = "127.0.0.1:7000"

# Edge list, one "u v" pair per line
topology = "topology.txt"

# Time a new connection has to send REGISTER (milliseconds)
register_timeout_ms = 30000

[agent]
# Token of this agent in the topology
# token = 0

# Address to accept peer connections on (port 0 = auto-assign)
listen = "127.0.0.1:0"

# Address neighbors should dial, if different from listen
# advertise = "10.0.0.5:7100"

# Master address
master = "127.0.0.1:7000"

# Number of agents, used to size the local data shard
# total_agents = 4

# Seed every agent's initial parameters from this one
leader = false

# Residual below which a mixing step counts as converged
epsilon = 0.0001

# Steps after which a converging round gives up
round_cap = 2000

# Retries when a neighbor sends NaN or infinity
max_poison_retries = 3

[network]
connect_timeout_ms = 10000
handshake_timeout_ms = 10000
initial_reconnect_delay_ms = 100
max_reconnect_delay_ms = 5000

# Master reconnection attempts (0 = infinite)
max_reconnect_attempts = 0

# Largest frame accepted on any connection (256 MiB)
max_frame_bytes = 268435456

inbound_queue = 1024

[telemetry]
# JSON-lines statistics output (comment out to keep records in memory only)
# stats_file = "~/.gossip-consensus/stats.jsonl"

# Drop incomplete buckets older than this many seconds (0 = never)
stale_bucket_secs = 0

queue_size = 1024

[trainer]
epochs = 3
dataset_size = 50000
batch_size = 32
dimension = 1024
learning_rate = 0.1
noise = 0.01
seed = 239

# Report parameters every N batches (0 = never)
telemetry_every = 10

[logging]
# Log level: trace, debug, info, warn, error
level = "info"

# Log file path (comment out to disable file logging)
# file = "~/.gossip-consensus/logs/gossip.log"

# Number of rotated log files to keep
max_files = 5

# Enable JSON formatted logging
json_format = false
"#
    .to_string()
}
