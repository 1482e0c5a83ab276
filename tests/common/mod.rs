//! Common test utilities and fixtures
//!
//! This module provides shared test infrastructure

#![allow(dead_code)]

use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;

use gossip_consensus::agent::{AgentConfig, ConsensusAgent};
use gossip_consensus::master::{self, MasterConfig, MasterHandle};
use gossip_consensus::telemetry::{TelemetryError, TelemetryFact, TelemetryProcessor};
use gossip_consensus::topology::{Token, Topology};

/// Get the path to the test fixtures directory
pub fn fixtures_dir() -> PathBuf {
    PathBuf::from(env!("CARGO_MANIFEST_DIR"))
        .join("tests")
        .join("fixtures")
}

/// Get a path to a specific fixture file
pub fn fixture_path(name: &str) -> PathBuf {
    fixtures_dir().join(name)
}

pub fn valid_config_fixture() -> PathBuf {
    fixture_path("valid_config.toml")
}

pub fn invalid_config_fixture() -> PathBuf {
    fixture_path("invalid_config.toml")
}

pub fn any_local() -> SocketAddr {
    SocketAddr::from(([127, 0, 0, 1], 0))
}

/// Upper bound for anything a test waits on
pub const TEST_TIMEOUT: Duration = Duration::from_secs(20);

// ─────────────────────────────────────────────────────────────────
// Telemetry
// ─────────────────────────────────────────────────────────────────

/// Processor that keeps every fact it is handed
#[derive(Clone, Default)]
pub struct RecordingProcessor {
    facts: Arc<Mutex<Vec<(Token, TelemetryFact)>>>,
}

impl RecordingProcessor {
    pub fn facts(&self) -> Vec<(Token, TelemetryFact)> {
        self.facts.lock().clone()
    }

    /// Poll until `n` facts arrived or the test timeout passes
    pub async fn wait_for(&self, n: usize) -> Vec<(Token, TelemetryFact)> {
        let deadline = tokio::time::Instant::now() + TEST_TIMEOUT;
        loop {
            let facts = self.facts();
            if facts.len() >= n || tokio::time::Instant::now() > deadline {
                return facts;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    }
}

impl TelemetryProcessor for RecordingProcessor {
    fn process(&mut self, token: Token, payload: TelemetryFact) -> Result<(), TelemetryError> {
        self.facts.lock().push((token, payload));
        Ok(())
    }
}

// ─────────────────────────────────────────────────────────────────
// Network fixtures
// ─────────────────────────────────────────────────────────────────

/// Master on an ephemeral port with a recording processor
pub async fn start_master(edges: &str) -> (MasterHandle, RecordingProcessor) {
    let topology = Topology::parse(edges).unwrap();
    let processor = RecordingProcessor::default();
    let handle = master::start(any_local(), topology, processor.clone(), MasterConfig::default())
        .await
        .unwrap();
    (handle, processor)
}

pub fn agent_config(token: Token, master: SocketAddr) -> AgentConfig {
    let mut config = AgentConfig::new(token, any_local(), master);
    config.mesh.initial_reconnect_delay = Duration::from_millis(20);
    config.mesh.max_reconnect_delay = Duration::from_millis(200);
    config
}

/// Bind and start serving one agent per token
pub async fn start_agents(tokens: &[Token], master: SocketAddr) -> Vec<Arc<ConsensusAgent>> {
    let mut agents = Vec::new();
    for &token in tokens {
        let agent = ConsensusAgent::bind(agent_config(token, master)).await.unwrap();
        agent.serve();
        agents.push(Arc::new(agent));
    }
    agents
}

/// Run `f` on every agent concurrently and collect the results in order
pub async fn run_all<F, Fut, R>(agents: &[Arc<ConsensusAgent>], f: F) -> Vec<R>
where
    F: Fn(usize, Arc<ConsensusAgent>) -> Fut,
    Fut: std::future::Future<Output = R> + Send + 'static,
    R: Send + 'static,
{
    let handles: Vec<_> = agents
        .iter()
        .enumerate()
        .map(|(i, agent)| tokio::spawn(f(i, Arc::clone(agent))))
        .collect();

    let mut results = Vec::new();
    for handle in handles {
        let joined = tokio::time::timeout(TEST_TIMEOUT, handle).await.expect("agent task timed out");
        results.push(joined.expect("agent task panicked"));
    }
    results
}

pub async fn shutdown_all(agents: &[Arc<ConsensusAgent>]) {
    for agent in agents {
        agent.shutdown().await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_fixtures_exist() {
        assert!(valid_config_fixture().exists());
        assert!(invalid_config_fixture().exists());
        assert!(fixture_path("ring.txt").exists());
    }
}
