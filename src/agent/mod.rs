//! Consensus agent
//!
//! An agent registers with the master, learns its neighbors, and then mixes
//! its parameter vector with theirs. Parameter vectors only travel on the
//! peer links; the master connection carries registration and telemetry.

mod client;
mod engine;
mod mesh;
pub mod mixing;

pub use client::{ConnectionState, MasterClient, MasterClientConfig};
pub use engine::{EngineConfig, GossipEngine, RoundOutcome};
pub use mesh::{InboundEvent, MeshConfig, PeerMesh, PeerTransport, TcpTransport};

use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::sync::{Arc, OnceLock};
use std::time::Duration;

use tokio::sync::OnceCell;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use crate::error::{Error, Result};
use crate::protocol::{NeighborTable, TelemetryFact};
use crate::topology::Token;

/// Agent configuration
#[derive(Debug, Clone)]
pub struct AgentConfig {
    pub token: Token,

    /// Address to accept peer connections on
    pub listen: SocketAddr,

    /// Address neighbors should dial; derived from `listen` when unset
    pub advertise: Option<SocketAddr>,

    /// Master address
    pub master: SocketAddr,

    pub master_connect_timeout: Duration,

    /// Master reconnection attempts before giving up (0 = infinite)
    pub max_reconnect_attempts: u32,

    pub engine: EngineConfig,
    pub mesh: MeshConfig,
}

impl AgentConfig {
    pub fn new(token: Token, listen: SocketAddr, master: SocketAddr) -> Self {
        Self {
            token,
            listen,
            advertise: None,
            master,
            master_connect_timeout: Duration::from_secs(10),
            max_reconnect_attempts: 0,
            engine: EngineConfig::default(),
            mesh: MeshConfig::default(),
        }
    }
}

/// One participant in the gossip network
pub struct ConsensusAgent<T: PeerTransport = TcpTransport> {
    config: AgentConfig,
    advertised: SocketAddr,
    mesh: Arc<PeerMesh<T>>,
    engine: GossipEngine<T>,
    client: OnceLock<MasterClient>,
    table: OnceCell<Arc<NeighborTable>>,
    shutdown: CancellationToken,
}

impl ConsensusAgent<TcpTransport> {
    /// Bind the peer listener over TCP
    pub async fn bind(config: AgentConfig) -> Result<Self> {
        let transport = TcpTransport::bind(config.listen).await?;
        Ok(Self::with_transport(config, transport))
    }
}

impl<T: PeerTransport> ConsensusAgent<T> {
    pub fn with_transport(config: AgentConfig, transport: T) -> Self {
        let shutdown = CancellationToken::new();
        let (mesh, events) = PeerMesh::new(
            config.token,
            transport,
            config.mesh.clone(),
            shutdown.child_token(),
        );
        let engine = GossipEngine::new(
            Arc::clone(&mesh),
            events,
            config.engine.clone(),
            shutdown.child_token(),
        );
        let advertised = config
            .advertise
            .unwrap_or_else(|| advertised_addr(mesh.local_addr()));

        Self {
            config,
            advertised,
            mesh,
            engine,
            client: OnceLock::new(),
            table: OnceCell::new(),
            shutdown,
        }
    }

    pub fn token(&self) -> Token {
        self.config.token
    }

    /// Address the peer listener is bound to
    pub fn local_addr(&self) -> SocketAddr {
        self.mesh.local_addr()
    }

    /// Address registered with the master
    pub fn advertised_addr(&self) -> SocketAddr {
        self.advertised
    }

    /// Token cancelled when the agent shuts down
    pub fn shutdown_token(&self) -> CancellationToken {
        self.shutdown.clone()
    }

    /// Start accepting peer connections
    pub fn serve(&self) {
        self.mesh.start_accepting();
    }

    /// Register with the master and wait for the neighbor table
    ///
    /// Concurrent and repeated calls share one registration.
    pub async fn register(&self) -> Result<Arc<NeighborTable>> {
        let table = self
            .table
            .get_or_try_init(|| async {
                let client = self.client();
                let table = tokio::select! {
                    _ = self.shutdown.cancelled() => return Err(Error::Cancelled),
                    table = client.wait_for_table() => table?,
                };

                self.mesh.connect_neighbors(&table);
                self.engine.configure(&table).await;
                self.follow_tables(client);
                info!(
                    token = self.config.token,
                    neighbors = table.entries.len(),
                    agents = table.agent_count,
                    "Agent ready"
                );
                Ok(table)
            })
            .await?;
        Ok(Arc::clone(table))
    }

    /// Serve peers and stay registered until shutdown
    pub async fn serve_forever(&self) -> Result<()> {
        self.serve();
        self.register().await?;
        self.shutdown.cancelled().await;
        Ok(())
    }

    /// One mixing step with every neighbor
    pub async fn run_once(&self, x: &[f32]) -> Result<Vec<f32>> {
        self.register().await?;
        self.engine.run_once(x).await
    }

    /// Mix until the network converges; see [`GossipEngine::run_round`]
    pub async fn run_round(&self, x: &[f32], weight: f32) -> Result<RoundOutcome> {
        self.register().await?;
        self.engine.run_round(x, weight).await
    }

    /// Send a monitoring fact to the master
    pub async fn report(&self, fact: TelemetryFact) -> Result<()> {
        self.client().send_telemetry(fact).await
    }

    /// Ask the master for an agent's advertised address
    pub async fn resolve(&self, token: Token) -> Result<Option<SocketAddr>> {
        self.client().resolve(token).await
    }

    pub fn master_state(&self) -> ConnectionState {
        self.client
            .get()
            .map_or(ConnectionState::Disconnected, MasterClient::connection_state)
    }

    /// Say goodbye to the master, close peer links and release waiting steps
    pub async fn shutdown(&self) {
        info!(token = self.config.token, "Agent shutting down");
        self.shutdown.cancel();
        if let Some(client) = self.client.get() {
            client.shutdown().await;
        }
    }

    fn client(&self) -> &MasterClient {
        self.client.get_or_init(|| {
            let mut config =
                MasterClientConfig::new(self.config.master, self.config.token, self.advertised);
            config.connect_timeout = self.config.master_connect_timeout;
            config.max_reconnect_attempts = self.config.max_reconnect_attempts;
            config.max_frame_bytes = self.config.mesh.max_frame_bytes;
            MasterClient::start(config, self.shutdown.clone())
        })
    }

    /// Redirect peer links when a neighbor re-registers elsewhere
    fn follow_tables(&self, client: &MasterClient) {
        let mut tables = client.tables();
        tables.mark_unchanged();
        let mesh = Arc::clone(&self.mesh);
        let shutdown = self.shutdown.clone();

        tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = shutdown.cancelled() => break,
                    changed = tables.changed() => {
                        if changed.is_err() {
                            break;
                        }
                    }
                }
                let table = tables.borrow_and_update().clone();
                if let Some(table) = table {
                    debug!(neighbors = table.entries.len(), "Neighbor table updated");
                    mesh.connect_neighbors(&table);
                }
            }
        });
    }
}

/// Replace an unspecified listen IP with loopback
fn advertised_addr(bound: SocketAddr) -> SocketAddr {
    if bound.ip().is_unspecified() {
        SocketAddr::new(IpAddr::V4(Ipv4Addr::LOCALHOST), bound.port())
    } else {
        bound
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_advertised_addr() {
        let wildcard: SocketAddr = "0.0.0.0:7000".parse().unwrap();
        assert_eq!(advertised_addr(wildcard), "127.0.0.1:7000".parse().unwrap());

        let explicit: SocketAddr = "10.0.0.5:7000".parse().unwrap();
        assert_eq!(advertised_addr(explicit), explicit);
    }
}
