//! Gossip averaging engine
//!
//! A step sends the local vector to every neighbor, waits until the
//! matching round has arrived from every neighbor, then mixes. Each edge
//! keeps its own round counter; every step consumes exactly one round on
//! every edge, even when the step fails validation.
//!
//! An edge is tied to the pair of processes on its two ends. Nothing is sent
//! on an edge before the neighbor's `PeerHello` has been seen, every vector
//! names the neighbor incarnation it is meant for, and a new incarnation
//! restarts the edge at round 0 with nothing queued or buffered.
//!
//! `run_round` repeats steps until the whole network agrees it converged.
//! Each agent tracks a streak of consecutive low-residual steps, capped by
//! its neighbors' streaks, so a streak of `N` (the agent count) means every
//! agent has been quiet for a while. The first agent to see that picks a
//! stop step `N` steps ahead and the choice floods to everyone well before
//! it is reached, so all agents leave the round on the same step.

use std::collections::BTreeMap;
use std::sync::Arc;

use tokio::sync::{mpsc, Mutex};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use uuid::Uuid;

use super::mesh::{InboundEvent, PeerMesh, PeerTransport};
use super::mixing::{self, Contribution, MixingWeights};
use crate::error::{Error, Result};
use crate::protocol::{NeighborTable, PeerVector};
use crate::topology::Token;

// ─────────────────────────────────────────────────────────────────
// Configuration
// ─────────────────────────────────────────────────────────────────

#[derive(Debug, Clone)]
pub struct EngineConfig {
    /// Residual below which a step counts as converged
    pub epsilon: f32,

    /// Steps after which `run_round` gives up
    pub round_cap: u32,

    /// Extra steps `run_once` takes when a neighbor sends NaN or infinity
    pub max_poison_retries: u32,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            epsilon: 1e-4,
            round_cap: 2000,
            max_poison_retries: 3,
        }
    }
}

/// Result of `run_round`
#[derive(Debug, Clone, PartialEq)]
pub struct RoundOutcome {
    pub vector: Vec<f32>,

    /// Bootstrap weight after the last step
    pub weight: f32,

    /// Steps taken
    pub steps: u32,

    /// False when the step cap was hit first
    pub converged: bool,

    /// Residual of the last step
    pub residual: f32,
}

impl RoundOutcome {
    /// The converged vector, or `ConvergenceTimeout`
    pub fn into_result(self) -> Result<Vec<f32>> {
        if self.converged {
            Ok(self.vector)
        } else {
            Err(Error::ConvergenceTimeout {
                steps: self.steps,
                residual: self.residual,
            })
        }
    }
}

// ─────────────────────────────────────────────────────────────────
// Engine State
// ─────────────────────────────────────────────────────────────────

#[derive(Default)]
struct EdgeState {
    /// Round the next step sends and expects on this edge
    round: u64,

    /// Vectors received ahead of their step
    received: BTreeMap<u64, PeerVector>,

    /// Last process identity seen on the neighbor's connection
    incarnation: Option<Uuid>,
}

struct Neighborhood {
    weights: MixingWeights,
    agent_count: usize,
    edges: BTreeMap<Token, EdgeState>,
}

struct EngineState {
    events: mpsc::Receiver<InboundEvent>,
    neighborhood: Option<Neighborhood>,
}

/// What a step sends besides the vector
#[derive(Debug, Clone, Copy)]
struct StepHeader {
    weight: f32,
    streak: u32,
    stop_at: Option<u64>,
}

impl StepHeader {
    const PLAIN: StepHeader = StepHeader {
        weight: 1.0,
        streak: 0,
        stop_at: None,
    };
}

// ─────────────────────────────────────────────────────────────────
// Gossip Engine
// ─────────────────────────────────────────────────────────────────

/// Runs mixing steps over a peer mesh
///
/// Steps are serialized: concurrent callers queue on an internal lock.
pub struct GossipEngine<T: PeerTransport> {
    mesh: Arc<PeerMesh<T>>,
    config: EngineConfig,
    state: Mutex<EngineState>,
    shutdown: CancellationToken,
}

impl<T: PeerTransport> GossipEngine<T> {
    pub fn new(
        mesh: Arc<PeerMesh<T>>,
        events: mpsc::Receiver<InboundEvent>,
        config: EngineConfig,
        shutdown: CancellationToken,
    ) -> Self {
        Self {
            mesh,
            config,
            state: Mutex::new(EngineState {
                events,
                neighborhood: None,
            }),
            shutdown,
        }
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    /// Adopt the neighbor set and degrees from a table
    ///
    /// Edge state survives for neighbors already known.
    pub async fn configure(&self, table: &NeighborTable) {
        let weights = MixingWeights::metropolis(
            table.degree,
            table.entries.iter().map(|(token, entry)| (*token, entry.degree)),
        );

        let mut state = self.state.lock().await;
        let mut edges = state
            .neighborhood
            .take()
            .map(|n| n.edges)
            .unwrap_or_default();
        edges.retain(|token, _| table.entries.contains_key(token));
        for token in table.entries.keys() {
            edges.entry(*token).or_default();
        }

        debug!(
            token = self.mesh.token(),
            neighbors = edges.len(),
            self_weight = weights.self_weight(),
            "Engine configured"
        );
        state.neighborhood = Some(Neighborhood {
            weights,
            agent_count: table.agent_count,
            edges,
        });
    }

    /// One mixing step
    ///
    /// When a neighbor sends NaN or infinity the step is retried with fresh
    /// rounds, up to `max_poison_retries` times.
    pub async fn run_once(&self, x: &[f32]) -> Result<Vec<f32>> {
        let mut state = self.state.lock().await;

        let mut attempt = 0;
        loop {
            let received = self.exchange(&mut state, x, StepHeader::PLAIN).await?;
            let neighborhood = self.neighborhood(&state)?;

            match self.validate(&received, x.len()) {
                Ok(()) => {
                    let outcome = mix_step(&neighborhood.weights, x, 1.0, &received);
                    return Ok(outcome.vector);
                }
                Err(e @ Error::PoisonedData { .. }) if attempt < self.config.max_poison_retries => {
                    attempt += 1;
                    warn!(error = %e, attempt, "Discarding poisoned step, retrying");
                }
                Err(e) => return Err(e),
            }
        }
    }

    /// Mix until the network converges or the step cap is hit
    ///
    /// `weight` is the local bootstrap weight: 1.0 everywhere for a plain
    /// averaging round, or 1.0 on a single leader and 0.0 elsewhere to
    /// spread the leader's vector.
    pub async fn run_round(&self, x: &[f32], weight: f32) -> Result<RoundOutcome> {
        let mut state = self.state.lock().await;
        let agent_count = self.neighborhood(&state)?.agent_count.max(1) as u32;
        let round_cap = self.config.round_cap.max(1);

        let mut vector = x.to_vec();
        let mut weight = weight;
        let mut streak = 0u32;
        let mut stop_at: Option<u64> = None;
        let mut residual = f32::INFINITY;

        for step in 0..round_cap {
            let header = StepHeader {
                weight,
                streak,
                stop_at,
            };
            let received = self.exchange(&mut state, &vector, header).await?;
            let neighborhood = self.neighborhood(&state)?;

            let neighbor_streak = received.values().map(|v| v.streak).min().unwrap_or(streak);
            let neighbor_stop = received.values().filter_map(|v| v.stop_at).min();
            stop_at = match (stop_at, neighbor_stop) {
                (Some(a), Some(b)) => Some(a.min(b)),
                (a, b) => a.or(b),
            };

            match self.validate(&received, vector.len()) {
                Ok(()) => {
                    let outcome = mix_step(&neighborhood.weights, &vector, weight, &received);
                    vector = outcome.vector;
                    weight = outcome.weight;
                    residual = outcome.residual;
                }
                Err(e @ Error::PoisonedData { .. }) => {
                    warn!(error = %e, step, "Discarding poisoned step");
                    residual = f32::INFINITY;
                }
                Err(e) => return Err(e),
            }

            streak = if residual < self.config.epsilon {
                1 + streak.min(neighbor_streak)
            } else {
                0
            };
            let step = step as u64;
            if stop_at.is_none() && streak >= agent_count {
                stop_at = Some(step + agent_count as u64);
                debug!(step, stop_at = step + agent_count as u64, "Network quiet, scheduling stop");
            }

            if stop_at.is_some_and(|s| step >= s) {
                let steps = step as u32 + 1;
                info!(steps, residual, "Round converged");
                return Ok(RoundOutcome {
                    vector,
                    weight,
                    steps,
                    converged: true,
                    residual,
                });
            }
        }

        warn!(steps = round_cap, residual, "Round hit the step cap before converging");
        Ok(RoundOutcome {
            vector,
            weight,
            steps: round_cap,
            converged: false,
            residual,
        })
    }

    fn neighborhood<'a>(&self, state: &'a EngineState) -> Result<&'a Neighborhood> {
        state.neighborhood.as_ref().ok_or(Error::NotRegistered {
            token: self.mesh.token(),
        })
    }

    /// Send `vector` on every edge and collect one vector per neighbor
    async fn exchange(
        &self,
        state: &mut EngineState,
        vector: &[f32],
        header: StepHeader,
    ) -> Result<BTreeMap<Token, PeerVector>> {
        let token = self.mesh.token();
        let EngineState {
            events,
            neighborhood,
        } = state;
        let neighborhood = neighborhood.as_mut().ok_or(Error::NotRegistered { token })?;

        // A reset may restart an edge on the round it was already sent
        let mut sent: BTreeMap<Token, (u64, Uuid)> = BTreeMap::new();
        loop {
            for (peer, edge) in neighborhood.edges.iter() {
                let Some(epoch) = edge.incarnation else {
                    continue;
                };
                if sent.get(peer) == Some(&(edge.round, epoch)) {
                    continue;
                }
                self.mesh.push(
                    *peer,
                    PeerVector {
                        round: edge.round,
                        epoch,
                        weight: header.weight,
                        streak: header.streak,
                        stop_at: header.stop_at,
                        vector: vector.to_vec(),
                    },
                )?;
                sent.insert(*peer, (edge.round, epoch));
            }

            let complete = neighborhood
                .edges
                .values()
                .all(|edge| edge.received.contains_key(&edge.round));
            if complete {
                break;
            }

            let event = tokio::select! {
                _ = self.shutdown.cancelled() => return Err(Error::Cancelled),
                event = events.recv() => event.ok_or(Error::Cancelled)?,
            };
            self.handle_event(neighborhood, event);
        }

        let mut received = BTreeMap::new();
        for (peer, edge) in neighborhood.edges.iter_mut() {
            if let Some(v) = edge.received.remove(&edge.round) {
                received.insert(*peer, v);
            }
            edge.round += 1;
        }
        Ok(received)
    }

    fn handle_event(&self, neighborhood: &mut Neighborhood, event: InboundEvent) {
        match event {
            InboundEvent::Connected { from, incarnation } => {
                let Some(edge) = neighborhood.edges.get_mut(&from) else {
                    warn!(peer = from, "Connection from an agent that is not a neighbor");
                    return;
                };
                if edge.incarnation.is_some_and(|known| known != incarnation) {
                    warn!(peer = from, "Neighbor restarted, resetting edge rounds");
                    edge.round = 0;
                    edge.received.clear();
                    self.mesh.reset_link(from);
                }
                edge.incarnation = Some(incarnation);
            }
            InboundEvent::Vector {
                from,
                incarnation,
                vector,
            } => {
                let Some(edge) = neighborhood.edges.get_mut(&from) else {
                    warn!(peer = from, "Vector from an agent that is not a neighbor");
                    return;
                };
                if edge.incarnation != Some(incarnation) {
                    debug!(peer = from, round = vector.round, "Dropping vector from a replaced connection");
                    return;
                }
                if vector.round < edge.round || edge.received.contains_key(&vector.round) {
                    debug!(peer = from, round = vector.round, expected = edge.round, "Dropping stale vector");
                    return;
                }
                // The neighbor finished every step before this round, so it consumed ours
                self.mesh.prune(from, vector.round);
                edge.received.insert(vector.round, vector);
            }
        }
    }

    /// Length errors close the offending connection; poison is reported separately
    fn validate(&self, received: &BTreeMap<Token, PeerVector>, expected: usize) -> Result<()> {
        for (peer, v) in received {
            if v.vector.len() != expected {
                self.mesh.drop_inbound(*peer);
                return Err(Error::VectorLengthMismatch {
                    peer: *peer,
                    expected,
                    actual: v.vector.len(),
                });
            }
        }
        for (peer, v) in received {
            if mixing::is_poisoned(&v.vector) || !v.weight.is_finite() {
                return Err(Error::PoisonedData {
                    peer: *peer,
                    round: v.round,
                });
            }
        }
        Ok(())
    }
}

fn mix_step(
    weights: &MixingWeights,
    own: &[f32],
    own_weight: f32,
    received: &BTreeMap<Token, PeerVector>,
) -> mixing::MixOutcome {
    let contributions: BTreeMap<Token, Contribution<'_>> = received
        .iter()
        .map(|(token, v)| {
            (
                *token,
                Contribution {
                    weight: v.weight,
                    vector: &v.vector,
                },
            )
        })
        .collect();
    mixing::mix(
        weights,
        Contribution {
            weight: own_weight,
            vector: own,
        },
        &contributions,
    )
}

// ─────────────────────────────────────────────────────────────────
// Tests
// ─────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use std::net::SocketAddr;
    use std::time::Duration;

    use super::*;
    use crate::agent::mesh::{MeshConfig, TcpTransport};
    use crate::protocol::NeighborEntry;
    use crate::topology::Topology;

    struct Network {
        engines: Vec<Arc<GossipEngine<TcpTransport>>>,
        shutdown: CancellationToken,
    }

    /// Wire engines together directly, without a master
    async fn network(edges: &str, config: EngineConfig) -> Network {
        let topology = Topology::parse(edges).unwrap();
        let shutdown = CancellationToken::new();
        let any = SocketAddr::from(([127, 0, 0, 1], 0));

        let mut meshes = Vec::new();
        for token in topology.agents() {
            let transport = TcpTransport::bind(any).await.unwrap();
            let (mesh, events) = PeerMesh::new(token, transport, MeshConfig::default(), shutdown.child_token());
            mesh.start_accepting();
            meshes.push((token, mesh, events));
        }
        let addrs: BTreeMap<Token, SocketAddr> =
            meshes.iter().map(|(t, m, _)| (*t, m.local_addr())).collect();

        let mut engines = Vec::new();
        for (token, mesh, events) in meshes {
            let table = NeighborTable {
                token,
                degree: topology.degree(token),
                agent_count: topology.agent_count(),
                entries: topology
                    .neighbors(token)
                    .unwrap()
                    .iter()
                    .map(|n| (*n, NeighborEntry { addr: addrs[n], degree: topology.degree(*n) }))
                    .collect(),
            };
            mesh.connect_neighbors(&table);
            let engine = GossipEngine::new(mesh, events, config.clone(), shutdown.child_token());
            engine.configure(&table).await;
            engines.push(Arc::new(engine));
        }
        Network { engines, shutdown }
    }

    async fn run_all<F, Fut, R>(net: &Network, f: F) -> Vec<R>
    where
        F: Fn(usize, Arc<GossipEngine<TcpTransport>>) -> Fut,
        Fut: std::future::Future<Output = R> + Send + 'static,
        R: Send + 'static,
    {
        let handles: Vec<_> = net
            .engines
            .iter()
            .enumerate()
            .map(|(i, e)| tokio::spawn(f(i, Arc::clone(e))))
            .collect();
        let mut results = Vec::new();
        for h in handles {
            results.push(tokio::time::timeout(Duration::from_secs(20), h).await.unwrap().unwrap());
        }
        results
    }

    #[tokio::test]
    async fn test_run_once_preserves_sum() {
        let net = network("0 1\n1 2\n2 3\n", EngineConfig::default()).await;
        let inputs = [vec![0.0, 8.0], vec![4.0, 0.0], vec![8.0, 0.0], vec![4.0, 0.0]];

        let outputs = run_all(&net, |i, e| {
            let x = inputs[i].clone();
            async move { e.run_once(&x).await.unwrap() }
        })
        .await;

        for k in 0..2 {
            let before: f32 = inputs.iter().map(|v| v[k]).sum();
            let after: f32 = outputs.iter().map(|v| v[k]).sum();
            assert!((before - after).abs() < 1e-4, "sum changed: {} -> {}", before, after);
        }
        net.shutdown.cancel();
    }

    #[tokio::test]
    async fn test_run_round_reaches_mean() {
        let config = EngineConfig {
            epsilon: 1e-5,
            ..EngineConfig::default()
        };
        let net = network("0 1\n1 2\n2 0\n2 3\n", config).await;

        let outcomes = run_all(&net, |i, e| async move {
            e.run_round(&[i as f32 * 4.0], 1.0).await.unwrap()
        })
        .await;

        let steps = outcomes[0].steps;
        for outcome in &outcomes {
            assert!(outcome.converged);
            assert_eq!(outcome.steps, steps);
            assert!((outcome.vector[0] - 6.0).abs() < 1e-3, "got {}", outcome.vector[0]);
        }
        net.shutdown.cancel();
    }

    #[tokio::test]
    async fn test_leader_bootstrap_spreads_leader_vector() {
        let net = network("0 1\n1 2\n2 3\n", EngineConfig::default()).await;

        let outcomes = run_all(&net, |i, e| async move {
            let (x, w) = if i == 0 { (vec![3.0, -1.0], 1.0) } else { (vec![0.0, 0.0], 0.0) };
            e.run_round(&x, w).await.unwrap()
        })
        .await;

        for outcome in outcomes {
            assert!(outcome.converged);
            assert!((outcome.vector[0] - 3.0).abs() < 1e-5);
            assert!((outcome.vector[1] + 1.0).abs() < 1e-5);
        }
        net.shutdown.cancel();
    }

    #[tokio::test]
    async fn test_no_leader_hits_step_cap() {
        let config = EngineConfig {
            round_cap: 5,
            ..EngineConfig::default()
        };
        let net = network("0 1\n", config).await;

        let outcomes = run_all(&net, |_, e| async move { e.run_round(&[1.0], 0.0).await.unwrap() }).await;
        for outcome in outcomes {
            assert!(!outcome.converged);
            assert_eq!(outcome.steps, 5);
            assert!(matches!(
                outcome.into_result(),
                Err(Error::ConvergenceTimeout { steps: 5, .. })
            ));
        }
        net.shutdown.cancel();
    }

    #[tokio::test]
    async fn test_poisoned_neighbor_retried() {
        let config = EngineConfig {
            max_poison_retries: 2,
            ..EngineConfig::default()
        };
        let net = network("0 1\n", config).await;

        // Agent 1 sends NaN once, then a clean vector on the retry
        let a = Arc::clone(&net.engines[0]);
        let b = Arc::clone(&net.engines[1]);
        let first = tokio::spawn(async move { a.run_once(&[2.0]).await });
        let second = tokio::spawn(async move {
            b.run_once(&[f32::NAN]).await.ok();
            b.run_once(&[4.0]).await
        });

        let x0 = first.await.unwrap().unwrap();
        assert!((x0[0] - 3.0).abs() < 1e-6);
        second.await.unwrap().unwrap();
        net.shutdown.cancel();
    }

    #[tokio::test]
    async fn test_length_mismatch_reported() {
        let net = network("0 1\n", EngineConfig::default()).await;

        let a = Arc::clone(&net.engines[0]);
        let b = Arc::clone(&net.engines[1]);
        let first = tokio::spawn(async move { a.run_once(&[1.0, 2.0]).await });
        let second = tokio::spawn(async move { b.run_once(&[1.0, 2.0, 3.0]).await });

        assert!(matches!(
            first.await.unwrap(),
            Err(Error::VectorLengthMismatch { peer: 1, expected: 2, actual: 3 })
        ));
        assert!(matches!(
            second.await.unwrap(),
            Err(Error::VectorLengthMismatch { peer: 0, expected: 3, actual: 2 })
        ));
        net.shutdown.cancel();
    }

    #[tokio::test]
    async fn test_shutdown_releases_barrier() {
        let net = network("0 1\n", EngineConfig::default()).await;
        let a = Arc::clone(&net.engines[0]);
        let waiting = tokio::spawn(async move { a.run_once(&[1.0]).await });

        tokio::time::sleep(Duration::from_millis(50)).await;
        net.shutdown.cancel();
        assert!(matches!(waiting.await.unwrap(), Err(Error::Cancelled)));
    }

    /// Engine for one end of a two-agent edge, with its own shutdown token
    async fn edge_end(token: Token, shutdown: CancellationToken) -> Arc<GossipEngine<TcpTransport>> {
        let transport = TcpTransport::bind(SocketAddr::from(([127, 0, 0, 1], 0))).await.unwrap();
        let config = MeshConfig {
            initial_reconnect_delay: Duration::from_millis(20),
            max_reconnect_delay: Duration::from_millis(200),
            ..MeshConfig::default()
        };
        let (mesh, events) = PeerMesh::new(token, transport, config, shutdown.child_token());
        mesh.start_accepting();
        Arc::new(GossipEngine::new(mesh, events, EngineConfig::default(), shutdown))
    }

    fn edge_table(token: Token, peer: Token, addr: SocketAddr) -> NeighborTable {
        NeighborTable {
            token,
            degree: 1,
            agent_count: 2,
            entries: BTreeMap::from([(peer, NeighborEntry { addr, degree: 1 })]),
        }
    }

    async fn join(engine: &GossipEngine<TcpTransport>, table: &NeighborTable) {
        engine.mesh.connect_neighbors(table);
        engine.configure(table).await;
    }

    fn spawn_step(engine: &Arc<GossipEngine<TcpTransport>>, x: f32) -> tokio::task::JoinHandle<Result<Vec<f32>>> {
        let engine = Arc::clone(engine);
        tokio::spawn(async move { engine.run_once(&[x]).await })
    }

    async fn finish(step: tokio::task::JoinHandle<Result<Vec<f32>>>) -> Vec<f32> {
        tokio::time::timeout(Duration::from_secs(10), step)
            .await
            .expect("step did not finish")
            .unwrap()
            .unwrap()
    }

    #[tokio::test]
    async fn test_restarted_neighbor_starts_fresh_edge() {
        let shutdown = CancellationToken::new();
        let old_shutdown = CancellationToken::new();
        let a = edge_end(0, shutdown.child_token()).await;
        let old = edge_end(1, old_shutdown.clone()).await;
        join(&a, &edge_table(0, 1, old.mesh.local_addr())).await;
        join(&old, &edge_table(1, 0, a.mesh.local_addr())).await;

        for _ in 0..3 {
            let (x, y) = (spawn_step(&a, 0.0), spawn_step(&old, 0.0));
            assert_eq!(finish(x).await, vec![0.0]);
            assert_eq!(finish(y).await, vec![0.0]);
        }

        // Agent 1 dies while agent 0 already waits on its next round
        old_shutdown.cancel();
        drop(old);
        let pending = spawn_step(&a, 10.0);
        tokio::time::sleep(Duration::from_millis(100)).await;

        let fresh = edge_end(1, shutdown.child_token()).await;
        join(&fresh, &edge_table(1, 0, a.mesh.local_addr())).await;
        a.mesh.connect_neighbors(&edge_table(0, 1, fresh.mesh.local_addr()));

        let y = spawn_step(&fresh, 20.0);
        assert_eq!(finish(pending).await, vec![15.0]);
        assert_eq!(finish(y).await, vec![15.0]);

        // Rounds stay aligned after the reset
        for (x, y, mean) in [(1.0, 3.0, 2.0), (4.0, 8.0, 6.0)] {
            let (sx, sy) = (spawn_step(&a, x), spawn_step(&fresh, y));
            assert_eq!(finish(sx).await, vec![mean]);
            assert_eq!(finish(sy).await, vec![mean]);
        }

        shutdown.cancel();
    }

    #[tokio::test]
    async fn test_unconfigured_engine_rejects_steps() {
        let shutdown = CancellationToken::new();
        let transport = TcpTransport::bind(SocketAddr::from(([127, 0, 0, 1], 0))).await.unwrap();
        let (mesh, events) = PeerMesh::new(4, transport, MeshConfig::default(), shutdown.clone());
        let engine = GossipEngine::new(mesh, events, EngineConfig::default(), shutdown);

        assert!(matches!(
            engine.run_once(&[1.0]).await,
            Err(Error::NotRegistered { token: 4 })
        ));
    }
}
