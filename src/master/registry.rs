//! Agent registry
//!
//! Tracks the one live record per token and decides when neighbor tables are
//! released. Tables go out exactly once per agent when the last agent of the
//! topology registers; after that, a re-registering agent receives its table
//! immediately and, if its address moved, so do its neighbors.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Instant;

use parking_lot::RwLock;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::error::{Error, Result};
use crate::protocol::{Message, NeighborEntry, NeighborTable};
use crate::topology::{Token, Topology};

// ─────────────────────────────────────────────────────────────────
// Agent Record
// ─────────────────────────────────────────────────────────────────

/// Master-side view of one agent
#[derive(Debug, Clone)]
pub struct AgentRecord {
    pub token: Token,

    /// Address the agent accepts peer connections on
    pub listen_addr: SocketAddr,

    /// Identifies the connection that created this record
    pub session: Uuid,

    /// Whether that connection is still open
    pub alive: bool,

    pub registered_at: Instant,

    outbox: mpsc::UnboundedSender<Message>,
    cancel: CancellationToken,
}

/// Result of a successful registration
#[derive(Debug, Clone)]
pub struct Registration {
    pub session: Uuid,

    /// Tokens that were sent a neighbor table as a consequence
    pub tables_sent: Vec<Token>,
}

// ─────────────────────────────────────────────────────────────────
// Agent Registry
// ─────────────────────────────────────────────────────────────────

#[derive(Default)]
struct RegistryState {
    records: HashMap<Token, AgentRecord>,
    released: bool,
}

/// Thread-safe registry of agents known to the master
pub struct AgentRegistry {
    topology: Arc<Topology>,
    state: RwLock<RegistryState>,
}

impl AgentRegistry {
    pub fn new(topology: Arc<Topology>) -> Self {
        Self {
            topology,
            state: RwLock::new(RegistryState::default()),
        }
    }

    /// Record an agent connection, replacing any previous one for the token
    ///
    /// The previous connection is cancelled.
    pub fn register(
        &self,
        token: Token,
        listen_addr: SocketAddr,
        outbox: mpsc::UnboundedSender<Message>,
        cancel: CancellationToken,
    ) -> Result<Registration> {
        if !self.topology.contains(token) {
            return Err(Error::UnknownToken { token });
        }

        let session = Uuid::new_v4();
        let record = AgentRecord {
            token,
            listen_addr,
            session,
            alive: true,
            registered_at: Instant::now(),
            outbox,
            cancel,
        };

        let mut state = self.state.write();
        let previous = state.records.insert(token, record);
        if let Some(old) = &previous {
            info!(token, old_session = %old.session, "Agent re-registered, replacing record");
            old.cancel.cancel();
        } else {
            info!(token, addr = %listen_addr, "Agent registered");
        }

        let mut notify = Vec::new();
        if state.released {
            notify.push(token);
            let moved = previous.is_some_and(|old| old.listen_addr != listen_addr);
            if moved {
                if let Ok(neighbors) = self.topology.neighbors(token) {
                    notify.extend(neighbors.iter().copied());
                }
            }
        } else if state.records.len() == self.topology.agent_count() {
            info!(agents = state.records.len(), "All agents registered, releasing neighbor tables");
            state.released = true;
            notify.extend(self.topology.agents());
        } else {
            debug!(
                registered = state.records.len(),
                expected = self.topology.agent_count(),
                "Waiting for remaining agents"
            );
        }

        let mut tables_sent = Vec::with_capacity(notify.len());
        for target in notify {
            let Some(table) = neighbor_table(&self.topology, &state.records, target) else {
                continue;
            };
            if let Some(record) = state.records.get(&target) {
                if record.outbox.send(Message::NeighborTable(table)).is_ok() {
                    tables_sent.push(target);
                } else {
                    warn!(token = target, "Agent connection closed, table not delivered");
                }
            }
        }

        Ok(Registration {
            session,
            tables_sent,
        })
    }

    /// Whether `session` still owns the record for `token`
    pub fn is_current(&self, token: Token, session: Uuid) -> bool {
        self.state
            .read()
            .records
            .get(&token)
            .is_some_and(|r| r.session == session)
    }

    /// Mark the record dead if it still belongs to `session`
    pub fn mark_gone(&self, token: Token, session: Uuid) {
        if let Some(record) = self.state.write().records.get_mut(&token) {
            if record.session == session {
                record.alive = false;
            }
        }
    }

    /// Advertised address of `token`, available once tables are released
    pub fn resolve(&self, token: Token) -> Option<SocketAddr> {
        let state = self.state.read();
        if !state.released {
            return None;
        }
        state.records.get(&token).map(|r| r.listen_addr)
    }

    pub fn is_released(&self) -> bool {
        self.state.read().released
    }

    pub fn registered_count(&self) -> usize {
        self.state.read().records.len()
    }

    pub fn alive_count(&self) -> usize {
        self.state.read().records.values().filter(|r| r.alive).count()
    }

    pub fn get(&self, token: Token) -> Option<AgentRecord> {
        self.state.read().records.get(&token).cloned()
    }
}

fn neighbor_table(
    topology: &Topology,
    records: &HashMap<Token, AgentRecord>,
    token: Token,
) -> Option<NeighborTable> {
    let neighbors = topology.neighbors(token).ok()?;
    let mut entries = std::collections::BTreeMap::new();
    for &neighbor in neighbors {
        let record = records.get(&neighbor)?;
        entries.insert(
            neighbor,
            NeighborEntry {
                addr: record.listen_addr,
                degree: topology.degree(neighbor),
            },
        );
    }

    Some(NeighborTable {
        token,
        degree: topology.degree(token),
        agent_count: topology.agent_count(),
        entries,
    })
}

// ─────────────────────────────────────────────────────────────────
// Tests
// ─────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    fn registry() -> AgentRegistry {
        AgentRegistry::new(Arc::new(Topology::parse("0 1\n1 2\n").unwrap()))
    }

    fn addr(port: u16) -> SocketAddr {
        SocketAddr::from(([127, 0, 0, 1], port))
    }

    fn connect(
        registry: &AgentRegistry,
        token: Token,
        port: u16,
    ) -> (Registration, mpsc::UnboundedReceiver<Message>, CancellationToken) {
        let (tx, rx) = mpsc::unbounded_channel();
        let cancel = CancellationToken::new();
        let reg = registry.register(token, addr(port), tx, cancel.clone()).unwrap();
        (reg, rx, cancel)
    }

    fn table(rx: &mut mpsc::UnboundedReceiver<Message>) -> Option<NeighborTable> {
        match rx.try_recv() {
            Ok(Message::NeighborTable(t)) => Some(t),
            _ => None,
        }
    }

    #[test]
    fn test_tables_released_only_after_last_agent() {
        let registry = registry();
        let (r0, mut rx0, _) = connect(&registry, 0, 9000);
        let (r1, mut rx1, _) = connect(&registry, 1, 9001);

        assert!(r0.tables_sent.is_empty());
        assert!(r1.tables_sent.is_empty());
        assert!(table(&mut rx0).is_none());
        assert_eq!(registry.resolve(0), None);

        let (r2, mut rx2, _) = connect(&registry, 2, 9002);
        assert_eq!(r2.tables_sent, vec![0, 1, 2]);

        let t1 = table(&mut rx1).unwrap();
        assert_eq!(t1.agent_count, 3);
        assert_eq!(t1.degree, 2);
        assert_eq!(t1.entries[&0].addr, addr(9000));
        assert_eq!(t1.entries[&2].degree, 1);

        assert!(table(&mut rx0).is_some());
        assert!(table(&mut rx2).is_some());

        // Exactly once each
        assert!(table(&mut rx0).is_none());
        assert!(table(&mut rx1).is_none());
        assert_eq!(registry.resolve(2), Some(addr(9002)));
    }

    #[test]
    fn test_unknown_token_rejected() {
        let registry = registry();
        let (tx, _rx) = mpsc::unbounded_channel();
        let err = registry
            .register(7, addr(1), tx, CancellationToken::new())
            .unwrap_err();
        assert!(matches!(err, Error::UnknownToken { token: 7 }));
        assert_eq!(registry.registered_count(), 0);
    }

    #[test]
    fn test_reregister_replaces_record_and_cancels_old() {
        let registry = registry();
        let (first, _rx, old_cancel) = connect(&registry, 0, 9000);
        let (second, _rx2, new_cancel) = connect(&registry, 0, 9100);

        assert!(old_cancel.is_cancelled());
        assert!(!new_cancel.is_cancelled());
        assert_eq!(registry.registered_count(), 1);
        assert!(!registry.is_current(0, first.session));
        assert!(registry.is_current(0, second.session));

        // A stale session cannot mark the new record dead
        registry.mark_gone(0, first.session);
        assert!(registry.get(0).unwrap().alive);
    }

    #[test]
    fn test_late_reregister_gets_table_and_moved_address_updates_neighbors() {
        let registry = registry();
        let (_, mut rx0, _) = connect(&registry, 0, 9000);
        let (_, mut rx1, _) = connect(&registry, 1, 9001);
        let (_, _rx2, _) = connect(&registry, 2, 9002);
        table(&mut rx0);
        table(&mut rx1);

        // Same address: only the re-registering agent hears back
        let (same, _rx2b, _) = connect(&registry, 2, 9002);
        assert_eq!(same.tables_sent, vec![2]);
        assert!(table(&mut rx1).is_none());

        // New address: its neighbor is told
        let (moved, _rx2c, _) = connect(&registry, 2, 9202);
        assert_eq!(moved.tables_sent, vec![2, 1]);
        let t1 = table(&mut rx1).unwrap();
        assert_eq!(t1.entries[&2].addr, addr(9202));
        assert!(table(&mut rx0).is_none());
    }
}
