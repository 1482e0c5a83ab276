//! Master protocol tests
//!
//! Drives the master with raw frames to check the registration rules.

mod common;

use std::net::SocketAddr;
use std::time::Duration;

use tokio::net::TcpStream;

use gossip_consensus::protocol::{
    read_message, write_message, GoodbyeMessage, Message, NeighborTable, ProtocolVersion, RegisterRequest,
    TelemetryFact,
};
use gossip_consensus::topology::Token;

use common::*;

/// Raw agent connection speaking the wire protocol directly
struct RawAgent {
    stream: TcpStream,
}

impl RawAgent {
    async fn connect(master: SocketAddr) -> Self {
        Self {
            stream: TcpStream::connect(master).await.unwrap(),
        }
    }

    async fn register(master: SocketAddr, token: Token, listen_port: u16) -> Self {
        let mut agent = Self::connect(master).await;
        agent
            .send(Message::Register(RegisterRequest {
                token,
                listen_addr: SocketAddr::from(([127, 0, 0, 1], listen_port)),
                version: ProtocolVersion::default(),
            }))
            .await;
        agent
    }

    async fn send(&mut self, msg: Message) {
        write_message(&mut self.stream, &msg).await.unwrap();
    }

    /// Send without caring whether the master still reads this connection
    async fn send_ignoring_errors(&mut self, msg: Message) {
        let _ = write_message(&mut self.stream, &msg).await;
    }

    async fn recv(&mut self) -> Message {
        tokio::time::timeout(TEST_TIMEOUT, read_message(&mut self.stream))
            .await
            .expect("no message from master")
            .unwrap()
    }

    async fn recv_table(&mut self) -> NeighborTable {
        match self.recv().await {
            Message::NeighborTable(table) => table,
            other => panic!("expected NEIGHBOR_TABLE, got {:?}", other),
        }
    }

    /// Nothing arrives within a short window
    async fn assert_silent(&mut self) {
        let read = tokio::time::timeout(Duration::from_millis(200), read_message(&mut self.stream)).await;
        assert!(read.is_err(), "unexpected message: {:?}", read);
    }

    /// The master closed this connection
    async fn assert_closed(&mut self) {
        let read = tokio::time::timeout(TEST_TIMEOUT, read_message(&mut self.stream))
            .await
            .expect("connection stayed open");
        assert!(read.is_err(), "expected close, got {:?}", read);
    }
}

const PATH: &str = "0 1\n1 2\n";

#[tokio::test]
async fn test_tables_released_only_after_last_registration() {
    let (master, _) = start_master(PATH).await;
    let addr = master.local_addr();

    let mut a0 = RawAgent::register(addr, 0, 7100).await;
    let mut a1 = RawAgent::register(addr, 1, 7101).await;
    a0.assert_silent().await;
    a1.assert_silent().await;
    assert!(!master.registry().is_released());

    let mut a2 = RawAgent::register(addr, 2, 7102).await;

    let t0 = a0.recv_table().await;
    let t1 = a1.recv_table().await;
    let t2 = a2.recv_table().await;

    assert_eq!(t0.token, 0);
    assert_eq!(t0.agent_count, 3);
    assert_eq!(t0.entries.keys().copied().collect::<Vec<_>>(), vec![1]);
    assert_eq!(t0.entries[&1].addr.port(), 7101);
    assert_eq!(t0.entries[&1].degree, 2);

    assert_eq!(t1.degree, 2);
    assert_eq!(t1.entries.keys().copied().collect::<Vec<_>>(), vec![0, 2]);
    assert_eq!(t2.entries[&1].addr.port(), 7101);

    // Exactly one table each
    a0.assert_silent().await;
    a1.assert_silent().await;
    a2.assert_silent().await;

    master.shutdown().await;
}

#[tokio::test]
async fn test_reregistration_replaces_record() {
    let (master, processor) = start_master(PATH).await;
    let addr = master.local_addr();

    let mut a0 = RawAgent::register(addr, 0, 7200).await;
    let mut old = RawAgent::register(addr, 1, 7201).await;
    let mut a2 = RawAgent::register(addr, 2, 7202).await;
    a0.recv_table().await;
    old.recv_table().await;
    a2.recv_table().await;

    // Agent 1 comes back on a different port
    let mut new = RawAgent::register(addr, 1, 7301).await;
    let table = new.recv_table().await;
    assert_eq!(table.token, 1);
    old.assert_closed().await;

    // Its neighbors learn the new address
    assert_eq!(a0.recv_table().await.entries[&1].addr.port(), 7301);
    assert_eq!(a2.recv_table().await.entries[&1].addr.port(), 7301);
    assert_eq!(master.registry().resolve(1).map(|a| a.port()), Some(7301));

    new.send(Message::Telemetry(TelemetryFact::AgentGeneralInfo { batches_per_epoch: 3 }))
        .await;
    let facts = processor.wait_for(1).await;
    assert_eq!(facts, vec![(1, TelemetryFact::AgentGeneralInfo { batches_per_epoch: 3 })]);

    master.shutdown().await;
}

#[tokio::test]
async fn test_replaced_connection_telemetry_not_relayed() {
    let (master, processor) = start_master(PATH).await;
    let addr = master.local_addr();

    let mut a0 = RawAgent::register(addr, 0, 7600).await;
    let mut old = RawAgent::register(addr, 1, 7601).await;
    let mut a2 = RawAgent::register(addr, 2, 7602).await;
    a0.recv_table().await;
    old.recv_table().await;
    a2.recv_table().await;

    let mut new = RawAgent::register(addr, 1, 7701).await;
    new.recv_table().await;

    // Late frames from the replaced process must not reach the processor
    old.send_ignoring_errors(Message::Telemetry(TelemetryFact::ModelParameters {
        batch_number: 1,
        parameters: vec![9.0; 3],
    }))
    .await;
    old.assert_closed().await;

    new.send(Message::Telemetry(TelemetryFact::AgentGeneralInfo { batches_per_epoch: 5 }))
        .await;
    processor.wait_for(1).await;
    tokio::time::sleep(Duration::from_millis(200)).await;
    assert_eq!(
        processor.facts(),
        vec![(1, TelemetryFact::AgentGeneralInfo { batches_per_epoch: 5 })]
    );

    master.shutdown().await;
}

#[tokio::test]
async fn test_first_message_must_be_register() {
    let (master, processor) = start_master(PATH).await;

    let mut agent = RawAgent::connect(master.local_addr()).await;
    agent
        .send(Message::Telemetry(TelemetryFact::AgentGeneralInfo { batches_per_epoch: 1 }))
        .await;

    match agent.recv().await {
        Message::Error(report) => assert_eq!(report.code, "E402"),
        other => panic!("expected ERROR, got {:?}", other),
    }
    agent.assert_closed().await;
    assert!(processor.facts().is_empty());
    assert_eq!(master.registry().registered_count(), 0);

    master.shutdown().await;
}

#[tokio::test]
async fn test_unknown_token_rejected() {
    let (master, _) = start_master(PATH).await;

    let mut agent = RawAgent::register(master.local_addr(), 42, 7400).await;
    match agent.recv().await {
        Message::Error(report) => {
            assert_eq!(report.code, "E111");
            assert!(report.fatal);
        }
        other => panic!("expected ERROR, got {:?}", other),
    }
    agent.assert_closed().await;

    master.shutdown().await;
}

#[tokio::test]
async fn test_goodbye_marks_agent_gone() {
    let (master, _) = start_master(PATH).await;
    let addr = master.local_addr();

    let mut a0 = RawAgent::register(addr, 0, 7500).await;
    a0.send(Message::Goodbye(GoodbyeMessage {
        reason: "done".to_string(),
    }))
    .await;
    a0.assert_closed().await;

    let record = master.registry().get(0).unwrap();
    assert!(!record.alive);
    assert_eq!(master.registry().alive_count(), 0);
    // The record still counts towards releasing tables
    assert_eq!(master.registry().registered_count(), 1);

    master.shutdown().await;
}
