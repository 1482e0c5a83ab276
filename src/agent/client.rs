//! Agent-side connection to the master
//!
//! Provides a persistent master connection with:
//! - Automatic reconnection with exponential backoff
//! - Re-registration on every new connection
//! - Telemetry queuing during disconnection
//!
//! The latest neighbor table is published on a watch channel.

use std::collections::{HashMap, VecDeque};
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::{Duration, Instant};

use backoff::{backoff::Backoff, ExponentialBackoff};
use parking_lot::RwLock;
use tokio::net::TcpStream;
use tokio::sync::{mpsc, oneshot, watch};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::error::{Error, Result};
use crate::protocol::{
    ErrorMessage, FrameCodec, GoodbyeMessage, Message, NeighborTable, RegisterRequest,
    ResolveRequest, TelemetryFact, DEFAULT_MAX_FRAME_BYTES, PROTOCOL_VERSION,
};
use crate::topology::Token;

/// Telemetry facts kept while the master is unreachable
const BACKLOG_LIMIT: usize = 256;

// ─────────────────────────────────────────────────────────────────
// Configuration
// ─────────────────────────────────────────────────────────────────

/// Configuration for the master client
#[derive(Debug, Clone)]
pub struct MasterClientConfig {
    /// Master address
    pub master: SocketAddr,

    /// This agent's token
    pub token: Token,

    /// Address advertised to neighbors
    pub listen_addr: SocketAddr,

    /// Connection timeout
    pub connect_timeout: Duration,

    /// Maximum reconnection attempts (0 = infinite)
    pub max_reconnect_attempts: u32,

    /// Initial reconnect delay
    pub initial_reconnect_delay: Duration,

    /// Maximum reconnect delay
    pub max_reconnect_delay: Duration,

    /// Command queue size
    pub command_queue_size: usize,

    pub max_frame_bytes: usize,
}

impl MasterClientConfig {
    pub fn new(master: SocketAddr, token: Token, listen_addr: SocketAddr) -> Self {
        Self {
            master,
            token,
            listen_addr,
            connect_timeout: Duration::from_secs(10),
            max_reconnect_attempts: 0,
            initial_reconnect_delay: Duration::from_millis(200),
            max_reconnect_delay: Duration::from_secs(10),
            command_queue_size: 256,
            max_frame_bytes: DEFAULT_MAX_FRAME_BYTES,
        }
    }
}

// ─────────────────────────────────────────────────────────────────
// Connection State
// ─────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ConnectionState {
    #[default]
    Disconnected,
    Connecting,
    /// Register sent; the table may or may not have arrived
    Registered,
    Reconnecting,
    /// The master refused us; no further attempts
    Rejected,
    ShuttingDown,
}

#[derive(Debug, Default)]
struct ClientState {
    connection_state: ConnectionState,
    reconnect_attempts: u32,
    connected_at: Option<Instant>,

    /// Set when the client gave up for good
    failure: Option<FailureReason>,
}

#[derive(Debug, Clone)]
enum FailureReason {
    Rejected(ErrorMessage),
    Exhausted { attempts: u32 },
}

// ─────────────────────────────────────────────────────────────────
// Command Channel
// ─────────────────────────────────────────────────────────────────

#[derive(Debug)]
enum ClientCommand {
    Telemetry(TelemetryFact),
    Resolve(Token, oneshot::Sender<Option<SocketAddr>>),
    Shutdown,
}

// ─────────────────────────────────────────────────────────────────
// Master Client
// ─────────────────────────────────────────────────────────────────

/// Handle to the background master connection
pub struct MasterClient {
    config: MasterClientConfig,
    state: Arc<RwLock<ClientState>>,
    command_tx: mpsc::Sender<ClientCommand>,
    table_rx: watch::Receiver<Option<Arc<NeighborTable>>>,
    task: parking_lot::Mutex<Option<JoinHandle<()>>>,
}

impl MasterClient {
    /// Spawn the connection loop
    pub fn start(config: MasterClientConfig, shutdown: CancellationToken) -> Self {
        let (command_tx, command_rx) = mpsc::channel(config.command_queue_size.max(1));
        let (table_tx, table_rx) = watch::channel(None);
        let state = Arc::new(RwLock::new(ClientState::default()));

        let task = tokio::spawn(run_client_loop(
            config.clone(),
            Arc::clone(&state),
            command_rx,
            table_tx,
            shutdown,
        ));

        Self {
            config,
            state,
            command_tx,
            table_rx,
            task: parking_lot::Mutex::new(Some(task)),
        }
    }

    pub fn connection_state(&self) -> ConnectionState {
        self.state.read().connection_state
    }

    /// Receiver that observes every neighbor table the master sends
    pub fn tables(&self) -> watch::Receiver<Option<Arc<NeighborTable>>> {
        self.table_rx.clone()
    }

    /// Wait for the first neighbor table
    ///
    /// Fails if the master rejects this agent or the client gives up.
    pub async fn wait_for_table(&self) -> Result<Arc<NeighborTable>> {
        let mut rx = self.table_rx.clone();
        loop {
            if let Some(table) = rx.borrow_and_update().clone() {
                return Ok(table);
            }
            if rx.changed().await.is_err() {
                return Err(self.failure());
            }
        }
    }

    /// Queue a telemetry fact for the master
    pub async fn send_telemetry(&self, fact: TelemetryFact) -> Result<()> {
        self.command_tx
            .send(ClientCommand::Telemetry(fact))
            .await
            .map_err(|_| self.failure())
    }

    /// Ask the master for one agent's advertised address
    pub async fn resolve(&self, token: Token) -> Result<Option<SocketAddr>> {
        let (tx, rx) = oneshot::channel();
        self.command_tx
            .send(ClientCommand::Resolve(token, tx))
            .await
            .map_err(|_| self.failure())?;
        rx.await.map_err(|_| self.failure())
    }

    /// Say goodbye and stop the connection loop
    pub async fn shutdown(&self) {
        let _ = self.command_tx.send(ClientCommand::Shutdown).await;
        let task = self.task.lock().take();
        if let Some(task) = task {
            if let Err(e) = task.await {
                error!(error = %e, "Master client task panicked");
            }
        }
    }

    fn failure(&self) -> Error {
        match self.state.read().failure.clone() {
            Some(FailureReason::Rejected(report)) => Error::RegistrationRejected {
                code: report.code,
                message: report.message,
            },
            Some(FailureReason::Exhausted { attempts }) => Error::ConnectionFailed {
                addr: self.config.master.to_string(),
                message: format!("gave up after {} attempts", attempts),
            },
            None => Error::Cancelled,
        }
    }
}

// ─────────────────────────────────────────────────────────────────
// Client Loop
// ─────────────────────────────────────────────────────────────────

/// How a connection ended
enum Outcome {
    /// Shutdown requested; stop for good
    Stopped,
    /// Master refused us; stop for good
    Rejected(ErrorMessage),
    /// Connection dropped; reconnect
    Lost(Error),
}

struct Connection<'a> {
    config: &'a MasterClientConfig,
    codec: FrameCodec,
    command_rx: &'a mut mpsc::Receiver<ClientCommand>,
    table_tx: &'a watch::Sender<Option<Arc<NeighborTable>>>,
    backlog: &'a mut VecDeque<TelemetryFact>,
    shutdown: &'a CancellationToken,
}

async fn run_client_loop(
    config: MasterClientConfig,
    state: Arc<RwLock<ClientState>>,
    mut command_rx: mpsc::Receiver<ClientCommand>,
    table_tx: watch::Sender<Option<Arc<NeighborTable>>>,
    shutdown: CancellationToken,
) {
    let codec = FrameCodec::new(config.max_frame_bytes);
    let mut backlog = VecDeque::new();
    let mut backoff = ExponentialBackoff {
        initial_interval: config.initial_reconnect_delay,
        max_interval: config.max_reconnect_delay,
        max_elapsed_time: None,
        ..Default::default()
    };

    loop {
        state.write().connection_state = ConnectionState::Connecting;
        debug!(master = %config.master, token = config.token, "Connecting to master");

        let connect = tokio::time::timeout(config.connect_timeout, TcpStream::connect(config.master));
        let connected = tokio::select! {
            _ = shutdown.cancelled() => break,
            result = connect => result,
        };

        match connected {
            Ok(Ok(stream)) => {
                backoff.reset();
                {
                    let mut s = state.write();
                    s.connection_state = ConnectionState::Registered;
                    s.connected_at = Some(Instant::now());
                    s.reconnect_attempts = 0;
                }

                let mut connection = Connection {
                    config: &config,
                    codec,
                    command_rx: &mut command_rx,
                    table_tx: &table_tx,
                    backlog: &mut backlog,
                    shutdown: &shutdown,
                };
                match connection.run(stream).await {
                    Outcome::Stopped => break,
                    Outcome::Rejected(report) => {
                        error!(code = %report.code, message = %report.message, "Master rejected this agent");
                        let mut s = state.write();
                        s.connection_state = ConnectionState::Rejected;
                        s.failure = Some(FailureReason::Rejected(report));
                        return;
                    }
                    Outcome::Lost(e) => {
                        warn!(error = %e, "Lost master connection");
                    }
                }
            }
            Ok(Err(e)) => {
                debug!(master = %config.master, error = %e, "Failed to connect to master");
            }
            Err(_) => {
                debug!(master = %config.master, "Master connect timed out");
            }
        }

        let attempts = {
            let mut s = state.write();
            s.connection_state = ConnectionState::Reconnecting;
            s.reconnect_attempts += 1;
            s.reconnect_attempts
        };

        if config.max_reconnect_attempts > 0 && attempts >= config.max_reconnect_attempts {
            error!(attempts, "Max reconnection attempts reached");
            state.write().failure = Some(FailureReason::Exhausted { attempts });
            return;
        }

        let delay = backoff.next_backoff().unwrap_or(config.max_reconnect_delay);
        debug!(delay_ms = delay.as_millis() as u64, attempt = attempts, "Waiting before reconnection");

        // Keep serving commands while the master is away
        let sleep = tokio::time::sleep(delay);
        tokio::pin!(sleep);
        loop {
            tokio::select! {
                _ = &mut sleep => break,
                _ = shutdown.cancelled() => {
                    state.write().connection_state = ConnectionState::ShuttingDown;
                    info!("Master client stopped");
                    return;
                }
                cmd = command_rx.recv() => match cmd {
                    Some(ClientCommand::Telemetry(fact)) => push_backlog(&mut backlog, fact),
                    Some(ClientCommand::Resolve(_, reply)) => {
                        let _ = reply.send(None);
                    }
                    Some(ClientCommand::Shutdown) | None => {
                        state.write().connection_state = ConnectionState::ShuttingDown;
                        info!("Master client stopped");
                        return;
                    }
                }
            }
        }
    }

    state.write().connection_state = ConnectionState::ShuttingDown;
    info!("Master client stopped");
}

fn push_backlog(backlog: &mut VecDeque<TelemetryFact>, fact: TelemetryFact) {
    if backlog.len() == BACKLOG_LIMIT {
        backlog.pop_front();
        warn!("Telemetry backlog full, dropping oldest fact");
    }
    backlog.push_back(fact);
}

impl Connection<'_> {
    async fn run(&mut self, stream: TcpStream) -> Outcome {
        let (mut reader, mut writer) = stream.into_split();
        let codec = self.codec;

        let register = Message::Register(RegisterRequest {
            token: self.config.token,
            listen_addr: self.config.listen_addr,
            version: PROTOCOL_VERSION,
        });
        if let Err(e) = codec.write(&mut writer, &register).await {
            return Outcome::Lost(e);
        }
        info!(token = self.config.token, master = %self.config.master, "Registered with master");

        while let Some(fact) = self.backlog.pop_front() {
            if let Err(e) = codec.write(&mut writer, &Message::Telemetry(fact)).await {
                return Outcome::Lost(e);
            }
        }

        let mut pending: HashMap<Token, Vec<oneshot::Sender<Option<SocketAddr>>>> = HashMap::new();

        // Frame reads are not cancel-safe, so they live in their own task
        let (frame_tx, mut frame_rx) = mpsc::channel::<Result<Message>>(16);
        let reader_task = tokio::spawn(async move {
            loop {
                let result = codec.read(&mut reader).await;
                let failed = result.is_err();
                if frame_tx.send(result).await.is_err() || failed {
                    break;
                }
            }
        });

        let outcome = loop {
            tokio::select! {
                _ = self.shutdown.cancelled() => {
                    let _ = codec.write(&mut writer, &goodbye("agent shutting down")).await;
                    break Outcome::Stopped;
                }
                frame = frame_rx.recv() => {
                    let msg = match frame {
                        Some(Ok(msg)) => msg,
                        Some(Err(e)) => break Outcome::Lost(e),
                        None => break Outcome::Lost(Error::ConnectionLost {
                            peer: self.config.master.to_string(),
                            message: "reader stopped".to_string(),
                        }),
                    };
                    match msg {
                        Message::NeighborTable(table) => {
                            info!(neighbors = table.entries.len(), agents = table.agent_count, "Received neighbor table");
                            self.table_tx.send_replace(Some(Arc::new(table)));
                        }
                        Message::Resolved(reply) => {
                            if let Some(waiters) = pending.remove(&reply.token) {
                                for waiter in waiters {
                                    let _ = waiter.send(reply.addr);
                                }
                            }
                        }
                        Message::Error(report) if report.fatal => break Outcome::Rejected(report),
                        Message::Error(report) => {
                            warn!(code = %report.code, message = %report.message, "Master reported error");
                        }
                        other => {
                            warn!(message_type = other.type_name(), "Unexpected message from master");
                        }
                    }
                }
                cmd = self.command_rx.recv() => match cmd {
                    Some(ClientCommand::Telemetry(fact)) => {
                        if let Err(e) = codec.write(&mut writer, &Message::Telemetry(fact)).await {
                            break Outcome::Lost(e);
                        }
                    }
                    Some(ClientCommand::Resolve(token, reply)) => {
                        pending.entry(token).or_default().push(reply);
                        let query = Message::Resolve(ResolveRequest { token });
                        if let Err(e) = codec.write(&mut writer, &query).await {
                            break Outcome::Lost(e);
                        }
                    }
                    Some(ClientCommand::Shutdown) | None => {
                        let _ = codec.write(&mut writer, &goodbye("agent shutting down")).await;
                        break Outcome::Stopped;
                    }
                }
            }
        };

        reader_task.abort();
        outcome
    }
}

fn goodbye(reason: &str) -> Message {
    Message::Goodbye(GoodbyeMessage {
        reason: reason.to_string(),
    })
}

#[cfg(test)]
mod tests {
    use std::collections::BTreeMap;

    use tokio::net::TcpListener;

    use super::*;

    fn test_config(master: SocketAddr) -> MasterClientConfig {
        let mut config = MasterClientConfig::new(master, 3, "127.0.0.1:7103".parse().unwrap());
        config.initial_reconnect_delay = Duration::from_millis(10);
        config.max_reconnect_delay = Duration::from_millis(50);
        config
    }

    fn table() -> NeighborTable {
        NeighborTable {
            token: 3,
            degree: 0,
            agent_count: 1,
            entries: BTreeMap::new(),
        }
    }

    async fn accept_register(listener: &TcpListener) -> TcpStream {
        let (mut stream, _) = listener.accept().await.unwrap();
        match crate::protocol::read_message(&mut stream).await.unwrap() {
            Message::Register(request) => {
                assert_eq!(request.token, 3);
                assert_eq!(request.listen_addr.port(), 7103);
            }
            other => panic!("expected REGISTER, got {:?}", other),
        }
        stream
    }

    #[tokio::test]
    async fn test_registers_and_relays_telemetry() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let client = MasterClient::start(test_config(listener.local_addr().unwrap()), CancellationToken::new());

        let mut master = accept_register(&listener).await;
        crate::protocol::write_message(&mut master, &Message::NeighborTable(table()))
            .await
            .unwrap();

        let received = client.wait_for_table().await.unwrap();
        assert_eq!(*received, table());
        assert_eq!(client.connection_state(), ConnectionState::Registered);

        client
            .send_telemetry(TelemetryFact::AgentGeneralInfo { batches_per_epoch: 9 })
            .await
            .unwrap();
        assert_eq!(
            crate::protocol::read_message(&mut master).await.unwrap(),
            Message::Telemetry(TelemetryFact::AgentGeneralInfo { batches_per_epoch: 9 })
        );

        client.shutdown().await;
        assert!(matches!(
            crate::protocol::read_message(&mut master).await.unwrap(),
            Message::Goodbye(_)
        ));
        assert_eq!(client.connection_state(), ConnectionState::ShuttingDown);
    }

    #[tokio::test]
    async fn test_fatal_error_rejects_registration() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let client = MasterClient::start(test_config(listener.local_addr().unwrap()), CancellationToken::new());

        let mut master = accept_register(&listener).await;
        let err = Error::UnknownToken { token: 3 };
        crate::protocol::write_message(&mut master, &Message::Error(ErrorMessage::from(&err)))
            .await
            .unwrap();

        match client.wait_for_table().await {
            Err(Error::RegistrationRejected { code, .. }) => assert_eq!(code, "E111"),
            other => panic!("expected rejection, got {:?}", other),
        }
        assert_eq!(client.connection_state(), ConnectionState::Rejected);
    }

    #[tokio::test]
    async fn test_reregisters_after_connection_loss() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let client = MasterClient::start(test_config(listener.local_addr().unwrap()), CancellationToken::new());

        drop(accept_register(&listener).await);

        // The second connection registers again and then delivers the table
        let mut master = accept_register(&listener).await;
        crate::protocol::write_message(&mut master, &Message::NeighborTable(table()))
            .await
            .unwrap();
        assert_eq!(client.wait_for_table().await.unwrap().token, 3);

        client.shutdown().await;
    }

    #[tokio::test]
    async fn test_gives_up_after_max_attempts() {
        // Reserve a port, then free it so nothing listens there
        let addr = TcpListener::bind("127.0.0.1:0").await.unwrap().local_addr().unwrap();
        let mut config = test_config(addr);
        config.max_reconnect_attempts = 2;
        let client = MasterClient::start(config, CancellationToken::new());

        assert!(matches!(
            client.wait_for_table().await,
            Err(Error::ConnectionFailed { .. })
        ));
        assert!(matches!(
            client.resolve(1).await,
            Err(Error::ConnectionFailed { .. })
        ));
    }

    #[test]
    fn test_backlog_drops_oldest() {
        let mut backlog = VecDeque::new();
        for batch_number in 0..(BACKLOG_LIMIT as u64 + 2) {
            push_backlog(
                &mut backlog,
                TelemetryFact::ModelParameters {
                    batch_number,
                    parameters: Vec::new(),
                },
            );
        }
        assert_eq!(backlog.len(), BACKLOG_LIMIT);
        assert!(matches!(
            backlog.front(),
            Some(TelemetryFact::ModelParameters { batch_number: 2, .. })
        ));
    }
}
