//! Master TCP server
//!
//! Accepts one persistent connection per agent. The first frame on a
//! connection must be `Register`; after that the connection may carry
//! `Telemetry`, `Resolve` and `Goodbye`. Parameter vectors never pass
//! through the master.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use super::registry::AgentRegistry;
use crate::error::{Error, Result};
use crate::protocol::{
    ErrorMessage, FrameCodec, Message, ResolvedResponse, TelemetryFact, DEFAULT_MAX_FRAME_BYTES,
    PROTOCOL_VERSION,
};
use crate::telemetry::TelemetryProcessor;
use crate::topology::{Token, Topology};

// ─────────────────────────────────────────────────────────────────
// Configuration
// ─────────────────────────────────────────────────────────────────

/// Master server configuration
#[derive(Debug, Clone)]
pub struct MasterConfig {
    /// Largest accepted frame
    pub max_frame_bytes: usize,

    /// How long a new connection may take to send `Register`
    pub register_timeout: Duration,

    /// Telemetry facts buffered ahead of the processor
    pub telemetry_queue: usize,
}

impl Default for MasterConfig {
    fn default() -> Self {
        Self {
            max_frame_bytes: DEFAULT_MAX_FRAME_BYTES,
            register_timeout: Duration::from_secs(30),
            telemetry_queue: 1024,
        }
    }
}

// ─────────────────────────────────────────────────────────────────
// Master Handle
// ─────────────────────────────────────────────────────────────────

/// Handle to a running master
pub struct MasterHandle {
    local_addr: SocketAddr,
    registry: Arc<AgentRegistry>,
    shutdown: CancellationToken,
    accept_task: JoinHandle<()>,
    telemetry_task: JoinHandle<()>,
}

impl MasterHandle {
    /// Address the master is listening on
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    pub fn registry(&self) -> &Arc<AgentRegistry> {
        &self.registry
    }

    /// Token that stops the master when cancelled
    pub fn shutdown_token(&self) -> CancellationToken {
        self.shutdown.clone()
    }

    /// Run until the shutdown token is cancelled
    pub async fn wait(self) {
        self.shutdown.cancelled().await;
        self.finish().await;
    }

    /// Close every connection and drain pending telemetry
    pub async fn shutdown(self) {
        self.shutdown.cancel();
        self.finish().await;
    }

    async fn finish(self) {
        if let Err(e) = self.accept_task.await {
            error!(error = %e, "Accept loop panicked");
        }
        if let Err(e) = self.telemetry_task.await {
            error!(error = %e, "Telemetry consumer panicked");
        }
        info!("Master stopped");
    }
}

// ─────────────────────────────────────────────────────────────────
// Master
// ─────────────────────────────────────────────────────────────────

/// State shared by every connection task
struct Shared {
    registry: Arc<AgentRegistry>,
    codec: FrameCodec,
    config: MasterConfig,
    telemetry_tx: mpsc::Sender<(Token, TelemetryFact)>,
    shutdown: CancellationToken,
}

/// Bind, start accepting, and return without blocking
pub async fn start<P>(
    bind: SocketAddr,
    topology: Topology,
    processor: P,
    config: MasterConfig,
) -> Result<MasterHandle>
where
    P: TelemetryProcessor + 'static,
{
    if !topology.is_connected() {
        warn!("Topology is not connected; agents will not reach a common average");
    }

    let listener = TcpListener::bind(bind)
        .await
        .map_err(|e| Error::connection_failed(bind, e.to_string()))?;
    let local_addr = listener.local_addr()?;
    info!(
        addr = %local_addr,
        agents = topology.agent_count(),
        edges = topology.edge_count(),
        "Master listening"
    );

    let registry = Arc::new(AgentRegistry::new(Arc::new(topology)));
    let shutdown = CancellationToken::new();
    let (telemetry_tx, telemetry_rx) = mpsc::channel(config.telemetry_queue.max(1));

    let telemetry_task = tokio::task::spawn_blocking(move || run_telemetry(processor, telemetry_rx));

    let shared = Arc::new(Shared {
        registry: Arc::clone(&registry),
        codec: FrameCodec::new(config.max_frame_bytes),
        config,
        telemetry_tx,
        shutdown: shutdown.clone(),
    });
    let accept_task = tokio::spawn(accept_loop(listener, shared));

    Ok(MasterHandle {
        local_addr,
        registry,
        shutdown,
        accept_task,
        telemetry_task,
    })
}

/// Single consumer: at most one `process` call at a time, in queue order
fn run_telemetry<P: TelemetryProcessor>(
    mut processor: P,
    mut rx: mpsc::Receiver<(Token, TelemetryFact)>,
) {
    while let Some((token, fact)) = rx.blocking_recv() {
        let kind = fact.name();
        if let Err(e) = processor.process(token, fact) {
            warn!(token, fact = kind, error = %e, "Telemetry processor failed");
        }
    }
    debug!("Telemetry consumer finished");
}

async fn accept_loop(listener: TcpListener, shared: Arc<Shared>) {
    loop {
        tokio::select! {
            _ = shared.shutdown.cancelled() => break,
            accepted = listener.accept() => match accepted {
                Ok((stream, peer_addr)) => {
                    debug!(peer_addr = %peer_addr, "Incoming agent connection");
                    let shared = Arc::clone(&shared);
                    tokio::spawn(async move {
                        if let Err(e) = handle_agent(stream, peer_addr, &shared).await {
                            if e.is_disconnect() {
                                debug!(peer_addr = %peer_addr, "Agent connection closed");
                            } else {
                                warn!(peer_addr = %peer_addr, error = %e.format_for_log(), "Agent connection failed");
                            }
                        }
                    });
                }
                Err(e) => {
                    error!(error = %e, "Accept failed");
                    tokio::time::sleep(Duration::from_millis(100)).await;
                }
            }
        }
    }
    debug!("Accept loop finished");
}

/// Serve one agent connection until it closes, is replaced, or the master stops
async fn handle_agent(stream: TcpStream, peer_addr: SocketAddr, shared: &Shared) -> Result<()> {
    let codec = shared.codec;
    let (mut reader, mut writer) = stream.into_split();

    let first = tokio::select! {
        _ = shared.shutdown.cancelled() => return Ok(()),
        first = tokio::time::timeout(shared.config.register_timeout, codec.read(&mut reader)) => {
            first.map_err(|_| Error::ConnectionTimeout {
                addr: peer_addr.to_string(),
                timeout_ms: shared.config.register_timeout.as_millis() as u64,
            })??
        }
    };

    let request = match first {
        Message::Register(request) => request,
        other => {
            let err = Error::unexpected(other.type_name(), "first message must be REGISTER");
            let _ = codec.write(&mut writer, &Message::Error(ErrorMessage::from(&err))).await;
            return Err(err);
        }
    };
    let token = request.token;

    let (outbox_tx, mut outbox_rx) = mpsc::unbounded_channel::<Message>();
    let cancel = shared.shutdown.child_token();
    let registered = PROTOCOL_VERSION.check(&request.version).and_then(|_| {
        shared
            .registry
            .register(token, request.listen_addr, outbox_tx.clone(), cancel.clone())
    });
    let registration = match registered {
        Ok(registration) => registration,
        Err(err) => {
            let _ = codec.write(&mut writer, &Message::Error(ErrorMessage::from(&err))).await;
            return Err(err);
        }
    };
    let session = registration.session;

    // Writer: everything the master sends to this agent goes through the outbox
    let writer_cancel = cancel.clone();
    let writer_task = tokio::spawn(async move {
        loop {
            tokio::select! {
                biased;
                msg = outbox_rx.recv() => {
                    let Some(msg) = msg else { break };
                    if let Err(e) = codec.write(&mut writer, &msg).await {
                        debug!(token, error = %e, "Agent write failed");
                        writer_cancel.cancel();
                        break;
                    }
                }
                _ = writer_cancel.cancelled() => break,
            }
        }
    });

    let result = loop {
        let msg = tokio::select! {
            _ = cancel.cancelled() => break Ok(()),
            msg = codec.read(&mut reader) => msg,
        };

        match msg {
            Ok(Message::Telemetry(fact)) => {
                if !shared.registry.is_current(token, session) {
                    debug!(token, "Dropping telemetry from replaced connection");
                    continue;
                }
                if shared.telemetry_tx.send((token, fact)).await.is_err() {
                    break Ok(());
                }
            }
            Ok(Message::Resolve(query)) => {
                let reply = ResolvedResponse {
                    token: query.token,
                    addr: shared.registry.resolve(query.token),
                };
                let _ = outbox_tx.send(Message::Resolved(reply));
            }
            Ok(Message::Goodbye(goodbye)) => {
                info!(token, reason = %goodbye.reason, "Agent said goodbye");
                break Ok(());
            }
            Ok(Message::Error(report)) => {
                warn!(token, code = %report.code, message = %report.message, "Agent reported error");
            }
            Ok(other) => {
                let err = Error::unexpected(other.type_name(), "not valid on a master connection");
                let _ = outbox_tx.send(Message::Error(ErrorMessage::from(&err)));
                break Err(err);
            }
            Err(e) => break Err(e),
        }
    };

    shared.registry.mark_gone(token, session);
    // The writer drains queued replies before it observes the cancellation
    cancel.cancel();
    let _ = tokio::time::timeout(Duration::from_secs(1), writer_task).await;

    match &result {
        Ok(()) => info!(token, "Agent disconnected"),
        Err(e) if e.is_disconnect() => info!(token, "Agent connection dropped"),
        Err(_) => {}
    }
    result
}
