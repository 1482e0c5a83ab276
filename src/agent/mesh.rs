//! Peer-to-peer links between neighboring agents
//!
//! Every edge is carried by two TCP connections. The dialed (outbound)
//! connection carries our vectors to the neighbor; the accepted (inbound)
//! connection carries the neighbor's vectors to us. Both directions start
//! with `PeerHello`.
//!
//! Outbound vectors stay queued until the neighbor proves it consumed them,
//! so a link that drops and reconnects resends what may have been lost. The
//! receiving side discards duplicates by round id, and drops vectors whose
//! epoch names an earlier incarnation of itself.

use std::collections::{BTreeSet, HashMap, VecDeque};
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use backoff::{backoff::Backoff, ExponentialBackoff};
use parking_lot::{Mutex, RwLock};
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{mpsc, Notify};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::error::{Error, Result};
use crate::protocol::{
    ErrorMessage, FrameCodec, Message, NeighborTable, PeerHello, PeerVector,
    DEFAULT_MAX_FRAME_BYTES,
};
use crate::topology::Token;

// ─────────────────────────────────────────────────────────────────
// Transport
// ─────────────────────────────────────────────────────────────────

/// Accept and dial capability shared by every edge
#[async_trait]
pub trait PeerTransport: Send + Sync + 'static {
    type Stream: AsyncRead + AsyncWrite + Send + Unpin + 'static;

    async fn accept(&self) -> std::io::Result<(Self::Stream, SocketAddr)>;

    async fn dial(&self, addr: SocketAddr) -> std::io::Result<Self::Stream>;

    fn local_addr(&self) -> SocketAddr;
}

/// Plain TCP transport
pub struct TcpTransport {
    listener: TcpListener,
    local_addr: SocketAddr,
}

impl TcpTransport {
    pub async fn bind(addr: SocketAddr) -> Result<Self> {
        let listener = TcpListener::bind(addr)
            .await
            .map_err(|e| Error::connection_failed(addr, e.to_string()))?;
        let local_addr = listener.local_addr()?;
        Ok(Self {
            listener,
            local_addr,
        })
    }
}

#[async_trait]
impl PeerTransport for TcpTransport {
    type Stream = TcpStream;

    async fn accept(&self) -> std::io::Result<(TcpStream, SocketAddr)> {
        self.listener.accept().await
    }

    async fn dial(&self, addr: SocketAddr) -> std::io::Result<TcpStream> {
        let stream = TcpStream::connect(addr).await?;
        stream.set_nodelay(true)?;
        Ok(stream)
    }

    fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }
}

// ─────────────────────────────────────────────────────────────────
// Configuration
// ─────────────────────────────────────────────────────────────────

/// Mesh networking configuration
#[derive(Debug, Clone)]
pub struct MeshConfig {
    /// Timeout for one dial attempt
    pub connect_timeout: Duration,

    /// How long an accepted connection may take to send `PeerHello`
    pub handshake_timeout: Duration,

    pub initial_reconnect_delay: Duration,
    pub max_reconnect_delay: Duration,

    pub max_frame_bytes: usize,

    /// Inbound events buffered ahead of the engine
    pub inbound_queue: usize,
}

impl Default for MeshConfig {
    fn default() -> Self {
        Self {
            connect_timeout: Duration::from_secs(10),
            handshake_timeout: Duration::from_secs(10),
            initial_reconnect_delay: Duration::from_millis(100),
            max_reconnect_delay: Duration::from_secs(5),
            max_frame_bytes: DEFAULT_MAX_FRAME_BYTES,
            inbound_queue: 1024,
        }
    }
}

// ─────────────────────────────────────────────────────────────────
// Events emitted by the mesh to the engine
// ─────────────────────────────────────────────────────────────────

#[derive(Debug)]
pub enum InboundEvent {
    /// A neighbor opened a new inbound connection
    Connected { from: Token, incarnation: Uuid },

    /// A vector arrived from a neighbor on the connection opened by `incarnation`
    Vector {
        from: Token,
        incarnation: Uuid,
        vector: PeerVector,
    },
}

// ─────────────────────────────────────────────────────────────────
// Outbound links
// ─────────────────────────────────────────────────────────────────

struct LinkQueue {
    addr: SocketAddr,

    /// Vectors not yet known to be consumed, in round order
    pending: VecDeque<PeerVector>,

    /// Bumped whenever round ids restart from zero
    generation: u64,
}

struct Link {
    queue: Mutex<LinkQueue>,
    notify: Notify,
    cancel: CancellationToken,
}

struct InboundConnection {
    id: u64,
    cancel: CancellationToken,
}

// ─────────────────────────────────────────────────────────────────
// Peer Mesh
// ─────────────────────────────────────────────────────────────────

/// Manages the connections between one agent and its neighbors
pub struct PeerMesh<T: PeerTransport> {
    token: Token,
    incarnation: Uuid,
    transport: Arc<T>,
    codec: FrameCodec,
    config: MeshConfig,
    neighbors: RwLock<Option<BTreeSet<Token>>>,
    links: Mutex<HashMap<Token, Arc<Link>>>,
    inbound: Mutex<HashMap<Token, InboundConnection>>,
    next_connection_id: AtomicU64,
    accepting: AtomicBool,
    event_tx: mpsc::Sender<InboundEvent>,
    shutdown: CancellationToken,
}

impl<T: PeerTransport> PeerMesh<T> {
    /// Create a mesh and the receiver for its inbound events
    pub fn new(
        token: Token,
        transport: T,
        config: MeshConfig,
        shutdown: CancellationToken,
    ) -> (Arc<Self>, mpsc::Receiver<InboundEvent>) {
        let (event_tx, event_rx) = mpsc::channel(config.inbound_queue.max(1));
        let mesh = Arc::new(Self {
            token,
            incarnation: Uuid::new_v4(),
            transport: Arc::new(transport),
            codec: FrameCodec::new(config.max_frame_bytes),
            config,
            neighbors: RwLock::new(None),
            links: Mutex::new(HashMap::new()),
            inbound: Mutex::new(HashMap::new()),
            next_connection_id: AtomicU64::new(0),
            accepting: AtomicBool::new(false),
            event_tx,
            shutdown,
        });
        (mesh, event_rx)
    }

    pub fn token(&self) -> Token {
        self.token
    }

    /// Identity of this process, sent in every `PeerHello`
    pub fn incarnation(&self) -> Uuid {
        self.incarnation
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.transport.local_addr()
    }

    /// Start the accept loop; later calls are no-ops
    pub fn start_accepting(self: &Arc<Self>) -> bool {
        if self.accepting.swap(true, Ordering::SeqCst) {
            return false;
        }
        let mesh = Arc::clone(self);
        tokio::spawn(async move { mesh.accept_loop().await });
        info!(token = self.token, addr = %self.local_addr(), "Accepting peer connections");
        true
    }

    /// Open links to every neighbor in `table`, redirecting links whose address changed
    pub fn connect_neighbors(self: &Arc<Self>, table: &NeighborTable) {
        *self.neighbors.write() = Some(table.entries.keys().copied().collect());

        let mut links = self.links.lock();
        for (&peer, entry) in &table.entries {
            if let Some(link) = links.get(&peer) {
                let mut queue = link.queue.lock();
                if queue.addr != entry.addr {
                    info!(peer, old = %queue.addr, new = %entry.addr, "Neighbor moved");
                    queue.addr = entry.addr;
                    link.notify.notify_one();
                }
                continue;
            }

            let link = Arc::new(Link {
                queue: Mutex::new(LinkQueue {
                    addr: entry.addr,
                    pending: VecDeque::new(),
                    generation: 0,
                }),
                notify: Notify::new(),
                cancel: self.shutdown.child_token(),
            });
            links.insert(peer, Arc::clone(&link));

            let mesh = Arc::clone(self);
            tokio::spawn(async move { mesh.run_link(peer, link).await });
        }
    }

    /// Queue a vector for `peer`
    pub fn push(&self, peer: Token, vector: PeerVector) -> Result<()> {
        let link = self
            .links
            .lock()
            .get(&peer)
            .cloned()
            .ok_or(Error::UnknownToken { token: peer })?;
        link.queue.lock().pending.push_back(vector);
        link.notify.notify_one();
        Ok(())
    }

    /// Forget queued vectors with a round below `round`
    pub fn prune(&self, peer: Token, round: u64) {
        if let Some(link) = self.links.lock().get(&peer) {
            let mut queue = link.queue.lock();
            while queue.pending.front().is_some_and(|v| v.round < round) {
                queue.pending.pop_front();
            }
        }
    }

    /// Drop every queued vector for `peer` and restart its round ids
    pub fn reset_link(&self, peer: Token) {
        if let Some(link) = self.links.lock().get(&peer) {
            let mut queue = link.queue.lock();
            queue.pending.clear();
            queue.generation += 1;
        }
    }

    /// Close the inbound connection from `peer`; it stays closed until the peer redials
    pub fn drop_inbound(&self, peer: Token) {
        if let Some(conn) = self.inbound.lock().remove(&peer) {
            warn!(peer, "Closing inbound connection");
            conn.cancel.cancel();
        }
    }

    /// Neighbors with an open inbound connection
    pub fn connected_inbound(&self) -> Vec<Token> {
        let mut tokens: Vec<Token> = self.inbound.lock().keys().copied().collect();
        tokens.sort_unstable();
        tokens
    }

    // ─── Inbound ────────────────────────────────────────────────

    async fn accept_loop(self: Arc<Self>) {
        loop {
            tokio::select! {
                _ = self.shutdown.cancelled() => break,
                accepted = self.transport.accept() => match accepted {
                    Ok((stream, remote)) => {
                        let mesh = Arc::clone(&self);
                        tokio::spawn(async move {
                            if let Err(e) = mesh.handle_inbound(stream, remote).await {
                                if e.is_disconnect() {
                                    debug!(remote = %remote, "Inbound peer connection closed");
                                } else {
                                    warn!(remote = %remote, error = %e.format_for_log(), "Inbound peer connection failed");
                                }
                            }
                        });
                    }
                    Err(e) => {
                        error!(error = %e, "Peer accept failed");
                        tokio::time::sleep(Duration::from_millis(100)).await;
                    }
                }
            }
        }
        debug!(token = self.token, "Peer accept loop finished");
    }

    async fn handle_inbound(&self, stream: T::Stream, remote: SocketAddr) -> Result<()> {
        let (mut reader, mut writer) = tokio::io::split(stream);
        let codec = self.codec;

        let first = tokio::time::timeout(self.config.handshake_timeout, codec.read(&mut reader))
            .await
            .map_err(|_| Error::ConnectionTimeout {
                addr: remote.to_string(),
                timeout_ms: self.config.handshake_timeout.as_millis() as u64,
            })??;

        let hello = match first {
            Message::PeerHello(hello) => hello,
            other => {
                let err = Error::unexpected(other.type_name(), "first message must be PEER_HELLO");
                let _ = codec.write(&mut writer, &Message::Error(ErrorMessage::from(&err))).await;
                return Err(err);
            }
        };

        let known = self
            .neighbors
            .read()
            .as_ref()
            .map_or(true, |n| n.contains(&hello.token));
        if hello.token == self.token || !known {
            let err = Error::malformed(format!("agent {} is not a neighbor of {}", hello.token, self.token));
            let _ = codec.write(&mut writer, &Message::Error(ErrorMessage::from(&err))).await;
            return Err(err);
        }

        let peer = hello.token;
        let id = self.next_connection_id.fetch_add(1, Ordering::Relaxed);
        let cancel = self.shutdown.child_token();
        if let Some(old) = self.inbound.lock().insert(
            peer,
            InboundConnection {
                id,
                cancel: cancel.clone(),
            },
        ) {
            debug!(peer, "Replacing previous inbound connection");
            old.cancel.cancel();
        }
        info!(peer, remote = %remote, "Inbound peer connection established");

        let connected = InboundEvent::Connected {
            from: peer,
            incarnation: hello.incarnation,
        };
        let mut result = if self.event_tx.send(connected).await.is_err() {
            Ok(())
        } else {
            self.read_vectors(peer, hello.incarnation, &mut reader, &cancel).await
        };

        if let Err(e @ Error::ProtocolUnexpected { .. }) = &result {
            let _ = codec.write(&mut writer, &Message::Error(ErrorMessage::from(e))).await;
        }

        {
            let mut inbound = self.inbound.lock();
            if inbound.get(&peer).is_some_and(|c| c.id == id) {
                inbound.remove(&peer);
            }
        }
        if cancel.is_cancelled() {
            result = Ok(());
        }
        result
    }

    async fn read_vectors<R>(
        &self,
        peer: Token,
        incarnation: Uuid,
        reader: &mut R,
        cancel: &CancellationToken,
    ) -> Result<()>
    where
        R: AsyncRead + Unpin,
    {
        loop {
            let msg = tokio::select! {
                _ = cancel.cancelled() => return Ok(()),
                msg = self.codec.read(reader) => msg?,
            };

            match msg {
                Message::PeerVector(vector) => {
                    if vector.epoch != self.incarnation {
                        debug!(peer, round = vector.round, "Dropping vector addressed to an earlier incarnation");
                        continue;
                    }
                    let event = InboundEvent::Vector {
                        from: peer,
                        incarnation,
                        vector,
                    };
                    tokio::select! {
                        _ = cancel.cancelled() => return Ok(()),
                        sent = self.event_tx.send(event) => {
                            if sent.is_err() {
                                return Ok(());
                            }
                        }
                    }
                }
                Message::Error(report) => {
                    warn!(peer, code = %report.code, message = %report.message, "Peer reported error");
                }
                Message::Goodbye(_) => return Ok(()),
                other => {
                    return Err(Error::unexpected(other.type_name(), "not valid on a peer connection"));
                }
            }
        }
    }

    // ─── Outbound ───────────────────────────────────────────────

    async fn run_link(self: Arc<Self>, peer: Token, link: Arc<Link>) {
        let mut backoff = ExponentialBackoff {
            initial_interval: self.config.initial_reconnect_delay,
            max_interval: self.config.max_reconnect_delay,
            max_elapsed_time: None,
            ..Default::default()
        };

        loop {
            let addr = link.queue.lock().addr;
            let dial = tokio::time::timeout(self.config.connect_timeout, self.transport.dial(addr));
            let dialed = tokio::select! {
                _ = link.cancel.cancelled() => break,
                dialed = dial => dialed,
            };

            match dialed {
                Ok(Ok(stream)) => {
                    debug!(peer, addr = %addr, "Outbound peer link established");
                    let mut delivered = false;
                    match self.drive_link(peer, &link, addr, stream, &mut delivered).await {
                        Ok(()) => break,
                        Err(e) if e.is_disconnect() => debug!(peer, "Outbound peer link closed"),
                        Err(e) => warn!(peer, error = %e.format_for_log(), "Outbound peer link failed"),
                    }
                    if delivered {
                        backoff.reset();
                    }
                }
                Ok(Err(e)) => debug!(peer, addr = %addr, error = %e, "Dial failed"),
                Err(_) => debug!(peer, addr = %addr, "Dial timed out"),
            }

            let delay = backoff.next_backoff().unwrap_or(self.config.max_reconnect_delay);
            tokio::select! {
                _ = link.cancel.cancelled() => break,
                _ = tokio::time::sleep(delay) => {}
            }
        }
        debug!(peer, "Outbound peer link stopped");
    }

    /// Send queued vectors until the connection breaks or the neighbor moves
    async fn drive_link(
        &self,
        peer: Token,
        link: &Link,
        addr: SocketAddr,
        stream: T::Stream,
        delivered: &mut bool,
    ) -> Result<()> {
        let (mut reader, mut writer) = tokio::io::split(stream);
        let codec = self.codec;

        let hello = Message::PeerHello(PeerHello {
            token: self.token,
            incarnation: self.incarnation,
        });
        codec.write(&mut writer, &hello).await?;

        // The acceptor only writes to report an error, so any frame or EOF ends the link
        let closed = tokio::spawn(async move {
            match codec.read(&mut reader).await {
                Ok(Message::Error(report)) => Error::ConnectionLost {
                    peer: peer.to_string(),
                    message: format!("[{}] {}", report.code, report.message),
                },
                Ok(other) => Error::unexpected(other.type_name(), "peer wrote on an outbound link"),
                Err(e) => e,
            }
        });
        let mut closed = AbortOnDrop(closed);

        let mut generation = link.queue.lock().generation;
        let mut last_sent: Option<u64> = None;

        loop {
            let batch: Vec<PeerVector> = {
                let queue = link.queue.lock();
                if queue.addr != addr {
                    return Err(Error::ConnectionLost {
                        peer: peer.to_string(),
                        message: format!("neighbor moved to {}", queue.addr),
                    });
                }
                if queue.generation != generation {
                    generation = queue.generation;
                    last_sent = None;
                }
                queue
                    .pending
                    .iter()
                    .filter(|v| last_sent.map_or(true, |r| v.round > r))
                    .cloned()
                    .collect()
            };

            for vector in batch {
                let round = vector.round;
                codec.write(&mut writer, &Message::PeerVector(vector)).await?;
                last_sent = Some(round);
                *delivered = true;
            }

            tokio::select! {
                _ = link.cancel.cancelled() => return Ok(()),
                _ = link.notify.notified() => {}
                err = &mut closed.0 => {
                    return Err(err.unwrap_or_else(|e| Error::Internal(e.to_string())));
                }
            }
        }
    }
}

struct AbortOnDrop<R>(tokio::task::JoinHandle<R>);

impl<R> Drop for AbortOnDrop<R> {
    fn drop(&mut self) {
        self.0.abort();
    }
}

// ─────────────────────────────────────────────────────────────────
// Tests
// ─────────────────────────────────────────────────────────────────
