//! Protocol message definitions
//!
//! Each message maps to one frame kind. Fields marked `#[serde(skip)]` hold
//! parameter vectors and travel in the binary tail of the frame, never in
//! the JSON header.

use std::collections::BTreeMap;
use std::net::SocketAddr;

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use super::ProtocolVersion;
use crate::error::{Error, Result};
use crate::topology::Token;

// ─────────────────────────────────────────────────────────────────
// Message Kinds
// ─────────────────────────────────────────────────────────────────

/// Frame discriminator byte
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum MessageKind {
    Register = 1,
    NeighborTable = 2,
    Resolve = 3,
    Resolved = 4,
    Telemetry = 5,
    PeerHello = 6,
    PeerVector = 7,
    Error = 8,
    Goodbye = 9,
}

impl MessageKind {
    pub fn from_u8(byte: u8) -> Result<Self> {
        Ok(match byte {
            1 => MessageKind::Register,
            2 => MessageKind::NeighborTable,
            3 => MessageKind::Resolve,
            4 => MessageKind::Resolved,
            5 => MessageKind::Telemetry,
            6 => MessageKind::PeerHello,
            7 => MessageKind::PeerVector,
            8 => MessageKind::Error,
            9 => MessageKind::Goodbye,
            other => return Err(Error::malformed(format!("unknown message kind {}", other))),
        })
    }
}

// ─────────────────────────────────────────────────────────────────
// Message Types
// ─────────────────────────────────────────────────────────────────

/// All protocol messages
#[derive(Debug, Clone, PartialEq)]
pub enum Message {
    // ─── Agent → Master ─────────────────────────────────────────
    /// First message on every master connection
    Register(RegisterRequest),

    /// Look up one agent's advertised address
    Resolve(ResolveRequest),

    /// Monitoring fact forwarded to the telemetry processor
    Telemetry(TelemetryFact),

    /// Agent is leaving on purpose
    Goodbye(GoodbyeMessage),

    // ─── Master → Agent ─────────────────────────────────────────
    /// Addresses of the recipient's neighbors, sent once everyone registered
    NeighborTable(NeighborTable),

    /// Answer to `Resolve`
    Resolved(ResolvedResponse),

    // ─── Agent → Agent ──────────────────────────────────────────
    /// First message on every peer connection
    PeerHello(PeerHello),

    /// One mixing contribution
    PeerVector(PeerVector),

    // ─── Any direction ──────────────────────────────────────────
    Error(ErrorMessage),
}

impl Message {
    pub fn kind(&self) -> MessageKind {
        match self {
            Message::Register(_) => MessageKind::Register,
            Message::NeighborTable(_) => MessageKind::NeighborTable,
            Message::Resolve(_) => MessageKind::Resolve,
            Message::Resolved(_) => MessageKind::Resolved,
            Message::Telemetry(_) => MessageKind::Telemetry,
            Message::PeerHello(_) => MessageKind::PeerHello,
            Message::PeerVector(_) => MessageKind::PeerVector,
            Message::Error(_) => MessageKind::Error,
            Message::Goodbye(_) => MessageKind::Goodbye,
        }
    }

    /// Get the message type name
    pub fn type_name(&self) -> &'static str {
        match self {
            Message::Register(_) => "REGISTER",
            Message::NeighborTable(_) => "NEIGHBOR_TABLE",
            Message::Resolve(_) => "RESOLVE",
            Message::Resolved(_) => "RESOLVED",
            Message::Telemetry(_) => "TELEMETRY",
            Message::PeerHello(_) => "PEER_HELLO",
            Message::PeerVector(_) => "PEER_VECTOR",
            Message::Error(_) => "ERROR",
            Message::Goodbye(_) => "GOODBYE",
        }
    }

    /// The vector carried in the frame tail, if this message has one
    pub fn tail(&self) -> Option<&[f32]> {
        match self {
            Message::PeerVector(v) => Some(&v.vector),
            Message::Telemetry(TelemetryFact::ModelParameters { parameters, .. }) => {
                Some(parameters)
            }
            _ => None,
        }
    }

    /// Move a decoded tail into the message
    ///
    /// A non-empty tail on a message without a vector slot is malformed.
    pub(crate) fn attach_tail(&mut self, tail: Vec<f32>) -> Result<()> {
        match self {
            Message::PeerVector(v) => v.vector = tail,
            Message::Telemetry(TelemetryFact::ModelParameters { parameters, .. }) => {
                *parameters = tail
            }
            _ if tail.is_empty() => {}
            other => {
                return Err(Error::malformed(format!(
                    "{} frame carries a {}-element tail",
                    other.type_name(),
                    tail.len()
                )))
            }
        }
        Ok(())
    }
}

// ─────────────────────────────────────────────────────────────────
// Registration
// ─────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RegisterRequest {
    pub token: Token,

    /// Address neighbors should dial to reach this agent
    pub listen_addr: SocketAddr,

    #[serde(default)]
    pub version: ProtocolVersion,
}

/// Neighbor addresses for one agent
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NeighborTable {
    /// Recipient of the table
    pub token: Token,

    /// Recipient's own degree
    pub degree: usize,

    /// Size of the whole agent set
    pub agent_count: usize,

    pub entries: BTreeMap<Token, NeighborEntry>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct NeighborEntry {
    pub addr: SocketAddr,
    pub degree: usize,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResolveRequest {
    pub token: Token,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResolvedResponse {
    pub token: Token,

    /// `None` until the master has released addresses
    #[serde(default)]
    pub addr: Option<SocketAddr>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GoodbyeMessage {
    pub reason: String,
}

// ─────────────────────────────────────────────────────────────────
// Telemetry
// ─────────────────────────────────────────────────────────────────

/// Monitoring fact reported by an agent
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "fact", rename_all = "snake_case")]
pub enum TelemetryFact {
    /// Parameter snapshot after a given batch
    ModelParameters {
        batch_number: u64,
        #[serde(skip)]
        parameters: Vec<f32>,
    },

    /// Static facts about the agent's local training setup
    AgentGeneralInfo { batches_per_epoch: u64 },

    /// A fact kind this build does not know
    #[serde(other)]
    Unsupported,
}

impl TelemetryFact {
    pub fn name(&self) -> &'static str {
        match self {
            TelemetryFact::ModelParameters { .. } => "model_parameters",
            TelemetryFact::AgentGeneralInfo { .. } => "agent_general_info",
            TelemetryFact::Unsupported => "unsupported",
        }
    }
}

// ─────────────────────────────────────────────────────────────────
// Peer Exchange
// ─────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PeerHello {
    pub token: Token,

    /// Identifies the sending process; a new value means the peer restarted
    #[serde(default)]
    pub incarnation: Uuid,
}

/// One agent's contribution to a mixing step on one edge
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PeerVector {
    /// Per-edge round id, restarting at 0 when either side restarts
    pub round: u64,

    /// Receiver incarnation the sender last saw; vectors addressed to an
    /// earlier incarnation of the receiver are dropped on arrival
    #[serde(default)]
    pub epoch: Uuid,

    /// Bootstrap weight of the sender (1.0 outside leader bootstrap)
    pub weight: f32,

    /// Consecutive low-residual steps seen by the sender's neighborhood
    #[serde(default)]
    pub streak: u32,

    /// Agreed step index at which a converging round stops
    #[serde(default)]
    pub stop_at: Option<u64>,

    #[serde(skip)]
    pub vector: Vec<f32>,
}

// ─────────────────────────────────────────────────────────────────
// Errors
// ─────────────────────────────────────────────────────────────────

/// Error report sent before closing a connection
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ErrorMessage {
    /// Error code (e.g. "E111")
    pub code: String,

    pub message: String,

    /// Whether the receiver should give up instead of retrying
    #[serde(default)]
    pub fatal: bool,
}

impl From<&Error> for ErrorMessage {
    fn from(err: &Error) -> Self {
        Self {
            code: err.code().as_str(),
            message: err.to_string(),
            fatal: err.is_fatal(),
        }
    }
}

// ─────────────────────────────────────────────────────────────────
// Tests
// ─────────────────────────────────────────────────────────────────
