//! Rendezvous master
//!
//! Resolves agent tokens to peer-listen addresses and relays telemetry to a
//! [`TelemetryProcessor`](crate::telemetry::TelemetryProcessor).

mod registry;
mod server;

pub use registry::{AgentRecord, AgentRegistry, Registration};
pub use server::{start, MasterConfig, MasterHandle};
