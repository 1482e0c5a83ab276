//! Gossip consensus networking
//!
//! A rendezvous [`master`] tells every agent who its neighbors are and relays
//! monitoring facts to a [`telemetry`] processor. Each [`agent`] then averages
//! its parameter vector with its neighbors over direct peer links, either one
//! step at a time or until the whole network agrees.

pub mod agent;
pub mod cli;
pub mod config;
pub mod error;
pub mod logging;
pub mod master;
pub mod protocol;
pub mod telemetry;
pub mod topology;
pub mod trainer;
pub mod version;

pub use agent::{AgentConfig, ConsensusAgent, RoundOutcome};
pub use config::ConsensusConfig;
pub use error::{Error, Result};
pub use topology::{Token, Topology};
