//! Telemetry relay targets
//!
//! The master hands every telemetry fact it receives to a
//! [`TelemetryProcessor`], one call at a time and in per-connection arrival
//! order. Aggregation policy belongs entirely to the processor.

mod processor;
mod statistics;

use std::path::PathBuf;

use thiserror::Error;

use crate::topology::Token;

pub use crate::protocol::TelemetryFact;
pub use processor::{AggregateSink, AggregatingProcessor};
pub use statistics::{StatsEntry, StatsRecord, StatisticsSink};

/// Errors raised by telemetry processors
///
/// The master logs these and keeps running.
#[derive(Error, Debug)]
pub enum TelemetryError {
    #[error("Unsupported telemetry payload '{fact}' from agent {token}")]
    Unsupported { token: Token, fact: String },

    #[error("Telemetry from agent {token}, which is not in the topology")]
    UnknownAgent { token: Token },

    #[error("Agent {token} reported {actual} parameters for batch {batch_number}, others reported {expected}")]
    LengthMismatch {
        token: Token,
        batch_number: u64,
        expected: usize,
        actual: usize,
    },

    #[error("Failed to write statistics to {path}")]
    Write {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Failed to encode statistics record: {0}")]
    Encode(#[from] serde_json::Error),
}

/// Sink for telemetry facts relayed by the master
pub trait TelemetryProcessor: Send {
    fn process(&mut self, token: Token, payload: TelemetryFact) -> Result<(), TelemetryError>;
}
