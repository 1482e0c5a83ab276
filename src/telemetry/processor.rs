//! Report accumulation
//!
//! Parameter reports are bucketed by batch number. A bucket is created on the
//! first report for its batch, flushed to the sink as soon as every agent has
//! reported, and evicted at that moment; a later report for the same batch
//! opens a fresh bucket. General-info reports are collected in a single map
//! that is flushed once, when it first covers every agent.

use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::time::{Duration, Instant};

use tracing::{debug, warn};

use super::{TelemetryError, TelemetryFact, TelemetryProcessor};
use crate::topology::Token;

/// Receives complete aggregates
pub trait AggregateSink: Send {
    /// Every agent reported parameters for `batch_number`
    fn on_parameters(
        &mut self,
        batch_number: u64,
        reports: &BTreeMap<Token, Vec<f32>>,
    ) -> Result<(), TelemetryError>;

    /// Every agent reported its general info
    fn on_general_info(&mut self, batches_per_epoch: &BTreeMap<Token, u64>) -> Result<(), TelemetryError>;
}

struct Bucket {
    reports: BTreeMap<Token, Vec<f32>>,
    opened_at: Instant,
}

/// Processor that waits for a report from every agent before flushing
pub struct AggregatingProcessor<S> {
    agents: BTreeSet<Token>,
    buckets: HashMap<u64, Bucket>,
    general_info: BTreeMap<Token, u64>,
    general_info_flushed: bool,
    stale_after: Option<Duration>,
    sink: S,
}

impl<S: AggregateSink> AggregatingProcessor<S> {
    pub fn new(agents: impl IntoIterator<Item = Token>, sink: S) -> Self {
        Self {
            agents: agents.into_iter().collect(),
            buckets: HashMap::new(),
            general_info: BTreeMap::new(),
            general_info_flushed: false,
            stale_after: None,
            sink,
        }
    }

    /// Drop incomplete buckets older than `after`
    pub fn with_stale_after(mut self, after: Option<Duration>) -> Self {
        self.stale_after = after;
        self
    }

    /// Batch numbers with an incomplete bucket
    pub fn open_buckets(&self) -> Vec<u64> {
        let mut open: Vec<u64> = self.buckets.keys().copied().collect();
        open.sort_unstable();
        open
    }

    pub fn sink(&self) -> &S {
        &self.sink
    }

    fn evict_stale(&mut self) {
        let Some(limit) = self.stale_after else {
            return;
        };

        let agents = &self.agents;
        self.buckets.retain(|batch_number, bucket| {
            if bucket.opened_at.elapsed() < limit {
                return true;
            }
            let missing: Vec<Token> = agents
                .iter()
                .filter(|t| !bucket.reports.contains_key(t))
                .copied()
                .collect();
            warn!(
                batch_number,
                missing = ?missing,
                "Evicting stale telemetry bucket"
            );
            false
        });
    }

    fn add_parameters(
        &mut self,
        token: Token,
        batch_number: u64,
        parameters: Vec<f32>,
    ) -> Result<(), TelemetryError> {
        let bucket = self.buckets.entry(batch_number).or_insert_with(|| Bucket {
            reports: BTreeMap::new(),
            opened_at: Instant::now(),
        });

        if let Some(expected) = bucket
            .reports
            .iter()
            .find(|(t, _)| **t != token)
            .map(|(_, v)| v.len())
        {
            if expected != parameters.len() {
                return Err(TelemetryError::LengthMismatch {
                    token,
                    batch_number,
                    expected,
                    actual: parameters.len(),
                });
            }
        }

        if bucket.reports.insert(token, parameters).is_some() {
            debug!(token, batch_number, "Replacing earlier report in bucket");
        }

        if bucket.reports.len() < self.agents.len() {
            return Ok(());
        }

        if let Some(complete) = self.buckets.remove(&batch_number) {
            debug!(batch_number, "Telemetry bucket complete");
            self.sink.on_parameters(batch_number, &complete.reports)?;
        }
        Ok(())
    }

    fn add_general_info(&mut self, token: Token, batches_per_epoch: u64) -> Result<(), TelemetryError> {
        self.general_info.insert(token, batches_per_epoch);
        if self.general_info_flushed {
            debug!(token, batches_per_epoch, "General info updated after flush");
            return Ok(());
        }
        if self.general_info.len() < self.agents.len() {
            return Ok(());
        }

        self.general_info_flushed = true;
        self.sink.on_general_info(&self.general_info)
    }
}

impl<S: AggregateSink> TelemetryProcessor for AggregatingProcessor<S> {
    fn process(&mut self, token: Token, payload: TelemetryFact) -> Result<(), TelemetryError> {
        self.evict_stale();

        if !self.agents.contains(&token) {
            return Err(TelemetryError::UnknownAgent { token });
        }

        match payload {
            TelemetryFact::ModelParameters {
                batch_number,
                parameters,
            } => self.add_parameters(token, batch_number, parameters),
            TelemetryFact::AgentGeneralInfo { batches_per_epoch } => {
                self.add_general_info(token, batches_per_epoch)
            }
            TelemetryFact::Unsupported => Err(TelemetryError::Unsupported {
                token,
                fact: payload.name().to_string(),
            }),
        }
    }
}

// ─────────────────────────────────────────────────────────────────
// Tests
// ─────────────────────────────────────────────────────────────────
