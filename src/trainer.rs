//! Reference training loop
//!
//! Drives a [`LocalTrainer`] through decentralized training: one converging
//! round to agree on initial parameters, then a local step followed by a
//! single mixing step for every batch.

use std::time::Instant;

use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use rand_distr::{Distribution, Normal};
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::agent::{ConsensusAgent, PeerTransport};
use crate::error::{Error, Result};
use crate::protocol::TelemetryFact;
use crate::topology::Token;

/// Local model the agent trains between mixing steps
pub trait LocalTrainer: Send {
    /// Current parameters as one flat vector
    fn dump_params(&self) -> Vec<f32>;

    /// Replace the parameters; the length must match `dump_params`
    fn load_params(&mut self, params: &[f32]) -> Result<()>;

    /// Run one local batch and return its loss
    fn train_step(&mut self) -> f32;

    fn batches_per_epoch(&self) -> u64;
}

// ─────────────────────────────────────────────────────────────────
// Configuration
// ─────────────────────────────────────────────────────────────────

/// Trainer settings (`[trainer]` section)
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct TrainerConfig {
    pub epochs: u32,

    /// Samples in the whole dataset, split evenly across agents
    pub dataset_size: u64,

    pub batch_size: u64,

    /// Length of the parameter vector
    pub dimension: usize,

    pub learning_rate: f32,

    /// Standard deviation of the gradient noise
    pub noise: f32,

    pub seed: u64,

    /// Report parameters every this many batches (0 = never)
    pub telemetry_every: u64,
}

impl Default for TrainerConfig {
    fn default() -> Self {
        Self {
            epochs: 3,
            dataset_size: 50_000,
            batch_size: 32,
            dimension: 1024,
            learning_rate: 0.1,
            noise: 0.01,
            seed: 239,
            telemetry_every: 10,
        }
    }
}

// ─────────────────────────────────────────────────────────────────
// Synthetic trainer
// ─────────────────────────────────────────────────────────────────

/// Noisy gradient descent toward a per-agent target
///
/// Every agent pulls toward a different target, so local training alone
/// drifts apart and only mixing keeps the parameters together.
pub struct SyntheticTrainer {
    params: Vec<f32>,
    target: Vec<f32>,
    learning_rate: f32,
    noise: Normal<f32>,
    rng: StdRng,
    batches_per_epoch: u64,
}

impl SyntheticTrainer {
    pub fn new(token: Token, total_agents: usize, config: &TrainerConfig) -> Result<Self> {
        if total_agents == 0 {
            return Err(Error::config_field_invalid("agent.total_agents", "total agents must be positive"));
        }
        let noise = Normal::new(0.0, config.noise.max(0.0))
            .map_err(|e| Error::config_field_invalid("trainer.noise", e.to_string()))?;

        let mut rng = StdRng::seed_from_u64(config.seed ^ (token as u64).wrapping_mul(0x9e37_79b9_7f4a_7c15));
        let params = (0..config.dimension).map(|_| rng.random_range(-1.0f32..1.0)).collect();
        let target = (0..config.dimension)
            .map(|_| token as f32 + rng.random_range(-0.5f32..0.5))
            .collect();

        let shard = config.dataset_size / total_agents as u64;
        let batches_per_epoch = shard.div_ceil(config.batch_size.max(1));

        Ok(Self {
            params,
            target,
            learning_rate: config.learning_rate,
            noise,
            rng,
            batches_per_epoch,
        })
    }
}

impl LocalTrainer for SyntheticTrainer {
    fn dump_params(&self) -> Vec<f32> {
        self.params.clone()
    }

    fn load_params(&mut self, params: &[f32]) -> Result<()> {
        if params.len() != self.params.len() {
            return Err(Error::Internal(format!(
                "parameter vector has {} values, model has {}",
                params.len(),
                self.params.len()
            )));
        }
        self.params.copy_from_slice(params);
        Ok(())
    }

    fn train_step(&mut self) -> f32 {
        let mut loss = 0.0;
        for (p, t) in self.params.iter_mut().zip(&self.target) {
            let diff = *p - *t;
            loss += diff * diff;
            let grad = diff + self.noise.sample(&mut self.rng);
            *p -= self.learning_rate * grad;
        }
        loss / self.params.len().max(1) as f32
    }

    fn batches_per_epoch(&self) -> u64 {
        self.batches_per_epoch
    }
}

// ─────────────────────────────────────────────────────────────────
// Training loop
// ─────────────────────────────────────────────────────────────────

/// What a finished run looked like
#[derive(Debug, Clone, PartialEq)]
pub struct TrainingSummary {
    pub batches: u64,

    /// Whether the initial round converged before the step cap
    pub initial_round_converged: bool,

    /// Mixing steps that failed and left the local parameters unmixed
    pub skipped_mixes: u64,

    pub final_loss: f32,
}

/// Run the full training schedule
///
/// The leader (weight 1.0) seeds everyone's initial parameters; the others
/// start with weight 0.0 and adopt the leader's vector.
pub async fn run_training<T, L>(
    agent: &ConsensusAgent<T>,
    trainer: &mut L,
    config: &TrainerConfig,
    leader: bool,
) -> Result<TrainingSummary>
where
    T: PeerTransport,
    L: LocalTrainer,
{
    info!(token = agent.token(), leader, "Starting initial averaging");
    let started = Instant::now();
    let weight = if leader { 1.0 } else { 0.0 };
    let outcome = agent.run_round(&trainer.dump_params(), weight).await?;
    if !outcome.converged {
        warn!(steps = outcome.steps, residual = outcome.residual, "Initial averaging did not converge");
    }
    trainer.load_params(&outcome.vector)?;
    info!(
        steps = outcome.steps,
        elapsed_ms = started.elapsed().as_millis() as u64,
        "Initial averaging completed"
    );

    let batches_per_epoch = trainer.batches_per_epoch();
    report(agent, TelemetryFact::AgentGeneralInfo { batches_per_epoch }).await;

    let mut summary = TrainingSummary {
        batches: 0,
        initial_round_converged: outcome.converged,
        skipped_mixes: 0,
        final_loss: 0.0,
    };

    for epoch in 0..config.epochs {
        let epoch_started = Instant::now();
        let mut loss_sum = 0.0;

        for _ in 0..batches_per_epoch {
            let loss = trainer.train_step();
            loss_sum += loss;
            summary.final_loss = loss;

            match agent.run_once(&trainer.dump_params()).await {
                Ok(mixed) => trainer.load_params(&mixed)?,
                Err(e @ Error::PoisonedData { .. }) => {
                    warn!(error = %e, "Mixing skipped, keeping local parameters");
                    summary.skipped_mixes += 1;
                }
                Err(e) => return Err(e),
            }

            summary.batches += 1;
            if config.telemetry_every > 0 && summary.batches % config.telemetry_every == 0 {
                report(
                    agent,
                    TelemetryFact::ModelParameters {
                        batch_number: summary.batches,
                        parameters: trainer.dump_params(),
                    },
                )
                .await;
            }
        }

        info!(
            epoch,
            avg_loss = loss_sum / batches_per_epoch.max(1) as f32,
            elapsed_ms = epoch_started.elapsed().as_millis() as u64,
            "Epoch finished"
        );
    }

    Ok(summary)
}

/// Telemetry is best effort
async fn report<T: PeerTransport>(agent: &ConsensusAgent<T>, fact: TelemetryFact) {
    let name = fact.name();
    if let Err(e) = agent.report(fact).await {
        debug!(fact = name, error = %e, "Telemetry not delivered");
    }
}
