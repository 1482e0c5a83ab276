//! Mixing arithmetic
//!
//! One gossip step replaces an agent's vector with a weighted combination of
//! its own vector and those of its direct neighbors:
//!
//! ```text
//! x_i' = a_ii * x_i + sum_j a_ij * x_j
//! a_ij = 1 / (max(deg_i, deg_j) + 1)
//! a_ii = 1 - sum_j a_ij
//! ```
//!
//! The matrix `A` is symmetric and doubly stochastic, so the sum of all
//! vectors is preserved and repeated steps converge to the mean on a
//! connected graph.
//!
//! Every contribution also carries a bootstrap weight `w`. The step computes
//! `x_i' = sum a_ik w_k x_k / sum a_ik w_k` and `w_i' = sum a_ik w_k`. With all
//! weights at 1 this is exactly the plain step above. With a single agent at
//! 1 and the rest at 0, every agent with positive weight holds the weighted
//! agent's vector, which spreads one hop per step.

use std::collections::BTreeMap;

use crate::topology::Token;

/// Metropolis-Hastings weight of the edge between two agents
pub fn metropolis_weight(deg_i: usize, deg_j: usize) -> f64 {
    1.0 / (deg_i.max(deg_j) as f64 + 1.0)
}

/// Row of the mixing matrix for one agent
#[derive(Debug, Clone, PartialEq)]
pub struct MixingWeights {
    self_weight: f64,
    neighbors: BTreeMap<Token, f64>,
}

impl MixingWeights {
    /// Build the Metropolis row from the agent's degree and its neighbors' degrees
    pub fn metropolis(own_degree: usize, neighbors: impl IntoIterator<Item = (Token, usize)>) -> Self {
        let neighbors: BTreeMap<Token, f64> = neighbors
            .into_iter()
            .map(|(token, degree)| (token, metropolis_weight(own_degree, degree)))
            .collect();
        let self_weight = 1.0 - neighbors.values().sum::<f64>();

        Self {
            self_weight,
            neighbors,
        }
    }

    pub fn self_weight(&self) -> f64 {
        self.self_weight
    }

    pub fn weight(&self, token: Token) -> Option<f64> {
        self.neighbors.get(&token).copied()
    }

    pub fn neighbors(&self) -> impl Iterator<Item = Token> + '_ {
        self.neighbors.keys().copied()
    }
}

/// One input to a mixing step
#[derive(Debug, Clone, Copy)]
pub struct Contribution<'a> {
    /// Bootstrap weight of the contributor
    pub weight: f32,
    pub vector: &'a [f32],
}

/// Result of one mixing step
#[derive(Debug, Clone, PartialEq)]
pub struct MixOutcome {
    pub vector: Vec<f32>,

    /// Bootstrap weight after the step
    pub weight: f32,

    /// Largest per-element change; infinite while the weight is still zero
    pub residual: f32,
}

/// Whether a vector contains NaN or infinite values
pub fn is_poisoned(vector: &[f32]) -> bool {
    vector.iter().any(|v| !v.is_finite())
}

/// Apply one weighted mixing step
///
/// Callers guarantee that every neighbor vector has the same length as
/// `own.vector` and is finite.
pub fn mix(
    weights: &MixingWeights,
    own: Contribution<'_>,
    received: &BTreeMap<Token, Contribution<'_>>,
) -> MixOutcome {
    let len = own.vector.len();
    let mut numerator = vec![0f64; len];

    let own_coef = weights.self_weight * own.weight as f64;
    let mut denominator = own_coef;
    accumulate(&mut numerator, own_coef, own.vector);

    for (token, contribution) in received {
        let coef = weights.weight(*token).unwrap_or(0.0) * contribution.weight as f64;
        denominator += coef;
        accumulate(&mut numerator, coef, contribution.vector);
    }

    if denominator <= 0.0 {
        return MixOutcome {
            vector: own.vector.to_vec(),
            weight: 0.0,
            residual: f32::INFINITY,
        };
    }

    let vector: Vec<f32> = numerator
        .iter()
        .map(|v| (v / denominator) as f32)
        .collect();
    let residual = if own.weight > 0.0 {
        max_abs_diff(&vector, own.vector)
    } else {
        f32::INFINITY
    };

    MixOutcome {
        vector,
        weight: denominator as f32,
        residual,
    }
}

fn accumulate(acc: &mut [f64], coef: f64, vector: &[f32]) {
    if coef == 0.0 {
        return;
    }
    for (a, v) in acc.iter_mut().zip(vector) {
        *a += coef * *v as f64;
    }
}

/// Largest absolute element-wise difference
pub fn max_abs_diff(a: &[f32], b: &[f32]) -> f32 {
    a.iter()
        .zip(b)
        .map(|(x, y)| (x - y).abs())
        .fold(0.0, f32::max)
}

// ─────────────────────────────────────────────────────────────────
// Tests
// ─────────────────────────────────────────────────────────────────
