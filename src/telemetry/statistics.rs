//! Consensus quality statistics
//!
//! For every complete batch the sink records how far each agent's parameters
//! sit from the network-wide mean, and the largest per-parameter coefficient
//! of variation. Records are appended as JSON lines to an optional file and
//! kept in a bounded in-memory history.

use std::collections::{BTreeMap, VecDeque};
use std::fs::{File, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use serde::Serialize;
use tracing::info;

use super::processor::AggregateSink;
use super::TelemetryError;
use crate::topology::Token;

/// Records retained in memory
const HISTORY_LIMIT: usize = 4096;

/// One flushed aggregate
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "record", rename_all = "snake_case")]
pub enum StatsRecord {
    ParameterDeviation {
        batch_number: u64,
        #[serde(rename = "param_deviation_L1")]
        l1: BTreeMap<Token, f64>,
        #[serde(rename = "param_deviation_L2")]
        l2: BTreeMap<Token, f64>,
        #[serde(rename = "param_deviation_Linf")]
        linf: BTreeMap<Token, f64>,
        coef_of_var: f64,
    },
    BatchesPerEpoch {
        batches_per_epoch: BTreeMap<Token, u64>,
    },
}

/// A record with the time it was produced
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct StatsEntry {
    pub timestamp: DateTime<Utc>,
    #[serde(flatten)]
    pub record: StatsRecord,
}

/// Aggregate sink computing deviation statistics
pub struct StatisticsSink {
    path: Option<PathBuf>,
    file: Option<File>,
    history: VecDeque<StatsEntry>,
}

impl StatisticsSink {
    /// Keep records in memory only
    pub fn in_memory() -> Self {
        Self {
            path: None,
            file: None,
            history: VecDeque::new(),
        }
    }

    /// Append records to `path`, creating parent directories as needed
    pub fn with_file(path: &Path) -> Result<Self, TelemetryError> {
        let write_err = |source: std::io::Error| TelemetryError::Write {
            path: path.to_path_buf(),
            source,
        };

        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent).map_err(write_err)?;
        }
        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(path)
            .map_err(write_err)?;

        info!(path = %path.display(), "Writing consensus statistics");
        Ok(Self {
            path: Some(path.to_path_buf()),
            file: Some(file),
            history: VecDeque::new(),
        })
    }

    /// Records produced so far, oldest first
    pub fn history(&self) -> impl Iterator<Item = &StatsEntry> {
        self.history.iter()
    }

    fn record(&mut self, record: StatsRecord) -> Result<(), TelemetryError> {
        let entry = StatsEntry {
            timestamp: Utc::now(),
            record,
        };

        if let (Some(file), Some(path)) = (self.file.as_mut(), self.path.as_ref()) {
            let mut line = serde_json::to_vec(&entry)?;
            line.push(b'\n');
            file.write_all(&line).map_err(|source| TelemetryError::Write {
                path: path.clone(),
                source,
            })?;
        }

        if self.history.len() == HISTORY_LIMIT {
            self.history.pop_front();
        }
        self.history.push_back(entry);
        Ok(())
    }
}

impl AggregateSink for StatisticsSink {
    fn on_parameters(
        &mut self,
        batch_number: u64,
        reports: &BTreeMap<Token, Vec<f32>>,
    ) -> Result<(), TelemetryError> {
        let deviation = ParameterDeviation::compute(reports);
        info!(
            batch_number,
            coef_of_var = deviation.coef_of_var,
            "Consensus statistics"
        );

        self.record(StatsRecord::ParameterDeviation {
            batch_number,
            l1: deviation.l1,
            l2: deviation.l2,
            linf: deviation.linf,
            coef_of_var: deviation.coef_of_var,
        })
    }

    fn on_general_info(&mut self, batches_per_epoch: &BTreeMap<Token, u64>) -> Result<(), TelemetryError> {
        self.record(StatsRecord::BatchesPerEpoch {
            batches_per_epoch: batches_per_epoch.clone(),
        })
    }
}

// ─────────────────────────────────────────────────────────────────
// Deviation math
// ─────────────────────────────────────────────────────────────────

struct ParameterDeviation {
    l1: BTreeMap<Token, f64>,
    l2: BTreeMap<Token, f64>,
    linf: BTreeMap<Token, f64>,
    coef_of_var: f64,
}

impl ParameterDeviation {
    fn compute(reports: &BTreeMap<Token, Vec<f32>>) -> Self {
        let n = reports.len().max(1) as f64;
        let len = reports.values().map(Vec::len).min().unwrap_or(0);

        let mut mean = vec![0f64; len];
        for vector in reports.values() {
            for (m, v) in mean.iter_mut().zip(vector) {
                *m += *v as f64 / n;
            }
        }

        let mut variance = vec![0f64; len];
        let mut l1 = BTreeMap::new();
        let mut l2 = BTreeMap::new();
        let mut linf = BTreeMap::new();

        for (token, vector) in reports {
            let (mut sum_abs, mut sum_sq, mut max_abs) = (0f64, 0f64, 0f64);
            for ((v, m), var) in vector.iter().zip(&mean).zip(variance.iter_mut()) {
                let d = *v as f64 - m;
                sum_abs += d.abs();
                sum_sq += d * d;
                max_abs = max_abs.max(d.abs());
                *var += d * d / n;
            }
            l1.insert(*token, sum_abs);
            l2.insert(*token, sum_sq.sqrt());
            linf.insert(*token, max_abs);
        }

        // Parameters whose mean is zero have no defined ratio
        let coef_of_var = variance
            .iter()
            .zip(&mean)
            .filter(|(_, m)| m.abs() > f64::EPSILON)
            .map(|(var, m)| (var.sqrt() / m).abs())
            .fold(0.0, f64::max);

        Self {
            l1,
            l2,
            linf,
            coef_of_var,
        }
    }
}

// ─────────────────────────────────────────────────────────────────
// Tests
// ─────────────────────────────────────────────────────────────────
