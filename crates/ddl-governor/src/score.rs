//! Node quality score in [-1, 1] from response latency and record count.
//!
//! Latency term: linear, 1.0 for an instant answer, 0 at 30 s, saturating at
//! -1. Quality term: peaks at 1.0 when a node reports `optimal` records
//! (a fixed fraction of the network maximum), -1 at zero and at the maximum.

use serde::{Deserialize, Serialize};

/// Sample recorded for a node that could not be reached.
pub const UNREACHABLE_SCORE: f64 = -1.0;

/// Seconds at which the latency term crosses zero.
const LATENCY_ZERO_SECS: f64 = 30.0;

#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum ScoreError {
    #[error("record count {record_count} exceeds maximum {max}")]
    RecordCountExceedsMax { record_count: u64, max: u64 },
    #[error("optimal record count {optimal} is degenerate for maximum {max}")]
    DegenerateOptimum { optimal: u64, max: u64 },
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct ScoreParams {
    pub optimal_record_percentage: f64,
    pub time_score_weight: f64,
    pub ema_factor: f64,
}

impl Default for ScoreParams {
    fn default() -> Self {
        Self {
            optimal_record_percentage: 0.5,
            time_score_weight: 0.5,
            ema_factor: 0.5,
        }
    }
}

#[derive(Debug, Clone, Copy, Default)]
pub struct Scorer {
    params: ScoreParams,
}

impl Scorer {
    pub fn new(params: ScoreParams) -> Self {
        Self { params }
    }

    pub fn params(&self) -> &ScoreParams {
        &self.params
    }

    /// Score one exchange. `elapsed_secs < 0` marks a failed exchange.
    /// Without both record counts only the latency term is used.
    pub fn score(
        &self,
        elapsed_secs: f64,
        record_count: Option<u64>,
        record_count_max: Option<u64>,
    ) -> Result<f64, ScoreError> {
        if elapsed_secs < 0.0 {
            return Ok(UNREACHABLE_SCORE);
        }
        let latency = self.latency_score(elapsed_secs);

        let (Some(record_count), Some(max)) = (record_count, record_count_max) else {
            return Ok(latency);
        };
        let quality = self.quality(record_count, max)?;

        let w = self.params.time_score_weight;
        let score = w * latency + (1.0 - w) * quality;
        tracing::trace!(elapsed_secs, record_count, max, latency, quality, score, "score: computed");
        Ok(score)
    }

    /// Latency-only score, used when the record count cannot be judged.
    pub fn latency_score(&self, elapsed_secs: f64) -> f64 {
        if elapsed_secs < 0.0 {
            return UNREACHABLE_SCORE;
        }
        ((LATENCY_ZERO_SECS - elapsed_secs) / LATENCY_ZERO_SECS).max(-1.0)
    }

    fn quality(&self, record_count: u64, max: u64) -> Result<f64, ScoreError> {
        if record_count > max {
            return Err(ScoreError::RecordCountExceedsMax { record_count, max });
        }
        let optimal = (self.params.optimal_record_percentage * max as f64).floor() as u64;
        if optimal == 0 || optimal >= max {
            return Err(ScoreError::DegenerateOptimum { optimal, max });
        }

        let rc = record_count as f64;
        let opt = optimal as f64;
        let maxf = max as f64;
        let q = if record_count <= optimal {
            let b = 4.0 / opt + 4.0 / (maxf - opt);
            let a = (2.0 - b * opt) / (opt * opt);
            a * rc * rc + b * rc - 1.0
        } else {
            2.0 / ((maxf - opt) * (maxf - opt)) * (rc - maxf) * (rc - maxf) - 1.0
        };
        Ok(q.clamp(-1.0, 1.0))
    }

    /// Smooth a new sample into a node's persisted score.
    pub fn ema(&self, previous: f64, sample: f64) -> f64 {
        let k = self.params.ema_factor;
        (k * sample + (1.0 - k) * previous).clamp(-1.0, 1.0)
    }
}
