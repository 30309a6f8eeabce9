//! Percentile, mean and jitter computation shared by the probes and baselines.

use serde::{Deserialize, Serialize};

/// Median/P95/P99 of a series.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct PercentileSummary {
    pub median: f64,
    pub p95: f64,
    pub p99: f64,
}

/// Aggregates over successful latency samples.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct LatencyStats {
    pub count: usize,
    pub average_ms: f64,
    pub min_ms: f64,
    pub max_ms: f64,
    /// Population standard deviation.
    pub jitter_ms: f64,
}

/// Nearest-rank percentile of an already sorted slice:
/// `index = round((n - 1) * p)`, rounding half away from zero, clamped.
pub fn percentile(sorted: &[f64], p: f64) -> Option<f64> {
    if sorted.is_empty() {
        return None;
    }
    let p = if p.is_nan() { 0.0 } else { p.clamp(0.0, 1.0) };
    let rank = ((sorted.len() - 1) as f64 * p).round();
    let index = (rank as usize).min(sorted.len() - 1);
    Some(sorted[index])
}

pub fn sorted(values: &[f64]) -> Vec<f64> {
    let mut values: Vec<f64> = values.iter().copied().filter(|v| !v.is_nan()).collect();
    values.sort_by(f64::total_cmp);
    values
}

pub fn summarize(values: &[f64]) -> Option<PercentileSummary> {
    let sorted = sorted(values);
    Some(PercentileSummary {
        median: percentile(&sorted, 0.5)?,
        p95: percentile(&sorted, 0.95)?,
        p99: percentile(&sorted, 0.99)?,
    })
}

pub fn mean(values: &[f64]) -> Option<f64> {
    if values.is_empty() {
        return None;
    }
    Some(values.iter().sum::<f64>() / values.len() as f64)
}

pub fn population_std_dev(values: &[f64]) -> Option<f64> {
    let avg = mean(values)?;
    let variance = values.iter().map(|v| (v - avg).powi(2)).sum::<f64>() / values.len() as f64;
    Some(variance.sqrt())
}

impl LatencyStats {
    /// `None` when there are no samples.
    pub fn from_samples(samples: &[f64]) -> Option<Self> {
        let average_ms = mean(samples)?;
        let min_ms = samples.iter().copied().fold(f64::INFINITY, f64::min);
        let max_ms = samples.iter().copied().fold(f64::NEG_INFINITY, f64::max);
        Some(Self {
            count: samples.len(),
            average_ms,
            min_ms,
            max_ms,
            jitter_ms: population_std_dev(samples)?,
        })
    }
}

/// `successful / total`, zero for an empty denominator.
pub fn success_rate(successful: usize, total: usize) -> f64 {
    if total == 0 {
        0.0
    } else {
        successful as f64 / total as f64
    }
}
