//! Performance baselines: capture, persistence and regression comparison.

pub mod engine;
pub mod storage;

use crate::config::ThresholdConfig;
use crate::diagnostics::{DiagnosticReport, Severity};
use crate::stats::PercentileSummary;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

pub use engine::BaselineEngine;
pub use storage::{BaselineStore, FileBaselineStore};

/// A percentile-summarized reference snapshot. Immutable once written.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PerformanceBaseline {
    pub name: String,
    pub captured_at: DateTime<Utc>,
    /// SHA-256 of the raw target string; the target itself is never stored.
    pub target_hash: String,
    pub sample_count: u32,
    pub connection_time_ms: Option<PercentileSummary>,
    pub success_rate: Option<PercentileSummary>,
    pub network_latency_ms: Option<PercentileSummary>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum RegressionCategory {
    Connection,
    Network,
    Reliability,
}

impl fmt::Display for RegressionCategory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            RegressionCategory::Connection => "Connection",
            RegressionCategory::Network => "Network",
            RegressionCategory::Reliability => "Reliability",
        };
        f.write_str(label)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RegressionFinding {
    pub severity: Severity,
    pub category: RegressionCategory,
    pub baseline_value: f64,
    pub current_value: f64,
    /// `(current - baseline) / baseline * 100`
    pub percentage_change: f64,
    pub message: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RegressionReport {
    pub baseline_name: String,
    pub baseline_captured_at: DateTime<Utc>,
    pub compared_at: DateTime<Utc>,
    pub current: LiveSample,
    pub findings: Vec<RegressionFinding>,
    pub summary: String,
}

impl RegressionReport {
    pub fn has_regressions(&self) -> bool {
        !self.findings.is_empty()
    }

    pub fn highest_severity(&self) -> Option<Severity> {
        self.findings.iter().map(|f| f.severity).max()
    }
}

/// The scalar values a quick check contributes to a baseline or comparison.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct LiveSample {
    pub connection_ms: Option<f64>,
    pub success_rate: Option<f64>,
    pub network_ms: Option<f64>,
}

impl LiveSample {
    pub fn from_report(report: &DiagnosticReport) -> Self {
        Self {
            connection_ms: report.connection.as_ref().and_then(|c| c.average_ms),
            success_rate: report.connection.as_ref().map(|c| c.success_rate),
            network_ms: report.network.as_ref().and_then(|n| n.average_ms),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RegressionThresholds {
    /// Allowed drift above the baseline P95 (0.2 = 20%).
    pub tolerance: f64,
    /// Excess over the threshold at which a connection finding turns critical.
    pub critical_excess: f64,
}

impl Default for RegressionThresholds {
    fn default() -> Self {
        Self::from(&ThresholdConfig::default())
    }
}

impl From<&ThresholdConfig> for RegressionThresholds {
    fn from(config: &ThresholdConfig) -> Self {
        Self {
            tolerance: config.baseline_tolerance,
            critical_excess: config.critical_excess,
        }
    }
}

fn percentage_change(baseline: f64, current: f64) -> f64 {
    if baseline == 0.0 {
        0.0
    } else {
        (current - baseline) / baseline * 100.0
    }
}

/// Compare live values to a baseline. Each rule is evaluated independently.
pub fn evaluate_regressions(
    baseline: &PerformanceBaseline,
    live: &LiveSample,
    thresholds: &RegressionThresholds,
) -> RegressionReport {
    let mut findings = Vec::new();
    let allowance = 1.0 + thresholds.tolerance;

    if let (Some(reference), Some(current)) = (baseline.connection_time_ms, live.connection_ms) {
        let threshold = reference.p95 * allowance;
        if current > threshold {
            let excess = if threshold > 0.0 {
                (current - threshold) / threshold
            } else {
                f64::INFINITY
            };
            let severity = if excess >= thresholds.critical_excess {
                Severity::Critical
            } else {
                Severity::Warning
            };
            findings.push(RegressionFinding {
                severity,
                category: RegressionCategory::Connection,
                baseline_value: reference.p95,
                current_value: current,
                percentage_change: percentage_change(reference.p95, current),
                message: format!(
                    "Average connection time {current:.1}ms exceeds baseline P95 {:.1}ms by more \
                     than the allowed {:.0}%",
                    reference.p95,
                    thresholds.tolerance * 100.0
                ),
            });
        }
    }

    if let (Some(reference), Some(current)) = (baseline.network_latency_ms, live.network_ms) {
        let threshold = reference.p95 * allowance;
        if current > threshold {
            findings.push(RegressionFinding {
                severity: Severity::Warning,
                category: RegressionCategory::Network,
                baseline_value: reference.p95,
                current_value: current,
                percentage_change: percentage_change(reference.p95, current),
                message: format!(
                    "Network latency {current:.1}ms exceeds baseline P95 {:.1}ms",
                    reference.p95
                ),
            });
        }
    }

    if let (Some(reference), Some(current)) = (baseline.success_rate, live.success_rate) {
        let drop = reference.median - current;
        if drop > thresholds.tolerance {
            findings.push(RegressionFinding {
                severity: Severity::Critical,
                category: RegressionCategory::Reliability,
                baseline_value: reference.median,
                current_value: current,
                percentage_change: percentage_change(reference.median, current),
                message: format!(
                    "Connection success rate fell from {:.0}% to {:.0}%",
                    reference.median * 100.0,
                    current * 100.0
                ),
            });
        }
    }

    let summary = if findings.is_empty() {
        "No performance regressions detected".to_string()
    } else {
        format!(
            "{} regression(s) detected against baseline '{}'",
            findings.len(),
            baseline.name
        )
    };

    RegressionReport {
        baseline_name: baseline.name.clone(),
        baseline_captured_at: baseline.captured_at,
        compared_at: Utc::now(),
        current: *live,
        findings,
        summary,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn summary(median: f64, p95: f64) -> Option<PercentileSummary> {
        Some(PercentileSummary {
            median,
            p95,
            p99: p95,
        })
    }

    fn baseline() -> PerformanceBaseline {
        PerformanceBaseline {
            name: "nightly".to_string(),
            captured_at: Utc::now(),
            target_hash: "abc".to_string(),
            sample_count: 5,
            connection_time_ms: summary(40.0, 50.0),
            success_rate: summary(0.95, 1.0),
            network_latency_ms: summary(8.0, 10.0),
        }
    }

    fn connection_only(ms: f64) -> LiveSample {
        LiveSample {
            connection_ms: Some(ms),
            ..Default::default()
        }
    }

    #[test]
    fn test_connection_escalates_to_critical() {
        let thresholds = RegressionThresholds {
            tolerance: 0.2,
            critical_excess: 0.5,
        };
        let report = evaluate_regressions(&baseline(), &connection_only(100.0), &thresholds);
        assert_eq!(report.findings.len(), 1);
        assert_eq!(report.findings[0].severity, Severity::Critical);
        assert_eq!(report.findings[0].category, RegressionCategory::Connection);
        assert_eq!(report.findings[0].percentage_change, 100.0);
    }

    #[test]
    fn test_connection_below_escalation_is_warning() {
        let thresholds = RegressionThresholds {
            tolerance: 0.2,
            critical_excess: 0.5,
        };
        let report = evaluate_regressions(&baseline(), &connection_only(80.0), &thresholds);
        assert_eq!(report.findings[0].severity, Severity::Warning);

        let report = evaluate_regressions(&baseline(), &connection_only(55.0), &thresholds);
        assert!(!report.has_regressions());
        assert_eq!(report.summary, "No performance regressions detected");
    }

    #[test]
    fn test_escalation_boundary_is_inclusive() {
        // P95 50ms with 20% tolerance puts the threshold at 60ms and the
        // critical line at 90ms
        let thresholds = RegressionThresholds {
            tolerance: 0.2,
            critical_excess: 0.5,
        };

        let at_line = evaluate_regressions(&baseline(), &connection_only(90.0), &thresholds);
        assert_eq!(at_line.findings[0].severity, Severity::Critical);

        let below_line = evaluate_regressions(&baseline(), &connection_only(89.9), &thresholds);
        assert_eq!(below_line.findings[0].severity, Severity::Warning);
    }

    #[test]
    fn test_reliability_drop() {
        let thresholds = RegressionThresholds {
            tolerance: 0.1,
            critical_excess: 0.5,
        };
        let dropped = LiveSample {
            success_rate: Some(0.80),
            ..Default::default()
        };
        let report = evaluate_regressions(&baseline(), &dropped, &thresholds);
        assert_eq!(report.findings.len(), 1);
        assert_eq!(report.findings[0].category, RegressionCategory::Reliability);
        assert_eq!(report.findings[0].severity, Severity::Critical);

        let slight = LiveSample {
            success_rate: Some(0.90),
            ..Default::default()
        };
        assert!(!evaluate_regressions(&baseline(), &slight, &thresholds).has_regressions());
    }

    #[test]
    fn test_network_regression_is_warning() {
        let live = LiveSample {
            network_ms: Some(40.0),
            ..Default::default()
        };
        let report = evaluate_regressions(&baseline(), &live, &RegressionThresholds::default());
        assert_eq!(report.findings[0].category, RegressionCategory::Network);
        assert_eq!(report.findings[0].severity, Severity::Warning);
    }

    #[test]
    fn test_missing_baseline_values_skip_rules() {
        let mut empty = baseline();
        empty.connection_time_ms = None;
        empty.network_latency_ms = None;
        empty.success_rate = None;
        let live = LiveSample {
            connection_ms: Some(10_000.0),
            success_rate: Some(0.0),
            network_ms: Some(10_000.0),
        };
        assert!(!evaluate_regressions(&empty, &live, &RegressionThresholds::default()).has_regressions());
    }
}
