//! Report model and the orchestrator that produces it.

pub mod orchestrator;
pub mod recommendations;

use crate::baseline::{PerformanceBaseline, RegressionReport};
use crate::config::{DiagnosticsConfig, ThresholdConfig};
use crate::error::{DiagnosticError, Result};
use crate::probes::{
    ConnectionMetrics, ConnectionPoolMetrics, ConnectionStabilityReport, DatabaseMetrics,
    LatencyMetrics, QueryMetrics, ServerMetrics,
};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::ops::{BitOr, BitOrAssign};
use std::str::FromStr;
use std::time::Duration;
use uuid::Uuid;

pub use orchestrator::DiagnosticOrchestrator;
pub use recommendations::{builtin_rules, RecommendationRule};

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum Severity {
    Info,
    Warning,
    Critical,
}

impl fmt::Display for Severity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            Severity::Info => "INFO",
            Severity::Warning => "WARNING",
            Severity::Critical => "CRITICAL",
        };
        f.write_str(label)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Recommendation {
    pub severity: Severity,
    pub category: String,
    pub title: String,
    pub message: String,
    /// Rule that produced the recommendation
    pub source: String,
}

impl Recommendation {
    pub fn new(
        severity: Severity,
        category: impl Into<String>,
        title: impl Into<String>,
        message: impl Into<String>,
    ) -> Self {
        Self {
            severity,
            category: category.into(),
            title: title.into(),
            message: message.into(),
            source: String::new(),
        }
    }
}

/// Bitmask of probe categories. An empty mask means every category.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(transparent)]
pub struct DiagnosticCategories(u32);

impl DiagnosticCategories {
    pub const NONE: Self = Self(0);
    pub const CONNECTION: Self = Self(1);
    pub const NETWORK: Self = Self(1 << 1);
    pub const QUERY: Self = Self(1 << 2);
    pub const SERVER: Self = Self(1 << 3);
    pub const DATABASE: Self = Self(1 << 4);
    pub const POOL: Self = Self(1 << 5);
    pub const STABILITY: Self = Self(1 << 6);
    pub const ALL: Self = Self((1 << 7) - 1);

    /// Categories that need the shared SQL connection.
    pub const SQL: Self = Self(Self::QUERY.0 | Self::SERVER.0 | Self::DATABASE.0);

    const NAMES: [(&'static str, Self); 7] = [
        ("connection", Self::CONNECTION),
        ("network", Self::NETWORK),
        ("query", Self::QUERY),
        ("server", Self::SERVER),
        ("database", Self::DATABASE),
        ("pool", Self::POOL),
        ("stability", Self::STABILITY),
    ];

    pub fn bits(self) -> u32 {
        self.0
    }

    pub fn from_bits_truncate(bits: u32) -> Self {
        Self(bits & Self::ALL.0)
    }

    pub fn is_empty(self) -> bool {
        self.0 == 0
    }

    pub fn contains(self, other: Self) -> bool {
        self.0 & other.0 == other.0
    }

    pub fn intersects(self, other: Self) -> bool {
        self.0 & other.0 != 0
    }

    /// Empty selects everything.
    pub fn normalized(self) -> Self {
        if self.is_empty() {
            Self::ALL
        } else {
            self
        }
    }

    pub fn names(self) -> Vec<&'static str> {
        Self::NAMES
            .iter()
            .filter(|(_, flag)| self.contains(*flag))
            .map(|(name, _)| *name)
            .collect()
    }
}

impl BitOr for DiagnosticCategories {
    type Output = Self;

    fn bitor(self, rhs: Self) -> Self {
        Self(self.0 | rhs.0)
    }
}

impl BitOrAssign for DiagnosticCategories {
    fn bitor_assign(&mut self, rhs: Self) {
        self.0 |= rhs.0;
    }
}

impl fmt::Display for DiagnosticCategories {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if *self == Self::ALL {
            return f.write_str("all");
        }
        f.write_str(&self.names().join(","))
    }
}

impl FromStr for DiagnosticCategories {
    type Err = DiagnosticError;

    /// Comma separated names, or `all`.
    fn from_str(s: &str) -> Result<Self> {
        let mut categories = Self::NONE;
        for part in s.split(',').map(str::trim).filter(|p| !p.is_empty()) {
            let part = part.to_lowercase();
            if part == "all" {
                return Ok(Self::ALL);
            }
            let flag = Self::NAMES
                .iter()
                .find(|(name, _)| *name == part)
                .map(|(_, flag)| *flag)
                .ok_or_else(|| {
                    DiagnosticError::invalid_input(format!("unknown diagnostic category '{part}'"))
                })?;
            categories |= flag;
        }
        Ok(categories)
    }
}

/// Per-run knobs. Build from configuration with [`DiagnosticOptions::from_config`].
#[derive(Debug, Clone)]
pub struct DiagnosticOptions {
    pub connection_attempts: u32,
    pub connection_delay: Duration,
    pub ping_attempts: u32,
    pub ping_timeout: Duration,
    pub connect_timeout: Duration,
    pub probe_query: String,
    pub stability_duration: Duration,
    pub stability_interval: Duration,
    /// Connection attempts made by a quick check.
    pub quick_check_attempts: u32,
    pub top_wait_events: u32,
    pub long_transaction_threshold: Duration,
    pub generate_recommendations: bool,
    pub compare_to_baseline: bool,
    pub baseline: Option<PerformanceBaseline>,
    pub thresholds: ThresholdConfig,
}

impl Default for DiagnosticOptions {
    fn default() -> Self {
        Self::from_config(&DiagnosticsConfig::default())
    }
}

impl DiagnosticOptions {
    pub fn from_config(config: &DiagnosticsConfig) -> Self {
        let probes = &config.probes;
        Self {
            connection_attempts: probes.connection_attempts,
            connection_delay: Duration::from_millis(probes.connection_delay_ms),
            ping_attempts: probes.ping_attempts,
            ping_timeout: Duration::from_millis(probes.ping_timeout_ms),
            connect_timeout: Duration::from_millis(probes.connect_timeout_ms),
            probe_query: probes.probe_query.clone(),
            stability_duration: Duration::from_millis(probes.stability_duration_ms),
            stability_interval: Duration::from_millis(probes.stability_interval_ms),
            quick_check_attempts: probes.quick_check_attempts,
            top_wait_events: probes.top_wait_events,
            long_transaction_threshold: Duration::from_secs(probes.long_transaction_seconds),
            generate_recommendations: true,
            compare_to_baseline: false,
            baseline: None,
            thresholds: config.thresholds.clone(),
        }
    }

    pub fn with_baseline(mut self, baseline: PerformanceBaseline) -> Self {
        self.baseline = Some(baseline);
        self.compare_to_baseline = true;
        self
    }

    /// Reject options the requested categories cannot run with.
    pub fn validate(&self, categories: DiagnosticCategories) -> Result<()> {
        let categories = categories.normalized();

        if categories.contains(DiagnosticCategories::CONNECTION) && self.connection_attempts == 0 {
            return Err(DiagnosticError::invalid_input("connection_attempts must be at least 1"));
        }
        if categories.contains(DiagnosticCategories::NETWORK) {
            if self.ping_attempts == 0 {
                return Err(DiagnosticError::invalid_input("ping_attempts must be at least 1"));
            }
            if self.ping_timeout.is_zero() {
                return Err(DiagnosticError::invalid_input("ping_timeout must be positive"));
            }
        }
        if categories.contains(DiagnosticCategories::QUERY) && self.probe_query.trim().is_empty() {
            return Err(DiagnosticError::invalid_input("probe_query cannot be empty"));
        }
        if categories.contains(DiagnosticCategories::STABILITY) {
            if self.stability_duration.is_zero() {
                return Err(DiagnosticError::invalid_input("stability_duration must be positive"));
            }
            if self.stability_interval.is_zero() {
                return Err(DiagnosticError::invalid_input("stability_interval must be positive"));
            }
        }
        if self.connect_timeout.is_zero() {
            return Err(DiagnosticError::invalid_input("connect_timeout must be positive"));
        }
        if self.thresholds.baseline_tolerance < 0.0 {
            return Err(DiagnosticError::invalid_input("baseline tolerance cannot be negative"));
        }
        Ok(())
    }
}

/// Result of one orchestration run.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DiagnosticReport {
    pub id: Uuid,
    /// Redacted `host:port/database` form of the target
    pub target: String,
    pub generated_at: DateTime<Utc>,
    pub duration_ms: f64,
    pub categories: DiagnosticCategories,
    pub connection: Option<ConnectionMetrics>,
    pub network: Option<LatencyMetrics>,
    pub query: Option<QueryMetrics>,
    pub server: Option<ServerMetrics>,
    pub database: Option<DatabaseMetrics>,
    pub pool: Option<ConnectionPoolMetrics>,
    pub stability: Option<ConnectionStabilityReport>,
    pub metadata: BTreeMap<String, String>,
    pub recommendations: Vec<Recommendation>,
    pub baseline_comparison: Option<RegressionReport>,
}

impl DiagnosticReport {
    pub fn new(target: impl Into<String>, categories: DiagnosticCategories) -> Self {
        Self {
            id: Uuid::new_v4(),
            target: target.into(),
            generated_at: Utc::now(),
            duration_ms: 0.0,
            categories,
            connection: None,
            network: None,
            query: None,
            server: None,
            database: None,
            pool: None,
            stability: None,
            metadata: BTreeMap::new(),
            recommendations: Vec::new(),
            baseline_comparison: None,
        }
    }

    /// `(probe, message)` for every probe that failed during the run.
    pub fn probe_errors(&self) -> Vec<(&str, &str)> {
        self.metadata
            .iter()
            .filter_map(|(key, value)| {
                key.strip_suffix(".error")
                    .map(|probe| (probe, value.as_str()))
            })
            .collect()
    }

    pub fn highest_severity(&self) -> Option<Severity> {
        self.recommendations.iter().map(|r| r.severity).max()
    }
}
