use super::{DiagnosticReport, Recommendation, Severity};
use crate::config::ThresholdConfig;
use tracing::{debug, warn};

/// A recommendation plugin. Rules run in order after every probe completed;
/// an error from `generate` is logged and the rule skipped.
pub trait RecommendationRule: Send + Sync {
    fn name(&self) -> &str;

    fn applies(&self, report: &DiagnosticReport) -> bool;

    fn generate(&self, report: &DiagnosticReport) -> anyhow::Result<Option<Recommendation>>;
}

struct SlowConnectionRule {
    threshold_ms: f64,
}

impl RecommendationRule for SlowConnectionRule {
    fn name(&self) -> &str {
        "slow-connection"
    }

    fn applies(&self, report: &DiagnosticReport) -> bool {
        report
            .connection
            .as_ref()
            .and_then(|c| c.average_ms)
            .is_some()
    }

    fn generate(&self, report: &DiagnosticReport) -> anyhow::Result<Option<Recommendation>> {
        let Some(average) = report.connection.as_ref().and_then(|c| c.average_ms) else {
            return Ok(None);
        };
        if average <= self.threshold_ms {
            return Ok(None);
        }
        Ok(Some(Recommendation::new(
            Severity::Warning,
            "Connection",
            "Slow connection establishment",
            format!(
                "Average connection time is {average:.0}ms (threshold {:.0}ms). Check authentication \
                 latency, TLS negotiation and DNS resolution, or keep connections pooled.",
                self.threshold_ms
            ),
        )))
    }
}

struct LowSuccessRateRule {
    min_success_rate: f64,
}

impl RecommendationRule for LowSuccessRateRule {
    fn name(&self) -> &str {
        "connection-success-rate"
    }

    fn applies(&self, report: &DiagnosticReport) -> bool {
        report.connection.is_some()
    }

    fn generate(&self, report: &DiagnosticReport) -> anyhow::Result<Option<Recommendation>> {
        let Some(connection) = &report.connection else {
            return Ok(None);
        };
        if connection.success_rate >= self.min_success_rate {
            return Ok(None);
        }
        let codes: Vec<&str> = connection
            .failures
            .iter()
            .filter_map(|f| f.code.as_deref())
            .collect();
        let detail = if codes.is_empty() {
            String::new()
        } else {
            format!(" SQLSTATEs seen: {}.", codes.join(", "))
        };
        Ok(Some(Recommendation::new(
            Severity::Warning,
            "Connection",
            "Unreliable connections",
            format!(
                "{} of {} connection attempts failed ({:.0}% success).{detail}",
                connection.failed_attempts,
                connection.total_attempts,
                connection.success_rate * 100.0
            ),
        )))
    }
}

struct HighJitterRule {
    threshold_ms: f64,
}

impl RecommendationRule for HighJitterRule {
    fn name(&self) -> &str {
        "network-jitter"
    }

    fn applies(&self, report: &DiagnosticReport) -> bool {
        report.network.as_ref().and_then(|n| n.jitter_ms).is_some()
    }

    fn generate(&self, report: &DiagnosticReport) -> anyhow::Result<Option<Recommendation>> {
        match report.network.as_ref().and_then(|n| n.jitter_ms) {
            Some(jitter) if jitter > self.threshold_ms => Ok(Some(Recommendation::new(
                Severity::Info,
                "Network",
                "High network jitter",
                format!(
                    "Round-trip jitter is {jitter:.1}ms (threshold {:.0}ms). Latency-sensitive \
                     workloads may see uneven response times.",
                    self.threshold_ms
                ),
            ))),
            _ => Ok(None),
        }
    }
}

struct NetworkUnreachableRule;

impl RecommendationRule for NetworkUnreachableRule {
    fn name(&self) -> &str {
        "network-unreachable"
    }

    fn applies(&self, report: &DiagnosticReport) -> bool {
        report.network.is_some()
    }

    fn generate(&self, report: &DiagnosticReport) -> anyhow::Result<Option<Recommendation>> {
        match &report.network {
            Some(network) if !network.success => Ok(Some(Recommendation::new(
                Severity::Critical,
                "Network",
                "Server unreachable",
                format!(
                    "No reply from {} in {} attempts. Verify the host name, firewall rules and \
                     that the server is listening.",
                    network.host,
                    network.samples.len()
                ),
            ))),
            _ => Ok(None),
        }
    }
}

struct ConnectionUtilizationRule {
    threshold: f64,
}

impl RecommendationRule for ConnectionUtilizationRule {
    fn name(&self) -> &str {
        "connection-utilization"
    }

    fn applies(&self, report: &DiagnosticReport) -> bool {
        report
            .server
            .as_ref()
            .and_then(|s| s.connection_utilization)
            .is_some()
    }

    fn generate(&self, report: &DiagnosticReport) -> anyhow::Result<Option<Recommendation>> {
        let Some(server) = &report.server else {
            return Ok(None);
        };
        match server.connection_utilization {
            Some(utilization) if utilization > self.threshold => Ok(Some(Recommendation::new(
                Severity::Warning,
                "Server",
                "Connection slots nearly exhausted",
                format!(
                    "{} of {} connections in use ({:.0}%). Consider a connection pooler or \
                     raising max_connections.",
                    server.total_sessions.unwrap_or_default(),
                    server.max_connections.unwrap_or_default(),
                    utilization * 100.0
                ),
            ))),
            _ => Ok(None),
        }
    }
}

struct CacheHitRatioRule {
    min_ratio: f64,
}

impl RecommendationRule for CacheHitRatioRule {
    fn name(&self) -> &str {
        "cache-hit-ratio"
    }

    fn applies(&self, report: &DiagnosticReport) -> bool {
        report
            .database
            .as_ref()
            .and_then(|d| d.cache_hit_ratio)
            .is_some()
    }

    fn generate(&self, report: &DiagnosticReport) -> anyhow::Result<Option<Recommendation>> {
        match report.database.as_ref().and_then(|d| d.cache_hit_ratio) {
            Some(ratio) if ratio < self.min_ratio => Ok(Some(Recommendation::new(
                Severity::Info,
                "Database",
                "Low buffer cache hit ratio",
                format!(
                    "Only {:.1}% of block reads were served from shared buffers. Review \
                     shared_buffers sizing and sequential scans on large tables.",
                    ratio * 100.0
                ),
            ))),
            _ => Ok(None),
        }
    }
}

/// The threshold rules every run applies before any registered plugin.
pub fn builtin_rules(thresholds: &ThresholdConfig) -> Vec<Box<dyn RecommendationRule>> {
    vec![
        Box::new(SlowConnectionRule {
            threshold_ms: thresholds.slow_connection_ms,
        }),
        Box::new(LowSuccessRateRule {
            min_success_rate: thresholds.min_success_rate,
        }),
        Box::new(HighJitterRule {
            threshold_ms: thresholds.high_jitter_ms,
        }),
        Box::new(NetworkUnreachableRule),
        Box::new(ConnectionUtilizationRule {
            threshold: thresholds.connection_utilization,
        }),
        Box::new(CacheHitRatioRule {
            min_ratio: thresholds.min_cache_hit_ratio,
        }),
    ]
}

/// Apply `rules` in order, tagging each recommendation with its rule name.
pub fn apply_rules(report: &DiagnosticReport, rules: &[&dyn RecommendationRule]) -> Vec<Recommendation> {
    let mut recommendations = Vec::new();

    for rule in rules {
        if !rule.applies(report) {
            continue;
        }
        match rule.generate(report) {
            Ok(Some(mut recommendation)) => {
                debug!("Rule {} produced: {}", rule.name(), recommendation.title);
                recommendation.source = rule.name().to_string();
                recommendations.push(recommendation);
            }
            Ok(None) => {}
            Err(e) => warn!("Recommendation rule {} failed: {:#}", rule.name(), e),
        }
    }

    recommendations
}
