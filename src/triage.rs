//! Fast single-pass root-cause triage.
//!
//! Five stages run in a fixed order and each records its own outcome; a
//! strict priority chain then picks one diagnosis. Network problems mask
//! everything downstream.

use crate::client::{ConnectionFactory, DatabaseClient, Pinger};
use crate::config::ThresholdConfig;
use crate::diagnostics::DiagnosticOptions;
use crate::error::{DiagnosticError, Result};
use crate::probes::{close_quietly, open_client, NetworkProbe, QueryProbe, ServerProbe};
use crate::retry::RetryPolicy;
use crate::target::ConnectionTarget;
use crate::timing::{cancellable, duration_ms, elapsed_ms};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

const BLOCKED_SESSIONS: &str = r#"
SELECT count(*)::bigint,
       COALESCE(max(EXTRACT(EPOCH FROM (now() - query_start))), 0)::float8
FROM pg_stat_activity
WHERE cardinality(pg_blocking_pids(pid)) > 0
"#;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum TriageStage {
    Network,
    Connection,
    Query,
    Server,
    Blocking,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TestResult {
    pub stage: TriageStage,
    pub success: bool,
    pub duration_ms: f64,
    pub details: String,
    pub issues: Vec<String>,
}

impl TestResult {
    fn new(stage: TriageStage) -> Self {
        Self {
            stage,
            success: false,
            duration_ms: 0.0,
            details: String::new(),
            issues: Vec::new(),
        }
    }

    fn failed(stage: TriageStage, details: impl Into<String>) -> Self {
        Self {
            details: details.into(),
            ..Self::new(stage)
        }
    }

    pub fn has_issues(&self) -> bool {
        !self.issues.is_empty()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum DiagnosisCategory {
    Network,
    Connection,
    Blocking,
    ServerResource,
    QueryPerformance,
    Healthy,
}

impl fmt::Display for DiagnosisCategory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            DiagnosisCategory::Network => "Network",
            DiagnosisCategory::Connection => "Connection",
            DiagnosisCategory::Blocking => "Blocking",
            DiagnosisCategory::ServerResource => "Server Resource",
            DiagnosisCategory::QueryPerformance => "Query Performance",
            DiagnosisCategory::Healthy => "Healthy",
        };
        f.write_str(label)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Diagnosis {
    pub category: DiagnosisCategory,
    pub summary: String,
    pub recommendations: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TriageResult {
    pub target: String,
    pub started_at: DateTime<Utc>,
    pub duration_ms: f64,
    pub network: TestResult,
    pub connection: TestResult,
    pub query: TestResult,
    pub server: TestResult,
    pub blocking: TestResult,
    pub diagnosis: Diagnosis,
}

/// Pick exactly one diagnosis. The first matching rule wins.
pub fn diagnose(
    network: &TestResult,
    connection: &TestResult,
    query: &TestResult,
    server: &TestResult,
    blocking: &TestResult,
) -> Diagnosis {
    if !network.success || network.has_issues() {
        let cause = network.issues.first().unwrap_or(&network.details);
        return Diagnosis {
            category: DiagnosisCategory::Network,
            summary: format!("Network path to the server is unhealthy: {cause}"),
            recommendations: vec![
                "Verify the host name resolves and the server port is reachable".to_string(),
                "Check firewalls, security groups and VPN links between client and server"
                    .to_string(),
                "Compare latency from another host to isolate the network segment".to_string(),
            ],
        };
    }

    if !connection.success {
        return Diagnosis {
            category: DiagnosisCategory::Connection,
            summary: format!("Server is reachable but connections fail: {}", connection.details),
            recommendations: vec![
                "Check credentials, database name and pg_hba.conf rules".to_string(),
                "Check whether max_connections has been reached".to_string(),
                "Review the server log for authentication or startup errors".to_string(),
            ],
        };
    }

    if blocking.has_issues() {
        return Diagnosis {
            category: DiagnosisCategory::Blocking,
            summary: blocking.issues.join("; "),
            recommendations: vec![
                "Identify the blocking sessions with pg_blocking_pids() and pg_stat_activity"
                    .to_string(),
                "Shorten long-running transactions or terminate idle-in-transaction sessions"
                    .to_string(),
            ],
        };
    }

    if server.has_issues() {
        return Diagnosis {
            category: DiagnosisCategory::ServerResource,
            summary: server.issues.join("; "),
            recommendations: vec![
                "Put a connection pooler in front of the server".to_string(),
                "Review top wait events for contention".to_string(),
            ],
        };
    }

    if query.has_issues() {
        return Diagnosis {
            category: DiagnosisCategory::QueryPerformance,
            summary: query.issues.join("; "),
            recommendations: vec![
                "Inspect the plan with EXPLAIN (ANALYZE, BUFFERS)".to_string(),
                "Check for missing indexes and stale statistics".to_string(),
            ],
        };
    }

    Diagnosis {
        category: DiagnosisCategory::Healthy,
        summary: "All triage stages passed without issues".to_string(),
        recommendations: Vec::new(),
    }
}

#[derive(Debug, Clone)]
pub struct TriageThresholds {
    pub slow_network_ms: f64,
    pub slow_connection_ms: f64,
    pub slow_query_ms: f64,
    pub connection_utilization: f64,
}

impl From<&ThresholdConfig> for TriageThresholds {
    fn from(config: &ThresholdConfig) -> Self {
        Self {
            slow_network_ms: config.slow_network_ms,
            slow_connection_ms: config.slow_connection_ms,
            slow_query_ms: config.slow_query_ms,
            connection_utilization: config.connection_utilization,
        }
    }
}

/// Run a stage, turning its error into a failed result. Cancellation still
/// aborts the whole triage.
async fn run_stage<F>(stage: TriageStage, future: F) -> Result<TestResult>
where
    F: Future<Output = Result<TestResult>>,
{
    let start = Instant::now();
    let mut result = match future.await {
        Ok(result) => result,
        Err(e) if e.is_cancelled() => return Err(e),
        Err(e) => {
            warn!("Triage stage {:?} failed: {}", stage, e);
            TestResult::failed(stage, e.to_string())
        }
    };
    result.duration_ms = elapsed_ms(start);
    debug!("Triage stage {:?}: success={} issues={:?}", stage, result.success, result.issues);
    Ok(result)
}

#[derive(Debug, Clone)]
pub struct QuickTriage {
    factory: Arc<dyn ConnectionFactory>,
    pinger: Arc<dyn Pinger>,
    retry: RetryPolicy,
    ping_attempts: u32,
    ping_timeout: Duration,
    connect_timeout: Duration,
    probe_query: String,
    thresholds: TriageThresholds,
}

impl QuickTriage {
    pub fn new(
        factory: Arc<dyn ConnectionFactory>,
        pinger: Arc<dyn Pinger>,
        options: &DiagnosticOptions,
    ) -> Self {
        Self {
            factory,
            pinger,
            retry: RetryPolicy::default(),
            ping_attempts: options.ping_attempts,
            ping_timeout: options.ping_timeout,
            connect_timeout: options.connect_timeout,
            probe_query: options.probe_query.clone(),
            thresholds: TriageThresholds::from(&options.thresholds),
        }
    }

    pub fn with_retry(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    pub async fn run(&self, target: &str, token: &CancellationToken) -> Result<TriageResult> {
        let target = ConnectionTarget::parse(target)?;
        let started_at = Utc::now();
        let start = Instant::now();
        info!("Running quick triage for {}", target.display_name());

        let network = run_stage(TriageStage::Network, self.network_stage(&target, token)).await?;

        let mut client: Option<Box<dyn DatabaseClient>> = None;
        let connection = run_stage(
            TriageStage::Connection,
            self.connection_stage(&target, &mut client, token),
        )
        .await?;

        let outcome = self.session_stages(client.as_deref_mut(), token).await;
        if let Some(client) = client.as_deref_mut() {
            close_quietly(client).await;
        }
        let (query, server, blocking) = outcome?;

        let diagnosis = diagnose(&network, &connection, &query, &server, &blocking);
        info!(
            "Triage for {} diagnosed: {}",
            target.display_name(),
            diagnosis.category
        );

        Ok(TriageResult {
            target: target.display_name(),
            started_at,
            duration_ms: elapsed_ms(start),
            network,
            connection,
            query,
            server,
            blocking,
            diagnosis,
        })
    }

    async fn session_stages(
        &self,
        mut client: Option<&mut (dyn DatabaseClient + 'static)>,
        token: &CancellationToken,
    ) -> Result<(TestResult, TestResult, TestResult)> {
        let query = run_stage(
            TriageStage::Query,
            self.query_stage(client.as_deref_mut(), token),
        )
        .await?;
        let server = run_stage(
            TriageStage::Server,
            self.server_stage(client.as_deref_mut(), token),
        )
        .await?;
        let blocking = run_stage(
            TriageStage::Blocking,
            self.blocking_stage(client.as_deref_mut(), token),
        )
        .await?;
        Ok((query, server, blocking))
    }

    async fn network_stage(&self, target: &ConnectionTarget, token: &CancellationToken) -> Result<TestResult> {
        let mut result = TestResult::new(TriageStage::Network);
        let Some(endpoint) = target.endpoint() else {
            result.success = true;
            result.details = "Skipped: target has no network host".to_string();
            return Ok(result);
        };

        let metrics = NetworkProbe::new(self.pinger.clone())
            .measure_latency(&endpoint, self.ping_attempts, self.ping_timeout, token)
            .await?;

        result.success = metrics.success;
        result.details = match metrics.average_ms {
            Some(average) => format!(
                "{}/{} replies from {}, average {:.1}ms",
                metrics.successful_samples,
                metrics.samples.len(),
                endpoint,
                average
            ),
            None => format!("No replies from {endpoint}"),
        };
        if metrics.success && metrics.packet_loss > 0.0 {
            result
                .issues
                .push(format!("{:.0}% packet loss", metrics.packet_loss * 100.0));
        }
        if let Some(average) = metrics.average_ms.filter(|a| *a > self.thresholds.slow_network_ms) {
            result.issues.push(format!(
                "Average round trip {average:.1}ms exceeds {:.0}ms",
                self.thresholds.slow_network_ms
            ));
        }
        Ok(result)
    }

    async fn connection_stage(
        &self,
        target: &ConnectionTarget,
        slot: &mut Option<Box<dyn DatabaseClient>>,
        token: &CancellationToken,
    ) -> Result<TestResult> {
        let mut result = TestResult::new(TriageStage::Connection);
        let start = Instant::now();
        let client = open_client(
            self.factory.as_ref(),
            target,
            &self.retry,
            self.connect_timeout,
            token,
        )
        .await?;
        let elapsed = duration_ms(start.elapsed());

        result.success = true;
        result.details = format!("Connected to {} in {:.1}ms", client.server_name(), elapsed);
        if elapsed > self.thresholds.slow_connection_ms {
            result.issues.push(format!(
                "Connection took {elapsed:.0}ms (threshold {:.0}ms)",
                self.thresholds.slow_connection_ms
            ));
        }
        *slot = Some(client);
        Ok(result)
    }

    async fn query_stage(
        &self,
        client: Option<&mut (dyn DatabaseClient + 'static)>,
        token: &CancellationToken,
    ) -> Result<TestResult> {
        let client = client.ok_or_else(no_connection)?;
        let metrics = QueryProbe::execute_with_diagnostics(client, &self.probe_query, &[], token).await?;

        let mut result = TestResult::new(TriageStage::Query);
        result.success = true;
        result.details = format!(
            "Probe query returned {} row(s) in {:.1}ms",
            metrics.result_rows, metrics.duration_ms
        );
        if metrics.duration_ms > self.thresholds.slow_query_ms {
            result.issues.push(format!(
                "Probe query took {:.0}ms (threshold {:.0}ms)",
                metrics.duration_ms, self.thresholds.slow_query_ms
            ));
        }
        Ok(result)
    }

    async fn server_stage(
        &self,
        client: Option<&mut (dyn DatabaseClient + 'static)>,
        token: &CancellationToken,
    ) -> Result<TestResult> {
        let client = client.ok_or_else(no_connection)?;
        let metrics = ServerProbe::new(0).collect(client, token).await?;

        let mut result = TestResult::new(TriageStage::Server);
        result.success = true;
        result.details = format!(
            "{} of {} connections in use",
            metrics
                .total_sessions
                .map_or_else(|| "?".to_string(), |v| v.to_string()),
            metrics
                .max_connections
                .map_or_else(|| "?".to_string(), |v| v.to_string())
        );
        if let Some(utilization) = metrics
            .connection_utilization
            .filter(|u| *u > self.thresholds.connection_utilization)
        {
            result.issues.push(format!(
                "Connection utilization at {:.0}% (threshold {:.0}%)",
                utilization * 100.0,
                self.thresholds.connection_utilization * 100.0
            ));
        }
        Ok(result)
    }

    async fn blocking_stage(
        &self,
        client: Option<&mut (dyn DatabaseClient + 'static)>,
        token: &CancellationToken,
    ) -> Result<TestResult> {
        let client = client.ok_or_else(no_connection)?;
        let rows = cancellable(token, client.execute(BLOCKED_SESSIONS, &[])).await??;
        let row = rows.first();
        let blocked = row.and_then(|r| r.get_i64(0)).unwrap_or(0);
        let longest_wait = row.and_then(|r| r.get_f64(1)).unwrap_or(0.0);

        let mut result = TestResult::new(TriageStage::Blocking);
        result.success = true;
        result.details = format!("{blocked} blocked session(s)");
        if blocked > 0 {
            result.issues.push(format!(
                "{blocked} session(s) blocked, longest waiting {longest_wait:.0}s"
            ));
        }
        Ok(result)
    }
}

fn no_connection() -> DiagnosticError {
    DiagnosticError::invalid_input("no connection available, connection stage failed")
}

#[cfg(test)]
mod tests {
    use super::*;

    fn passed(stage: TriageStage) -> TestResult {
        TestResult {
            success: true,
            ..TestResult::new(stage)
        }
    }

    fn flagged(stage: TriageStage, issue: &str) -> TestResult {
        TestResult {
            success: true,
            issues: vec![issue.to_string()],
            ..TestResult::new(stage)
        }
    }

    #[test]
    fn test_network_failure_masks_everything() {
        let diagnosis = diagnose(
            &TestResult::failed(TriageStage::Network, "no replies"),
            &TestResult::failed(TriageStage::Connection, "refused"),
            &flagged(TriageStage::Query, "slow"),
            &flagged(TriageStage::Server, "busy"),
            &flagged(TriageStage::Blocking, "blocked"),
        );
        assert_eq!(diagnosis.category, DiagnosisCategory::Network);
        assert_eq!(diagnosis.category.to_string(), "Network");
    }

    #[test]
    fn test_priority_order() {
        let network = passed(TriageStage::Network);
        let connection = passed(TriageStage::Connection);

        let d = diagnose(
            &network,
            &connection,
            &flagged(TriageStage::Query, "slow"),
            &flagged(TriageStage::Server, "busy"),
            &flagged(TriageStage::Blocking, "blocked"),
        );
        assert_eq!(d.category, DiagnosisCategory::Blocking);

        let d = diagnose(
            &network,
            &connection,
            &flagged(TriageStage::Query, "slow"),
            &flagged(TriageStage::Server, "busy"),
            &passed(TriageStage::Blocking),
        );
        assert_eq!(d.category.to_string(), "Server Resource");

        let d = diagnose(
            &network,
            &connection,
            &flagged(TriageStage::Query, "slow"),
            &passed(TriageStage::Server),
            &passed(TriageStage::Blocking),
        );
        assert_eq!(d.category.to_string(), "Query Performance");

        let d = diagnose(
            &network,
            &connection,
            &passed(TriageStage::Query),
            &passed(TriageStage::Server),
            &passed(TriageStage::Blocking),
        );
        assert_eq!(d.category, DiagnosisCategory::Healthy);
        assert!(d.recommendations.is_empty());
    }

    #[test]
    fn test_network_issue_without_failure() {
        let d = diagnose(
            &flagged(TriageStage::Network, "40% packet loss"),
            &passed(TriageStage::Connection),
            &passed(TriageStage::Query),
            &passed(TriageStage::Server),
            &passed(TriageStage::Blocking),
        );
        assert_eq!(d.category, DiagnosisCategory::Network);
        assert!(d.summary.contains("packet loss"));
    }

    #[test]
    fn test_connection_failure_beats_downstream_stages() {
        let d = diagnose(
            &passed(TriageStage::Network),
            &TestResult::failed(TriageStage::Connection, "password authentication failed"),
            &TestResult::failed(TriageStage::Query, "no connection"),
            &TestResult::failed(TriageStage::Server, "no connection"),
            &TestResult::failed(TriageStage::Blocking, "no connection"),
        );
        assert_eq!(d.category, DiagnosisCategory::Connection);
    }
}
