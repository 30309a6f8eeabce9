use crate::application::DependencyContainer;
use crate::baseline::{PerformanceBaseline, RegressionReport};
use crate::diagnostics::{DiagnosticCategories, DiagnosticReport, Severity};
use crate::monitoring::{
    ConnectionPoolHealthReport, ConnectionPoolMonitor, ContinuousMonitor, DiagnosticEvent, DiagnosticEventType,
    MonitorEvent, MonitorMode, MonitorOptions, PgPoolSource, PoolHealthSeverity,
};
use crate::stats::PercentileSummary;
use crate::target::ConnectionTarget;
use crate::triage::{TestResult, TriageResult};
use anyhow::{Context, Result};
use serde::Serialize;
use serde_json::json;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast::error::RecvError;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

fn print_json<T: Serialize>(value: &T) -> Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}

fn fmt_ms(value: Option<f64>) -> String {
    value.map_or_else(|| "n/a".to_string(), |v| format!("{v:.1}ms"))
}

fn fmt_summary(summary: Option<&PercentileSummary>, unit: &str) -> String {
    summary.map_or_else(
        || "n/a".to_string(),
        |s| format!("median {:.2}{unit}, p95 {:.2}{unit}, p99 {:.2}{unit}", s.median, s.p95, s.p99),
    )
}

fn render_report(report: &DiagnosticReport) -> String {
    let mut out = Vec::new();
    out.push(format!(
        "Diagnostics for {} ({}) in {:.0}ms",
        report.target, report.categories, report.duration_ms
    ));

    if let Some(c) = &report.connection {
        out.push(format!(
            "  Connection: {}/{} ok, min {} avg {} max {}",
            c.successful_attempts,
            c.total_attempts,
            fmt_ms(c.min_ms),
            fmt_ms(c.average_ms),
            fmt_ms(c.max_ms)
        ));
    }
    if let Some(n) = &report.network {
        out.push(format!(
            "  Network:    {} avg {} jitter {} loss {:.0}%",
            n.host,
            fmt_ms(n.average_ms),
            fmt_ms(n.jitter_ms),
            n.packet_loss * 100.0
        ));
    }
    if let Some(q) = &report.query {
        out.push(format!(
            "  Query:      {:.1}ms, {} row(s)",
            q.duration_ms, q.result_rows
        ));
    }
    if let Some(s) = &report.server {
        out.push(format!(
            "  Server:     version {}, utilization {}, blocked {}",
            s.server_version.as_deref().unwrap_or("?"),
            s.connection_utilization
                .map_or_else(|| "n/a".to_string(), |u| format!("{:.0}%", u * 100.0)),
            s.blocked_sessions.unwrap_or(0)
        ));
    }
    if let Some(d) = &report.database {
        out.push(format!(
            "  Database:   {} cache hit {}, {} long transaction(s)",
            d.database_name.as_deref().unwrap_or("?"),
            d.cache_hit_ratio
                .map_or_else(|| "n/a".to_string(), |r| format!("{:.1}%", r * 100.0)),
            d.long_running_transactions.unwrap_or(0)
        ));
    }
    if let Some(p) = &report.pool {
        out.push(format!(
            "  Pool:       {} session(s), {} active",
            p.total_sessions.unwrap_or(0),
            p.active_sessions.unwrap_or(0)
        ));
        for note in &p.notes {
            out.push(format!("              {note}"));
        }
    }
    if let Some(s) = &report.stability {
        out.push(format!(
            "  Stability:  {}/{} ok ({:.0}%)",
            s.successful_samples,
            s.total_samples,
            s.success_rate * 100.0
        ));
    }
    for (probe, message) in report.probe_errors() {
        out.push(format!("  ! {probe} failed: {message}"));
    }
    if let Some(comparison) = &report.baseline_comparison {
        out.push(format!("  Baseline '{}': {}", comparison.baseline_name, comparison.summary));
    }
    if !report.recommendations.is_empty() {
        out.push("Recommendations:".to_string());
        for r in &report.recommendations {
            out.push(format!("  [{}] {}: {}", r.severity, r.title, r.message));
        }
    }
    out.join("\n")
}

pub struct RunCommandHandler {
    container: Arc<DependencyContainer>,
}

impl RunCommandHandler {
    pub fn new(container: Arc<DependencyContainer>) -> Self {
        Self { container }
    }

    pub async fn run(
        &self,
        target: &str,
        categories: DiagnosticCategories,
        json: bool,
        token: &CancellationToken,
    ) -> Result<()> {
        info!("🔍 Running diagnostics ({})", categories);
        let report = self
            .container
            .orchestrator
            .run(target, categories, &self.container.options, token)
            .await
            .context("Diagnostic run failed")?;

        self.container
            .record_event(DiagnosticEvent::from_report(DiagnosticEventType::DiagnosticRun, &report))
            .await;

        if json {
            print_json(&report)
        } else {
            println!("{}", render_report(&report));
            Ok(())
        }
    }
}

pub struct TriageCommandHandler {
    container: Arc<DependencyContainer>,
}

impl TriageCommandHandler {
    pub fn new(container: Arc<DependencyContainer>) -> Self {
        Self { container }
    }

    pub async fn run(&self, target: &str, json: bool, token: &CancellationToken) -> Result<()> {
        let result = self
            .container
            .triage
            .run(target, token)
            .await
            .context("Triage failed")?;

        if json {
            return print_json(&result);
        }
        println!("{}", render_triage(&result));
        Ok(())
    }
}

fn render_triage(result: &TriageResult) -> String {
    fn line(result: &TestResult) -> String {
        let mark = match (result.success, result.issues.is_empty()) {
            (false, _) => "FAIL",
            (true, false) => "WARN",
            (true, true) => "ok",
        };
        let mut text = format!(
            "  {:<10} {:<4} {:>8.1}ms  {}",
            format!("{:?}", result.stage),
            mark,
            result.duration_ms,
            result.details
        );
        for issue in &result.issues {
            text.push_str(&format!("\n{:>28}{issue}", "- "));
        }
        text
    }

    let mut out = vec![format!("Triage for {} in {:.0}ms", result.target, result.duration_ms)];
    for stage in [
        &result.network,
        &result.connection,
        &result.query,
        &result.server,
        &result.blocking,
    ] {
        out.push(line(stage));
    }
    out.push(format!(
        "Diagnosis: {} - {}",
        result.diagnosis.category, result.diagnosis.summary
    ));
    for recommendation in &result.diagnosis.recommendations {
        out.push(format!("  * {recommendation}"));
    }
    out.join("\n")
}

pub struct BaselineCommandHandler {
    container: Arc<DependencyContainer>,
}

impl BaselineCommandHandler {
    pub fn new(container: Arc<DependencyContainer>) -> Self {
        Self { container }
    }

    pub async fn capture(
        &self,
        target: &str,
        name: &str,
        samples: u32,
        interval: Duration,
        token: &CancellationToken,
    ) -> Result<()> {
        let baseline = self
            .container
            .baseline_engine
            .capture_baseline(target, name, samples, interval, token)
            .await
            .context("Baseline capture failed")?;

        self.container
            .record_event(
                DiagnosticEvent::new(
                    DiagnosticEventType::BaselineCaptured,
                    Severity::Info,
                    name,
                    format!("Captured baseline '{}' from {} samples", name, samples),
                )
                .with_payload(serde_json::to_value(&baseline)?),
            )
            .await;

        info!("✅ Baseline '{}' captured", baseline.name);
        println!("{}", render_baseline(&baseline));
        Ok(())
    }

    pub async fn compare(
        &self,
        target: &str,
        name: Option<&str>,
        json: bool,
        token: &CancellationToken,
    ) -> Result<()> {
        let comparison = self
            .container
            .baseline_engine
            .compare_to_baseline(target, name, token)
            .await
            .context("Baseline comparison failed")?;

        self.container
            .record_event(
                DiagnosticEvent::new(
                    DiagnosticEventType::BaselineCompared,
                    comparison.highest_severity().unwrap_or(Severity::Info),
                    comparison.baseline_name.clone(),
                    comparison.summary.clone(),
                )
                .with_payload(serde_json::to_value(&comparison)?),
            )
            .await;

        if json {
            return print_json(&comparison);
        }
        println!("{}", render_comparison(&comparison));
        Ok(())
    }

    pub async fn list(&self, json: bool) -> Result<()> {
        let baselines = self.container.baseline_store.list().await?;
        if json {
            return print_json(&baselines);
        }
        if baselines.is_empty() {
            println!("No baselines stored");
            return Ok(());
        }
        for baseline in &baselines {
            println!("{}", render_baseline(baseline));
        }
        Ok(())
    }
}

fn render_baseline(baseline: &PerformanceBaseline) -> String {
    format!(
        "{} captured {} ({} samples)\n  connection: {}\n  success:    {}\n  network:    {}",
        baseline.name,
        baseline.captured_at.to_rfc3339(),
        baseline.sample_count,
        fmt_summary(baseline.connection_time_ms.as_ref(), "ms"),
        fmt_summary(baseline.success_rate.as_ref(), ""),
        fmt_summary(baseline.network_latency_ms.as_ref(), "ms"),
    )
}

fn render_comparison(comparison: &RegressionReport) -> String {
    let mut out = vec![format!(
        "Compared against '{}' ({})",
        comparison.baseline_name,
        comparison.baseline_captured_at.to_rfc3339()
    )];
    for finding in &comparison.findings {
        out.push(format!(
            "  [{}] {}: {} ({:+.1}%)",
            finding.severity, finding.category, finding.message, finding.percentage_change
        ));
    }
    out.push(comparison.summary.clone());
    out.join("\n")
}

pub struct MonitorCommandHandler {
    container: Arc<DependencyContainer>,
}

impl MonitorCommandHandler {
    pub fn new(container: Arc<DependencyContainer>) -> Self {
        Self { container }
    }

    /// Monitor until `token` is cancelled or a tick fails.
    pub async fn run(
        &self,
        target: &str,
        categories: DiagnosticCategories,
        interval: Option<Duration>,
        mode: Option<MonitorMode>,
        token: &CancellationToken,
    ) -> Result<()> {
        let settings = &self.container.config.monitor;
        let options = MonitorOptions {
            target: target.to_string(),
            categories,
            diagnostics: self.container.options.clone(),
            interval: interval.unwrap_or(Duration::from_millis(settings.interval_ms)),
            mode: mode.unwrap_or(settings.mode),
        };

        let monitor = ContinuousMonitor::new(self.container.orchestrator.clone());
        let mut events = monitor.subscribe();
        monitor.start(options).await?;
        info!("📈 Monitoring started, press Ctrl-C to stop");

        loop {
            tokio::select! {
                _ = token.cancelled() => break,
                event = events.recv() => match event {
                    Ok(MonitorEvent::Snapshot(snapshot)) => {
                        println!("#{} {}", snapshot.sequence, render_report(&snapshot.report));
                        self.container
                            .record_event(DiagnosticEvent::from_report(
                                DiagnosticEventType::MonitorSnapshot,
                                &snapshot.report,
                            ))
                            .await;
                    }
                    Ok(MonitorEvent::Failed { message, .. }) => {
                        error!("❌ Monitoring stopped: {}", message);
                        self.container
                            .record_event(DiagnosticEvent::new(
                                DiagnosticEventType::MonitorFailed,
                                Severity::Critical,
                                target,
                                message,
                            ))
                            .await;
                        break;
                    }
                    Err(RecvError::Lagged(skipped)) => {
                        warn!("Skipped {} monitor events", skipped);
                    }
                    Err(RecvError::Closed) => break,
                },
            }
        }

        monitor.stop().await;
        Ok(())
    }
}

pub struct PoolCommandHandler {
    container: Arc<DependencyContainer>,
}

impl PoolCommandHandler {
    pub fn new(container: Arc<DependencyContainer>) -> Self {
        Self { container }
    }

    pub async fn check(
        &self,
        target: &str,
        max_connections: u32,
        samples: u32,
        interval: Duration,
        json: bool,
        token: &CancellationToken,
    ) -> Result<()> {
        let parsed = ConnectionTarget::parse(target)?;
        let acquire_timeout = Duration::from_millis(self.container.config.probes.connect_timeout_ms);
        let source = Arc::new(PgPoolSource::connect_lazy(&parsed, max_connections, acquire_timeout));

        let monitor = ConnectionPoolMonitor::new(source.clone(), self.container.config.pool.clone());
        let outcome = monitor.check_health(samples, interval, token).await;
        source.close().await;
        let report = outcome.context("Pool health check failed")?;

        let severity = match report.severity {
            PoolHealthSeverity::Healthy => Severity::Info,
            PoolHealthSeverity::Warning => Severity::Warning,
            PoolHealthSeverity::Critical => Severity::Critical,
        };
        self.container
            .record_event(
                DiagnosticEvent::new(
                    DiagnosticEventType::PoolHealth,
                    severity,
                    parsed.display_name(),
                    report.summary.clone(),
                )
                .with_payload(json!({
                    "samples": report.samples,
                    "failure_rate": report.failure_rate,
                    "average_acquisition_ms": report.average_acquisition_ms,
                    "peak_active": report.peak_active,
                })),
            )
            .await;

        if json {
            return print_json(&report);
        }
        println!("{}", render_pool(&report));
        Ok(())
    }
}

fn render_pool(report: &ConnectionPoolHealthReport) -> String {
    format!(
        "Pool health: {:?}\n  samples {}, failed {} ({:.0}%)\n  acquisition avg {} peak {}\n  peak active {}, peak pooled {}, starvation events {}\n{}",
        report.severity,
        report.samples,
        report.failed_acquisitions,
        report.failure_rate * 100.0,
        fmt_ms(report.average_acquisition_ms),
        fmt_ms(report.peak_acquisition_ms),
        report.peak_active,
        report.peak_pooled,
        report.starvation_events,
        report.summary
    )
}
