use super::recommendations::{apply_rules, builtin_rules, RecommendationRule};
use super::{DiagnosticCategories, DiagnosticOptions, DiagnosticReport, Recommendation};
use crate::baseline::{evaluate_regressions, LiveSample, RegressionThresholds};
use crate::client::{ConnectionFactory, DatabaseClient, Pinger};
use crate::error::Result;
use crate::probes::{
    close_quietly, open_client, ConnectionProbe, DatabaseProbe, NetworkProbe, QueryProbe,
    ServerProbe,
};
use crate::retry::RetryPolicy;
use crate::target::ConnectionTarget;
use crate::timing::elapsed_ms;
use std::sync::Arc;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Runs the probe battery against a target and assembles a [`DiagnosticReport`].
///
/// Holds no per-run state, so one orchestrator can serve concurrent runs.
pub struct DiagnosticOrchestrator {
    factory: Arc<dyn ConnectionFactory>,
    pinger: Arc<dyn Pinger>,
    retry: RetryPolicy,
    rules: Vec<Arc<dyn RecommendationRule>>,
}

impl std::fmt::Debug for DiagnosticOrchestrator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DiagnosticOrchestrator")
            .field("factory", &self.factory)
            .field("pinger", &self.pinger)
            .field("retry", &self.retry)
            .field("rules", &self.rules.iter().map(|r| r.name()).collect::<Vec<_>>())
            .finish()
    }
}

/// Keep a probe result, or downgrade its failure to a metadata note.
/// Cancellation is never downgraded.
fn absorb<T>(report: &mut DiagnosticReport, probe: &str, result: Result<T>) -> Result<Option<T>> {
    match result {
        Ok(value) => Ok(Some(value)),
        Err(e) if e.is_cancelled() => Err(e),
        Err(e) => {
            warn!("{} probe failed for {}: {}", probe, report.target, e);
            report.metadata.insert(format!("{probe}.error"), e.to_string());
            Ok(None)
        }
    }
}

impl DiagnosticOrchestrator {
    pub fn new(factory: Arc<dyn ConnectionFactory>, pinger: Arc<dyn Pinger>) -> Self {
        Self {
            factory,
            pinger,
            retry: RetryPolicy::default(),
            rules: Vec::new(),
        }
    }

    pub fn with_retry(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    /// Register a rule that runs after the built-in ones, in registration order.
    pub fn with_rule(mut self, rule: Arc<dyn RecommendationRule>) -> Self {
        self.rules.push(rule);
        self
    }

    pub fn factory(&self) -> Arc<dyn ConnectionFactory> {
        self.factory.clone()
    }

    pub fn pinger(&self) -> Arc<dyn Pinger> {
        self.pinger.clone()
    }

    pub fn retry_policy(&self) -> &RetryPolicy {
        &self.retry
    }

    fn connection_probe(&self, options: &DiagnosticOptions) -> ConnectionProbe {
        ConnectionProbe::new(self.factory.clone(), self.retry.clone(), options.connect_timeout)
    }

    pub async fn run(
        &self,
        target: &str,
        categories: DiagnosticCategories,
        options: &DiagnosticOptions,
        token: &CancellationToken,
    ) -> Result<DiagnosticReport> {
        let target = ConnectionTarget::parse(target)?;
        self.run_target(&target, categories, options, token).await
    }

    /// Connection and network probes only, with the quick-check attempt count
    /// and no recommendations.
    pub async fn quick_check(
        &self,
        target: &str,
        options: &DiagnosticOptions,
        token: &CancellationToken,
    ) -> Result<DiagnosticReport> {
        let quick = DiagnosticOptions {
            connection_attempts: options.quick_check_attempts,
            generate_recommendations: false,
            compare_to_baseline: false,
            baseline: None,
            ..options.clone()
        };
        self.run(
            target,
            DiagnosticCategories::CONNECTION | DiagnosticCategories::NETWORK,
            &quick,
            token,
        )
        .await
    }

    pub async fn run_target(
        &self,
        target: &ConnectionTarget,
        categories: DiagnosticCategories,
        options: &DiagnosticOptions,
        token: &CancellationToken,
    ) -> Result<DiagnosticReport> {
        options.validate(categories)?;
        let categories = categories.normalized();
        let started = Instant::now();

        let mut report = DiagnosticReport::new(target.display_name(), categories);
        info!(
            "Starting diagnostics {} for {} ({})",
            report.id, report.target, categories
        );

        let endpoint = target.endpoint();
        let wants_network = categories.contains(DiagnosticCategories::NETWORK);
        match (&endpoint, wants_network) {
            (Some(endpoint), true) => {
                report
                    .metadata
                    .insert("network.endpoint".to_string(), endpoint.to_string());
            }
            (None, true) => {
                warn!("No network host resolvable from {}, skipping network probe", report.target);
                report.metadata.insert(
                    "network.skipped".to_string(),
                    "no network host could be resolved from the target".to_string(),
                );
            }
            _ => {}
        }

        let connection_probe = self.connection_probe(options);
        let network_probe = NetworkProbe::new(self.pinger.clone());

        let connection_run = async {
            if categories.contains(DiagnosticCategories::CONNECTION) {
                Some(
                    connection_probe
                        .measure_connection(
                            target,
                            options.connection_attempts,
                            options.connection_delay,
                            token,
                        )
                        .await,
                )
            } else {
                None
            }
        };
        let network_run = async {
            match (&endpoint, wants_network) {
                (Some(endpoint), true) => Some(
                    network_probe
                        .measure_latency(endpoint, options.ping_attempts, options.ping_timeout, token)
                        .await,
                ),
                _ => None,
            }
        };

        let (connection, network) = tokio::join!(connection_run, network_run);
        if let Some(result) = connection {
            report.connection = absorb(&mut report, "connection", result)?;
        }
        if let Some(result) = network {
            report.network = absorb(&mut report, "network", result)?;
        }

        if categories.contains(DiagnosticCategories::POOL) {
            let result = connection_probe.analyze_connection_pool(target, token).await;
            report.pool = absorb(&mut report, "pool", result)?;
        }

        if categories.contains(DiagnosticCategories::STABILITY) {
            let result = connection_probe
                .monitor_connection_stability(
                    target,
                    options.stability_duration,
                    options.stability_interval,
                    token,
                )
                .await;
            report.stability = absorb(&mut report, "stability", result)?;
        }

        if categories.intersects(DiagnosticCategories::SQL) {
            let mut client = open_client(
                self.factory.as_ref(),
                target,
                &self.retry,
                options.connect_timeout,
                token,
            )
            .await?;

            let outcome = self
                .run_sql_probes(client.as_mut(), &mut report, categories, options, token)
                .await;
            close_quietly(client.as_mut()).await;
            outcome?;
        }

        if options.compare_to_baseline {
            self.compare_with_baseline(&mut report, options);
        }

        if options.generate_recommendations {
            let builtin = builtin_rules(&options.thresholds);
            let rules: Vec<&dyn RecommendationRule> = builtin
                .iter()
                .map(|rule| rule.as_ref())
                .chain(self.rules.iter().map(|rule| rule.as_ref()))
                .collect();
            let generated = apply_rules(&report, &rules);
            report.recommendations.extend(generated);
        }

        report.duration_ms = elapsed_ms(started);
        info!(
            "Diagnostics {} finished in {:.0}ms with {} recommendations",
            report.id,
            report.duration_ms,
            report.recommendations.len()
        );
        Ok(report)
    }

    /// Query, server and database probes share one open connection and run
    /// one after another.
    async fn run_sql_probes(
        &self,
        client: &mut dyn DatabaseClient,
        report: &mut DiagnosticReport,
        categories: DiagnosticCategories,
        options: &DiagnosticOptions,
        token: &CancellationToken,
    ) -> Result<()> {
        if categories.contains(DiagnosticCategories::QUERY) {
            let result =
                QueryProbe::execute_with_diagnostics(client, &options.probe_query, &[], token).await;
            report.query = absorb(report, "query", result)?;
        }

        if categories.contains(DiagnosticCategories::SERVER) {
            let result = ServerProbe::new(options.top_wait_events)
                .collect(client, token)
                .await;
            report.server = absorb(report, "server", result)?;
        }

        if categories.contains(DiagnosticCategories::DATABASE) {
            let result = DatabaseProbe::new(options.long_transaction_threshold)
                .collect(client, token)
                .await;
            report.database = absorb(report, "database", result)?;
        }

        Ok(())
    }

    fn compare_with_baseline(&self, report: &mut DiagnosticReport, options: &DiagnosticOptions) {
        let Some(baseline) = &options.baseline else {
            debug!("Baseline comparison requested without a baseline");
            report.metadata.insert(
                "baseline.skipped".to_string(),
                "comparison requested but no baseline was supplied".to_string(),
            );
            return;
        };

        let thresholds = RegressionThresholds::from(&options.thresholds);
        let comparison = evaluate_regressions(baseline, &LiveSample::from_report(report), &thresholds);

        report
            .recommendations
            .extend(comparison.findings.iter().map(|finding| Recommendation {
                severity: finding.severity,
                category: "Baseline".to_string(),
                title: format!("{} regression", finding.category),
                message: finding.message.clone(),
                source: "baseline".to_string(),
            }));
        report.baseline_comparison = Some(comparison);
    }
}

