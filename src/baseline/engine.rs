use super::{
    evaluate_regressions, BaselineStore, LiveSample, PerformanceBaseline, RegressionReport,
    RegressionThresholds,
};
use crate::diagnostics::{DiagnosticOptions, DiagnosticOrchestrator};
use crate::error::{DiagnosticError, Result};
use crate::stats::summarize;
use crate::target::ConnectionTarget;
use crate::timing::sleep_cancellable;
use chrono::Utc;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

/// Captures baselines from repeated quick checks and compares live runs
/// against them.
#[derive(Debug, Clone)]
pub struct BaselineEngine {
    orchestrator: Arc<DiagnosticOrchestrator>,
    store: Arc<dyn BaselineStore>,
    options: DiagnosticOptions,
}

impl BaselineEngine {
    pub fn new(
        orchestrator: Arc<DiagnosticOrchestrator>,
        store: Arc<dyn BaselineStore>,
        options: DiagnosticOptions,
    ) -> Self {
        Self {
            orchestrator,
            store,
            options,
        }
    }

    pub fn store(&self) -> &Arc<dyn BaselineStore> {
        &self.store
    }

    pub async fn capture_baseline(
        &self,
        target: &str,
        name: &str,
        sample_count: u32,
        sample_interval: Duration,
        token: &CancellationToken,
    ) -> Result<PerformanceBaseline> {
        if sample_count == 0 {
            return Err(DiagnosticError::invalid_input("sample_count must be at least 1"));
        }
        if name.trim().is_empty() {
            return Err(DiagnosticError::invalid_input("baseline name cannot be empty"));
        }
        let parsed = ConnectionTarget::parse(target)?;

        info!(
            "Capturing baseline '{}' for {} ({} samples)",
            name,
            parsed.display_name(),
            sample_count
        );

        let mut connection_times = Vec::with_capacity(sample_count as usize);
        let mut success_rates = Vec::with_capacity(sample_count as usize);
        let mut network_latencies = Vec::with_capacity(sample_count as usize);

        for sample in 1..=sample_count {
            let report = self
                .orchestrator
                .quick_check(target, &self.options, token)
                .await?;
            let live = LiveSample::from_report(&report);
            debug!("Baseline sample {}/{}: {:?}", sample, sample_count, live);

            connection_times.extend(live.connection_ms);
            success_rates.extend(live.success_rate);
            network_latencies.extend(live.network_ms);

            if sample < sample_count {
                sleep_cancellable(token, sample_interval).await?;
            }
        }

        let baseline = PerformanceBaseline {
            name: name.trim().to_string(),
            captured_at: Utc::now(),
            target_hash: parsed.target_hash(),
            sample_count,
            connection_time_ms: summarize(&connection_times),
            success_rate: summarize(&success_rates),
            network_latency_ms: summarize(&network_latencies),
        };

        let location = self.store.save(&baseline).await?;
        info!("Baseline '{}' stored at {}", baseline.name, location);
        Ok(baseline)
    }

    /// Compare one live quick check against the named baseline, or against
    /// the newest baseline captured for this target.
    pub async fn compare_to_baseline(
        &self,
        target: &str,
        baseline_name: Option<&str>,
        token: &CancellationToken,
    ) -> Result<RegressionReport> {
        let parsed = ConnectionTarget::parse(target)?;

        let baseline = match baseline_name {
            Some(name) => self
                .store
                .load_latest_by_name(name)
                .await?
                .ok_or_else(|| DiagnosticError::BaselineNotFound {
                    key: name.to_string(),
                })?,
            None => self
                .store
                .load_latest_for_target(&parsed.target_hash())
                .await?
                .ok_or_else(|| DiagnosticError::BaselineNotFound {
                    key: parsed.display_name(),
                })?,
        };

        let report = self
            .orchestrator
            .quick_check(target, &self.options, token)
            .await?;
        let live = LiveSample::from_report(&report);

        let thresholds = RegressionThresholds::from(&self.options.thresholds);
        let comparison = evaluate_regressions(&baseline, &live, &thresholds);
        info!(
            "Compared {} against baseline '{}': {}",
            parsed.display_name(),
            baseline.name,
            comparison.summary
        );
        Ok(comparison)
    }
}
