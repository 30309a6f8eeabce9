use crate::client::postgres::{connect_options, map_sqlx_error, DEFAULT_APPLICATION_NAME};
use crate::client::DbError;
use crate::error::{DiagnosticError, Result};
use crate::stats::{mean, success_rate};
use crate::target::ConnectionTarget;
use crate::timing::{cancellable, duration_ms, sleep_cancellable};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::postgres::PgPoolOptions;
use sqlx::PgPool;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

/// Pool counters at one instant.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PoolCounters {
    /// Connections currently held by the pool, idle or checked out
    pub size: u32,
    pub idle: u32,
    pub max_size: u32,
}

impl PoolCounters {
    pub fn active(&self) -> u32 {
        self.size.saturating_sub(self.idle)
    }

    pub fn utilization(&self) -> f64 {
        if self.max_size == 0 {
            return 0.0;
        }
        self.active() as f64 / self.max_size as f64
    }
}

/// A connection pool the monitor can observe.
#[async_trait]
pub trait PoolStatsSource: Send + Sync {
    fn counters(&self) -> PoolCounters;

    /// Check a connection out and return it straight away.
    async fn acquire(&self) -> std::result::Result<(), DbError>;
}

/// Observes a `sqlx` Postgres pool.
#[derive(Debug, Clone)]
pub struct PgPoolSource {
    pool: PgPool,
}

impl PgPoolSource {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    /// Build a lazy pool for `target`. No connection is made until the first
    /// acquisition, so connect failures show up in the samples.
    pub fn connect_lazy(
        target: &ConnectionTarget,
        max_connections: u32,
        acquire_timeout: Duration,
    ) -> Self {
        let pool = PgPoolOptions::new()
            .max_connections(max_connections)
            .acquire_timeout(acquire_timeout)
            .connect_lazy_with(connect_options(target, DEFAULT_APPLICATION_NAME));
        Self { pool }
    }

    pub async fn close(&self) {
        self.pool.close().await;
    }
}

#[async_trait]
impl PoolStatsSource for PgPoolSource {
    fn counters(&self) -> PoolCounters {
        PoolCounters {
            size: self.pool.size(),
            idle: self.pool.num_idle() as u32,
            max_size: self.pool.options().get_max_connections(),
        }
    }

    async fn acquire(&self) -> std::result::Result<(), DbError> {
        self.pool
            .acquire()
            .await
            .map(drop)
            .map_err(|e| map_sqlx_error(e, "pool"))
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConnectionPoolSnapshot {
    pub timestamp: DateTime<Utc>,
    pub active: u32,
    pub idle: u32,
    pub pooled: u32,
    pub max_size: u32,
    pub utilization: f64,
    pub acquisition_ms: f64,
    pub acquire_error: Option<String>,
}

impl ConnectionPoolSnapshot {
    pub fn acquired(&self) -> bool {
        self.acquire_error.is_none()
    }
}

/// Cutoffs for [`summarize_pool_health`].
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PoolThresholds {
    /// Acquisition time that counts as slow, and as starvation when no
    /// connection was idle
    pub slow_acquisition_ms: f64,
    /// Pool size that is suspicious on its own
    pub max_pooled_connections: u32,
    /// Acquire failure rate at or above which the pool is critical
    pub critical_failure_rate: f64,
}

impl Default for PoolThresholds {
    fn default() -> Self {
        Self {
            slow_acquisition_ms: 1000.0,
            max_pooled_connections: 1000,
            critical_failure_rate: 0.1,
        }
    }
}

impl PoolThresholds {
    pub fn validate(&self) -> anyhow::Result<()> {
        if self.slow_acquisition_ms <= 0.0 {
            return Err(anyhow::anyhow!("pool.slow_acquisition_ms must be positive"));
        }
        if !(0.0..=1.0).contains(&self.critical_failure_rate) || self.critical_failure_rate == 0.0 {
            return Err(anyhow::anyhow!(
                "pool.critical_failure_rate must be in (0, 1]"
            ));
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
pub enum PoolHealthSeverity {
    Healthy,
    Warning,
    Critical,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConnectionPoolHealthReport {
    pub samples: usize,
    pub failed_acquisitions: usize,
    pub failure_rate: f64,
    pub average_acquisition_ms: Option<f64>,
    pub peak_acquisition_ms: Option<f64>,
    pub peak_active: u32,
    pub peak_pooled: u32,
    pub starvation_events: usize,
    pub severity: PoolHealthSeverity,
    pub summary: String,
}

/// Classify a series of pool snapshots.
pub fn summarize_pool_health(
    snapshots: &[ConnectionPoolSnapshot],
    thresholds: &PoolThresholds,
) -> ConnectionPoolHealthReport {
    let samples = snapshots.len();
    let failed = snapshots.iter().filter(|s| !s.acquired()).count();
    let failure_rate = 1.0 - success_rate(samples - failed, samples);
    let failure_rate = if samples == 0 { 0.0 } else { failure_rate };

    let acquisitions: Vec<f64> = snapshots
        .iter()
        .filter(|s| s.acquired())
        .map(|s| s.acquisition_ms)
        .collect();
    let peak_acquisition = acquisitions.iter().copied().reduce(f64::max);

    let slow = |s: &&ConnectionPoolSnapshot| s.acquisition_ms >= thresholds.slow_acquisition_ms;
    let starvation_events = snapshots.iter().filter(slow).filter(|s| s.idle == 0).count();
    let slow_events = snapshots.iter().filter(slow).count();

    let peak_active = snapshots.iter().map(|s| s.active).max().unwrap_or(0);
    let peak_pooled = snapshots.iter().map(|s| s.pooled).max().unwrap_or(0);

    let (severity, summary) = if samples == 0 {
        (PoolHealthSeverity::Healthy, "No pool samples collected".to_string())
    } else if failed > 0 && failure_rate >= thresholds.critical_failure_rate {
        (
            PoolHealthSeverity::Critical,
            format!(
                "CRITICAL: {failed}/{samples} connection acquisitions failed ({:.0}%)",
                failure_rate * 100.0
            ),
        )
    } else if starvation_events > 0 {
        (
            PoolHealthSeverity::Critical,
            format!(
                "CRITICAL: pool starved in {starvation_events} sample(s), no idle connections and \
                 acquisition over {:.0}ms",
                thresholds.slow_acquisition_ms
            ),
        )
    } else if failed > 0 {
        (
            PoolHealthSeverity::Warning,
            format!("WARNING: {failed}/{samples} connection acquisitions failed"),
        )
    } else if slow_events > 0 {
        (
            PoolHealthSeverity::Warning,
            format!(
                "WARNING: {slow_events} acquisition(s) took over {:.0}ms",
                thresholds.slow_acquisition_ms
            ),
        )
    } else if peak_pooled >= thresholds.max_pooled_connections {
        (
            PoolHealthSeverity::Warning,
            format!("WARNING: pool grew to {peak_pooled} connections"),
        )
    } else {
        (
            PoolHealthSeverity::Healthy,
            format!(
                "HEALTHY: {samples} samples, peak {peak_active} active of {peak_pooled} pooled"
            ),
        )
    };

    ConnectionPoolHealthReport {
        samples,
        failed_acquisitions: failed,
        failure_rate,
        average_acquisition_ms: mean(&acquisitions),
        peak_acquisition_ms: peak_acquisition,
        peak_active,
        peak_pooled,
        starvation_events,
        severity,
        summary,
    }
}

/// Samples a pool at an interval and rates its health.
#[derive(Clone)]
pub struct ConnectionPoolMonitor {
    source: Arc<dyn PoolStatsSource>,
    thresholds: PoolThresholds,
}

impl ConnectionPoolMonitor {
    pub fn new(source: Arc<dyn PoolStatsSource>, thresholds: PoolThresholds) -> Self {
        Self { source, thresholds }
    }

    /// Read the counters, then time one acquisition.
    pub async fn sample(&self, token: &CancellationToken) -> Result<ConnectionPoolSnapshot> {
        let counters = self.source.counters();
        let start = Instant::now();
        let acquired = cancellable(token, self.source.acquire()).await?;
        let acquisition_ms = duration_ms(start.elapsed());

        if let Err(e) = &acquired {
            warn!("Pool acquisition failed after {:.0}ms: {}", acquisition_ms, e);
        }

        Ok(ConnectionPoolSnapshot {
            timestamp: Utc::now(),
            active: counters.active(),
            idle: counters.idle,
            pooled: counters.size,
            max_size: counters.max_size,
            utilization: counters.utilization(),
            acquisition_ms,
            acquire_error: acquired.err().map(|e| e.to_string()),
        })
    }

    pub async fn collect(
        &self,
        count: u32,
        interval: Duration,
        token: &CancellationToken,
    ) -> Result<Vec<ConnectionPoolSnapshot>> {
        if count == 0 {
            return Err(DiagnosticError::invalid_input("sample count must be at least 1"));
        }

        let mut snapshots = Vec::with_capacity(count as usize);
        for sample in 1..=count {
            let snapshot = self.sample(token).await?;
            debug!(
                "Pool sample {}: {}/{} active, {:.1}ms acquisition",
                sample, snapshot.active, snapshot.max_size, snapshot.acquisition_ms
            );
            snapshots.push(snapshot);
            if sample < count {
                sleep_cancellable(token, interval).await?;
            }
        }
        Ok(snapshots)
    }

    pub async fn check_health(
        &self,
        count: u32,
        interval: Duration,
        token: &CancellationToken,
    ) -> Result<ConnectionPoolHealthReport> {
        let snapshots = self.collect(count, interval, token).await?;
        let report = summarize_pool_health(&snapshots, &self.thresholds);

        match report.severity {
            PoolHealthSeverity::Healthy => info!("{}", report.summary),
            PoolHealthSeverity::Warning => warn!("{}", report.summary),
            PoolHealthSeverity::Critical => error!("{}", report.summary),
        }
        Ok(report)
    }
}
