use crate::client::{PingStatus, Pinger};
use crate::error::{DiagnosticError, Result};
use crate::stats::LatencyStats;
use crate::target::HostEndpoint;
use crate::timing::cancellable;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::debug;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LatencySample {
    pub timestamp: DateTime<Utc>,
    pub success: bool,
    pub elapsed_ms: Option<f64>,
    pub status: PingStatus,
    pub error: Option<String>,
}

/// Round-trip samples for one host. The derived fields are `None` when no
/// sample succeeded.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LatencyMetrics {
    pub host: String,
    pub samples: Vec<LatencySample>,
    pub successful_samples: usize,
    pub average_ms: Option<f64>,
    pub min_ms: Option<f64>,
    pub max_ms: Option<f64>,
    pub jitter_ms: Option<f64>,
    pub packet_loss: f64,
    pub success: bool,
}

impl LatencyMetrics {
    fn from_samples(host: String, samples: Vec<LatencySample>) -> Self {
        let successes: Vec<f64> = samples
            .iter()
            .filter(|s| s.success)
            .filter_map(|s| s.elapsed_ms)
            .collect();
        let stats = LatencyStats::from_samples(&successes);
        let packet_loss = if samples.is_empty() {
            1.0
        } else {
            1.0 - successes.len() as f64 / samples.len() as f64
        };

        Self {
            host,
            successful_samples: successes.len(),
            average_ms: stats.map(|s| s.average_ms),
            min_ms: stats.map(|s| s.min_ms),
            max_ms: stats.map(|s| s.max_ms),
            jitter_ms: stats.map(|s| s.jitter_ms),
            packet_loss,
            success: !successes.is_empty(),
            samples,
        }
    }
}

#[derive(Debug, Clone)]
pub struct NetworkProbe {
    pinger: Arc<dyn Pinger>,
}

impl NetworkProbe {
    pub fn new(pinger: Arc<dyn Pinger>) -> Self {
        Self { pinger }
    }

    /// Ping `endpoint` `attempts` times, one after another.
    pub async fn measure_latency(
        &self,
        endpoint: &HostEndpoint,
        attempts: u32,
        timeout: Duration,
        token: &CancellationToken,
    ) -> Result<LatencyMetrics> {
        if attempts == 0 {
            return Err(DiagnosticError::invalid_input("attempts must be at least 1"));
        }
        if timeout.is_zero() {
            return Err(DiagnosticError::invalid_input("ping timeout must be positive"));
        }

        let mut samples = Vec::with_capacity(attempts as usize);
        for attempt in 1..=attempts {
            let reply = cancellable(token, self.pinger.ping(endpoint, timeout)).await?;
            debug!("Ping {} to {}: {:?}", attempt, endpoint, reply.status);

            let error = match &reply.status {
                PingStatus::Success => None,
                PingStatus::TimedOut => Some(format!("no reply within {timeout:?}")),
                PingStatus::Unreachable => Some("host unreachable".to_string()),
                PingStatus::Error(message) => Some(message.clone()),
            };
            samples.push(LatencySample {
                timestamp: Utc::now(),
                success: reply.success,
                elapsed_ms: reply.round_trip_ms,
                status: reply.status,
                error,
            });
        }

        Ok(LatencyMetrics::from_samples(endpoint.to_string(), samples))
    }
}
