//! Metric collectors. Each probe measures one aspect of server or connection
//! health and returns a typed record.

pub mod connection;
pub mod database;
pub mod network;
pub mod query;
pub mod server;

use crate::client::{ConnectionFactory, DatabaseClient, DbError, SqlParam, SqlRow};
use crate::error::Result;
use crate::retry::RetryPolicy;
use crate::target::ConnectionTarget;
use crate::timing::cancellable;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

pub use connection::{
    ConnectionFailure, ConnectionMetrics, ConnectionPoolMetrics, ConnectionProbe,
    ConnectionStabilityReport, FailureKind, StabilitySample,
};
pub use database::{DatabaseMetrics, DatabaseProbe};
pub use network::{LatencyMetrics, LatencySample, NetworkProbe};
pub use query::{QueryMetrics, QueryProbe};
pub use server::{ServerMetrics, ServerProbe, WaitEventSummary};

/// Open a fresh client for `target`, retrying transient failures. Each
/// attempt is bounded by `connect_timeout`.
pub async fn open_client(
    factory: &dyn ConnectionFactory,
    target: &ConnectionTarget,
    policy: &RetryPolicy,
    connect_timeout: Duration,
    token: &CancellationToken,
) -> Result<Box<dyn DatabaseClient>> {
    policy
        .execute(token, || async move {
            let mut client = factory.create(target);
            match tokio::time::timeout(connect_timeout, client.open()).await {
                Ok(Ok(())) => Ok(client),
                Ok(Err(e)) => Err(e.into()),
                Err(_) => Err(DbError::timeout(format!(
                    "connection to {} not established within {:?}",
                    target.display_name(),
                    connect_timeout
                ))
                .into()),
            }
        })
        .await
}

/// Close a client, logging instead of failing. Used on cleanup paths.
pub async fn close_quietly(client: &mut dyn DatabaseClient) {
    if !client.is_open() {
        return;
    }
    if let Err(e) = client.close().await {
        debug!("Ignoring error while closing {}: {}", client.server_name(), e);
    }
}

/// An optimistic statement that uses newer catalog views or columns, and the
/// reduced statement to fall back to on servers that lack them.
#[derive(Debug, Clone, Copy)]
pub(crate) struct VersionedQuery {
    pub name: &'static str,
    pub optimistic: &'static str,
    pub reduced: &'static str,
    /// Fields only the optimistic statement returns.
    pub optional_fields: &'static [&'static str],
}

/// Rows plus the names of fields the fallback dropped.
pub(crate) struct FallbackRows {
    pub rows: Vec<SqlRow>,
    pub degraded_fields: Vec<String>,
}

impl VersionedQuery {
    pub async fn run(
        &self,
        client: &mut dyn DatabaseClient,
        params: &[SqlParam],
        token: &CancellationToken,
    ) -> Result<FallbackRows> {
        match cancellable(token, client.execute(self.optimistic, params)).await? {
            Ok(rows) => Ok(FallbackRows {
                rows,
                degraded_fields: Vec::new(),
            }),
            Err(e) if e.is_undefined_object() => {
                warn!(
                    "{} query not supported by {} ({}), using reduced query",
                    self.name,
                    client.server_name(),
                    e
                );
                let rows = cancellable(token, client.execute(self.reduced, params)).await??;
                Ok(FallbackRows {
                    rows,
                    degraded_fields: self.optional_fields.iter().map(|f| f.to_string()).collect(),
                })
            }
            Err(e) => Err(e.into()),
        }
    }
}

/// `numerator / denominator`, absent when the denominator is zero or unknown.
pub(crate) fn ratio(numerator: Option<i64>, denominator: Option<i64>) -> Option<f64> {
    match (numerator, denominator) {
        (Some(n), Some(d)) if d > 0 => Some(n as f64 / d as f64),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_ratio() {
        assert_eq!(ratio(Some(1), Some(4)), Some(0.25));
        assert_eq!(ratio(Some(1), Some(0)), None);
        assert_eq!(ratio(None, Some(4)), None);
    }
}
