use super::close_quietly;
use crate::client::{DatabaseClient, SqlParam};
use crate::error::{DiagnosticError, Result};
use crate::timing::{cancellable, duration_ms};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::debug;

const MAX_QUERY_TEXT: usize = 200;

/// Timings and client statistics for a single statement.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct QueryMetrics {
    /// Statement text, truncated.
    pub query: String,
    pub duration_ms: f64,
    pub result_rows: usize,
    pub network_time_ms: Option<i64>,
    pub server_time_ms: Option<i64>,
    pub bytes_sent: Option<i64>,
    pub bytes_received: Option<i64>,
    pub rows_returned: Option<i64>,
    pub round_trips: Option<i64>,
    /// Every statistic the client reported, including ones not mapped above.
    pub raw_statistics: BTreeMap<String, i64>,
}

impl QueryMetrics {
    fn apply_statistics(&mut self, statistics: BTreeMap<String, i64>) {
        self.network_time_ms = statistics.get("NetworkServerTime").copied();
        self.server_time_ms = statistics.get("ExecutionTime").copied();
        self.bytes_sent = statistics.get("BytesSent").copied();
        self.bytes_received = statistics.get("BytesReceived").copied();
        self.rows_returned = statistics.get("SelectRows").copied();
        self.round_trips = statistics.get("ServerRoundtrips").copied();
        self.raw_statistics = statistics;
    }
}

#[derive(Debug, Clone, Copy, Default)]
pub struct QueryProbe;

impl QueryProbe {
    /// Execute `query` with client statistics enabled. Opens `client` only if
    /// it is closed, and closes only a connection it opened itself.
    pub async fn execute_with_diagnostics(
        client: &mut dyn DatabaseClient,
        query: &str,
        params: &[SqlParam],
        token: &CancellationToken,
    ) -> Result<QueryMetrics> {
        if query.trim().is_empty() {
            return Err(DiagnosticError::invalid_input("query text cannot be empty"));
        }

        let opened_here = if client.is_open() {
            false
        } else {
            cancellable(token, client.open()).await??;
            true
        };

        let result = Self::measure(client, query, params, token).await;

        if opened_here {
            close_quietly(client).await;
        }
        result
    }

    async fn measure(
        client: &mut dyn DatabaseClient,
        query: &str,
        params: &[SqlParam],
        token: &CancellationToken,
    ) -> Result<QueryMetrics> {
        client.set_statistics_enabled(true);
        client.reset_statistics();

        let start = Instant::now();
        let rows = cancellable(token, client.execute(query, params)).await??;
        let elapsed = duration_ms(start.elapsed());

        let mut metrics = QueryMetrics {
            query: query.chars().take(MAX_QUERY_TEXT).collect(),
            duration_ms: elapsed,
            result_rows: rows.len(),
            ..Default::default()
        };
        metrics.apply_statistics(client.statistics());
        client.set_statistics_enabled(false);

        debug!(
            "Query on {} returned {} rows in {:.1}ms",
            client.server_name(),
            metrics.result_rows,
            elapsed
        );
        Ok(metrics)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_missing_statistics_are_omitted() {
        let mut metrics = QueryMetrics::default();
        let mut stats = BTreeMap::new();
        stats.insert("BytesSent".to_string(), 120);
        stats.insert("CursorOpens".to_string(), 1);
        metrics.apply_statistics(stats);

        assert_eq!(metrics.bytes_sent, Some(120));
        assert_eq!(metrics.bytes_received, None);
        assert_eq!(metrics.network_time_ms, None);
        assert_eq!(metrics.raw_statistics.get("CursorOpens"), Some(&1));
    }
}
