use super::{ratio, VersionedQuery};
use crate::client::{DatabaseClient, SqlParam, SqlRow};
use crate::error::{DiagnosticError, Result};
use crate::timing::cancellable;
use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;
use tracing::debug;

const SERVER_SUMMARY: VersionedQuery = VersionedQuery {
    name: "server summary",
    optimistic: r#"
SELECT current_setting('server_version'),
       EXTRACT(EPOCH FROM (now() - pg_postmaster_start_time()))::bigint,
       current_setting('max_connections')::bigint,
       (SELECT count(*) FROM pg_stat_activity WHERE datname IS NOT NULL),
       (SELECT count(*) FROM pg_stat_activity WHERE state = 'active'),
       (SELECT count(*) FROM pg_stat_activity WHERE state = 'active' AND wait_event IS NOT NULL),
       (SELECT count(*) FROM pg_stat_activity WHERE cardinality(pg_blocking_pids(pid)) > 0),
       (SELECT wal_records FROM pg_stat_wal)::bigint,
       (SELECT wal_bytes FROM pg_stat_wal)::bigint
"#,
    reduced: r#"
SELECT current_setting('server_version'),
       EXTRACT(EPOCH FROM (now() - pg_postmaster_start_time()))::bigint,
       current_setting('max_connections')::bigint,
       (SELECT count(*) FROM pg_stat_activity WHERE datname IS NOT NULL),
       (SELECT count(*) FROM pg_stat_activity WHERE state = 'active'),
       (SELECT count(*) FROM pg_stat_activity WHERE state = 'active' AND wait_event IS NOT NULL),
       (SELECT count(*) FROM pg_stat_activity WHERE cardinality(pg_blocking_pids(pid)) > 0)
"#,
    optional_fields: &["wal_records", "wal_bytes"],
};

const TOP_WAIT_EVENTS: &str = r#"
SELECT wait_event_type, wait_event, count(*)::bigint
FROM pg_stat_activity
WHERE wait_event IS NOT NULL AND state = 'active'
GROUP BY wait_event_type, wait_event
ORDER BY 3 DESC
LIMIT $1
"#;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WaitEventSummary {
    pub event_type: String,
    pub event: String,
    pub sessions: i64,
}

/// Instance-wide state: sessions, blocking, WAL activity and wait events.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ServerMetrics {
    pub server_version: Option<String>,
    pub uptime_seconds: Option<i64>,
    pub max_connections: Option<i64>,
    pub total_sessions: Option<i64>,
    pub active_sessions: Option<i64>,
    pub waiting_sessions: Option<i64>,
    pub blocked_sessions: Option<i64>,
    /// `total_sessions / max_connections`
    pub connection_utilization: Option<f64>,
    pub wal_records: Option<i64>,
    pub wal_bytes: Option<i64>,
    pub top_wait_events: Vec<WaitEventSummary>,
    /// Fields the reduced fallback query could not provide.
    pub degraded_fields: Vec<String>,
}

impl ServerMetrics {
    fn from_summary_row(row: &SqlRow) -> Self {
        let total_sessions = row.get_i64(3);
        let max_connections = row.get_i64(2);
        Self {
            server_version: row.get_string(0),
            uptime_seconds: row.get_i64(1),
            max_connections,
            total_sessions,
            active_sessions: row.get_i64(4),
            waiting_sessions: row.get_i64(5),
            blocked_sessions: row.get_i64(6),
            connection_utilization: ratio(total_sessions, max_connections),
            wal_records: row.get_i64(7),
            wal_bytes: row.get_i64(8),
            ..Default::default()
        }
    }
}

#[derive(Debug, Clone, Copy)]
pub struct ServerProbe {
    top_wait_events: u32,
}

impl Default for ServerProbe {
    fn default() -> Self {
        Self { top_wait_events: 5 }
    }
}

impl ServerProbe {
    pub fn new(top_wait_events: u32) -> Self {
        Self { top_wait_events }
    }

    /// Collect server metrics over an open client.
    pub async fn collect(
        &self,
        client: &mut dyn DatabaseClient,
        token: &CancellationToken,
    ) -> Result<ServerMetrics> {
        if !client.is_open() {
            return Err(DiagnosticError::invalid_input("server probe requires an open connection"));
        }

        let summary = SERVER_SUMMARY.run(client, &[], token).await?;
        let mut metrics = summary
            .rows
            .first()
            .map(ServerMetrics::from_summary_row)
            .unwrap_or_default();
        metrics.degraded_fields = summary.degraded_fields;

        if self.top_wait_events > 0 {
            let limit = SqlParam::Int(i64::from(self.top_wait_events));
            let rows = cancellable(token, client.execute(TOP_WAIT_EVENTS, &[limit])).await??;
            metrics.top_wait_events = rows
                .iter()
                .filter_map(|row| {
                    Some(WaitEventSummary {
                        event_type: row.get_string(0)?,
                        event: row.get_string(1)?,
                        sessions: row.get_i64(2).unwrap_or(0),
                    })
                })
                .collect();
        }

        debug!(
            "Server {} utilization {:?}, blocked sessions {:?}",
            client.server_name(),
            metrics.connection_utilization,
            metrics.blocked_sessions
        );
        Ok(metrics)
    }
}
