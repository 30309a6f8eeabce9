use super::{ratio, VersionedQuery};
use crate::client::{DatabaseClient, SqlParam, SqlRow};
use crate::error::{DiagnosticError, Result};
use crate::timing::cancellable;
use serde::{Deserialize, Serialize};
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::debug;

// `checksum_failures` arrived in 12, `sessions*` in 14.
const DATABASE_STATS: VersionedQuery = VersionedQuery {
    name: "database statistics",
    optimistic: r#"
SELECT d.datname::text, d.numbackends::bigint, d.xact_commit, d.xact_rollback,
       d.blks_read, d.blks_hit, d.deadlocks, d.temp_bytes,
       pg_database_size(d.datname)::bigint,
       d.checksum_failures, d.sessions, d.sessions_abandoned
FROM pg_stat_database d
WHERE d.datname = current_database()
"#,
    reduced: r#"
SELECT d.datname::text, d.numbackends::bigint, d.xact_commit, d.xact_rollback,
       d.blks_read, d.blks_hit, d.deadlocks, d.temp_bytes,
       pg_database_size(d.datname)::bigint
FROM pg_stat_database d
WHERE d.datname = current_database()
"#,
    optional_fields: &["checksum_failures", "sessions", "sessions_abandoned"],
};

const LONG_TRANSACTIONS: &str = r#"
SELECT count(*)::bigint
FROM pg_stat_activity
WHERE datname = current_database()
  AND xact_start IS NOT NULL
  AND now() - xact_start > make_interval(secs => $1)
"#;

/// Counters for the connected database.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct DatabaseMetrics {
    pub database_name: Option<String>,
    pub backends: Option<i64>,
    pub commits: Option<i64>,
    pub rollbacks: Option<i64>,
    pub blocks_read: Option<i64>,
    pub blocks_hit: Option<i64>,
    pub deadlocks: Option<i64>,
    pub temp_bytes: Option<i64>,
    pub size_bytes: Option<i64>,
    pub checksum_failures: Option<i64>,
    pub sessions: Option<i64>,
    pub sessions_abandoned: Option<i64>,
    pub cache_hit_ratio: Option<f64>,
    pub rollback_ratio: Option<f64>,
    pub long_running_transactions: Option<i64>,
    pub degraded_fields: Vec<String>,
}

impl DatabaseMetrics {
    fn from_row(row: &SqlRow) -> Self {
        let commits = row.get_i64(2);
        let rollbacks = row.get_i64(3);
        let blocks_read = row.get_i64(4);
        let blocks_hit = row.get_i64(5);

        let total_blocks = blocks_read.zip(blocks_hit).and_then(|(r, h)| r.checked_add(h));
        let total_xacts = commits.zip(rollbacks).and_then(|(c, r)| c.checked_add(r));

        Self {
            database_name: row.get_string(0),
            backends: row.get_i64(1),
            commits,
            rollbacks,
            blocks_read,
            blocks_hit,
            deadlocks: row.get_i64(6),
            temp_bytes: row.get_i64(7),
            size_bytes: row.get_i64(8),
            checksum_failures: row.get_i64(9),
            sessions: row.get_i64(10),
            sessions_abandoned: row.get_i64(11),
            cache_hit_ratio: ratio(blocks_hit, total_blocks),
            rollback_ratio: ratio(rollbacks, total_xacts),
            ..Default::default()
        }
    }
}

#[derive(Debug, Clone, Copy)]
pub struct DatabaseProbe {
    long_transaction_threshold: Duration,
}

impl Default for DatabaseProbe {
    fn default() -> Self {
        Self {
            long_transaction_threshold: Duration::from_secs(300),
        }
    }
}

impl DatabaseProbe {
    pub fn new(long_transaction_threshold: Duration) -> Self {
        Self {
            long_transaction_threshold,
        }
    }

    pub async fn collect(
        &self,
        client: &mut dyn DatabaseClient,
        token: &CancellationToken,
    ) -> Result<DatabaseMetrics> {
        if !client.is_open() {
            return Err(DiagnosticError::invalid_input("database probe requires an open connection"));
        }

        let stats = DATABASE_STATS.run(client, &[], token).await?;
        let mut metrics = stats
            .rows
            .first()
            .map(DatabaseMetrics::from_row)
            .unwrap_or_default();
        metrics.degraded_fields = stats.degraded_fields;

        let threshold = SqlParam::Float(self.long_transaction_threshold.as_secs_f64());
        let rows = cancellable(token, client.execute(LONG_TRANSACTIONS, &[threshold])).await??;
        metrics.long_running_transactions = rows.first().and_then(|row| row.get_i64(0));

        debug!(
            "Database {:?} cache hit ratio {:?}",
            metrics.database_name, metrics.cache_hit_ratio
        );
        Ok(metrics)
    }
}
