use super::{
    ConnectionFactory, DatabaseClient, DbError, DbErrorKind, DbSeverity, SqlParam, SqlRow,
    SqlValue,
};
use crate::target::ConnectionTarget;
use crate::timing::duration_ms;
use async_trait::async_trait;
use sqlx::postgres::{
    PgConnectOptions, PgConnection, PgDatabaseError, PgRow, PgSeverity, PgSslMode,
};
use sqlx::{Column, Connection, Row, TypeInfo, ValueRef};
use std::collections::BTreeMap;
use std::str::FromStr;
use std::time::Duration;
use tokio::time::Instant;
use tracing::debug;

pub const DEFAULT_APPLICATION_NAME: &str = "db-diagnostics";

/// Creates [`PgClient`]s. Each client owns at most one physical connection.
#[derive(Debug, Clone)]
pub struct PgConnectionFactory {
    connect_timeout: Duration,
    application_name: String,
}

impl Default for PgConnectionFactory {
    fn default() -> Self {
        Self {
            connect_timeout: Duration::from_secs(15),
            application_name: DEFAULT_APPLICATION_NAME.to_string(),
        }
    }
}

impl PgConnectionFactory {
    pub fn new(connect_timeout: Duration) -> Self {
        Self {
            connect_timeout,
            ..Self::default()
        }
    }

    pub fn with_application_name(mut self, name: impl Into<String>) -> Self {
        self.application_name = name.into();
        self
    }
}

impl ConnectionFactory for PgConnectionFactory {
    fn create(&self, target: &ConnectionTarget) -> Box<dyn DatabaseClient> {
        Box::new(PgClient::new(
            target,
            self.connect_timeout,
            &self.application_name,
        ))
    }
}

#[derive(Debug, Default)]
struct ClientStatistics {
    connection_time_ms: Option<f64>,
    execution_time_ms: f64,
    round_trips: i64,
    select_count: i64,
    rows: i64,
    bytes_sent: i64,
    bytes_received: i64,
}

/// A single sqlx connection with lightweight client-side statistics.
///
/// sqlx exposes no wire-level counters, so byte counts are estimated from the
/// statement text, bound parameters and decoded column values.
pub struct PgClient {
    options: PgConnectOptions,
    server: String,
    connect_timeout: Duration,
    conn: Option<PgConnection>,
    stats_enabled: bool,
    stats: ClientStatistics,
}

impl PgClient {
    pub fn new(target: &ConnectionTarget, connect_timeout: Duration, application_name: &str) -> Self {
        Self {
            options: connect_options(target, application_name),
            server: target.display_name(),
            connect_timeout,
            conn: None,
            stats_enabled: false,
            stats: ClientStatistics::default(),
        }
    }
}

pub(crate) fn connect_options(target: &ConnectionTarget, application_name: &str) -> PgConnectOptions {
    let mut options = PgConnectOptions::new();

    match (target.endpoint(), target.host.as_deref()) {
        (Some(endpoint), _) => {
            options = options.host(&endpoint.host);
            if let Some(port) = endpoint.port {
                options = options.port(port);
            }
        }
        // Unix socket directory
        (None, Some(host)) => options = options.host(host),
        (None, None) => {}
    }
    if let Some(port) = target.port {
        options = options.port(port);
    }
    if let Some(user) = &target.username {
        options = options.username(user);
    }
    if let Some(password) = target.password() {
        options = options.password(password);
    }
    if let Some(database) = &target.database {
        options = options.database(database);
    }
    if let Some(mode) = target
        .options
        .get("sslmode")
        .and_then(|m| PgSslMode::from_str(m).ok())
    {
        options = options.ssl_mode(mode);
    }

    options.application_name(target.application_name().unwrap_or(application_name))
}

fn map_severity(severity: PgSeverity) -> DbSeverity {
    match severity {
        PgSeverity::Panic => DbSeverity::Panic,
        PgSeverity::Fatal => DbSeverity::Fatal,
        PgSeverity::Error => DbSeverity::Error,
        PgSeverity::Warning => DbSeverity::Warning,
        PgSeverity::Notice => DbSeverity::Notice,
        PgSeverity::Debug => DbSeverity::Debug,
        PgSeverity::Info => DbSeverity::Info,
        PgSeverity::Log => DbSeverity::Log,
    }
}

pub(crate) fn map_sqlx_error(err: sqlx::Error, server: &str) -> DbError {
    let error = match err {
        sqlx::Error::Database(db) => DbError {
            kind: DbErrorKind::Server,
            code: db.code().map(|c| c.into_owned()),
            severity: db
                .try_downcast_ref::<PgDatabaseError>()
                .map(|pg| map_severity(pg.severity())),
            message: db.message().to_string(),
            server: None,
        },
        sqlx::Error::Io(e) if e.kind() == std::io::ErrorKind::TimedOut => {
            DbError::timeout(e.to_string())
        }
        sqlx::Error::Io(e) => DbError::new(DbErrorKind::Connection, e.to_string()),
        sqlx::Error::Tls(e) => DbError::new(DbErrorKind::Connection, e.to_string()),
        sqlx::Error::PoolTimedOut => DbError::timeout("timed out acquiring a pooled connection"),
        sqlx::Error::Protocol(msg) => DbError::new(DbErrorKind::Protocol, msg),
        other => DbError::new(DbErrorKind::Other, other.to_string()),
    };
    error.with_server(server)
}

fn decode_row(row: &PgRow) -> SqlRow {
    let values = (0..row.len())
        .map(|index| {
            let is_null = row
                .try_get_raw(index)
                .map(|raw| raw.is_null())
                .unwrap_or(true);
            if is_null {
                return SqlValue::Null;
            }
            let decoded = match row.column(index).type_info().name() {
                "BOOL" => row.try_get::<bool, _>(index).map(SqlValue::Bool),
                "INT2" => row.try_get::<i16, _>(index).map(|v| SqlValue::Int(v.into())),
                "INT4" => row.try_get::<i32, _>(index).map(|v| SqlValue::Int(v.into())),
                "INT8" => row.try_get::<i64, _>(index).map(SqlValue::Int),
                "FLOAT4" => row.try_get::<f32, _>(index).map(|v| SqlValue::Float(v.into())),
                "FLOAT8" => row.try_get::<f64, _>(index).map(SqlValue::Float),
                _ => row.try_get::<String, _>(index).map(SqlValue::Text),
            };
            decoded.unwrap_or(SqlValue::Null)
        })
        .collect();
    SqlRow::new(values)
}

fn estimated_size(value: &SqlValue) -> i64 {
    match value {
        SqlValue::Null => 0,
        SqlValue::Bool(_) => 1,
        SqlValue::Int(_) | SqlValue::Float(_) => 8,
        SqlValue::Text(s) => s.len() as i64,
    }
}

fn param_size(param: &SqlParam) -> i64 {
    match param {
        SqlParam::Bool(_) => 1,
        SqlParam::Int(_) | SqlParam::Float(_) => 8,
        SqlParam::Text(s) => s.len() as i64,
    }
}

#[async_trait]
impl DatabaseClient for PgClient {
    async fn open(&mut self) -> Result<(), DbError> {
        if self.conn.is_some() {
            return Ok(());
        }
        let start = Instant::now();
        let conn = tokio::time::timeout(self.connect_timeout, PgConnection::connect_with(&self.options))
            .await
            .map_err(|_| {
                DbError::timeout(format!(
                    "connection not established within {:?}",
                    self.connect_timeout
                ))
                .with_server(&self.server)
            })?
            .map_err(|e| map_sqlx_error(e, &self.server))?;

        self.stats.connection_time_ms = Some(duration_ms(start.elapsed()));
        debug!("Opened connection to {}", self.server);
        self.conn = Some(conn);
        Ok(())
    }

    async fn close(&mut self) -> Result<(), DbError> {
        match self.conn.take() {
            Some(conn) => conn
                .close()
                .await
                .map_err(|e| map_sqlx_error(e, &self.server)),
            None => Ok(()),
        }
    }

    fn is_open(&self) -> bool {
        self.conn.is_some()
    }

    async fn execute(&mut self, sql: &str, params: &[SqlParam]) -> Result<Vec<SqlRow>, DbError> {
        let conn = self.conn.as_mut().ok_or_else(DbError::not_open)?;

        let mut query = sqlx::query(sql);
        for param in params {
            query = match param {
                SqlParam::Bool(v) => query.bind(*v),
                SqlParam::Int(v) => query.bind(*v),
                SqlParam::Float(v) => query.bind(*v),
                SqlParam::Text(v) => query.bind(v.clone()),
            };
        }

        let start = Instant::now();
        let rows = query
            .fetch_all(&mut *conn)
            .await
            .map_err(|e| map_sqlx_error(e, &self.server))?;
        let elapsed = start.elapsed();

        let rows: Vec<SqlRow> = rows.iter().map(decode_row).collect();

        if self.stats_enabled {
            self.stats.execution_time_ms += duration_ms(elapsed);
            self.stats.round_trips += 1;
            self.stats.select_count += 1;
            self.stats.rows += rows.len() as i64;
            self.stats.bytes_sent += sql.len() as i64 + params.iter().map(param_size).sum::<i64>();
            self.stats.bytes_received += rows
                .iter()
                .flat_map(|row| (0..row.len()).filter_map(move |i| row.value(i)))
                .map(estimated_size)
                .sum::<i64>();
        }

        Ok(rows)
    }

    fn set_statistics_enabled(&mut self, enabled: bool) {
        self.stats_enabled = enabled;
    }

    fn reset_statistics(&mut self) {
        let connection_time_ms = self.stats.connection_time_ms;
        self.stats = ClientStatistics {
            connection_time_ms,
            ..ClientStatistics::default()
        };
    }

    fn statistics(&self) -> BTreeMap<String, i64> {
        let mut stats = BTreeMap::new();
        if !self.stats_enabled {
            return stats;
        }
        stats.insert("BytesSent".to_string(), self.stats.bytes_sent);
        stats.insert("BytesReceived".to_string(), self.stats.bytes_received);
        stats.insert("ServerRoundtrips".to_string(), self.stats.round_trips);
        stats.insert("SelectCount".to_string(), self.stats.select_count);
        stats.insert("SelectRows".to_string(), self.stats.rows);
        stats.insert(
            "ExecutionTime".to_string(),
            self.stats.execution_time_ms.round() as i64,
        );
        if let Some(ms) = self.stats.connection_time_ms {
            stats.insert("ConnectionTime".to_string(), ms.round() as i64);
        }
        stats
    }

    fn server_name(&self) -> String {
        self.server.clone()
    }
}
