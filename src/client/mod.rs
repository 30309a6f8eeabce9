//! Collaborator interfaces for the database client and the network pinger.
//!
//! The diagnostic engine only ever talks to these traits. The shipped
//! implementations are [`postgres::PgConnectionFactory`] (sqlx) and
//! [`ping::TcpPinger`] (TCP connect round-trip).

pub mod ping;
pub mod postgres;

use crate::target::{ConnectionTarget, HostEndpoint};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::time::Duration;
use thiserror::Error;

pub use ping::TcpPinger;
pub use postgres::{PgClient, PgConnectionFactory};

/// SQLSTATE codes meaning the referenced relation, column or function does not exist.
pub const UNDEFINED_OBJECT_CODES: &[&str] = &["42P01", "42703", "42883"];

/// SQLSTATE for `insufficient_privilege`.
pub const INSUFFICIENT_PRIVILEGE: &str = "42501";

/// Server-reported message severity, ordered from least to most severe.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum DbSeverity {
    Debug,
    Log,
    Info,
    Notice,
    Warning,
    Error,
    /// The server terminates the session after reporting the error.
    Fatal,
    Panic,
}

impl DbSeverity {
    pub fn closes_connection(self) -> bool {
        self >= DbSeverity::Fatal
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum DbErrorKind {
    /// Error reported by the server, normally with a SQLSTATE.
    Server,
    /// Transport level failure (refused, reset, TLS).
    Connection,
    Timeout,
    /// Operation attempted on a client that is not open.
    NotOpen,
    Protocol,
    Other,
}

#[derive(Error, Debug, Clone, PartialEq)]
#[error("{message}")]
pub struct DbError {
    pub kind: DbErrorKind,
    pub code: Option<String>,
    pub severity: Option<DbSeverity>,
    pub message: String,
    pub server: Option<String>,
}

impl DbError {
    pub fn new(kind: DbErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            code: None,
            severity: None,
            message: message.into(),
            server: None,
        }
    }

    pub fn server(code: impl Into<String>, severity: DbSeverity, message: impl Into<String>) -> Self {
        Self {
            kind: DbErrorKind::Server,
            code: Some(code.into()),
            severity: Some(severity),
            message: message.into(),
            server: None,
        }
    }

    pub fn timeout(message: impl Into<String>) -> Self {
        Self::new(DbErrorKind::Timeout, message)
    }

    pub fn not_open() -> Self {
        Self::new(DbErrorKind::NotOpen, "connection is not open")
    }

    pub fn with_server(mut self, server: impl Into<String>) -> Self {
        self.server = Some(server.into());
        self
    }

    /// True when the error came from the driver/server rather than a generic failure.
    pub fn is_driver_error(&self) -> bool {
        self.kind == DbErrorKind::Server || self.code.is_some() || self.severity.is_some()
    }

    pub fn is_undefined_object(&self) -> bool {
        self.code
            .as_deref()
            .is_some_and(|code| UNDEFINED_OBJECT_CODES.contains(&code))
    }

    pub fn is_permission_denied(&self) -> bool {
        self.code.as_deref() == Some(INSUFFICIENT_PRIVILEGE)
    }
}

/// A single column value read back from the server.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum SqlValue {
    Null,
    Bool(bool),
    Int(i64),
    Float(f64),
    Text(String),
}

/// Typed parameter bound to a query placeholder.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum SqlParam {
    Bool(bool),
    Int(i64),
    Float(f64),
    Text(String),
}

/// One result row. Every accessor is bounds-checked and null-aware, so a short
/// or reordered result set degrades to `None` instead of failing.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SqlRow {
    values: Vec<SqlValue>,
}

impl SqlRow {
    pub fn new(values: Vec<SqlValue>) -> Self {
        Self { values }
    }

    pub fn len(&self) -> usize {
        self.values.len()
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }

    pub fn value(&self, index: usize) -> Option<&SqlValue> {
        match self.values.get(index) {
            Some(SqlValue::Null) | None => None,
            Some(value) => Some(value),
        }
    }

    pub fn is_null(&self, index: usize) -> bool {
        self.value(index).is_none()
    }

    pub fn get_i64(&self, index: usize) -> Option<i64> {
        match self.value(index)? {
            SqlValue::Int(v) => Some(*v),
            SqlValue::Float(v) if v.is_finite() => Some(*v as i64),
            SqlValue::Bool(v) => Some(i64::from(*v)),
            SqlValue::Text(s) => s.trim().parse().ok(),
            _ => None,
        }
    }

    pub fn get_f64(&self, index: usize) -> Option<f64> {
        match self.value(index)? {
            SqlValue::Int(v) => Some(*v as f64),
            SqlValue::Float(v) => Some(*v),
            SqlValue::Text(s) => s.trim().parse().ok(),
            _ => None,
        }
    }

    pub fn get_str(&self, index: usize) -> Option<&str> {
        match self.value(index)? {
            SqlValue::Text(s) => Some(s.as_str()),
            _ => None,
        }
    }

    pub fn get_string(&self, index: usize) -> Option<String> {
        match self.value(index)? {
            SqlValue::Text(s) => Some(s.clone()),
            SqlValue::Int(v) => Some(v.to_string()),
            SqlValue::Float(v) => Some(v.to_string()),
            SqlValue::Bool(v) => Some(v.to_string()),
            SqlValue::Null => None,
        }
    }

    pub fn get_bool(&self, index: usize) -> Option<bool> {
        match self.value(index)? {
            SqlValue::Bool(v) => Some(*v),
            SqlValue::Int(v) => Some(*v != 0),
            SqlValue::Text(s) => match s.trim() {
                "t" | "true" | "1" => Some(true),
                "f" | "false" | "0" => Some(false),
                _ => None,
            },
            _ => None,
        }
    }
}

impl From<Vec<SqlValue>> for SqlRow {
    fn from(values: Vec<SqlValue>) -> Self {
        Self::new(values)
    }
}

/// A database session. Probes use one client at a time; it is never shared
/// between concurrently running tasks.
#[async_trait]
pub trait DatabaseClient: Send {
    async fn open(&mut self) -> Result<(), DbError>;

    async fn close(&mut self) -> Result<(), DbError>;

    fn is_open(&self) -> bool;

    async fn execute(&mut self, sql: &str, params: &[SqlParam]) -> Result<Vec<SqlRow>, DbError>;

    fn set_statistics_enabled(&mut self, enabled: bool);

    fn reset_statistics(&mut self);

    /// Post-execution statistics keyed by name (byte counts, round-trips, timings).
    fn statistics(&self) -> BTreeMap<String, i64>;

    fn server_name(&self) -> String;
}

/// Creates unopened clients for a target. Creation performs no I/O.
pub trait ConnectionFactory: Send + Sync + fmt::Debug {
    fn create(&self, target: &ConnectionTarget) -> Box<dyn DatabaseClient>;
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum PingStatus {
    Success,
    TimedOut,
    Unreachable,
    Error(String),
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PingReply {
    pub success: bool,
    pub round_trip_ms: Option<f64>,
    pub status: PingStatus,
}

impl PingReply {
    pub fn success(round_trip_ms: f64) -> Self {
        Self {
            success: true,
            round_trip_ms: Some(round_trip_ms),
            status: PingStatus::Success,
        }
    }

    pub fn failure(status: PingStatus) -> Self {
        Self {
            success: false,
            round_trip_ms: None,
            status,
        }
    }
}

/// Sends one echo and reports the round-trip time or the failure.
#[async_trait]
pub trait Pinger: Send + Sync + fmt::Debug {
    async fn ping(&self, endpoint: &HostEndpoint, timeout: Duration) -> PingReply;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_row_access_is_bounds_checked() {
        let row = SqlRow::new(vec![SqlValue::Int(42), SqlValue::Null]);

        assert_eq!(row.get_i64(0), Some(42));
        assert_eq!(row.get_i64(1), None);
        assert_eq!(row.get_i64(7), None);
        assert_eq!(row.get_str(0), None);
        assert!(row.is_null(1));
    }

    #[test]
    fn test_row_numeric_coercion() {
        let row = SqlRow::new(vec![
            SqlValue::Text("17".to_string()),
            SqlValue::Float(0.25),
            SqlValue::Text("t".to_string()),
        ]);

        assert_eq!(row.get_i64(0), Some(17));
        assert_eq!(row.get_f64(1), Some(0.25));
        assert_eq!(row.get_bool(2), Some(true));
        assert_eq!(row.get_string(1).as_deref(), Some("0.25"));
    }

    #[test]
    fn test_severity_ordering() {
        assert!(DbSeverity::Fatal.closes_connection());
        assert!(DbSeverity::Panic.closes_connection());
        assert!(!DbSeverity::Error.closes_connection());
    }

    #[test]
    fn test_error_classification_helpers() {
        let missing = DbError::server("42P01", DbSeverity::Error, "relation does not exist");
        assert!(missing.is_undefined_object());
        assert!(missing.is_driver_error());

        let denied = DbError::server("42501", DbSeverity::Error, "permission denied");
        assert!(denied.is_permission_denied());

        let refused = DbError::new(DbErrorKind::Connection, "connection refused");
        assert!(!refused.is_driver_error());
    }
}
