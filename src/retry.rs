use crate::client::DbError;
use crate::error::{DiagnosticError, Result};
use crate::timing::{cancellable, sleep_cancellable};
use serde::{Deserialize, Serialize};
use std::future::Future;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

/// SQLSTATEs that are expected to clear up on their own: connection limits,
/// server restarts/failover, connection exceptions and concurrency aborts.
pub const TRANSIENT_SQLSTATES: &[&str] = &[
    "53300", // too_many_connections
    "53400", // configuration_limit_exceeded
    "57P01", // admin_shutdown
    "57P02", // crash_shutdown
    "57P03", // cannot_connect_now
    "08000", // connection_exception
    "08001", // sqlclient_unable_to_establish_sqlconnection
    "08003", // connection_does_not_exist
    "08004", // sqlserver_rejected_establishment_of_sqlconnection
    "08006", // connection_failure
    "40001", // serialization_failure
    "40P01", // deadlock_detected
    "55P03", // lock_not_available
];

pub const DEFAULT_RETRY_DELAY: Duration = Duration::from_millis(150);

/// Classifies failures that are worth another attempt.
pub trait Transient {
    fn is_transient(&self) -> bool;
}

impl Transient for DbError {
    fn is_transient(&self) -> bool {
        if self.kind == crate::client::DbErrorKind::Timeout {
            return true;
        }
        if self
            .code
            .as_deref()
            .is_some_and(|code| TRANSIENT_SQLSTATES.contains(&code))
        {
            return true;
        }
        self.severity.is_some_and(|s| s.closes_connection())
    }
}

impl Transient for DiagnosticError {
    fn is_transient(&self) -> bool {
        match self {
            DiagnosticError::Database(e) => e.is_transient(),
            DiagnosticError::Timeout { .. } => true,
            _ => false,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryConfig {
    pub max_attempts: u32,
    pub delay_ms: u64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            delay_ms: DEFAULT_RETRY_DELAY.as_millis() as u64,
        }
    }
}

/// Fixed-delay retry for transient failures. No backoff growth: probes are
/// cheap and run often.
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    max_attempts: u32,
    delay: Duration,
}

impl RetryPolicy {
    pub fn new(max_attempts: u32, delay: Duration) -> Result<Self> {
        if max_attempts == 0 {
            return Err(DiagnosticError::invalid_input(
                "max_attempts must be at least 1",
            ));
        }
        Ok(Self {
            max_attempts,
            delay,
        })
    }

    pub fn from_config(config: &RetryConfig) -> Result<Self> {
        Self::new(config.max_attempts, Duration::from_millis(config.delay_ms))
    }

    /// Single attempt, no retry.
    pub fn none() -> Self {
        Self {
            max_attempts: 1,
            delay: Duration::ZERO,
        }
    }

    pub fn max_attempts(&self) -> u32 {
        self.max_attempts
    }

    pub fn delay(&self) -> Duration {
        self.delay
    }

    pub async fn execute<F, Fut, T>(&self, token: &CancellationToken, mut f: F) -> Result<T>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        let mut attempt = 0;

        loop {
            attempt += 1;

            match cancellable(token, f()).await.and_then(|r| r) {
                Ok(value) => {
                    if attempt > 1 {
                        debug!("Retry succeeded on attempt {}", attempt);
                    }
                    return Ok(value);
                }
                Err(error) if !error.is_transient() => return Err(error),
                Err(error) if attempt >= self.max_attempts => {
                    warn!(
                        "All {} attempts exhausted, last error: {}",
                        self.max_attempts, error
                    );
                    return Err(error);
                }
                Err(error) => {
                    warn!(
                        "Attempt {}/{} failed with transient error: {}. Retrying in {:?}",
                        attempt, self.max_attempts, error, self.delay
                    );
                    sleep_cancellable(token, self.delay).await?;
                }
            }
        }
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: RetryConfig::default().max_attempts,
            delay: DEFAULT_RETRY_DELAY,
        }
    }
}

/// Run `operation` up to `max_attempts` times, retrying transient failures
/// after `delay`. Fails with the last error once attempts are exhausted.
pub async fn execute_with_retry<F, Fut, T>(
    operation: F,
    max_attempts: u32,
    delay: Duration,
    token: &CancellationToken,
) -> Result<T>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T>>,
{
    RetryPolicy::new(max_attempts, delay)?
        .execute(token, operation)
        .await
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::client::DbSeverity;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::sync::Arc;
    use tracing_test::traced_test;

    fn throttled(n: u32) -> DiagnosticError {
        DiagnosticError::Database(DbError::server(
            "53300",
            DbSeverity::Fatal,
            format!("too many connections ({n})"),
        ))
    }

    #[tokio::test(start_paused = true)]
    #[traced_test]
    async fn test_transient_twice_then_success() {
        let counter = Arc::new(AtomicU32::new(0));
        let token = CancellationToken::new();

        let result = execute_with_retry(
            || {
                let counter = counter.clone();
                async move {
                    let n = counter.fetch_add(1, Ordering::SeqCst) + 1;
                    if n <= 2 {
                        Err(throttled(n))
                    } else {
                        Ok("connected")
                    }
                }
            },
            3,
            Duration::from_millis(150),
            &token,
        )
        .await;

        assert_eq!(result.unwrap(), "connected");
        // Three invocations means exactly two retries.
        assert_eq!(counter.load(Ordering::SeqCst), 3);
        assert!(logs_contain("Retrying in"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_exhausted_attempts_return_last_error() {
        let counter = Arc::new(AtomicU32::new(0));
        let token = CancellationToken::new();

        let result: Result<()> = execute_with_retry(
            || {
                let counter = counter.clone();
                async move {
                    let n = counter.fetch_add(1, Ordering::SeqCst) + 1;
                    Err(throttled(n))
                }
            },
            2,
            Duration::from_millis(150),
            &token,
        )
        .await;

        let err = result.unwrap_err();
        assert!(err.to_string().contains("(2)"));
        assert_eq!(counter.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_fatal_errors_are_not_retried() {
        let counter = Arc::new(AtomicU32::new(0));
        let token = CancellationToken::new();

        let result: Result<()> = execute_with_retry(
            || {
                let counter = counter.clone();
                async move {
                    counter.fetch_add(1, Ordering::SeqCst);
                    Err(DiagnosticError::Database(DbError::server(
                        "42601",
                        DbSeverity::Error,
                        "syntax error",
                    )))
                }
            },
            5,
            Duration::ZERO,
            &token,
        )
        .await;

        assert!(result.is_err());
        assert_eq!(counter.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_zero_attempts_is_invalid() {
        let token = CancellationToken::new();
        let result: Result<()> =
            execute_with_retry(|| async { Ok(()) }, 0, Duration::ZERO, &token).await;
        assert!(matches!(result, Err(DiagnosticError::InvalidInput { .. })));
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancellation_during_delay() {
        let token = CancellationToken::new();
        let cancel = token.clone();

        let result: Result<()> = execute_with_retry(
            move || {
                cancel.cancel();
                async { Err(throttled(1)) }
            },
            3,
            Duration::from_secs(30),
            &token,
        )
        .await;

        assert!(matches!(result, Err(DiagnosticError::Cancelled)));
    }

    #[test]
    fn test_transient_classification() {
        assert!(DbError::server("40001", DbSeverity::Error, "serialization").is_transient());
        assert!(DbError::server("XX000", DbSeverity::Fatal, "terminating").is_transient());
        assert!(DbError::timeout("connect timed out").is_transient());
        assert!(!DbError::server("23505", DbSeverity::Error, "duplicate key").is_transient());
        assert!(DiagnosticError::Timeout {
            message: "slow".into()
        }
        .is_transient());
        assert!(!DiagnosticError::Cancelled.is_transient());
    }
}
