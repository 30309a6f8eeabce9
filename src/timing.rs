//! Stopwatch and cancellation helpers shared by the probes.

use crate::error::{DiagnosticError, Result};
use std::future::Future;
use std::time::Duration;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

pub fn duration_ms(duration: Duration) -> f64 {
    duration.as_secs_f64() * 1000.0
}

pub fn elapsed_ms(start: Instant) -> f64 {
    duration_ms(start.elapsed())
}

/// Run `future`, unwinding with `Cancelled` as soon as `token` fires.
pub async fn cancellable<F, T>(token: &CancellationToken, future: F) -> Result<T>
where
    F: Future<Output = T>,
{
    tokio::select! {
        biased;
        _ = token.cancelled() => Err(DiagnosticError::Cancelled),
        value = future => Ok(value),
    }
}

/// Sleep for `duration` unless cancelled first. Zero durations return at once.
pub async fn sleep_cancellable(token: &CancellationToken, duration: Duration) -> Result<()> {
    if token.is_cancelled() {
        return Err(DiagnosticError::Cancelled);
    }
    if duration.is_zero() {
        return Ok(());
    }
    cancellable(token, tokio::time::sleep(duration)).await
}

/// Time an async operation with the tokio clock, so paused-time tests are exact.
pub async fn timed<F, T>(future: F) -> (T, Duration)
where
    F: Future<Output = T>,
{
    let start = Instant::now();
    let value = future.await;
    (value, start.elapsed())
}
