use crate::diagnostics::{DiagnosticCategories, DiagnosticOptions, DiagnosticOrchestrator, DiagnosticReport};
use crate::error::{DiagnosticError, Result};
use crate::target::ConnectionTarget;
use crate::timing::sleep_cancellable;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{broadcast, Mutex};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info};

const EVENT_CAPACITY: usize = 64;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum MonitorMode {
    /// Every requested category on each tick
    #[default]
    #[serde(rename = "full")]
    Full,
    /// Connection and network only
    #[serde(rename = "quick")]
    QuickCheck,
}

impl FromStr for MonitorMode {
    type Err = DiagnosticError;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_lowercase().as_str() {
            "full" => Ok(MonitorMode::Full),
            "quick" | "quick-check" | "quickcheck" => Ok(MonitorMode::QuickCheck),
            other => Err(DiagnosticError::invalid_input(format!(
                "unknown monitor mode '{other}'"
            ))),
        }
    }
}

#[derive(Debug, Clone)]
pub struct MonitorOptions {
    pub target: String,
    pub categories: DiagnosticCategories,
    pub diagnostics: DiagnosticOptions,
    pub interval: Duration,
    pub mode: MonitorMode,
}

#[derive(Debug, Clone)]
pub struct MonitorSnapshot {
    pub sequence: u64,
    pub timestamp: DateTime<Utc>,
    pub report: Arc<DiagnosticReport>,
}

#[derive(Debug, Clone)]
pub enum MonitorEvent {
    Snapshot(MonitorSnapshot),
    /// A tick failed; the loop has ended.
    Failed {
        timestamp: DateTime<Utc>,
        message: String,
    },
}

struct RunningLoop {
    token: CancellationToken,
    handle: JoinHandle<()>,
}

/// Runs the orchestrator on a timer and broadcasts each report.
///
/// `stop` cancels the in-flight tick and waits for the loop to exit, so no
/// event is published once it returns.
pub struct ContinuousMonitor {
    orchestrator: Arc<DiagnosticOrchestrator>,
    events: broadcast::Sender<MonitorEvent>,
    running: Mutex<Option<RunningLoop>>,
}

impl ContinuousMonitor {
    pub fn new(orchestrator: Arc<DiagnosticOrchestrator>) -> Self {
        let (events, _) = broadcast::channel(EVENT_CAPACITY);
        Self {
            orchestrator,
            events,
            running: Mutex::new(None),
        }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<MonitorEvent> {
        self.events.subscribe()
    }

    /// True while the loop is active. A loop that ended on its own after a
    /// failure counts as stopped.
    pub async fn is_running(&self) -> bool {
        self.running
            .lock()
            .await
            .as_ref()
            .is_some_and(|running| !running.handle.is_finished())
    }

    pub async fn start(&self, options: MonitorOptions) -> Result<()> {
        if options.interval.is_zero() {
            return Err(DiagnosticError::invalid_input("monitor interval must be positive"));
        }
        ConnectionTarget::parse(&options.target)?;
        options.diagnostics.validate(options.categories)?;

        let mut running = self.running.lock().await;
        if running.as_ref().is_some_and(|r| !r.handle.is_finished()) {
            return Err(DiagnosticError::AlreadyRunning);
        }

        info!(
            "Starting monitor for {} every {:?} ({:?})",
            options.target, options.interval, options.mode
        );

        let token = CancellationToken::new();
        let handle = tokio::spawn(run_loop(
            self.orchestrator.clone(),
            options,
            self.events.clone(),
            token.clone(),
        ));
        *running = Some(RunningLoop { token, handle });
        Ok(())
    }

    /// Idempotent. Returns once the loop has fully exited.
    pub async fn stop(&self) {
        let mut running = self.running.lock().await;
        let Some(active) = running.take() else {
            return;
        };

        active.token.cancel();
        if let Err(e) = active.handle.await {
            error!("Monitor loop ended abnormally: {}", e);
        }
        info!("Monitor stopped");
    }
}

/// Dropping cancels a running loop without waiting for it. The loop checks
/// the token before every publish, so nothing is broadcast once the
/// cancellation is seen. Call [`ContinuousMonitor::stop`] to wait for the exit.
impl Drop for ContinuousMonitor {
    fn drop(&mut self) {
        if let Some(active) = self.running.get_mut().take() {
            active.token.cancel();
        }
    }
}

async fn run_loop(
    orchestrator: Arc<DiagnosticOrchestrator>,
    options: MonitorOptions,
    events: broadcast::Sender<MonitorEvent>,
    token: CancellationToken,
) {
    let mut sequence = 0u64;

    loop {
        let result = match options.mode {
            MonitorMode::Full => {
                orchestrator
                    .run(&options.target, options.categories, &options.diagnostics, &token)
                    .await
            }
            MonitorMode::QuickCheck => {
                orchestrator
                    .quick_check(&options.target, &options.diagnostics, &token)
                    .await
            }
        };

        match result {
            Ok(report) => {
                if token.is_cancelled() {
                    break;
                }
                sequence += 1;
                debug!("Publishing monitor snapshot {}", sequence);
                // Nobody listening is fine.
                let _ = events.send(MonitorEvent::Snapshot(MonitorSnapshot {
                    sequence,
                    timestamp: Utc::now(),
                    report: Arc::new(report),
                }));
            }
            Err(e) if e.is_cancelled() || token.is_cancelled() => break,
            Err(e) => {
                error!("Monitor tick failed, stopping: {}", e);
                let _ = events.send(MonitorEvent::Failed {
                    timestamp: Utc::now(),
                    message: e.to_string(),
                });
                break;
            }
        }

        if sleep_cancellable(&token, options.interval).await.is_err() {
            break;
        }
    }

    debug!("Monitor loop exited after {} snapshots", sequence);
}
