use crate::baseline::{BaselineEngine, BaselineStore, FileBaselineStore};
use crate::client::{ConnectionFactory, PgConnectionFactory, Pinger, TcpPinger};
use crate::config::DiagnosticsConfig;
use crate::diagnostics::{DiagnosticOptions, DiagnosticOrchestrator};
use crate::monitoring::{DiagnosticEvent, EventSink, JsonlEventSink};
use crate::retry::RetryPolicy;
use crate::triage::QuickTriage;
use anyhow::{Context, Result};
use std::sync::Arc;
use std::time::Duration;
use tracing::{info, warn};

/// Dependency injection container for the command line
pub struct DependencyContainer {
    pub config: DiagnosticsConfig,
    pub options: DiagnosticOptions,

    // Collaborators
    pub factory: Arc<dyn ConnectionFactory>,
    pub pinger: Arc<dyn Pinger>,

    // Engine
    pub orchestrator: Arc<DiagnosticOrchestrator>,
    pub baseline_store: Arc<dyn BaselineStore>,
    pub baseline_engine: Arc<BaselineEngine>,
    pub triage: Arc<QuickTriage>,

    // Optional structured event log
    pub event_sink: Option<Arc<dyn EventSink>>,
}

impl DependencyContainer {
    pub fn new(config: DiagnosticsConfig) -> Result<Self> {
        let factory: Arc<dyn ConnectionFactory> = Arc::new(PgConnectionFactory::new(
            Duration::from_millis(config.probes.connect_timeout_ms),
        ));
        let pinger: Arc<dyn Pinger> = Arc::new(TcpPinger::new());
        Self::with_collaborators(config, factory, pinger)
    }

    /// Build the container around caller-supplied collaborators.
    pub fn with_collaborators(
        config: DiagnosticsConfig,
        factory: Arc<dyn ConnectionFactory>,
        pinger: Arc<dyn Pinger>,
    ) -> Result<Self> {
        let retry = RetryPolicy::from_config(&config.retry).context("Invalid retry settings")?;
        let options = DiagnosticOptions::from_config(&config);

        let orchestrator = Arc::new(
            DiagnosticOrchestrator::new(factory.clone(), pinger.clone()).with_retry(retry.clone()),
        );

        let baseline_store: Arc<dyn BaselineStore> = Arc::new(FileBaselineStore::new(
            config.storage.baseline_directory.clone(),
        ));
        let baseline_engine = Arc::new(BaselineEngine::new(
            orchestrator.clone(),
            baseline_store.clone(),
            options.clone(),
        ));

        let triage = Arc::new(
            QuickTriage::new(factory.clone(), pinger.clone(), &options).with_retry(retry),
        );

        let event_sink = config.storage.event_log.as_ref().map(|path| {
            info!("Recording diagnostic events to {}", path.display());
            Arc::new(JsonlEventSink::new(path.clone())) as Arc<dyn EventSink>
        });

        Ok(Self {
            config,
            options,
            factory,
            pinger,
            orchestrator,
            baseline_store,
            baseline_engine,
            triage,
            event_sink,
        })
    }

    /// Write to the event log if one is configured. Failures are logged only.
    pub async fn record_event(&self, event: DiagnosticEvent) {
        let Some(sink) = &self.event_sink else {
            return;
        };
        if let Err(e) = sink.record(&event).await {
            warn!("Failed to record {:?} event: {}", event.event_type, e);
        }
    }
}
