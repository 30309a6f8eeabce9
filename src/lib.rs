pub mod application;
pub mod baseline;
pub mod client;
pub mod config;
pub mod diagnostics;
pub mod error;
pub mod monitoring;
pub mod probes;
pub mod retry;
pub mod stats;
pub mod target;
pub mod timing;
pub mod triage;

pub use config::DiagnosticsConfig;
pub use error::{DiagnosticError, Result};
pub use target::{ConnectionTarget, HostEndpoint};

// Re-export the engine entry points
pub use diagnostics::{
    DiagnosticCategories, DiagnosticOptions, DiagnosticOrchestrator, DiagnosticReport,
    Recommendation, RecommendationRule, Severity,
};
pub use triage::{Diagnosis, DiagnosisCategory, QuickTriage, TriageResult};

// Re-export baseline types
pub use baseline::{
    BaselineEngine, BaselineStore, FileBaselineStore, PerformanceBaseline, RegressionFinding,
    RegressionReport,
};

// Re-export collaborator seams
pub use client::{
    ConnectionFactory, DatabaseClient, DbError, PgConnectionFactory, Pinger, TcpPinger,
};

// Re-export monitoring types
pub use monitoring::{
    ConnectionPoolMonitor, ContinuousMonitor, DiagnosticEvent, EventSink, JsonlEventSink,
    MonitorEvent, MonitorMode, MonitorOptions,
};
