pub mod continuous;
pub mod events;
pub mod pool;

pub use continuous::{ContinuousMonitor, MonitorEvent, MonitorMode, MonitorOptions, MonitorSnapshot};
pub use events::{DiagnosticEvent, DiagnosticEventType, EventSink, JsonlEventSink};
pub use pool::{
    summarize_pool_health, ConnectionPoolHealthReport, ConnectionPoolMonitor,
    ConnectionPoolSnapshot, PgPoolSource, PoolCounters, PoolHealthSeverity, PoolStatsSource,
    PoolThresholds,
};
