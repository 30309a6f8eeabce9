use crate::monitoring::continuous::MonitorMode;
use crate::monitoring::pool::PoolThresholds;
use crate::retry::RetryConfig;
use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::env;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use tracing::info;

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct DiagnosticsConfig {
    /// Probe attempt counts, timeouts and windows
    pub probes: ProbeConfig,

    /// Retry policy for transient failures
    pub retry: RetryConfig,

    /// Recommendation, triage and regression thresholds
    pub thresholds: ThresholdConfig,

    /// Connection pool monitor cutoffs
    pub pool: PoolThresholds,

    /// Continuous monitoring
    pub monitor: MonitorSettings,

    /// Baseline and event log locations
    pub storage: StorageConfig,

    pub logging: LoggingConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ProbeConfig {
    /// Connection open/close cycles per connection probe
    pub connection_attempts: u32,

    /// Pause between connection attempts
    pub connection_delay_ms: u64,

    /// Echo requests per network probe
    pub ping_attempts: u32,

    pub ping_timeout_ms: u64,

    /// Upper bound for establishing any single connection
    pub connect_timeout_ms: u64,

    /// Statement timed by the query probe
    pub probe_query: String,

    pub stability_duration_ms: u64,

    pub stability_interval_ms: u64,

    /// Connection attempts per quick check (baselines, monitor quick mode)
    pub quick_check_attempts: u32,

    /// Number of wait events reported by the server probe
    pub top_wait_events: u32,

    /// Transactions open longer than this are reported by the database probe
    pub long_transaction_seconds: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ThresholdConfig {
    pub slow_connection_ms: f64,
    pub min_success_rate: f64,
    pub high_jitter_ms: f64,
    pub slow_network_ms: f64,
    pub slow_query_ms: f64,
    /// Fraction of `max_connections` in use that counts as resource pressure
    pub connection_utilization: f64,
    pub min_cache_hit_ratio: f64,
    /// Allowed drift above a baseline before a regression is reported
    pub baseline_tolerance: f64,
    /// Excess over the regression threshold that escalates to critical
    pub critical_excess: f64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct MonitorSettings {
    pub interval_ms: u64,
    pub mode: MonitorMode,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct StorageConfig {
    /// Directory holding `{name}-{timestamp}.json` baseline snapshots
    pub baseline_directory: PathBuf,

    /// Newline-delimited JSON event log, disabled when unset
    pub event_log: Option<PathBuf>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    Text,
    Json,
}

impl FromStr for LogFormat {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_lowercase().as_str() {
            "text" | "pretty" => Ok(LogFormat::Text),
            "json" => Ok(LogFormat::Json),
            other => Err(anyhow::anyhow!("Unknown log format '{other}'")),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    /// Log level (error, warn, info, debug, trace)
    pub level: String,
    pub format: LogFormat,
}

impl Default for ProbeConfig {
    fn default() -> Self {
        Self {
            connection_attempts: 5,
            connection_delay_ms: 0,
            ping_attempts: 5,
            ping_timeout_ms: 5000,
            connect_timeout_ms: 15_000,
            probe_query: "SELECT 1".to_string(),
            stability_duration_ms: 5000,
            stability_interval_ms: 1000,
            quick_check_attempts: 3,
            top_wait_events: 5,
            long_transaction_seconds: 300,
        }
    }
}

impl Default for ThresholdConfig {
    fn default() -> Self {
        Self {
            slow_connection_ms: 500.0,
            min_success_rate: 0.8,
            high_jitter_ms: 50.0,
            slow_network_ms: 100.0,
            slow_query_ms: 1000.0,
            connection_utilization: 0.8,
            min_cache_hit_ratio: 0.9,
            baseline_tolerance: 0.2,
            critical_excess: 0.5,
        }
    }
}

impl Default for MonitorSettings {
    fn default() -> Self {
        Self {
            interval_ms: 60_000,
            mode: MonitorMode::Full,
        }
    }
}

impl Default for StorageConfig {
    fn default() -> Self {
        let base = dirs::data_local_dir().unwrap_or_else(|| PathBuf::from("."));
        Self {
            baseline_directory: base.join("db-diagnostics").join("baselines"),
            event_log: None,
        }
    }
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            format: LogFormat::Text,
        }
    }
}

fn env_parse<T>(name: &str) -> Result<Option<T>>
where
    T: FromStr,
    T::Err: std::fmt::Display,
{
    match env::var(name) {
        Ok(value) => value
            .parse()
            .map(Some)
            .map_err(|e| anyhow::anyhow!("Invalid {name}: {e}")),
        Err(_) => Ok(None),
    }
}

impl DiagnosticsConfig {
    /// Load configuration from `DBDIAG_*` environment variables (and `.env`)
    pub fn from_env() -> Result<Self> {
        dotenv::dotenv().ok();

        let mut config = Self::default();
        config.apply_env()?;
        config.validate()?;
        Ok(config)
    }

    /// Load configuration from a TOML file, then apply environment overrides
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        dotenv::dotenv().ok();

        let content = std::fs::read_to_string(&path)
            .with_context(|| format!("Failed to read config file: {}", path.as_ref().display()))?;
        let mut config: DiagnosticsConfig = toml::from_str(&content)
            .with_context(|| format!("Failed to parse config file: {}", path.as_ref().display()))?;

        info!("Loaded diagnostics config from: {}", path.as_ref().display());
        config.apply_env()?;
        config.validate()?;
        Ok(config)
    }

    fn apply_env(&mut self) -> Result<()> {
        if let Some(v) = env_parse("DBDIAG_CONNECTION_ATTEMPTS")? {
            self.probes.connection_attempts = v;
        }
        if let Some(v) = env_parse("DBDIAG_PING_ATTEMPTS")? {
            self.probes.ping_attempts = v;
        }
        if let Some(v) = env_parse("DBDIAG_PING_TIMEOUT_MS")? {
            self.probes.ping_timeout_ms = v;
        }
        if let Some(v) = env_parse("DBDIAG_CONNECT_TIMEOUT_MS")? {
            self.probes.connect_timeout_ms = v;
        }
        if let Ok(query) = env::var("DBDIAG_PROBE_QUERY") {
            self.probes.probe_query = query;
        }
        if let Some(v) = env_parse("DBDIAG_QUICK_CHECK_ATTEMPTS")? {
            self.probes.quick_check_attempts = v;
        }
        if let Some(v) = env_parse("DBDIAG_RETRY_MAX_ATTEMPTS")? {
            self.retry.max_attempts = v;
        }
        if let Some(v) = env_parse("DBDIAG_RETRY_DELAY_MS")? {
            self.retry.delay_ms = v;
        }
        if let Some(v) = env_parse("DBDIAG_BASELINE_TOLERANCE")? {
            self.thresholds.baseline_tolerance = v;
        }
        if let Some(v) = env_parse("DBDIAG_CRITICAL_EXCESS")? {
            self.thresholds.critical_excess = v;
        }
        if let Some(v) = env_parse("DBDIAG_MONITOR_INTERVAL_MS")? {
            self.monitor.interval_ms = v;
        }
        if let Some(v) = env_parse("DBDIAG_MONITOR_MODE")? {
            self.monitor.mode = v;
        }
        if let Ok(dir) = env::var("DBDIAG_BASELINE_DIR") {
            self.storage.baseline_directory = PathBuf::from(dir);
        }
        if let Ok(path) = env::var("DBDIAG_EVENT_LOG") {
            self.storage.event_log = Some(PathBuf::from(path));
        }
        if let Ok(level) = env::var("DBDIAG_LOG_LEVEL") {
            self.logging.level = level;
        }
        if let Some(v) = env_parse("DBDIAG_LOG_FORMAT")? {
            self.logging.format = v;
        }
        Ok(())
    }

    pub fn validate(&self) -> Result<()> {
        let probes = &self.probes;
        if probes.connection_attempts == 0 {
            return Err(anyhow::anyhow!("connection_attempts must be at least 1"));
        }
        if probes.ping_attempts == 0 {
            return Err(anyhow::anyhow!("ping_attempts must be at least 1"));
        }
        if probes.quick_check_attempts == 0 {
            return Err(anyhow::anyhow!("quick_check_attempts must be at least 1"));
        }
        if probes.ping_timeout_ms == 0 || probes.connect_timeout_ms == 0 {
            return Err(anyhow::anyhow!("timeouts must be positive"));
        }
        if probes.stability_duration_ms == 0 || probes.stability_interval_ms == 0 {
            return Err(anyhow::anyhow!(
                "stability_duration_ms and stability_interval_ms must be positive"
            ));
        }
        if probes.probe_query.trim().is_empty() {
            return Err(anyhow::anyhow!("probe_query cannot be empty"));
        }
        if self.retry.max_attempts == 0 {
            return Err(anyhow::anyhow!("retry.max_attempts must be at least 1"));
        }
        if self.monitor.interval_ms == 0 {
            return Err(anyhow::anyhow!("monitor.interval_ms must be positive"));
        }

        let t = &self.thresholds;
        for (name, ratio) in [
            ("min_success_rate", t.min_success_rate),
            ("connection_utilization", t.connection_utilization),
            ("min_cache_hit_ratio", t.min_cache_hit_ratio),
        ] {
            if !(0.0..=1.0).contains(&ratio) {
                return Err(anyhow::anyhow!("{name} must be between 0 and 1"));
            }
        }
        if t.baseline_tolerance < 0.0 || t.critical_excess < 0.0 {
            return Err(anyhow::anyhow!("tolerances cannot be negative"));
        }

        self.pool.validate()?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serial_test::serial;

    #[test]
    fn test_defaults_are_valid() {
        let config = DiagnosticsConfig::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.probes.connection_attempts, 5);
        assert_eq!(config.probes.ping_timeout_ms, 5000);
        assert_eq!(config.retry.delay_ms, 150);
        assert_eq!(config.thresholds.critical_excess, 0.5);
    }

    #[test]
    fn test_validate_rejects_bad_values() {
        let mut config = DiagnosticsConfig::default();
        config.probes.connection_attempts = 0;
        assert!(config.validate().is_err());

        let mut config = DiagnosticsConfig::default();
        config.thresholds.min_success_rate = 1.5;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_validate_rejects_zero_stability_duration() {
        let mut config = DiagnosticsConfig::default();
        config.probes.stability_duration_ms = 0;

        let err = config.validate().unwrap_err();
        assert!(err.to_string().contains("stability_duration_ms"));
    }

    #[test]
    fn test_from_file_with_partial_toml() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("diag.toml");
        std::fs::write(
            &path,
            r#"
[probes]
connection_attempts = 9

[thresholds]
baseline_tolerance = 0.3

[monitor]
mode = "quick"
"#,
        )
        .unwrap();

        let config = DiagnosticsConfig::from_file(&path).unwrap();
        assert_eq!(config.probes.connection_attempts, 9);
        assert_eq!(config.probes.ping_attempts, 5);
        assert_eq!(config.thresholds.baseline_tolerance, 0.3);
        assert_eq!(config.monitor.mode, MonitorMode::QuickCheck);
    }

    #[test]
    #[serial]
    fn test_env_overrides() {
        env::set_var("DBDIAG_PING_ATTEMPTS", "11");
        env::set_var("DBDIAG_LOG_FORMAT", "json");
        let config = DiagnosticsConfig::from_env();
        env::remove_var("DBDIAG_PING_ATTEMPTS");
        env::remove_var("DBDIAG_LOG_FORMAT");

        let config = config.unwrap();
        assert_eq!(config.probes.ping_attempts, 11);
        assert_eq!(config.logging.format, LogFormat::Json);
    }

    #[test]
    #[serial]
    fn test_env_rejects_garbage() {
        env::set_var("DBDIAG_RETRY_DELAY_MS", "soon");
        let result = DiagnosticsConfig::from_env();
        env::remove_var("DBDIAG_RETRY_DELAY_MS");
        assert!(result.is_err());
    }
}
