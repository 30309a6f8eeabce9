use crate::diagnostics::{DiagnosticReport, Severity};
use crate::error::Result;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::path::{Path, PathBuf};
use tokio::io::AsyncWriteExt;
use tokio::sync::Mutex;
use tracing::debug;
use uuid::Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DiagnosticEventType {
    DiagnosticRun,
    MonitorSnapshot,
    MonitorFailed,
    BaselineCaptured,
    BaselineCompared,
    PoolHealth,
}

/// One line of the structured event log.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DiagnosticEvent {
    pub id: Uuid,
    pub timestamp: DateTime<Utc>,
    pub event_type: DiagnosticEventType,
    pub severity: Severity,
    pub message: String,
    pub source: String,
    pub payload: Value,
}

impl DiagnosticEvent {
    pub fn new(
        event_type: DiagnosticEventType,
        severity: Severity,
        source: impl Into<String>,
        message: impl Into<String>,
    ) -> Self {
        Self {
            id: Uuid::new_v4(),
            timestamp: Utc::now(),
            event_type,
            severity,
            message: message.into(),
            source: source.into(),
            payload: Value::Null,
        }
    }

    pub fn with_payload(mut self, payload: Value) -> Self {
        self.payload = payload;
        self
    }

    /// Summary event for a finished run; severity follows the worst recommendation.
    pub fn from_report(event_type: DiagnosticEventType, report: &DiagnosticReport) -> Self {
        let severity = report.highest_severity().unwrap_or(Severity::Info);
        let errors: Vec<String> = report
            .probe_errors()
            .into_iter()
            .map(|(probe, _)| probe.to_string())
            .collect();
        Self::new(
            event_type,
            severity,
            report.target.clone(),
            format!(
                "Diagnostics for {} completed with {} recommendation(s)",
                report.target,
                report.recommendations.len()
            ),
        )
        .with_payload(json!({
            "report_id": report.id,
            "categories": report.categories.names(),
            "duration_ms": report.duration_ms,
            "failed_probes": errors,
            "connection_average_ms": report.connection.as_ref().and_then(|c| c.average_ms),
            "connection_success_rate": report.connection.as_ref().map(|c| c.success_rate),
            "network_average_ms": report.network.as_ref().and_then(|n| n.average_ms),
        }))
    }
}

#[async_trait]
pub trait EventSink: Send + Sync {
    async fn record(&self, event: &DiagnosticEvent) -> Result<()>;
}

/// Appends one JSON object per line. Writers are serialized, and the parent
/// directory is created on first write.
#[derive(Debug)]
pub struct JsonlEventSink {
    path: PathBuf,
    writer: Mutex<()>,
}

impl JsonlEventSink {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            writer: Mutex::new(()),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

#[async_trait]
impl EventSink for JsonlEventSink {
    async fn record(&self, event: &DiagnosticEvent) -> Result<()> {
        let mut line = serde_json::to_vec(event)?;
        line.push(b'\n');

        let _guard = self.writer.lock().await;
        if let Some(parent) = self.path.parent().filter(|p| !p.as_os_str().is_empty()) {
            tokio::fs::create_dir_all(parent).await?;
        }
        let mut file = tokio::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)
            .await?;
        file.write_all(&line).await?;
        file.flush().await?;

        debug!("Recorded {:?} event {}", event.event_type, event.id);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    #[tokio::test]
    async fn test_creates_directory_and_appends_lines() {
        let dir = tempfile::tempdir().unwrap();
        let sink = JsonlEventSink::new(dir.path().join("logs").join("events.jsonl"));

        for i in 0..3 {
            let event = DiagnosticEvent::new(
                DiagnosticEventType::PoolHealth,
                Severity::Warning,
                "pool",
                format!("sample {i}"),
            )
            .with_payload(json!({ "sample": i }));
            sink.record(&event).await.unwrap();
        }

        let content = std::fs::read_to_string(sink.path()).unwrap();
        let lines: Vec<&str> = content.lines().collect();
        assert_eq!(lines.len(), 3);

        let parsed: DiagnosticEvent = serde_json::from_str(lines[2]).unwrap();
        assert_eq!(parsed.message, "sample 2");
        assert_eq!(parsed.payload["sample"], 2);
        assert_eq!(parsed.event_type, DiagnosticEventType::PoolHealth);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_concurrent_writers_never_interleave() {
        let dir = tempfile::tempdir().unwrap();
        let sink = Arc::new(JsonlEventSink::new(dir.path().join("events.jsonl")));

        let handles: Vec<_> = (0..16)
            .map(|i| {
                let sink = sink.clone();
                tokio::spawn(async move {
                    let event = DiagnosticEvent::new(
                        DiagnosticEventType::MonitorSnapshot,
                        Severity::Info,
                        "monitor",
                        "x".repeat(512 + i),
                    );
                    sink.record(&event).await.unwrap();
                })
            })
            .collect();
        for handle in handles {
            handle.await.unwrap();
        }

        let content = std::fs::read_to_string(sink.path()).unwrap();
        let events: Vec<DiagnosticEvent> = content
            .lines()
            .map(|line| serde_json::from_str(line).unwrap())
            .collect();
        assert_eq!(events.len(), 16);
    }
}
