//! Quick triage stage execution and diagnosis priority

mod test_helpers;

use db_diagnostics::client::{DbSeverity, SqlValue};
use db_diagnostics::diagnostics::DiagnosticOptions;
use db_diagnostics::retry::RetryPolicy;
use db_diagnostics::triage::{DiagnosisCategory, QuickTriage, TriageResult};
use db_diagnostics::DbError;
use std::sync::Arc;
use std::time::Duration;
use test_helpers::*;
use tokio_util::sync::CancellationToken;

const BLOCKING_QUERY: &str = "COALESCE(max(";

fn server(total_sessions: i64, blocked: i64) -> ScriptedFactory {
    ScriptedFactory::new()
        .respond("pg_postmaster_start_time", vec![server_summary_row(total_sessions, 100, 0)])
        .respond(BLOCKING_QUERY, vec![vec![SqlValue::Int(blocked), SqlValue::Float(42.0)]])
        .respond("SELECT 1", vec![vec![SqlValue::Int(1)]])
}

async fn triage(factory: &ScriptedFactory, pinger: ScriptedPinger, target: &str) -> TriageResult {
    let options = DiagnosticOptions {
        ping_attempts: 3,
        ..DiagnosticOptions::default()
    };
    QuickTriage::new(Arc::new(factory.clone()), Arc::new(pinger), &options)
        .with_retry(RetryPolicy::none())
        .run(target, &CancellationToken::new())
        .await
        .unwrap()
}

#[tokio::test]
async fn test_healthy_server() {
    let result = triage(&server(10, 0), ScriptedPinger::reachable(3.0), TARGET).await;

    assert_eq!(result.diagnosis.category, DiagnosisCategory::Healthy);
    for stage in [
        &result.network,
        &result.connection,
        &result.query,
        &result.server,
        &result.blocking,
    ] {
        assert!(stage.success, "{:?} failed: {}", stage.stage, stage.details);
        assert!(stage.issues.is_empty(), "{:?}: {:?}", stage.stage, stage.issues);
    }
}

#[tokio::test]
async fn test_unreachable_network_masks_downstream_findings() {
    let factory = server(95, 3);
    let result = triage(&factory, ScriptedPinger::unreachable(), TARGET).await;

    assert!(!result.network.success);
    assert_eq!(result.diagnosis.category, DiagnosisCategory::Network);
    assert_eq!(result.diagnosis.category.to_string(), "Network");
    // Later stages still ran
    assert!(result.blocking.has_issues());
    assert!(result.server.has_issues());
}

#[tokio::test]
async fn test_connection_failure_diagnosed_after_network() {
    let factory = server(10, 0).always_fail(DbError::server(
        "28P01",
        DbSeverity::Fatal,
        "password authentication failed for user \"diag\"",
    ));
    let result = triage(&factory, ScriptedPinger::reachable(2.0), TARGET).await;

    assert!(result.network.success);
    assert!(!result.connection.success);
    assert!(result.connection.details.contains("password authentication failed"));
    assert!(!result.query.success);
    assert!(!result.server.success);
    assert!(!result.blocking.success);
    assert_eq!(result.diagnosis.category, DiagnosisCategory::Connection);
}

#[tokio::test]
async fn test_blocked_sessions_diagnosed_as_blocking() {
    let result = triage(&server(95, 3), ScriptedPinger::reachable(2.0), TARGET).await;

    assert_eq!(result.blocking.issues.len(), 1);
    assert!(result.blocking.issues[0].starts_with("3 session(s) blocked"));
    assert_eq!(result.diagnosis.category, DiagnosisCategory::Blocking);
}

#[tokio::test]
async fn test_connection_pressure_diagnosed_as_server_resource() {
    let result = triage(&server(90, 0), ScriptedPinger::reachable(2.0), TARGET).await;

    assert!(result.server.has_issues());
    assert_eq!(result.diagnosis.category, DiagnosisCategory::ServerResource);
    assert_eq!(result.diagnosis.category.to_string(), "Server Resource");
}

#[tokio::test(start_paused = true)]
async fn test_slow_probe_query_diagnosed_as_query_performance() {
    let factory = server(10, 0).query_delay(Duration::from_millis(1_500));
    let result = triage(&factory, ScriptedPinger::reachable(2.0), TARGET).await;

    assert!(result.query.has_issues());
    assert!(result.query.duration_ms >= 1_500.0);
    assert_eq!(result.diagnosis.category, DiagnosisCategory::QueryPerformance);
}

#[tokio::test]
async fn test_slow_network_is_flagged() {
    let result = triage(&server(10, 0), ScriptedPinger::reachable(250.0), TARGET).await;

    assert!(result.network.success);
    assert!(result.network.issues[0].contains("250.0ms"));
    assert_eq!(result.diagnosis.category, DiagnosisCategory::Network);
}

#[tokio::test]
async fn test_stage_error_is_contained() {
    let factory = ScriptedFactory::new()
        .respond_error(
            "pg_postmaster_start_time",
            DbError::server("42501", DbSeverity::Error, "permission denied for function"),
        )
        .respond(BLOCKING_QUERY, vec![vec![SqlValue::Int(0), SqlValue::Float(0.0)]]);
    let result = triage(&factory, ScriptedPinger::reachable(2.0), TARGET).await;

    assert!(!result.server.success);
    assert!(result.server.details.contains("permission denied"));
    assert!(result.blocking.success);
    assert_eq!(result.diagnosis.category, DiagnosisCategory::Healthy);
}

#[tokio::test]
async fn test_socket_target_skips_network_stage() {
    let pinger = ScriptedPinger::reachable(1.0);
    let result = triage(&server(10, 0), pinger, SOCKET_TARGET).await;

    assert!(result.network.success);
    assert!(result.network.details.starts_with("Skipped"));
    assert_eq!(result.diagnosis.category, DiagnosisCategory::Healthy);
}

#[tokio::test]
async fn test_cancelled_triage_returns_cancelled() {
    let factory = server(10, 0);
    let token = CancellationToken::new();
    token.cancel();

    let result = QuickTriage::new(
        Arc::new(factory),
        Arc::new(ScriptedPinger::reachable(1.0)),
        &DiagnosticOptions::default(),
    )
    .run(TARGET, &token)
    .await;

    assert!(matches!(result, Err(db_diagnostics::DiagnosticError::Cancelled)));
}
