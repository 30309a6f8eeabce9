//! Baseline capture, persistence and regression comparison

mod test_helpers;

use approx::assert_relative_eq;
use db_diagnostics::baseline::{BaselineEngine, BaselineStore, FileBaselineStore, RegressionCategory};
use db_diagnostics::diagnostics::{DiagnosticOptions, DiagnosticOrchestrator, Severity};
use db_diagnostics::retry::RetryPolicy;
use db_diagnostics::target::hash_target;
use db_diagnostics::DiagnosticError;
use std::sync::Arc;
use std::time::Duration;
use test_helpers::*;
use tokio_util::sync::CancellationToken;

fn engine(
    factory: &ScriptedFactory,
    pinger: ScriptedPinger,
    store: Arc<dyn BaselineStore>,
) -> BaselineEngine {
    let orchestrator = Arc::new(
        DiagnosticOrchestrator::new(Arc::new(factory.clone()), Arc::new(pinger))
            .with_retry(RetryPolicy::none()),
    );
    let options = DiagnosticOptions {
        quick_check_attempts: 1,
        ping_attempts: 1,
        ..DiagnosticOptions::default()
    };
    BaselineEngine::new(orchestrator, store, options)
}

#[tokio::test(start_paused = true)]
async fn test_capture_summarizes_samples_into_percentiles() {
    let factory = ScriptedFactory::new().open_delays(&[10, 20, 30]);
    let store = Arc::new(MemoryBaselineStore::new());
    let engine = engine(&factory, ScriptedPinger::reachable(5.0), store.clone());

    let baseline = engine
        .capture_baseline(TARGET, "nightly", 3, Duration::from_secs(1), &CancellationToken::new())
        .await
        .unwrap();

    assert_eq!(baseline.name, "nightly");
    assert_eq!(baseline.sample_count, 3);
    assert_eq!(baseline.target_hash, hash_target(TARGET));

    let connection = baseline.connection_time_ms.unwrap();
    assert_relative_eq!(connection.median, 20.0, epsilon = 1e-6);
    assert_relative_eq!(connection.p95, 30.0, epsilon = 1e-6);
    assert_relative_eq!(connection.p99, 30.0, epsilon = 1e-6);

    assert_eq!(baseline.success_rate.unwrap().median, 1.0);
    assert_relative_eq!(baseline.network_latency_ms.unwrap().median, 5.0);
    assert_eq!(store.len(), 1);
    assert_eq!(factory.open_count(), 3);
}

#[tokio::test]
async fn test_capture_rejects_zero_samples_and_blank_names() {
    let factory = ScriptedFactory::new();
    let engine = engine(
        &factory,
        ScriptedPinger::reachable(1.0),
        Arc::new(MemoryBaselineStore::new()),
    );
    let token = CancellationToken::new();

    let zero = engine
        .capture_baseline(TARGET, "nightly", 0, Duration::ZERO, &token)
        .await;
    assert!(matches!(zero, Err(DiagnosticError::InvalidInput { .. })));

    let blank = engine.capture_baseline(TARGET, "  ", 3, Duration::ZERO, &token).await;
    assert!(matches!(blank, Err(DiagnosticError::InvalidInput { .. })));
    assert_eq!(factory.open_count(), 0);
}

#[tokio::test]
async fn test_compare_without_baseline_reports_not_found() {
    let factory = ScriptedFactory::new();
    let engine = engine(
        &factory,
        ScriptedPinger::reachable(1.0),
        Arc::new(MemoryBaselineStore::new()),
    );
    let token = CancellationToken::new();

    let by_target = engine.compare_to_baseline(TARGET, None, &token).await;
    assert!(matches!(by_target, Err(DiagnosticError::BaselineNotFound { .. })));

    match engine.compare_to_baseline(TARGET, Some("weekly"), &token).await {
        Err(DiagnosticError::BaselineNotFound { key }) => assert_eq!(key, "weekly"),
        other => panic!("expected BaselineNotFound, got {other:?}"),
    }
    // Nothing is probed when there is nothing to compare against
    assert_eq!(factory.open_count(), 0);
}

#[tokio::test(start_paused = true)]
async fn test_slow_live_connection_is_critical_regression() {
    let factory = ScriptedFactory::new().open_delays(&[10, 20, 30, 100]);
    let engine = engine(
        &factory,
        ScriptedPinger::reachable(5.0),
        Arc::new(MemoryBaselineStore::new()),
    );
    let token = CancellationToken::new();

    engine
        .capture_baseline(TARGET, "nightly", 3, Duration::from_millis(500), &token)
        .await
        .unwrap();
    let comparison = engine
        .compare_to_baseline(TARGET, None, &token)
        .await
        .unwrap();

    assert_eq!(comparison.baseline_name, "nightly");
    assert!(comparison.has_regressions());
    assert_eq!(comparison.findings.len(), 1);

    let finding = &comparison.findings[0];
    assert_eq!(finding.category, RegressionCategory::Connection);
    assert_eq!(finding.severity, Severity::Critical);
    assert_relative_eq!(finding.baseline_value, 30.0, epsilon = 1e-6);
    assert_relative_eq!(finding.current_value, 100.0, epsilon = 1e-6);
}

#[tokio::test(start_paused = true)]
async fn test_steady_live_run_has_no_regressions() {
    let factory = ScriptedFactory::new().open_delays(&[10, 20, 30, 25]);
    let engine = engine(
        &factory,
        ScriptedPinger::reachable(5.0),
        Arc::new(MemoryBaselineStore::new()),
    );
    let token = CancellationToken::new();

    engine
        .capture_baseline(TARGET, "nightly", 3, Duration::from_millis(500), &token)
        .await
        .unwrap();
    let comparison = engine
        .compare_to_baseline(TARGET, Some("nightly"), &token)
        .await
        .unwrap();

    assert!(!comparison.has_regressions());
    assert_eq!(comparison.summary, "No performance regressions detected");
}

#[tokio::test]
async fn test_file_store_round_trip_through_engine() {
    let dir = tempfile::tempdir().unwrap();
    let store: Arc<dyn BaselineStore> = Arc::new(FileBaselineStore::new(dir.path()));
    let factory = ScriptedFactory::new();
    let engine = engine(&factory, ScriptedPinger::reachable(2.0), store.clone());
    let token = CancellationToken::new();

    engine
        .capture_baseline(TARGET, "file backed", 2, Duration::ZERO, &token)
        .await
        .unwrap();

    let listed = store.list().await.unwrap();
    assert_eq!(listed.len(), 1);
    assert_eq!(listed[0].name, "file backed");
    assert_eq!(listed[0].sample_count, 2);

    let comparison = engine
        .compare_to_baseline(TARGET, None, &token)
        .await
        .unwrap();
    assert_eq!(comparison.baseline_name, "file backed");
}
