use std::sync::Once;

use chatstats::worker::{CompiledQuery, DriverConfig, SqlValue, WorkerDriver, WorkerError};
use chatstats::{load_database, BulkLoader, LoadError, LoadReport};
use tracing_subscriber::EnvFilter;

fn init_tracing() {
    static INIT: Once = Once::new();
    INIT.call_once(|| {
        let filter =
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("chatstats=debug"));
        let _ = tracing_subscriber::fmt()
            .with_env_filter(filter)
            .with_writer(std::io::stderr)
            .with_ansi(false)
            .try_init();
    });
}

/// Schema plus `count - 1` inserts, 1000 statements for `count = 1000`.
fn backup_statements(count: usize) -> Vec<String> {
    let mut statements = vec!["CREATE TABLE message (id INTEGER PRIMARY KEY, body TEXT)".to_string()];
    statements.extend(
        (1..count).map(|id| format!("INSERT INTO message (id, body) VALUES ({id}, 'm{id}')")),
    );
    statements
}

async fn count_messages(driver: &WorkerDriver) -> i64 {
    let rows = driver
        .execute(&CompiledQuery::raw("SELECT count(*) AS c FROM message"))
        .await
        .unwrap();
    match rows.value(0, "c") {
        Some(SqlValue::Integer(n)) => *n,
        other => panic!("unexpected count: {other:?}"),
    }
}

fn assert_strictly_increasing(values: &[u8]) {
    for pair in values.windows(2) {
        assert!(pair[0] < pair[1], "progress went backwards: {values:?}");
    }
}

#[tokio::test]
async fn test_load_reports_progress_and_finishes_at_100() {
    init_tracing();
    let driver = WorkerDriver::new(DriverConfig::in_memory());
    driver.init().await.unwrap();

    let mut progress = Vec::new();
    let report = BulkLoader::new(&driver)
        .load(backup_statements(1000), |p| progress.push(p))
        .await
        .unwrap();

    assert_eq!(
        report,
        LoadReport {
            total: 1000,
            statements_applied: 1000
        }
    );
    assert_strictly_increasing(&progress);
    assert_eq!(progress.last(), Some(&100));
    assert!(progress.len() > 10);
    assert_eq!(count_messages(&driver).await, 999);

    driver.destroy().await.unwrap();
}

#[tokio::test]
async fn test_load_fails_at_malformed_statement() {
    init_tracing();
    let driver = WorkerDriver::new(DriverConfig::in_memory());
    driver.init().await.unwrap();

    let mut statements = backup_statements(1000);
    statements[427] = "INSERT INTO message VALUES (".to_string();

    let mut progress = Vec::new();
    let err = load_database(&driver, statements, |p| progress.push(p))
        .await
        .unwrap_err();

    match &err {
        LoadError::Statement { index, source } => {
            assert_eq!(*index, 427);
            assert!(matches!(source, WorkerError::Engine { .. }));
        }
        other => panic!("unexpected error: {other:?}"),
    }
    assert_strictly_increasing(&progress);
    assert!(!progress.contains(&100));

    // statements before the failure stay applied
    assert_eq!(count_messages(&driver).await, 426);
}

#[tokio::test]
async fn test_empty_load_reports_only_completion() {
    init_tracing();
    let driver = WorkerDriver::new(DriverConfig::in_memory());
    driver.init().await.unwrap();

    let mut progress = Vec::new();
    let report = BulkLoader::new(&driver)
        .load(Vec::new(), |p| progress.push(p))
        .await
        .unwrap();

    assert_eq!(report.statements_applied, 0);
    assert_eq!(progress, vec![100]);
}

#[tokio::test]
async fn test_load_opens_database_without_init() {
    init_tracing();
    let driver = WorkerDriver::new(DriverConfig::in_memory());

    let report = BulkLoader::new(&driver)
        .load_silently(backup_statements(5))
        .await
        .unwrap();
    assert_eq!(report.statements_applied, 5);

    // the lazily opened database serves queries afterwards
    assert!(driver.is_initialized());
    assert_eq!(count_messages(&driver).await, 4);
    assert_eq!(driver.database_epoch().await.unwrap().len(), 64);
    driver.init().await.unwrap();
    assert_eq!(count_messages(&driver).await, 4);
}

#[tokio::test]
async fn test_failed_lazy_load_still_opens_database() {
    init_tracing();
    let driver = WorkerDriver::new(DriverConfig::in_memory());

    let mut statements = backup_statements(5);
    statements[3] = "INSERT INTO missing VALUES (1)".to_string();
    let err = BulkLoader::new(&driver)
        .load_silently(statements)
        .await
        .unwrap_err();
    assert_eq!(err.statement_index(), Some(3));

    assert_eq!(count_messages(&driver).await, 2);
}

#[tokio::test]
async fn test_load_after_destroy() {
    init_tracing();
    let driver = WorkerDriver::new(DriverConfig::in_memory());
    driver.init().await.unwrap();
    driver.destroy().await.unwrap();

    let err = BulkLoader::new(&driver)
        .load_silently(backup_statements(3))
        .await
        .unwrap_err();
    assert!(err.statement_index().is_none());
    assert!(matches!(err.worker_error(), WorkerError::Destroyed));
}
