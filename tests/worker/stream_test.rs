use std::sync::Once;
use std::time::Duration;

use chatstats::worker::{
    CompiledQuery, DriverConfig, RowStream, SqlValue, WorkerDriver, WorkerError, DEFAULT_STREAM_WINDOW,
};
use futures::{StreamExt, TryStreamExt};
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

async fn driver_with_rows(count: i64) -> WorkerDriver {
    init_tracing();
    let driver = WorkerDriver::new(DriverConfig::in_memory());
    driver.init().await.unwrap();
    driver
        .execute(&CompiledQuery::raw(
            "CREATE TABLE message (id INTEGER PRIMARY KEY, thread_id INTEGER)",
        ))
        .await
        .unwrap();
    for id in 0..count {
        driver
            .execute(&CompiledQuery::mutation(
                "INSERT INTO message (id, thread_id) VALUES (?, ?)",
                vec![id.into(), (id % 3).into()],
            ))
            .await
            .unwrap();
    }
    driver
}

#[tokio::test]
async fn test_stream_yields_one_batch_per_row() {
    let driver = driver_with_rows(10).await;

    let batches: Vec<_> = driver
        .stream(&CompiledQuery::select(
            "SELECT id FROM message WHERE thread_id = ? ORDER BY id",
            vec![SqlValue::Integer(0)],
        ))
        .await
        .unwrap()
        .try_collect()
        .await
        .unwrap();

    let ids: Vec<i64> = batches
        .iter()
        .map(|b| {
            assert_eq!(b.columns, vec!["id".to_string()]);
            b.rows[0][0].as_i64().unwrap()
        })
        .collect();
    assert_eq!(ids, vec![0, 3, 6, 9]);
}

#[tokio::test]
async fn test_stream_is_not_restartable_but_rerunnable() {
    let driver = driver_with_rows(3).await;
    let query = CompiledQuery::raw("SELECT id FROM message");

    let mut stream = driver.stream(&query).await.unwrap();
    let mut seen = 0;
    while let Some(batch) = stream.next().await {
        batch.unwrap();
        seen += 1;
    }
    assert_eq!(seen, 3);
    assert!(stream.is_finished());
    assert!(stream.next().await.is_none());

    let again: Vec<_> = driver
        .stream(&query)
        .await
        .unwrap()
        .try_collect()
        .await
        .unwrap();
    assert_eq!(again.len(), 3);
}

#[tokio::test]
async fn test_stream_holds_connection_until_done() {
    let driver = driver_with_rows(2).await;

    let stream = driver
        .stream(&CompiledQuery::raw("SELECT id FROM message"))
        .await
        .unwrap();
    drop(stream);

    // dropping the stream early releases the connection
    let rows = driver
        .execute(&CompiledQuery::raw("SELECT count(*) AS c FROM message"))
        .await
        .unwrap();
    assert_eq!(rows.value(0, "c"), Some(&SqlValue::Integer(2)));
}

#[tokio::test]
async fn test_stream_error_raised_to_consumer() {
    let driver = driver_with_rows(0).await;

    let mut stream = driver
        .stream(&CompiledQuery::raw("SELECT * FROM nope"))
        .await
        .unwrap();
    let err = stream.next().await.unwrap().unwrap_err();
    assert!(matches!(err, WorkerError::Engine { .. }));
    assert!(stream.next().await.is_none());
}

#[tokio::test]
async fn test_stream_rejects_mutation() {
    let driver = driver_with_rows(0).await;

    let err = driver
        .stream(&CompiledQuery::raw("INSERT INTO message (id) VALUES (1)"))
        .await
        .err()
        .unwrap();
    assert!(matches!(err, WorkerError::UnsupportedOperation(_)));
}

#[tokio::test]
async fn test_stream_after_destroy() {
    let driver = driver_with_rows(0).await;
    driver.destroy().await.unwrap();

    let err = driver
        .stream(&CompiledQuery::raw("SELECT 1"))
        .await
        .err()
        .unwrap();
    assert!(matches!(err, WorkerError::Destroyed));
}

fn counter(limit: i64) -> CompiledQuery {
    CompiledQuery::raw(format!(
        "WITH RECURSIVE c(n) AS (SELECT 1 UNION ALL SELECT n + 1 FROM c WHERE n < {limit}) \
         SELECT n FROM c"
    ))
}

#[tokio::test]
async fn test_slow_consumer_bounds_buffered_rows() {
    let driver = driver_with_rows(0).await;

    let mut stream = driver.stream(&counter(10_000)).await.unwrap();
    assert_eq!(stream.next().await.unwrap().unwrap().rows[0][0], SqlValue::Integer(1));

    // give the worker time to run ahead as far as it is allowed
    tokio::time::sleep(Duration::from_millis(200)).await;
    assert!(
        RowStream::buffered(&stream) <= DEFAULT_STREAM_WINDOW,
        "{} rows buffered",
        RowStream::buffered(&stream)
    );

    let mut last = 1;
    while let Some(batch) = stream.next().await {
        let n = batch.unwrap().rows[0][0].as_i64().unwrap();
        assert_eq!(n, last + 1);
        last = n;
    }
    assert_eq!(last, 10_000);
}

#[tokio::test]
async fn test_small_window_still_delivers_every_row() {
    init_tracing();
    let driver = WorkerDriver::new(DriverConfig {
        stream_window: 1,
        ..DriverConfig::in_memory()
    });
    driver.init().await.unwrap();

    let batches: Vec<_> = driver
        .stream(&counter(500))
        .await
        .unwrap()
        .try_collect()
        .await
        .unwrap();
    assert_eq!(batches.len(), 500);
}

#[tokio::test]
async fn test_dropped_stream_stops_the_worker() {
    let driver = driver_with_rows(0).await;

    let mut stream = driver.stream(&counter(1_000_000)).await.unwrap();
    stream.next().await.unwrap().unwrap();
    drop(stream);

    // the worker abandons the rest of the query and serves the next request
    let rows = tokio::time::timeout(
        Duration::from_secs(5),
        driver.execute(&CompiledQuery::raw("SELECT 1 AS one")),
    )
    .await
    .expect("connection not released after drop")
    .unwrap();
    assert_eq!(rows.value(0, "one"), Some(&SqlValue::Integer(1)));
}
