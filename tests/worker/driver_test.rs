use std::sync::{Arc, Mutex, Once};
use std::time::Duration;

use chatstats::worker::protocol::{
    codes, decode, encode, Command, CommandKind, ErrorInfo, EventEnvelope, EventKind, Payload,
    RequestEnvelope, RowSet,
};
use chatstats::worker::{
    CompiledQuery, DriverConfig, SqlValue, WorkerDriver, WorkerError, WorkerTransport,
};
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

type Received = Arc<Mutex<Vec<RequestEnvelope>>>;

/// Worker thread that records every command and answers with whatever
/// `respond` returns. Stops after answering `Close`.
fn scripted<F>(respond: F) -> (WorkerTransport, Received)
where
    F: Fn(&RequestEnvelope) -> Vec<String> + Send + 'static,
{
    let received: Received = Arc::new(Mutex::new(Vec::new()));
    let log = received.clone();
    let transport = WorkerTransport::with_worker(move |endpoint| {
        while let Ok(line) = endpoint.commands.recv() {
            let request: RequestEnvelope = decode(&line).unwrap();
            let is_close = request.command.kind() == CommandKind::Close;
            let replies = respond(&request);
            log.lock().unwrap().push(request);
            for reply in replies {
                if endpoint.events.send(reply).is_err() {
                    return;
                }
            }
            if is_close {
                return;
            }
        }
    })
    .unwrap();
    (transport, received)
}

fn reply(id: u64, kind: EventKind, data: Option<Payload>) -> String {
    encode(&EventEnvelope::ok(id, kind, data)).unwrap()
}

/// Answers init/close, leaves everything else unanswered.
fn init_and_close_only(request: &RequestEnvelope) -> Vec<String> {
    match request.command {
        Command::Init { .. } => vec![reply(request.id, EventKind::InitDone, None)],
        Command::Close => vec![reply(request.id, EventKind::CloseDone, None)],
        _ => vec![],
    }
}

fn kinds(received: &Received) -> Vec<CommandKind> {
    received
        .lock()
        .unwrap()
        .iter()
        .map(|r| r.command.kind())
        .collect()
}

async fn wait_for(received: &Received, kind: CommandKind) {
    for _ in 0..200 {
        if kinds(received).contains(&kind) {
            return;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    panic!("worker never received {kind:?}");
}

async fn memory_driver() -> WorkerDriver {
    init_tracing();
    let driver = WorkerDriver::new(DriverConfig::in_memory());
    driver.init().await.unwrap();
    driver
}

#[tokio::test]
async fn test_execute_select_and_mutation() {
    let driver = memory_driver().await;

    driver
        .execute(&CompiledQuery::raw(
            "CREATE TABLE message (id INTEGER PRIMARY KEY, body TEXT)",
        ))
        .await
        .unwrap();
    let inserted = driver
        .execute(&CompiledQuery::mutation(
            "INSERT INTO message (body) VALUES (?), (?)",
            vec!["hi".into(), "there".into()],
        ))
        .await
        .unwrap();
    assert_eq!(inserted.rows_affected, Some(2));
    assert_eq!(inserted.insert_id, Some(2));

    let rows = driver
        .execute(&CompiledQuery::select(
            "SELECT body FROM message WHERE id = ?",
            vec![SqlValue::Integer(1)],
        ))
        .await
        .unwrap();
    assert_eq!(rows.columns, vec!["body".to_string()]);
    assert_eq!(rows.value(0, "body"), Some(&SqlValue::Text("hi".into())));

    driver.destroy().await.unwrap();
}

#[tokio::test]
async fn test_engine_error_surfaces_native_message() {
    let driver = memory_driver().await;

    let err = driver
        .execute(&CompiledQuery::raw("SELECT * FROM missing_table"))
        .await
        .unwrap_err();
    match err {
        WorkerError::Engine { message, .. } => assert!(message.contains("missing_table")),
        other => panic!("unexpected error: {other:?}"),
    }

    // the connection is still usable afterwards
    assert!(driver.execute(&CompiledQuery::raw("SELECT 1")).await.is_ok());
}

#[tokio::test]
async fn test_concurrent_executes_reach_engine_in_fifo_order() {
    let driver = Arc::new(memory_driver().await);
    driver
        .execute(&CompiledQuery::raw("CREATE TABLE seen (n INTEGER)"))
        .await
        .unwrap();

    let lease = driver.acquire_connection().await.unwrap();
    let mut handles = Vec::new();
    for n in 0..5i64 {
        let driver = driver.clone();
        handles.push(tokio::spawn(async move {
            driver
                .execute(&CompiledQuery::mutation(
                    "INSERT INTO seen (n) VALUES (?)",
                    vec![n.into()],
                ))
                .await
                .unwrap();
        }));
        // let the task queue up on the mutex before the next one starts
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    drop(lease);
    for handle in handles {
        handle.await.unwrap();
    }

    let rows = driver
        .execute(&CompiledQuery::raw("SELECT n FROM seen ORDER BY rowid"))
        .await
        .unwrap();
    let order: Vec<i64> = rows.rows.iter().map(|r| r[0].as_i64().unwrap()).collect();
    assert_eq!(order, vec![0, 1, 2, 3, 4]);
}

#[tokio::test]
async fn test_transaction_helpers() {
    let driver = memory_driver().await;
    driver
        .execute(&CompiledQuery::raw("CREATE TABLE t (n INTEGER)"))
        .await
        .unwrap();

    driver.begin().await.unwrap();
    driver
        .execute(&CompiledQuery::raw("INSERT INTO t VALUES (1)"))
        .await
        .unwrap();
    driver.rollback().await.unwrap();

    let count = driver
        .execute(&CompiledQuery::raw("SELECT count(*) AS c FROM t"))
        .await
        .unwrap();
    assert_eq!(count.value(0, "c"), Some(&SqlValue::Integer(0)));

    {
        let lease = driver.acquire_connection().await.unwrap();
        lease.begin().await.unwrap();
        lease
            .execute(&CompiledQuery::raw("INSERT INTO t VALUES (2)"))
            .await
            .unwrap();
        lease.commit().await.unwrap();
    }

    let count = driver
        .execute(&CompiledQuery::raw("SELECT count(*) AS c FROM t"))
        .await
        .unwrap();
    assert_eq!(count.value(0, "c"), Some(&SqlValue::Integer(1)));
}

#[tokio::test]
async fn test_nested_begin_surfaces_engine_error() {
    let driver = memory_driver().await;

    driver.begin().await.unwrap();
    let err = driver.begin().await.unwrap_err();
    match err {
        WorkerError::Engine { message, .. } => assert!(message.contains("transaction")),
        other => panic!("unexpected error: {other:?}"),
    }
    driver.rollback().await.unwrap();
}

#[tokio::test]
async fn test_lock_timeout() {
    init_tracing();
    let config = DriverConfig {
        lock_timeout: Some(Duration::from_millis(20)),
        ..DriverConfig::in_memory()
    };
    let driver = WorkerDriver::new(config);
    driver.init().await.unwrap();

    let _lease = driver.acquire_connection().await.unwrap();
    let err = driver
        .execute(&CompiledQuery::raw("SELECT 1"))
        .await
        .unwrap_err();
    assert!(matches!(err, WorkerError::MutexTimeout(_)));
    assert!(err.is_retriable());
}

#[tokio::test]
async fn test_destroy_rejects_pending_execute() {
    init_tracing();
    let (transport, received) = scripted(init_and_close_only);
    let driver = Arc::new(WorkerDriver::with_transport(
        DriverConfig::in_memory(),
        transport,
    ));
    driver.init().await.unwrap();

    let pending = {
        let driver = driver.clone();
        tokio::spawn(async move { driver.execute(&CompiledQuery::raw("SELECT 1")).await })
    };
    wait_for(&received, CommandKind::Exec).await;

    driver.destroy().await.unwrap();

    let result = tokio::time::timeout(Duration::from_secs(5), pending)
        .await
        .expect("pending execute hung after destroy")
        .unwrap();
    assert!(matches!(result, Err(WorkerError::Destroyed)));
    assert_eq!(
        kinds(&received),
        vec![CommandKind::Init, CommandKind::Exec, CommandKind::Close]
    );

    let err = driver
        .execute(&CompiledQuery::raw("SELECT 1"))
        .await
        .unwrap_err();
    assert!(matches!(err, WorkerError::Destroyed));
}

#[tokio::test]
async fn test_worker_exit_rejects_pending_call() {
    init_tracing();
    let received: Received = Arc::new(Mutex::new(Vec::new()));
    let log = received.clone();
    let transport = WorkerTransport::with_worker(move |endpoint| {
        while let Ok(line) = endpoint.commands.recv() {
            let request: RequestEnvelope = decode(&line).unwrap();
            let id = request.id;
            let kind = request.command.kind();
            log.lock().unwrap().push(request);
            if kind == CommandKind::Init {
                endpoint
                    .events
                    .send(reply(id, EventKind::InitDone, None))
                    .unwrap();
            } else {
                // die without answering
                return;
            }
        }
    })
    .unwrap();

    let driver = WorkerDriver::with_transport(DriverConfig::in_memory(), transport);
    driver.init().await.unwrap();

    let err = driver
        .execute(&CompiledQuery::raw("SELECT 1"))
        .await
        .unwrap_err();
    assert!(matches!(err, WorkerError::WorkerExited));
    assert!(err.is_worker_gone());
}

#[tokio::test]
async fn test_mismatched_terminal_kind_is_protocol_error() {
    init_tracing();
    let (transport, _received) = scripted(|request| match request.command {
        Command::Init { .. } => vec![reply(request.id, EventKind::InitDone, None)],
        Command::Close => vec![reply(request.id, EventKind::CloseDone, None)],
        _ => vec![reply(request.id, EventKind::CloseDone, None)],
    });
    let driver = WorkerDriver::with_transport(DriverConfig::in_memory(), transport);
    driver.init().await.unwrap();

    let err = driver
        .execute(&CompiledQuery::raw("SELECT 1"))
        .await
        .unwrap_err();
    assert!(matches!(err, WorkerError::Protocol(_)));
    driver.destroy().await.unwrap();
}

#[tokio::test]
async fn test_undecodable_event_is_skipped() {
    init_tracing();
    let (transport, _received) = scripted(|request| match request.command {
        Command::Exec { .. } => vec![
            "{not json".to_string(),
            reply(
                request.id,
                EventKind::ExecResult,
                Some(Payload::Rows(RowSet {
                    columns: vec!["n".into()],
                    rows: vec![vec![SqlValue::Integer(1)]],
                    ..Default::default()
                })),
            ),
        ],
        _ => init_and_close_only(request),
    });
    let driver = WorkerDriver::with_transport(DriverConfig::in_memory(), transport);
    driver.init().await.unwrap();

    let rows = driver
        .execute(&CompiledQuery::raw("SELECT 1 AS n"))
        .await
        .unwrap();
    assert_eq!(rows.rows, vec![vec![SqlValue::Integer(1)]]);
    driver.destroy().await.unwrap();
}

#[tokio::test]
async fn test_error_slot_becomes_engine_error() {
    init_tracing();
    let (transport, _received) = scripted(|request| match request.command {
        Command::Exec { .. } => vec![encode(&EventEnvelope::failed(
            request.id,
            EventKind::ExecResult,
            ErrorInfo::new(codes::SQLITE, "disk I/O error"),
        ))
        .unwrap()],
        _ => init_and_close_only(request),
    });
    let driver = WorkerDriver::with_transport(DriverConfig::in_memory(), transport);
    driver.init().await.unwrap();

    let err = driver
        .execute(&CompiledQuery::raw("SELECT 1"))
        .await
        .unwrap_err();
    assert!(matches!(err, WorkerError::Engine { ref code, .. } if code == codes::SQLITE));
    driver.destroy().await.unwrap();
}

#[tokio::test]
async fn test_init_timeout() {
    init_tracing();
    let (transport, _received) = scripted(|_| vec![]);
    let config = DriverConfig {
        request_timeout: Some(Duration::from_millis(50)),
        ..DriverConfig::in_memory()
    };
    let driver = WorkerDriver::with_transport(config, transport);

    let err = driver.init().await.unwrap_err();
    assert!(matches!(err, WorkerError::Timeout(limit) if limit == Duration::from_millis(50)));
    assert!(err.to_string().contains("50ms"));
    assert!(!driver.is_initialized());
}

#[tokio::test]
async fn test_durable_database_survives_restart() {
    init_tracing();
    let dir = tempfile::tempdir().unwrap();

    let driver = WorkerDriver::new(DriverConfig::durable(dir.path()));
    driver.init().await.unwrap();
    assert!(driver.is_durable());
    driver
        .execute(&CompiledQuery::raw("CREATE TABLE kept (n INTEGER)"))
        .await
        .unwrap();
    driver
        .execute(&CompiledQuery::raw("INSERT INTO kept VALUES (7)"))
        .await
        .unwrap();
    driver.destroy().await.unwrap();
    assert!(dir.path().join("signal.sqlite").exists());

    let reopened = WorkerDriver::new(DriverConfig::durable(dir.path()));
    reopened.init().await.unwrap();
    let rows = reopened
        .execute(&CompiledQuery::raw("SELECT n FROM kept"))
        .await
        .unwrap();
    assert_eq!(rows.rows, vec![vec![SqlValue::Integer(7)]]);
    reopened.destroy().await.unwrap();
}

#[tokio::test]
async fn test_epoch_tracks_content() {
    let driver = memory_driver().await;

    let empty = driver.database_epoch().await.unwrap();
    assert_eq!(empty, driver.database_epoch().await.unwrap());
    assert_eq!(empty.len(), 64);

    driver
        .execute(&CompiledQuery::raw("CREATE TABLE t (n INTEGER)"))
        .await
        .unwrap();
    let with_table = driver.database_epoch().await.unwrap();
    assert_ne!(empty, with_table);

    driver
        .execute(&CompiledQuery::raw("INSERT INTO t VALUES (1)"))
        .await
        .unwrap();
    assert_ne!(with_table, driver.database_epoch().await.unwrap());
}

#[tokio::test]
async fn test_stream_rejects_mutation_without_sending() {
    init_tracing();
    let (transport, received) = scripted(init_and_close_only);
    let driver = WorkerDriver::with_transport(DriverConfig::in_memory(), transport);
    driver.init().await.unwrap();

    let err = driver
        .stream(&CompiledQuery::raw("DELETE FROM message"))
        .await
        .err()
        .unwrap();
    assert!(matches!(err, WorkerError::UnsupportedOperation(_)));

    driver.destroy().await.unwrap();
    assert_eq!(kinds(&received), vec![CommandKind::Init, CommandKind::Close]);
}

#[tokio::test]
async fn test_non_finite_reals_cross_the_worker() {
    let driver = memory_driver().await;

    let rows = driver
        .execute(&CompiledQuery::raw("SELECT 1e999 AS x, -1e999 AS y"))
        .await
        .unwrap();
    assert_eq!(rows.value(0, "x"), Some(&SqlValue::Real(f64::INFINITY)));
    assert_eq!(rows.value(0, "y"), Some(&SqlValue::Real(f64::NEG_INFINITY)));

    let echoed = driver
        .execute(&CompiledQuery::select(
            "SELECT ? AS x",
            vec![SqlValue::Real(f64::INFINITY)],
        ))
        .await
        .unwrap();
    assert_eq!(echoed.value(0, "x"), Some(&SqlValue::Real(f64::INFINITY)));

    driver.destroy().await.unwrap();
}
