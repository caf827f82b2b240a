//! Main-side proxy for the worker thread.

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{mpsc, Arc, Mutex as StdMutex, MutexGuard, OnceLock, PoisonError};
use std::thread::JoinHandle;
use std::time::Duration;

use tokio::sync::{mpsc as tokio_mpsc, oneshot, Mutex};
use tracing::{debug, info, warn};

use super::error::{WorkerError, WorkerResult};
use super::mutex::{ConnectionGuard, ConnectionMutex};
use super::protocol::{
    decode, encode, Command, EventEnvelope, EventKind, Payload, RequestEnvelope, RowSet,
    DEFAULT_STREAM_WINDOW,
};
use super::query::CompiledQuery;
use super::stream::{RowStream, StreamControl};
use super::transport::WorkerTransport;
use crate::config::{Settings, SettingsError};

/// Default timeout for `Init` and `Close` round trips (30 seconds).
const DEFAULT_TIMEOUT_SECS: u64 = 30;

/// Default database file name.
pub const DEFAULT_FILE_NAME: &str = "signal.sqlite";

/// How the driver opens its database.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DriverConfig {
    /// Database file name, relative to `data_dir`.
    pub file_name: String,
    /// Directory for the durable database file.
    pub data_dir: Option<PathBuf>,
    /// Ask for durable storage at init. Without it (or if the request fails)
    /// the database lives in memory.
    pub prefer_durable: bool,
    /// Limit for `Init`/`Close` round trips. `None` waits forever.
    pub request_timeout: Option<Duration>,
    /// Limit for acquiring the connection mutex. `None` waits forever.
    pub lock_timeout: Option<Duration>,
    /// Rows a stream may run ahead of its consumer.
    pub stream_window: usize,
}

impl Default for DriverConfig {
    fn default() -> Self {
        Self {
            file_name: DEFAULT_FILE_NAME.to_string(),
            data_dir: None,
            prefer_durable: false,
            request_timeout: Some(Duration::from_secs(DEFAULT_TIMEOUT_SECS)),
            lock_timeout: None,
            stream_window: DEFAULT_STREAM_WINDOW,
        }
    }
}

impl DriverConfig {
    /// In-memory database with default timeouts.
    pub fn in_memory() -> Self {
        Self::default()
    }

    /// Durable database stored under `data_dir`.
    pub fn durable(data_dir: impl Into<PathBuf>) -> Self {
        Self {
            data_dir: Some(data_dir.into()),
            prefer_durable: true,
            ..Self::default()
        }
    }

    pub fn from_settings(settings: &Settings) -> Result<Self, SettingsError> {
        Ok(Self {
            file_name: settings.database.file_name.clone(),
            data_dir: settings.data_dir()?,
            prefer_durable: settings.database.durable,
            request_timeout: settings.worker.request_timeout(),
            lock_timeout: settings.worker.lock_timeout(),
            stream_window: settings.worker.stream_window.max(1),
        })
    }
}

/// Where the engine ends up storing the database.
#[derive(Debug, Clone, PartialEq, Eq)]
struct StorageTarget {
    file_name: String,
    durable: bool,
}

impl StorageTarget {
    /// Best-effort durable storage: create the data directory, falling back
    /// to memory when that is not possible.
    fn request(config: &DriverConfig) -> Self {
        let in_memory = Self {
            file_name: config.file_name.clone(),
            durable: false,
        };
        if !config.prefer_durable {
            return in_memory;
        }

        let Some(dir) = config
            .data_dir
            .clone()
            .or_else(|| dirs::data_dir().map(|d| d.join("chatstats")))
        else {
            warn!("driver: no data directory available, using in-memory database");
            return in_memory;
        };

        match std::fs::create_dir_all(&dir) {
            Ok(()) => Self {
                file_name: dir.join(&config.file_name).to_string_lossy().into_owned(),
                durable: true,
            },
            Err(err) => {
                warn!(
                    dir = %dir.display(),
                    error = %err,
                    "driver: durable storage refused, using in-memory database"
                );
                in_memory
            }
        }
    }
}

/// A call waiting on the worker.
enum Pending {
    /// Waits for the terminal event only.
    Reply(oneshot::Sender<EventEnvelope>),
    /// Receives intermediate events and then the terminal one.
    Feed(tokio_mpsc::UnboundedSender<EventEnvelope>),
}

type PendingMap = Arc<Mutex<HashMap<u64, Pending>>>;

enum Link {
    /// Not started yet; holds an injected transport if one was supplied.
    Idle(Option<WorkerTransport>),
    Live {
        commands: mpsc::Sender<String>,
        thread: Option<JoinHandle<()>>,
        reader: tokio::task::JoinHandle<()>,
    },
    Closed,
}

/// Async proxy for the embedded database worker.
///
/// Owns the worker thread, the connection mutex and the table of pending
/// calls. Every command carries a fresh request id; replies are routed back
/// by id, so concurrent calls never steal each other's replies. All
/// database access goes through the connection mutex, which serves callers
/// in arrival order.
///
/// # Example
///
/// ```ignore
/// use chatstats::worker::{CompiledQuery, DriverConfig, WorkerDriver};
///
/// let driver = WorkerDriver::new(DriverConfig::in_memory());
/// driver.init().await?;
/// let rows = driver.execute(&CompiledQuery::raw("SELECT 1")).await?;
/// driver.destroy().await?;
/// ```
pub struct WorkerDriver {
    config: DriverConfig,
    mutex: ConnectionMutex,
    pending: PendingMap,
    next_id: AtomicU64,
    link: StdMutex<Link>,
    target: OnceLock<StorageTarget>,
    initialized: AtomicBool,
    destroyed: Arc<AtomicBool>,
}

impl WorkerDriver {
    /// Create a driver. Nothing is spawned until [`init`](Self::init).
    pub fn new(config: DriverConfig) -> Self {
        Self::with_link(config, Link::Idle(None))
    }

    /// Create a driver that talks to the worker behind `transport` instead of
    /// spawning the embedded engine.
    pub fn with_transport(config: DriverConfig, transport: WorkerTransport) -> Self {
        Self::with_link(config, Link::Idle(Some(transport)))
    }

    fn with_link(config: DriverConfig, link: Link) -> Self {
        Self {
            mutex: ConnectionMutex::new(config.lock_timeout),
            config,
            pending: Arc::new(Mutex::new(HashMap::new())),
            next_id: AtomicU64::new(1),
            link: StdMutex::new(link),
            target: OnceLock::new(),
            initialized: AtomicBool::new(false),
            destroyed: Arc::new(AtomicBool::new(false)),
        }
    }

    pub fn config(&self) -> &DriverConfig {
        &self.config
    }

    pub fn is_initialized(&self) -> bool {
        self.initialized.load(Ordering::SeqCst)
    }

    pub fn is_destroyed(&self) -> bool {
        self.destroyed.load(Ordering::SeqCst)
    }

    /// Whether the worker thread and the reader task are still running.
    pub fn is_alive(&self) -> bool {
        match &*self.lock_link() {
            Link::Live { thread, reader, .. } => {
                !reader.is_finished() && thread.as_ref().map_or(true, |t| !t.is_finished())
            }
            _ => false,
        }
    }

    /// Whether the database lives on disk (known after `init`).
    pub fn is_durable(&self) -> bool {
        self.target.get().is_some_and(|t| t.durable)
    }

    /// Start the worker and open the database. Calling it again after a
    /// successful init is a no-op.
    pub async fn init(&self) -> WorkerResult<()> {
        self.ensure_not_destroyed()?;
        if self.is_initialized() {
            return Ok(());
        }
        let _guard = self.mutex.acquire().await?;
        self.ensure_not_destroyed()?;
        if self.is_initialized() {
            return Ok(());
        }

        self.start_link()?;
        let target = self.storage_target().clone();
        self.round_trip(
            Command::Init {
                file_name: target.file_name.clone(),
                durable: target.durable,
            },
            self.config.request_timeout,
        )
        .await?;

        self.initialized.store(true, Ordering::SeqCst);
        info!(file_name = %target.file_name, durable = target.durable, "driver: initialized");
        Ok(())
    }

    /// Run one statement under the connection mutex.
    pub async fn execute(&self, query: &CompiledQuery) -> WorkerResult<RowSet> {
        self.ensure_ready()?;
        let _guard = self.mutex.acquire().await?;
        self.ensure_ready()?;
        self.exec_locked(query).await
    }

    /// Take the connection mutex for several statements in a row (e.g. a
    /// transaction). Other callers wait until the lease is dropped.
    pub async fn acquire_connection(&self) -> WorkerResult<ConnectionLease<'_>> {
        self.ensure_ready()?;
        let guard = self.mutex.acquire().await?;
        self.ensure_ready()?;
        Ok(ConnectionLease {
            driver: self,
            _guard: guard,
        })
    }

    /// `BEGIN` through [`execute`](Self::execute). Nested transactions are
    /// not supported; the engine's own error surfaces.
    pub async fn begin(&self) -> WorkerResult<()> {
        self.execute(&CompiledQuery::mutation("BEGIN", Vec::new()))
            .await
            .map(|_| ())
    }

    pub async fn commit(&self) -> WorkerResult<()> {
        self.execute(&CompiledQuery::mutation("COMMIT", Vec::new()))
            .await
            .map(|_| ())
    }

    pub async fn rollback(&self) -> WorkerResult<()> {
        self.execute(&CompiledQuery::mutation("ROLLBACK", Vec::new()))
            .await
            .map(|_| ())
    }

    /// Stream the rows of a read-only query one `StreamRow` event at a time.
    ///
    /// Mutating statements are rejected before anything is sent. The worker
    /// stays at most `stream_window` rows ahead of the returned stream.
    pub async fn stream(&self, query: &CompiledQuery) -> WorkerResult<RowStream> {
        if !query.is_select() {
            return Err(WorkerError::UnsupportedOperation(
                "only row-returning queries can be streamed".to_string(),
            ));
        }
        self.ensure_ready()?;
        let guard = self.mutex.acquire().await?;
        self.ensure_ready()?;

        let window = self.config.stream_window.max(1);
        let commands = self.command_sender()?;
        let (tx, rx) = tokio_mpsc::unbounded_channel();
        let (id, _) = self
            .dispatch_on(
                &commands,
                Command::StreamStart {
                    sql: query.sql.clone(),
                    params: query.parameters.clone(),
                    window,
                },
                Some(Pending::Feed(tx)),
            )
            .await?;
        let control = StreamControl {
            id,
            commands,
            window,
        };
        Ok(RowStream::new(guard, rx, self.destroyed.clone(), control))
    }

    /// Apply `statements` in one `LoadBulk` command while holding the
    /// connection mutex. Opens the database if `init` has not run; once the
    /// worker reports the load, the driver counts as initialized.
    /// Returns the number of statements applied.
    pub async fn load_bulk(
        &self,
        statements: Vec<String>,
        mut on_progress: impl FnMut(u8),
    ) -> WorkerResult<usize> {
        self.ensure_not_destroyed()?;
        let _guard = self.mutex.acquire().await?;
        self.ensure_not_destroyed()?;
        self.start_link()?;

        let target = self.storage_target().clone();
        let target_name = target.file_name.clone();
        let total = statements.len();
        let (tx, mut rx) = tokio_mpsc::unbounded_channel();
        let id = self
            .dispatch(
                Command::LoadBulk {
                    file_name: target.file_name,
                    durable: target.durable,
                    statements,
                },
                Pending::Feed(tx),
            )
            .await?;
        debug!(id, total, "driver: bulk load started");

        while let Some(event) = rx.recv().await {
            match event.kind {
                EventKind::LoadProgress => match event.data {
                    Some(Payload::Progress(percent)) => on_progress(percent),
                    other => {
                        return Err(WorkerError::Protocol(format!(
                            "load progress without percentage: {other:?}"
                        )))
                    }
                },
                EventKind::LoadDone => {
                    let outcome = expect_terminal(event, EventKind::LoadDone);
                    // the worker opened the database unless opening is what failed
                    if matches!(
                        outcome,
                        Ok(_) | Err(WorkerError::Engine {
                            statement_index: Some(_),
                            ..
                        })
                    ) && !self.initialized.swap(true, Ordering::SeqCst)
                    {
                        info!(file_name = %target_name, "driver: database opened by bulk load");
                    }
                    return match outcome? {
                        Some(Payload::Applied(applied)) => Ok(applied),
                        other => Err(WorkerError::Protocol(format!(
                            "unexpected load payload: {other:?}"
                        ))),
                    };
                }
                other => {
                    return Err(WorkerError::Protocol(format!(
                        "unexpected {other:?} event during bulk load"
                    )))
                }
            }
        }
        Err(self.gone_error())
    }

    /// Content hash of the whole database (the cache epoch).
    pub async fn database_epoch(&self) -> WorkerResult<String> {
        self.ensure_ready()?;
        let _guard = self.mutex.acquire().await?;
        self.ensure_ready()?;
        match self.round_trip(Command::Fingerprint, None).await? {
            Some(Payload::Fingerprint(epoch)) => Ok(epoch),
            other => Err(WorkerError::Protocol(format!(
                "unexpected fingerprint payload: {other:?}"
            ))),
        }
    }

    /// Close the database and stop the worker.
    ///
    /// Every call still waiting on the worker is rejected with
    /// [`WorkerError::Destroyed`], and every later call fails the same way.
    /// Destroying twice is a no-op.
    pub async fn destroy(&self) -> WorkerResult<()> {
        if self.destroyed.swap(true, Ordering::SeqCst) {
            return Ok(());
        }
        self.pending.lock().await.clear();

        let link = std::mem::replace(&mut *self.lock_link(), Link::Closed);
        let Link::Live {
            commands,
            thread,
            reader,
        } = link
        else {
            info!("driver: destroyed before start");
            return Ok(());
        };

        let closed = match self.dispatch_on(&commands, Command::Close, None).await {
            Ok((id, rx)) => self
                .await_reply(id, rx, self.config.request_timeout)
                .await
                .and_then(|event| expect_terminal(event, EventKind::CloseDone)),
            Err(err) => Err(err),
        };
        drop(commands);

        if closed.is_ok() {
            if let Some(thread) = thread {
                let joined = tokio::task::spawn_blocking(move || thread.join()).await;
                if !matches!(joined, Ok(Ok(()))) {
                    warn!("driver: worker thread panicked during shutdown");
                }
            }
        }
        reader.abort();
        self.pending.lock().await.clear();
        info!(ok = closed.is_ok(), "driver: destroyed");

        match closed {
            Ok(_) => Ok(()),
            Err(err) if err.is_worker_gone() => Ok(()),
            Err(err) => Err(err),
        }
    }

    async fn exec_locked(&self, query: &CompiledQuery) -> WorkerResult<RowSet> {
        let data = self
            .round_trip(
                Command::Exec {
                    is_select: query.is_select(),
                    sql: query.sql.clone(),
                    params: query.parameters.clone(),
                },
                None,
            )
            .await?;
        match data {
            Some(Payload::Rows(rows)) => Ok(rows),
            other => Err(WorkerError::Protocol(format!(
                "unexpected exec payload: {other:?}"
            ))),
        }
    }

    /// Send `command` and wait for its terminal event.
    async fn round_trip(
        &self,
        command: Command,
        limit: Option<Duration>,
    ) -> WorkerResult<Option<Payload>> {
        let kind = command.kind();
        let terminal = kind.terminal().ok_or_else(|| {
            WorkerError::Protocol(format!("{kind:?} has no reply to wait for"))
        })?;
        let commands = self.command_sender()?;
        let (id, rx) = self.dispatch_on(&commands, command, None).await?;
        let event = self.await_reply(id, rx, limit).await?;
        expect_terminal(event, terminal)
    }

    /// Register `pending` under a fresh id and send the command.
    async fn dispatch(&self, command: Command, pending: Pending) -> WorkerResult<u64> {
        let commands = self.command_sender()?;
        self.dispatch_on(&commands, command, Some(pending))
            .await
            .map(|(id, _)| id)
    }

    /// Send `command` over `commands`. With `pending = None` a reply slot is
    /// registered and its receiver returned.
    async fn dispatch_on(
        &self,
        commands: &mpsc::Sender<String>,
        command: Command,
        pending: Option<Pending>,
    ) -> WorkerResult<(u64, Option<oneshot::Receiver<EventEnvelope>>)> {
        let id = self.next_id.fetch_add(1, Ordering::SeqCst);
        let kind = command.kind();
        let line = encode(&RequestEnvelope { id, command })?;

        let (pending, rx) = match pending {
            Some(pending) => (pending, None),
            None => {
                let (tx, rx) = oneshot::channel();
                (Pending::Reply(tx), Some(rx))
            }
        };
        self.pending.lock().await.insert(id, pending);

        debug!(id, ?kind, "driver: sending command");
        if commands.send(line).is_err() {
            self.pending.lock().await.remove(&id);
            return Err(self.gone_error());
        }
        Ok((id, rx))
    }

    async fn await_reply(
        &self,
        id: u64,
        rx: Option<oneshot::Receiver<EventEnvelope>>,
        limit: Option<Duration>,
    ) -> WorkerResult<EventEnvelope> {
        let Some(rx) = rx else {
            return Err(WorkerError::Protocol(format!(
                "request {id} has no reply slot"
            )));
        };
        let received = match limit {
            Some(limit) => match tokio::time::timeout(limit, rx).await {
                Ok(received) => received,
                Err(_) => {
                    // stop a late reply from landing in a dead slot
                    self.pending.lock().await.remove(&id);
                    return Err(WorkerError::Timeout(limit));
                }
            },
            None => rx.await,
        };
        received.map_err(|_| self.gone_error())
    }

    fn start_link(&self) -> WorkerResult<()> {
        let mut link = self.lock_link();
        let transport = match &mut *link {
            Link::Live { .. } => return Ok(()),
            Link::Closed => return Err(WorkerError::Destroyed),
            Link::Idle(slot) => match slot.take() {
                Some(transport) => transport,
                None => WorkerTransport::spawn_engine(None).map_err(WorkerError::SpawnFailed)?,
            },
        };

        let WorkerTransport {
            commands,
            events,
            thread,
        } = transport;
        let reader = spawn_reader_task(events, self.pending.clone());
        *link = Link::Live {
            commands,
            thread,
            reader,
        };
        debug!("driver: worker started");
        Ok(())
    }

    fn command_sender(&self) -> WorkerResult<mpsc::Sender<String>> {
        match &*self.lock_link() {
            Link::Live { commands, .. } => Ok(commands.clone()),
            Link::Idle(_) => Err(WorkerError::NotInitialized),
            Link::Closed => Err(WorkerError::Destroyed),
        }
    }

    fn storage_target(&self) -> &StorageTarget {
        self.target
            .get_or_init(|| StorageTarget::request(&self.config))
    }

    fn lock_link(&self) -> MutexGuard<'_, Link> {
        self.link.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn ensure_not_destroyed(&self) -> WorkerResult<()> {
        if self.is_destroyed() {
            return Err(WorkerError::Destroyed);
        }
        Ok(())
    }

    fn ensure_ready(&self) -> WorkerResult<()> {
        self.ensure_not_destroyed()?;
        if !self.is_initialized() {
            return Err(WorkerError::NotInitialized);
        }
        Ok(())
    }

    fn gone_error(&self) -> WorkerError {
        if self.is_destroyed() {
            WorkerError::Destroyed
        } else {
            WorkerError::WorkerExited
        }
    }
}

impl Drop for WorkerDriver {
    fn drop(&mut self) {
        if self.destroyed.swap(true, Ordering::SeqCst) {
            return;
        }
        // hanging up the command channel makes the worker close and exit
        if let Link::Live { reader, .. } = std::mem::replace(&mut *self.lock_link(), Link::Closed) {
            reader.abort();
        }
    }
}

/// Exclusive hold on the connection, released on drop.
pub struct ConnectionLease<'a> {
    driver: &'a WorkerDriver,
    _guard: ConnectionGuard,
}

impl ConnectionLease<'_> {
    /// Run a statement on the held connection.
    pub async fn execute(&self, query: &CompiledQuery) -> WorkerResult<RowSet> {
        self.driver.ensure_ready()?;
        self.driver.exec_locked(query).await
    }

    pub async fn begin(&self) -> WorkerResult<()> {
        self.execute(&CompiledQuery::mutation("BEGIN", Vec::new()))
            .await
            .map(|_| ())
    }

    pub async fn commit(&self) -> WorkerResult<()> {
        self.execute(&CompiledQuery::mutation("COMMIT", Vec::new()))
            .await
            .map(|_| ())
    }

    pub async fn rollback(&self) -> WorkerResult<()> {
        self.execute(&CompiledQuery::mutation("ROLLBACK", Vec::new()))
            .await
            .map(|_| ())
    }
}

/// Route events from the worker to their pending calls.
fn spawn_reader_task(
    mut events: tokio_mpsc::UnboundedReceiver<String>,
    pending: PendingMap,
) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        while let Some(line) = events.recv().await {
            let event: EventEnvelope = match decode(&line) {
                Ok(event) => event,
                Err(err) => {
                    warn!(error = %err, "driver: failed to parse event");
                    continue;
                }
            };
            debug!(id = event.id, kind = ?event.kind, "driver: event received");

            let mut pending = pending.lock().await;
            if event.kind.is_terminal() {
                match pending.remove(&event.id) {
                    Some(Pending::Reply(tx)) => {
                        let _ = tx.send(event);
                    }
                    Some(Pending::Feed(tx)) => {
                        let _ = tx.send(event);
                    }
                    None => debug!(id = event.id, "driver: no caller waiting for event"),
                }
                continue;
            }

            match pending.get(&event.id) {
                Some(Pending::Feed(tx)) => {
                    let _ = tx.send(event);
                }
                Some(Pending::Reply(_)) => {
                    // hand it over so the caller reports the mismatch
                    if let Some(Pending::Reply(tx)) = pending.remove(&event.id) {
                        let _ = tx.send(event);
                    }
                }
                None => debug!(id = event.id, "driver: no caller waiting for event"),
            }
        }

        // worker gone: dropping the senders rejects every waiting call
        pending.lock().await.clear();
    })
}

/// Check an event closes out the expected command and unpack it.
fn expect_terminal(event: EventEnvelope, expected: EventKind) -> WorkerResult<Option<Payload>> {
    if event.kind != expected {
        return Err(WorkerError::Protocol(format!(
            "expected {expected:?} event, got {:?}",
            event.kind
        )));
    }
    if let Some(info) = event.error {
        return Err(WorkerError::from_info(info));
    }
    Ok(event.data)
}
