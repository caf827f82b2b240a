//! Channel link between the driver and a worker thread.
//!
//! Commands travel driver → worker over a std channel (the worker blocks on
//! it), events travel worker → driver over an unbounded tokio channel (the
//! driver's reader task awaits it). Both carry NDJSON lines, never live
//! objects.

use std::io;
use std::sync::mpsc;
use std::thread::{self, JoinHandle};

use tokio::sync::mpsc as tokio_mpsc;

use super::engine::{Engine, InitHook};
use super::host;

const WORKER_THREAD_NAME: &str = "chatstats-worker";

/// The worker's end of the link.
pub struct WorkerEndpoint {
    pub commands: mpsc::Receiver<String>,
    pub events: tokio_mpsc::UnboundedSender<String>,
}

/// The driver's end of the link plus the worker thread handle.
pub struct WorkerTransport {
    pub(crate) commands: mpsc::Sender<String>,
    pub(crate) events: tokio_mpsc::UnboundedReceiver<String>,
    pub(crate) thread: Option<JoinHandle<()>>,
}

impl WorkerTransport {
    /// Create an unattached link. The caller owns the returned endpoint and is
    /// responsible for serving it (useful for scripted workers in tests).
    pub fn pair() -> (Self, WorkerEndpoint) {
        let (cmd_tx, cmd_rx) = mpsc::channel();
        let (evt_tx, evt_rx) = tokio_mpsc::unbounded_channel();
        (
            Self {
                commands: cmd_tx,
                events: evt_rx,
                thread: None,
            },
            WorkerEndpoint {
                commands: cmd_rx,
                events: evt_tx,
            },
        )
    }

    /// Run `worker` on a dedicated thread serving the other end of the link.
    pub fn with_worker<F>(worker: F) -> io::Result<Self>
    where
        F: FnOnce(WorkerEndpoint) + Send + 'static,
    {
        let (mut transport, endpoint) = Self::pair();
        let handle = thread::Builder::new()
            .name(WORKER_THREAD_NAME.to_string())
            .spawn(move || worker(endpoint))?;
        transport.thread = Some(handle);
        Ok(transport)
    }

    /// Spawn the embedded SQLite engine on its own thread.
    pub fn spawn_engine(init_hook: Option<InitHook>) -> io::Result<Self> {
        Self::with_worker(move |endpoint| {
            let engine = match init_hook {
                Some(hook) => Engine::with_init_hook(hook),
                None => Engine::new(),
            };
            host::serve(endpoint, engine);
        })
    }

    /// Whether the worker thread is still running. Links without a thread
    /// report `true`.
    pub fn is_running(&self) -> bool {
        self.thread.as_ref().map_or(true, |t| !t.is_finished())
    }
}
