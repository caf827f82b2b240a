//! Row streaming over `StreamRow` events.

use std::pin::Pin;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{mpsc, Arc};
use std::task::{Context, Poll};

use futures::{ready, Stream};
use tokio::sync::mpsc::UnboundedReceiver;
use tracing::debug;

use super::error::{WorkerError, WorkerResult};
use super::mutex::ConnectionGuard;
use super::protocol::{encode, Command, EventEnvelope, EventKind, Payload, RequestEnvelope, RowBatch};

/// Credit channel back to the worker for one running stream.
pub(crate) struct StreamControl {
    pub id: u64,
    pub commands: mpsc::Sender<String>,
    /// Rows the worker may send ahead of the consumer.
    pub window: usize,
}

impl StreamControl {
    fn send(&self, command: Command) {
        let frame = RequestEnvelope {
            id: self.id,
            command,
        };
        match encode(&frame) {
            Ok(line) => {
                // a hung-up worker has nothing left to pace
                let _ = self.commands.send(line);
            }
            Err(err) => debug!(id = self.id, %err, "driver: stream control not encoded"),
        }
    }
}

/// Lazy, finite sequence of row batches for one `stream()` call.
///
/// The connection stays locked until the sequence ends (or the stream is
/// dropped). An engine error is raised at the next poll and ends the
/// sequence. Not restartable: call `stream()` again to re-run the query.
///
/// The worker runs at most one window of rows ahead; consumed rows are
/// acknowledged in half-window steps. Dropping an unfinished stream cancels
/// it on the worker, which then frees the connection for the next request.
pub struct RowStream {
    events: UnboundedReceiver<EventEnvelope>,
    guard: Option<ConnectionGuard>,
    destroyed: Arc<AtomicBool>,
    control: StreamControl,
    unacked: usize,
    finished: bool,
}

impl RowStream {
    pub(crate) fn new(
        guard: ConnectionGuard,
        events: UnboundedReceiver<EventEnvelope>,
        destroyed: Arc<AtomicBool>,
        control: StreamControl,
    ) -> Self {
        Self {
            events,
            guard: Some(guard),
            destroyed,
            control,
            unacked: 0,
            finished: false,
        }
    }

    /// Whether the terminal event (or a failure) has been observed.
    pub fn is_finished(&self) -> bool {
        self.finished
    }

    /// Events received from the worker but not yet pulled.
    pub fn buffered(&self) -> usize {
        self.events.len()
    }

    fn consumed(&mut self) {
        self.unacked += 1;
        if self.unacked >= (self.control.window / 2).max(1) {
            self.control.send(Command::StreamAck { rows: self.unacked });
            self.unacked = 0;
        }
    }

    fn finish(&mut self) {
        self.finished = true;
        self.guard = None;
        self.events.close();
    }

    fn fail(&mut self, err: WorkerError) -> Poll<Option<WorkerResult<RowBatch>>> {
        self.control.send(Command::StreamCancel);
        self.finish();
        Poll::Ready(Some(Err(err)))
    }
}

impl Drop for RowStream {
    fn drop(&mut self) {
        if !self.finished {
            debug!(id = self.control.id, "driver: unfinished stream dropped");
            self.control.send(Command::StreamCancel);
        }
    }
}

impl Stream for RowStream {
    type Item = WorkerResult<RowBatch>;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        let this = &mut *self;
        if this.finished {
            return Poll::Ready(None);
        }

        let Some(event) = ready!(this.events.poll_recv(cx)) else {
            let err = if this.destroyed.load(Ordering::SeqCst) {
                WorkerError::Destroyed
            } else {
                WorkerError::WorkerExited
            };
            return this.fail(err);
        };

        match event.kind {
            EventKind::StreamRow => match event.data {
                Some(Payload::Batch(batch)) => {
                    this.consumed();
                    Poll::Ready(Some(Ok(batch)))
                }
                other => this.fail(WorkerError::Protocol(format!(
                    "stream row without row data: {other:?}"
                ))),
            },
            EventKind::StreamEnd => match event.error {
                Some(info) => this.fail(WorkerError::from_info(info)),
                None => {
                    this.finish();
                    Poll::Ready(None)
                }
            },
            other => this.fail(WorkerError::Protocol(format!(
                "unexpected {other:?} event in row stream"
            ))),
        }
    }
}
