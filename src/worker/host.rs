//! Worker-side command loop.
//!
//! Reads one command frame at a time, runs it against the [`Engine`], and
//! always answers with exactly one terminal event carrying the request id.
//! Engine failures (and panics) become the terminal event's error slot; they
//! never escape the worker thread.
//!
//! Streams are credit based: a `StreamStart` may run `window` rows ahead of
//! its consumer, and each `StreamAck` grants more. While a stream waits for
//! credits the loop keeps reading frames; acks and cancels for the running
//! stream are applied at once, everything else is deferred until the stream
//! ends. A `Close` stops the stream early.

use std::any::Any;
use std::collections::VecDeque;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::mpsc;

use tracing::{debug, warn};

use super::engine::{Engine, EngineResult};
use super::protocol::{
    codes, decode, encode, Command, CommandKind, ErrorInfo, EventEnvelope, EventKind, Payload,
    RequestEnvelope,
};
use super::transport::WorkerEndpoint;

/// Serve commands until the driver hangs up or a `Close` has been answered.
pub fn serve(endpoint: WorkerEndpoint, mut engine: Engine) {
    let WorkerEndpoint { commands, events } = endpoint;
    let mut inbox = Inbox {
        commands,
        deferred: VecDeque::new(),
    };

    let emit = |envelope: &EventEnvelope| -> bool {
        match encode(envelope) {
            Ok(line) => events.send(line).is_ok(),
            Err(err) => {
                warn!(error = %err, "worker: failed to encode event");
                false
            }
        }
    };

    while let Some(line) = inbox.next() {
        let request: RequestEnvelope = match decode(&line) {
            Ok(request) => request,
            Err(err) => {
                warn!(error = %err, "worker: failed to parse command");
                if let Some(reply) = reject_malformed(&line, &err) {
                    if !emit(&reply) {
                        break;
                    }
                }
                continue;
            }
        };

        let id = request.id;
        let kind = request.command.kind();
        let Some(terminal) = kind.terminal() else {
            debug!(id, ?kind, "worker: control frame for a finished stream");
            continue;
        };
        debug!(id, ?kind, "worker: command received");

        let outcome = catch_unwind(AssertUnwindSafe(|| {
            dispatch(&mut engine, &mut inbox, id, request.command, &emit)
        }));
        let data = match outcome {
            Ok(result) => result,
            Err(panic) => {
                let message = panic_message(panic.as_ref());
                warn!(id, ?kind, %message, "worker: command panicked");
                Err(ErrorInfo::new(codes::WORKER_PANIC, message))
            }
        };

        let reply = match data {
            Ok(data) => EventEnvelope::ok(id, terminal, data),
            Err(info) => EventEnvelope::failed(id, terminal, info),
        };
        if !emit(&reply) {
            debug!("worker: driver hung up");
            break;
        }
        if kind == CommandKind::Close {
            break;
        }
    }

    if let Err(err) = engine.close() {
        warn!(error = %err, "worker: failed to close database on exit");
    }
}

/// Command frames not yet served.
struct Inbox {
    commands: mpsc::Receiver<String>,
    /// Frames read while a stream waited for credits.
    deferred: VecDeque<String>,
}

impl Inbox {
    fn next(&mut self) -> Option<String> {
        self.deferred
            .pop_front()
            .or_else(|| self.commands.recv().ok())
    }
}

/// Flow control for the one running stream.
struct StreamCredits<'a> {
    id: u64,
    credits: usize,
    inbox: &'a mut Inbox,
}

impl StreamCredits<'_> {
    /// Take one credit, blocking until the consumer grants more if none is
    /// left. `false` means stop: the consumer cancelled, a `Close` arrived,
    /// or the driver hung up with the window exhausted.
    fn take(&mut self) -> bool {
        loop {
            let line = if self.credits > 0 {
                match self.inbox.commands.try_recv() {
                    Ok(line) => line,
                    Err(_) => {
                        self.credits -= 1;
                        return true;
                    }
                }
            } else {
                match self.inbox.commands.recv() {
                    Ok(line) => line,
                    Err(_) => return false,
                }
            };
            if !self.apply(line) {
                return false;
            }
        }
    }

    /// Handle a frame read mid-stream. Returns `false` to stop the stream.
    fn apply(&mut self, line: String) -> bool {
        let Ok(request) = decode::<RequestEnvelope>(&line) else {
            self.inbox.deferred.push_back(line);
            return true;
        };
        let own = request.id == self.id;
        match request.command {
            Command::StreamAck { rows } if own => {
                self.credits = self.credits.saturating_add(rows);
                true
            }
            Command::StreamCancel if own => {
                debug!(id = self.id, "worker: stream cancelled by consumer");
                false
            }
            Command::StreamAck { .. } | Command::StreamCancel => true,
            Command::Close => {
                self.inbox.deferred.push_back(line);
                false
            }
            _ => {
                self.inbox.deferred.push_back(line);
                true
            }
        }
    }
}

fn dispatch(
    engine: &mut Engine,
    inbox: &mut Inbox,
    id: u64,
    command: Command,
    emit: &dyn Fn(&EventEnvelope) -> bool,
) -> Result<Option<Payload>, ErrorInfo> {
    let result: EngineResult<Option<Payload>> = match command {
        Command::Init { file_name, durable } => engine.init(&file_name, durable).map(|()| None),
        Command::Exec {
            is_select,
            sql,
            params,
        } => engine
            .exec(is_select, &sql, &params)
            .map(|rows| Some(Payload::Rows(rows))),
        Command::Close => engine.close().map(|()| None),
        Command::StreamStart {
            sql,
            params,
            window,
        } => {
            let mut credits = StreamCredits {
                id,
                credits: window.max(1),
                inbox,
            };
            engine
                .stream(&sql, &params, |batch| {
                    credits.take()
                        && emit(&EventEnvelope::ok(
                            id,
                            EventKind::StreamRow,
                            Some(Payload::Batch(batch)),
                        ))
                })
                .map(|_| None)
        }
        // filtered out by `serve`
        Command::StreamAck { .. } | Command::StreamCancel => Ok(None),
        Command::LoadBulk {
            file_name,
            durable,
            statements,
        } => engine
            .load_bulk(&file_name, durable, statements, |percent| {
                emit(&EventEnvelope::ok(
                    id,
                    EventKind::LoadProgress,
                    Some(Payload::Progress(percent)),
                ));
            })
            .map(|applied| Some(Payload::Applied(applied))),
        Command::Fingerprint => engine
            .fingerprint()
            .map(|epoch| Some(Payload::Fingerprint(epoch))),
    };
    result.map_err(|err| err.to_info())
}

fn panic_message(panic: &(dyn Any + Send)) -> String {
    if let Some(text) = panic.downcast_ref::<&str>() {
        (*text).to_string()
    } else if let Some(text) = panic.downcast_ref::<String>() {
        text.clone()
    } else {
        "worker panicked while running command".to_string()
    }
}

/// Best-effort reply to an undecodable command: if the frame still names an
/// id and a known command kind, answer with that kind's terminal event.
fn reject_malformed(line: &str, err: &serde_json::Error) -> Option<EventEnvelope> {
    let value: serde_json::Value = serde_json::from_str(line).ok()?;
    let id = value.get("id")?.as_u64()?;
    let kind: CommandKind = serde_json::from_value(value.get("command")?.get("kind")?.clone()).ok()?;
    Some(EventEnvelope::failed(
        id,
        kind.terminal()?,
        ErrorInfo::new(codes::INVALID_REQUEST, err.to_string()),
    ))
}
