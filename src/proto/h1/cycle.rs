//! The Request/Response Cycle (§4.D): a spawned task running the handler,
//! mediating `receive`/`send` against state shared with the connection's
//! protocol engine.
//!
//! The source this is modeled on runs the cycle inline on the same
//! single-threaded event loop as the engine, trading messages through a
//! `message_event` flag and an `on_response` callback. Here the cycle is a
//! genuine `tokio::spawn`ed task (matching this crate's "plain `tokio::spawn`,
//! no custom executor" concurrency model), so the two communicate instead
//! through [`CycleShared`] (for inbound body delivery) and an unbounded
//! channel of [`CycleMessage`] (for outbound writes, which only the engine's
//! task may perform since it alone owns the buffered transport).

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use bytes::{Bytes, BytesMut};
use tokio::sync::{mpsc, oneshot, Notify};
use tracing::error;

use crate::error::{BoxError, Error};
use crate::flow::FlowControl;
use crate::handler::{Handler, ReceiveEvent, Send_ as Send_Trait, SendEvent};
use crate::handler::{BoxFuture, Receive};
use crate::scope::Scope;
use crate::state::ServerState;

/// State shared between a cycle task and the engine that spawned it.
pub(crate) struct CycleShared {
    disconnected: AtomicBool,
    response_started: AtomicBool,
    response_complete: AtomicBool,
    waiting_for_100_continue: AtomicBool,
    keep_alive: AtomicBool,
    body: std::sync::Mutex<BytesMut>,
    body_pending: AtomicBool,
    more_body: AtomicBool,
    message_event: Notify,
}

impl CycleShared {
    fn new(waiting_for_100_continue: bool, keep_alive: bool) -> CycleShared {
        CycleShared {
            disconnected: AtomicBool::new(false),
            response_started: AtomicBool::new(false),
            response_complete: AtomicBool::new(false),
            waiting_for_100_continue: AtomicBool::new(waiting_for_100_continue),
            keep_alive: AtomicBool::new(keep_alive),
            body: std::sync::Mutex::new(BytesMut::new()),
            body_pending: AtomicBool::new(false),
            more_body: AtomicBool::new(true),
            message_event: Notify::new(),
        }
    }

    /// Delivers a chunk of request body read off the wire to a waiting
    /// `receive()`. Appends rather than replaces: a data chunk and the
    /// terminal empty/`more_body: false` delivery can both land before
    /// `receive()` gets a chance to run (the `Length` decoder returns
    /// `Data` then immediately `Done` in the same synchronous pass), so
    /// overwriting would drop the real bytes.
    pub(crate) fn deliver_body(&self, body: Bytes, more_body: bool) {
        self.body.lock().unwrap().extend_from_slice(&body);
        self.more_body.store(more_body, Ordering::Release);
        self.body_pending.store(true, Ordering::Release);
        self.message_event.notify_waiters();
    }

    pub(crate) fn mark_disconnected(&self) {
        self.disconnected.store(true, Ordering::Release);
        self.message_event.notify_waiters();
    }

    pub(crate) fn is_disconnected(&self) -> bool {
        self.disconnected.load(Ordering::Acquire)
    }

    pub(crate) fn response_started(&self) -> bool {
        self.response_started.load(Ordering::Acquire)
    }

    pub(crate) fn response_complete(&self) -> bool {
        self.response_complete.load(Ordering::Acquire)
    }

    pub(crate) fn keep_alive(&self) -> bool {
        self.keep_alive.load(Ordering::Acquire)
    }

    pub(crate) fn clear_keep_alive(&self) {
        self.keep_alive.store(false, Ordering::Release);
    }

    /// Drains whatever has accumulated since the last call, if anything has
    /// arrived (`deliver_body` since the prior `take_body`). Returns `None`
    /// when nothing new has landed, even if the buffer happens to be empty
    /// (a pending terminal delivery of a zero-length chunk still counts).
    fn take_body(&self) -> Option<Bytes> {
        if self.body_pending.swap(false, Ordering::AcqRel) {
            let mut guard = self.body.lock().unwrap();
            Some(std::mem::take(&mut *guard).freeze())
        } else {
            None
        }
    }
}

/// A write the cycle task has asked the engine (the sole owner of the
/// transport) to perform on its behalf.
pub(crate) enum CycleMessage {
    /// Emit the `100 Continue` informational response.
    WriteContinue,
    /// `http.response.start`: status line + headers.
    Head {
        status: u16,
        headers: Vec<(Bytes, Bytes)>,
        ack: oneshot::Sender<Result<(), Error>>,
    },
    /// `http.response.body`: one body chunk, possibly the last.
    Body {
        body: Bytes,
        more_body: bool,
        ack: oneshot::Sender<Result<(), Error>>,
    },
}

/// Handle to a running cycle task, owned by the engine.
pub(crate) struct CycleHandle {
    pub(crate) shared: Arc<CycleShared>,
    pub(crate) messages: mpsc::UnboundedReceiver<CycleMessage>,
    pub(crate) join: tokio::task::JoinHandle<Result<(), BoxError>>,
}

/// Spawns the handler against a freshly parsed request scope.
///
/// `connection_close` is whether the *request* carried `Connection: close`
/// (the response always echoes it once sent); `expect_continue` is whether
/// the client sent `Expect: 100-continue`; `is_head` suppresses body bytes
/// on the wire regardless of what the handler sends.
pub(crate) fn spawn_cycle<H: Handler>(
    handler: Arc<H>,
    scope: Scope,
    flow: FlowControl,
    connection_close: bool,
    expect_continue: bool,
    is_head: bool,
    state: ServerState,
) -> CycleHandle {
    let shared = Arc::new(CycleShared::new(expect_continue, !connection_close));
    let (tx, rx) = mpsc::unbounded_channel();

    let receive = Box::new(CycleReceive {
        shared: shared.clone(),
        flow: flow.clone(),
        messages: tx.clone(),
    });
    let send = Box::new(CycleSend {
        shared: shared.clone(),
        flow,
        messages: tx,
        connection_close,
        is_head,
    });

    // Held for the lifetime of the spawned task so the shutdown
    // coordinator's quiescence wait (`ServerState::wait_for_no_in_flight`)
    // sees this cycle as in-flight until the handler actually finishes,
    // including on panic/cancellation unwind.
    let guard = state.track_cycle();
    let join = tokio::spawn(async move {
        let _guard = guard;
        handler.call(scope, receive, send).await
    });

    CycleHandle {
        shared,
        messages: rx,
        join,
    }
}

struct CycleReceive {
    shared: Arc<CycleShared>,
    flow: FlowControl,
    messages: mpsc::UnboundedSender<CycleMessage>,
}

impl Receive for CycleReceive {
    fn receive(&mut self) -> BoxFuture<'_, Result<ReceiveEvent, BoxError>> {
        Box::pin(async move {
            if self.shared.waiting_for_100_continue.swap(false, Ordering::AcqRel) {
                // Best-effort: if the engine has already gone away there is
                // nothing left to continue.
                let _ = self.messages.send(CycleMessage::WriteContinue);
            }

            if self.shared.disconnected.load(Ordering::Acquire)
                || self.shared.response_complete.load(Ordering::Acquire)
            {
                return Ok(ReceiveEvent::Disconnect);
            }

            // Asking for the next chunk is itself the read-resumption signal.
            self.flow.resume_reading();

            loop {
                if let Some(body) = self.shared.take_body() {
                    let more_body = self.shared.more_body.load(Ordering::Acquire);
                    return Ok(ReceiveEvent::Request { body, more_body });
                }
                if self.shared.disconnected.load(Ordering::Acquire)
                    || self.shared.response_complete.load(Ordering::Acquire)
                {
                    return Ok(ReceiveEvent::Disconnect);
                }
                // Enable the notified future (join the waiter list) before
                // the recheck below: `notify_waiters()` stores no permit for
                // futures created afterward, so a `deliver_body`/
                // `mark_disconnected` landing between the check and `.await`
                // would otherwise be missed.
                let notified = self.shared.message_event.notified();
                tokio::pin!(notified);
                notified.as_mut().enable();
                if let Some(body) = self.shared.take_body() {
                    let more_body = self.shared.more_body.load(Ordering::Acquire);
                    return Ok(ReceiveEvent::Request { body, more_body });
                }
                if self.shared.disconnected.load(Ordering::Acquire)
                    || self.shared.response_complete.load(Ordering::Acquire)
                {
                    return Ok(ReceiveEvent::Disconnect);
                }
                notified.await;
            }
        })
    }
}

struct CycleSend {
    shared: Arc<CycleShared>,
    flow: FlowControl,
    messages: mpsc::UnboundedSender<CycleMessage>,
    connection_close: bool,
    is_head: bool,
}

impl Send_Trait for CycleSend {
    fn send(&mut self, event: SendEvent) -> BoxFuture<'_, Result<(), BoxError>> {
        Box::pin(async move {
            self.flow.drain().await;

            if self.shared.disconnected.load(Ordering::Acquire) {
                return Ok(());
            }

            match event {
                SendEvent::ResponseStart { status, mut headers } => {
                    if self.shared.response_started.swap(true, Ordering::AcqRel) {
                        return Err(Box::new(Error::new_protocol_misuse(
                            "http.response.start sent more than once",
                        )) as BoxError);
                    }
                    self.shared.waiting_for_100_continue.store(false, Ordering::Release);
                    if self.connection_close {
                        headers.push((Bytes::from_static(b"connection"), Bytes::from_static(b"close")));
                    }

                    let (ack_tx, ack_rx) = oneshot::channel();
                    self.messages
                        .send(CycleMessage::Head {
                            status,
                            headers,
                            ack: ack_tx,
                        })
                        .map_err(|_| Box::new(Error::new_incomplete_message()) as BoxError)?;
                    ack_rx
                        .await
                        .map_err(|_| Box::new(Error::new_incomplete_message()) as BoxError)?
                        .map_err(|e| Box::new(e) as BoxError)?;
                }
                SendEvent::ResponseBody { body, more_body } => {
                    if !self.shared.response_started.load(Ordering::Acquire) {
                        return Err(Box::new(Error::new_protocol_misuse(
                            "http.response.body sent before http.response.start",
                        )) as BoxError);
                    }
                    if self.shared.response_complete.load(Ordering::Acquire) {
                        return Err(Box::new(Error::new_protocol_misuse(
                            "send() called after response_complete",
                        )) as BoxError);
                    }

                    let body = if self.is_head { Bytes::new() } else { body };
                    let (ack_tx, ack_rx) = oneshot::channel();
                    self.messages
                        .send(CycleMessage::Body {
                            body,
                            more_body,
                            ack: ack_tx,
                        })
                        .map_err(|_| Box::new(Error::new_incomplete_message()) as BoxError)?;
                    ack_rx
                        .await
                        .map_err(|_| Box::new(Error::new_incomplete_message()) as BoxError)?
                        .map_err(|e| Box::new(e) as BoxError)?;

                    if !more_body {
                        self.shared.response_complete.store(true, Ordering::Release);
                        self.shared.message_event.notify_waiters();
                    }
                }
            }
            Ok(())
        })
    }
}

/// Outcome of a completed handler invocation, as seen by the engine after
/// joining the cycle task — mirrors §4.D's "Handler invocation wrapper".
pub(crate) enum CycleOutcome {
    /// Handler returned normally and completed the response.
    Completed,
    /// Handler never called `send(start)`; engine should emit the canned 500.
    NoResponseStarted,
    /// Handler started but never completed the response; close the connection.
    Incomplete,
}

pub(crate) fn classify_outcome(
    result: Result<Result<(), BoxError>, tokio::task::JoinError>,
    shared: &CycleShared,
) -> CycleOutcome {
    match result {
        Ok(Ok(())) => {
            if !shared.response_started() {
                CycleOutcome::NoResponseStarted
            } else if !shared.response_complete() {
                CycleOutcome::Incomplete
            } else {
                CycleOutcome::Completed
            }
        }
        Ok(Err(err)) => {
            error!(error = %err, "request handler failed");
            if !shared.response_started() {
                CycleOutcome::NoResponseStarted
            } else {
                CycleOutcome::Incomplete
            }
        }
        Err(join_err) => {
            if join_err.is_cancelled() {
                CycleOutcome::Incomplete
            } else {
                error!(error = %join_err, "request handler panicked");
                if !shared.response_started() {
                    CycleOutcome::NoResponseStarted
                } else {
                    CycleOutcome::Incomplete
                }
            }
        }
    }
}
