//! The pluggable message-passing handler contract (§6.2).
//!
//! A [`Handler`] is the one external collaborator this crate depends on: a
//! user-supplied callable that receives a [`Scope`](crate::scope::Scope) and
//! a pair of `receive`/`send` message channels, in the spirit of an ASGI
//! application.

use std::future::Future;
use std::pin::Pin;

use bytes::Bytes;

use crate::error::BoxError;
use crate::scope::Scope;

/// An event delivered to the handler via `receive()`.
#[derive(Debug, Clone)]
pub enum ReceiveEvent {
    /// `http.request`: a chunk of the request body.
    Request { body: Bytes, more_body: bool },
    /// `http.disconnect`: the client went away (or the response is already complete).
    Disconnect,
}

/// An event the handler emits via `send()`.
#[derive(Debug, Clone)]
pub enum SendEvent {
    /// `http.response.start`: must be sent exactly once, before any body.
    ResponseStart {
        status: u16,
        headers: Vec<(Bytes, Bytes)>,
    },
    /// `http.response.body`: zero or more body chunks, the last with `more_body: false`.
    ResponseBody { body: Bytes, more_body: bool },
}

impl Default for SendEvent {
    fn default() -> Self {
        SendEvent::ResponseBody {
            body: Bytes::new(),
            more_body: false,
        }
    }
}

/// A boxed, `Send` future, the shape every `receive`/`send`/handler call
/// returns so a [`Handler`] can be stored as a trait object.
pub type BoxFuture<'a, T> = Pin<Box<dyn Future<Output = T> + Send + 'a>>;

/// One half of the message-passing interface: asks the engine for the next
/// body chunk or disconnect notice.
pub trait Receive: Send {
    fn receive(&mut self) -> BoxFuture<'_, Result<ReceiveEvent, BoxError>>;
}

/// The other half: hands a response event to the engine.
pub trait Send_: Send {
    fn send(&mut self, event: SendEvent) -> BoxFuture<'_, Result<(), BoxError>>;
}

/// A user-supplied request handler.
///
/// Implementors receive an immutable [`Scope`] plus boxed `receive`/`send`
/// trait objects rather than generic parameters, so that a `Config<H>` can
/// be built without the handler's concrete message-channel types leaking
/// into its signature.
pub trait Handler: Send + Sync + 'static {
    fn call<'a>(
        &'a self,
        scope: Scope,
        receive: Box<dyn Receive + 'a>,
        send: Box<dyn Send_ + 'a>,
    ) -> BoxFuture<'a, Result<(), BoxError>>;
}

/// Adapts a plain async closure into a [`Handler`].
///
/// The closure must return a boxed future directly (rather than an `async
/// fn`) so its lifetime can be tied to the borrowed `receive`/`send`
/// trait objects; see the `tests/server.rs` demo handler for the usual
/// `handler_fn(|scope, receive, send| Box::pin(async move { .. }))` shape.
pub fn handler_fn<F>(f: F) -> HandlerFn<F>
where
    F: for<'a> Fn(
            Scope,
            Box<dyn Receive + 'a>,
            Box<dyn Send_ + 'a>,
        ) -> BoxFuture<'a, Result<(), BoxError>>
        + Send
        + Sync
        + 'static,
{
    HandlerFn(f)
}

pub struct HandlerFn<F>(F);

impl<F> Handler for HandlerFn<F>
where
    F: for<'a> Fn(
            Scope,
            Box<dyn Receive + 'a>,
            Box<dyn Send_ + 'a>,
        ) -> BoxFuture<'a, Result<(), BoxError>>
        + Send
        + Sync
        + 'static,
{
    fn call<'a>(
        &'a self,
        scope: Scope,
        receive: Box<dyn Receive + 'a>,
        send: Box<dyn Send_ + 'a>,
    ) -> BoxFuture<'a, Result<(), BoxError>> {
        (self.0)(scope, receive, send)
    }
}
