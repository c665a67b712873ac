#![deny(missing_debug_implementations)]

//! # rasgi
//!
//! An HTTP/1.1 protocol engine with a pluggable, message-passing request
//! handler contract.
//!
//! This crate implements the connection-oriented parts of an HTTP server —
//! wire parsing, request/response cycles, body and write-side flow control,
//! keep-alive, pipelining, and graceful/forceful shutdown — and hands every
//! request off to a user-supplied [`Handler`](handler::Handler) through a
//! small `receive`/`send` message interface modeled on ASGI. TLS
//! termination, HTTP/2, compression, routing and authentication are left to
//! the embedder; this crate's job ends at the HTTP/1.1 wire.
//!
//! ```no_run
//! use bytes::Bytes;
//! use rasgi::handler::{handler_fn, ReceiveEvent, SendEvent};
//! use rasgi::{Config, Server};
//!
//! # async fn run() -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
//! let app = handler_fn(|_scope, mut receive, mut send| {
//!     Box::pin(async move {
//!         let _ = receive.receive().await?;
//!         send.send(SendEvent::ResponseStart {
//!             status: 200,
//!             headers: vec![(
//!                 Bytes::from_static(b"content-length"),
//!                 Bytes::from_static(b"2"),
//!             )],
//!         })
//!         .await?;
//!         send.send(SendEvent::ResponseBody {
//!             body: Bytes::from_static(b"hi"),
//!             more_body: false,
//!         })
//!         .await?;
//!         Ok(())
//!     })
//! });
//!
//! let config = Config::new(app).port(8000);
//! Server::new(config)?.serve().await?;
//! # Ok(())
//! # }
//! ```

pub mod config;
pub mod error;
pub mod handler;
pub(crate) mod flow;
pub(crate) mod proto;
pub mod scope;
pub mod server;
pub(crate) mod state;

pub use config::Config;
pub use error::{Error, Result};
pub use proto::h1::upgrade::UpgradeHandler;
pub use scope::Scope;
pub use server::{Server, ShutdownHandle};
pub use state::ServerState;
