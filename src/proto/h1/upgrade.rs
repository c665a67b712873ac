//! The `Connection: upgrade` hook (§4.C "Upgrade hook", §9 Open Question 1).
//!
//! The source this engine is modeled on consults a WebSocket protocol class
//! it never actually wires up, leaving the upgrade path effectively dead.
//! Here that's made an explicit configuration slot: set one via
//! [`Config::upgrade_handler`](crate::config::Config::upgrade_handler), or
//! leave it unset to reject every upgrade request with 400.

use bytes::Bytes;
use tokio::net::TcpStream;

use crate::scope::Scope;

/// Handles a successfully-negotiated protocol upgrade.
///
/// Invoked with the original request's scope, the raw upgrade token (e.g.
/// `websocket`), and the TCP stream with its HTTP-framing responsibilities
/// retired — the handler owns the bytes from here on.
pub trait UpgradeHandler: Send + Sync {
    fn upgrade(&self, scope: Scope, upgrade_to: Bytes, io: TcpStream);
}
