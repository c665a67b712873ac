//! Everything needed to run a [`Server`]: the TCP acceptor (§4.A), the
//! shutdown coordinator and signal binder (§4.F, §4.G), and the `Accept`
//! abstraction the acceptor is built on.

pub(crate) mod accept;
mod server;
pub(crate) mod shutdown;
pub(crate) mod tcp;

pub use self::server::{Server, ShutdownHandle};
