//! The top-level [`Server`]: binds the listener (§4.A), accepts
//! connections, spawns one HTTP/1.1 protocol engine per connection, and
//! drives the shutdown coordinator (§4.F) to completion.

use std::fmt;
use std::net::SocketAddr;
use std::sync::Arc;

use tracing::{debug, error, info};

use crate::config::Config;
use crate::error::Error;
use crate::handler::Handler;
use crate::proto::h1::engine;
use crate::server::shutdown::{self, Signal, ShutdownCoordinator};
use crate::server::tcp::{AddrIncoming, AddrStream};
use crate::state::ServerState;

/// A server bound to a listening socket, not yet serving connections.
///
/// Binding is synchronous and separate from serving (mirroring the
/// teacher's own `Server::bind(&addr) -> Builder` split) so that an
/// ephemeral port (`Config::port(0)`) can be resolved via [`Server::local_addr`]
/// before the accept loop starts.
pub struct Server<H> {
    config: Arc<Config<H>>,
    state: ServerState,
    incoming: AddrIncoming,
    coordinator: ShutdownCoordinator,
}

impl<H> fmt::Debug for Server<H> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Server")
            .field("local_addr", &self.incoming.local_addr())
            .finish_non_exhaustive()
    }
}

impl<H: Handler> Server<H> {
    /// Binds the listener described by `config` (§4.A). Bind failure is
    /// reported as an `Err` here rather than exiting the process directly —
    /// translating that into `std::process::exit(1)` per §6.4 is the
    /// embedder's call at the `main` call site, not this library's.
    pub fn new(config: Config<H>) -> crate::Result<Server<H>> {
        let addr = SocketAddr::new(config.host, config.port);
        let mut incoming = AddrIncoming::bind_with_backlog(&addr, config.backlog)?;
        incoming.set_nodelay(config.tcp_nodelay);
        incoming.set_keepalive(config.tcp_keepalive);

        Ok(Server {
            config: Arc::new(config),
            state: ServerState::new(),
            incoming,
            coordinator: ShutdownCoordinator::new(),
        })
    }

    /// The address actually bound — resolves `Config::port(0)` to the
    /// OS-assigned ephemeral port.
    pub fn local_addr(&self) -> SocketAddr {
        self.incoming.local_addr()
    }

    /// The shared state this server's connections register into —
    /// `total_requests`, live connection count, and so on (§4.E).
    pub fn state(&self) -> &ServerState {
        &self.state
    }

    /// Serves connections until a shutdown signal is observed and
    /// quiescence completes.
    ///
    /// Binds `SIGTERM` to graceful shutdown and `SIGINT` to forceful
    /// shutdown (§4.G, §6.4) in addition to whatever [`Server::shutdown_handle`]
    /// latches may already be armed.
    pub async fn serve(self) -> crate::Result<()> {
        shutdown::bind_signals(self.coordinator.clone());
        self.run().await
    }

    /// A clone of this server's shutdown latch, for embedders (and tests)
    /// that want to trigger shutdown programmatically instead of via a
    /// process signal — see §4.F's graceful/forceful one-shot latches.
    pub fn shutdown_handle(&self) -> ShutdownHandle {
        ShutdownHandle {
            coordinator: self.coordinator.clone(),
        }
    }

    async fn run(self) -> crate::Result<()> {
        let Server {
            config,
            state,
            mut incoming,
            coordinator,
        } = self;

        info!(addr = %incoming.local_addr(), "listening");

        loop {
            tokio::select! {
                biased;
                signal = coordinator.wait() => {
                    match signal {
                        Signal::Graceful => info!("graceful shutdown requested"),
                        Signal::Forceful => info!("forceful shutdown requested"),
                    }
                    shutdown::quiesce(&coordinator, &state, config.shutdown_threshold).await;
                    info!(total_requests = state.total_requests(), "shutdown complete");
                    return Ok(());
                }
                accepted = accept_one(&mut incoming) => {
                    match accepted {
                        Some(Ok(stream)) => spawn_connection(&config, &state, stream),
                        Some(Err(err)) => {
                            error!(error = %err, "fatal accept error");
                            return Err(Error::new_accept(err));
                        }
                        None => {
                            debug!("listener closed");
                            return Ok(());
                        }
                    }
                }
            }
        }
    }
}

/// A handle that can latch one server's shutdown coordinator without
/// holding the `Server` itself (which `serve()` consumes).
#[derive(Clone)]
pub struct ShutdownHandle {
    coordinator: ShutdownCoordinator,
}

impl fmt::Debug for ShutdownHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ShutdownHandle").finish_non_exhaustive()
    }
}

impl ShutdownHandle {
    /// Stop accepting new connections and drain in-flight ones within the
    /// quiescence window (§4.F step 1–2).
    pub fn graceful(&self) {
        self.coordinator.trigger_graceful();
    }

    /// Cancel in-flight work immediately and tear down (§4.F "If forceful").
    pub fn forceful(&self) {
        self.coordinator.trigger_forceful();
    }
}

fn spawn_connection<H: Handler>(config: &Arc<Config<H>>, state: &ServerState, stream: AddrStream) {
    let config = config.clone();
    let state = state.clone();
    let local_addr = stream.local_addr();
    let peer_addr = stream.remote_addr();
    let tcp = stream.into_inner();
    // The scheme is fixed at "http": TLS termination is delegated to the
    // transport per §1, and this engine never sees an encrypted socket
    // directly. A TLS-terminating wrapper can still reuse this engine by
    // implementing its own acceptor and calling
    // `proto::h1::engine::serve_connection` with `scheme = "https"`.
    tokio::spawn(async move {
        engine::serve_connection(tcp, config, state, Some(local_addr), Some(peer_addr), "http").await;
    });
}

async fn accept_one(incoming: &mut AddrIncoming) -> Option<std::io::Result<AddrStream>> {
    std::future::poll_fn(|cx| {
        crate::server::accept::Accept::poll_accept(std::pin::Pin::new(&mut *incoming), cx)
    })
    .await
}
