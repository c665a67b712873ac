use std::net::IpAddr;
use std::sync::Arc;
use std::time::Duration;

use crate::handler::Handler;

/// Default cap on unparsed request-line + header bytes while a request is
/// still incomplete, mirroring h11's own default.
pub const DEFAULT_MAX_INCOMPLETE_EVENT_SIZE: usize = 8 * 1024;

/// Soft cap on a pending request body before reads are paused.
pub const HIGH_WATER_LIMIT: usize = 65_536;

/// Runtime configuration for a [`crate::server::Server`].
///
/// Constructed programmatically by the embedding application; there is no
/// CLI or config-file loader here, matching the narrow boundary this crate
/// draws around bootstrap concerns.
pub struct Config<H> {
    pub(crate) app: Arc<H>,
    pub(crate) host: IpAddr,
    pub(crate) port: u16,
    pub(crate) backlog: u32,
    pub(crate) max_incomplete_event_size: usize,
    pub(crate) timeout_keep_alive: Duration,
    pub(crate) shutdown_threshold: Duration,
    pub(crate) root_path: String,
    pub(crate) tcp_nodelay: bool,
    pub(crate) tcp_keepalive: Option<Duration>,
    pub(crate) upgrade_handler: Option<Arc<dyn crate::proto::h1::upgrade::UpgradeHandler>>,
}

impl<H: Handler> Config<H> {
    /// Start building a configuration for the given request handler.
    pub fn new(app: H) -> Config<H> {
        Config {
            app: Arc::new(app),
            host: IpAddr::from([127, 0, 0, 1]),
            port: 8000,
            backlog: 2048,
            max_incomplete_event_size: DEFAULT_MAX_INCOMPLETE_EVENT_SIZE,
            timeout_keep_alive: Duration::from_secs(5),
            shutdown_threshold: crate::server::shutdown::DEFAULT_SHUTDOWN_THRESHOLD,
            root_path: String::new(),
            tcp_nodelay: true,
            tcp_keepalive: None,
            upgrade_handler: None,
        }
    }

    pub fn host(mut self, host: IpAddr) -> Self {
        self.host = host;
        self
    }

    pub fn port(mut self, port: u16) -> Self {
        self.port = port;
        self
    }

    pub fn backlog(mut self, backlog: u32) -> Self {
        self.backlog = backlog;
        self
    }

    pub fn max_incomplete_event_size(mut self, size: usize) -> Self {
        self.max_incomplete_event_size = size;
        self
    }

    pub fn timeout_keep_alive(mut self, timeout: Duration) -> Self {
        self.timeout_keep_alive = timeout;
        self
    }

    /// How long the shutdown coordinator waits for freshly arriving traffic
    /// to go idle before it starts draining in-flight cycles (§4.F step 1).
    /// Defaults to 10 seconds, matching the source. Not one of §6.3's
    /// recognized wire-facing options, but exposed here the same way
    /// `timeout_keep_alive` is, since an embedder (or a test) has no other
    /// way to shorten a graceful shutdown's quiescence window.
    pub fn shutdown_threshold(mut self, threshold: Duration) -> Self {
        self.shutdown_threshold = threshold;
        self
    }

    pub fn root_path(mut self, root_path: impl Into<String>) -> Self {
        self.root_path = root_path.into();
        self
    }

    pub fn tcp_nodelay(mut self, enabled: bool) -> Self {
        self.tcp_nodelay = enabled;
        self
    }

    pub fn tcp_keepalive(mut self, idle: Option<Duration>) -> Self {
        self.tcp_keepalive = idle;
        self
    }

    /// Install a WebSocket (or other `Connection: upgrade`) handler.
    ///
    /// Left unset, any upgrade request is rejected with 400, per the
    /// upgrade hook's documented default.
    pub fn upgrade_handler(
        mut self,
        handler: Arc<dyn crate::proto::h1::upgrade::UpgradeHandler>,
    ) -> Self {
        self.upgrade_handler = Some(handler);
        self
    }
}
