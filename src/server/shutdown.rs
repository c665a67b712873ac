//! The Shutdown Coordinator (§4.F) and Signal Handler Binder (§4.G).

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::Notify;
use tracing::info;

use crate::state::ServerState;

/// Default quiescence window before cleanup begins even if traffic is
/// still arriving, matching the original's 10s default.
pub const DEFAULT_SHUTDOWN_THRESHOLD: Duration = Duration::from_secs(10);

/// Two latched one-shot signals. Once set, a latch stays set — repeated
/// triggers are no-ops, matching §3's "Shutdown State".
#[derive(Clone)]
pub(crate) struct ShutdownCoordinator {
    graceful: Arc<AtomicBool>,
    forceful: Arc<AtomicBool>,
    notify: Arc<Notify>,
}

pub(crate) enum Signal {
    Graceful,
    Forceful,
}

impl ShutdownCoordinator {
    pub(crate) fn new() -> ShutdownCoordinator {
        ShutdownCoordinator {
            graceful: Arc::new(AtomicBool::new(false)),
            forceful: Arc::new(AtomicBool::new(false)),
            notify: Arc::new(Notify::new()),
        }
    }

    pub(crate) fn trigger_graceful(&self) {
        self.graceful.store(true, Ordering::Release);
        self.notify.notify_waiters();
    }

    pub(crate) fn trigger_forceful(&self) {
        self.forceful.store(true, Ordering::Release);
        self.notify.notify_waiters();
    }

    pub(crate) fn is_forceful(&self) -> bool {
        self.forceful.load(Ordering::Acquire)
    }

    /// Suspends until either latch is set, returning immediately if one
    /// already is.
    pub(crate) async fn wait(&self) -> Signal {
        loop {
            if self.forceful.load(Ordering::Acquire) {
                return Signal::Forceful;
            }
            if self.graceful.load(Ordering::Acquire) {
                return Signal::Graceful;
            }
            let notified = self.notify.notified();
            if self.forceful.load(Ordering::Acquire) {
                return Signal::Forceful;
            }
            if self.graceful.load(Ordering::Acquire) {
                return Signal::Graceful;
            }
            notified.await;
        }
    }
}

impl Default for ShutdownCoordinator {
    fn default() -> Self {
        ShutdownCoordinator::new()
    }
}

/// Runs the quiescence-wait → task-drain → cleanup sequence described in
/// §4.F, against already-latched shutdown state.
///
/// The source has a stale `if self._state.connections and not
/// self._is_foreceful_shutdown.is_set:` check missing a call — here the
/// forceful latch is actually read on every iteration of the cleanup loop,
/// fixing that bug rather than reproducing it.
pub(crate) async fn quiesce(
    coordinator: &ShutdownCoordinator,
    state: &ServerState,
    shutdown_threshold: Duration,
) {
    // 1. Quiescence wait: let freshly arriving traffic drain.
    if !coordinator.is_forceful() {
        loop {
            let idle = state.idle_duration();
            if idle >= shutdown_threshold || coordinator.is_forceful() {
                break;
            }
            tokio::time::sleep(Duration::from_millis(100)).await;
        }
    }

    // 2. Await in-flight cycle tasks, unless forceful.
    if !coordinator.is_forceful() {
        state.wait_for_no_in_flight().await;
    }

    // 3. Cleanup: ask every live connection to shut down, then yield until
    // they finish closing or a forceful signal arrives mid-cleanup.
    info!(
        connections = state.connection_count(),
        "shutting down: closing connections"
    );
    state.shutdown_all_connections();
    while state.connection_count() > 0 && !coordinator.is_forceful() {
        tokio::task::yield_now().await;
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
}

/// Binds `SIGTERM` to graceful shutdown and `SIGINT` to forceful shutdown.
///
/// On platforms without UNIX signal support, only `Ctrl+C` is bound (mapped
/// to forceful), per §9's documented fallback; binding itself never fails.
pub(crate) fn bind_signals(coordinator: ShutdownCoordinator) {
    #[cfg(unix)]
    {
        let term_coordinator = coordinator.clone();
        tokio::spawn(async move {
            if let Ok(mut term) = tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
                term.recv().await;
                info!("received SIGTERM, beginning graceful shutdown");
                term_coordinator.trigger_graceful();
            }
        });

        let int_coordinator = coordinator;
        tokio::spawn(async move {
            if let Ok(mut int) = tokio::signal::unix::signal(tokio::signal::unix::SignalKind::interrupt()) {
                int.recv().await;
                info!("received SIGINT, beginning forceful shutdown");
                int_coordinator.trigger_forceful();
            }
        });
    }

    #[cfg(not(unix))]
    {
        tokio::spawn(async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                info!("received Ctrl+C, beginning forceful shutdown");
                coordinator.trigger_forceful();
            }
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn wait_returns_immediately_once_latched() {
        let coordinator = ShutdownCoordinator::new();
        coordinator.trigger_graceful();
        assert!(matches!(coordinator.wait().await, Signal::Graceful));
    }

    #[tokio::test]
    async fn forceful_takes_priority_over_graceful() {
        let coordinator = ShutdownCoordinator::new();
        coordinator.trigger_graceful();
        coordinator.trigger_forceful();
        assert!(matches!(coordinator.wait().await, Signal::Forceful));
    }

    #[tokio::test]
    async fn quiesce_returns_once_idle_and_drained() {
        let state = ServerState::new();
        let coordinator = ShutdownCoordinator::new();
        coordinator.trigger_graceful();
        quiesce(&coordinator, &state, Duration::from_millis(1)).await;
    }
}
