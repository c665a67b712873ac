//! Process-wide aggregates shared by every connection of one server (§4.E).

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Instant;

use tokio::sync::Notify;

/// A handle the shutdown coordinator uses to ask one live connection to
/// close, without owning the connection task itself.
#[derive(Clone)]
pub(crate) struct ConnectionHandle {
    shutdown: Arc<Notify>,
}

impl ConnectionHandle {
    fn new() -> (ConnectionHandle, ConnectionWatch) {
        let shutdown = Arc::new(Notify::new());
        (
            ConnectionHandle {
                shutdown: shutdown.clone(),
            },
            ConnectionWatch { shutdown },
        )
    }

    pub(crate) fn shutdown(&self) {
        self.shutdown.notify_waiters();
    }
}

/// The connection-task side of a [`ConnectionHandle`]: `watch()` resolves
/// once `shutdown()` has been called.
pub(crate) struct ConnectionWatch {
    shutdown: Arc<Notify>,
}

impl ConnectionWatch {
    pub(crate) async fn watch(&self) {
        self.shutdown.notified().await;
    }
}

/// RAII membership in the server's "in-flight cycle tasks" set.
///
/// Stands in for the weak-set-of-tasks idiom: a cycle task holds one guard
/// for its lifetime, and dropping it (on any exit path, including panics
/// unwound through a `JoinHandle`) both decrements the live count and wakes
/// anyone waiting for quiescence — the idiomatic substitute for "track
/// completion without owning".
pub(crate) struct CycleGuard {
    state: Arc<ServerStateInner>,
}

impl Drop for CycleGuard {
    fn drop(&mut self) {
        if self.state.in_flight.fetch_sub(1, Ordering::AcqRel) == 1 {
            self.state.drained.notify_waiters();
        }
    }
}

struct ServerStateInner {
    total_requests: AtomicU64,
    last_request_at: Mutex<Instant>,
    connections: Mutex<HashMap<u64, ConnectionHandle>>,
    next_connection_id: AtomicU64,
    in_flight: AtomicUsize,
    drained: Notify,
}

/// Shared handle to one server's live connections, in-flight cycle count,
/// and request counters.
#[derive(Clone)]
pub struct ServerState {
    inner: Arc<ServerStateInner>,
}

impl ServerState {
    pub(crate) fn new() -> ServerState {
        ServerState {
            inner: Arc::new(ServerStateInner {
                total_requests: AtomicU64::new(0),
                last_request_at: Mutex::new(Instant::now()),
                connections: Mutex::new(HashMap::new()),
                next_connection_id: AtomicU64::new(0),
                in_flight: AtomicUsize::new(0),
                drained: Notify::new(),
            }),
        }
    }

    pub(crate) fn register_connection(&self) -> (u64, ConnectionWatch) {
        let id = self.inner.next_connection_id.fetch_add(1, Ordering::Relaxed);
        let (handle, watch) = ConnectionHandle::new();
        self.inner.connections.lock().unwrap().insert(id, handle);
        (id, watch)
    }

    pub(crate) fn deregister_connection(&self, id: u64) {
        self.inner.connections.lock().unwrap().remove(&id);
    }

    pub(crate) fn connection_count(&self) -> usize {
        self.inner.connections.lock().unwrap().len()
    }

    /// Ask every currently-registered connection to shut down.
    pub(crate) fn shutdown_all_connections(&self) {
        for handle in self.inner.connections.lock().unwrap().values() {
            handle.shutdown();
        }
    }

    pub(crate) fn record_request(&self) {
        *self.inner.last_request_at.lock().unwrap() = Instant::now();
    }

    pub(crate) fn record_response_complete(&self) {
        self.inner.total_requests.fetch_add(1, Ordering::Relaxed);
    }

    pub fn total_requests(&self) -> u64 {
        self.inner.total_requests.load(Ordering::Relaxed)
    }

    pub(crate) fn idle_duration(&self) -> std::time::Duration {
        self.inner.last_request_at.lock().unwrap().elapsed()
    }

    pub(crate) fn track_cycle(&self) -> CycleGuard {
        self.inner.in_flight.fetch_add(1, Ordering::AcqRel);
        CycleGuard {
            state: self.inner.clone(),
        }
    }

    pub(crate) fn in_flight_count(&self) -> usize {
        self.inner.in_flight.load(Ordering::Acquire)
    }

    pub(crate) async fn wait_for_no_in_flight(&self) {
        loop {
            if self.inner.in_flight.load(Ordering::Acquire) == 0 {
                return;
            }
            let drained = self.inner.drained.notified();
            if self.inner.in_flight.load(Ordering::Acquire) == 0 {
                return;
            }
            drained.await;
        }
    }
}

impl Default for ServerState {
    fn default() -> Self {
        ServerState::new()
    }
}
