//! Per-connection read/write backpressure gate (§4.B).

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use tokio::sync::Notify;

/// Tracks paused/resumed state for one connection and lets writers suspend
/// until the transport is writable again.
///
/// `pause_reading`/`resume_reading` only flip a flag the protocol engine's
/// read loop consults each iteration (there is no OS-level "stop pushing
/// bytes" callback to invoke in a poll-driven runtime, unlike the callback
/// transport this was modeled on). `pause_writing`/`resume_writing` close
/// and open an actual gate that `drain()` waits on.
#[derive(Clone)]
pub(crate) struct FlowControl {
    inner: Arc<Inner>,
}

struct Inner {
    read_paused: AtomicBool,
    write_paused: AtomicBool,
    writable: Notify,
}

impl FlowControl {
    pub(crate) fn new() -> FlowControl {
        FlowControl {
            inner: Arc::new(Inner {
                read_paused: AtomicBool::new(false),
                write_paused: AtomicBool::new(false),
                writable: Notify::new(),
            }),
        }
    }

    pub(crate) fn is_read_paused(&self) -> bool {
        self.inner.read_paused.load(Ordering::Acquire)
    }

    pub(crate) fn pause_reading(&self) {
        self.inner.read_paused.store(true, Ordering::Release);
    }

    pub(crate) fn resume_reading(&self) {
        self.inner.read_paused.store(false, Ordering::Release);
    }

    pub(crate) fn pause_writing(&self) {
        self.inner.write_paused.store(true, Ordering::Release);
    }

    pub(crate) fn resume_writing(&self) {
        self.inner.write_paused.store(false, Ordering::Release);
        self.inner.writable.notify_waiters();
    }

    /// Suspends until the transport is writable, returning immediately if
    /// it already is.
    pub(crate) async fn drain(&self) {
        loop {
            if !self.inner.write_paused.load(Ordering::Acquire) {
                return;
            }
            // Register for notification before the second check: `enable()`
            // joins the waiter list immediately, so a `resume_writing` that
            // lands after this point (but before `.await`) is still seen —
            // `notify_waiters()` stores no permit for futures that join
            // later, unlike `notify_one()`.
            let notified = self.inner.writable.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();
            if !self.inner.write_paused.load(Ordering::Acquire) {
                return;
            }
            notified.await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn pause_resume_idempotent() {
        let flow = FlowControl::new();
        flow.pause_reading();
        flow.pause_reading();
        assert!(flow.is_read_paused());
        flow.resume_reading();
        flow.resume_reading();
        assert!(!flow.is_read_paused());
    }

    #[tokio::test]
    async fn drain_returns_immediately_when_not_paused() {
        let flow = FlowControl::new();
        flow.drain().await;
    }

    #[tokio::test]
    async fn drain_releases_on_resume() {
        let flow = FlowControl::new();
        flow.pause_writing();
        let waiter = flow.clone();
        let handle = tokio::spawn(async move {
            waiter.drain().await;
        });
        tokio::task::yield_now().await;
        flow.resume_writing();
        handle.await.expect("drain task panicked");
    }
}
