//! Global admission mode and the in-flight quiescence counter.
//!
//! In the C version `hold` and the request counter were process-wide
//! globals behind one mutex/condition-variable pair. Here they live in a
//! single controller: a tokio mutex guards the state, a `Notify` plays the
//! condition variable for `wait_until_at_most`.
//!
//! Every worker brackets its request with `begin_request`/`end_request`;
//! admission of new work is gated on the `hold` flag (replica joins are
//! exempt so the system can grow replicas while on hold).

use std::sync::Arc;

use tokio::sync::{Mutex, Notify};
use tracing::info;

struct AdminState {
    hold: bool,
    in_flight: u32,
}

/// The process-wide hold/release/shutdown controller.
pub struct AdminMode {
    state: Mutex<AdminState>,
    /// Signalled on every `end_request`
    drained: Notify,
    /// Wakes the accept loop out of `accept()` on shutdown
    shutdown_notify: Arc<Notify>,
}

impl AdminMode {
    pub fn new(shutdown_notify: Arc<Notify>) -> Self {
        Self {
            state: Mutex::new(AdminState {
                hold: false,
                in_flight: 0,
            }),
            drained: Notify::new(),
            shutdown_notify,
        }
    }

    /// Stop admitting new ordinary requests. Idempotent.
    pub async fn hold(&self) {
        let mut s = self.state.lock().await;
        if !s.hold {
            info!("server placed on hold");
        }
        s.hold = true;
    }

    /// Resume admitting requests. Idempotent.
    pub async fn release(&self) {
        let mut s = self.state.lock().await;
        if s.hold {
            info!("server released from hold");
        }
        s.hold = false;
    }

    /// Hold, and additionally stop accepting new connections.
    pub async fn shutdown(&self) {
        {
            let mut s = self.state.lock().await;
            s.hold = true;
        }
        info!("shutdown requested, waking accept loop");
        self.shutdown_notify.notify_waiters();
    }

    pub async fn is_on_hold(&self) -> bool {
        self.state.lock().await.hold
    }

    /// Set the hold flag and return its previous value. Used by the
    /// replica-join flow to force hold for the snapshot window and restore
    /// the operator's setting afterwards.
    pub async fn set_hold(&self, hold: bool) -> bool {
        let mut s = self.state.lock().await;
        std::mem::replace(&mut s.hold, hold)
    }

    /// Count a request in.
    pub async fn begin_request(&self) {
        let mut s = self.state.lock().await;
        s.in_flight += 1;
    }

    /// Count a request out and wake any quiescence waiter.
    pub async fn end_request(&self) {
        {
            let mut s = self.state.lock().await;
            s.in_flight = s.in_flight.saturating_sub(1);
        }
        self.drained.notify_waiters();
    }

    /// Number of requests currently executing.
    pub async fn in_flight(&self) -> u32 {
        self.state.lock().await.in_flight
    }

    /// Suspend until at most `n` requests are in flight.
    pub async fn wait_until_at_most(&self, n: u32) {
        loop {
            // Register for the notification before checking the counter so
            // an end_request between check and await is not lost
            let notified = self.drained.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            {
                let s = self.state.lock().await;
                if s.in_flight <= n {
                    return;
                }
            }
            notified.await;
        }
    }
}
