//! A cloneable handle for stopping a session from outside the send loop.

use std::sync::Arc;
use std::time::Duration;

use crate::events::SessionStatus;
use crate::session::SessionShared;

/// A cloneable handle onto a running session.
///
/// Holds only an `Arc` to the shared state, so cloning is cheap and the handle
/// can live in a signal handler or another task while `send_message` runs.
#[derive(Clone)]
pub struct SessionHandle {
    pub(crate) shared: Arc<SessionShared>,
}

impl SessionHandle {
    /// Stop the outstanding request, if any.
    ///
    /// Returns `false` when the session was already idle.
    pub fn stop(&self) -> bool {
        self.shared.stop()
    }

    pub fn status(&self) -> SessionStatus {
        self.shared.status()
    }

    pub fn is_busy(&self) -> bool {
        self.status().is_busy()
    }

    /// Wait until the session goes back to idle.
    pub async fn wait_for_idle(&self) {
        let notified = self.shared.idle_notify.notified();
        if !self.is_busy() {
            return;
        }
        notified.await;
    }

    /// Wait until idle, with a timeout.
    /// Returns `true` if idle was reached, `false` on timeout.
    pub async fn wait_for_idle_timeout(&self, timeout: Duration) -> bool {
        if !self.is_busy() {
            return true;
        }
        tokio::time::timeout(timeout, self.wait_for_idle())
            .await
            .is_ok()
    }
}
