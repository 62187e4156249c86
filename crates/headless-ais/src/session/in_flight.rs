//! Shared slot for the one login currently running.

use tokio::sync::{Notify, OnceCell};
use tokio_util::sync::CancellationToken;

use super::SessionToken;
use crate::error::LoginError;

pub(super) type InFlightResult = Result<SessionToken, LoginError>;

/// Outcome of a login shared between its leader and all waiters.
pub(super) struct InFlightState {
    /// Logout epoch the login was started in.
    pub(super) epoch: u64,
    result: OnceCell<InFlightResult>,
    notify: Notify,
    /// Fired by logout to stop the leader.
    abort: CancellationToken,
}

impl InFlightState {
    pub(super) fn new(epoch: u64) -> Self {
        Self {
            epoch,
            result: OnceCell::new(),
            notify: Notify::new(),
            abort: CancellationToken::new(),
        }
    }

    pub(super) fn abort(&self) {
        self.abort.cancel();
    }

    pub(super) fn is_aborted(&self) -> bool {
        self.abort.is_cancelled()
    }

    pub(super) async fn aborted(&self) {
        self.abort.cancelled().await
    }

    pub(super) fn set_result(&self, result: InFlightResult) {
        let _ = self.result.set(result);
        self.notify.notify_waiters();
    }

    pub(super) async fn wait(&self) -> InFlightResult {
        loop {
            if let Some(result) = self.result.get() {
                return result.clone();
            }

            let notified = self.notify.notified();
            if let Some(result) = self.result.get() {
                return result.clone();
            }

            notified.await;
        }
    }
}
