//! Cooperative cancellation signal shared between a caller and an in-flight call.

use std::sync::Arc;
use std::sync::atomic::{AtomicU8, Ordering};
use std::time::Duration;

use tokio::sync::Notify;
use tokio::task::JoinHandle;

const LIVE: u8 = 0;
const CANCELLED: u8 = 1;
const TIMED_OUT: u8 = 2;

/// Why a token fired.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum CancelReason {
    /// Explicit user request.
    User,
    /// A scheduled deadline elapsed.
    Timeout,
}

#[derive(Clone)]
pub struct CancelToken {
    inner: Arc<CancelState>,
}

struct CancelState {
    state: AtomicU8,
    notify: Notify,
}

impl CancelToken {
    pub fn new() -> Self {
        Self {
            inner: Arc::new(CancelState {
                state: AtomicU8::new(LIVE),
                notify: Notify::new(),
            }),
        }
    }

    pub fn cancel(&self) {
        self.fire(CANCELLED);
    }

    /// Fires the token with [`CancelReason::Timeout`]. A token that already
    /// fired keeps its original reason.
    pub fn expire(&self) {
        self.fire(TIMED_OUT);
    }

    fn fire(&self, code: u8) {
        if self
            .inner
            .state
            .compare_exchange(LIVE, code, Ordering::SeqCst, Ordering::SeqCst)
            .is_ok()
        {
            self.inner.notify.notify_waiters();
        }
    }

    pub fn is_cancelled(&self) -> bool {
        self.inner.state.load(Ordering::SeqCst) != LIVE
    }

    pub fn reason(&self) -> Option<CancelReason> {
        match self.inner.state.load(Ordering::SeqCst) {
            CANCELLED => Some(CancelReason::User),
            TIMED_OUT => Some(CancelReason::Timeout),
            _ => None,
        }
    }

    /// Resolves once the token fires.
    pub async fn cancelled(&self) {
        let notified = self.inner.notify.notified();
        tokio::pin!(notified);
        // Register before checking so a concurrent fire cannot slip between.
        notified.as_mut().enable();
        if self.is_cancelled() {
            return;
        }
        notified.await;
    }

    /// Schedules [`CancelToken::expire`] after `after`. Dropping the returned
    /// guard disarms the timer.
    pub fn expire_after(&self, after: Duration) -> Deadline {
        let token = self.clone();
        let handle = tokio::spawn(async move {
            tokio::time::sleep(after).await;
            token.expire();
        });
        Deadline { handle }
    }
}

impl Default for CancelToken {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for CancelToken {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CancelToken")
            .field("reason", &self.reason())
            .finish()
    }
}

/// Armed timeout for a [`CancelToken`].
pub struct Deadline {
    handle: JoinHandle<()>,
}

impl Drop for Deadline {
    fn drop(&mut self) {
        self.handle.abort();
    }
}
