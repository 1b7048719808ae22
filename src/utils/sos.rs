//! Signal-of-Stop: cooperative cancellation primitive.
//!
//! Every session and transferer owns one. Cancelling is synchronous and
//! idempotent: the first call flips the flag and wakes all waiters, later
//! calls are no-ops. Handlers registered on channels and peer connections
//! check the flag before doing any work, so nothing fires after cancel.

use std::future::Future;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use tokio::sync::Notify;

/// A cooperative cancellation token.
///
/// Clones share the same underlying state, so cancelling any clone
/// notifies all waiters.
#[derive(Debug, Default, Clone)]
pub struct SignalOfStop {
    internal: Arc<SharedState>,
}

#[derive(Debug, Default)]
struct SharedState {
    closing: AtomicBool,
    notify: Notify,
}

impl SignalOfStop {
    pub fn new() -> Self {
        Self::default()
    }

    /// Signal cancellation. Returns `true` only for the call that actually
    /// performed the transition.
    pub fn cancel(&self) -> bool {
        if self.internal.closing.swap(true, Ordering::AcqRel) {
            return false;
        }
        self.internal.notify.notify_waiters();
        true
    }

    pub fn cancelled(&self) -> bool {
        self.internal.closing.load(Ordering::Acquire)
    }

    /// Wait for cancellation; returns immediately if already cancelled.
    pub async fn wait(&self) {
        let notified = self.internal.notify.notified();
        tokio::pin!(notified);
        notified.as_mut().enable();
        if self.cancelled() {
            return;
        }
        notified.await;
    }

    /// Race a future against cancellation.
    ///
    /// Returns `Some(T)` if the future completes first, `None` if
    /// cancellation is signaled first.
    pub async fn select<F, T>(&self, fut: F) -> Option<T>
    where
        F: Future<Output = T>,
    {
        tokio::select! {
            res = fut => Some(res),
            _ = self.wait() => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[test]
    fn cancel_is_idempotent() {
        let sos = SignalOfStop::new();
        assert!(!sos.cancelled());
        assert!(sos.cancel());
        assert!(!sos.cancel());
        assert!(sos.cancelled());
    }

    #[tokio::test]
    async fn clones_observe_cancel() {
        let sos = SignalOfStop::new();
        let clone = sos.clone();
        let waiter = tokio::spawn(async move { clone.wait().await });
        tokio::time::sleep(Duration::from_millis(10)).await;
        sos.cancel();
        tokio::time::timeout(Duration::from_secs(1), waiter)
            .await
            .unwrap()
            .unwrap();
    }

    #[tokio::test]
    async fn select_prefers_cancellation() {
        let sos = SignalOfStop::new();
        sos.cancel();
        let out = sos
            .select(tokio::time::sleep(Duration::from_secs(10)))
            .await;
        assert!(out.is_none());

        let live = SignalOfStop::new();
        assert_eq!(live.select(async { 7 }).await, Some(7));
    }
}
