//! Stop signal shared between the operator and the acquisition worker.
//!
//! A single binary event. Setting it twice before anyone consumes it is the same as
//! setting it once; consuming it resets it. Exactly one waiter consumes each stop.

use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use tokio::sync::Notify;
use tokio::time::Instant;

/// Single-consumer cancellation event.
#[derive(Debug, Default)]
pub struct StopSignal {
    pending: AtomicBool,
    notify: Notify,
}

impl StopSignal {
    /// New, unset signal.
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the signal. Never blocks.
    pub fn trigger(&self) {
        self.pending.store(true, Ordering::SeqCst);
        self.notify.notify_one();
    }

    /// Whether a stop is pending, without consuming it.
    pub fn is_pending(&self) -> bool {
        self.pending.load(Ordering::SeqCst)
    }

    /// Consume a pending stop. Returns `true` if there was one.
    pub fn try_consume(&self) -> bool {
        self.pending.swap(false, Ordering::SeqCst)
    }

    /// Wait up to `timeout` for a stop. Returns `true` (and consumes it) if one arrived.
    pub async fn wait_timeout(&self, timeout: Duration) -> bool {
        let deadline = Instant::now() + timeout;
        loop {
            let notified = self.notify.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            if self.try_consume() {
                return true;
            }
            if tokio::time::timeout_at(deadline, notified).await.is_err() {
                return self.try_consume();
            }
            if self.try_consume() {
                return true;
            }
            // permit left over from a stop that was already consumed
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    #[tokio::test]
    async fn test_trigger_is_idempotent() {
        let stop = StopSignal::new();
        stop.trigger();
        stop.trigger();
        assert!(stop.try_consume());
        assert!(!stop.try_consume());
    }

    #[tokio::test(start_paused = true)]
    async fn test_wait_times_out_without_stop() {
        let stop = StopSignal::new();
        let start = Instant::now();
        assert!(!stop.wait_timeout(Duration::from_millis(50)).await);
        assert!(start.elapsed() >= Duration::from_millis(50));
    }

    #[tokio::test(start_paused = true)]
    async fn test_wait_wakes_on_trigger() {
        let stop = Arc::new(StopSignal::new());
        let trigger = stop.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(20)).await;
            trigger.trigger();
        });

        let start = Instant::now();
        assert!(stop.wait_timeout(Duration::from_secs(10)).await);
        assert!(start.elapsed() < Duration::from_secs(1));
        assert!(!stop.is_pending());
    }

    #[tokio::test(start_paused = true)]
    async fn test_consumed_stop_does_not_wake_later_waits() {
        let stop = StopSignal::new();
        stop.trigger();
        assert!(stop.try_consume());

        // the stored permit must not count as a new stop
        assert!(!stop.wait_timeout(Duration::from_millis(30)).await);
    }
}
