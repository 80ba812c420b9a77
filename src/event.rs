//! Level-triggered signal flags for loop coordination.
//!
//! Every background loop in this crate (link receiver, keep-alive,
//! acquisition, metadata, registry reconciliation) waits on binary flags
//! with a bounded poll interval so that stop requests are observed within
//! one poll period. `Event` packages that pattern: an atomic flag plus a
//! `Notify` for low-latency wakeup, with reset-after-observe left to the
//! caller (`wait_timeout` does not clear the flag).

use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;
use tokio::sync::Notify;
use tokio::time::{timeout, Instant};

/// A level-triggered flag that tasks can wait on with a bounded timeout.
#[derive(Debug, Default)]
pub struct Event {
    flag: AtomicBool,
    notify: Notify,
}

impl Event {
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the flag and wake any waiter.
    pub fn set(&self) {
        self.flag.store(true, Ordering::Release);
        self.notify.notify_waiters();
        // Also leave a permit so a waiter that registers just after the
        // notify_waiters call still wakes promptly.
        self.notify.notify_one();
    }

    /// Clear the flag. Pending wakeups may still fire; waiters re-check
    /// the flag, so a cleared event never reports itself as set.
    pub fn clear(&self) {
        self.flag.store(false, Ordering::Release);
    }

    pub fn is_set(&self) -> bool {
        self.flag.load(Ordering::Acquire)
    }

    /// Wait until the flag is set or `dur` elapses. Returns whether the
    /// flag was set. The flag is not cleared by waiting.
    pub async fn wait_timeout(&self, dur: Duration) -> bool {
        let deadline = Instant::now() + dur;
        loop {
            if self.is_set() {
                return true;
            }
            let now = Instant::now();
            if now >= deadline {
                return false;
            }
            let notified = self.notify.notified();
            if timeout(deadline - now, notified).await.is_err() {
                return self.is_set();
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    #[tokio::test]
    async fn test_set_before_wait() {
        let ev = Event::new();
        ev.set();
        assert!(ev.wait_timeout(Duration::from_millis(10)).await);
        // Not cleared by observing.
        assert!(ev.is_set());
    }

    #[tokio::test]
    async fn test_wait_times_out_when_clear() {
        let ev = Event::new();
        assert!(!ev.wait_timeout(Duration::from_millis(20)).await);
    }

    #[tokio::test]
    async fn test_set_wakes_waiter() {
        let ev = Arc::new(Event::new());
        let ev2 = ev.clone();
        let waiter = tokio::spawn(async move { ev2.wait_timeout(Duration::from_secs(5)).await });
        tokio::time::sleep(Duration::from_millis(10)).await;
        ev.set();
        assert!(waiter.await.unwrap());
    }

    #[tokio::test]
    async fn test_clear_resets() {
        let ev = Event::new();
        ev.set();
        ev.clear();
        assert!(!ev.is_set());
        assert!(!ev.wait_timeout(Duration::from_millis(20)).await);
    }
}
