//! One-shot done signal shared between tasks

use std::sync::atomic::{AtomicBool, Ordering};

use tokio::sync::Notify;

/// A latched close signal: once closed it stays closed, and every current
/// and future waiter observes it. Waking is edge-triggered; `wait` rechecks
/// the flag so spurious wakeups are harmless.
#[derive(Debug, Default)]
pub struct Done {
    closed: AtomicBool,
    notify: Notify,
}

impl Done {
    pub fn new() -> Self {
        Self::default()
    }

    /// Latch the signal. Idempotent.
    pub fn close(&self) {
        self.closed.store(true, Ordering::SeqCst);
        self.notify.notify_waiters();
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    /// Wait until the signal is closed.
    pub async fn wait(&self) {
        loop {
            let notified = self.notify.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();
            if self.is_closed() {
                return;
            }
            notified.await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    #[tokio::test]
    async fn test_done_wakes_waiter() {
        let done = Arc::new(Done::new());
        let waiter = {
            let done = done.clone();
            tokio::spawn(async move { done.wait().await })
        };
        tokio::task::yield_now().await;
        done.close();
        waiter.await.unwrap();
        assert!(done.is_closed());
    }

    #[tokio::test]
    async fn test_close_before_wait() {
        let done = Done::new();
        done.close();
        done.close();
        done.wait().await;
    }
}
