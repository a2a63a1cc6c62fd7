//! Inactivity timer for connection entries

use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use tokio::time::Instant;

use super::signal::Done;

/// Fires a callback once after `timeout` of inactivity. Each `update` pushes
/// the deadline out; `stop` cancels the timer without firing.
pub struct ActivityTimer {
    last: Arc<Mutex<Instant>>,
    stop: Arc<Done>,
}

impl ActivityTimer {
    pub fn new<F>(timeout: Duration, on_expire: F) -> Self
    where
        F: FnOnce() + Send + 'static,
    {
        let last = Arc::new(Mutex::new(Instant::now()));
        let stop = Arc::new(Done::new());

        let task_last = last.clone();
        let task_stop = stop.clone();
        tokio::spawn(async move {
            let mut on_expire = Some(on_expire);
            loop {
                let deadline = *task_last.lock() + timeout;
                if Instant::now() >= deadline {
                    if let Some(f) = on_expire.take() {
                        f();
                    }
                    return;
                }
                tokio::select! {
                    _ = tokio::time::sleep_until(deadline) => {}
                    _ = task_stop.wait() => return,
                }
            }
        });

        Self { last, stop }
    }

    /// Record activity, pushing the expiry out by the full timeout.
    pub fn update(&self) {
        *self.last.lock() = Instant::now();
    }

    /// Cancel the timer; the callback will not fire.
    pub fn stop(&self) {
        self.stop.close();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicBool, Ordering};

    #[tokio::test]
    async fn test_timer_fires_after_inactivity() {
        let fired = Arc::new(AtomicBool::new(false));
        let flag = fired.clone();
        let _timer = ActivityTimer::new(Duration::from_millis(30), move || {
            flag.store(true, Ordering::SeqCst);
        });
        tokio::time::sleep(Duration::from_millis(100)).await;
        assert!(fired.load(Ordering::SeqCst));
    }

    #[tokio::test]
    async fn test_update_defers_expiry() {
        let fired = Arc::new(AtomicBool::new(false));
        let flag = fired.clone();
        let timer = ActivityTimer::new(Duration::from_millis(80), move || {
            flag.store(true, Ordering::SeqCst);
        });
        for _ in 0..4 {
            tokio::time::sleep(Duration::from_millis(40)).await;
            timer.update();
        }
        assert!(!fired.load(Ordering::SeqCst));
        tokio::time::sleep(Duration::from_millis(200)).await;
        assert!(fired.load(Ordering::SeqCst));
    }

    #[tokio::test]
    async fn test_stop_prevents_firing() {
        let fired = Arc::new(AtomicBool::new(false));
        let flag = fired.clone();
        let timer = ActivityTimer::new(Duration::from_millis(30), move || {
            flag.store(true, Ordering::SeqCst);
        });
        timer.stop();
        tokio::time::sleep(Duration::from_millis(100)).await;
        assert!(!fired.load(Ordering::SeqCst));
    }
}
