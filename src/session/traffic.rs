//! Traffic sessions and the session tracker

use std::collections::HashMap;
use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use tracing::debug;

use super::Content;
use crate::common::Done;

/// Live traffic counters and metadata for one flow, shared between the stat
/// writers and the tracker.
#[derive(Debug)]
pub struct TrafficSession {
    upload_bytes: AtomicI64,
    download_bytes: AtomicI64,
    pub application: Vec<String>,
    pub network: String,
    pub local_addr: String,
    remote_addr: Mutex<String>,
    pub begin_time: Instant,
    extra: Mutex<String>,
    outbound_tag: Mutex<String>,
}

impl TrafficSession {
    pub fn from_content(content: &Content) -> Self {
        Self {
            upload_bytes: AtomicI64::new(0),
            download_bytes: AtomicI64::new(0),
            application: content.application.clone(),
            network: content.network.clone(),
            local_addr: content.local_addr.clone(),
            remote_addr: Mutex::new(content.remote_addr.clone()),
            begin_time: Instant::now(),
            extra: Mutex::new(content.extra.clone()),
            outbound_tag: Mutex::new(String::new()),
        }
    }

    pub fn add_upload_bytes(&self, n: i64) {
        self.upload_bytes.fetch_add(n, Ordering::Relaxed);
    }

    pub fn add_download_bytes(&self, n: i64) {
        self.download_bytes.fetch_add(n, Ordering::Relaxed);
    }

    pub fn upload_bytes(&self) -> i64 {
        self.upload_bytes.load(Ordering::Relaxed)
    }

    pub fn download_bytes(&self) -> i64 {
        self.download_bytes.load(Ordering::Relaxed)
    }

    pub fn set_remote_addr(&self, addr: impl Into<String>) {
        *self.remote_addr.lock() = addr.into();
    }

    pub fn remote_addr(&self) -> String {
        self.remote_addr.lock().clone()
    }

    pub fn set_extra(&self, extra: impl Into<String>) {
        *self.extra.lock() = extra.into();
    }

    pub fn extra(&self) -> String {
        self.extra.lock().clone()
    }

    pub fn set_outbound_tag(&self, tag: impl Into<String>) {
        *self.outbound_tag.lock() = tag.into();
    }

    pub fn outbound_tag(&self) -> String {
        self.outbound_tag.lock().clone()
    }
}

/// Registry of live traffic sessions, keyed by outbound link id.
///
/// While started, a background task periodically logs a summary of active
/// sessions.
pub struct SessionTracker {
    sessions: Arc<Mutex<HashMap<u64, Arc<TrafficSession>>>>,
    shutdown: Mutex<Option<Arc<Done>>>,
    summary_interval: Duration,
}

impl Default for SessionTracker {
    fn default() -> Self {
        Self::new()
    }
}

impl SessionTracker {
    pub fn new() -> Self {
        Self {
            sessions: Arc::new(Mutex::new(HashMap::new())),
            shutdown: Mutex::new(None),
            summary_interval: Duration::from_secs(30),
        }
    }

    pub fn start(&self) {
        let mut shutdown = self.shutdown.lock();
        if shutdown.is_some() {
            return;
        }
        let done = Arc::new(Done::new());
        *shutdown = Some(done.clone());

        let sessions = self.sessions.clone();
        let interval = self.summary_interval;
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = tokio::time::sleep(interval) => {}
                    _ = done.wait() => return,
                }
                let (count, up, down) = {
                    let sessions = sessions.lock();
                    let up: i64 = sessions.values().map(|s| s.upload_bytes()).sum();
                    let down: i64 = sessions.values().map(|s| s.download_bytes()).sum();
                    (sessions.len(), up, down)
                };
                debug!("{} active sessions ({}B up, {}B down)", count, up, down);
            }
        });
    }

    pub fn stop(&self) {
        if let Some(done) = self.shutdown.lock().take() {
            done.close();
        }
    }

    pub fn add_session(&self, key: u64, session: Arc<TrafficSession>) {
        self.sessions.lock().insert(key, session);
    }

    pub fn remove_session(&self, key: u64) {
        self.sessions.lock().remove(&key);
    }

    pub fn session_count(&self) -> usize {
        self.sessions.lock().len()
    }
}
