//! Proxy flow records and the persistence sink

use std::sync::atomic::{AtomicI32, AtomicI64, Ordering};
use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};

use parking_lot::Mutex;

/// Record type: plain TCP/UDP flow
pub const RECORD_TYPE_FLOW: i32 = 0;
/// Record type: DNS transaction
pub const RECORD_TYPE_DNS: i32 = 1;

/// Accumulating record of one proxied flow, persisted on completion.
///
/// Target and tag change after creation (sniff override, route selection),
/// byte counters accumulate from the stat writers, so the shared record uses
/// interior mutability throughout.
#[derive(Debug)]
pub struct ProxyRecord {
    target: Mutex<String>,
    tag: Mutex<String>,
    start_time: i64,
    end_time: AtomicI64,
    upload_bytes: AtomicI32,
    download_bytes: AtomicI32,
    pub record_type: i32,
    pub dns_query_type: i32,
    pub dns_request: String,
    pub dns_response: String,
    pub dns_num_ips: i32,
}

impl ProxyRecord {
    pub fn new(target: impl Into<String>) -> Self {
        Self {
            target: Mutex::new(target.into()),
            tag: Mutex::new(String::new()),
            start_time: unix_nanos(),
            end_time: AtomicI64::new(0),
            upload_bytes: AtomicI32::new(0),
            download_bytes: AtomicI32::new(0),
            record_type: RECORD_TYPE_FLOW,
            dns_query_type: 0,
            dns_request: String::new(),
            dns_response: String::new(),
            dns_num_ips: 0,
        }
    }

    pub fn set_target(&self, target: impl Into<String>) {
        *self.target.lock() = target.into();
    }

    pub fn target(&self) -> String {
        self.target.lock().clone()
    }

    pub fn set_tag(&self, tag: impl Into<String>) {
        *self.tag.lock() = tag.into();
    }

    pub fn tag(&self) -> String {
        self.tag.lock().clone()
    }

    pub fn start_time(&self) -> i64 {
        self.start_time
    }

    pub fn add_upload_bytes(&self, n: i32) {
        self.upload_bytes.fetch_add(n, Ordering::Relaxed);
    }

    pub fn add_download_bytes(&self, n: i32) {
        self.download_bytes.fetch_add(n, Ordering::Relaxed);
    }

    pub fn upload_bytes(&self) -> i32 {
        self.upload_bytes.load(Ordering::Relaxed)
    }

    pub fn download_bytes(&self) -> i32 {
        self.download_bytes.load(Ordering::Relaxed)
    }
}

fn unix_nanos() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_nanos() as i64)
        .unwrap_or(0)
}

/// Persistence backend for completed flow records
pub trait DbService: Send + Sync {
    #[allow(clippy::too_many_arguments)]
    fn insert_proxy_log(
        &self,
        target: &str,
        tag: &str,
        start_time: i64,
        end_time: i64,
        upload_bytes: i32,
        download_bytes: i32,
        record_type: i32,
        dns_query_type: i32,
        dns_request: &str,
        dns_response: &str,
        dns_num_ips: i32,
    );
}

/// Serialized gateway in front of a `DbService`. Inserts happen one at a
/// time; the backing store is not required to be concurrency-safe.
pub struct ProxyLogSink {
    db: Arc<dyn DbService>,
    gate: Mutex<()>,
}

impl ProxyLogSink {
    pub fn new(db: Arc<dyn DbService>) -> Self {
        Self {
            db,
            gate: Mutex::new(()),
        }
    }

    /// Stamp the record's end time and hand it to the backend.
    pub fn insert(&self, record: &ProxyRecord) {
        record.end_time.store(unix_nanos(), Ordering::Relaxed);

        let _guard = self.gate.lock();
        self.db.insert_proxy_log(
            &record.target(),
            &record.tag(),
            record.start_time,
            record.end_time.load(Ordering::Relaxed),
            record.upload_bytes(),
            record.download_bytes(),
            record.record_type,
            record.dns_query_type,
            &record.dns_request,
            &record.dns_response,
            record.dns_num_ips,
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use parking_lot::Mutex as PlMutex;

    #[derive(Default)]
    struct CapturingDb {
        rows: PlMutex<Vec<(String, String, i32, i32)>>,
    }

    impl DbService for CapturingDb {
        fn insert_proxy_log(
            &self,
            target: &str,
            tag: &str,
            _start_time: i64,
            _end_time: i64,
            upload_bytes: i32,
            download_bytes: i32,
            _record_type: i32,
            _dns_query_type: i32,
            _dns_request: &str,
            _dns_response: &str,
            _dns_num_ips: i32,
        ) {
            self.rows.lock().push((
                target.to_string(),
                tag.to_string(),
                upload_bytes,
                download_bytes,
            ));
        }
    }

    #[test]
    fn test_record_accumulates() {
        let record = ProxyRecord::new("tcp:example.com:443");
        record.add_upload_bytes(100);
        record.add_upload_bytes(50);
        record.add_download_bytes(7);
        assert_eq!(record.upload_bytes(), 150);
        assert_eq!(record.download_bytes(), 7);
    }

    #[test]
    fn test_sink_inserts_final_state() {
        let db = Arc::new(CapturingDb::default());
        let sink = ProxyLogSink::new(db.clone());

        let record = ProxyRecord::new("tcp:1.2.3.4:443");
        record.set_target("tcp:example.com:443");
        record.set_tag("proxy");
        record.add_upload_bytes(42);
        sink.insert(&record);

        let rows = db.rows.lock();
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].0, "tcp:example.com:443");
        assert_eq!(rows[0].1, "proxy");
        assert_eq!(rows[0].2, 42);
    }
}
