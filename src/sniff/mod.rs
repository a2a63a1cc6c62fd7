//! Protocol sniffing
//!
//! Read-only inspection of the first bytes of a stream to classify its
//! application protocol and extract the destination domain. A probe either
//! reaches a verdict, asks for more bytes, or rules itself out; the
//! aggregate sniffer keeps feeding the still-hungry probes until one
//! answers or all give up.

mod http;
mod tls;

pub use http::HttpSniffer;
pub use tls::TlsSniffer;

/// A successful classification
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SniffResult {
    /// Detected protocol name ("http", "tls")
    pub protocol: String,
    /// Domain the client addressed (Host header, SNI)
    pub domain: String,
}

/// Outcome of one sniff attempt
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SniffVerdict {
    Ready(SniffResult),
    /// No verdict yet; the prefix seen so far is still compatible
    NeedMore,
    /// The stream cannot match this protocol
    Failed,
}

/// One protocol probe. Stateless: each call re-examines the full prefix.
pub trait ProtocolSniff: Send {
    fn probe(&self, data: &[u8]) -> SniffVerdict;
}

/// Aggregate over all known probes
pub struct Sniffer {
    pending: Vec<Box<dyn ProtocolSniff>>,
}

impl Default for Sniffer {
    fn default() -> Self {
        Self::new()
    }
}

impl Sniffer {
    pub fn new() -> Self {
        Self {
            pending: vec![Box::new(HttpSniffer), Box::new(TlsSniffer)],
        }
    }

    pub fn sniff(&mut self, data: &[u8]) -> SniffVerdict {
        if data.is_empty() {
            return SniffVerdict::NeedMore;
        }

        let mut still_pending = Vec::new();
        for probe in self.pending.drain(..) {
            match probe.probe(data) {
                SniffVerdict::Ready(result) => return SniffVerdict::Ready(result),
                SniffVerdict::NeedMore => still_pending.push(probe),
                SniffVerdict::Failed => {}
            }
        }

        self.pending = still_pending;
        if self.pending.is_empty() {
            SniffVerdict::Failed
        } else {
            SniffVerdict::NeedMore
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_sniffer_detects_http() {
        let mut sniffer = Sniffer::new();
        let verdict = sniffer.sniff(b"GET / HTTP/1.1\r\nHost: example.com\r\n\r\n");
        assert_eq!(
            verdict,
            SniffVerdict::Ready(SniffResult {
                protocol: "http".to_string(),
                domain: "example.com".to_string(),
            })
        );
    }

    #[test]
    fn test_sniffer_needs_more_on_partial_http() {
        let mut sniffer = Sniffer::new();
        assert_eq!(sniffer.sniff(b"GET / HT"), SniffVerdict::NeedMore);
        assert_eq!(
            sniffer.sniff(b"GET / HTTP/1.1\r\nHost: example.com\r\n\r\n"),
            SniffVerdict::Ready(SniffResult {
                protocol: "http".to_string(),
                domain: "example.com".to_string(),
            })
        );
    }

    #[test]
    fn test_sniffer_fails_on_unknown_content() {
        let mut sniffer = Sniffer::new();
        assert_eq!(
            sniffer.sniff(b"\x00\x01\x02\x03 definitely not a handshake"),
            SniffVerdict::Failed
        );
    }

    #[test]
    fn test_failed_probe_is_dropped() {
        let mut sniffer = Sniffer::new();
        // First chunk rules HTTP out but TLS could still match.
        assert_eq!(sniffer.sniff(&[0x16, 0x03]), SniffVerdict::NeedMore);
        assert_eq!(sniffer.pending.len(), 1);
    }
}
