//! HTTP Host header sniffing

use super::{ProtocolSniff, SniffResult, SniffVerdict};

const METHODS: [&str; 9] = [
    "GET", "POST", "PUT", "HEAD", "DELETE", "OPTIONS", "PATCH", "CONNECT", "TRACE",
];

/// Detects HTTP/1.x requests and extracts the Host header.
pub struct HttpSniffer;

impl ProtocolSniff for HttpSniffer {
    fn probe(&self, data: &[u8]) -> SniffVerdict {
        let Ok(text) = std::str::from_utf8(data) else {
            return SniffVerdict::Failed;
        };

        if !method_prefix_matches(text) {
            return SniffVerdict::Failed;
        }

        // Only complete lines are trustworthy; the last fragment may still
        // be arriving.
        let complete = match text.rfind("\r\n") {
            Some(end) => &text[..end],
            None => return SniffVerdict::NeedMore,
        };
        let headers_done = text.contains("\r\n\r\n");

        for line in complete.split("\r\n").skip(1) {
            if line.is_empty() {
                break;
            }
            let Some((name, value)) = line.split_once(':') else {
                return SniffVerdict::Failed;
            };
            if name.eq_ignore_ascii_case("host") {
                let host = strip_port(value.trim());
                if host.is_empty() {
                    return SniffVerdict::Failed;
                }
                return SniffVerdict::Ready(SniffResult {
                    protocol: "http".to_string(),
                    domain: host.to_string(),
                });
            }
        }

        if headers_done {
            // Headers ended without a Host line.
            SniffVerdict::Failed
        } else {
            SniffVerdict::NeedMore
        }
    }
}

/// True while the data could still begin with a known method token.
fn method_prefix_matches(text: &str) -> bool {
    let token = match text.find(' ') {
        Some(pos) => return METHODS.contains(&&text[..pos]),
        None => text,
    };
    METHODS.iter().any(|m| m.starts_with(token))
}

/// Strip a trailing port, handling bracketed IPv6 hosts.
fn strip_port(host: &str) -> &str {
    if host.starts_with('[') {
        if let Some(end) = host.find(']') {
            return &host[1..end];
        }
    }
    if let Some(pos) = host.rfind(':') {
        let port = &host[pos + 1..];
        if !port.is_empty() && port.chars().all(|c| c.is_ascii_digit()) {
            return &host[..pos];
        }
    }
    host
}
