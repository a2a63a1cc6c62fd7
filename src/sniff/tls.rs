//! TLS ClientHello SNI sniffing

use super::{ProtocolSniff, SniffResult, SniffVerdict};

const CONTENT_TYPE_HANDSHAKE: u8 = 0x16;
const HANDSHAKE_TYPE_CLIENT_HELLO: u8 = 0x01;
const EXTENSION_SERVER_NAME: u16 = 0x0000;
const SERVER_NAME_TYPE_HOST: u8 = 0x00;

/// Detects TLS ClientHello records and extracts the SNI host name.
pub struct TlsSniffer;

impl ProtocolSniff for TlsSniffer {
    fn probe(&self, data: &[u8]) -> SniffVerdict {
        if data.is_empty() {
            return SniffVerdict::NeedMore;
        }
        if data[0] != CONTENT_TYPE_HANDSHAKE {
            return SniffVerdict::Failed;
        }
        if data.len() < 5 {
            return SniffVerdict::NeedMore;
        }
        if data[1] != 0x03 {
            return SniffVerdict::Failed;
        }

        let record_len = u16::from_be_bytes([data[3], data[4]]) as usize;
        let available = &data[5..];
        let complete = available.len() >= record_len;
        let body = &available[..record_len.min(available.len())];

        match sni_from_client_hello(body) {
            Parse::Found(domain) => SniffVerdict::Ready(SniffResult {
                protocol: "tls".to_string(),
                domain,
            }),
            Parse::NoSni | Parse::Malformed => SniffVerdict::Failed,
            Parse::Truncated => {
                if complete {
                    SniffVerdict::Failed
                } else {
                    SniffVerdict::NeedMore
                }
            }
        }
    }
}

enum Parse {
    Found(String),
    NoSni,
    Malformed,
    Truncated,
}

struct Cursor<'a> {
    data: &'a [u8],
    pos: usize,
}

impl<'a> Cursor<'a> {
    fn take(&mut self, n: usize) -> Option<&'a [u8]> {
        let slice = self.data.get(self.pos..self.pos + n)?;
        self.pos += n;
        Some(slice)
    }

    fn u8(&mut self) -> Option<u8> {
        self.take(1).map(|b| b[0])
    }

    fn u16(&mut self) -> Option<u16> {
        self.take(2).map(|b| u16::from_be_bytes([b[0], b[1]]))
    }

    fn remaining(&self) -> usize {
        self.data.len() - self.pos
    }
}

fn sni_from_client_hello(body: &[u8]) -> Parse {
    let mut c = Cursor { data: body, pos: 0 };

    let Some(hs_type) = c.u8() else {
        return Parse::Truncated;
    };
    if hs_type != HANDSHAKE_TYPE_CLIENT_HELLO {
        return Parse::Malformed;
    }

    // Handshake length (u24), protocol version, random.
    if c.take(3).is_none() || c.take(2).is_none() || c.take(32).is_none() {
        return Parse::Truncated;
    }

    let Some(session_id_len) = c.u8() else {
        return Parse::Truncated;
    };
    if c.take(session_id_len as usize).is_none() {
        return Parse::Truncated;
    }

    let Some(cipher_len) = c.u16() else {
        return Parse::Truncated;
    };
    if cipher_len % 2 != 0 {
        return Parse::Malformed;
    }
    if c.take(cipher_len as usize).is_none() {
        return Parse::Truncated;
    }

    let Some(compression_len) = c.u8() else {
        return Parse::Truncated;
    };
    if c.take(compression_len as usize).is_none() {
        return Parse::Truncated;
    }

    if c.remaining() == 0 {
        return Parse::NoSni;
    }
    let Some(extensions_len) = c.u16() else {
        return Parse::Truncated;
    };
    let mut left = extensions_len as usize;

    while left >= 4 {
        let (Some(ext_type), Some(ext_len)) = (c.u16(), c.u16()) else {
            return Parse::Truncated;
        };
        let Some(ext_data) = c.take(ext_len as usize) else {
            return Parse::Truncated;
        };
        left = left.saturating_sub(4 + ext_len as usize);

        if ext_type == EXTENSION_SERVER_NAME {
            return sni_from_extension(ext_data);
        }
    }

    Parse::NoSni
}

fn sni_from_extension(data: &[u8]) -> Parse {
    let mut c = Cursor { data, pos: 0 };
    let Some(list_len) = c.u16() else {
        return Parse::Truncated;
    };
    let mut left = list_len as usize;

    while left >= 3 {
        let (Some(name_type), Some(name_len)) = (c.u8(), c.u16()) else {
            return Parse::Truncated;
        };
        let Some(name) = c.take(name_len as usize) else {
            return Parse::Truncated;
        };
        left = left.saturating_sub(3 + name_len as usize);

        if name_type == SERVER_NAME_TYPE_HOST {
            return match std::str::from_utf8(name) {
                Ok(host) if !host.is_empty() => Parse::Found(host.to_string()),
                _ => Parse::Malformed,
            };
        }
    }

    Parse::NoSni
}

#[cfg(test)]
mod tests {
    use super::*;

    /// Handcraft a minimal ClientHello record carrying one SNI entry.
    fn client_hello(sni: Option<&str>) -> Vec<u8> {
        let mut body = Vec::new();
        body.extend_from_slice(&[0x03, 0x03]); // client version
        body.extend_from_slice(&[0u8; 32]); // random
        body.push(0); // session id
        body.extend_from_slice(&[0x00, 0x02, 0x13, 0x01]); // one cipher suite
        body.extend_from_slice(&[0x01, 0x00]); // null compression

        let mut extensions = Vec::new();
        if let Some(host) = sni {
            let name = host.as_bytes();
            let mut entry = vec![SERVER_NAME_TYPE_HOST];
            entry.extend_from_slice(&(name.len() as u16).to_be_bytes());
            entry.extend_from_slice(name);

            let mut list = (entry.len() as u16).to_be_bytes().to_vec();
            list.extend_from_slice(&entry);

            extensions.extend_from_slice(&EXTENSION_SERVER_NAME.to_be_bytes());
            extensions.extend_from_slice(&(list.len() as u16).to_be_bytes());
            extensions.extend_from_slice(&list);
        }
        body.extend_from_slice(&(extensions.len() as u16).to_be_bytes());
        body.extend_from_slice(&extensions);

        let mut handshake = vec![HANDSHAKE_TYPE_CLIENT_HELLO];
        handshake.extend_from_slice(&(body.len() as u32).to_be_bytes()[1..]); // u24
        handshake.extend_from_slice(&body);

        let mut record = vec![CONTENT_TYPE_HANDSHAKE, 0x03, 0x01];
        record.extend_from_slice(&(handshake.len() as u16).to_be_bytes());
        record.extend_from_slice(&handshake);
        record
    }

    #[test]
    fn test_extracts_sni() {
        let verdict = TlsSniffer.probe(&client_hello(Some("example.com")));
        assert_eq!(
            verdict,
            SniffVerdict::Ready(SniffResult {
                protocol: "tls".to_string(),
                domain: "example.com".to_string(),
            })
        );
    }

    #[test]
    fn test_truncated_hello_needs_more() {
        let full = client_hello(Some("example.com"));
        for cut in [1usize, 4, 10, full.len() - 1] {
            assert_eq!(
                TlsSniffer.probe(&full[..cut]),
                SniffVerdict::NeedMore,
                "cut at {}",
                cut
            );
        }
    }

    #[test]
    fn test_hello_without_sni_fails() {
        assert_eq!(TlsSniffer.probe(&client_hello(None)), SniffVerdict::Failed);
    }

    #[test]
    fn test_not_tls_fails() {
        assert_eq!(TlsSniffer.probe(b"GET / HTTP/1.1\r\n"), SniffVerdict::Failed);
        assert_eq!(TlsSniffer.probe(&[0x16, 0x01, 0x00, 0x00, 0x00]), SniffVerdict::Failed);
    }
}
