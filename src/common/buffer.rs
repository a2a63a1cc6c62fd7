//! Buffer and MultiBuffer - chunked byte storage for pipe traffic
//!
//! All pipe and link operations move data as `MultiBuffer`s: ordered
//! sequences of fixed-capacity chunks. Chunking amortizes allocation on the
//! hot relay path and gives the sniffer a natural "one buffer" peek window.

use bytes::BytesMut;
use std::collections::VecDeque;

/// Capacity of a single buffer chunk (2KB)
pub const BUFFER_SIZE: usize = 2 * 1024;

/// A single fixed-capacity chunk of bytes
#[derive(Debug, Default)]
pub struct Buffer {
    data: BytesMut,
}

impl Buffer {
    pub fn new() -> Self {
        Self {
            data: BytesMut::with_capacity(BUFFER_SIZE),
        }
    }

    /// Copy up to `BUFFER_SIZE` bytes in. Bytes beyond capacity are not
    /// taken; the caller splits longer payloads across chunks.
    pub fn from_bytes(bytes: &[u8]) -> Self {
        let mut buffer = Self::new();
        buffer.write(bytes);
        buffer
    }

    pub fn len(&self) -> usize {
        self.data.len()
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    pub fn is_full(&self) -> bool {
        self.data.len() >= BUFFER_SIZE
    }

    pub fn bytes(&self) -> &[u8] {
        &self.data
    }

    pub fn clear(&mut self) {
        self.data.clear();
    }

    /// Append as much of `bytes` as capacity allows; returns bytes taken.
    pub fn write(&mut self, bytes: &[u8]) -> usize {
        let n = bytes.len().min(BUFFER_SIZE - self.data.len());
        self.data.extend_from_slice(&bytes[..n]);
        n
    }

    /// Replace contents with up to one chunk's worth of `mb`, without
    /// consuming from `mb`. Used by the sniffer's peek window.
    pub fn fill_from(&mut self, mb: &MultiBuffer) {
        self.data.clear();
        self.data.resize(BUFFER_SIZE, 0);
        let n = mb.copy_to(&mut self.data);
        self.data.truncate(n);
    }
}

/// An ordered sequence of buffer chunks
#[derive(Debug, Default)]
pub struct MultiBuffer {
    chunks: VecDeque<Buffer>,
}

impl MultiBuffer {
    pub fn new() -> Self {
        Self {
            chunks: VecDeque::new(),
        }
    }

    /// Total byte length across all chunks
    pub fn len(&self) -> usize {
        self.chunks.iter().map(Buffer::len).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.chunks.iter().all(Buffer::is_empty)
    }

    /// Append one chunk, skipping empty ones
    pub fn push(&mut self, buffer: Buffer) {
        if !buffer.is_empty() {
            self.chunks.push_back(buffer);
        }
    }

    /// Merge another MultiBuffer onto the tail, preserving chunk order
    pub fn append(&mut self, mut other: MultiBuffer) {
        self.chunks.append(&mut other.chunks);
    }

    /// Copy bytes out in order without consuming; returns bytes copied.
    pub fn copy_to(&self, dst: &mut [u8]) -> usize {
        let mut copied = 0;
        for chunk in &self.chunks {
            if copied == dst.len() {
                break;
            }
            let n = chunk.len().min(dst.len() - copied);
            dst[copied..copied + n].copy_from_slice(&chunk.bytes()[..n]);
            copied += n;
        }
        copied
    }

    /// Flatten into a single contiguous vector (test and adapter helper)
    pub fn to_vec(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(self.len());
        for chunk in &self.chunks {
            out.extend_from_slice(chunk.bytes());
        }
        out
    }

    pub fn pop_front(&mut self) -> Option<Buffer> {
        self.chunks.pop_front()
    }
}

impl From<&[u8]> for MultiBuffer {
    fn from(mut bytes: &[u8]) -> Self {
        let mut mb = MultiBuffer::new();
        while !bytes.is_empty() {
            let mut buffer = Buffer::new();
            let n = buffer.write(bytes);
            mb.push(buffer);
            bytes = &bytes[n..];
        }
        mb
    }
}

impl From<Vec<u8>> for MultiBuffer {
    fn from(bytes: Vec<u8>) -> Self {
        MultiBuffer::from(bytes.as_slice())
    }
}

impl IntoIterator for MultiBuffer {
    type Item = Buffer;
    type IntoIter = std::collections::vec_deque::IntoIter<Buffer>;

    fn into_iter(self) -> Self::IntoIter {
        self.chunks.into_iter()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_buffer_capacity() {
        let mut buffer = Buffer::new();
        let n = buffer.write(&[0u8; BUFFER_SIZE + 100]);
        assert_eq!(n, BUFFER_SIZE);
        assert!(buffer.is_full());
    }

    #[test]
    fn test_multibuffer_chunking() {
        let payload = vec![7u8; BUFFER_SIZE * 2 + 10];
        let mb = MultiBuffer::from(payload.as_slice());
        assert_eq!(mb.len(), payload.len());
        assert_eq!(mb.to_vec(), payload);
    }

    #[test]
    fn test_multibuffer_append_preserves_order() {
        let mut a = MultiBuffer::from(&b"hello "[..]);
        let b = MultiBuffer::from(&b"world"[..]);
        a.append(b);
        assert_eq!(a.to_vec(), b"hello world");
    }

    #[test]
    fn test_copy_to_is_non_destructive() {
        let mb = MultiBuffer::from(&b"abcdef"[..]);
        let mut dst = [0u8; 4];
        assert_eq!(mb.copy_to(&mut dst), 4);
        assert_eq!(&dst, b"abcd");
        assert_eq!(mb.len(), 6);
    }

    #[test]
    fn test_fill_from() {
        let mb = MultiBuffer::from(&b"peek this"[..]);
        let mut scratch = Buffer::new();
        scratch.fill_from(&mb);
        assert_eq!(scratch.bytes(), b"peek this");
    }
}
