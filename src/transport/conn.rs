//! Pipe-backed connection adapter
//!
//! `LinkConn` turns one side of a pipe pair into a `tokio::io` stream so
//! byte-oriented code (probe writers, TLS handshakes) can run against an
//! in-memory flow. Used by latency measurement, which always builds it over
//! unbounded pipes.

use std::future::Future;
use std::io;
use std::pin::Pin;
use std::task::{Context, Poll};

use bytes::{Buf, BytesMut};
use futures_util::FutureExt;
use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};

use crate::common::{Error, MultiBuffer};
use crate::transport::pipe::{PipeReader, PipeWriter};

type ReadFut = Pin<Box<dyn Future<Output = crate::common::Result<MultiBuffer>> + Send>>;
type WriteFut = Pin<Box<dyn Future<Output = crate::common::Result<()>> + Send>>;

/// `AsyncRead`/`AsyncWrite` over a (reader, writer) pipe endpoint pair
pub struct LinkConn {
    reader: PipeReader,
    writer: PipeWriter,
    pending: BytesMut,
    eof: bool,
    read_fut: Option<ReadFut>,
    write_fut: Option<(WriteFut, usize)>,
}

impl LinkConn {
    pub fn new(reader: PipeReader, writer: PipeWriter) -> Self {
        Self {
            reader,
            writer,
            pending: BytesMut::new(),
            eof: false,
            read_fut: None,
            write_fut: None,
        }
    }

    fn io_error(e: Error) -> io::Error {
        match e {
            Error::Io(inner) => inner,
            Error::EndOfStream => io::Error::new(io::ErrorKind::UnexpectedEof, e.to_string()),
            other => io::Error::new(io::ErrorKind::ConnectionAborted, other.to_string()),
        }
    }

    /// Drive an in-flight write to completion, if any.
    fn poll_write_fut(&mut self, cx: &mut Context<'_>) -> Poll<io::Result<usize>> {
        if let Some((fut, len)) = self.write_fut.as_mut() {
            let n = *len;
            match fut.poll_unpin(cx) {
                Poll::Ready(Ok(())) => {
                    self.write_fut = None;
                    Poll::Ready(Ok(n))
                }
                Poll::Ready(Err(e)) => {
                    self.write_fut = None;
                    Poll::Ready(Err(Self::io_error(e)))
                }
                Poll::Pending => Poll::Pending,
            }
        } else {
            Poll::Ready(Ok(0))
        }
    }
}

impl AsyncRead for LinkConn {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        let this = self.get_mut();
        loop {
            if !this.pending.is_empty() {
                let n = this.pending.len().min(buf.remaining());
                buf.put_slice(&this.pending[..n]);
                this.pending.advance(n);
                return Poll::Ready(Ok(()));
            }
            if this.eof {
                return Poll::Ready(Ok(()));
            }

            let fut = this.read_fut.get_or_insert_with(|| {
                let reader = this.reader.clone();
                Box::pin(async move { reader.read_multi_buffer().await })
            });
            match fut.poll_unpin(cx) {
                Poll::Ready(result) => {
                    this.read_fut = None;
                    match result {
                        Ok(mb) => {
                            for chunk in mb {
                                this.pending.extend_from_slice(chunk.bytes());
                            }
                        }
                        Err(Error::EndOfStream) => this.eof = true,
                        Err(e) => return Poll::Ready(Err(Self::io_error(e))),
                    }
                }
                Poll::Pending => return Poll::Pending,
            }
        }
    }
}

impl AsyncWrite for LinkConn {
    fn poll_write(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        let this = self.get_mut();
        if this.write_fut.is_some() {
            // Finish the previous chunk first; the caller re-submits the
            // same data after a Pending, and its length was recorded.
            return this.poll_write_fut(cx);
        }
        if buf.is_empty() {
            return Poll::Ready(Ok(0));
        }
        let mb = MultiBuffer::from(buf);
        let writer = this.writer.clone();
        this.write_fut = Some((
            Box::pin(async move { writer.write_multi_buffer(mb).await }),
            buf.len(),
        ));
        this.poll_write_fut(cx)
    }

    fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        let this = self.get_mut();
        match this.poll_write_fut(cx) {
            Poll::Ready(Ok(_)) => Poll::Ready(Ok(())),
            Poll::Ready(Err(e)) => Poll::Ready(Err(e)),
            Poll::Pending => Poll::Pending,
        }
    }

    fn poll_shutdown(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        let this = self.get_mut();
        match this.poll_write_fut(cx) {
            Poll::Ready(_) => {
                this.writer.close();
                Poll::Ready(Ok(()))
            }
            Poll::Pending => Poll::Pending,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::pipe::{new_pipe, PipeOptions};
    use tokio::io::{AsyncReadExt, AsyncWriteExt};

    #[tokio::test]
    async fn test_conn_write_reaches_pipe() {
        let (up_r, up_w) = new_pipe(PipeOptions::unbounded());
        let (down_r, _down_w) = new_pipe(PipeOptions::unbounded());
        let mut conn = LinkConn::new(down_r, up_w);

        conn.write_all(b"probe").await.unwrap();
        conn.flush().await.unwrap();

        let mb = up_r.read_multi_buffer().await.unwrap();
        assert_eq!(mb.to_vec(), b"probe");
    }

    #[tokio::test]
    async fn test_conn_read_from_pipe() {
        let (_up_r, up_w) = new_pipe(PipeOptions::unbounded());
        let (down_r, down_w) = new_pipe(PipeOptions::unbounded());
        let mut conn = LinkConn::new(down_r, up_w);

        down_w
            .write_multi_buffer(MultiBuffer::from(&b"response"[..]))
            .await
            .unwrap();

        let mut buf = [0u8; 3];
        conn.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"res");
        let mut rest = [0u8; 5];
        conn.read_exact(&mut rest).await.unwrap();
        assert_eq!(&rest, b"ponse");
    }

    #[tokio::test]
    async fn test_conn_eof_after_close() {
        let (_up_r, up_w) = new_pipe(PipeOptions::unbounded());
        let (down_r, down_w) = new_pipe(PipeOptions::unbounded());
        let mut conn = LinkConn::new(down_r, up_w);

        down_w.close();
        let mut buf = [0u8; 8];
        assert_eq!(conn.read(&mut buf).await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_conn_shutdown_closes_writer() {
        let (up_r, up_w) = new_pipe(PipeOptions::unbounded());
        let (down_r, _down_w) = new_pipe(PipeOptions::unbounded());
        let mut conn = LinkConn::new(down_r, up_w);

        conn.shutdown().await.unwrap();
        assert!(matches!(
            up_r.read_multi_buffer().await,
            Err(Error::EndOfStream)
        ));
    }
}
