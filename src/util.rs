//! A manually controllable prebuffer over a Tokio `AsyncRead`, used to
//! parse request and response heads without losing body bytes.

use std::{
    pin::Pin,
    task::{Context, Poll},
};

use bytes::{Buf, BytesMut};
use tokio::io::{self, AsyncRead, AsyncReadExt, ReadBuf};

/// A reader that accumulates input in a bounded front buffer.
///
/// Heads are parsed out of [`buffered`](Self::buffered) and removed with
/// [`consume`](Self::consume); whatever remains is served first by the
/// `AsyncRead` implementation before falling through to the inner reader.
pub(crate) struct PeekReader<R> {
    inner: R,
    buf: BytesMut,
    limit: usize,
}

impl<R: AsyncRead + Unpin> PeekReader<R> {
    pub(crate) fn new(inner: R, limit: usize) -> Self {
        Self {
            inner,
            buf: BytesMut::new(),
            limit,
        }
    }

    /// The bytes accumulated so far and not yet consumed.
    pub(crate) fn buffered(&self) -> &[u8] {
        &self.buf
    }

    /// Whether the front buffer reached its limit.
    pub(crate) fn at_limit(&self) -> bool {
        self.buf.len() >= self.limit
    }

    /// Drops `n` bytes from the front of the buffer.
    pub(crate) fn consume(&mut self, n: usize) {
        self.buf.advance(n);
    }

    /// Reads more input into the front buffer, up to the limit.
    ///
    /// Returns the number of bytes added; 0 means EOF or a full buffer.
    pub(crate) async fn fill(&mut self) -> io::Result<usize> {
        let room = self.limit.saturating_sub(self.buf.len());
        if room == 0 {
            return Ok(0);
        }
        (&mut self.inner)
            .take(room as u64)
            .read_buf(&mut self.buf)
            .await
    }
}

impl<R: AsyncRead + Unpin> AsyncRead for PeekReader<R> {
    fn poll_read(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        out: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        if self.buf.is_empty() {
            return Pin::new(&mut self.inner).poll_read(cx, out);
        }
        let n = self.buf.len().min(out.remaining());
        let chunk = self.buf.split_to(n);
        out.put_slice(&chunk);
        Poll::Ready(Ok(()))
    }
}

#[cfg(test)]
mod tests {
    use std::io::Cursor;

    use tokio::io::AsyncReadExt;

    use super::*;

    #[tokio::test]
    async fn fill_then_fall_through() {
        let mut r = PeekReader::new(Cursor::new(b"hello world".to_vec()), 5);
        r.fill().await.unwrap();
        assert_eq!(r.buffered(), b"hello");
        assert!(r.at_limit());
        let mut out = Vec::new();
        r.read_to_end(&mut out).await.unwrap();
        assert_eq!(out, b"hello world");
    }

    #[tokio::test]
    async fn consume_keeps_position() {
        let mut r = PeekReader::new(Cursor::new(b"abcdefgh".to_vec()), 4);
        r.fill().await.unwrap();
        r.consume(3);
        assert_eq!(r.buffered(), b"d");
        r.fill().await.unwrap();
        assert_eq!(r.buffered(), b"defg");
        let mut out = Vec::new();
        r.read_to_end(&mut out).await.unwrap();
        assert_eq!(out, b"defgh");
    }

    #[tokio::test]
    async fn fill_at_eof_returns_zero() {
        let mut r = PeekReader::new(Cursor::new(Vec::new()), 16);
        assert_eq!(r.fill().await.unwrap(), 0);
        assert!(r.buffered().is_empty());
    }
}
