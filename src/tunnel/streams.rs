//! Byte-stream adapters over `h2` flow-controlled streams.

use std::{
    io,
    pin::Pin,
    task::{Context, Poll},
};

use bytes::Bytes;
use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};

fn h2_io_err(err: h2::Error) -> io::Error {
    io::Error::other(err)
}

/// Reads an [`h2::RecvStream`] as plain bytes, releasing flow-control
/// capacity as data is consumed.
pub(crate) struct H2BodyReader {
    inner: h2::RecvStream,
    buffer: Bytes,
    finished: bool,
}

impl H2BodyReader {
    pub(crate) fn new(inner: h2::RecvStream) -> Self {
        Self {
            inner,
            buffer: Bytes::new(),
            finished: false,
        }
    }
}

impl AsyncRead for H2BodyReader {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        out: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        let this = self.get_mut();
        if this.finished {
            return Poll::Ready(Ok(()));
        }
        if this.buffer.is_empty() {
            match this.inner.poll_data(cx) {
                Poll::Pending => return Poll::Pending,
                Poll::Ready(Some(Ok(bytes))) => this.buffer = bytes,
                Poll::Ready(Some(Err(err))) => return Poll::Ready(Err(h2_io_err(err))),
                Poll::Ready(None) => {
                    this.finished = true;
                    return Poll::Ready(Ok(()));
                }
            }
        }
        let n = this.buffer.len().min(out.remaining());
        if n > 0 {
            let chunk = this.buffer.split_to(n);
            out.put_slice(&chunk);
            let _ = this.inner.flow_control().release_capacity(n);
        }
        Poll::Ready(Ok(()))
    }
}

/// Writes plain bytes into an [`h2::SendStream`], waiting on
/// flow-control capacity. Shutdown sends the end-of-stream frame.
pub(crate) struct H2BodyWriter {
    inner: h2::SendStream<Bytes>,
    ended: bool,
}

impl H2BodyWriter {
    pub(crate) fn new(inner: h2::SendStream<Bytes>) -> Self {
        Self {
            inner,
            ended: false,
        }
    }
}

impl AsyncWrite for H2BodyWriter {
    fn poll_write(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        let this = self.get_mut();
        if buf.is_empty() {
            return Poll::Ready(Ok(0));
        }
        loop {
            let capacity = this.inner.capacity();
            if capacity > 0 {
                let n = capacity.min(buf.len());
                this.inner
                    .send_data(Bytes::copy_from_slice(&buf[..n]), false)
                    .map_err(h2_io_err)?;
                return Poll::Ready(Ok(n));
            }
            this.inner.reserve_capacity(buf.len());
            match this.inner.poll_capacity(cx) {
                Poll::Pending => return Poll::Pending,
                Poll::Ready(None) => {
                    return Poll::Ready(Err(io::ErrorKind::BrokenPipe.into()));
                }
                Poll::Ready(Some(Err(err))) => return Poll::Ready(Err(h2_io_err(err))),
                Poll::Ready(Some(Ok(_))) => continue,
            }
        }
    }

    fn poll_flush(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        // Frames leave with send_data; nothing buffers here.
        Poll::Ready(Ok(()))
    }

    fn poll_shutdown(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        let this = self.get_mut();
        if !this.ended {
            this.ended = true;
            this.inner.send_data(Bytes::new(), true).map_err(h2_io_err)?;
        }
        Poll::Ready(Ok(()))
    }
}
