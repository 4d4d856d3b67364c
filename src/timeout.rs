use std::{io, time::Duration};

use n0_error::{e, stack_error};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

/// Copy failure tagged with the side that failed.
///
/// Callers use the distinction to decide whether the peer direction is
/// still worth writing to: a [`CopyError::Sink`] means the destination is
/// already broken and no further response should be attempted on it.
#[stack_error(derive, add_meta)]
pub enum CopyError {
    #[error("copy source read failed")]
    Source {
        #[error(source, std_err)]
        source: io::Error,
    },
    #[error("copy sink write failed")]
    Sink {
        #[error(source, std_err)]
        source: io::Error,
    },
}

/// Streams `src` into `dst` until EOF, flushing `dst` whenever `src`
/// stays idle for `idle`.
///
/// Each read carries a soft deadline; when it expires the writer is
/// flushed and one deadline-free read blocks until the next byte. EOF is
/// not an error and returns the byte count written.
pub async fn copy_idle_flush<R, W>(
    src: &mut R,
    dst: &mut W,
    buf: &mut [u8],
    idle: Duration,
) -> Result<u64, CopyError>
where
    R: AsyncRead + Unpin + ?Sized,
    W: AsyncWrite + Unpin + ?Sized,
{
    let mut written = 0u64;
    loop {
        let n = match tokio::time::timeout(idle, src.read(buf)).await {
            Ok(Ok(n)) => n,
            Ok(Err(err)) => return Err(e!(CopyError::Source { source: err })),
            Err(_) => {
                dst.flush()
                    .await
                    .map_err(|source| e!(CopyError::Sink { source }))?;
                src.read(buf)
                    .await
                    .map_err(|source| e!(CopyError::Source { source }))?
            }
        };
        if n == 0 {
            break;
        }
        dst.write_all(&buf[..n])
            .await
            .map_err(|source| e!(CopyError::Sink { source }))?;
        written += n as u64;
    }
    dst.flush()
        .await
        .map_err(|source| e!(CopyError::Sink { source }))?;
    Ok(written)
}

#[cfg(test)]
mod tests {
    use std::{
        pin::Pin,
        sync::{
            Arc,
            atomic::{AtomicUsize, Ordering},
        },
        task::{Context, Poll},
    };

    use tokio::io::AsyncWriteExt;

    use super::*;

    /// Wraps a writer and counts flushes.
    struct CountingWriter<W> {
        inner: W,
        flushes: Arc<AtomicUsize>,
    }

    impl<W: AsyncWrite + Unpin> AsyncWrite for CountingWriter<W> {
        fn poll_write(
            mut self: Pin<&mut Self>,
            cx: &mut Context<'_>,
            buf: &[u8],
        ) -> Poll<io::Result<usize>> {
            Pin::new(&mut self.inner).poll_write(cx, buf)
        }

        fn poll_flush(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
            self.flushes.fetch_add(1, Ordering::SeqCst);
            Pin::new(&mut self.inner).poll_flush(cx)
        }

        fn poll_shutdown(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
            Pin::new(&mut self.inner).poll_shutdown(cx)
        }
    }

    #[tokio::test]
    async fn copies_to_eof() {
        let (a, b) = tokio::io::duplex(64);
        tokio::spawn(async move {
            let mut a = a;
            a.write_all(b"hello world").await.unwrap();
        });
        let (mut src, _keep) = tokio::io::split(b);
        let mut out = Vec::new();
        let mut buf = [0u8; 8];
        let n = copy_idle_flush(&mut src, &mut out, &mut buf, Duration::from_millis(50))
            .await
            .unwrap();
        assert_eq!(n, 11);
        assert_eq!(out, b"hello world");
    }

    #[tokio::test]
    async fn flushes_on_idle_gap() {
        let (mut tx, rx) = tokio::io::duplex(64);
        let flushes = Arc::new(AtomicUsize::new(0));
        let mut dst = CountingWriter {
            inner: Vec::new(),
            flushes: flushes.clone(),
        };
        let writer = tokio::spawn(async move {
            tx.write_all(b"first").await.unwrap();
            tokio::time::sleep(Duration::from_millis(120)).await;
            tx.write_all(b"second").await.unwrap();
        });
        let (mut src, _keep) = tokio::io::split(rx);
        let mut buf = [0u8; 32];
        let copied = copy_idle_flush(&mut src, &mut dst, &mut buf, Duration::from_millis(30))
            .await
            .unwrap();
        writer.await.unwrap();
        assert_eq!(copied, 11);
        assert_eq!(dst.inner, b"firstsecond");
        // at least one idle flush plus the final flush
        assert!(flushes.load(Ordering::SeqCst) >= 2);
    }

    #[tokio::test]
    async fn sink_errors_are_tagged() {
        struct FailWriter;
        impl AsyncWrite for FailWriter {
            fn poll_write(
                self: Pin<&mut Self>,
                _cx: &mut Context<'_>,
                _buf: &[u8],
            ) -> Poll<io::Result<usize>> {
                Poll::Ready(Err(io::Error::new(io::ErrorKind::BrokenPipe, "gone")))
            }
            fn poll_flush(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<io::Result<()>> {
                Poll::Ready(Ok(()))
            }
            fn poll_shutdown(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<io::Result<()>> {
                Poll::Ready(Ok(()))
            }
        }

        let mut src = std::io::Cursor::new(b"data".to_vec());
        let mut dst = FailWriter;
        let mut buf = [0u8; 8];
        let err = copy_idle_flush(&mut src, &mut dst, &mut buf, Duration::from_millis(50))
            .await
            .unwrap_err();
        assert!(matches!(err, CopyError::Sink { .. }));
    }
}
