//! Authenticated-encryption stream: a ChaCha20-Poly1305 record layer with
//! deterministic nonces, established by a one-round X25519 handshake.

use std::{
    io,
    pin::Pin,
    task::{Context, Poll},
};

use blake2::{Blake2b, Digest, digest::consts::U32};
use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};

use self::record::{MAX_RECORD_PLAIN, RecordReader, RecordWriter};

pub mod handshake;
mod noncer;
pub mod record;

pub use handshake::{
    ClientConfig, ClientVerifier, HandshakeError, KeyResolver, ServerHandshake, client_handshake,
};

type Blake2b256 = Blake2b<U32>;

pub(crate) fn blake2b256(data: &[u8]) -> [u8; 32] {
    Blake2b256::digest(data).into()
}

/// Keys and nonce seeds for one direction of a record stream.
#[derive(Debug, Clone)]
pub(crate) struct DirectionKeys {
    pub key: [u8; 32],
    pub seed: [u8; 32],
}

/// An encrypted byte stream framed into AEAD records.
///
/// Writes are split into records of at most [`MAX_RECORD_PLAIN`] plaintext
/// bytes, each sealed as a 2-byte length record followed by a payload
/// record. Reads open records in order and retain any unread payload.
/// Both directions run independent keys and nonce sequences.
#[derive(Debug)]
pub struct SecretStream<S> {
    io: S,
    reader: RecordReader,
    writer: RecordWriter,
}

impl<S> SecretStream<S> {
    pub(crate) fn new(io: S, write: DirectionKeys, read: DirectionKeys) -> Self {
        Self {
            io,
            reader: RecordReader::new(&read.key, read.seed),
            writer: RecordWriter::new(&write.key, write.seed),
        }
    }

    /// Returns the underlying transport.
    pub fn into_inner(self) -> S {
        self.io
    }
}

impl<S: AsyncRead + AsyncWrite + Unpin> SecretStream<S> {
    /// Feeds more ciphertext from the transport into the reader.
    fn poll_fill(&mut self, cx: &mut Context<'_>) -> Poll<io::Result<usize>> {
        let mut scratch = [0u8; 8 << 10];
        let mut read_buf = ReadBuf::new(&mut scratch);
        match Pin::new(&mut self.io).poll_read(cx, &mut read_buf) {
            Poll::Pending => Poll::Pending,
            Poll::Ready(Err(err)) => Poll::Ready(Err(err)),
            Poll::Ready(Ok(())) => {
                let filled = read_buf.filled();
                self.reader.input.extend_from_slice(filled);
                Poll::Ready(Ok(filled.len()))
            }
        }
    }

    /// Pushes pending sealed bytes into the transport.
    fn poll_drain(&mut self, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        while !self.writer.pending.is_empty() {
            match Pin::new(&mut self.io).poll_write(cx, &self.writer.pending) {
                Poll::Pending => return Poll::Pending,
                Poll::Ready(Ok(0)) => {
                    return Poll::Ready(Err(io::ErrorKind::WriteZero.into()));
                }
                Poll::Ready(Ok(n)) => {
                    let _ = bytes::Buf::copy_to_bytes(&mut self.writer.pending, n);
                }
                Poll::Ready(Err(err)) => return Poll::Ready(Err(err)),
            }
        }
        Poll::Ready(Ok(()))
    }
}

impl<S: AsyncRead + AsyncWrite + Unpin> AsyncRead for SecretStream<S> {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        out: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        let this = self.get_mut();
        loop {
            if !this.reader.plain.is_empty() {
                let n = this.reader.plain.len().min(out.remaining());
                let chunk = this.reader.plain.split_to(n);
                out.put_slice(&chunk);
                return Poll::Ready(Ok(()));
            }
            if this.reader.open_buffered()? {
                continue;
            }
            match this.poll_fill(cx) {
                Poll::Pending => return Poll::Pending,
                Poll::Ready(Err(err)) => return Poll::Ready(Err(err)),
                Poll::Ready(Ok(0)) => {
                    if this.reader.at_record_boundary() {
                        return Poll::Ready(Ok(()));
                    }
                    return Poll::Ready(Err(io::Error::new(
                        io::ErrorKind::UnexpectedEof,
                        "stream ended inside a record",
                    )));
                }
                Poll::Ready(Ok(_)) => {}
            }
        }
    }
}

impl<S: AsyncRead + AsyncWrite + Unpin> AsyncWrite for SecretStream<S> {
    fn poll_write(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        let this = self.get_mut();
        // The previous record must reach the transport before a new one is
        // sealed, otherwise pending could grow without bound.
        match this.poll_drain(cx) {
            Poll::Pending => return Poll::Pending,
            Poll::Ready(Err(err)) => return Poll::Ready(Err(err)),
            Poll::Ready(Ok(())) => {}
        }
        if buf.is_empty() {
            return Poll::Ready(Ok(0));
        }
        let chunk = &buf[..buf.len().min(MAX_RECORD_PLAIN)];
        this.writer.seal(chunk)?;
        // Opportunistic drain; leftovers go out on the next write or flush.
        match this.poll_drain(cx) {
            Poll::Pending | Poll::Ready(Ok(())) => {}
            Poll::Ready(Err(err)) => return Poll::Ready(Err(err)),
        }
        Poll::Ready(Ok(chunk.len()))
    }

    fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        let this = self.get_mut();
        match this.poll_drain(cx) {
            Poll::Pending => return Poll::Pending,
            Poll::Ready(Err(err)) => return Poll::Ready(Err(err)),
            Poll::Ready(Ok(())) => {}
        }
        Pin::new(&mut this.io).poll_flush(cx)
    }

    fn poll_shutdown(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        let this = self.get_mut();
        match this.poll_drain(cx) {
            Poll::Pending => return Poll::Pending,
            Poll::Ready(Err(err)) => return Poll::Ready(Err(err)),
            Poll::Ready(Ok(())) => {}
        }
        Pin::new(&mut this.io).poll_shutdown(cx)
    }
}

#[cfg(test)]
mod tests {
    use tokio::io::{AsyncReadExt, AsyncWriteExt};

    use super::*;

    fn stream_pair() -> (
        SecretStream<tokio::io::DuplexStream>,
        SecretStream<tokio::io::DuplexStream>,
    ) {
        let (a, b) = tokio::io::duplex(1 << 20);
        let k1 = DirectionKeys {
            key: [1u8; 32],
            seed: [2u8; 32],
        };
        let k2 = DirectionKeys {
            key: [3u8; 32],
            seed: [4u8; 32],
        };
        (
            SecretStream::new(a, k1.clone(), k2.clone()),
            SecretStream::new(b, k2, k1),
        )
    }

    #[tokio::test]
    async fn round_trips_small_writes() {
        let (mut a, mut b) = stream_pair();
        a.write_all(b"987654321").await.unwrap();
        a.flush().await.unwrap();
        let mut buf = [0u8; 9];
        b.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"987654321");

        b.write_all(b"9876543210").await.unwrap();
        b.flush().await.unwrap();
        let mut buf = [0u8; 10];
        a.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"9876543210");
    }

    #[tokio::test]
    async fn round_trips_large_writes_across_records() {
        let payload: Vec<u8> = (0..1 << 20).map(|i| (i * 31 % 251) as u8).collect();
        let (mut a, mut b) = stream_pair();
        let expect = payload.clone();
        let writer = tokio::spawn(async move {
            a.write_all(&payload).await.unwrap();
            a.shutdown().await.unwrap();
            a
        });
        let mut got = Vec::new();
        b.read_to_end(&mut got).await.unwrap();
        assert_eq!(got.len(), expect.len());
        assert_eq!(got, expect);
        writer.await.unwrap();
    }

    #[tokio::test]
    async fn serves_leftover_across_small_reads() {
        let (mut a, mut b) = stream_pair();
        a.write_all(b"abcdefgh").await.unwrap();
        a.flush().await.unwrap();
        let mut out = Vec::new();
        let mut one = [0u8; 3];
        b.read_exact(&mut one).await.unwrap();
        out.extend_from_slice(&one);
        let mut rest = [0u8; 5];
        b.read_exact(&mut rest).await.unwrap();
        out.extend_from_slice(&rest);
        assert_eq!(out, b"abcdefgh");
    }

    #[tokio::test]
    async fn tampering_is_fatal() {
        let (client, server) = tokio::io::duplex(1 << 16);
        let keys = DirectionKeys {
            key: [5u8; 32],
            seed: [6u8; 32],
        };
        let mut a = SecretStream::new(client, keys.clone(), keys.clone());
        a.write_all(b"hello").await.unwrap();
        a.flush().await.unwrap();

        // flip one ciphertext bit before it reaches the reader
        let (mut raw_read, _w) = tokio::io::split(server);
        let mut wire = vec![0u8; 2 + 16 + 5 + 16];
        raw_read.read_exact(&mut wire).await.unwrap();
        wire[20] ^= 0x01;
        let (reader_side, mut feeder) = tokio::io::duplex(1 << 16);
        feeder.write_all(&wire).await.unwrap();
        let mut b = SecretStream::new(reader_side, keys.clone(), keys);
        let mut buf = [0u8; 5];
        let err = b.read_exact(&mut buf).await.unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::InvalidData);
    }

    #[tokio::test]
    async fn clean_eof_at_record_boundary() {
        let (mut a, mut b) = stream_pair();
        a.write_all(b"bye").await.unwrap();
        a.shutdown().await.unwrap();
        drop(a);
        let mut got = Vec::new();
        b.read_to_end(&mut got).await.unwrap();
        assert_eq!(got, b"bye");
    }
}
