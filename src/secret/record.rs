use std::io;

use bytes::{Buf, BytesMut};
use chacha20poly1305::{
    ChaCha20Poly1305, Key, Nonce,
    aead::{Aead, KeyInit},
};

use crate::secret::noncer::Noncer;

/// Maximum plaintext bytes carried by one record.
pub const MAX_RECORD_PLAIN: usize = 0x3FFF;

/// Poly1305 tag appended to every sealed chunk.
pub(crate) const TAG_LEN: usize = 16;

/// Sealed size of the 2-byte length prefix.
pub(crate) const SEALED_LEN: usize = 2 + TAG_LEN;

fn open_failed() -> io::Error {
    io::Error::new(io::ErrorKind::InvalidData, "record decryption failed")
}

fn seal_failed() -> io::Error {
    io::Error::other("record encryption failed")
}

/// Seals application writes into length-prefixed records.
///
/// Every record consumes two nonces in strict order: one for the sealed
/// big-endian length, one for the sealed payload. A single application
/// write never spans records beyond [`MAX_RECORD_PLAIN`] per record.
pub(crate) struct RecordWriter {
    aead: ChaCha20Poly1305,
    noncer: Noncer,
    /// Sealed bytes not yet accepted by the underlying sink.
    pub(crate) pending: BytesMut,
}

impl std::fmt::Debug for RecordWriter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RecordWriter")
            .field("pending", &self.pending)
            .finish_non_exhaustive()
    }
}

impl RecordWriter {
    pub(crate) fn new(key: &[u8; 32], seed: [u8; 32]) -> Self {
        Self {
            aead: ChaCha20Poly1305::new(Key::from_slice(key)),
            noncer: Noncer::new(seed),
            pending: BytesMut::new(),
        }
    }

    /// Seals one chunk (at most [`MAX_RECORD_PLAIN`] bytes) into `pending`.
    pub(crate) fn seal(&mut self, chunk: &[u8]) -> io::Result<()> {
        debug_assert!(!chunk.is_empty() && chunk.len() <= MAX_RECORD_PLAIN);
        let size = (chunk.len() & MAX_RECORD_PLAIN) as u16;
        let nonce = self.noncer.next();
        let sealed_size = self
            .aead
            .encrypt(Nonce::from_slice(&nonce), size.to_be_bytes().as_slice())
            .map_err(|_| seal_failed())?;
        let nonce = self.noncer.next();
        let sealed_payload = self
            .aead
            .encrypt(Nonce::from_slice(&nonce), chunk)
            .map_err(|_| seal_failed())?;
        self.pending.extend_from_slice(&sealed_size);
        self.pending.extend_from_slice(&sealed_payload);
        Ok(())
    }
}

/// What the reader needs next from the wire.
#[derive(Debug)]
enum Want {
    SealedSize,
    SealedPayload(usize),
}

/// Opens length-prefixed records back into plaintext.
///
/// Opened payload bytes that the caller has not taken yet are retained in
/// `plain` across reads.
pub(crate) struct RecordReader {
    aead: ChaCha20Poly1305,
    noncer: Noncer,
    want: Want,
    /// Ciphertext accumulated from the wire.
    pub(crate) input: BytesMut,
    /// Opened plaintext not yet served to the caller.
    pub(crate) plain: BytesMut,
}

impl std::fmt::Debug for RecordReader {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RecordReader")
            .field("want", &self.want)
            .field("input", &self.input)
            .field("plain", &self.plain)
            .finish_non_exhaustive()
    }
}

impl RecordReader {
    pub(crate) fn new(key: &[u8; 32], seed: [u8; 32]) -> Self {
        Self {
            aead: ChaCha20Poly1305::new(Key::from_slice(key)),
            noncer: Noncer::new(seed),
            want: Want::SealedSize,
            input: BytesMut::new(),
            plain: BytesMut::new(),
        }
    }

    /// True when the stream may end here without truncating a record.
    pub(crate) fn at_record_boundary(&self) -> bool {
        self.input.is_empty() && matches!(self.want, Want::SealedSize)
    }

    /// Opens as much of `input` as possible into `plain`.
    ///
    /// Returns true when any progress was made; false means more wire
    /// bytes are needed.
    pub(crate) fn open_buffered(&mut self) -> io::Result<bool> {
        let mut advanced = false;
        loop {
            match self.want {
                Want::SealedSize => {
                    if self.input.len() < SEALED_LEN {
                        return Ok(advanced);
                    }
                    let sealed = self.input.copy_to_bytes(SEALED_LEN);
                    let nonce = self.noncer.next();
                    let size = self
                        .aead
                        .decrypt(Nonce::from_slice(&nonce), sealed.as_ref())
                        .map_err(|_| open_failed())?;
                    let size = u16::from_be_bytes([size[0], size[1]]) as usize & MAX_RECORD_PLAIN;
                    self.want = Want::SealedPayload(size + TAG_LEN);
                    advanced = true;
                }
                Want::SealedPayload(len) => {
                    if self.input.len() < len {
                        return Ok(advanced);
                    }
                    let sealed = self.input.copy_to_bytes(len);
                    let nonce = self.noncer.next();
                    let payload = self
                        .aead
                        .decrypt(Nonce::from_slice(&nonce), sealed.as_ref())
                        .map_err(|_| open_failed())?;
                    self.plain.extend_from_slice(&payload);
                    self.want = Want::SealedSize;
                    advanced = true;
                }
            }
        }
    }
}
