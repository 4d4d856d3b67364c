//! One-round handshake establishing the two record-layer sessions.
//!
//! The client speaks first with a double-sealed hello: an outer layer
//! under an ephemeral X25519 agreement and an inner layer under an
//! Argon2id-derived key bound to the long-term pair. The server replies
//! in kind. Each side contributes one session key pair and one 16-byte
//! nonce-seed half per direction, so neither peer picks a full seed alone.

use std::{
    io,
    time::{SystemTime, UNIX_EPOCH},
};

use chacha20poly1305::{
    ChaCha20Poly1305, Key, Nonce,
    aead::{Aead, KeyInit},
};
use n0_error::{AnyError, e, stack_error};
use rand::{RngCore, rngs::OsRng};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use x25519_dalek::{PublicKey, StaticSecret};

use crate::secret::{DirectionKeys, SecretStream, blake2b256};

/// Wire version carried in the first two bytes of a ClientHello.
pub const HANDSHAKE_VERSION: u16 = 0x6a01;

/// Upper bound on the authorization payload embedded in a ClientHello.
pub const MAX_AUTHORIZATION: usize = 732;

/// ClientHello length without the authorization payload.
const CLIENT_HELLO_BASE: usize = 292;

const SERVER_HELLO_LEN: usize = 192;

/// Offset where the outer sealed region of a ClientHello starts.
const OUTER_START: usize = 80;

/// Plaintext prefix length hashed into the hello (without authorization).
const PREFIX_BASE: usize = 124;

/// Why a handshake was refused. The connection is closed either way; no
/// HTTP framing exists yet to carry an error response.
#[stack_error(derive, add_meta)]
pub enum HandshakeError {
    #[error("unsupported handshake version {version:#06x}")]
    Version { version: u16 },
    #[error("authorization length {len} exceeds limit")]
    AuthorizationTooLong { len: usize },
    #[error("no key pair for advertised server key")]
    UnknownServerKey {
        #[error(source)]
        source: AnyError,
    },
    #[error("client authorization rejected")]
    Unauthorized {
        #[error(source)]
        source: AnyError,
    },
    #[error("hello seal or open failed")]
    Crypto,
    #[error("hello prefix hash mismatch")]
    PrefixHash,
    #[error("timestamp {timestamp} outside validity window")]
    Timestamp { timestamp: u64 },
    #[error("handshake io failed")]
    Io {
        #[error(source, std_err)]
        source: io::Error,
    },
}

fn io_err(source: io::Error) -> HandshakeError {
    e!(HandshakeError::Io { source })
}

fn seal(key: &[u8; 32], nonce: &[u8; 12], plain: &[u8]) -> Result<Vec<u8>, HandshakeError> {
    ChaCha20Poly1305::new(Key::from_slice(key))
        .encrypt(Nonce::from_slice(nonce), plain)
        .map_err(|_| e!(HandshakeError::Crypto))
}

fn open(key: &[u8; 32], nonce: &[u8; 12], sealed: &[u8]) -> Result<Vec<u8>, HandshakeError> {
    ChaCha20Poly1305::new(Key::from_slice(key))
        .decrypt(Nonce::from_slice(nonce), sealed)
        .map_err(|_| e!(HandshakeError::Crypto))
}

/// Argon2id over the long-term X25519 agreement, salted with a slice of
/// the ClientHello prefix so every connection derives a fresh key.
fn derive_shared_key(ikm: &[u8; 32], salt: &[u8]) -> Result<[u8; 32], HandshakeError> {
    let params =
        argon2::Params::new(16 * 1024, 3, 2, Some(32)).map_err(|_| e!(HandshakeError::Crypto))?;
    let argon = argon2::Argon2::new(argon2::Algorithm::Argon2id, argon2::Version::V0x13, params);
    let mut out = [0u8; 32];
    argon
        .hash_password_into(ikm, salt, &mut out)
        .map_err(|_| e!(HandshakeError::Crypto))?;
    Ok(out)
}

fn unix_now() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or(0)
}

fn check_timestamp(timestamp: u64, window: u64) -> Result<(), HandshakeError> {
    let now = unix_now();
    if timestamp > now + window || timestamp + window < now {
        return Err(e!(HandshakeError::Timestamp { timestamp }));
    }
    Ok(())
}

fn arr<const N: usize>(bytes: &[u8]) -> [u8; N] {
    let mut out = [0u8; N];
    out.copy_from_slice(bytes);
    out
}

/// Joins this side's write-seed half with the peer half into a full seed.
fn join_seed(write_half: &[u8], read_half: &[u8]) -> [u8; 32] {
    let mut seed = [0u8; 32];
    seed[..16].copy_from_slice(write_half);
    seed[16..].copy_from_slice(read_half);
    seed
}

fn random_secret() -> StaticSecret {
    StaticSecret::random_from_rng(OsRng)
}

fn random<const N: usize>() -> [u8; N] {
    let mut out = [0u8; N];
    OsRng.fill_bytes(&mut out);
    out
}

/// Client-side handshake parameters.
#[derive(Clone)]
pub struct ClientConfig {
    /// Pre-shared public key of the server to reach.
    pub server_public: [u8; 32],
    /// Long-term client scalar the server knows us by.
    pub client_secret: StaticSecret,
    /// Opaque authorization handed to the server's verifier. May be empty.
    pub authorization: Vec<u8>,
    /// Accepted clock skew for hello timestamps, in seconds.
    pub timestamp_window: u64,
}

impl ClientConfig {
    pub fn new(server_public: [u8; 32], client_secret: StaticSecret) -> Self {
        Self {
            server_public,
            client_secret,
            authorization: Vec::new(),
            timestamp_window: 60,
        }
    }
}

/// Runs the client side of the handshake and wraps `io` in the two
/// record-layer sessions it establishes.
pub async fn client_handshake<S>(
    mut io: S,
    config: &ClientConfig,
) -> Result<SecretStream<S>, HandshakeError>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let n = config.authorization.len();
    if n > MAX_AUTHORIZATION {
        return Err(e!(HandshakeError::AuthorizationTooLong { len: n }));
    }
    let server_public = PublicKey::from(config.server_public);
    let client_public = PublicKey::from(&config.client_secret);

    let ephemeral = random_secret();
    let tmp_key = ephemeral.diffie_hellman(&server_public).to_bytes();

    let write_secret = random_secret();
    let read_secret = random_secret();
    let write_seed: [u8; 16] = random();
    let read_seed: [u8; 16] = random();
    let nonce0: [u8; 12] = random();
    let nonce1: [u8; 12] = random();

    let mut hello = Vec::with_capacity(CLIENT_HELLO_BASE + n);
    hello.extend_from_slice(&HANDSHAKE_VERSION.to_be_bytes());
    hello.extend_from_slice(&(n as u16).to_be_bytes());
    hello.extend_from_slice(&config.server_public);
    hello.extend_from_slice(PublicKey::from(&ephemeral).as_bytes());
    hello.extend_from_slice(&nonce0);
    hello.extend_from_slice(&nonce1);
    hello.extend_from_slice(client_public.as_bytes());
    hello.extend_from_slice(&config.authorization);

    // Both the prefix hash and the Argon2 salt cover plaintext the server
    // reconstructs after opening the outer layer.
    let prefix_hash = blake2b256(&hello);
    let shared_key = derive_shared_key(
        &config
            .client_secret
            .diffie_hellman(&server_public)
            .to_bytes(),
        &hello[60..92],
    )?;

    let mut inner = Vec::with_capacity(136);
    inner.extend_from_slice(&prefix_hash);
    inner.extend_from_slice(&unix_now().to_be_bytes());
    inner.extend_from_slice(PublicKey::from(&write_secret).as_bytes());
    inner.extend_from_slice(PublicKey::from(&read_secret).as_bytes());
    inner.extend_from_slice(&write_seed);
    inner.extend_from_slice(&read_seed);
    let inner_sealed = seal(&shared_key, &nonce1, &inner)?;

    let mut outer = hello.split_off(OUTER_START);
    outer.extend_from_slice(&inner_sealed);
    let outer_sealed = seal(&tmp_key, &nonce0, &outer)?;
    hello.extend_from_slice(&outer_sealed);
    io.write_all(&hello).await.map_err(io_err)?;
    io.flush().await.map_err(io_err)?;

    let mut reply = [0u8; SERVER_HELLO_LEN];
    io.read_exact(&mut reply).await.map_err(io_err)?;
    let ephemeral_server = PublicKey::from(arr::<32>(&reply[..32]));
    let tmp_key = config
        .client_secret
        .diffie_hellman(&ephemeral_server)
        .to_bytes();
    let outer = open(&tmp_key, &arr(&reply[32..44]), &reply[44..])?;
    let inner = open(&shared_key, &arr(&outer[..12]), &outer[12..])?;

    let timestamp = u64::from_be_bytes(arr(&inner[..8]));
    check_timestamp(timestamp, config.timestamp_window)?;
    let server_read_public = PublicKey::from(arr::<32>(&inner[8..40]));
    let server_write_public = PublicKey::from(arr::<32>(&inner[40..72]));
    let server_read_seed = &inner[72..88];
    let server_write_seed = &inner[88..104];

    let write = DirectionKeys {
        key: write_secret.diffie_hellman(&server_read_public).to_bytes(),
        seed: join_seed(&write_seed, server_read_seed),
    };
    let read = DirectionKeys {
        key: read_secret.diffie_hellman(&server_write_public).to_bytes(),
        seed: join_seed(server_write_seed, &read_seed),
    };
    Ok(SecretStream::new(io, write, read))
}

/// Looks up the scalar matching an advertised server public key.
pub trait KeyResolver: Send + Sync {
    fn server_secret(&self, server_public: &[u8; 32]) -> Result<StaticSecret, AnyError>;
}

/// Decides whether a client key pair plus authorization payload may
/// finish the handshake, yielding an opaque per-connection token.
pub trait ClientVerifier: Send + Sync {
    type Token: Send;

    fn verify(
        &self,
        server_public: &[u8; 32],
        client_public: &[u8; 32],
        authorization: &[u8],
    ) -> Result<Self::Token, AnyError>;
}

/// Server side of the handshake.
pub struct ServerHandshake<K, V> {
    pub keys: K,
    pub verifier: V,
    /// Accepted clock skew for hello timestamps, in seconds.
    pub timestamp_window: u64,
}

impl<K: KeyResolver, V: ClientVerifier> ServerHandshake<K, V> {
    pub fn new(keys: K, verifier: V) -> Self {
        Self {
            keys,
            verifier,
            timestamp_window: 60,
        }
    }

    /// Runs the server side of the handshake on a fresh connection.
    ///
    /// Returns the wrapped stream and whatever token the verifier minted
    /// for this client.
    pub async fn accept<S>(&self, mut io: S) -> Result<(SecretStream<S>, V::Token), HandshakeError>
    where
        S: AsyncRead + AsyncWrite + Unpin,
    {
        let mut head = [0u8; 4];
        io.read_exact(&mut head).await.map_err(io_err)?;
        let version = u16::from_be_bytes([head[0], head[1]]);
        if version != HANDSHAKE_VERSION {
            return Err(e!(HandshakeError::Version { version }));
        }
        let n = u16::from_be_bytes([head[2], head[3]]) as usize;
        if n > MAX_AUTHORIZATION {
            return Err(e!(HandshakeError::AuthorizationTooLong { len: n }));
        }

        let mut hello = vec![0u8; CLIENT_HELLO_BASE + n];
        hello[..4].copy_from_slice(&head);
        io.read_exact(&mut hello[4..]).await.map_err(io_err)?;

        let server_public = arr::<32>(&hello[4..36]);
        let server_secret = self
            .keys
            .server_secret(&server_public)
            .map_err(|source| e!(HandshakeError::UnknownServerKey { source }))?;
        let ephemeral_client = PublicKey::from(arr::<32>(&hello[36..68]));
        let tmp_key = server_secret.diffie_hellman(&ephemeral_client).to_bytes();
        let outer = open(&tmp_key, &arr(&hello[68..80]), &hello[OUTER_START..])?;

        let nonce1 = arr::<12>(&outer[..12]);
        let client_public_bytes = arr::<32>(&outer[12..44]);
        let client_public = PublicKey::from(client_public_bytes);
        let authorization = &outer[44..44 + n];
        let inner_sealed = &outer[44 + n..];

        // Salt slice [60..92) of the plaintext hello spans the tail of the
        // ephemeral key, nonce0, and nonce1.
        let mut salt = [0u8; 32];
        salt[..20].copy_from_slice(&hello[60..80]);
        salt[20..].copy_from_slice(&nonce1);
        let shared_key = derive_shared_key(
            &server_secret.diffie_hellman(&client_public).to_bytes(),
            &salt,
        )?;
        let inner = open(&shared_key, &nonce1, inner_sealed)?;

        let mut prefix = Vec::with_capacity(PREFIX_BASE + n);
        prefix.extend_from_slice(&hello[..OUTER_START]);
        prefix.extend_from_slice(&outer[..44 + n]);
        if inner[..32] != blake2b256(&prefix) {
            return Err(e!(HandshakeError::PrefixHash));
        }

        let token = self
            .verifier
            .verify(&server_public, &client_public_bytes, authorization)
            .map_err(|source| e!(HandshakeError::Unauthorized { source }))?;

        let timestamp = u64::from_be_bytes(arr(&inner[32..40]));
        check_timestamp(timestamp, self.timestamp_window)?;

        let client_write_public = PublicKey::from(arr::<32>(&inner[40..72]));
        let client_read_public = PublicKey::from(arr::<32>(&inner[72..104]));
        let client_write_seed = &inner[104..120];
        let client_read_seed = &inner[120..136];

        let ephemeral = random_secret();
        let tmp_key = ephemeral.diffie_hellman(&client_public).to_bytes();
        let read_secret = random_secret();
        let write_secret = random_secret();
        let read_seed: [u8; 16] = random();
        let write_seed: [u8; 16] = random();
        let nonce2: [u8; 12] = random();
        let nonce3: [u8; 12] = random();

        let mut inner = Vec::with_capacity(104);
        inner.extend_from_slice(&unix_now().to_be_bytes());
        inner.extend_from_slice(PublicKey::from(&read_secret).as_bytes());
        inner.extend_from_slice(PublicKey::from(&write_secret).as_bytes());
        inner.extend_from_slice(&read_seed);
        inner.extend_from_slice(&write_seed);
        let inner_sealed = seal(&shared_key, &nonce3, &inner)?;

        let mut outer = Vec::with_capacity(12 + inner_sealed.len());
        outer.extend_from_slice(&nonce3);
        outer.extend_from_slice(&inner_sealed);
        let outer_sealed = seal(&tmp_key, &nonce2, &outer)?;

        let mut reply = Vec::with_capacity(SERVER_HELLO_LEN);
        reply.extend_from_slice(PublicKey::from(&ephemeral).as_bytes());
        reply.extend_from_slice(&nonce2);
        reply.extend_from_slice(&outer_sealed);
        io.write_all(&reply).await.map_err(io_err)?;
        io.flush().await.map_err(io_err)?;

        let write = DirectionKeys {
            key: write_secret.diffie_hellman(&client_read_public).to_bytes(),
            seed: join_seed(&write_seed, client_read_seed),
        };
        let read = DirectionKeys {
            key: read_secret.diffie_hellman(&client_write_public).to_bytes(),
            seed: join_seed(client_write_seed, &read_seed),
        };
        Ok((SecretStream::new(io, write, read), token))
    }
}
