use std::{io, sync::Arc, time::Duration};

use bytes::Bytes;
use h2::{RecvStream, server::SendResponse};
use http::{Method, StatusCode, Uri, Version, header};
use n0_error::{Result, StdResultExt};
use tokio::{
    io::{AsyncRead, AsyncWrite, AsyncWriteExt},
    net::{TcpListener, TcpStream},
};
use tokio_util::sync::CancellationToken;
use tracing::{Instrument, debug, error_span, warn};

use crate::{
    HEAD_SECTION_MAX_LENGTH, HOST_HTTP_PREFIX, HOST_HTTPS_PREFIX,
    parse::{
        HttpResponse, RequestHead, authority_addr_full, is_connection_header,
        strip_connection_headers,
    },
    pool::BufferPool,
    secret::{ClientVerifier, KeyResolver, SecretStream, ServerHandshake},
    timeout::copy_idle_flush,
    tunnel::streams::{H2BodyReader, H2BodyWriter},
    util::PeekReader,
};

/// Anything that yields accepted byte streams.
///
/// The tunnel server is substrate-agnostic: plain TCP, the encrypted
/// record layer, or a p2p stream listener all serve equally.
pub trait Listener: Send {
    type Stream: AsyncRead + AsyncWrite + Send + Unpin + 'static;

    fn accept(&mut self) -> impl Future<Output = io::Result<Self::Stream>> + Send;
}

impl Listener for TcpListener {
    type Stream = TcpStream;

    async fn accept(&mut self) -> io::Result<TcpStream> {
        let (stream, _) = TcpListener::accept(self).await?;
        Ok(stream)
    }
}

/// TCP listener running the record-layer server handshake on every
/// accepted connection.
///
/// Connections that fail the handshake are logged and dropped; the
/// accept loop keeps serving.
pub struct SecretListener<K, V> {
    listener: TcpListener,
    handshake: Arc<ServerHandshake<K, V>>,
}

impl<K, V> SecretListener<K, V> {
    pub fn new(listener: TcpListener, handshake: Arc<ServerHandshake<K, V>>) -> Self {
        Self {
            listener,
            handshake,
        }
    }
}

impl<K, V> Listener for SecretListener<K, V>
where
    K: KeyResolver + 'static,
    V: ClientVerifier + 'static,
{
    type Stream = SecretStream<TcpStream>;

    async fn accept(&mut self) -> io::Result<Self::Stream> {
        loop {
            let (stream, peer) = self.listener.accept().await?;
            match self.handshake.accept(stream).await {
                Ok((stream, _token)) => return Ok(stream),
                Err(err) => debug!(%peer, "substrate handshake failed: {err:#}"),
            }
        }
    }
}

/// HTTP/2 server terminating tunnel connections and forwarding to
/// origin targets.
///
/// The first byte of the inbound `:authority` selects the scheme: `H`
/// restores http and strips a `:80` suffix, `S` restores https and
/// strips `:443`. Anything else is answered with 400.
pub struct TunnelServer {
    pub pool: Arc<BufferPool>,
    /// Idle interval after which relayed responses are flushed.
    pub copy_timeout: Duration,
    /// Connect timeout for CONNECT targets.
    pub dial_timeout: Duration,
}

impl Default for TunnelServer {
    fn default() -> Self {
        Self {
            pool: Arc::new(BufferPool::default()),
            copy_timeout: Duration::from_millis(500),
            dial_timeout: Duration::from_secs(30),
        }
    }
}

impl TunnelServer {
    /// Accepts connections until the listener fails; dropping the future
    /// cancels every connection task.
    pub async fn serve<L: Listener>(self: Arc<Self>, mut listener: L) -> Result<()> {
        let cancel = CancellationToken::new();
        let _cancel_guard = cancel.clone().drop_guard();
        let mut id = 0u64;
        loop {
            let stream = listener.accept().await?;
            let this = self.clone();
            tokio::spawn(
                cancel
                    .child_token()
                    .run_until_cancelled_owned(async move {
                        if let Err(err) = this.serve_stream(stream).await {
                            warn!("tunnel connection failed: {err:#}");
                        }
                    })
                    .instrument(error_span!("tunnel-conn", id)),
            );
            id += 1;
        }
    }

    /// Serves one HTTP/2 connection, one task per stream.
    pub async fn serve_stream<S>(self: Arc<Self>, stream: S) -> Result<()>
    where
        S: AsyncRead + AsyncWrite + Send + Unpin + 'static,
    {
        let mut connection = h2::server::handshake(stream)
            .await
            .std_context("h2 handshake failed")?;
        let mut id = 0u64;
        while let Some(result) = connection.accept().await {
            let (request, respond) = result.std_context("h2 stream failed")?;
            let this = self.clone();
            tokio::spawn(
                async move {
                    if let Err(err) = this.handle_request(request, respond).await {
                        warn!("tunnel request failed: {err:#}");
                    }
                }
                .instrument(error_span!("tunnel-stream", id)),
            );
            id += 1;
        }
        Ok(())
    }

    async fn handle_request(
        &self,
        request: http::Request<RecvStream>,
        mut respond: SendResponse<Bytes>,
    ) -> Result<()> {
        let authority = request
            .uri()
            .authority()
            .map(|a| a.to_string())
            .or_else(|| {
                request
                    .headers()
                    .get(header::HOST)
                    .and_then(|v| v.to_str().ok())
                    .map(String::from)
            })
            .unwrap_or_default();

        let Some((scheme, target, url_host)) = decode_authority(&authority) else {
            debug!(%authority, "authority without scheme prefix");
            return send_empty(&mut respond, StatusCode::BAD_REQUEST);
        };
        debug!(%scheme, %url_host, method = %request.method(), "tunnel request");

        if request.method() == Method::CONNECT {
            self.serve_connect(target, request, respond).await
        } else {
            self.serve_forward(scheme, url_host, request, respond).await
        }
    }

    /// CONNECT: dial the authority and relay both directions, flushing
    /// the response side across idle gaps.
    async fn serve_connect(
        &self,
        target: &str,
        request: http::Request<RecvStream>,
        mut respond: SendResponse<Bytes>,
    ) -> Result<()> {
        let remote = match tokio::time::timeout(self.dial_timeout, TcpStream::connect(target)).await
        {
            Ok(Ok(remote)) => remote,
            Ok(Err(err)) => {
                debug!(%target, "dial failed: {err}");
                return send_empty(&mut respond, StatusCode::NOT_FOUND);
            }
            Err(_) => {
                debug!(%target, "dial timed out");
                return send_empty(&mut respond, StatusCode::NOT_FOUND);
            }
        };

        let response = http::Response::builder()
            .status(StatusCode::OK)
            .body(())
            .anyerr()?;
        let send_stream = respond.send_response(response, false).anyerr()?;

        let (mut remote_read, mut remote_write) = remote.into_split();
        let mut body = H2BodyReader::new(request.into_body());
        tokio::spawn(async move {
            let _ = tokio::io::copy(&mut body, &mut remote_write).await;
            remote_write.shutdown().await.ok();
        });

        let mut writer = H2BodyWriter::new(send_stream);
        let mut buf = self.pool.get();
        let relayed = copy_idle_flush(&mut remote_read, &mut writer, &mut buf, self.copy_timeout).await;
        self.pool.put(buf);
        if let Err(err) = relayed {
            debug!("tunnel relay ended: {err:#}");
        }
        writer.shutdown().await.ok();
        Ok(())
    }

    /// Non-CONNECT: replay the request against the origin over HTTP/1.0
    /// and stream the response back.
    async fn serve_forward(
        &self,
        scheme: &str,
        url_host: &str,
        request: http::Request<RecvStream>,
        mut respond: SendResponse<Bytes>,
    ) -> Result<()> {
        let (dial_addr, _, _, _) = authority_addr_full(Some(scheme), url_host);
        let mut remote = match TcpStream::connect(&dial_addr).await {
            Ok(remote) => remote,
            Err(err) => {
                debug!(%dial_addr, "dial failed: {err}");
                return send_empty(&mut respond, StatusCode::BAD_GATEWAY);
            }
        };

        let (parts, body) = request.into_parts();
        let path = parts
            .uri
            .path_and_query()
            .map(|pq| pq.as_str())
            .unwrap_or("/");
        let mut head = RequestHead {
            method: parts.method,
            uri: Uri::try_from(path).std_context("bad forward path")?,
            // HTTP/1.0 keeps the origin from chunking, so the body can be
            // relayed verbatim and terminated by the close.
            version: Version::HTTP_10,
            headers: parts.headers,
        };
        strip_connection_headers(&mut head.headers);
        head.headers
            .insert(header::CONNECTION, http::HeaderValue::from_static("close"));
        head.write(&mut remote, url_host, false)
            .await
            .std_context("write to origin failed")?;
        let mut body = H2BodyReader::new(body);
        tokio::io::copy(&mut body, &mut remote)
            .await
            .std_context("relay request body failed")?;

        let mut reader = PeekReader::new(remote, HEAD_SECTION_MAX_LENGTH);
        let origin_response = HttpResponse::read(&mut reader).await?;
        let mut builder = http::Response::builder().status(origin_response.status);
        for (name, value) in origin_response.headers.iter() {
            if is_connection_header(name) {
                continue;
            }
            builder = builder.header(name, value);
        }
        let send_stream = respond
            .send_response(builder.body(()).anyerr()?, false)
            .anyerr()?;

        let mut writer = H2BodyWriter::new(send_stream);
        let mut buf = self.pool.get();
        let relayed = copy_idle_flush(&mut reader, &mut writer, &mut buf, self.copy_timeout).await;
        self.pool.put(buf);
        if let Err(err) = relayed {
            debug!("tunnel relay ended: {err:#}");
        }
        writer.shutdown().await.ok();
        Ok(())
    }
}

/// Splits a prefixed authority into `(scheme, dial target, url host)`.
///
/// The scheme's default port is stripped from the url host
/// unconditionally; targets on other ports keep theirs.
fn decode_authority(authority: &str) -> Option<(&'static str, &str, &str)> {
    let (scheme, default_port_suffix) = match authority.as_bytes().first()? {
        &HOST_HTTP_PREFIX => ("http", ":80"),
        &HOST_HTTPS_PREFIX => ("https", ":443"),
        _ => return None,
    };
    let target = &authority[1..];
    let url_host = target.strip_suffix(default_port_suffix).unwrap_or(target);
    Some((scheme, target, url_host))
}

fn send_empty(respond: &mut SendResponse<Bytes>, status: StatusCode) -> Result<()> {
    let response = http::Response::builder().status(status).body(()).anyerr()?;
    respond.send_response(response, true).anyerr()?;
    Ok(())
}
