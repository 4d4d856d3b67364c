use std::{collections::HashMap, pin::Pin, sync::Arc};

use bytes::Bytes;
use h2::client::SendRequest;
use http::{Method, StatusCode, Uri, header};
use n0_error::{AnyError, Result, StdResultExt, anyerr};
use tokio::{
    io::{AsyncRead, AsyncWrite, AsyncWriteExt},
    net::TcpStream,
};
use tracing::debug;

use crate::{
    HOST_HTTP_PREFIX, HOST_HTTPS_PREFIX,
    context::Context,
    parse::{HttpResponse, is_connection_header},
    secret::{ClientConfig, client_handshake},
    tunnel::streams::{H2BodyReader, H2BodyWriter},
};

/// An authenticated bidirectional byte stream toward an upstream peer.
pub type TunnelStream = Box<dyn TunnelIo>;

pub trait TunnelIo: AsyncRead + AsyncWrite + Send + Unpin {}

impl<T: AsyncRead + AsyncWrite + Send + Unpin> TunnelIo for T {}

/// A factory producing fresh substrate streams to one upstream.
///
/// Implementations decide the transport: raw TCP behind the record-layer
/// handshake, a p2p stream to a named peer, or anything else that yields
/// ordered bytes.
pub trait Dialer: Send + Sync {
    fn dial(&self) -> Pin<Box<dyn Future<Output = Result<TunnelStream>> + Send + '_>>;
}

/// Dials plain TCP with no substrate encryption.
#[derive(Debug)]
pub struct TcpDialer {
    pub addr: String,
}

impl Dialer for TcpDialer {
    fn dial(&self) -> Pin<Box<dyn Future<Output = Result<TunnelStream>> + Send + '_>> {
        Box::pin(async move {
            let stream = TcpStream::connect(&self.addr)
                .await
                .std_context("dial tunnel failed")?;
            Ok(Box::new(stream) as TunnelStream)
        })
    }
}

/// Dials TCP and runs the record-layer client handshake on it.
pub struct SecretDialer {
    pub addr: String,
    pub config: ClientConfig,
}

impl Dialer for SecretDialer {
    fn dial(&self) -> Pin<Box<dyn Future<Output = Result<TunnelStream>> + Send + '_>> {
        Box::pin(async move {
            let stream = TcpStream::connect(&self.addr)
                .await
                .std_context("dial tunnel failed")?;
            let stream = match client_handshake(stream, &self.config).await {
                Ok(stream) => stream,
                Err(err) => return Err(AnyError::from(err)),
            };
            Ok(Box::new(stream) as TunnelStream)
        })
    }
}

/// HTTP/2 multiplex client fanning out to named upstream dialers.
///
/// One live HTTP/2 connection is kept per dialer name; requests whose
/// URL host names a dialer are multiplexed onto that connection, and a
/// dead connection is replaced on the next request.
pub struct TunnelClient {
    dialers: HashMap<String, Arc<dyn Dialer>>,
    conns: tokio::sync::Mutex<HashMap<String, SendRequest<Bytes>>>,
}

impl Default for TunnelClient {
    fn default() -> Self {
        Self::new()
    }
}

impl TunnelClient {
    pub fn new() -> Self {
        Self {
            dialers: HashMap::new(),
            conns: tokio::sync::Mutex::new(HashMap::new()),
        }
    }

    /// Registers a dialer under its upstream name.
    pub fn add_dialer(&mut self, name: impl Into<String>, dialer: impl Dialer + 'static) {
        self.dialers.insert(name.into(), Arc::new(dialer));
    }

    /// Returns a ready request handle for `name`, dialing when needed.
    ///
    /// An unknown name fails before any network activity.
    async fn connection(&self, name: &str) -> Result<SendRequest<Bytes>> {
        let Some(dialer) = self.dialers.get(name) else {
            return Err(anyerr!("dialer not found: {name}"));
        };
        let mut conns = self.conns.lock().await;
        if let Some(existing) = conns.get(name) {
            if let Ok(ready) = existing.clone().ready().await {
                return Ok(ready);
            }
            conns.remove(name);
        }
        debug!(%name, "dialing tunnel substrate");
        let stream = dialer.dial().await?;
        let (send_request, connection) = h2::client::handshake(stream)
            .await
            .std_context("h2 handshake failed")?;
        tokio::spawn(async move {
            if let Err(err) = connection.await {
                debug!("tunnel connection closed: {err}");
            }
        });
        let ready = send_request.ready().await.anyerr()?;
        conns.insert(name.to_string(), ready.clone());
        Ok(ready)
    }

    /// Round-trips `ctx` through the tunnel named `name` and relays the
    /// response to the client.
    pub(crate) async fn proxy(&self, ctx: &mut Context, name: &str) -> Result<()> {
        let prefix = if ctx.request.uri.scheme_str() == Some("https") {
            HOST_HTTPS_PREFIX
        } else {
            HOST_HTTP_PREFIX
        };
        let target = format!("{}{}", prefix as char, ctx.authority_with_port());

        let uri = if ctx.request.method == Method::CONNECT {
            Uri::builder()
                .authority(target.as_str())
                .build()
                .std_context("bad tunnel authority")?
        } else {
            let path = ctx
                .request
                .uri
                .path_and_query()
                .map(|pq| pq.as_str())
                .unwrap_or("/");
            Uri::try_from(format!("http://{target}{path}")).std_context("bad tunnel URI")?
        };

        let mut builder = http::Request::builder()
            .method(ctx.request.method.clone())
            .uri(uri);
        for (name, value) in ctx.request.headers.iter() {
            // HTTP/2 rejects connection-specific headers.
            if is_connection_header(name) {
                continue;
            }
            builder = builder.header(name, value);
        }
        let request = builder.body(()).std_context("bad tunnel request")?;

        let mut send_request = self.connection(name).await?;
        let has_body = ctx.has_body();
        let (response, send_stream) = send_request
            .send_request(request, !has_body)
            .std_context("tunnel request refused")?;
        if has_body {
            let mut body = ctx.take_body();
            let mut remote = H2BodyWriter::new(send_stream);
            tokio::spawn(async move {
                let _ = tokio::io::copy(&mut body, &mut remote).await;
                remote.shutdown().await.ok();
            });
        }

        let response = response.await.std_context("tunnel round-trip failed")?;
        if ctx.connect {
            if response.status() != StatusCode::OK {
                let head = format!("HTTP/1.1 {} Server Fail\r\n\r\n", response.status().as_u16());
                let writer = ctx.writer();
                writer.write_all(head.as_bytes()).await.anyerr()?;
                writer.flush().await.anyerr()?;
                return Ok(());
            }
            ctx.write_connect_ok().await.anyerr()?;
            let mut body = H2BodyReader::new(response.into_body());
            if let Err(err) = ctx.stream_to_client(&mut body).await {
                debug!("tunnel relay ended: {err:#}");
            }
            return Ok(());
        }

        let (parts, body) = response.into_parts();
        let mut head = HttpResponse::new(parts.status);
        head.headers = parts.headers;
        head.headers
            .insert(header::CONNECTION, http::HeaderValue::from_static("close"));
        head.write(ctx.writer()).await.anyerr()?;
        let mut body = H2BodyReader::new(body);
        if let Err(err) = ctx.stream_to_client(&mut body).await {
            debug!("tunnel relay ended: {err:#}");
        }
        Ok(())
    }
}
