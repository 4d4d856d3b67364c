use std::{io, net::IpAddr, pin::Pin, sync::Arc, time::Duration};

use http::{Method, StatusCode, Uri, header, uri::Authority};
use n0_error::{Result, StackResultExt, StdResultExt, ensure_any};
use serde::Serialize;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use crate::{
    CONNECT_OK, HEAD_SECTION_MAX_LENGTH,
    domain::Domain,
    parse::{RequestHead, authority_addr_full},
    pool::BufferPool,
    timeout::{CopyError, copy_idle_flush},
    util::PeekReader,
};

/// Shared per-process request handling configuration.
#[derive(Debug)]
pub struct ContextConfig {
    /// Pool feeding the copy engines.
    pub pool: Arc<BufferPool>,
    /// Idle interval after which streamed responses are flushed.
    pub copy_timeout: Duration,
}

impl Default for ContextConfig {
    fn default() -> Self {
        Self {
            pool: Arc::new(BufferPool::default()),
            copy_timeout: Duration::from_millis(500),
        }
    }
}

type BoxWriter = Box<dyn AsyncWrite + Send + Unpin>;
type BoxReader = Box<dyn AsyncRead + Send + Unpin>;

/// One accepted proxy request, alive until its proxy call returns.
///
/// The write side is the accepted connection; the read side supplies
/// request-body bytes, raw for CONNECT and upgrade tunnels, framed by
/// Content-Length otherwise.
pub struct Context {
    pub config: Arc<ContextConfig>,
    pub request: RequestHead,
    /// CONNECT or a request carrying an Upgrade header.
    pub connect: bool,
    /// Original `host:port` of the request, before any hybrid rewrite.
    pub host_port: String,
    pub host_no_port: String,
    pub port: u16,
    pub has_port: bool,
    pub ip: Option<IpAddr>,
    pub domain: Domain,
    /// The `host:port` the selected proxy dials.
    pub dial_host_port: String,
    writer: BoxWriter,
    reader: Option<BoxReader>,
    body_len: Option<u64>,
}

impl Context {
    /// Reads one HTTP/1 request head off an accepted connection and
    /// builds its context.
    ///
    /// A malformed request gets a `400` envelope written back before the
    /// error is returned.
    pub async fn accept<S>(config: Arc<ContextConfig>, stream: S) -> Result<Self>
    where
        S: AsyncRead + AsyncWrite + Send + Unpin + 'static,
    {
        let (read_half, write_half) = tokio::io::split(stream);
        let mut reader = PeekReader::new(read_half, HEAD_SECTION_MAX_LENGTH);
        let mut writer: BoxWriter = Box::new(write_half);
        let resolved = async {
            let head = RequestHead::read(&mut reader).await?;
            Resolved::from_head(head)
        }
        .await;
        match resolved {
            Ok(resolved) => Ok(resolved.into_context(config, Box::new(reader), writer)),
            Err(err) => {
                let envelope = HttpErr::hybrid(400, String::new(), format!("{err:#}"));
                envelope.write(writer.as_mut()).await.ok();
                Err(err)
            }
        }
    }

    /// The authority currently on the request, after any hybrid rewrite.
    pub fn authority(&self) -> String {
        self.request
            .uri
            .authority()
            .map(|a| a.to_string())
            .unwrap_or_else(|| self.host_port.clone())
    }

    /// Like [`authority`](Self::authority), with the resolved port always
    /// attached.
    pub fn authority_with_port(&self) -> String {
        match self.request.uri.authority() {
            Some(authority) if authority.port_u16().is_some() => authority.to_string(),
            Some(authority) => format!("{}:{}", authority, self.port),
            None => self.host_port.clone(),
        }
    }

    /// The write side toward the requesting client.
    pub fn writer(&mut self) -> &mut (dyn AsyncWrite + Send + Unpin) {
        self.writer.as_mut()
    }

    /// Whether the request carries body bytes worth forwarding.
    pub fn has_body(&self) -> bool {
        self.connect || self.body_len.unwrap_or(0) > 0
    }

    /// Takes the request-body reader.
    ///
    /// CONNECT and upgrade requests hand out the raw connection; other
    /// requests are limited to their declared Content-Length. Can only be
    /// taken once; later calls yield an empty reader.
    pub fn take_body(&mut self) -> BoxReader {
        let raw = match self.reader.take() {
            Some(reader) => reader,
            None => return Box::new(tokio::io::empty()),
        };
        if self.connect {
            return raw;
        }
        match self.body_len {
            Some(len) if len > 0 => Box::new(raw.take(len)),
            _ => Box::new(tokio::io::empty()),
        }
    }

    /// Confirms an established tunnel to the client.
    pub(crate) async fn write_connect_ok(&mut self) -> io::Result<()> {
        self.writer.write_all(CONNECT_OK).await?;
        self.writer.flush().await
    }

    /// Streams `src` to the client with the configured idle flush.
    pub(crate) async fn stream_to_client<R>(&mut self, src: &mut R) -> Result<u64, CopyError>
    where
        R: AsyncRead + Unpin + ?Sized,
    {
        let mut buf = self.config.pool.get();
        let idle = self.config.copy_timeout;
        let res = copy_idle_flush(src, self.writer.as_mut(), &mut buf, idle).await;
        self.config.pool.put(buf);
        res
    }

    /// Writes a `Hybrid`-typed error envelope to the client.
    pub async fn write_hybrid_err(&mut self, code: u16, info: impl Into<String>) {
        let envelope = HttpErr::hybrid(code, self.host_port.clone(), info.into());
        envelope.write(self.writer.as_mut()).await.ok();
    }

    /// Writes an arbitrary error envelope to the client.
    pub async fn write_err(&mut self, envelope: &HttpErr) {
        envelope.write(self.writer.as_mut()).await.ok();
    }
}

/// Host and routing fields resolved from a request head, before any IO
/// is attached.
struct Resolved {
    request: RequestHead,
    connect: bool,
    host_port: String,
    host_no_port: String,
    port: u16,
    has_port: bool,
    ip: Option<IpAddr>,
    domain: Domain,
    dial_host_port: String,
    body_len: Option<u64>,
}

impl Resolved {
    fn from_head(mut request: RequestHead) -> Result<Self> {
        let connect =
            request.method == Method::CONNECT || request.headers.contains_key(header::UPGRADE);

        let (host_port, host_no_port, port, has_port) = if request.method == Method::CONNECT {
            let authority = request
                .uri
                .authority()
                .context("bad request URI: CONNECT without authority")?
                .as_str();
            let parsed = authority_addr_full(None, authority);
            ensure_any!(parsed.3, "bad request URI: CONNECT without port");
            parsed
        } else {
            // The accepted protocol is a forward proxy; origin-form
            // targets carry no scheme and are rejected.
            let scheme = request
                .uri
                .scheme_str()
                .context("bad request URI: missing scheme")?;
            let authority = request
                .uri
                .authority()
                .context("bad request URI: missing host")?
                .as_str();
            authority_addr_full(Some(scheme), authority)
        };

        let ip = host_no_port.parse().ok();
        let domain = Domain::parse(&host_no_port)?;

        let dial_host_port = if domain.is_hybrid {
            let mut host = domain.next_hostname.clone();
            if has_port {
                host = format!("{host}:{port}");
            }
            let mut parts = request.uri.clone().into_parts();
            parts.authority =
                Some(Authority::try_from(host.as_str()).std_context("bad rewritten host")?);
            request.uri = Uri::from_parts(parts).std_context("bad rewritten request URI")?;
            format!("{}:{}", domain.dial_hostname, port)
        } else {
            host_port.clone()
        };

        let body_len = request.content_length();
        Ok(Self {
            request,
            connect,
            host_port,
            host_no_port,
            port,
            has_port,
            ip,
            domain,
            dial_host_port,
            body_len,
        })
    }

    fn into_context(self, config: Arc<ContextConfig>, reader: BoxReader, writer: BoxWriter) -> Context {
        Context {
            config,
            request: self.request,
            connect: self.connect,
            host_port: self.host_port,
            host_no_port: self.host_no_port,
            port: self.port,
            has_port: self.has_port,
            ip: self.ip,
            domain: self.domain,
            dial_host_port: self.dial_host_port,
            writer,
            reader: Some(reader),
            body_len: self.body_len,
        }
    }
}

/// The JSON error envelope sent for proxy failures.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "PascalCase")]
pub struct HttpErr {
    #[serde(skip)]
    pub code: u16,
    pub client_type: String,
    pub client_name: String,
    pub target_host: String,
    pub info: String,
}

impl HttpErr {
    pub fn new(
        code: u16,
        client_type: impl Into<String>,
        client_name: impl Into<String>,
        target_host: impl Into<String>,
        info: impl Into<String>,
    ) -> Self {
        Self {
            code,
            client_type: client_type.into(),
            client_name: client_name.into(),
            target_host: target_host.into(),
            info: info.into(),
        }
    }

    pub(crate) fn hybrid(code: u16, target_host: String, info: String) -> Self {
        Self::new(code, "Hybrid", "", target_host, info)
    }

    fn reason(&self) -> &'static str {
        StatusCode::from_u16(self.code)
            .ok()
            .and_then(|s| s.canonical_reason())
            .unwrap_or("")
    }

    /// Serializes the envelope as a complete HTTP/1.1 response.
    pub async fn write<W: AsyncWrite + Unpin + ?Sized>(&self, writer: &mut W) -> io::Result<()> {
        let body = serde_json::to_vec(self).unwrap_or_default();
        let head = format!(
            "HTTP/1.1 {} {}\r\nContent-Type: application/json\r\nContent-Length: {}\r\nConnection: close\r\n\r\n",
            self.code,
            self.reason(),
            body.len(),
        );
        writer.write_all(head.as_bytes()).await?;
        writer.write_all(&body).await?;
        writer.flush().await
    }
}

/// The body of a locally served response.
#[derive(Debug, Default)]
pub struct LocalResponse {
    pub status: StatusCode,
    pub headers: http::HeaderMap,
    pub body: bytes::Bytes,
}

/// An in-process HTTP handler reachable through the dispatcher's
/// local-server map.
pub trait LocalHandler: Send + Sync {
    fn serve<'a>(
        &'a self,
        request: &'a RequestHead,
    ) -> Pin<Box<dyn Future<Output = Result<LocalResponse>> + Send + 'a>>;
}

/// Writes an HTTP/1.1 response head lazily over a raw connection.
///
/// Mirrors the server-side response writer: headers accumulate until the
/// first body write or an explicit [`write_header`](Self::write_header),
/// after which the head is fixed.
pub struct ResponseWriter<'a> {
    writer: &'a mut (dyn AsyncWrite + Send + Unpin),
    headers: http::HeaderMap,
    wrote_header: bool,
}

impl<'a> ResponseWriter<'a> {
    pub fn new(writer: &'a mut (dyn AsyncWrite + Send + Unpin)) -> Self {
        Self {
            writer,
            headers: http::HeaderMap::new(),
            wrote_header: false,
        }
    }

    pub fn headers_mut(&mut self) -> &mut http::HeaderMap {
        &mut self.headers
    }

    /// Emits the status line and accumulated headers once.
    pub async fn write_header(&mut self, status: StatusCode) -> io::Result<()> {
        if self.wrote_header {
            return Ok(());
        }
        self.wrote_header = true;
        let mut head = format!(
            "HTTP/1.1 {} {}\r\n",
            status.as_u16(),
            status.canonical_reason().unwrap_or("")
        )
        .into_bytes();
        for (name, value) in self.headers.iter() {
            head.extend_from_slice(name.as_str().as_bytes());
            head.extend_from_slice(b": ");
            head.extend_from_slice(value.as_bytes());
            head.extend_from_slice(b"\r\n");
        }
        head.extend_from_slice(b"\r\n");
        self.writer.write_all(&head).await
    }

    /// Writes body bytes, emitting a `200 OK` head first when needed.
    pub async fn write(&mut self, buf: &[u8]) -> io::Result<()> {
        self.write_header(StatusCode::OK).await?;
        self.writer.write_all(buf).await
    }

    pub async fn flush(&mut self) -> io::Result<()> {
        self.writer.flush().await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config() -> Arc<ContextConfig> {
        Arc::new(ContextConfig::default())
    }

    async fn accept(raw: &[u8]) -> Result<Context> {
        let (client, server) = tokio::io::duplex(1 << 16);
        let mut client = client;
        client.write_all(raw).await.anyerr()?;
        Context::accept(config(), server).await
    }

    #[tokio::test]
    async fn connect_context() {
        let ctx = accept(b"CONNECT example.com:443 HTTP/1.1\r\nHost: example.com:443\r\n\r\n")
            .await
            .unwrap();
        assert!(ctx.connect);
        assert_eq!(ctx.host_port, "example.com:443");
        assert_eq!(ctx.host_no_port, "example.com");
        assert_eq!(ctx.port, 443);
        assert_eq!(ctx.dial_host_port, "example.com:443");
        assert!(!ctx.domain.is_hybrid);
    }

    #[tokio::test]
    async fn absolute_get_defaults_port() {
        let ctx = accept(b"GET http://example.com/a HTTP/1.1\r\nHost: example.com\r\n\r\n")
            .await
            .unwrap();
        assert!(!ctx.connect);
        assert!(!ctx.has_port);
        assert_eq!(ctx.host_port, "example.com:80");
        assert_eq!(ctx.dial_host_port, "example.com:80");
    }

    #[tokio::test]
    async fn upgrade_header_is_connect() {
        let ctx = accept(
            b"GET http://example.com/ws HTTP/1.1\r\nHost: example.com\r\nUpgrade: websocket\r\n\r\n",
        )
        .await
        .unwrap();
        assert!(ctx.connect);
    }

    #[tokio::test]
    async fn hybrid_host_rewrites_request() {
        let ctx = accept(
            b"GET http://192.168.22.22.over.a.b.hybrid/x HTTP/1.1\r\nHost: 192.168.22.22.over.a.b.hybrid\r\n\r\n",
        )
        .await
        .unwrap();
        assert!(ctx.domain.is_hybrid);
        assert_eq!(ctx.domain.next, "a");
        assert_eq!(ctx.dial_host_port, "192.168.22.22:80");
        assert_eq!(ctx.authority(), "192.168.22.22.over.-a.b.hybrid");
        assert_eq!(ctx.host_port, "192.168.22.22.over.a.b.hybrid:80");
    }

    #[tokio::test]
    async fn origin_form_is_rejected_with_envelope() {
        let (client, server) = tokio::io::duplex(1 << 16);
        let mut client = client;
        client
            .write_all(b"GET /index.html HTTP/1.1\r\nHost: example.com\r\n\r\n")
            .await
            .unwrap();
        assert!(Context::accept(config(), server).await.is_err());
        let mut reply = vec![0u8; 1024];
        let n = client.read(&mut reply).await.unwrap();
        let reply = String::from_utf8_lossy(&reply[..n]).to_string();
        assert!(reply.starts_with("HTTP/1.1 400 Bad Request\r\n"));
        assert!(reply.contains("\"ClientType\":\"Hybrid\""));
    }

    #[tokio::test]
    async fn connect_without_port_is_rejected() {
        assert!(
            accept(b"CONNECT example.com HTTP/1.1\r\nHost: example.com\r\n\r\n")
                .await
                .is_err()
        );
    }

    #[tokio::test]
    async fn body_reader_is_length_limited() {
        let mut ctx = accept(
            b"POST http://example.com/u HTTP/1.1\r\nHost: example.com\r\nContent-Length: 4\r\n\r\nbodyEXTRA",
        )
        .await
        .unwrap();
        assert!(ctx.has_body());
        let mut body = ctx.take_body();
        let mut out = Vec::new();
        body.read_to_end(&mut out).await.unwrap();
        assert_eq!(out, b"body");
    }

    #[test]
    fn envelope_serialization() {
        let envelope = HttpErr::new(502, "Direct", "", "example.com:80", "dial failed");
        let json = serde_json::to_string(&envelope).unwrap();
        assert_eq!(
            json,
            r#"{"ClientType":"Direct","ClientName":"","TargetHost":"example.com:80","Info":"dial failed"}"#
        );
    }
}
