use std::{collections::HashMap, pin::Pin, sync::Arc};

use http::{HeaderValue, StatusCode, header, uri::PathAndQuery};
use n0_error::{Result, StdResultExt};
use tokio::{
    io::{AsyncWriteExt, copy},
    net::TcpStream,
};
use tracing::debug;

use crate::{
    context::{Context, HttpErr},
    parse::{HttpResponse, RequestHead},
    tunnel::TunnelClient,
};

/// The closed set of upstream transports a request can be dispatched to.
///
/// Every variant executes a request against its transport and knows how
/// to stamp the error envelope when that fails.
pub enum Proxy {
    Direct(DirectProxy),
    Exist(ExistProxy),
    File(FileProxy),
    Tunnel(TunnelProxy),
}

impl Proxy {
    pub(crate) async fn execute(&self, ctx: &mut Context) -> Result<()> {
        match self {
            Self::Direct(p) => p.execute(ctx).await,
            Self::Exist(p) => p.execute(ctx).await,
            Self::File(p) => p.execute(ctx).await,
            Self::Tunnel(p) => p.execute(ctx).await,
        }
    }

    fn client_type(&self) -> &'static str {
        match self {
            Self::Direct(_) => "Direct",
            Self::Exist(_) => "Exist",
            Self::File(_) => "Zip",
            Self::Tunnel(_) => "H2",
        }
    }

    fn client_name(&self) -> String {
        match self {
            Self::Direct(_) => String::new(),
            Self::Exist(p) => p.addr.clone(),
            Self::File(p) => p.name.clone(),
            Self::Tunnel(p) => p.name.clone(),
        }
    }

    /// Emits the JSON error envelope for a failed execution.
    pub(crate) async fn write_http_err(&self, ctx: &mut Context, code: u16, info: &str) {
        let envelope = HttpErr::new(
            code,
            self.client_type(),
            self.client_name(),
            ctx.host_port.clone(),
            info,
        );
        ctx.write_err(&envelope).await;
    }

    /// Whether this proxy is an archive store that can serve `ctx` itself.
    pub(crate) fn serves_from_archive(&self, ctx: &Context) -> bool {
        match self {
            Self::File(p) => p.accepts(ctx),
            _ => false,
        }
    }
}

/// Relays the established connection in both directions: request body
/// toward `remote` on a spawned task, the remote's bytes back to the
/// client with idle flushing on the current one.
///
/// Copy failures after this point are connection teardown, not proxy
/// errors; no envelope can be written to a stream that already carries
/// response bytes.
async fn pipe(ctx: &mut Context, remote: TcpStream) -> Result<()> {
    let (mut remote_read, mut remote_write) = remote.into_split();
    let mut body = ctx.take_body();
    tokio::spawn(async move {
        let _ = copy(&mut body, &mut remote_write).await;
        remote_write.shutdown().await.ok();
    });
    if let Err(err) = ctx.stream_to_client(&mut remote_read).await {
        debug!("pipe ended: {err:#}");
    }
    Ok(())
}

/// Dials the target directly and relays.
#[derive(Debug, Default)]
pub struct DirectProxy;

impl DirectProxy {
    async fn execute(&self, ctx: &mut Context) -> Result<()> {
        let mut remote = TcpStream::connect(&ctx.dial_host_port)
            .await
            .std_context("dial failed")?;
        if ctx.connect {
            ctx.write_connect_ok().await.anyerr()?;
        } else {
            let mut request = ctx.request.clone();
            request.headers.remove("proxy-connection");
            request
                .headers
                .insert(header::CONNECTION, HeaderValue::from_static("close"));
            request
                .write(&mut remote, &ctx.authority(), false)
                .await
                .std_context("write request failed")?;
        }
        pipe(ctx, remote).await
    }
}

/// Forwards through an existing HTTP proxy, absolute-form.
#[derive(Debug)]
pub struct ExistProxy {
    /// Address of the upstream proxy.
    pub addr: String,
    /// Keep the upstream connection header instead of forcing close.
    pub keep_alive: bool,
}

impl ExistProxy {
    pub fn new(addr: impl Into<String>) -> Self {
        Self {
            addr: addr.into(),
            keep_alive: false,
        }
    }

    async fn execute(&self, ctx: &mut Context) -> Result<()> {
        let mut remote = TcpStream::connect(&self.addr)
            .await
            .std_context("dial upstream proxy failed")?;
        let mut request = ctx.request.clone();
        if self.keep_alive {
            request.headers.remove(header::CONNECTION);
        } else {
            request
                .headers
                .insert(header::CONNECTION, HeaderValue::from_static("close"));
        }
        request
            .write(&mut remote, &ctx.authority(), true)
            .await
            .std_context("write request failed")?;
        pipe(ctx, remote).await
    }
}

/// A response served out of the static archive.
#[derive(Debug)]
pub struct ArchiveResponse {
    pub status: StatusCode,
    pub headers: http::HeaderMap,
    pub body: bytes::Bytes,
}

/// Black-box view of the gzip-in-zip archive filesystem.
pub trait ArchiveFs: Send + Sync {
    /// Whether the archive holds an entry for this request path.
    fn can_request(&self, path: &str) -> bool;

    /// Serves one request from the archive.
    fn round_trip<'a>(
        &'a self,
        request: &'a RequestHead,
    ) -> Pin<Box<dyn Future<Output = Result<ArchiveResponse>> + Send + 'a>>;
}

/// Serves matching paths from a static archive, or redirects them.
pub struct FileProxy {
    /// Archive label used in error envelopes.
    pub name: String,
    pub disabled: bool,
    fs: Arc<dyn ArchiveFs>,
    redirect: HashMap<String, String>,
}

impl FileProxy {
    pub fn new(
        name: impl Into<String>,
        fs: Arc<dyn ArchiveFs>,
        redirect: HashMap<String, String>,
    ) -> Self {
        Self {
            name: name.into(),
            disabled: false,
            fs,
            redirect,
        }
    }

    /// Whether this request is servable from the archive or redirect map.
    pub(crate) fn accepts(&self, ctx: &Context) -> bool {
        if !ctx.connect && self.fs.can_request(ctx.request.uri.path()) {
            return true;
        }
        self.redirect.contains_key(ctx.request.uri.path())
    }

    async fn execute(&self, ctx: &mut Context) -> Result<()> {
        if let Some(location) = self.redirect.get(ctx.request.uri.path()) {
            let mut location = location.clone();
            if let Some(query) = ctx.request.uri.query() {
                location = format!("{location}?{query}");
            }
            let head = format!("HTTP/1.1 301 Moved Permanently\r\nLocation: {location}\r\n\r\n");
            let writer = ctx.writer();
            writer.write_all(head.as_bytes()).await.anyerr()?;
            writer.flush().await.anyerr()?;
            return Ok(());
        }

        let mut request = ctx.request.clone();
        if request.uri.path() == "/index.html" {
            let mut parts = request.uri.clone().into_parts();
            parts.path_and_query = Some(PathAndQuery::from_static("/"));
            request.uri = http::Uri::from_parts(parts).std_context("bad archive path")?;
        }
        let response = self.fs.round_trip(&request).await?;

        let mut head = HttpResponse::new(response.status);
        head.headers = response.headers;
        head.headers.insert(
            header::CONTENT_LENGTH,
            HeaderValue::from_str(&response.body.len().to_string()).anyerr()?,
        );
        head.headers
            .insert(header::CONNECTION, HeaderValue::from_static("close"));
        let writer = ctx.writer();
        head.write(writer).await.anyerr()?;
        writer.write_all(&response.body).await.anyerr()?;
        writer.flush().await.anyerr()?;
        Ok(())
    }
}

/// Forwards through the multiplexed HTTP/2 tunnel toward a named upstream.
pub struct TunnelProxy {
    /// The dialer-registry name this proxy rides on.
    pub name: String,
    pub client: Arc<TunnelClient>,
}

impl TunnelProxy {
    pub fn new(name: impl Into<String>, client: Arc<TunnelClient>) -> Self {
        Self {
            name: name.into(),
            client,
        }
    }

    async fn execute(&self, ctx: &mut Context) -> Result<()> {
        self.client.proxy(ctx, &self.name).await
    }
}
