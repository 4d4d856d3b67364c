use std::{collections::HashMap, sync::Arc};

use http::HeaderValue;
use n0_error::Result;
use tokio::{
    io::{AsyncRead, AsyncWrite},
    net::TcpListener,
};
use tokio_util::sync::CancellationToken;
use tracing::{Instrument, debug, error_span, warn};

use crate::{
    context::{Context, ContextConfig, LocalHandler, ResponseWriter},
    proxy::{DirectProxy, Proxy},
    router::Router,
};

/// The request dispatcher: router chain, upstream registry, and local
/// servers, consulted in the order the routing grammar demands.
///
/// All tables are built once at startup and read-only while serving.
pub struct Hybrid {
    pub config: Arc<ContextConfig>,
    /// Ordered router chain; first non-`None` route wins.
    pub routers: Vec<Arc<dyn Router>>,
    /// Upstream registry consulted for `.hybrid` next hops.
    pub proxies: HashMap<String, Arc<Proxy>>,
    /// In-process servers addressed as terminal `.hybrid` dial targets.
    pub local_servers: HashMap<String, Arc<dyn LocalHandler>>,
    direct: Arc<Proxy>,
}

impl Hybrid {
    pub fn new(config: Arc<ContextConfig>) -> Self {
        let direct = Arc::new(Proxy::Direct(DirectProxy));
        // the registry always knows how to dial out itself
        let proxies = HashMap::from([("direct".to_string(), direct.clone())]);
        Self {
            config,
            routers: Vec::new(),
            proxies,
            local_servers: HashMap::new(),
            direct,
        }
    }

    /// Accepts proxy clients until the listener fails; dropping the
    /// future cancels every connection task.
    pub async fn serve(self: Arc<Self>, listener: TcpListener) -> Result<()> {
        let cancel = CancellationToken::new();
        let _cancel_guard = cancel.clone().drop_guard();
        let mut id = 0u64;
        loop {
            let (stream, peer) = listener.accept().await?;
            let this = self.clone();
            tokio::spawn(
                cancel
                    .child_token()
                    .run_until_cancelled_owned(async move {
                        debug!(%peer, "accepted connection");
                        this.serve_stream(stream).await;
                    })
                    .instrument(error_span!("conn", id)),
            );
            id += 1;
        }
    }

    /// Serves one accepted client connection to completion.
    pub async fn serve_stream<S>(&self, stream: S)
    where
        S: AsyncRead + AsyncWrite + Send + Unpin + 'static,
    {
        match Context::accept(self.config.clone(), stream).await {
            Ok(mut ctx) => self.dispatch(&mut ctx).await,
            Err(err) => debug!("bad request: {err:#}"),
        }
    }

    /// Routes one request: `.hybrid` domains go through the local-server
    /// map or the upstream registry, everything else walks the router
    /// chain and falls back to direct dialing.
    pub async fn dispatch(&self, ctx: &mut Context) {
        if ctx.domain.is_hybrid {
            if ctx.domain.is_end {
                if let Some(handler) = self.local_servers.get(&ctx.domain.dial_hostname) {
                    let handler = handler.clone();
                    self.serve_local(&handler, ctx).await;
                    return;
                }
                if ctx.domain.is_over {
                    self.route_chain(ctx).await;
                    return;
                }
                ctx.write_hybrid_err(404, "no local server").await;
                return;
            }
            let Some(proxy) = self.proxies.get(&ctx.domain.next) else {
                let next = ctx.domain.next.clone();
                ctx.write_hybrid_err(404, format!("upstream not found: {next}"))
                    .await;
                return;
            };
            let proxy = proxy.clone();
            self.run_proxy(&proxy, ctx).await;
            return;
        }
        self.route_chain(ctx).await;
    }

    async fn route_chain(&self, ctx: &mut Context) {
        for router in &self.routers {
            if router.disabled() {
                continue;
            }
            let Some(proxy) = router.route(ctx) else {
                continue;
            };
            self.run_proxy(&proxy, ctx).await;
            return;
        }
        let direct = self.direct.clone();
        self.run_proxy(&direct, ctx).await;
    }

    async fn run_proxy(&self, proxy: &Arc<Proxy>, ctx: &mut Context) {
        if let Err(err) = proxy.execute(ctx).await {
            warn!(host = %ctx.host_port, "proxy failed: {err:#}");
            proxy.write_http_err(ctx, 502, &format!("{err:#}")).await;
        }
    }

    async fn serve_local(&self, handler: &Arc<dyn LocalHandler>, ctx: &mut Context) {
        let response = match handler.serve(&ctx.request).await {
            Ok(response) => response,
            Err(err) => {
                warn!("local handler failed: {err:#}");
                ctx.write_hybrid_err(502, format!("{err:#}")).await;
                return;
            }
        };
        let body = response.body;
        let mut writer = ResponseWriter::new(ctx.writer());
        *writer.headers_mut() = response.headers;
        if !writer.headers_mut().contains_key(http::header::CONTENT_LENGTH) {
            if let Ok(len) = HeaderValue::from_str(&body.len().to_string()) {
                writer
                    .headers_mut()
                    .insert(http::header::CONTENT_LENGTH, len);
            }
        }
        writer
            .headers_mut()
            .insert(http::header::CONNECTION, HeaderValue::from_static("close"));
        let written = async {
            writer.write_header(response.status).await?;
            writer.write(&body).await?;
            writer.flush().await
        }
        .await;
        if let Err(err) = written {
            debug!("local response failed: {err}");
        }
    }
}
