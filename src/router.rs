use std::{
    collections::HashSet,
    net::IpAddr,
    sync::{Arc, Mutex},
};

use ipnet::IpNet;

use crate::{context::Context, proxy::Proxy};

/// A predicate over request contexts producing the proxy to run.
///
/// The dispatcher walks routers in order; the first `Some` wins, and a
/// chain with no opinion falls back to direct dialing.
pub trait Router: Send + Sync {
    /// Disabled routers are skipped without being consulted.
    fn disabled(&self) -> bool {
        false
    }

    /// Returns the proxy for this request, or `None` to pass.
    fn route(&self, ctx: &Context) -> Option<Arc<Proxy>>;
}

/// Black-box ad-block rule matcher consulted by [`AdpRouter`].
pub trait HostMatcher: Send + Sync {
    fn matches(&self, host: &str) -> bool;
}

/// Routes hosts through an ad-block matcher, with a hit cache.
pub struct AdpRouter {
    disabled: bool,
    matcher: Arc<dyn HostMatcher>,
    blocked: Option<Arc<Proxy>>,
    unblocked: Option<Arc<Proxy>>,
    blocked_hosts: Mutex<HashSet<String>>,
}

impl AdpRouter {
    pub fn new(
        matcher: Arc<dyn HostMatcher>,
        blocked: Option<Arc<Proxy>>,
        unblocked: Option<Arc<Proxy>>,
    ) -> Self {
        Self {
            disabled: false,
            matcher,
            blocked,
            unblocked,
            blocked_hosts: Mutex::new(HashSet::new()),
        }
    }

    pub fn disable(mut self) -> Self {
        self.disabled = true;
        self
    }

    fn is_blocked(&self, host: &str) -> bool {
        if self
            .blocked_hosts
            .lock()
            .expect("blocked host cache lock")
            .contains(host)
        {
            return true;
        }
        if self.matcher.matches(host) {
            self.blocked_hosts
                .lock()
                .expect("blocked host cache lock")
                .insert(host.to_string());
            return true;
        }
        false
    }
}

impl Router for AdpRouter {
    fn disabled(&self) -> bool {
        self.disabled
    }

    fn route(&self, ctx: &Context) -> Option<Arc<Proxy>> {
        if self.is_blocked(&ctx.host_no_port) {
            self.blocked.clone()
        } else {
            self.unblocked.clone()
        }
    }
}

/// Routes requests whose target IP falls in a configured set.
///
/// On a match, an attached archive proxy gets first refusal so LAN
/// targets can serve packaged assets before being proxied.
#[derive(Default)]
pub struct IpNetRouter {
    pub skip: bool,
    pub ips: Vec<IpAddr>,
    pub nets: Vec<IpNet>,
    /// Archive proxy consulted for matched targets.
    pub file: Option<Arc<Proxy>>,
    pub matched: Option<Arc<Proxy>>,
    pub unmatched: Option<Arc<Proxy>>,
}

impl IpNetRouter {
    fn contains(&self, ip: IpAddr) -> bool {
        self.ips.contains(&ip) || self.nets.iter().any(|net| net.contains(&ip))
    }
}

impl Router for IpNetRouter {
    fn disabled(&self) -> bool {
        self.skip
    }

    fn route(&self, ctx: &Context) -> Option<Arc<Proxy>> {
        let matched = ctx.ip.map(|ip| self.contains(ip)).unwrap_or(false);
        if matched {
            if let Some(file) = &self.file
                && file.serves_from_archive(ctx)
            {
                return Some(file.clone());
            }
            return self.matched.clone();
        }
        self.unmatched.clone()
    }
}

/// Lets an archive [`FileProxy`](crate::proxy::FileProxy) sit directly
/// in the router chain, claiming the requests it can serve.
pub struct FileRouter {
    pub proxy: Arc<Proxy>,
}

impl Router for FileRouter {
    fn disabled(&self) -> bool {
        match &*self.proxy {
            Proxy::File(file) => file.disabled,
            _ => true,
        }
    }

    fn route(&self, ctx: &Context) -> Option<Arc<Proxy>> {
        self.proxy
            .serves_from_archive(ctx)
            .then(|| self.proxy.clone())
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};

    use tokio::io::AsyncWriteExt;

    use super::*;
    use crate::{
        context::ContextConfig,
        proxy::{DirectProxy, Proxy},
    };

    async fn ctx(raw: &[u8]) -> Context {
        let (mut client, server) = tokio::io::duplex(1 << 16);
        client.write_all(raw).await.unwrap();
        Context::accept(Arc::new(ContextConfig::default()), server)
            .await
            .unwrap()
    }

    fn direct() -> Arc<Proxy> {
        Arc::new(Proxy::Direct(DirectProxy))
    }

    /// Router with a fixed answer, for chain-walking tests.
    struct Fixed {
        disabled: bool,
        proxy: Option<Arc<Proxy>>,
    }

    impl Router for Fixed {
        fn disabled(&self) -> bool {
            self.disabled
        }

        fn route(&self, _ctx: &Context) -> Option<Arc<Proxy>> {
            self.proxy.clone()
        }
    }

    #[tokio::test]
    async fn first_enabled_route_wins_deterministically() {
        let ctx = ctx(b"GET http://example.com/ HTTP/1.1\r\nHost: example.com\r\n\r\n").await;
        let skipped = direct();
        let winner = direct();
        let shadowed = direct();
        let chain: Vec<Box<dyn Router>> = vec![
            Box::new(Fixed {
                disabled: true,
                proxy: Some(skipped.clone()),
            }),
            Box::new(Fixed {
                disabled: false,
                proxy: None,
            }),
            Box::new(Fixed {
                disabled: false,
                proxy: Some(winner.clone()),
            }),
            Box::new(Fixed {
                disabled: false,
                proxy: Some(shadowed.clone()),
            }),
        ];
        for _ in 0..3 {
            let routed = chain
                .iter()
                .filter(|router| !router.disabled())
                .find_map(|router| router.route(&ctx))
                .unwrap();
            assert!(Arc::ptr_eq(&routed, &winner));
        }
    }

    #[tokio::test]
    async fn ip_router_routes_by_target_address() {
        let matched = direct();
        let unmatched = direct();
        let router = IpNetRouter {
            nets: vec!["127.0.0.0/8".parse().unwrap()],
            matched: Some(matched.clone()),
            unmatched: Some(unmatched.clone()),
            ..Default::default()
        };

        let loopback = ctx(b"GET http://127.0.0.1:9/ HTTP/1.1\r\nHost: 127.0.0.1:9\r\n\r\n").await;
        assert!(Arc::ptr_eq(&router.route(&loopback).unwrap(), &matched));

        let named = ctx(b"GET http://example.com/ HTTP/1.1\r\nHost: example.com\r\n\r\n").await;
        assert!(Arc::ptr_eq(&router.route(&named).unwrap(), &unmatched));
    }

    struct CountingMatcher(AtomicUsize);

    impl HostMatcher for CountingMatcher {
        fn matches(&self, host: &str) -> bool {
            self.0.fetch_add(1, Ordering::SeqCst);
            host == "ads.example"
        }
    }

    #[tokio::test]
    async fn adp_router_caches_blocked_hosts() {
        let blocked = direct();
        let matcher = Arc::new(CountingMatcher(AtomicUsize::new(0)));
        let router = AdpRouter::new(matcher.clone(), Some(blocked.clone()), None);

        let ctx = ctx(b"GET http://ads.example/ HTTP/1.1\r\nHost: ads.example\r\n\r\n").await;
        assert!(Arc::ptr_eq(&router.route(&ctx).unwrap(), &blocked));
        assert!(Arc::ptr_eq(&router.route(&ctx).unwrap(), &blocked));
        // the second hit is served from the blocked-host cache
        assert_eq!(matcher.0.load(Ordering::SeqCst), 1);
    }
}
