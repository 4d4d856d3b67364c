//! Multi-transport HTTP forward proxy with source-routed tunnels.
//!
//! The proxy accepts cleartext HTTP/1.1 proxy traffic (absolute-form
//! requests, CONNECT, and upgrades), classifies each request through a
//! router chain, and dispatches it to one of several upstream transports:
//! a direct TCP dial, an existing HTTP proxy, an archive-backed file
//! store, or a multiplexed HTTP/2 tunnel carried over an authenticated
//! encrypted substrate.
//!
//! Hosts ending in `.hybrid` carry a source route between named upstream
//! peers; see [`domain`] for the grammar.

/// Request context construction and the error envelope.
pub mod context;
/// The `.hybrid` source-routing domain grammar.
pub mod domain;
/// The request dispatcher and accept loop.
pub mod hybrid;
mod parse;
/// Fixed-size reusable byte buffers shared by the copy engines.
pub mod pool;
/// Routers and the proxies they select.
pub mod proxy;
pub mod router;
/// Authenticated-encryption record layer and its handshake.
pub mod secret;
mod timeout;
/// HTTP/2 tunnel client and server.
pub mod tunnel;
mod util;

pub use context::{Context, ContextConfig, HttpErr, LocalHandler, LocalResponse, ResponseWriter};
pub use domain::Domain;
pub use hybrid::Hybrid;
pub use parse::{HttpResponse, RequestHead};
pub use pool::BufferPool;
pub use proxy::{ArchiveFs, ArchiveResponse, DirectProxy, ExistProxy, FileProxy, Proxy, TunnelProxy};
pub use router::{AdpRouter, FileRouter, HostMatcher, IpNetRouter, Router};
pub use timeout::{CopyError, copy_idle_flush};

/// Suffix marking hostnames that carry a hybrid source route.
pub const HYBRID_SUFFIX: &str = ".hybrid";

/// Authority prefix byte sent over the tunnel for plain-http targets.
pub(crate) const HOST_HTTP_PREFIX: u8 = b'H';
/// Authority prefix byte sent over the tunnel for https targets.
pub(crate) const HOST_HTTPS_PREFIX: u8 = b'S';

/// How much data to read for a request head before it's considered invalid.
pub(crate) const HEAD_SECTION_MAX_LENGTH: usize = 8192;

/// Canned reply confirming an established CONNECT tunnel.
pub(crate) const CONNECT_OK: &[u8] = b"HTTP/1.1 200 OK\r\n\r\n";
