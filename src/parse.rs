use std::str::FromStr;

use http::{HeaderMap, HeaderName, HeaderValue, Method, StatusCode, Uri, Version, header};
use n0_error::{Result, StackResultExt, StdResultExt};
use tokio::io::{self, AsyncRead, AsyncWrite, AsyncWriteExt};

use crate::util::PeekReader;

/// A parsed HTTP/1 request head.
///
/// The request target is kept as received: authority-form for CONNECT,
/// absolute-form for forward-proxy requests. The body stays on the
/// connection the head was read from.
#[derive(Debug, Clone)]
pub struct RequestHead {
    pub method: Method,
    pub uri: Uri,
    pub version: Version,
    pub headers: HeaderMap<HeaderValue>,
}

impl RequestHead {
    /// Reads and parses a request head, consuming it from `reader`.
    ///
    /// Returns [`io::ErrorKind::OutOfMemory`] if the head exceeds the
    /// buffer limit before its terminating blank line arrives.
    pub(crate) async fn read<R: AsyncRead + Unpin>(
        reader: &mut PeekReader<R>,
    ) -> Result<Self> {
        loop {
            if let Some((len, head)) = Self::parse(reader.buffered())? {
                reader.consume(len);
                return Ok(head);
            }
            if reader.at_limit() || reader.fill().await? == 0 {
                return Err(io::Error::new(
                    io::ErrorKind::OutOfMemory,
                    "buffer limit reached before end of request head",
                )
                .into());
            }
        }
    }

    /// Parses a request head from a buffer; `None` when incomplete.
    ///
    /// Returns the length of the head section and the parsed head.
    pub fn parse(buf: &[u8]) -> Result<Option<(usize, Self)>> {
        let mut headers = [httparse::EMPTY_HEADER; 64];
        let mut req = httparse::Request::new(&mut headers);
        match req.parse(buf).std_context("invalid HTTP request")? {
            httparse::Status::Partial => Ok(None),
            httparse::Status::Complete(head_len) => {
                let method: Method = req
                    .method
                    .context("missing HTTP method")?
                    .parse()
                    .std_context("invalid HTTP method")?;
                let target = req.path.context("missing request target")?;
                let uri = Uri::from_str(target).std_context("invalid request target")?;
                let headers = HeaderMap::from_iter(req.headers.iter().flat_map(|h| {
                    let name = HeaderName::from_bytes(h.name.as_bytes()).ok()?;
                    let value = HeaderValue::from_bytes(h.value).ok()?;
                    Some((name, value))
                }));
                Ok(Some((
                    head_len,
                    Self {
                        method,
                        uri,
                        version: Version::HTTP_11,
                        headers,
                    },
                )))
            }
        }
    }

    /// The request target to put on an outgoing request line.
    ///
    /// `absolute` keeps the full URI the way a request to another proxy
    /// needs it; otherwise the origin-form path is used. CONNECT always
    /// uses its authority.
    fn request_target(&self, absolute: bool) -> String {
        if self.method == Method::CONNECT {
            return self
                .uri
                .authority()
                .map(|a| a.to_string())
                .unwrap_or_else(|| self.uri.to_string());
        }
        if absolute {
            return self.uri.to_string();
        }
        self.uri
            .path_and_query()
            .map(|pq| pq.to_string())
            .unwrap_or_else(|| "/".to_string())
    }

    /// Serializes the head, placing `host` in the Host header.
    pub(crate) async fn write<W: AsyncWrite + Unpin + ?Sized>(
        &self,
        writer: &mut W,
        host: &str,
        absolute: bool,
    ) -> io::Result<()> {
        let version = match self.version {
            Version::HTTP_10 => "HTTP/1.0",
            _ => "HTTP/1.1",
        };
        let mut head = format!(
            "{} {} {}\r\nHost: {}\r\n",
            self.method,
            self.request_target(absolute),
            version,
            host
        )
        .into_bytes();
        for (name, value) in self.headers.iter() {
            if name == header::HOST {
                continue;
            }
            head.extend_from_slice(name.as_str().as_bytes());
            head.extend_from_slice(b": ");
            head.extend_from_slice(value.as_bytes());
            head.extend_from_slice(b"\r\n");
        }
        head.extend_from_slice(b"\r\n");
        writer.write_all(&head).await
    }

    /// The declared request body length, if the head carries one.
    pub fn content_length(&self) -> Option<u64> {
        self.headers
            .get(header::CONTENT_LENGTH)?
            .to_str()
            .ok()?
            .parse()
            .ok()
    }
}

/// A parsed HTTP/1 response head.
#[derive(Debug, Clone)]
pub struct HttpResponse {
    pub status: StatusCode,
    pub reason: Option<String>,
    pub headers: HeaderMap<HeaderValue>,
}

impl HttpResponse {
    pub(crate) fn new(status: StatusCode) -> Self {
        Self {
            status,
            reason: None,
            headers: HeaderMap::new(),
        }
    }

    /// Parses a response head from a buffer; `None` when incomplete.
    ///
    /// Returns the length of the head section and the parsed head.
    pub fn parse(buf: &[u8]) -> Result<Option<(usize, Self)>> {
        let mut headers = [httparse::EMPTY_HEADER; 64];
        let mut res = httparse::Response::new(&mut headers);
        match res.parse(buf).std_context("invalid HTTP response")? {
            httparse::Status::Partial => Ok(None),
            httparse::Status::Complete(head_len) => {
                let code = res.code.context("missing response status code")?;
                let status =
                    StatusCode::from_u16(code).std_context("invalid response status code")?;
                let reason = res.reason.map(ToOwned::to_owned);
                let headers = HeaderMap::from_iter(res.headers.iter().flat_map(|h| {
                    let name = HeaderName::from_bytes(h.name.as_bytes()).ok()?;
                    let value = HeaderValue::from_bytes(h.value).ok()?;
                    Some((name, value))
                }));
                Ok(Some((
                    head_len,
                    Self {
                        status,
                        reason,
                        headers,
                    },
                )))
            }
        }
    }

    /// Reads and parses a response head, consuming it from `reader`.
    pub(crate) async fn read<R: AsyncRead + Unpin>(
        reader: &mut PeekReader<R>,
    ) -> Result<Self> {
        loop {
            if let Some((len, head)) = Self::parse(reader.buffered())? {
                reader.consume(len);
                return Ok(head);
            }
            if reader.at_limit() || reader.fill().await? == 0 {
                return Err(io::Error::new(
                    io::ErrorKind::OutOfMemory,
                    "buffer limit reached before end of response head",
                )
                .into());
            }
        }
    }

    /// Formats the status line with the received or canonical reason phrase.
    pub fn status_line(&self) -> String {
        format!(
            "HTTP/1.1 {} {}\r\n",
            self.status.as_u16(),
            self.reason
                .as_deref()
                .or(self.status.canonical_reason())
                .unwrap_or("")
        )
    }

    /// Serializes the head, including the terminating blank line.
    pub(crate) async fn write<W: AsyncWrite + Unpin + ?Sized>(
        &self,
        writer: &mut W,
    ) -> io::Result<()> {
        let mut head = self.status_line().into_bytes();
        for (name, value) in self.headers.iter() {
            head.extend_from_slice(name.as_str().as_bytes());
            head.extend_from_slice(b": ");
            head.extend_from_slice(value.as_bytes());
            head.extend_from_slice(b"\r\n");
        }
        head.extend_from_slice(b"\r\n");
        writer.write_all(&head).await
    }
}

/// Whether a header is connection-specific and must not cross hops.
pub(crate) fn is_connection_header(name: &HeaderName) -> bool {
    matches!(
        name.as_str(),
        "connection" | "keep-alive" | "proxy-connection" | "transfer-encoding" | "upgrade"
    )
}

/// Drops connection-specific headers before a hop change.
pub(crate) fn strip_connection_headers(headers: &mut HeaderMap) {
    let names: Vec<_> = headers
        .keys()
        .filter(|name| is_connection_header(name))
        .cloned()
        .collect();
    for name in names {
        headers.remove(name);
    }
}

/// Splits `host[:port]`, unbracketing IPv6 literals.
fn split_host_port(authority: &str) -> Option<(&str, u16)> {
    if let Some(rest) = authority.strip_prefix('[') {
        let (host, tail) = rest.split_once(']')?;
        let port = tail.strip_prefix(':')?.parse().ok()?;
        return Some((host, port));
    }
    let (host, port) = authority.rsplit_once(':')?;
    if host.contains(':') {
        return None;
    }
    Some((host, port.parse().ok()?))
}

fn join_host_port(host: &str, port: u16) -> String {
    if host.contains(':') {
        format!("[{host}]:{port}")
    } else {
        format!("{host}:{port}")
    }
}

/// Resolves an authority to `(host_port, host_no_port, port, had_port)`.
///
/// The port defaults from the scheme when absent (`http`/`ws` get 80,
/// everything else 443). Hostnames are lowered through IDNA ToASCII;
/// literals that fail the mapping pass through unchanged.
pub(crate) fn authority_addr_full(
    scheme: Option<&str>,
    authority: &str,
) -> (String, String, u16, bool) {
    let (host, port, had_port) = match split_host_port(authority) {
        Some((host, port)) => (host.to_string(), port, true),
        None => {
            let port = match scheme {
                Some("http") | Some("ws") => 80,
                _ => 443,
            };
            let host = authority
                .strip_prefix('[')
                .and_then(|h| h.strip_suffix(']'))
                .unwrap_or(authority);
            (host.to_string(), port, false)
        }
    };
    let host = idna::domain_to_ascii(&host).unwrap_or(host);
    (join_host_port(&host, port), host, port, had_port)
}
