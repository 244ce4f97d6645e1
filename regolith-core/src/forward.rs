//! Plain-HTTP forward proxying: one request/response exchange per call.

use crate::connection::ConnectionHandler;
use crate::error::{ProxyError, Result, is_closed_error};
use crate::perm::Action;
use crate::perm::address::destination;
use crate::request::{MAX_BODY_SIZE, RequestHead, read_body, write_status};
use crate::resolve::Resolver;
use bytes::Bytes;
use http::header::{CONNECTION, CONTENT_LENGTH, HOST, TRANSFER_ENCODING};
use http::uri::Authority;
use http::{HeaderMap, HeaderName, HeaderValue, Method, Request, StatusCode, Uri, Version};
use http_body_util::{BodyExt, Full};
use hyper::body::Incoming;
use hyper::ext::ReasonPhrase;
use hyper_util::client::legacy::Client;
use hyper_util::client::legacy::connect::HttpConnector;
use hyper_util::rt::TokioExecutor;
use std::net::SocketAddr;
use std::time::Duration;
use tokio::io::{AsyncBufRead, AsyncWrite, AsyncWriteExt};
use tokio::time::{Instant, timeout_at};
use tracing::{debug, warn};

const DEFAULT_HTTP_PORT: u16 = 80;

/// Headers that only describe the connection they arrived on.
const HOP_BY_HOP: [&str; 9] = [
    "proxy-connection",
    "connection",
    "keep-alive",
    "proxy-authenticate",
    "proxy-authorization",
    "te",
    "trailers",
    "transfer-encoding",
    "upgrade",
];

pub fn strip_hop_by_hop(headers: &mut HeaderMap) {
    for name in HOP_BY_HOP {
        headers.remove(name);
    }
}

/// Outbound HTTP client for forwarded requests.
///
/// Pooling is off: every forwarded request gets a fresh origin connection
/// that is dropped with the response.
#[derive(Debug, Clone)]
pub struct Forwarder {
    client: Client<HttpConnector, Full<Bytes>>,
    resolver: Resolver,
    timeout: Duration,
}

impl Forwarder {
    pub fn new(connect_timeout: Duration, request_timeout: Duration, resolver: Resolver) -> Self {
        let mut connector = HttpConnector::new();
        connector.set_connect_timeout(Some(connect_timeout));
        connector.set_nodelay(true);

        let client = Client::builder(TokioExecutor::new())
            .pool_max_idle_per_host(0)
            .build(connector);

        Self {
            client,
            resolver,
            timeout: request_timeout,
        }
    }

    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    async fn send(
        &self,
        mut request: Request<Full<Bytes>>,
        deadline: Instant,
    ) -> Result<hyper::Response<Incoming>> {
        if self.resolver.nameserver().is_some() {
            let pinned = timeout_at(deadline, self.pin_origin(request.uri())).await??;
            *request.uri_mut() = pinned;
        }
        timeout_at(deadline, self.client.request(request))
            .await?
            .map_err(ProxyError::Upstream)
    }

    /// Rewrites the target to the first resolved address. `Host` was set
    /// from the original authority and is left alone.
    async fn pin_origin(&self, uri: &Uri) -> Result<Uri> {
        let host = uri.host().unwrap_or_default();
        let port = uri.port_u16().unwrap_or(DEFAULT_HTTP_PORT);
        let addr = self
            .resolver
            .lookup(host, port)
            .await
            .map_err(|source| ProxyError::Resolve {
                host: host.to_string(),
                source,
            })?
            .into_iter()
            .next()
            .ok_or_else(|| ProxyError::MalformedRequest(format!("no address for {}", host)))?;

        let path = uri.path_and_query().map(|p| p.as_str()).unwrap_or("/");
        Uri::builder()
            .scheme("http")
            .authority(addr.to_string())
            .path_and_query(path)
            .build()
            .map_err(|e| ProxyError::MalformedRequest(e.to_string()))
    }
}

/// How the response body is delimited towards the client.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Framing {
    Empty,
    Length,
    Chunked,
    Close,
}

/// Forwards one non-CONNECT request. Returns whether the client
/// connection may carry another request.
pub(crate) async fn handle_request<S>(
    handler: &ConnectionHandler,
    conn: &mut S,
    mut head: RequestHead,
    peer: SocketAddr,
) -> bool
where
    S: AsyncBufRead + AsyncWrite + Unpin,
{
    handler.record_request("forward");

    let keep_alive = head.at_least_http11()
        && (head.header_is("proxy-connection", "keep-alive")
            || head.header_is("connection", "keep-alive"));

    // Body framing must be read from the original headers
    let mut framing_headers = HeaderMap::new();
    for name in [TRANSFER_ENCODING, CONTENT_LENGTH] {
        for value in head.headers.get_all(&name) {
            framing_headers.append(name.clone(), value.clone());
        }
    }
    strip_hop_by_hop(&mut head.headers);
    // Re-derived from the buffered body
    head.headers.remove(CONTENT_LENGTH);

    let authority = request_authority(&head);
    let valid_scheme = head.uri.scheme_str() == Some("http");
    let Some(authority) = authority.filter(|a| valid_scheme && !a.host().is_empty()) else {
        debug!(peer = %peer, uri = %head.uri, "Rejecting non-proxy request");
        let _ = write_status(conn, head.version, StatusCode::BAD_REQUEST, None).await;
        return false;
    };
    match HeaderValue::from_str(&host_header(&authority)) {
        Ok(value) => {
            head.headers.insert(HOST, value);
        }
        Err(_) => {
            let _ = write_status(conn, head.version, StatusCode::BAD_REQUEST, None).await;
            return false;
        }
    }

    let target = destination(
        authority.host(),
        authority.port_u16().unwrap_or(DEFAULT_HTTP_PORT),
    );
    if handler.check_permission(peer, &target) != Action::Accept {
        let _ = write_status(conn, head.version, StatusCode::BAD_GATEWAY, None).await;
        return false;
    }

    let body = match read_body(conn, &framing_headers, MAX_BODY_SIZE).await {
        Ok(body) => body,
        Err(e @ ProxyError::BodyTooLarge { .. }) => {
            handler.record_error("body_too_large");
            debug!(peer = %peer, error = %e, "Rejecting request body");
            let _ = write_status(conn, head.version, StatusCode::PAYLOAD_TOO_LARGE, None).await;
            return false;
        }
        Err(e) => {
            debug!(peer = %peer, error = %e, "Failed to read request body");
            return false;
        }
    };

    let client_version = head.version;
    let is_head = head.method == Method::HEAD;
    let mut request = Request::new(Full::new(body));
    *request.method_mut() = head.method;
    *request.uri_mut() = head.uri;
    *request.headers_mut() = head.headers;

    let forwarder = handler.forwarder();
    let deadline = Instant::now() + forwarder.timeout();
    let response = match forwarder.send(request, deadline).await {
        Ok(response) => response,
        Err(e) => {
            handler.record_error("upstream");
            if is_closed_error(&e) {
                debug!(peer = %peer, target = %target, error = %e, "Upstream request failed");
            } else {
                warn!(peer = %peer, target = %target, error = %e, "Upstream request failed");
            }
            let _ = write_status(conn, client_version, StatusCode::BAD_GATEWAY, None).await;
            return false;
        }
    };

    debug!(peer = %peer, target = %target, status = response.status().as_u16(), "Forwarded request");

    match write_response(conn, response, client_version, is_head, keep_alive, deadline).await {
        Ok(framing) => keep_alive && framing != Framing::Close,
        Err(e) => {
            if is_closed_error(&e) {
                debug!(peer = %peer, target = %target, error = %e, "Response write aborted");
            } else {
                handler.record_error("response");
                warn!(peer = %peer, target = %target, error = %e, "Response write failed");
            }
            false
        }
    }
}

/// `Host` value for `authority`, without the port when it is the default.
fn host_header(authority: &Authority) -> String {
    match authority.port_u16() {
        Some(DEFAULT_HTTP_PORT) => authority.host().to_string(),
        _ => authority.as_str().to_string(),
    }
}

/// The origin named by an absolute-form target, or by `Host` otherwise.
fn request_authority(head: &RequestHead) -> Option<Authority> {
    if let Some(authority) = head.uri.authority() {
        return Some(authority.clone());
    }
    head.headers
        .get(HOST)
        .and_then(|h| h.to_str().ok())
        .and_then(|h| h.parse::<Authority>().ok())
}

fn response_framing(
    status: StatusCode,
    headers: &HeaderMap,
    client_version: Version,
    is_head: bool,
) -> Framing {
    if is_head
        || status.is_informational()
        || status == StatusCode::NO_CONTENT
        || status == StatusCode::NOT_MODIFIED
    {
        Framing::Empty
    } else if headers.contains_key(CONTENT_LENGTH) {
        Framing::Length
    } else if client_version == Version::HTTP_11 {
        Framing::Chunked
    } else {
        Framing::Close
    }
}

async fn write_response<W>(
    conn: &mut W,
    response: hyper::Response<Incoming>,
    client_version: Version,
    is_head: bool,
    keep_alive: bool,
    deadline: Instant,
) -> Result<Framing>
where
    W: AsyncWrite + Unpin,
{
    let (mut parts, mut body) = response.into_parts();

    strip_hop_by_hop(&mut parts.headers);
    if keep_alive {
        parts
            .headers
            .insert(CONNECTION, HeaderValue::from_static("keep-alive"));
        parts.headers.insert(
            HeaderName::from_static("proxy-connection"),
            HeaderValue::from_static("keep-alive"),
        );
        parts.headers.insert(
            HeaderName::from_static("keep-alive"),
            HeaderValue::from_static("timeout=60"),
        );
    }

    let framing = response_framing(parts.status, &parts.headers, client_version, is_head);
    if framing == Framing::Chunked {
        parts
            .headers
            .insert(TRANSFER_ENCODING, HeaderValue::from_static("chunked"));
    }

    let reason = parts
        .extensions
        .get::<ReasonPhrase>()
        .and_then(|r| std::str::from_utf8(r.as_bytes()).ok())
        .or_else(|| parts.status.canonical_reason())
        .unwrap_or("");

    // The framing is ours, so is the version: never the origin's
    let mut out = Vec::with_capacity(512);
    out.extend_from_slice(format!("HTTP/1.1 {} {}\r\n", parts.status.as_u16(), reason).as_bytes());
    for (name, value) in &parts.headers {
        out.extend_from_slice(name.as_str().as_bytes());
        out.extend_from_slice(b": ");
        out.extend_from_slice(value.as_bytes());
        out.extend_from_slice(b"\r\n");
    }
    out.extend_from_slice(b"\r\n");
    conn.write_all(&out).await?;

    if framing != Framing::Empty {
        while let Some(frame) = timeout_at(deadline, body.frame()).await? {
            let frame = frame.map_err(|e| ProxyError::Io(std::io::Error::other(e)))?;
            let Ok(data) = frame.into_data() else {
                // Trailers are dropped
                continue;
            };
            if data.is_empty() {
                continue;
            }
            if framing == Framing::Chunked {
                conn.write_all(format!("{:x}\r\n", data.len()).as_bytes())
                    .await?;
                conn.write_all(&data).await?;
                conn.write_all(b"\r\n").await?;
            } else {
                conn.write_all(&data).await?;
            }
        }
        if framing == Framing::Chunked {
            conn.write_all(b"0\r\n\r\n").await?;
        }
    }

    conn.flush().await?;
    Ok(framing)
}
