use crate::error::{ProxyError, Result, is_closed_error};
use crate::forward::{self, Forwarder};
use crate::metrics::ProxyMetrics;
use crate::perm::{Action, PermissionEngine};
use crate::request::read_request_head;
use crate::resolve::Resolver;
use crate::stream::PrefixedStream;
use crate::tunnel;
use bytes::Bytes;
use prometheus::{IntCounter, Registry};
use regolith_config::Config;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::BufReader;
use tokio::net::TcpStream;
use tracing::{debug, info, warn};

/// Per-connection request dispatcher. Cheap to clone; every accepted
/// connection gets its own copy.
#[derive(Clone)]
pub struct ConnectionHandler {
    engine: Arc<PermissionEngine>,
    forwarder: Arc<Forwarder>,
    resolver: Resolver,
    connect_timeout: Duration,
    metrics: Option<Arc<ProxyMetrics>>,
}

impl ConnectionHandler {
    pub fn new(
        config: &Config,
        engine: Arc<PermissionEngine>,
        registry: Option<&Registry>,
    ) -> Result<Self> {
        let metrics = registry
            .map(ProxyMetrics::new)
            .transpose()?
            .map(Arc::new);
        let connect_timeout = config.timeouts.connect_timeout();
        let resolver = match config.dns_resolver {
            Some(addr) => {
                info!(nameserver = %addr, "Resolving outbound names through configured nameserver");
                Resolver::with_nameserver(addr, connect_timeout)
            }
            None => Resolver::system(),
        };

        Ok(Self {
            engine,
            forwarder: Arc::new(Forwarder::new(
                connect_timeout,
                config.timeouts.request_timeout(),
                resolver.clone(),
            )),
            resolver,
            connect_timeout,
            metrics,
        })
    }

    pub fn engine(&self) -> &Arc<PermissionEngine> {
        &self.engine
    }

    pub async fn handle_connection(&self, client: TcpStream, peer: SocketAddr) {
        debug!(peer = %peer, "New connection");
        if let Some(m) = &self.metrics {
            m.connection_opened();
        }

        if let Err(e) = self.dispatch(client, peer).await {
            if is_closed_error(&e) {
                debug!(peer = %peer, error = %e, "Connection closed");
            } else {
                if let Some(m) = &self.metrics {
                    m.error(error_label(&e));
                }
                debug!(peer = %peer, error = %e, "Dropping connection");
            }
        }

        if let Some(m) = &self.metrics {
            m.connection_closed();
        }
    }

    /// Serves requests off one connection until it closes, a request asks
    /// not to persist, or a CONNECT hands the socket to a tunnel.
    async fn dispatch(&self, client: TcpStream, peer: SocketAddr) -> Result<()> {
        let mut reader = BufReader::new(client);

        loop {
            let Some(head) = read_request_head(&mut reader).await? else {
                debug!(peer = %peer, "Client closed connection");
                return Ok(());
            };

            if head.is_connect() {
                let prefix = Bytes::copy_from_slice(reader.buffer());
                if !prefix.is_empty() {
                    debug!(peer = %peer, bytes = prefix.len(), "Replaying pipelined tunnel data");
                }
                let stream = PrefixedStream::new(prefix, reader.into_inner());
                tunnel::handle_connect(self, stream, &head, peer).await;
                return Ok(());
            }

            if !forward::handle_request(self, &mut reader, head, peer).await {
                return Ok(());
            }
        }
    }

    /// Resolves and records one permission decision.
    pub(crate) fn check_permission(&self, peer: SocketAddr, destination: &str) -> Action {
        let source = source_of(peer);
        let action = self.engine.resolve(&source, destination);

        if let Some(m) = &self.metrics {
            m.decision(action);
        }
        match action {
            Action::Accept => debug!(source = %source, destination = %destination, "Access granted"),
            Action::Deny => warn!(source = %source, destination = %destination, "Access denied"),
            Action::Ignore => {}
        }
        action
    }

    pub(crate) fn forwarder(&self) -> &Forwarder {
        &self.forwarder
    }

    pub(crate) fn resolver(&self) -> &Resolver {
        &self.resolver
    }

    pub(crate) fn connect_timeout(&self) -> Duration {
        self.connect_timeout
    }

    pub(crate) fn record_request(&self, kind: &str) {
        if let Some(m) = &self.metrics {
            m.request(kind);
        }
    }

    pub(crate) fn record_error(&self, error_type: &str) {
        if let Some(m) = &self.metrics {
            m.error(error_type);
        }
    }

    pub(crate) fn tunnel_counters(&self) -> Option<(IntCounter, IntCounter)> {
        self.metrics.as_ref().map(|m| m.tunnel_counters())
    }
}

/// Policy key of a client address. IPv4 clients on a dual-stack listener
/// arrive as `::ffff:a.b.c.d` and are keyed by the plain IPv4 form.
fn source_of(peer: SocketAddr) -> String {
    peer.ip().to_canonical().to_string()
}

fn error_label(err: &ProxyError) -> &'static str {
    match err {
        ProxyError::MalformedRequest(_) => "malformed",
        ProxyError::Timeout => "timeout",
        _ => "io",
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_source_of_unmaps_ipv4() {
        assert_eq!(source_of("[::ffff:127.0.0.1]:5000".parse().unwrap()), "127.0.0.1");
        assert_eq!(source_of("10.1.2.3:5000".parse().unwrap()), "10.1.2.3");
        assert_eq!(source_of("[2001:db8::1]:5000".parse().unwrap()), "2001:db8::1");
    }

    #[test]
    fn test_error_label() {
        assert_eq!(
            error_label(&ProxyError::MalformedRequest("bad".into())),
            "malformed"
        );
        assert_eq!(
            error_label(&ProxyError::Io(std::io::Error::other("disk"))),
            "io"
        );
        assert_eq!(error_label(&ProxyError::Timeout), "timeout");
    }
}
