//! Outbound name resolution for tunnels and forwarded requests.
//!
//! By default names go through the system resolver. With a configured
//! nameserver every lookup is sent there instead, over UDP with TCP
//! fallback.

use hickory_resolver::TokioAsyncResolver;
use hickory_resolver::config::{NameServerConfigGroup, ResolverConfig, ResolverOpts};
use std::fmt;
use std::io;
use std::net::{IpAddr, SocketAddr};
use std::time::Duration;

#[derive(Clone)]
pub struct Resolver {
    nameserver: Option<(SocketAddr, TokioAsyncResolver)>,
}

impl fmt::Debug for Resolver {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Resolver")
            .field("nameserver", &self.nameserver.as_ref().map(|(addr, _)| addr))
            .finish()
    }
}

impl Resolver {
    pub fn system() -> Self {
        Self { nameserver: None }
    }

    /// Sends every lookup to `addr`; each query attempt gives up after
    /// `timeout`.
    pub fn with_nameserver(addr: SocketAddr, timeout: Duration) -> Self {
        let group = NameServerConfigGroup::from_ips_clear(&[addr.ip()], addr.port(), true);
        let config = ResolverConfig::from_parts(None, vec![], group);
        let mut opts = ResolverOpts::default();
        opts.timeout = timeout;
        opts.cache_size = 0;

        Self {
            nameserver: Some((addr, TokioAsyncResolver::tokio(config, opts))),
        }
    }

    pub fn nameserver(&self) -> Option<SocketAddr> {
        self.nameserver.as_ref().map(|(addr, _)| *addr)
    }

    /// Resolves `host` to socket addresses on `port`.
    ///
    /// IP literals, bracketed or not, are returned without a lookup.
    pub async fn lookup(&self, host: &str, port: u16) -> io::Result<Vec<SocketAddr>> {
        let host = host.trim_start_matches('[').trim_end_matches(']');
        if let Ok(ip) = host.parse::<IpAddr>() {
            return Ok(vec![SocketAddr::new(ip, port)]);
        }

        let addrs: Vec<SocketAddr> = match &self.nameserver {
            Some((_, resolver)) => resolver
                .lookup_ip(host)
                .await
                .map_err(|e| io::Error::new(io::ErrorKind::NotFound, e))?
                .iter()
                .map(|ip| SocketAddr::new(ip, port))
                .collect(),
            None => tokio::net::lookup_host((host, port)).await?.collect(),
        };

        if addrs.is_empty() {
            return Err(io::Error::new(
                io::ErrorKind::NotFound,
                format!("no addresses for {}", host),
            ));
        }
        Ok(addrs)
    }
}
