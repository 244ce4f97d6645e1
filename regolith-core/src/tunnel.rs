use crate::connection::ConnectionHandler;
use crate::error::is_closed_error;
use crate::perm::Action;
use crate::perm::address::destination;
use crate::request::{RequestHead, write_status};
use http::StatusCode;
use prometheus::IntCounter;
use std::net::SocketAddr;
use tokio::io::{self, AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::task::JoinSet;
use tokio::time::timeout;
use tracing::{debug, info, warn};

/// CONNECT targets without an explicit port fall back to this.
const DEFAULT_CONNECT_PORT: u16 = 80;

const RELAY_BUFFER_SIZE: usize = 16 * 1024;

/// Handles a CONNECT request. The client stream is consumed and closed
/// on every path out of this function.
pub(crate) async fn handle_connect<S>(
    handler: &ConnectionHandler,
    mut client: S,
    head: &RequestHead,
    peer: SocketAddr,
) where
    S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
    handler.record_request("connect");

    let Some(host) = head.uri.host().filter(|h| !h.is_empty()) else {
        debug!(peer = %peer, uri = %head.uri, "CONNECT without target host");
        let _ = write_status(&mut client, head.version, StatusCode::BAD_GATEWAY, None).await;
        return;
    };
    let port = head.uri.port_u16().unwrap_or(DEFAULT_CONNECT_PORT);
    let target = destination(host, port);

    if handler.check_permission(peer, &target) != Action::Accept {
        let _ = write_status(&mut client, head.version, StatusCode::BAD_GATEWAY, None).await;
        return;
    }

    let dial = async {
        let addrs = handler.resolver().lookup(host, port).await?;
        TcpStream::connect(&addrs[..]).await
    };
    let upstream = match timeout(handler.connect_timeout(), dial).await {
        Ok(Ok(stream)) => stream,
        Ok(Err(e)) => {
            handler.record_error("dial");
            if is_closed_error(&e) {
                debug!(peer = %peer, target = %target, error = %e, "Dial failed");
            } else {
                warn!(peer = %peer, target = %target, error = %e, "Dial failed");
            }
            let _ = write_status(&mut client, head.version, StatusCode::BAD_GATEWAY, None).await;
            return;
        }
        Err(_) => {
            handler.record_error("dial_timeout");
            warn!(peer = %peer, target = %target, "Dial timed out");
            let _ = write_status(&mut client, head.version, StatusCode::BAD_GATEWAY, None).await;
            return;
        }
    };

    if let Err(e) = write_status(
        &mut client,
        head.version,
        StatusCode::OK,
        Some("Connection established"),
    )
    .await
    {
        debug!(peer = %peer, error = %e, "Client went away before tunnel start");
        return;
    }

    info!(peer = %peer, target = %target, "Tunnel established");

    match relay(client, upstream, handler.tunnel_counters()).await {
        Ok(()) => debug!(peer = %peer, target = %target, "Tunnel closed"),
        Err(e) if is_closed_error(&e) => {
            debug!(peer = %peer, target = %target, error = %e, "Tunnel closed by peer")
        }
        Err(e) => {
            handler.record_error("relay");
            warn!(peer = %peer, target = %target, error = %e, "Tunnel error");
        }
    }
}

/// Copies bytes both ways until one direction finishes.
///
/// The first direction to end decides the result; the other one is
/// aborted and both connections are dropped.
async fn relay<S>(
    client: S,
    upstream: TcpStream,
    counters: Option<(IntCounter, IntCounter)>,
) -> io::Result<()>
where
    S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
    let (client_read, client_write) = io::split(client);
    let (upstream_read, upstream_write) = upstream.into_split();
    let (tx, rx) = match counters {
        Some((tx, rx)) => (Some(tx), Some(rx)),
        None => (None, None),
    };

    let mut tasks = JoinSet::new();
    tasks.spawn(copy_with_metrics(client_read, upstream_write, tx));
    tasks.spawn(copy_with_metrics(upstream_read, client_write, rx));

    let first = tasks.join_next().await;
    tasks.shutdown().await;

    match first {
        Some(Ok(result)) => result,
        Some(Err(join_err)) => Err(io::Error::other(join_err)),
        None => Ok(()),
    }
}

async fn copy_with_metrics<R, W>(
    mut reader: R,
    mut writer: W,
    counter: Option<IntCounter>,
) -> io::Result<()>
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin,
{
    let mut buf = vec![0u8; RELAY_BUFFER_SIZE];
    loop {
        let n = reader.read(&mut buf).await?;
        if n == 0 {
            break;
        }
        writer.write_all(&buf[..n]).await?;
        if let Some(counter) = &counter {
            counter.inc_by(n as u64);
        }
    }
    writer.shutdown().await
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::net::TcpListener;

    #[tokio::test]
    async fn test_copy_with_metrics_counts_bytes() {
        let (mut remote, local) = tokio::io::duplex(64);
        let registry = prometheus::Registry::new();
        let counter = IntCounter::new("test_bytes", "test").unwrap();
        registry.register(Box::new(counter.clone())).unwrap();

        remote.write_all(b"twelve bytes").await.unwrap();
        drop(remote);

        let mut out = Vec::new();
        copy_with_metrics(local, &mut out, Some(counter.clone()))
            .await
            .unwrap();
        assert_eq!(out, b"twelve bytes");
        assert_eq!(counter.get(), 12);
    }

    #[tokio::test]
    async fn test_relay_echo_and_close() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            let (mut socket, _) = listener.accept().await.unwrap();
            let mut buf = [0u8; 4];
            socket.read_exact(&mut buf).await.unwrap();
            socket.write_all(&buf).await.unwrap();
        });

        let upstream = TcpStream::connect(addr).await.unwrap();
        let (mut client, proxy_side) = tokio::io::duplex(64);
        let relay_task = tokio::spawn(relay(proxy_side, upstream, None));

        client.write_all(b"ping").await.unwrap();
        let mut buf = [0u8; 4];
        client.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"ping");

        // The origin closes after echoing, which ends the relay
        let mut rest = Vec::new();
        client.read_to_end(&mut rest).await.unwrap();
        assert!(rest.is_empty());
        assert!(relay_task.await.unwrap().is_ok());
    }
}
