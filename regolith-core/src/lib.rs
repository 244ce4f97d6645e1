//! Forward HTTP/HTTPS proxy with per-source destination permissions.
//!
//! Clients speak plain HTTP/1.x to the proxy: `CONNECT host:port` opens a
//! byte tunnel, any other method is forwarded to the origin named in its
//! absolute-form target. Every destination is checked against the
//! [`PermissionEngine`](perm::PermissionEngine) before anything is dialed.

pub mod connection;
pub mod error;
pub mod forward;
pub mod metrics;
pub mod perm;
pub mod request;
pub mod resolve;
pub mod stream;
mod tunnel;

pub use connection::ConnectionHandler;
pub use error::{PolicyError, ProxyError};

use futures::StreamExt;
use futures::stream::FuturesUnordered;
use perm::PermissionEngine;
use prometheus::Registry;
use regolith_config::Config;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::net::TcpListener;
use tokio::sync::broadcast;
use tracing::{info, warn};

/// Binds every configured listen address and serves until `shutdown`
/// fires.
pub async fn run_proxy(
    config: Config,
    engine: Arc<PermissionEngine>,
    registry: Option<Registry>,
    shutdown: broadcast::Receiver<()>,
) -> Result<(), ProxyError> {
    let handler = ConnectionHandler::new(&config, engine, registry.as_ref())?;
    let listeners = bind_listeners(&config.listen_addrs).await?;
    serve(listeners, handler, shutdown).await
}

/// Binds all addresses; the first failure aborts.
pub async fn bind_listeners(addrs: &[String]) -> Result<Vec<TcpListener>, ProxyError> {
    let mut listeners = Vec::with_capacity(addrs.len());
    for addr_str in addrs {
        let addr: SocketAddr = addr_str.parse().map_err(|e: std::net::AddrParseError| {
            ProxyError::ListenAddr {
                addr: addr_str.clone(),
                reason: e.to_string(),
            }
        })?;
        let listener = TcpListener::bind(addr)
            .await
            .map_err(|source| ProxyError::Bind {
                addr: addr_str.clone(),
                source,
            })?;
        info!(addr = %addr, "Starting listener");
        listeners.push(listener);
    }
    Ok(listeners)
}

/// Accept loop over already-bound listeners.
///
/// Returns `Ok(())` once `shutdown` fires (or its sender is gone). Any
/// accept error stops the loop and is returned. Connections already in
/// flight keep running on their own tasks.
pub async fn serve(
    listeners: Vec<TcpListener>,
    handler: ConnectionHandler,
    mut shutdown: broadcast::Receiver<()>,
) -> Result<(), ProxyError> {
    info!(listeners = listeners.len(), "Proxy started, waiting for connections");

    loop {
        let mut accepts = FuturesUnordered::new();
        for listener in &listeners {
            accepts.push(listener.accept());
        }

        tokio::select! {
            _ = shutdown.recv() => {
                info!("Received shutdown signal");
                break;
            }
            Some(result) = accepts.next() => {
                match result {
                    Ok((socket, peer)) => {
                        let handler = handler.clone();
                        tokio::spawn(async move {
                            handler.handle_connection(socket, peer).await;
                        });
                    }
                    Err(e) => {
                        warn!(error = %e, "Accept failed");
                        return Err(ProxyError::Accept(e));
                    }
                }
            }
        }
    }

    info!("Shutting down proxy");
    Ok(())
}
