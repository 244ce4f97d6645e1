use http_body_util::Full;
use hyper::server::conn::http1;
use hyper::{Request, Response};
use hyper_util::rt::TokioIo;
use prometheus::{Encoder, Registry, TextEncoder};
use regolith_config::{Config, PolicySet};
use regolith_core::perm::PermissionEngine;
use regolith_core::run_proxy;
use std::error::Error;
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpListener;
use tokio::signal;
use tokio::sync::broadcast;
use tracing::{error, info, warn};
use tracing_subscriber::{EnvFilter, fmt};

const METRICS_ACCEPT_BACKOFF: Duration = Duration::from_millis(100);

pub async fn run(config_path: &Path, permissions: Option<&Path>) -> Result<(), Box<dyn Error>> {
    // Initialize logging
    fmt()
        .with_env_filter(
            EnvFilter::from_default_env()
                .add_directive(tracing::Level::INFO.into())
                .add_directive("regolith=debug".parse()?),
        )
        .with_target(false)
        .json()
        .try_init()
        .map_err(|e| -> Box<dyn Error> { e })?;

    // Load configuration and the initial policy; both are fatal on error
    let mut config = Config::from_file(config_path)?;
    if let Some(path) = permissions {
        config.permissions = path.to_path_buf();
    }
    let policy = PolicySet::from_file(&config.permissions)?;
    let engine = Arc::new(PermissionEngine::from_policy(&policy)?);
    info!(
        config = %config_path.display(),
        permissions = %config.permissions.display(),
        "Configuration loaded"
    );

    let registry = if config.metrics.enabled {
        let registry = Registry::new();
        let metrics_addr: SocketAddr = config.metrics.address.parse()?;
        serve_metrics(metrics_addr, registry.clone()).await?;
        Some(registry)
    } else {
        None
    };

    spawn_reload_on_hangup(engine.clone(), config.permissions.clone())?;

    let (shutdown_tx, shutdown_rx) = broadcast::channel(1);
    tokio::spawn(async move {
        match signal::ctrl_c().await {
            Ok(()) => {
                let _ = shutdown_tx.send(());
            }
            Err(e) => {
                error!(error = %e, "Failed to listen for Ctrl-C");
                // Keep the sender alive so the proxy does not stop
                std::future::pending::<()>().await;
            }
        }
    });

    run_proxy(config, engine, registry, shutdown_rx).await?;

    Ok(())
}

/// Re-reads the policy file and swaps it into `engine`.
///
/// On any error the engine keeps its current policy.
pub fn reload_policy(engine: &PermissionEngine, path: &Path) -> Result<u64, Box<dyn Error>> {
    let policy = PolicySet::from_file(path)?;
    let generation = engine.load(&policy)?;
    Ok(generation)
}

#[cfg(unix)]
fn spawn_reload_on_hangup(
    engine: Arc<PermissionEngine>,
    path: PathBuf,
) -> Result<(), Box<dyn Error>> {
    use tokio::signal::unix::{SignalKind, signal};

    let mut hangup = signal(SignalKind::hangup())?;
    tokio::spawn(async move {
        while hangup.recv().await.is_some() {
            info!(permissions = %path.display(), "Reloading permissions");
            match reload_policy(&engine, &path) {
                Ok(generation) => info!(generation, "Permissions reloaded"),
                Err(e) => error!(error = %e, "Reload failed, keeping previous permissions"),
            }
        }
    });
    Ok(())
}

#[cfg(not(unix))]
fn spawn_reload_on_hangup(
    _engine: Arc<PermissionEngine>,
    path: PathBuf,
) -> Result<(), Box<dyn Error>> {
    warn!(permissions = %path.display(), "Policy reload signal is not supported on this platform");
    Ok(())
}

/// Serves the Prometheus text exposition of `registry` on `addr`.
async fn serve_metrics(addr: SocketAddr, registry: Registry) -> Result<(), Box<dyn Error>> {
    let listener = TcpListener::bind(addr).await?;
    info!(addr = %addr, "Metrics server listening");

    tokio::spawn(async move {
        loop {
            let stream = match listener.accept().await {
                Ok((stream, _)) => stream,
                Err(e) => {
                    warn!(error = %e, "Metrics accept failed");
                    // Usually fd exhaustion; give it a moment to clear
                    tokio::time::sleep(METRICS_ACCEPT_BACKOFF).await;
                    continue;
                }
            };
            let registry = registry.clone();
            let io = TokioIo::new(stream);

            tokio::spawn(async move {
                let service =
                    hyper::service::service_fn(move |_req: Request<hyper::body::Incoming>| {
                        let registry = registry.clone();
                        async move {
                            let encoder = TextEncoder::new();
                            let metric_families = registry.gather();
                            let mut buffer = vec![];
                            encoder
                                .encode(&metric_families, &mut buffer)
                                .map_err(|e| format!("Metrics encoding error: {}", e))?;
                            Ok::<_, String>(Response::new(Full::new(bytes::Bytes::from(buffer))))
                        }
                    });

                if let Err(err) = http1::Builder::new().serve_connection(io, service).await {
                    warn!(error = %err, "Metrics connection error");
                }
            });
        }
    });

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use regolith_config::Action;
    use std::io::Write;
    use tempfile::NamedTempFile;

    fn policy_file(contents: &str) -> NamedTempFile {
        let mut file = tempfile::Builder::new().suffix(".json").tempfile().unwrap();
        file.write_all(contents.as_bytes()).unwrap();
        file.flush().unwrap();
        file
    }

    #[test]
    fn test_reload_policy_swaps_and_keeps_on_error() {
        let file = policy_file(r#"{"$global": {"default_action": "accept"}}"#);
        let engine = PermissionEngine::new();
        assert_eq!(reload_policy(&engine, file.path()).unwrap(), 1);
        assert_eq!(engine.resolve("10.0.0.1", "example.com:80"), Action::Accept);

        std::fs::write(
            file.path(),
            r#"{"$global": {"default_action": "deny", "default_ports": [80], "match": {"example.com": "ignore"}}}"#,
        )
        .unwrap();
        assert_eq!(reload_policy(&engine, file.path()).unwrap(), 2);
        assert_eq!(engine.resolve("10.0.0.1", "example.com:80"), Action::Ignore);
        assert_eq!(engine.resolve("10.0.0.1", "other.com:80"), Action::Deny);

        std::fs::write(file.path(), "{ not json").unwrap();
        assert!(reload_policy(&engine, file.path()).is_err());
        assert_eq!(engine.generation(), 2);
        assert_eq!(engine.resolve("10.0.0.1", "example.com:80"), Action::Ignore);
    }

    #[test]
    fn test_reload_missing_file() {
        let engine = PermissionEngine::new();
        assert!(reload_policy(&engine, Path::new("/nonexistent/perm.json")).is_err());
        assert_eq!(engine.generation(), 0);
    }

    #[tokio::test]
    async fn test_metrics_endpoint() {
        use tokio::io::{AsyncReadExt, AsyncWriteExt};

        let registry = Registry::new();
        let counter = prometheus::IntCounter::new("regolith_test_total", "test").unwrap();
        registry.register(Box::new(counter.clone())).unwrap();
        counter.inc();

        // Grab a free port, then release it for the server
        let reserved = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = reserved.local_addr().unwrap();
        drop(reserved);
        serve_metrics(addr, registry).await.unwrap();

        let mut stream = tokio::net::TcpStream::connect(addr).await.unwrap();
        stream
            .write_all(b"GET /metrics HTTP/1.1\r\nHost: localhost\r\nConnection: close\r\n\r\n")
            .await
            .unwrap();
        let mut response = String::new();
        stream.read_to_string(&mut response).await.unwrap();
        assert!(response.starts_with("HTTP/1.1 200"));
        assert!(response.contains("regolith_test_total 1"));
    }
}
