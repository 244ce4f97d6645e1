//! Error types for the regolith-core crate.

use std::error::Error as StdError;
use std::io;
use thiserror::Error;

/// Errors raised while compiling a [`PolicySet`](regolith_config::PolicySet).
#[derive(Error, Debug)]
pub enum PolicyError {
    #[error("invalid wildcard pattern {pattern:?} for source {source_key:?}: {source}")]
    InvalidPattern {
        source_key: String,
        pattern: String,
        #[source]
        source: globset::Error,
    },

    #[error("global rules declared more than once: {first:?} and {second:?}")]
    DuplicateGlobal { first: String, second: String },
}

/// Errors that can occur in the proxy server.
#[derive(Error, Debug)]
pub enum ProxyError {
    #[error("Proxy bind failed on {addr}: {source}")]
    Bind {
        addr: String,
        #[source]
        source: io::Error,
    },

    #[error("Invalid listen address {addr}: {reason}")]
    ListenAddr { addr: String, reason: String },

    #[error("Accept failed: {0}")]
    Accept(#[source] io::Error),

    #[error("Malformed request: {0}")]
    MalformedRequest(String),

    #[error("Request body exceeds {limit} bytes")]
    BodyTooLarge { limit: u64 },

    #[error("Failed to resolve {host}: {source}")]
    Resolve {
        host: String,
        #[source]
        source: io::Error,
    },

    #[error("Upstream request failed: {0}")]
    Upstream(#[source] hyper_util::client::legacy::Error),

    #[error("Upstream timed out")]
    Timeout,

    #[error("Metrics registration failed: {0}")]
    Metrics(#[from] prometheus::Error),

    #[error("I/O error: {0}")]
    Io(#[from] io::Error),
}

impl From<tokio::time::error::Elapsed> for ProxyError {
    fn from(_: tokio::time::error::Elapsed) -> Self {
        ProxyError::Timeout
    }
}

/// Result type alias for proxy operations.
pub type Result<T> = std::result::Result<T, ProxyError>;

/// Reports whether an error only says the peer already went away.
///
/// These show up routinely while tearing down tunnels and keep-alive
/// connections and are not worth more than a debug line.
pub fn is_closed_error(err: &(dyn StdError + 'static)) -> bool {
    let mut current = Some(err);
    while let Some(err) = current {
        if let Some(io_err) = err.downcast_ref::<io::Error>() {
            return matches!(
                io_err.kind(),
                io::ErrorKind::BrokenPipe
                    | io::ErrorKind::ConnectionReset
                    | io::ErrorKind::ConnectionAborted
                    | io::ErrorKind::NotConnected
                    | io::ErrorKind::UnexpectedEof
            );
        }
        current = err.source();
    }
    false
}
