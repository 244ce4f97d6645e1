//! `host:port` normalization shared by policy compilation and lookups.
//!
//! Every key a matcher sees has the form `host:port`, with the host
//! lowercased and IPv6 literals bracketed.

use std::fmt::Display;

/// Separates host and port.
///
/// The port is taken from after the last `:` only when it is numeric, so
/// an unbracketed IPv6 literal loses its last group to the port. An empty
/// port (`"host:"`) counts as no port. Brackets around the host are removed.
pub fn split_host_port(host_port: &str) -> (&str, Option<&str>) {
    let mut host = host_port;
    let mut port = None;

    if let Some(colon) = host.rfind(':') {
        let candidate = &host[colon + 1..];
        if candidate.bytes().all(|b| b.is_ascii_digit()) {
            if !candidate.is_empty() {
                port = Some(candidate);
            }
            host = &host[..colon];
        }
    }

    if let Some(inner) = host.strip_prefix('[').and_then(|h| h.strip_suffix(']')) {
        host = inner;
    }

    (host, port)
}

/// Joins host and port, bracketing hosts that contain a colon.
pub fn join_host_port(host: &str, port: impl Display) -> String {
    if host.contains(':') {
        format!("[{}]:{}", host, port)
    } else {
        format!("{}:{}", host, port)
    }
}

/// Builds the matching key for a destination.
#[inline]
pub fn destination(host: &str, port: u16) -> String {
    let host = host.trim_start_matches('[').trim_end_matches(']');
    join_host_port(&host.to_ascii_lowercase(), port)
}

/// Normalizes a source key: brackets removed, lowercased.
#[inline]
pub fn source_key(source: &str) -> String {
    source
        .trim_start_matches('[')
        .trim_end_matches(']')
        .to_ascii_lowercase()
}
