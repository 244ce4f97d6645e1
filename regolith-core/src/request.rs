//! HTTP/1.x request framing on the client-facing side.
//!
//! Heads are read line by line from a buffered stream so that exactly the
//! head is consumed; anything the client pipelined after it stays in the
//! reader's buffer.

use crate::error::{ProxyError, Result};
use bytes::Bytes;
use http::header::{CONTENT_LENGTH, TRANSFER_ENCODING};
use http::{HeaderMap, HeaderName, HeaderValue, Method, StatusCode, Uri, Version};
use tokio::io::{AsyncBufRead, AsyncBufReadExt, AsyncReadExt, AsyncWrite, AsyncWriteExt};

/// Maximum total size of a request head (64 KiB).
pub const MAX_HEAD_SIZE: usize = 64 * 1024;
/// Maximum number of header fields in a request head.
pub const MAX_HEADERS: usize = 100;
/// Maximum size of a buffered request body (16 MiB).
pub const MAX_BODY_SIZE: u64 = 16 * 1024 * 1024;
/// Maximum length of a chunk-size or trailer line.
const MAX_CHUNK_LINE: u64 = 4096;

/// A parsed request line and header block.
#[derive(Debug, Clone)]
pub struct RequestHead {
    pub method: Method,
    pub uri: Uri,
    pub version: Version,
    pub headers: HeaderMap,
}

impl RequestHead {
    pub fn is_connect(&self) -> bool {
        self.method == Method::CONNECT
    }

    /// True for HTTP/1.1 and later.
    pub fn at_least_http11(&self) -> bool {
        !matches!(self.version, Version::HTTP_09 | Version::HTTP_10)
    }

    /// Case-insensitive comparison of the first value of `name`.
    pub fn header_is(&self, name: &str, expected: &str) -> bool {
        self.headers
            .get(name)
            .and_then(|v| v.to_str().ok())
            .is_some_and(|v| v.trim().eq_ignore_ascii_case(expected))
    }
}

/// Reads one request head.
///
/// Returns `Ok(None)` on a clean end of stream before any request byte.
/// Leading empty lines are skipped.
pub async fn read_request_head<R>(reader: &mut R) -> Result<Option<RequestHead>>
where
    R: AsyncBufRead + Unpin,
{
    let mut head = Vec::with_capacity(1024);

    loop {
        let remaining = MAX_HEAD_SIZE.saturating_sub(head.len());
        if remaining == 0 {
            return Err(ProxyError::MalformedRequest(
                "request head too large".to_string(),
            ));
        }

        let line_start = head.len();
        let n = (&mut *reader)
            .take(remaining as u64)
            .read_until(b'\n', &mut head)
            .await?;
        if n == 0 {
            if head.is_empty() {
                return Ok(None);
            }
            return Err(ProxyError::MalformedRequest(
                "connection closed inside request head".to_string(),
            ));
        }

        let line = &head[line_start..];
        if !line.ends_with(b"\n") {
            // Hit the size limit mid-line
            continue;
        }
        if line == b"\r\n" || line == b"\n" {
            if line_start == 0 {
                head.clear();
                continue;
            }
            break;
        }
    }

    parse_head(&head).map(Some)
}

fn parse_head(buf: &[u8]) -> Result<RequestHead> {
    let mut headers = [httparse::EMPTY_HEADER; MAX_HEADERS];
    let mut req = httparse::Request::new(&mut headers);

    match req.parse(buf) {
        Ok(httparse::Status::Complete(_)) => {}
        Ok(httparse::Status::Partial) => {
            return Err(ProxyError::MalformedRequest(
                "incomplete request head".to_string(),
            ));
        }
        Err(e) => return Err(ProxyError::MalformedRequest(e.to_string())),
    }

    let method = req
        .method
        .ok_or_else(|| ProxyError::MalformedRequest("missing method".to_string()))
        .and_then(|m| {
            Method::from_bytes(m.as_bytes())
                .map_err(|e| ProxyError::MalformedRequest(format!("method: {}", e)))
        })?;

    let uri = req
        .path
        .ok_or_else(|| ProxyError::MalformedRequest("missing request target".to_string()))
        .and_then(|p| {
            p.parse::<Uri>()
                .map_err(|e| ProxyError::MalformedRequest(format!("request target {:?}: {}", p, e)))
        })?;

    let version = match req.version {
        Some(0) => Version::HTTP_10,
        Some(1) => Version::HTTP_11,
        other => {
            return Err(ProxyError::MalformedRequest(format!(
                "unsupported version {:?}",
                other
            )));
        }
    };

    let mut header_map = HeaderMap::with_capacity(req.headers.len());
    for header in req.headers.iter() {
        let name = HeaderName::from_bytes(header.name.as_bytes())
            .map_err(|e| ProxyError::MalformedRequest(format!("header name: {}", e)))?;
        let value = HeaderValue::from_bytes(header.value)
            .map_err(|e| ProxyError::MalformedRequest(format!("header {}: {}", name, e)))?;
        header_map.append(name, value);
    }

    Ok(RequestHead {
        method,
        uri,
        version,
        headers: header_map,
    })
}

/// Reads the request body declared by `headers` into memory.
///
/// `Transfer-Encoding: chunked` wins over `Content-Length`; with neither
/// the body is empty. Bodies larger than `limit` fail with
/// [`ProxyError::BodyTooLarge`]; a declared length over the limit fails
/// before any body byte is read.
pub async fn read_body<R>(reader: &mut R, headers: &HeaderMap, limit: u64) -> Result<Bytes>
where
    R: AsyncBufRead + Unpin,
{
    if let Some(te) = headers.get(TRANSFER_ENCODING) {
        let te = te
            .to_str()
            .map_err(|_| ProxyError::MalformedRequest("invalid Transfer-Encoding".to_string()))?;
        let last = te.rsplit(',').next().unwrap_or("").trim();
        if !last.eq_ignore_ascii_case("chunked") {
            return Err(ProxyError::MalformedRequest(format!(
                "unsupported Transfer-Encoding {:?}",
                te
            )));
        }
        return read_chunked(reader, limit).await;
    }

    let Some(length) = content_length(headers)? else {
        return Ok(Bytes::new());
    };
    if length > limit {
        return Err(ProxyError::BodyTooLarge { limit });
    }

    let mut body = Vec::new();
    let n = (&mut *reader).take(length).read_to_end(&mut body).await?;
    if (n as u64) < length {
        return Err(ProxyError::MalformedRequest(format!(
            "body truncated at {} of {} bytes",
            n, length
        )));
    }
    Ok(Bytes::from(body))
}

/// Parses `Content-Length`, rejecting conflicting duplicates.
pub fn content_length(headers: &HeaderMap) -> Result<Option<u64>> {
    let mut length = None;
    for value in headers.get_all(CONTENT_LENGTH) {
        let parsed = value
            .to_str()
            .ok()
            .and_then(|v| v.trim().parse::<u64>().ok())
            .ok_or_else(|| ProxyError::MalformedRequest("invalid Content-Length".to_string()))?;
        if length.is_some_and(|l| l != parsed) {
            return Err(ProxyError::MalformedRequest(
                "conflicting Content-Length values".to_string(),
            ));
        }
        length = Some(parsed);
    }
    Ok(length)
}

async fn read_chunked<R>(reader: &mut R, limit: u64) -> Result<Bytes>
where
    R: AsyncBufRead + Unpin,
{
    let mut body = Vec::new();
    let mut line = Vec::with_capacity(32);

    loop {
        line.clear();
        read_chunk_line(reader, &mut line).await?;
        let size_str = std::str::from_utf8(&line)
            .ok()
            .map(|l| l.split(';').next().unwrap_or("").trim())
            .ok_or_else(|| ProxyError::MalformedRequest("invalid chunk size".to_string()))?;
        let size = u64::from_str_radix(size_str, 16).map_err(|_| {
            ProxyError::MalformedRequest(format!("invalid chunk size {:?}", size_str))
        })?;

        if size == 0 {
            // Trailer section, discarded
            loop {
                line.clear();
                read_chunk_line(reader, &mut line).await?;
                if line.is_empty() {
                    return Ok(Bytes::from(body));
                }
            }
        }

        if (body.len() as u64).saturating_add(size) > limit {
            return Err(ProxyError::BodyTooLarge { limit });
        }

        let start = body.len();
        let n = (&mut *reader).take(size).read_to_end(&mut body).await?;
        if (n as u64) < size {
            return Err(ProxyError::MalformedRequest(format!(
                "chunk truncated at {} of {} bytes",
                body.len() - start,
                size
            )));
        }

        line.clear();
        read_chunk_line(reader, &mut line).await?;
        if !line.is_empty() {
            return Err(ProxyError::MalformedRequest(
                "missing CRLF after chunk".to_string(),
            ));
        }
    }
}

/// Reads one line and strips its line ending.
async fn read_chunk_line<R>(reader: &mut R, line: &mut Vec<u8>) -> Result<()>
where
    R: AsyncBufRead + Unpin,
{
    let n = (&mut *reader)
        .take(MAX_CHUNK_LINE)
        .read_until(b'\n', line)
        .await?;
    if n == 0 || !line.ends_with(b"\n") {
        return Err(ProxyError::MalformedRequest(
            "unterminated chunk line".to_string(),
        ));
    }
    line.pop();
    if line.ends_with(b"\r") {
        line.pop();
    }
    Ok(())
}

pub fn version_str(version: Version) -> &'static str {
    match version {
        Version::HTTP_09 => "HTTP/0.9",
        Version::HTTP_10 => "HTTP/1.0",
        Version::HTTP_2 => "HTTP/2.0",
        Version::HTTP_3 => "HTTP/3.0",
        _ => "HTTP/1.1",
    }
}

/// Writes a status-line-only response.
///
/// No `Content-Length: 0`, no `Connection: close`, no body.
pub async fn write_status<W>(
    writer: &mut W,
    version: Version,
    status: StatusCode,
    reason: Option<&str>,
) -> std::io::Result<()>
where
    W: AsyncWrite + Unpin,
{
    let reason = reason
        .or_else(|| status.canonical_reason())
        .unwrap_or("");
    let response = format!("{} {} {}\r\n\r\n", version_str(version), status.as_u16(), reason);
    writer.write_all(response.as_bytes()).await?;
    writer.flush().await
}
