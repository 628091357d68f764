//! Tolerant raw-socket HTTP/1.1 client.
//!
//! Used only on the error path: when an upstream response violates strict
//! framing rules the MITM engine enforces (HTTP/0.9-style replies, conflicting
//! length fields), the original request is re-issued here and the result
//! relayed verbatim. Nothing is validated on the way out and as little as
//! possible on the way in. Duplicate headers are preserved in order.

use hyper::body::Bytes;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;

use crate::error::{ProxyError, Result};

const READ_CHUNK: usize = 8192;

/// Snapshot of a request, kept so the error phase can replay it.
#[derive(Debug, Clone)]
pub struct FallbackRequest {
    pub method: String,
    pub host: String,
    pub port: u16,
    /// Request target as sent upstream, path plus query.
    pub path: String,
    pub headers: Vec<(String, String)>,
    pub body: Bytes,
}

/// A fully buffered response as read off the wire.
#[derive(Debug, Clone)]
pub struct FallbackResponse {
    pub status: u16,
    pub reason: String,
    pub headers: Vec<(String, String)>,
    pub body: Bytes,
}

impl FallbackResponse {
    /// First header with the given name, case-insensitively.
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .iter()
            .find(|(k, _)| k.eq_ignore_ascii_case(name))
            .map(|(_, v)| v.as_str())
    }
}

/// Re-issues the request over a fresh TCP connection and buffers the reply.
///
/// Body framing follows `Transfer-Encoding: chunked` when present, then
/// `Content-Length`, then read-to-EOF. The socket is closed as soon as the
/// expected length is reached or the chunked terminator is seen.
pub async fn fetch(req: &FallbackRequest) -> Result<FallbackResponse> {
    let addr = format!("{}:{}", req.host, req.port);
    let mut stream = TcpStream::connect(&addr)
        .await
        .map_err(|e| ProxyError::Fallback(format!("connect {addr}: {e}")))?;

    let head = assemble_head(req);
    stream.write_all(head.as_bytes()).await?;
    if !req.body.is_empty() {
        stream.write_all(&req.body).await?;
    }

    // Read until the header terminator shows up.
    let mut buf: Vec<u8> = Vec::with_capacity(READ_CHUNK);
    let mut scratch = [0u8; READ_CHUNK];
    let head_end = loop {
        if let Some(pos) = find_head_end(&buf) {
            break pos;
        }
        let n = stream.read(&mut scratch).await?;
        if n == 0 {
            return Err(ProxyError::Fallback(format!(
                "{addr}: connection closed before response head"
            )));
        }
        buf.extend_from_slice(&scratch[..n]);
    };

    let (status, reason, headers) = parse_head(&buf[..head_end])?;
    let mut body: Vec<u8> = buf.split_off(head_end + 4);

    let is_chunked = headers
        .iter()
        .filter(|(k, _)| k.eq_ignore_ascii_case("transfer-encoding"))
        .any(|(_, v)| v.to_ascii_lowercase().contains("chunked"));

    let body = if is_chunked {
        loop {
            if let Some(decoded) = decode_chunked(&body)? {
                break decoded;
            }
            let n = stream.read(&mut scratch).await?;
            if n == 0 {
                return Err(ProxyError::Fallback(format!(
                    "{addr}: connection closed mid-chunk"
                )));
            }
            body.extend_from_slice(&scratch[..n]);
        }
    } else if let Some(len) = headers
        .iter()
        .find(|(k, _)| k.eq_ignore_ascii_case("content-length"))
        .and_then(|(_, v)| v.trim().parse::<usize>().ok())
    {
        while body.len() < len {
            let n = stream.read(&mut scratch).await?;
            if n == 0 {
                break;
            }
            body.extend_from_slice(&scratch[..n]);
        }
        body.truncate(len);
        body
    } else {
        // No framing information, read until the peer closes.
        loop {
            let n = stream.read(&mut scratch).await?;
            if n == 0 {
                break body;
            }
            body.extend_from_slice(&scratch[..n]);
        }
    };

    Ok(FallbackResponse {
        status,
        reason,
        headers,
        body: Bytes::from(body),
    })
}

/// Builds the request head verbatim from the stored headers. No duplicate or
/// conflict checks; a `Host` header is supplied only when the original lacked
/// one.
fn assemble_head(req: &FallbackRequest) -> String {
    let mut head = format!("{} {} HTTP/1.1\r\n", req.method, req.path);
    let has_host = req
        .headers
        .iter()
        .any(|(k, _)| k.eq_ignore_ascii_case("host"));
    if !has_host {
        head.push_str(&format!("Host: {}:{}\r\n", req.host, req.port));
    }
    for (k, v) in &req.headers {
        head.push_str(k);
        head.push_str(": ");
        head.push_str(v);
        head.push_str("\r\n");
    }
    head.push_str("\r\n");
    head
}

/// Index of the `\r\n\r\n` head terminator, if present.
fn find_head_end(buf: &[u8]) -> Option<usize> {
    buf.windows(4).position(|w| w == b"\r\n\r\n")
}

/// Parses a response head (status line + header lines, no terminator).
fn parse_head(head: &[u8]) -> Result<(u16, String, Vec<(String, String)>)> {
    let text = std::str::from_utf8(head)
        .map_err(|_| ProxyError::Fallback("response head is not valid UTF-8".into()))?;
    let mut lines = text.split("\r\n");

    let status_line = lines
        .next()
        .ok_or_else(|| ProxyError::Fallback("empty response head".into()))?;
    // "HTTP/1.1 200 OK"; the reason phrase may be empty or contain spaces.
    let mut parts = status_line.splitn(3, ' ');
    let _version = parts.next();
    let status = parts
        .next()
        .and_then(|s| s.parse::<u16>().ok())
        .ok_or_else(|| ProxyError::Fallback(format!("bad status line: {status_line:?}")))?;
    let reason = parts.next().unwrap_or("").to_string();

    let mut headers = Vec::new();
    for line in lines {
        if line.is_empty() {
            continue;
        }
        let Some((name, value)) = line.split_once(':') else {
            // Tolerate junk lines instead of refusing the whole response.
            continue;
        };
        headers.push((name.trim().to_string(), value.trim().to_string()));
    }
    Ok((status, reason, headers))
}

/// Decodes a chunked body. Returns `Ok(None)` when the buffer does not yet
/// contain the zero-size terminator, `Err` on malformed chunk-size lines.
fn decode_chunked(buf: &[u8]) -> Result<Option<Vec<u8>>> {
    let mut out = Vec::new();
    let mut pos = 0;
    loop {
        let rest = &buf[pos..];
        let Some(line_end) = rest.windows(2).position(|w| w == b"\r\n") else {
            return Ok(None);
        };
        let size_line = std::str::from_utf8(&rest[..line_end])
            .map_err(|_| ProxyError::Fallback("chunk size line is not valid UTF-8".into()))?;
        // Chunk extensions after ';' are ignored.
        let size_str = size_line.split(';').next().unwrap_or("").trim();
        let size = usize::from_str_radix(size_str, 16)
            .map_err(|_| ProxyError::Fallback(format!("bad chunk size: {size_str:?}")))?;

        let data_start = pos + line_end + 2;
        if size == 0 {
            // Terminator seen; trailers, if any, are discarded.
            return Ok(Some(out));
        }
        // A hostile size line can be arbitrarily large; checked arithmetic
        // keeps it from wrapping into an out-of-bounds slice.
        let data_end = data_start
            .checked_add(size)
            .and_then(|end| end.checked_add(2))
            .ok_or_else(|| ProxyError::Fallback(format!("chunk size too large: {size_str:?}")))?;
        if buf.len() < data_end {
            return Ok(None);
        }
        out.extend_from_slice(&buf[data_start..data_start + size]);
        pos = data_end;
    }
}
