//! Development relay through an upstream HTTP proxy.
//!
//! When `vpn_proxy` is configured and a client has no block rules, its plain
//! HTTP requests are forwarded wholesale through the configured upstream
//! proxy and the response returned verbatim. Debug tunneling aid, disabled
//! in normal operation.

use hyper::body::Bytes;
use reqwest::header::{HeaderMap, HeaderName, HeaderValue};

use crate::error::{ProxyError, Result};
use crate::rewrite::{RequestCtx, SyntheticResponse};

/// Connection-level headers that must not be copied across hops.
const HOP_BY_HOP: &[&str] = &[
    "connection",
    "proxy-connection",
    "proxy-authorization",
    "proxy-authenticate",
    "keep-alive",
    "te",
    "trailer",
    "transfer-encoding",
    "upgrade",
];

pub(crate) fn is_hop_by_hop(name: &str) -> bool {
    HOP_BY_HOP.iter().any(|h| name.eq_ignore_ascii_case(h))
}

/// Forwards requests through a fixed upstream proxy.
#[derive(Debug, Clone)]
pub struct DebugRelay {
    client: reqwest::Client,
    target: String,
}

impl DebugRelay {
    /// Builds a relay client pointed at `host:port`.
    pub fn new(host: &str, port: u16) -> Result<Self> {
        let target = format!("http://{host}:{port}");
        let proxy = reqwest::Proxy::all(&target)
            .map_err(|e| ProxyError::Relay(format!("bad relay target {target:?}: {e}")))?;
        let client = reqwest::Client::builder()
            .proxy(proxy)
            .build()
            .map_err(|e| ProxyError::Relay(e.to_string()))?;
        Ok(Self { client, target })
    }

    /// Upstream proxy URL this relay forwards through.
    pub fn target(&self) -> &str {
        &self.target
    }

    /// Replays the request through the upstream proxy and buffers the reply.
    /// Any failure is reported as a relay error; the caller renders it as a
    /// 502 so the client always sees a complete response.
    pub async fn forward(&self, method: &str, ctx: &RequestCtx) -> Result<SyntheticResponse> {
        let method = reqwest::Method::from_bytes(method.as_bytes())
            .map_err(|e| ProxyError::Relay(format!("bad method: {e}")))?;

        let mut headers = HeaderMap::new();
        for (name, value) in &ctx.headers {
            if is_hop_by_hop(name) {
                continue;
            }
            let (Ok(name), Ok(value)) = (
                HeaderName::from_bytes(name.as_bytes()),
                HeaderValue::from_bytes(value.as_bytes()),
            ) else {
                continue;
            };
            headers.append(name, value);
        }

        let response = self
            .client
            .request(method, &ctx.url)
            .headers(headers)
            .body(ctx.body.clone())
            .send()
            .await
            .map_err(|e| ProxyError::Relay(format!("{}: {e}", self.target)))?;

        let status = response.status().as_u16();
        let mut out_headers = Vec::new();
        for (name, value) in response.headers() {
            if is_hop_by_hop(name.as_str()) {
                continue;
            }
            if let Ok(value) = value.to_str() {
                out_headers.push((name.as_str().to_string(), value.to_string()));
            }
        }

        let body: Bytes = response
            .bytes()
            .await
            .map_err(|e| ProxyError::Relay(e.to_string()))?;

        // The body is fully buffered, so the length header must match it.
        let mut synthetic = SyntheticResponse {
            status,
            headers: out_headers,
            body,
        };
        synthetic.set_header("Content-Length", synthetic.body.len().to_string());
        Ok(synthetic)
    }
}
