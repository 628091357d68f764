//! hudsucker adapter: maps proxy hook invocations onto the decision engine.
//!
//! The handler is cloned per client connection and hook phases run
//! sequentially within a connection, so it stashes the replayable request
//! snapshot (for the error phase) and the interception context (for the
//! response phase) in plain fields. All policy lives in
//! [`DecisionEngine`]; this module only translates between hyper types and
//! the engine's context model.

use std::sync::Arc;

use http_body_util::{BodyExt, Full};
use hudsucker::{
    hyper::{Request, Response},
    Body, HttpContext, HttpHandler, RequestOrResponse, WebSocketHandler,
};
use hyper::body::Bytes;
use hyper::Method;

use blockproxy_core::{normalize_ip, Protocol};

use crate::engine::{DecisionEngine, RequestDecision};
use crate::fallback::FallbackRequest;
use crate::rewrite::{RequestCtx, SyntheticResponse};

/// Helper to convert bytes to Body
fn bytes_to_body(bytes: Bytes) -> Body {
    Body::from(Full::new(bytes))
}

/// Per-connection hook adapter around the shared decision engine.
#[derive(Clone)]
pub struct BlockHandler {
    engine: Arc<DecisionEngine>,
    /// Snapshot of the in-flight request, replayed on protocol violations.
    last_request: Option<FallbackRequest>,
    /// Context kept when a response-hook rewrite rule may apply.
    pending_response_ctx: Option<RequestCtx>,
}

impl BlockHandler {
    pub fn new(engine: Arc<DecisionEngine>) -> Self {
        Self {
            engine,
            last_request: None,
            pending_response_ctx: None,
        }
    }

    fn client_ip(ctx: &HttpContext) -> String {
        normalize_ip(&ctx.client_addr.ip().to_string()).into_owned()
    }

    async fn handle_connect(&mut self, ctx: &HttpContext, req: Request<Body>) -> RequestOrResponse {
        let client_ip = Self::client_ip(ctx);
        let authority = req
            .uri()
            .authority()
            .map(|a| a.to_string())
            .unwrap_or_default();
        let proxy_authorization = header_str(&req, "proxy-authorization");

        match self
            .engine
            .connect_auth(&client_ip, &authority, proxy_authorization.as_deref())
        {
            blockproxy_core::AuthDecision::Pass => RequestOrResponse::Request(req),
            blockproxy_core::AuthDecision::Challenge => {
                tracing::debug!("CONNECT denied for {} -> {}", client_ip, authority);
                RequestOrResponse::Response(synthetic_to_response(DecisionEngine::challenge()))
            }
        }
    }
}

impl HttpHandler for BlockHandler {
    async fn should_intercept(&mut self, ctx: &HttpContext, req: &Request<Body>) -> bool {
        let client_ip = Self::client_ip(ctx);
        let authority = req
            .uri()
            .authority()
            .map(|a| a.to_string())
            .unwrap_or_default();
        let dissect = self.engine.connect_route(&client_ip, &authority);
        tracing::debug!(
            "CONNECT {} from {}: {}",
            authority,
            client_ip,
            if dissect { "dissect" } else { "tunnel" }
        );
        dissect
    }

    async fn handle_request(&mut self, ctx: &HttpContext, req: Request<Body>) -> RequestOrResponse {
        if req.method() == Method::CONNECT {
            return self.handle_connect(ctx, req).await;
        }

        let client_ip = Self::client_ip(ctx);
        let mac = self.engine.mac_of(&client_ip);
        let method = req.method().to_string();

        let (parts, body) = req.into_parts();
        let body_bytes = match body.collect().await {
            Ok(collected) => collected.to_bytes(),
            Err(e) => {
                // Forwarding an unevaluated request would skip auth and the
                // block rules entirely, so the request ends here instead.
                tracing::warn!("Failed to read request body for {}: {}", parts.uri, e);
                return RequestOrResponse::Response(synthetic_to_response(body_read_failure()));
            }
        };

        let request_ctx = build_ctx(&parts, body_bytes.clone(), client_ip, mac);
        self.last_request = Some(fallback_snapshot(&method, &request_ctx));
        self.pending_response_ctx = self
            .engine
            .rewrites()
            .response_hook_applies(&request_ctx.url)
            .then(|| request_ctx.clone());

        match self.engine.request_decision(&method, &request_ctx).await {
            RequestDecision::PassThrough => RequestOrResponse::Request(Request::from_parts(
                parts,
                bytes_to_body(body_bytes),
            )),
            RequestDecision::Respond(response) => {
                // A locally answered request has no upstream leg to recover.
                self.last_request = None;
                self.pending_response_ctx = None;
                RequestOrResponse::Response(synthetic_to_response(response))
            }
        }
    }

    async fn handle_response(&mut self, _ctx: &HttpContext, res: Response<Body>) -> Response<Body> {
        let Some(request_ctx) = self.pending_response_ctx.take() else {
            return res;
        };

        // Buffer only when a rewrite rule may want the body.
        let (parts, body) = res.into_parts();
        let body_bytes = match body.collect().await {
            Ok(collected) => collected.to_bytes(),
            Err(e) => {
                tracing::warn!("Failed to read response body: {}", e);
                return Response::from_parts(parts, Body::empty());
            }
        };

        let original = SyntheticResponse {
            status: parts.status.as_u16(),
            headers: header_pairs(&parts.headers),
            body: body_bytes.clone(),
        };

        match self.engine.response_decision(&request_ctx, &original) {
            Some(replacement) => synthetic_to_response(replacement),
            None => Response::from_parts(parts, bytes_to_body(body_bytes)),
        }
    }

    async fn handle_error(
        &mut self,
        _ctx: &HttpContext,
        err: hyper_util::client::legacy::Error,
    ) -> Response<Body> {
        let request = self.last_request.take();
        tracing::debug!("Upstream error: {}", err);
        let response = self
            .engine
            .error_decision(&err, request.as_ref())
            .await;
        synthetic_to_response(response)
    }
}

impl WebSocketHandler for BlockHandler {}

/// Builds the engine's request context from hyper request parts.
///
/// Plain proxy requests arrive in absolute form; dissected HTTPS requests may
/// arrive in origin form and are reassembled from the `Host` header.
fn build_ctx(
    parts: &hyper::http::request::Parts,
    body: Bytes,
    client_ip: String,
    mac: String,
) -> RequestCtx {
    let uri = &parts.uri;

    let scheme = uri.scheme_str().unwrap_or("https");
    let protocol = if scheme == "http" {
        Protocol::Http
    } else {
        Protocol::Https
    };

    let host_header = parts
        .headers
        .get(hyper::header::HOST)
        .and_then(|h| h.to_str().ok())
        .unwrap_or("");
    let authority = uri
        .authority()
        .map(|a| a.to_string())
        .filter(|a| !a.is_empty())
        .unwrap_or_else(|| host_header.to_string());

    let host = authority
        .rsplit_once(':')
        .filter(|(_, p)| p.bytes().all(|b| b.is_ascii_digit()))
        .map(|(h, _)| h)
        .unwrap_or(&authority)
        .to_string();
    let port = uri
        .port_u16()
        .or_else(|| {
            authority
                .rsplit_once(':')
                .and_then(|(_, p)| p.parse().ok())
        })
        .unwrap_or(match protocol {
            Protocol::Http => 80,
            Protocol::Https => 443,
        });

    let path_and_query = uri
        .path_and_query()
        .map(|pq| pq.as_str())
        .unwrap_or("/");
    let url = if uri.authority().is_some() && uri.scheme_str().is_some() {
        uri.to_string()
    } else {
        format!("{scheme}://{authority}{path_and_query}")
    };

    RequestCtx {
        client_ip,
        mac,
        host,
        authority,
        port,
        url,
        pathname: uri.path().to_string(),
        protocol,
        headers: header_pairs(&parts.headers),
        body,
    }
}

/// Snapshot enough of the request to replay it over a raw socket.
fn fallback_snapshot(method: &str, ctx: &RequestCtx) -> FallbackRequest {
    let path = ctx
        .url
        .split_once("://")
        .and_then(|(_, rest)| rest.find('/').map(|i| rest[i..].to_string()))
        .unwrap_or_else(|| "/".to_string());
    FallbackRequest {
        method: method.to_string(),
        host: ctx.host.clone(),
        port: ctx.port,
        path,
        headers: ctx.headers.clone(),
        body: ctx.body.clone(),
    }
}

/// Response for requests whose body could not be read off the client
/// connection. Rendered before any policy evaluation, so it must never
/// forward anything.
fn body_read_failure() -> SyntheticResponse {
    SyntheticResponse::plain_text(400, "request body could not be read\n")
        .with_header("Connection", "close")
}

fn header_pairs(headers: &hyper::HeaderMap) -> Vec<(String, String)> {
    headers
        .iter()
        .filter_map(|(name, value)| {
            value
                .to_str()
                .ok()
                .map(|v| (name.as_str().to_string(), v.to_string()))
        })
        .collect()
}

fn header_str(req: &Request<Body>, name: &str) -> Option<String> {
    req.headers()
        .get(name)
        .and_then(|v| v.to_str().ok())
        .map(str::to_string)
}

/// Renders the engine's synthetic response as a hyper response. Headers that
/// fail to parse are dropped rather than failing the whole response.
fn synthetic_to_response(synthetic: SyntheticResponse) -> Response<Body> {
    let mut builder = Response::builder().status(synthetic.status);
    for (name, value) in &synthetic.headers {
        if let (Ok(name), Ok(value)) = (
            hyper::header::HeaderName::from_bytes(name.as_bytes()),
            hyper::header::HeaderValue::from_bytes(value.as_bytes()),
        ) {
            builder = builder.header(name, value);
        }
    }
    builder
        .body(bytes_to_body(synthetic.body))
        .unwrap_or_else(|_| {
            Response::builder()
                .status(500)
                .body(Body::empty())
                .expect("empty response")
        })
}
