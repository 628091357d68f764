//! Interception decision engine.
//!
//! One entry point per proxy phase: CONNECT (auth + tunnel-vs-dissect),
//! request, response, error. The engine owns no I/O except the error-path
//! fallback fetch and the debug relay; everything it consults (rule store,
//! device table, anti-scan guard, auth gate, rewrite registry) is injected at
//! construction, so every decision is reproducible in tests with fixture
//! stores. Per-request failures are always rendered as complete synthetic
//! responses, never surfaced as broken connections.

use std::net::IpAddr;
use std::sync::Arc;

use chrono::{DateTime, Local};
use hyper::body::Bytes;

use blockproxy_core::{
    AntiScanGuard, AuthDecision, AuthGate, Config, DeviceTable, Protocol, RuleStore,
};

use crate::error::Result;
use crate::fallback::{self, FallbackRequest};
use crate::relay::DebugRelay;
use crate::rewrite::{hostname_of, Hook, RequestCtx, RewriteRegistry, SyntheticResponse};
use crate::status::StatusPage;

/// Block notice body for hosts outside the streaming allow-list.
const BLOCK_NOTICE: &str = "blocked by blockproxy";

/// Hosts that get an empty block body so media players fail quietly instead
/// of choking on an unexpected text response. Exact host match.
const EMPTY_BLOCK_HOSTS: &[&str] = &["youtube.com", "googlevideo.com"];

/// CONNECT-phase outcome.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectDecision {
    /// Relay bytes blindly, no TLS dissection.
    Tunnel,
    /// Terminate TLS and run the request pipeline on the plaintext.
    Dissect,
    /// Reject with a 407 before any tunnel is established.
    Deny,
}

/// Request-phase outcome.
#[derive(Debug, Clone)]
pub enum RequestDecision {
    /// Forward upstream unmodified.
    PassThrough,
    /// Answer the client directly with this response.
    Respond(SyntheticResponse),
}

/// Classification of an upstream transport or protocol failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorClass {
    /// Route to the upstream host does not exist.
    NetworkUnreachable,
    /// Name resolution failed.
    DnsFailure,
    /// Upstream response violates strict HTTP framing rules.
    ProtocolViolation,
    /// Anything else; no recovery attempted.
    Other,
}

impl ErrorClass {
    /// Diagnostic code reported in `x-blockproxy-errorcode`.
    pub fn code(&self) -> &'static str {
        match self {
            ErrorClass::NetworkUnreachable => "network-unreachable",
            ErrorClass::DnsFailure => "dns-failure",
            ErrorClass::ProtocolViolation => "protocol-violation",
            ErrorClass::Other => "unknown",
        }
    }
}

/// Phase-by-phase interception policy.
pub struct DecisionEngine {
    rules: Arc<RuleStore>,
    devices: Arc<DeviceTable>,
    guard: Arc<AntiScanGuard>,
    auth: AuthGate,
    rewrites: Arc<RewriteRegistry>,
    relay: Option<DebugRelay>,
    status: StatusPage,
    your_domain: String,
    proxy_port: u16,
}

impl DecisionEngine {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        rules: Arc<RuleStore>,
        devices: Arc<DeviceTable>,
        guard: Arc<AntiScanGuard>,
        auth: AuthGate,
        rewrites: Arc<RewriteRegistry>,
        relay: Option<DebugRelay>,
        status: StatusPage,
        your_domain: impl Into<String>,
        proxy_port: u16,
    ) -> Self {
        Self {
            rules,
            devices,
            guard,
            auth,
            rewrites,
            relay,
            status,
            your_domain: your_domain.into(),
            proxy_port,
        }
    }

    /// Assembles an engine from a loaded config, with the built-in rewrite
    /// rules and fresh stores.
    pub fn from_config(config: &Config, local_mac: &str) -> Result<Self> {
        let guard = Arc::new(AntiScanGuard::new());
        let auth = AuthGate::new(&config.auth_username, &config.auth_password, guard.clone());
        let relay = match config.relay_target() {
            Some((host, port)) => Some(DebugRelay::new(&host, port)?),
            None => None,
        };
        Ok(Self::new(
            Arc::new(RuleStore::load(&config.block_hosts)),
            Arc::new(DeviceTable::new(&config.devices, local_mac)),
            guard,
            auth,
            Arc::new(RewriteRegistry::with_builtin()),
            relay,
            StatusPage::new(config.proxy_port, config.web_interface_port),
            config.your_domain.clone(),
            config.proxy_port,
        ))
    }

    /// Anti-scan guard, shared with the periodic sweep task.
    pub fn guard(&self) -> &Arc<AntiScanGuard> {
        &self.guard
    }

    /// Device table, shared with external scanners that refresh it.
    pub fn devices(&self) -> &Arc<DeviceTable> {
        &self.devices
    }

    /// Rewrite registry, consulted by the handler for response buffering.
    pub fn rewrites(&self) -> &Arc<RewriteRegistry> {
        &self.rewrites
    }

    /// Resolves the client MAC for a socket-observed address.
    pub fn mac_of(&self, client_ip: &str) -> String {
        self.devices.mac_of(client_ip)
    }

    /// The 407 challenge written whenever auth fails, at CONNECT time or in
    /// the request phase.
    pub fn challenge() -> SyntheticResponse {
        SyntheticResponse {
            status: 407,
            headers: vec![
                ("Proxy-Authenticate".into(), "Basic realm=\"blockproxy\"".into()),
                ("Content-Length".into(), "0".into()),
                ("Connection".into(), "close".into()),
            ],
            body: Bytes::new(),
        }
    }

    // CONNECT phase -------------------------------------------------------

    /// Auth half of the CONNECT phase. `authority` is the CONNECT target as
    /// sent, normally `host:443`; auth sees the bare host so the explicit
    /// port never triggers the port-suffix bypass here.
    ///
    /// A configured debug relay takes the tunnel wholesale before the gate
    /// runs, so relay mode never challenges.
    pub fn connect_auth(
        &self,
        client_ip: &str,
        authority: &str,
        proxy_authorization: Option<&str>,
    ) -> AuthDecision {
        if self.relay.is_some() {
            return AuthDecision::Pass;
        }
        let host = hostname_of(authority);
        self.auth
            .check(Protocol::Https, client_ip, host, "", proxy_authorization)
    }

    /// Routing half of the CONNECT phase: true means dissect the tunnel.
    pub fn connect_route(&self, client_ip: &str, authority: &str) -> bool {
        self.connect_route_at(client_ip, authority, Local::now())
    }

    pub(crate) fn connect_route_at(
        &self,
        client_ip: &str,
        authority: &str,
        now: DateTime<Local>,
    ) -> bool {
        let host = hostname_of(authority);

        // Debug relay wants plaintext for every request it forwards.
        if self.relay.is_some() {
            return true;
        }
        if self.rewrites.should_dissect(host) {
            return true;
        }
        // Bare IPs are never dissected; there is no hostname to match rules
        // or mint a certificate for.
        if is_literal_ip(host) {
            return false;
        }

        let mac = self.devices.mac_of(client_ip);
        let scoped = self.rules.rules_for_mac(&mac);
        if scoped.is_empty() {
            return false;
        }
        // Host-only evaluation; URL-pattern checks defer to the request
        // phase once plaintext is visible.
        scoped.iter().any(|rule| rule.matches_at(host, "", now))
    }

    /// Full CONNECT decision, auth then routing.
    pub fn connect_decision(
        &self,
        client_ip: &str,
        authority: &str,
        proxy_authorization: Option<&str>,
    ) -> ConnectDecision {
        if self.connect_auth(client_ip, authority, proxy_authorization) == AuthDecision::Challenge {
            return ConnectDecision::Deny;
        }
        if self.connect_route(client_ip, authority) {
            ConnectDecision::Dissect
        } else {
            ConnectDecision::Tunnel
        }
    }

    // Request phase -------------------------------------------------------

    pub async fn request_decision(&self, method: &str, ctx: &RequestCtx) -> RequestDecision {
        self.request_decision_at(method, ctx, Local::now()).await
    }

    pub(crate) async fn request_decision_at(
        &self,
        method: &str,
        ctx: &RequestCtx,
        now: DateTime<Local>,
    ) -> RequestDecision {
        // Requests addressed to the proxy itself are answered locally; a
        // client pointed at our own public address would otherwise loop.
        if self.is_self_request(ctx) {
            let body = self.status.render(self.rules.len(), self.devices.len());
            return RequestDecision::Respond(SyntheticResponse::plain_text(200, body));
        }

        if is_literal_ip(&ctx.host) {
            return RequestDecision::PassThrough;
        }

        // Plain HTTP carries proxy credentials on every request. Dissected
        // HTTPS passed auth at CONNECT time and its application headers do
        // not repeat the proxy credential, so it is not re-checked here.
        if ctx.protocol == Protocol::Http {
            let decision = self.auth.check(
                Protocol::Http,
                &ctx.client_ip,
                &ctx.authority,
                &ctx.url,
                ctx.header("proxy-authorization"),
            );
            if decision == AuthDecision::Challenge {
                return RequestDecision::Respond(Self::challenge());
            }
        }

        let scoped = self.rules.rules_for_mac(&ctx.mac);
        if scoped.is_empty() {
            if let Some(response) =
                self.rewrites
                    .dispatch(Hook::BeforeSendRequest, &ctx.url, ctx, None)
            {
                return RequestDecision::Respond(response);
            }
            if let Some(relay) = &self.relay {
                return RequestDecision::Respond(self.forward_via_relay(relay, method, ctx).await);
            }
            return RequestDecision::PassThrough;
        }

        if scoped
            .iter()
            .any(|rule| rule.matches_at(&ctx.host, &ctx.url, now))
        {
            tracing::info!("Blocked {} {} for {}", method, ctx.url, ctx.client_ip);
            return RequestDecision::Respond(Self::block_response(&ctx.host));
        }

        match self
            .rewrites
            .dispatch(Hook::BeforeSendRequest, &ctx.url, ctx, None)
        {
            Some(response) => RequestDecision::Respond(response),
            None => RequestDecision::PassThrough,
        }
    }

    async fn forward_via_relay(
        &self,
        relay: &DebugRelay,
        method: &str,
        ctx: &RequestCtx,
    ) -> SyntheticResponse {
        match relay.forward(method, ctx).await {
            Ok(response) => response,
            Err(e) => {
                tracing::warn!("Relay failed for {}: {}", ctx.url, e);
                SyntheticResponse::plain_text(502, format!("relay error: {e}"))
            }
        }
    }

    /// Synthesized block response: empty body for the streaming allow-list,
    /// a short notice otherwise.
    fn block_response(host: &str) -> SyntheticResponse {
        if EMPTY_BLOCK_HOSTS.contains(&host) {
            SyntheticResponse::plain_text(200, "")
        } else {
            SyntheticResponse::plain_text(200, BLOCK_NOTICE)
        }
    }

    fn is_self_request(&self, ctx: &RequestCtx) -> bool {
        if ctx.port != self.proxy_port {
            return false;
        }
        if !self.your_domain.is_empty() && ctx.host.eq_ignore_ascii_case(&self.your_domain) {
            return true;
        }
        matches!(ctx.host.as_str(), "127.0.0.1" | "::1" | "localhost")
    }

    // Response phase ------------------------------------------------------

    /// Returns a replacement response when a rewrite rule overrides it.
    pub fn response_decision(
        &self,
        ctx: &RequestCtx,
        response: &SyntheticResponse,
    ) -> Option<SyntheticResponse> {
        self.rewrites
            .dispatch(Hook::BeforeSendResponse, &ctx.url, ctx, Some(response))
    }

    // Error phase ---------------------------------------------------------

    /// Converts an upstream failure into the response the client sees.
    ///
    /// `request` is the replayable snapshot of the failed request, when the
    /// handler captured one; protocol violations are recovered by re-issuing
    /// it through the tolerant fallback client.
    pub async fn error_decision(
        &self,
        err: &(dyn std::error::Error + Send + Sync + 'static),
        request: Option<&FallbackRequest>,
    ) -> SyntheticResponse {
        let class = classify(err);
        match class {
            ErrorClass::NetworkUnreachable => SyntheticResponse::plain_text(
                404,
                "the requested resource is unreachable from this proxy\n",
            )
            .with_header("x-blockproxy-errorcode", class.code()),
            ErrorClass::DnsFailure => SyntheticResponse::plain_text(
                502,
                "name resolution failed for the requested host\n",
            )
            .with_header("Connection", "close")
            .with_header("x-blockproxy-errorcode", class.code()),
            ErrorClass::ProtocolViolation => match request {
                Some(request) => self.recover_via_fallback(request, class).await,
                None => SyntheticResponse::plain_text(502, "upstream protocol violation\n")
                    .with_header("x-blockproxy-errorcode", class.code()),
            },
            ErrorClass::Other => {
                tracing::debug!("Unrecovered upstream error: {}", err);
                SyntheticResponse::plain_text(502, "upstream request failed\n")
            }
        }
    }

    async fn recover_via_fallback(
        &self,
        request: &FallbackRequest,
        class: ErrorClass,
    ) -> SyntheticResponse {
        match fallback::fetch(request).await {
            Ok(res) => {
                let mut headers: Vec<(String, String)> = res
                    .headers
                    .into_iter()
                    // The body arrives decoded; chunked framing must not
                    // survive into the relayed response.
                    .filter(|(k, _)| !k.eq_ignore_ascii_case("transfer-encoding"))
                    .collect();
                headers.push(("x-blockproxy-transfer".into(), "true".into()));
                headers.push(("x-blockproxy-errorcode".into(), class.code().into()));
                let mut out = SyntheticResponse {
                    status: res.status,
                    headers,
                    body: res.body,
                };
                out.set_header("Content-Length", out.body.len().to_string());
                out
            }
            Err(e) => {
                tracing::warn!(
                    "Fallback fetch failed for {}:{}{}: {}",
                    request.host,
                    request.port,
                    request.path,
                    e
                );
                SyntheticResponse::plain_text(502, "upstream protocol violation\n")
                    .with_header("x-blockproxy-errorcode", class.code())
            }
        }
    }
}

/// Classifies an upstream error by walking its source chain.
pub fn classify(err: &(dyn std::error::Error + Send + Sync + 'static)) -> ErrorClass {
    let mut current: Option<&(dyn std::error::Error + 'static)> = Some(err);
    while let Some(e) = current {
        if let Some(h) = e.downcast_ref::<hyper::Error>() {
            if h.is_parse() {
                return ErrorClass::ProtocolViolation;
            }
        }
        if let Some(io) = e.downcast_ref::<std::io::Error>() {
            match io.kind() {
                std::io::ErrorKind::NetworkUnreachable | std::io::ErrorKind::HostUnreachable => {
                    return ErrorClass::NetworkUnreachable
                }
                _ => {}
            }
        }
        let msg = e.to_string().to_ascii_lowercase();
        if msg.contains("failed to lookup address")
            || msg.contains("dns error")
            || msg.contains("name or service not known")
        {
            return ErrorClass::DnsFailure;
        }
        if msg.contains("invalid content-length")
            || msg.contains("unexpected content-length")
            || msg.contains("invalid http version")
            || msg.contains("invalid message")
        {
            return ErrorClass::ProtocolViolation;
        }
        if msg.contains("network unreachable") || msg.contains("host unreachable") {
            return ErrorClass::NetworkUnreachable;
        }
        current = e.source();
    }
    ErrorClass::Other
}

/// True for dotted-quad IPv4 and (optionally bracketed) IPv6 literals.
fn is_literal_ip(host: &str) -> bool {
    let host = host.trim_start_matches('[').trim_end_matches(']');
    host.parse::<IpAddr>().is_ok()
}
