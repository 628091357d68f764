//! Content-rewrite rule dispatch.
//!
//! Rewrite rules are compiled once at process start from static definitions
//! and never change afterwards. Each rule names a hook, a host suffix and a
//! URL regex; dispatch is first-match-wins per hook. Handlers are plain
//! closures receiving the URL and the request context explicitly, returning
//! either `None` (no override) or a full synthetic response.
//!
//! The deduplicated set of rule host suffixes doubles as the forced-MITM
//! list: CONNECT tunnels to those hosts are always dissected so the rules
//! can see plaintext.

use std::sync::Arc;

use hyper::body::Bytes;
use regex::Regex;

use blockproxy_core::auth::Protocol;

/// A synthesized or overridden HTTP response.
#[derive(Debug, Clone, Default)]
pub struct SyntheticResponse {
    /// HTTP status code.
    pub status: u16,
    /// Response headers in order; repeated names allowed.
    pub headers: Vec<(String, String)>,
    /// Response body.
    pub body: Bytes,
}

impl SyntheticResponse {
    /// Builds a plain-text response with an exact `Content-Length`.
    pub fn plain_text(status: u16, body: impl Into<Bytes>) -> Self {
        let body = body.into();
        Self {
            status,
            headers: vec![
                ("Content-Type".into(), "text/plain; charset=utf-8".into()),
                ("Content-Length".into(), body.len().to_string()),
            ],
            body,
        }
    }

    /// Appends a header.
    pub fn with_header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.push((name.into(), value.into()));
        self
    }

    /// Replaces a header wherever it occurs (case-insensitive), appending it
    /// when absent.
    pub fn set_header(&mut self, name: &str, value: impl Into<String>) {
        let value = value.into();
        let mut found = false;
        for (k, v) in &mut self.headers {
            if k.eq_ignore_ascii_case(name) {
                *v = value.clone();
                found = true;
            }
        }
        if !found {
            self.headers.push((name.to_string(), value));
        }
    }
}

/// Per-request interception context handed to rewrite handlers.
///
/// Created fresh for every request and discarded afterwards; never shared
/// across requests.
#[derive(Debug, Clone)]
pub struct RequestCtx {
    /// Client source IP, normalized.
    pub client_ip: String,
    /// Client MAC resolved from the device table ("" when unknown).
    pub mac: String,
    /// Bare request hostname, no port.
    pub host: String,
    /// Host as the client sent it, possibly with an explicit `:port` suffix.
    pub authority: String,
    /// Effective destination port.
    pub port: u16,
    /// Full request URL.
    pub url: String,
    /// URL path without the query string.
    pub pathname: String,
    /// Ingress protocol.
    pub protocol: Protocol,
    /// Request headers in order.
    pub headers: Vec<(String, String)>,
    /// Buffered request body.
    pub body: Bytes,
}

impl RequestCtx {
    /// Looks up the first header with the given name, case-insensitively.
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .iter()
            .find(|(k, _)| k.eq_ignore_ascii_case(name))
            .map(|(_, v)| v.as_str())
    }
}

/// Interception hook a rewrite rule fires on.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Hook {
    /// Before the request is forwarded upstream.
    BeforeSendRequest,
    /// Before the upstream response is sent back to the client.
    BeforeSendResponse,
}

/// Handler invoked when a rule matches.
///
/// `response` is present only for [`Hook::BeforeSendResponse`]. Returning
/// `None` means no override.
pub type RewriteHandler =
    Arc<dyn Fn(&str, &RequestCtx, Option<&SyntheticResponse>) -> Option<SyntheticResponse> + Send + Sync>;

/// A single content-rewrite rule.
#[derive(Clone)]
pub struct RewriteRule {
    /// Hook this rule fires on.
    pub hook: Hook,
    /// Host suffix the rule applies to (case-insensitive match).
    pub host_suffix: String,
    /// Regex source as configured.
    pub pattern_source: String,
    /// Compiled regex; `None` when compilation failed (rule never fires).
    pattern: Option<Regex>,
    handler: RewriteHandler,
}

impl std::fmt::Debug for RewriteRule {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RewriteRule")
            .field("hook", &self.hook)
            .field("host_suffix", &self.host_suffix)
            .field("pattern_source", &self.pattern_source)
            .finish()
    }
}

/// Ordered set of rewrite rules; evaluation is first-match-wins per hook.
#[derive(Debug, Default)]
pub struct RewriteRegistry {
    rules: Vec<RewriteRule>,
    dissect_suffixes: Vec<String>,
}

impl RewriteRegistry {
    /// Creates an empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Creates the registry with the built-in rule set.
    pub fn with_builtin() -> Self {
        let mut registry = Self::new();
        registry.add_rule(
            Hook::BeforeSendRequest,
            "googlevideo.com",
            r"(^https?://[\w-]+\.googlevideo\.com/.+)(ctier=L)(&.+)",
            Arc::new(strip_ad_tier),
        );
        registry
    }

    /// Adds a rule. A regex that fails to compile is logged and neutralized
    /// rather than rejected, mirroring block-rule compilation.
    pub fn add_rule(
        &mut self,
        hook: Hook,
        host_suffix: impl Into<String>,
        pattern_source: impl Into<String>,
        handler: RewriteHandler,
    ) {
        let host_suffix = host_suffix.into();
        let pattern_source = pattern_source.into();
        let pattern = match Regex::new(&pattern_source) {
            Ok(re) => Some(re),
            Err(e) => {
                tracing::warn!(
                    "Invalid rewrite regex {:?} for {:?}, rule will never fire: {}",
                    pattern_source,
                    host_suffix,
                    e
                );
                None
            }
        };
        let suffix_lower = host_suffix.to_ascii_lowercase();
        if !self.dissect_suffixes.contains(&suffix_lower) {
            self.dissect_suffixes.push(suffix_lower);
        }
        self.rules.push(RewriteRule {
            hook,
            host_suffix,
            pattern_source,
            pattern,
            handler,
        });
    }

    /// Builder-style [`RewriteRegistry::add_rule`].
    pub fn with_rule(
        mut self,
        hook: Hook,
        host_suffix: impl Into<String>,
        pattern_source: impl Into<String>,
        handler: RewriteHandler,
    ) -> Self {
        self.add_rule(hook, host_suffix, pattern_source, handler);
        self
    }

    /// Invokes the first rule matching hook, host suffix and URL, returning
    /// its result unmodified. `None` means no rule fired or the firing rule
    /// declined to override.
    pub fn dispatch(
        &self,
        hook: Hook,
        url: &str,
        ctx: &RequestCtx,
        response: Option<&SyntheticResponse>,
    ) -> Option<SyntheticResponse> {
        let hostname = hostname_of(url).to_ascii_lowercase();
        for rule in &self.rules {
            if rule.hook != hook {
                continue;
            }
            if !hostname.ends_with(&rule.host_suffix.to_ascii_lowercase()) {
                continue;
            }
            match &rule.pattern {
                Some(re) if re.is_match(url) => return (rule.handler)(url, ctx, response),
                _ => continue,
            }
        }
        None
    }

    /// Returns true when CONNECT tunnels to the host must be dissected so the
    /// registry's rules can see plaintext.
    pub fn should_dissect(&self, host: &str) -> bool {
        let host = host.to_ascii_lowercase();
        self.dissect_suffixes.iter().any(|s| host.ends_with(s))
    }

    /// Returns true when any response-hook rule could apply to this URL,
    /// letting the handler skip body buffering for everything else.
    pub fn response_hook_applies(&self, url: &str) -> bool {
        let hostname = hostname_of(url).to_ascii_lowercase();
        self.rules.iter().any(|rule| {
            rule.hook == Hook::BeforeSendResponse
                && hostname.ends_with(&rule.host_suffix.to_ascii_lowercase())
        })
    }

    /// Number of configured rules.
    pub fn len(&self) -> usize {
        self.rules.len()
    }

    /// Returns true if no rules are configured.
    pub fn is_empty(&self) -> bool {
        self.rules.is_empty()
    }
}

/// Merges a partial body override into the original response, recomputing
/// `Content-Length` from the actual byte length. The content-hijack helper
/// for rules that substitute a body and nothing else.
pub fn hijack_response(original: &SyntheticResponse, body: Option<Bytes>) -> SyntheticResponse {
    let mut out = original.clone();
    if let Some(body) = body {
        out.body = body;
    }
    out.set_header("Content-Length", out.body.len().to_string());
    out
}

/// Extracts the hostname from a URL without pulling in a URL parser: strips
/// the scheme, cuts at the first path separator, then drops any port.
pub(crate) fn hostname_of(url: &str) -> &str {
    let rest = url
        .split_once("://")
        .map(|(_, rest)| rest)
        .unwrap_or(url);
    let authority = rest.split(['/', '?', '#']).next().unwrap_or(rest);
    // Bracketed IPv6 literals keep their brackets, ports are dropped.
    if let Some(end) = authority.find(']') {
        return &authority[..=end];
    }
    authority.rsplit_once(':').map_or(authority, |(host, port)| {
        if port.bytes().all(|b| b.is_ascii_digit()) {
            host
        } else {
            authority
        }
    })
}

/// Built-in rule: strip the `ctier=L` ad-tier marker from googlevideo
/// playback URLs by redirecting the client to the cleaned URL.
fn strip_ad_tier(url: &str, _ctx: &RequestCtx, _res: Option<&SyntheticResponse>) -> Option<SyntheticResponse> {
    let re = Regex::new(r"(^https?://[\w-]+\.googlevideo\.com/.+)(ctier=L)(&.+)").ok()?;
    let caps = re.captures(url)?;
    let cleaned = format!("{}{}", &caps[1], &caps[3]);
    Some(SyntheticResponse {
        status: 302,
        headers: vec![
            ("Location".into(), cleaned),
            ("Content-Length".into(), "0".into()),
        ],
        body: Bytes::new(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ctx(url: &str) -> RequestCtx {
        RequestCtx {
            client_ip: "192.168.1.10".into(),
            mac: "".into(),
            host: hostname_of(url).to_string(),
            authority: hostname_of(url).to_string(),
            port: 443,
            url: url.to_string(),
            pathname: "/".into(),
            protocol: Protocol::Https,
            headers: Vec::new(),
            body: Bytes::new(),
        }
    }

    fn fixed(status: u16, tag: &str) -> RewriteHandler {
        let tag = tag.to_string();
        Arc::new(move |_, _, _| Some(SyntheticResponse::plain_text(status, tag.clone())))
    }

    #[test]
    fn dispatch_matches_hook_suffix_and_pattern() {
        let registry = RewriteRegistry::new().with_rule(
            Hook::BeforeSendRequest,
            "example.com",
            r"/api/",
            fixed(200, "hit"),
        );

        let url = "https://sub.example.com/api/v1";
        assert!(registry
            .dispatch(Hook::BeforeSendRequest, url, &ctx(url), None)
            .is_some());

        // Wrong hook.
        assert!(registry
            .dispatch(Hook::BeforeSendResponse, url, &ctx(url), None)
            .is_none());
        // Wrong host.
        let other = "https://example.org/api/v1";
        assert!(registry
            .dispatch(Hook::BeforeSendRequest, other, &ctx(other), None)
            .is_none());
        // Pattern miss.
        let miss = "https://sub.example.com/static/app.js";
        assert!(registry
            .dispatch(Hook::BeforeSendRequest, miss, &ctx(miss), None)
            .is_none());
    }

    #[test]
    fn dispatch_is_first_match_wins() {
        let registry = RewriteRegistry::new()
            .with_rule(Hook::BeforeSendRequest, "example.com", r"/api/", fixed(201, "first"))
            .with_rule(Hook::BeforeSendRequest, "example.com", r"/api/", fixed(202, "second"));

        let url = "https://example.com/api/v1";
        let result = registry
            .dispatch(Hook::BeforeSendRequest, url, &ctx(url), None)
            .unwrap();
        assert_eq!(result.status, 201);
        assert_eq!(result.body.as_ref(), b"first");
    }

    #[test]
    fn invalid_pattern_never_fires() {
        let registry = RewriteRegistry::new().with_rule(
            Hook::BeforeSendRequest,
            "example.com",
            "(unclosed",
            fixed(200, "x"),
        );
        let url = "https://example.com/anything";
        assert!(registry
            .dispatch(Hook::BeforeSendRequest, url, &ctx(url), None)
            .is_none());
        // The suffix still forces dissection.
        assert!(registry.should_dissect("example.com"));
    }

    #[test]
    fn should_dissect_uses_deduplicated_suffixes() {
        let registry = RewriteRegistry::new()
            .with_rule(Hook::BeforeSendRequest, "example.com", "a", fixed(200, "a"))
            .with_rule(Hook::BeforeSendResponse, "example.com", "b", fixed(200, "b"));
        assert_eq!(registry.dissect_suffixes.len(), 1);
        assert!(registry.should_dissect("cdn.example.com"));
        assert!(registry.should_dissect("EXAMPLE.COM"));
        assert!(!registry.should_dissect("example.org"));
    }

    #[test]
    fn builtin_strips_ad_tier_via_redirect() {
        let registry = RewriteRegistry::with_builtin();
        let url = "https://r4---sn-ab5l6n7y.googlevideo.com/videoplayback?expire=1&ctier=L&other=1";
        let result = registry
            .dispatch(Hook::BeforeSendRequest, url, &ctx(url), None)
            .unwrap();
        assert_eq!(result.status, 302);
        let location = result
            .headers
            .iter()
            .find(|(k, _)| k == "Location")
            .map(|(_, v)| v.as_str())
            .unwrap();
        assert!(!location.contains("ctier=L"));
        assert!(location.contains("other=1"));

        // Playback URLs without the marker pass untouched.
        let clean = "https://r4---sn-ab5l6n7y.googlevideo.com/videoplayback?expire=1&other=1";
        assert!(registry
            .dispatch(Hook::BeforeSendRequest, clean, &ctx(clean), None)
            .is_none());
    }

    #[test]
    fn hijack_recomputes_content_length() {
        let original = SyntheticResponse {
            status: 200,
            headers: vec![
                ("Content-Type".into(), "application/json".into()),
                ("Content-Length".into(), "1000".into()),
            ],
            body: Bytes::from_static(b"{\"old\":true}"),
        };

        let out = hijack_response(&original, Some(Bytes::from_static("héllo".as_bytes())));
        assert_eq!(out.body.as_ref(), "héllo".as_bytes());
        let cl = out
            .headers
            .iter()
            .find(|(k, _)| k.eq_ignore_ascii_case("content-length"))
            .map(|(_, v)| v.as_str())
            .unwrap();
        // UTF-8 byte length, not char count.
        assert_eq!(cl, "6");

        // No body override keeps the original body, still fixing the length.
        let kept = hijack_response(&original, None);
        assert_eq!(kept.body, original.body);
        let cl = kept
            .headers
            .iter()
            .find(|(k, _)| k.eq_ignore_ascii_case("content-length"))
            .map(|(_, v)| v.as_str())
            .unwrap();
        assert_eq!(cl, "12");
    }

    #[test]
    fn response_hook_applies_filters_by_host() {
        let registry = RewriteRegistry::new().with_rule(
            Hook::BeforeSendResponse,
            "example.com",
            ".*",
            fixed(200, "x"),
        );
        assert!(registry.response_hook_applies("https://example.com/a"));
        assert!(!registry.response_hook_applies("https://example.org/a"));
    }

    #[test]
    fn hostname_extraction() {
        assert_eq!(hostname_of("https://a.example.com/p?q=1"), "a.example.com");
        assert_eq!(hostname_of("http://a.example.com:8080/p"), "a.example.com");
        assert_eq!(hostname_of("a.example.com/p"), "a.example.com");
        assert_eq!(hostname_of("https://[::1]:8080/p"), "[::1]");
    }

    #[test]
    fn plain_text_sets_exact_content_length() {
        let res = SyntheticResponse::plain_text(200, "blocked by blockproxy");
        let cl = res
            .headers
            .iter()
            .find(|(k, _)| k == "Content-Length")
            .map(|(_, v)| v.as_str())
            .unwrap();
        assert_eq!(cl, "21");
    }
}
