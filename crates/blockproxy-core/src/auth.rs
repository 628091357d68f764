//! Proxy authentication gate.
//!
//! Validates `Proxy-Authorization: Basic` credentials and consults the
//! anti-scan guard so credential scanners are cut off before any parsing
//! work. The gate only decides pass-or-challenge; rendering the 407 (as a
//! structured response or a raw status line at CONNECT time) is the proxy
//! crate's job.

use std::net::IpAddr;
use std::sync::Arc;

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;

use crate::devices::normalize_ip;
use crate::guard::AntiScanGuard;

/// Hosts whose clients legitimately cannot complete the proxy-auth handshake
/// (streaming players drop credentials between segment requests).
const BYPASS_HOSTS: &[&str] = &["youtube.com", "googlevideo.com", "youtubei.googleapis.com"];

/// URL path extensions of segmented media formats, bypassed for the same
/// reason as the hosts above.
const BYPASS_EXTENSIONS: &[&str] = &[".m3u8", ".ts", ".m4s"];

/// Ingress protocol of the request being authenticated.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Protocol {
    /// Plain HTTP proxying.
    Http,
    /// HTTPS, at or after the CONNECT phase.
    Https,
}

/// Outcome of an authentication check.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AuthDecision {
    /// Request may proceed.
    Pass,
    /// Client must be challenged with a 407.
    Challenge,
}

/// Configured proxy credential.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Credential {
    pub username: String,
    pub password: String,
}

/// Proxy credential gate backed by the anti-scan guard.
#[derive(Debug, Clone)]
pub struct AuthGate {
    credential: Option<Credential>,
    guard: Arc<AntiScanGuard>,
}

impl AuthGate {
    /// Creates a gate. An empty username disables authentication entirely.
    pub fn new(username: &str, password: &str, guard: Arc<AntiScanGuard>) -> Self {
        let credential = if username.is_empty() {
            None
        } else {
            Some(Credential {
                username: username.to_string(),
                password: password.to_string(),
            })
        };
        Self { credential, guard }
    }

    /// Returns true if authentication is enabled.
    pub fn enabled(&self) -> bool {
        self.credential.is_some()
    }

    /// Checks a request's proxy credentials.
    ///
    /// `host` may carry an explicit `:port` suffix when the client sent one;
    /// such requests bypass auth unconditionally. This is a compatibility
    /// shim for mobile apps that do not resend credentials on the request
    /// following a challenge, and it deliberately applies to *any*
    /// port-qualified host (see DESIGN.md).
    ///
    /// `proxy_authorization` is the value of the `Proxy-Authorization`
    /// header, when present. Every challenge counts the access toward the
    /// scan-detection window.
    pub fn check(
        &self,
        protocol: Protocol,
        source_ip: &str,
        host: &str,
        url: &str,
        proxy_authorization: Option<&str>,
    ) -> AuthDecision {
        let Some(credential) = &self.credential else {
            return AuthDecision::Pass;
        };

        let ip = normalize_ip(source_ip).into_owned();

        // LAN, loopback and broadcast sources are always trusted.
        if is_local_address(&ip) {
            return AuthDecision::Pass;
        }

        // Known abusive sources are challenged before any parsing work.
        if self.guard.is_flagged(&ip) {
            self.guard.record_access(&ip);
            tracing::debug!("Challenging flagged source {} for {}", ip, host);
            return AuthDecision::Challenge;
        }

        if bypass_allowed(host, url) {
            self.guard.mark_trusted(&ip);
            return AuthDecision::Pass;
        }

        // Port-qualified hosts bypass auth (client-compatibility shim).
        if has_port_suffix(host) {
            return AuthDecision::Pass;
        }

        match proxy_authorization.and_then(parse_basic) {
            Some((user, pass)) if user == credential.username && pass == credential.password => {
                self.guard.mark_trusted(&ip);
                AuthDecision::Pass
            }
            _ => {
                self.guard.record_access(&ip);
                tracing::debug!(
                    "Auth challenge for {} ({:?} {})",
                    ip,
                    protocol,
                    host
                );
                AuthDecision::Challenge
            }
        }
    }
}

/// Decodes a `Basic <base64(user:pass)>` header value.
fn parse_basic(value: &str) -> Option<(String, String)> {
    let encoded = value.strip_prefix("Basic ").or_else(|| value.strip_prefix("basic "))?;
    let decoded = BASE64.decode(encoded.trim()).ok()?;
    let decoded = String::from_utf8(decoded).ok()?;
    let (user, pass) = decoded.split_once(':')?;
    Some((user.to_string(), pass.to_string()))
}

/// Returns true for loopback, private-LAN, link-local and broadcast sources.
fn is_local_address(ip: &str) -> bool {
    match ip.parse::<IpAddr>() {
        Ok(IpAddr::V4(v4)) => {
            v4.is_loopback()
                || v4.is_private()
                || v4.is_link_local()
                || v4 == std::net::Ipv4Addr::BROADCAST
        }
        Ok(IpAddr::V6(v6)) => {
            // fc00::/7 unique-local and fe80::/10 link-local.
            v6.is_loopback()
                || (v6.octets()[0] & 0xfe) == 0xfc
                || (v6.segments()[0] & 0xffc0) == 0xfe80
        }
        Err(_) => false,
    }
}

/// Streaming hosts and segmented-media URLs skip the credential handshake.
fn bypass_allowed(host: &str, url: &str) -> bool {
    let bare_host = host.rsplit_once(':').map_or(host, |(h, _)| h);
    let bare_host = bare_host.to_ascii_lowercase();
    if BYPASS_HOSTS
        .iter()
        .any(|d| bare_host.ends_with(d) || bare_host == *d)
    {
        return true;
    }

    let path = url.split('?').next().unwrap_or(url).to_ascii_lowercase();
    BYPASS_EXTENSIONS.iter().any(|ext| path.ends_with(ext))
}

/// Returns true when the host carries an explicit `:port` suffix.
fn has_port_suffix(host: &str) -> bool {
    match host.rsplit_once(':') {
        Some((h, port)) => !h.is_empty() && !port.is_empty() && port.bytes().all(|b| b.is_ascii_digit()),
        None => false,
    }
}
