//! Block rule model and rule store.
//!
//! Rules arrive from the config file in two shapes: a legacy bare host string
//! and the full object form with optional MAC, URL regex, time window and
//! weekday restrictions. Both are normalized into [`BlockRule`] at load time
//! so nothing downstream ever sees the union. Regexes are compiled once at
//! load; a rule whose regex fails to compile is neutralized (it can never
//! fire on URL matching) but kept, with the compile error stored so the
//! operator can see which rule is inert.

use std::collections::HashSet;

use chrono::{DateTime, Datelike, Local, Timelike};
use regex::Regex;
use serde::{Deserialize, Serialize};

/// A block rule as stored in the config file.
///
/// The legacy variant is a bare host substring with no further restrictions.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(untagged)]
pub enum RawBlockRule {
    /// Legacy format: a host substring.
    Legacy(String),
    /// Full object format.
    Full(RawRuleObject),
}

impl From<&str> for RawBlockRule {
    fn from(host: &str) -> Self {
        RawBlockRule::Legacy(host.to_string())
    }
}

/// Object form of a block rule, field names matching the config file.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RawRuleObject {
    /// Host substring the rule applies to.
    pub filter_host: String,
    /// MAC address the rule is scoped to; empty or absent means all clients.
    #[serde(default)]
    pub filter_mac: Option<String>,
    /// Regex matched against the full URL during the request phase.
    #[serde(default)]
    pub filter_match_rule: Option<String>,
    /// Window start as "HH:MM".
    #[serde(default)]
    pub filter_start_time: Option<String>,
    /// Window end as "HH:MM".
    #[serde(default)]
    pub filter_end_time: Option<String>,
    /// ISO weekdays the rule applies to (Monday=1 .. Sunday=7).
    #[serde(default)]
    pub filter_weekday: Option<Vec<u8>>,
}

/// URL regex attached to a rule, compiled at load time.
#[derive(Debug, Clone)]
pub struct UrlPattern {
    /// The regex source as configured.
    pub source: String,
    /// Compiled regex; `None` when compilation failed.
    pub regex: Option<Regex>,
    /// Compile error kept for operator visibility.
    pub error: Option<String>,
}

impl UrlPattern {
    fn compile(source: String) -> Self {
        match Regex::new(&source) {
            Ok(regex) => Self {
                source,
                regex: Some(regex),
                error: None,
            },
            Err(e) => {
                tracing::warn!("Invalid match rule regex {:?}, rule will never fire on URLs: {}", source, e);
                Self {
                    source,
                    regex: None,
                    error: Some(e.to_string()),
                }
            }
        }
    }

    /// Returns true if the compiled regex matches the URL.
    ///
    /// A pattern that failed to compile matches nothing.
    pub fn is_match(&self, url: &str) -> bool {
        self.regex.as_ref().is_some_and(|r| r.is_match(url))
    }
}

/// Daily time window in minutes since midnight, both boundaries inclusive.
///
/// When start > end the window wraps overnight: a time matches if it is at or
/// after the start or at or before the end.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TimeWindow {
    start: u16,
    end: u16,
}

impl TimeWindow {
    /// Parses a window from two "HH:MM" strings.
    pub fn parse(start: &str, end: &str) -> Option<Self> {
        Some(Self {
            start: parse_hhmm(start)?,
            end: parse_hhmm(end)?,
        })
    }

    /// Returns true if this window wraps past midnight.
    pub fn is_overnight(&self) -> bool {
        self.start > self.end
    }

    /// Checks whether a time (minutes since midnight) falls in the window.
    pub fn contains(&self, minutes: u16) -> bool {
        if self.is_overnight() {
            minutes >= self.start || minutes <= self.end
        } else {
            minutes >= self.start && minutes <= self.end
        }
    }
}

fn parse_hhmm(s: &str) -> Option<u16> {
    let (h, m) = s.split_once(':')?;
    let h: u16 = h.parse().ok()?;
    let m: u16 = m.parse().ok()?;
    if h > 23 || m > 59 {
        return None;
    }
    Some(h * 60 + m)
}

/// A normalized block rule.
#[derive(Debug, Clone)]
pub struct BlockRule {
    /// Host substring; a request matches when its host *contains* this.
    pub host: String,
    /// Normalized MAC the rule is scoped to, if any.
    pub mac: Option<String>,
    /// URL regex, checked only when a URL is available.
    pub pattern: Option<UrlPattern>,
    /// Time window the rule is active in; absent means always.
    pub window: Option<TimeWindow>,
    /// ISO weekdays the rule is active on; absent means every day.
    pub weekdays: Option<HashSet<u8>>,
}

impl BlockRule {
    fn from_raw(raw: &RawBlockRule) -> Self {
        match raw {
            RawBlockRule::Legacy(host) => Self {
                host: host.clone(),
                mac: None,
                pattern: None,
                window: None,
                weekdays: None,
            },
            RawBlockRule::Full(obj) => {
                let mac = obj
                    .filter_mac
                    .as_deref()
                    .filter(|m| !m.is_empty())
                    .map(str::to_string);
                let pattern = obj
                    .filter_match_rule
                    .as_deref()
                    .filter(|p| !p.trim().is_empty())
                    .map(|p| UrlPattern::compile(p.to_string()));
                let window = match (&obj.filter_start_time, &obj.filter_end_time) {
                    (Some(start), Some(end)) => {
                        let parsed = TimeWindow::parse(start, end);
                        if parsed.is_none() {
                            tracing::warn!(
                                "Unparseable time window {:?}..{:?} on rule for {:?}, window ignored",
                                start,
                                end,
                                obj.filter_host
                            );
                        }
                        parsed
                    }
                    _ => None,
                };
                let weekdays = obj
                    .filter_weekday
                    .as_ref()
                    .map(|days| days.iter().copied().collect());
                Self {
                    host: obj.filter_host.clone(),
                    mac,
                    pattern,
                    window,
                    weekdays,
                }
            }
        }
    }

    /// Evaluates this rule against a request at a fixed point in time.
    ///
    /// `url` is empty during the CONNECT phase, where only the host is known;
    /// rules carrying a URL pattern then defer to the request phase instead
    /// of firing on host alone.
    pub fn matches_at(&self, host: &str, url: &str, now: DateTime<Local>) -> bool {
        if host.is_empty() || !host.contains(&self.host) {
            return false;
        }

        if let Some(days) = &self.weekdays {
            let today = now.weekday().number_from_monday() as u8;
            if !days.contains(&today) {
                return false;
            }
        }

        if !url.is_empty() {
            if let Some(pattern) = &self.pattern {
                if !pattern.is_match(url) {
                    return false;
                }
            }
        }

        match &self.window {
            None => true,
            Some(window) => {
                let minutes = (now.hour() * 60 + now.minute()) as u16;
                window.contains(minutes)
            }
        }
    }
}

/// Normalizes a MAC address: lowercase, colon-separated, zero-padded octets.
///
/// Returns `None` for anything that is not six colon-separated hex octets.
pub fn normalize_mac(mac: &str) -> Option<String> {
    let cleaned = mac.trim().to_ascii_lowercase();
    let parts: Vec<&str> = cleaned.split(':').collect();
    if parts.len() != 6 {
        return None;
    }
    let mut out = Vec::with_capacity(6);
    for part in parts {
        if part.is_empty() || part.len() > 2 || !part.bytes().all(|b| b.is_ascii_hexdigit()) {
            return None;
        }
        out.push(format!("{:0>2}", part));
    }
    Some(out.join(":"))
}

/// Compiled block rules, replaced wholesale on every config reload.
#[derive(Debug, Default)]
pub struct RuleStore {
    rules: Vec<BlockRule>,
}

impl RuleStore {
    /// Compiles a rule store from raw config rules. Never fails: rules with
    /// invalid regexes are neutralized and kept, not rejected.
    pub fn load(raw: &[RawBlockRule]) -> Self {
        let rules = raw.iter().map(BlockRule::from_raw).collect();
        Self { rules }
    }

    /// All compiled rules.
    pub fn rules(&self) -> &[BlockRule] {
        &self.rules
    }

    /// Number of rules.
    pub fn len(&self) -> usize {
        self.rules.len()
    }

    /// Returns true if no rules are configured.
    pub fn is_empty(&self) -> bool {
        self.rules.is_empty()
    }

    /// Rules in scope for a client with the given (raw) MAC address.
    ///
    /// Unscoped rules always apply; MAC-scoped rules apply when the normalized
    /// MACs are equal. A rule whose own MAC does not normalize is skipped for
    /// this client rather than treated as an error.
    pub fn rules_for_mac(&self, client_mac: &str) -> Vec<&BlockRule> {
        let client = normalize_mac(client_mac);
        self.rules
            .iter()
            .filter(|rule| match &rule.mac {
                None => true,
                Some(rule_mac) => match (normalize_mac(rule_mac), &client) {
                    (Some(r), Some(c)) => r == *c,
                    _ => false,
                },
            })
            .collect()
    }

    /// Returns true if any rule in the client's scope matches (logical OR,
    /// short-circuiting on the first match).
    pub fn is_blocked_at(
        &self,
        host: &str,
        url: &str,
        client_mac: &str,
        now: DateTime<Local>,
    ) -> bool {
        self.rules_for_mac(client_mac)
            .iter()
            .any(|rule| rule.matches_at(host, url, now))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn at(weekday_anchor: u32, hour: u32, minute: u32) -> DateTime<Local> {
        // 2024-01-01 is a Monday; offset by weekday_anchor-1 days.
        Local
            .with_ymd_and_hms(2024, 1, weekday_anchor, hour, minute, 0)
            .unwrap()
    }

    fn full(obj: RawRuleObject) -> RawBlockRule {
        RawBlockRule::Full(obj)
    }

    #[test]
    fn legacy_rule_matches_host_substring() {
        let store = RuleStore::load(&["ads.example.com".into()]);
        let now = at(1, 12, 0);
        assert!(store.is_blocked_at("ads.example.com", "", "", now));
        assert!(store.is_blocked_at("sub.ads.example.com", "", "", now));
        // Asymmetric containment: a shorter host never matches a longer rule.
        assert!(!store.is_blocked_at("example.com", "", "", now));
    }

    #[test]
    fn empty_host_never_matches() {
        let store = RuleStore::load(&["ads.example.com".into()]);
        assert!(!store.is_blocked_at("", "", "", at(1, 12, 0)));
    }

    #[test]
    fn mac_scoping() {
        let store = RuleStore::load(&[full(RawRuleObject {
            filter_host: "ads.example.com".into(),
            filter_mac: Some("F4:6B:8c:90:29:5".into()),
            ..Default::default()
        })]);
        let now = at(1, 12, 0);

        // Matching MAC after normalization (zero padding, case).
        assert!(store.is_blocked_at("ads.example.com", "", "f4:6b:8c:90:29:05", now));
        // A different client never triggers a MAC-scoped rule.
        assert!(!store.is_blocked_at("ads.example.com", "", "aa:bb:cc:dd:ee:ff", now));
        // Unresolvable client MAC sees only unscoped rules.
        assert!(!store.is_blocked_at("ads.example.com", "", "", now));
    }

    #[test]
    fn malformed_rule_mac_skips_rule() {
        let store = RuleStore::load(&[full(RawRuleObject {
            filter_host: "ads.example.com".into(),
            filter_mac: Some("not-a-mac".into()),
            ..Default::default()
        })]);
        assert!(store.rules_for_mac("f4:6b:8c:90:29:05").is_empty());
    }

    #[test]
    fn weekday_restriction() {
        // 2024-01-01 is Monday (ISO 1); 2024-01-07 is Sunday (ISO 7).
        let store = RuleStore::load(&[full(RawRuleObject {
            filter_host: "example.com".into(),
            filter_weekday: Some(vec![7]),
            ..Default::default()
        })]);
        assert!(!store.is_blocked_at("example.com", "", "", at(1, 12, 0)));
        assert!(store.is_blocked_at("example.com", "", "", at(7, 12, 0)));
    }

    #[test]
    fn url_pattern_deferred_at_connect_time() {
        let store = RuleStore::load(&[full(RawRuleObject {
            filter_host: "example.com".into(),
            filter_match_rule: Some(r"/videos/".into()),
            ..Default::default()
        })]);
        let now = at(1, 12, 0);

        // CONNECT phase: empty URL skips the pattern check, host alone fires.
        assert!(store.is_blocked_at("example.com", "", "", now));
        // Request phase: the full URL must match the pattern.
        assert!(store.is_blocked_at("example.com", "https://example.com/videos/1", "", now));
        assert!(!store.is_blocked_at("example.com", "https://example.com/news/1", "", now));
    }

    #[test]
    fn blank_pattern_is_dropped_at_load() {
        let store = RuleStore::load(&[full(RawRuleObject {
            filter_host: "example.com".into(),
            filter_match_rule: Some("   ".into()),
            ..Default::default()
        })]);
        assert!(store.rules()[0].pattern.is_none());
    }

    #[test]
    fn invalid_regex_is_neutralized_with_error() {
        let store = RuleStore::load(&[full(RawRuleObject {
            filter_host: "example.com".into(),
            filter_match_rule: Some("(unclosed".into()),
            ..Default::default()
        })]);
        let rule = &store.rules()[0];
        let pattern = rule.pattern.as_ref().unwrap();
        assert!(pattern.regex.is_none());
        assert!(pattern.error.is_some());
        // Never fires once a URL is in play.
        assert!(!rule.matches_at("example.com", "https://example.com/", at(1, 12, 0)));
        // Still fires host-only at CONNECT time, where the pattern is deferred.
        assert!(rule.matches_at("example.com", "", at(1, 12, 0)));
    }

    #[test]
    fn daytime_window_inclusive_bounds() {
        let store = RuleStore::load(&[full(RawRuleObject {
            filter_host: "example.com".into(),
            filter_start_time: Some("08:00".into()),
            filter_end_time: Some("17:30".into()),
            ..Default::default()
        })]);
        assert!(store.is_blocked_at("example.com", "", "", at(1, 8, 0)));
        assert!(store.is_blocked_at("example.com", "", "", at(1, 17, 30)));
        assert!(!store.is_blocked_at("example.com", "", "", at(1, 7, 59)));
        assert!(!store.is_blocked_at("example.com", "", "", at(1, 17, 31)));
    }

    #[test]
    fn overnight_window_matches_both_boundaries() {
        let store = RuleStore::load(&[full(RawRuleObject {
            filter_host: "example.com".into(),
            filter_start_time: Some("22:00".into()),
            filter_end_time: Some("06:00".into()),
            ..Default::default()
        })]);
        assert!(store.is_blocked_at("example.com", "", "", at(1, 22, 0)));
        assert!(store.is_blocked_at("example.com", "", "", at(1, 6, 0)));
        assert!(store.is_blocked_at("example.com", "", "", at(1, 23, 59)));
        assert!(store.is_blocked_at("example.com", "", "", at(1, 0, 30)));
        assert!(!store.is_blocked_at("example.com", "", "", at(1, 12, 0)));
        assert!(!store.is_blocked_at("example.com", "", "", at(1, 21, 59)));
        assert!(!store.is_blocked_at("example.com", "", "", at(1, 6, 1)));
    }

    #[test]
    fn half_specified_window_means_always() {
        let store = RuleStore::load(&[full(RawRuleObject {
            filter_host: "example.com".into(),
            filter_start_time: Some("08:00".into()),
            ..Default::default()
        })]);
        assert!(store.rules()[0].window.is_none());
        assert!(store.is_blocked_at("example.com", "", "", at(1, 3, 0)));
    }

    #[test]
    fn reload_is_idempotent() {
        let raw = vec![
            "ads.example.com".into(),
            full(RawRuleObject {
                filter_host: "example.com".into(),
                filter_match_rule: Some(r"/videos/".into()),
                filter_start_time: Some("22:00".into()),
                filter_end_time: Some("06:00".into()),
                filter_weekday: Some(vec![1, 2, 3]),
                ..Default::default()
            }),
        ];
        let a = RuleStore::load(&raw);
        let b = RuleStore::load(&raw);

        let probes = [
            ("ads.example.com", "", "", at(1, 12, 0)),
            ("example.com", "https://example.com/videos/1", "", at(1, 23, 0)),
            ("example.com", "https://example.com/videos/1", "", at(6, 23, 0)),
            ("example.com", "https://example.com/news/1", "", at(1, 23, 0)),
        ];
        for (host, url, mac, now) in probes {
            assert_eq!(
                a.is_blocked_at(host, url, mac, now),
                b.is_blocked_at(host, url, mac, now)
            );
        }
    }

    #[test]
    fn normalize_mac_forms() {
        assert_eq!(
            normalize_mac("F4:6B:8c:90:29:5"),
            Some("f4:6b:8c:90:29:05".into())
        );
        assert_eq!(normalize_mac(" aa:bb:cc:dd:ee:ff "), Some("aa:bb:cc:dd:ee:ff".into()));
        assert_eq!(normalize_mac(""), None);
        assert_eq!(normalize_mac("aa:bb:cc:dd:ee"), None);
        assert_eq!(normalize_mac("zz:bb:cc:dd:ee:ff"), None);
        assert_eq!(normalize_mac("aabb:cc:dd:ee:ff:00"), None);
    }

    #[test]
    fn raw_rule_deserializes_both_shapes() {
        let json = r#"["ads.example.com", {"filter_host": "example.com", "filter_weekday": [6, 7]}]"#;
        let raw: Vec<RawBlockRule> = serde_json::from_str(json).unwrap();
        assert!(matches!(&raw[0], RawBlockRule::Legacy(h) if h == "ads.example.com"));
        assert!(matches!(&raw[1], RawBlockRule::Full(o) if o.filter_host == "example.com"));
    }
}
