//! Anti-scan guard: sliding-window reputation tracking per source IP.
//!
//! Credential scanners hammer the proxy with bogus auth attempts; this guard
//! counts accesses per IP over a trailing two-minute window and flags an IP
//! once it crosses the threshold. A successful authentication (or allow-listed
//! traffic that cannot complete the handshake) grants a ten-minute "good guy"
//! exemption that always wins over flagging, so legitimate busy clients are
//! never trapped. Flagging is purely a function of the trailing window, not
//! cumulative history.
//!
//! All mutation goes through `*_at` methods taking an explicit [`Instant`];
//! the public API passes `Instant::now()`. Tests drive the clock directly.

use std::collections::HashMap;
use std::time::{Duration, Instant};

use parking_lot::Mutex;

/// Sliding window the access count is computed over.
const WINDOW: Duration = Duration::from_secs(2 * 60);
/// In-window access count at which an IP is flagged.
const BAD_THRESHOLD: usize = 20;
/// Idle time after which a record is evicted.
const INACTIVE_TIMEOUT: Duration = Duration::from_secs(10 * 60);
/// Length of the good-guy exemption granted by [`AntiScanGuard::mark_trusted`].
const GOOD_GUY_DURATION: Duration = Duration::from_secs(10 * 60);
/// Hard cap on tracked IPs; beyond this the oldest records are dropped.
const MAX_ENTRIES: usize = 10_000;
/// How many records a cap overflow evicts at once.
const EVICT_BATCH: usize = 1_000;

#[derive(Debug, Clone)]
struct AccessRecord {
    timestamps: Vec<Instant>,
    is_bad: bool,
    last_seen: Instant,
    good_until: Option<Instant>,
}

impl AccessRecord {
    fn new(now: Instant) -> Self {
        Self {
            timestamps: Vec::new(),
            is_bad: false,
            last_seen: now,
            good_until: None,
        }
    }

    fn is_exempt(&self, now: Instant) -> bool {
        self.good_until.is_some_and(|until| now < until)
    }
}

/// Per-IP access tracker with good-guy exemptions.
#[derive(Debug, Default)]
pub struct AntiScanGuard {
    records: Mutex<HashMap<String, AccessRecord>>,
}

impl AntiScanGuard {
    /// Creates an empty guard.
    pub fn new() -> Self {
        Self::default()
    }

    /// Records an access and returns the in-window count for the IP.
    pub fn record_access(&self, ip: &str) -> usize {
        self.record_access_at(ip, Instant::now())
    }

    pub(crate) fn record_access_at(&self, ip: &str, now: Instant) -> usize {
        let mut records = self.records.lock();
        let record = records
            .entry(ip.to_string())
            .or_insert_with(|| AccessRecord::new(now));

        let cutoff = now.checked_sub(WINDOW);
        record
            .timestamps
            .retain(|ts| cutoff.is_none_or(|c| *ts > c));
        record.timestamps.push(now);
        let count = record.timestamps.len();

        // Exemption always wins over flagging.
        record.is_bad = if record.is_exempt(now) {
            false
        } else {
            record.is_bad || count >= BAD_THRESHOLD
        };
        record.last_seen = now;

        if record.is_bad && count == BAD_THRESHOLD {
            tracing::warn!("Flagged {} after {} accesses in window", ip, count);
        }

        count
    }

    /// Returns true if the IP is currently flagged as abusive.
    pub fn is_flagged(&self, ip: &str) -> bool {
        self.is_flagged_at(ip, Instant::now())
    }

    pub(crate) fn is_flagged_at(&self, ip: &str, now: Instant) -> bool {
        let records = self.records.lock();
        match records.get(ip) {
            None => false,
            Some(record) => !record.is_exempt(now) && record.is_bad,
        }
    }

    /// Grants the IP a good-guy exemption and immediately clears its flag.
    pub fn mark_trusted(&self, ip: &str) {
        self.mark_trusted_at(ip, Instant::now());
    }

    pub(crate) fn mark_trusted_at(&self, ip: &str, now: Instant) {
        let mut records = self.records.lock();
        let record = records
            .entry(ip.to_string())
            .or_insert_with(|| AccessRecord::new(now));
        record.good_until = Some(now + GOOD_GUY_DURATION);
        record.last_seen = now;
        record.is_bad = false;
    }

    /// Evicts idle records and bounds the table size.
    ///
    /// Records idle beyond the inactivity timeout are dropped unless their
    /// exemption is still active; surviving records have stale timestamps
    /// pruned. Should the table still exceed the hard cap, the oldest records
    /// are evicted regardless of exemption, bounding memory under sustained
    /// scanning from many sources.
    pub fn sweep(&self) {
        self.sweep_at(Instant::now());
    }

    pub(crate) fn sweep_at(&self, now: Instant) {
        let mut records = self.records.lock();
        let inactive_cutoff = now.checked_sub(INACTIVE_TIMEOUT);
        let window_cutoff = now.checked_sub(WINDOW);

        records.retain(|_, record| {
            record.is_exempt(now)
                || inactive_cutoff.is_none_or(|cutoff| record.last_seen >= cutoff)
        });
        for record in records.values_mut() {
            record
                .timestamps
                .retain(|ts| window_cutoff.is_none_or(|c| *ts > c));
        }

        if records.len() > MAX_ENTRIES {
            let mut by_age: Vec<(String, Instant)> = records
                .iter()
                .map(|(ip, record)| (ip.clone(), record.last_seen))
                .collect();
            by_age.sort_by_key(|(_, last_seen)| *last_seen);
            let evicted = by_age.len().min(EVICT_BATCH);
            for (ip, _) in by_age.into_iter().take(EVICT_BATCH) {
                records.remove(&ip);
            }
            tracing::warn!("Access table over capacity, evicted {} oldest records", evicted);
        }
    }

    /// Number of tracked IPs.
    pub fn len(&self) -> usize {
        self.records.lock().len()
    }

    /// Returns true if no IPs are tracked.
    pub fn is_empty(&self) -> bool {
        self.records.lock().is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn below_threshold_not_flagged() {
        let guard = AntiScanGuard::new();
        let base = Instant::now();
        for i in 0..19 {
            guard.record_access_at("1.2.3.4", base + Duration::from_millis(i));
        }
        assert!(!guard.is_flagged_at("1.2.3.4", base + Duration::from_secs(1)));
    }

    #[test]
    fn twentieth_access_flags() {
        let guard = AntiScanGuard::new();
        let base = Instant::now();
        for i in 0..19 {
            assert_eq!(
                guard.record_access_at("1.2.3.4", base + Duration::from_millis(i)),
                i as usize + 1
            );
        }
        assert!(!guard.is_flagged_at("1.2.3.4", base + Duration::from_millis(19)));
        guard.record_access_at("1.2.3.4", base + Duration::from_millis(19));
        assert!(guard.is_flagged_at("1.2.3.4", base + Duration::from_millis(20)));
    }

    #[test]
    fn window_slides() {
        let guard = AntiScanGuard::new();
        let base = Instant::now();
        for i in 0..19 {
            guard.record_access_at("1.2.3.4", base + Duration::from_millis(i));
        }
        // Three minutes later the earlier burst has left the window, so this
        // access counts as the only one in-window.
        let later = base + Duration::from_secs(180);
        assert_eq!(guard.record_access_at("1.2.3.4", later), 1);
        assert!(!guard.is_flagged_at("1.2.3.4", later));
    }

    #[test]
    fn trusted_ip_never_flagged() {
        let guard = AntiScanGuard::new();
        let base = Instant::now();
        guard.mark_trusted_at("1.2.3.4", base);
        for i in 0..100 {
            guard.record_access_at("1.2.3.4", base + Duration::from_millis(i));
        }
        assert!(!guard.is_flagged_at("1.2.3.4", base + Duration::from_secs(1)));

        // Exemption lasts ten minutes; volume after expiry flags again.
        let expired = base + GOOD_GUY_DURATION + Duration::from_secs(1);
        for i in 0..BAD_THRESHOLD {
            guard.record_access_at("1.2.3.4", expired + Duration::from_millis(i as u64));
        }
        assert!(guard.is_flagged_at("1.2.3.4", expired + Duration::from_secs(1)));
    }

    #[test]
    fn mark_trusted_clears_existing_flag() {
        let guard = AntiScanGuard::new();
        let base = Instant::now();
        for i in 0..BAD_THRESHOLD {
            guard.record_access_at("1.2.3.4", base + Duration::from_millis(i as u64));
        }
        assert!(guard.is_flagged_at("1.2.3.4", base + Duration::from_secs(1)));
        guard.mark_trusted_at("1.2.3.4", base + Duration::from_secs(2));
        assert!(!guard.is_flagged_at("1.2.3.4", base + Duration::from_secs(3)));
    }

    #[test]
    fn sweep_evicts_idle_records() {
        let guard = AntiScanGuard::new();
        let base = Instant::now();
        guard.record_access_at("1.2.3.4", base);
        guard.record_access_at("5.6.7.8", base + INACTIVE_TIMEOUT);

        guard.sweep_at(base + INACTIVE_TIMEOUT + Duration::from_secs(1));
        assert_eq!(guard.len(), 1);
        assert!(!guard.is_flagged_at("1.2.3.4", base + INACTIVE_TIMEOUT + Duration::from_secs(2)));
    }

    #[test]
    fn sweep_keeps_exempt_idle_records() {
        let guard = AntiScanGuard::new();
        let base = Instant::now();
        guard.mark_trusted_at("1.2.3.4", base);
        guard.sweep_at(base + Duration::from_secs(9 * 60));
        assert_eq!(guard.len(), 1);
    }

    #[test]
    fn sweep_enforces_hard_cap() {
        let guard = AntiScanGuard::new();
        let base = Instant::now();
        for i in 0..(MAX_ENTRIES + 50) {
            let ip = format!("10.0.{}.{}", i / 256, i % 256);
            guard.record_access_at(&ip, base + Duration::from_millis(i as u64));
        }
        guard.sweep_at(base + Duration::from_secs(60));
        assert_eq!(guard.len(), MAX_ENTRIES + 50 - EVICT_BATCH);
    }
}
