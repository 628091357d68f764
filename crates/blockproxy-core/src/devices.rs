//! Device resolver: maps client IPs to MAC addresses.
//!
//! The table is fed by an external LAN scanner and replaced wholesale on
//! every config reload; the core only ever reads it. Loopback clients resolve
//! to the local interface MAC so rules scoped to the proxy host itself work.

use std::collections::HashMap;

use parking_lot::RwLock;
use serde::{Deserialize, Serialize};

/// A discovered LAN device.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeviceRecord {
    /// IPv4 address as reported by the scanner.
    pub ip: String,
    /// MAC address as reported by the scanner.
    pub mac: String,
}

/// Read-mostly IP -> MAC lookup table.
#[derive(Debug)]
pub struct DeviceTable {
    map: RwLock<HashMap<String, String>>,
    local_mac: String,
}

impl DeviceTable {
    /// Creates a table from the scanner's device list.
    ///
    /// `local_mac` is the MAC of the interface the proxy itself runs on,
    /// returned for loopback clients.
    pub fn new(devices: &[DeviceRecord], local_mac: impl Into<String>) -> Self {
        let map = devices
            .iter()
            .map(|d| (d.ip.clone(), d.mac.clone()))
            .collect();
        Self {
            map: RwLock::new(map),
            local_mac: local_mac.into(),
        }
    }

    /// Replaces the table contents with a freshly scanned device list.
    pub fn replace(&self, devices: &[DeviceRecord]) {
        let mut map = self.map.write();
        map.clear();
        for d in devices {
            map.insert(d.ip.clone(), d.mac.clone());
        }
        tracing::debug!("Device table replaced, {} entries", map.len());
    }

    /// Resolves a client IP to its MAC address, or "" when unknown.
    pub fn mac_of(&self, ip: &str) -> String {
        let ip = normalize_ip(ip);
        if ip == "127.0.0.1" || ip == "::1" {
            return self.local_mac.clone();
        }
        self.map.read().get(ip.as_ref()).cloned().unwrap_or_default()
    }

    /// Number of known devices.
    pub fn len(&self) -> usize {
        self.map.read().len()
    }

    /// Returns true if no devices are known.
    pub fn is_empty(&self) -> bool {
        self.map.read().is_empty()
    }
}

/// Normalizes a socket-observed address to a plain IP string.
///
/// Handles bracketed forms like `[::ffff:10.0.0.5]:3000` and strips the
/// IPv4-mapped `::ffff:` prefix so addresses compare against scanner output.
pub fn normalize_ip(raw: &str) -> std::borrow::Cow<'_, str> {
    let mut ip = raw;
    if let Some(rest) = ip.strip_prefix('[') {
        if let Some(end) = rest.find(']') {
            ip = &rest[..end];
        }
    }
    let lower_prefix = ip.get(..7).map(|p| p.eq_ignore_ascii_case("::ffff:"));
    if lower_prefix == Some(true) {
        std::borrow::Cow::Borrowed(&ip[7..])
    } else {
        std::borrow::Cow::Borrowed(ip)
    }
}
