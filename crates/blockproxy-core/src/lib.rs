//! Blockproxy Core - rule store, device resolver, anti-scan guard and auth gate.
//!
//! This crate holds the policy side of the traffic controller: everything the
//! decision engine consults that does not itself speak HTTP. The proxy crate
//! injects these stores at construction, so they carry no global state and can
//! be exercised directly in tests.

pub mod auth;
pub mod config;
pub mod devices;
pub mod error;
pub mod guard;
pub mod rules;

pub use auth::{AuthDecision, AuthGate, Protocol};
pub use config::Config;
pub use devices::{normalize_ip, DeviceRecord, DeviceTable};
pub use error::{CoreError, Result};
pub use guard::AntiScanGuard;
pub use rules::{BlockRule, RawBlockRule, RuleStore};
