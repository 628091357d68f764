//! Runtime configuration consumed by the proxy.
//!
//! The config file itself is owned by the administrative backend; this module
//! only reads it. Every field has a default so a missing or partial file never
//! prevents startup. The `progress_time_stamp` field is the reload trigger:
//! the app compares it across polls and restarts the proxy when it moves.

use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::devices::DeviceRecord;
use crate::error::Result;
use crate::rules::RawBlockRule;

/// Default port the proxy listens on.
pub const DEFAULT_PROXY_PORT: u16 = 8001;

/// Default port of the administrative web interface.
pub const DEFAULT_WEB_INTERFACE_PORT: u16 = 8002;

/// Proxy configuration as stored in the shared JSON config file.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Block rules, either legacy host strings or full rule objects.
    pub block_hosts: Vec<RawBlockRule>,
    /// Port the proxy listens on.
    pub proxy_port: u16,
    /// Port of the administrative web interface.
    pub web_interface_port: u16,
    /// Proxy username; empty disables authentication entirely.
    pub auth_username: String,
    /// Proxy password.
    pub auth_password: String,
    /// Upstream debug relay as "ip:port"; empty disables the relay.
    pub vpn_proxy: String,
    /// Public host name the proxy is reachable under.
    pub your_domain: String,
    /// LAN devices discovered by the external scanner.
    pub devices: Vec<DeviceRecord>,
    /// Monotonically increasing marker bumped by the backend on every save.
    pub progress_time_stamp: String,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            block_hosts: Vec::new(),
            proxy_port: DEFAULT_PROXY_PORT,
            web_interface_port: DEFAULT_WEB_INTERFACE_PORT,
            auth_username: String::new(),
            auth_password: String::new(),
            vpn_proxy: String::new(),
            your_domain: String::new(),
            devices: Vec::new(),
            progress_time_stamp: String::new(),
        }
    }
}

impl Config {
    /// Loads the configuration from a JSON file.
    ///
    /// A missing file yields the default configuration; a malformed file is
    /// an error so an operator edit that breaks the JSON is surfaced rather
    /// than silently replaced by defaults.
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        if !path.exists() {
            tracing::info!("Config file {:?} not found, using defaults", path);
            return Ok(Self::default());
        }
        let raw = std::fs::read_to_string(path)?;
        let config = serde_json::from_str(&raw)?;
        Ok(config)
    }

    /// Returns true if proxy authentication is enabled.
    pub fn auth_enabled(&self) -> bool {
        !self.auth_username.is_empty()
    }

    /// Parses the `vpn_proxy` field into an address pair, if configured.
    pub fn relay_target(&self) -> Option<(String, u16)> {
        if self.vpn_proxy.is_empty() {
            return None;
        }
        let (host, port) = self.vpn_proxy.rsplit_once(':')?;
        let port: u16 = port.parse().ok()?;
        if host.is_empty() {
            return None;
        }
        Some((host.to_string(), port))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use tempfile::NamedTempFile;

    #[test]
    fn load_missing_file_uses_defaults() {
        let config = Config::load("/nonexistent/config.json").unwrap();
        assert_eq!(config.proxy_port, DEFAULT_PROXY_PORT);
        assert!(config.block_hosts.is_empty());
        assert!(!config.auth_enabled());
    }

    #[test]
    fn load_partial_file_fills_defaults() {
        let mut file = NamedTempFile::new().unwrap();
        write!(
            file,
            r#"{{"proxy_port": 9001, "block_hosts": ["ads.example.com"]}}"#
        )
        .unwrap();

        let config = Config::load(file.path()).unwrap();
        assert_eq!(config.proxy_port, 9001);
        assert_eq!(config.web_interface_port, DEFAULT_WEB_INTERFACE_PORT);
        assert_eq!(config.block_hosts.len(), 1);
    }

    #[test]
    fn load_malformed_file_is_error() {
        let mut file = NamedTempFile::new().unwrap();
        write!(file, "{{not json").unwrap();
        assert!(Config::load(file.path()).is_err());
    }

    #[test]
    fn auth_enabled_requires_username() {
        let mut config = Config::default();
        assert!(!config.auth_enabled());
        config.auth_username = "admin".into();
        assert!(config.auth_enabled());
    }

    #[test]
    fn relay_target_parsing() {
        let mut config = Config::default();
        assert!(config.relay_target().is_none());

        config.vpn_proxy = "127.0.0.1:1087".into();
        assert_eq!(config.relay_target(), Some(("127.0.0.1".into(), 1087)));

        config.vpn_proxy = "badaddr".into();
        assert!(config.relay_target().is_none());

        config.vpn_proxy = "host:notaport".into();
        assert!(config.relay_target().is_none());
    }
}
