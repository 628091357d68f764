//! Loopback status report.
//!
//! Requests addressed to the proxy's own advertised host and port are never
//! forwarded; the request phase answers them with this plain-text report
//! instead. Presentation only, no decisions are made here.

use std::time::Instant;

/// Renders the self-request status page.
#[derive(Debug, Clone)]
pub struct StatusPage {
    started_at: Instant,
    proxy_port: u16,
    web_interface_port: u16,
}

impl StatusPage {
    pub fn new(proxy_port: u16, web_interface_port: u16) -> Self {
        Self {
            started_at: Instant::now(),
            proxy_port,
            web_interface_port,
        }
    }

    /// Plain-text report body.
    pub fn render(&self, rule_count: usize, device_count: usize) -> String {
        let uptime = self.started_at.elapsed().as_secs();
        format!(
            "blockproxy {}\n\
             uptime: {}s\n\
             proxy port: {}\n\
             web interface port: {}\n\
             block rules: {}\n\
             known devices: {}\n",
            env!("CARGO_PKG_VERSION"),
            uptime,
            self.proxy_port,
            self.web_interface_port,
            rule_count,
            device_count,
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn report_lists_counts_and_ports() {
        let page = StatusPage::new(8001, 8002);
        let body = page.render(5, 3);
        assert!(body.starts_with("blockproxy "));
        assert!(body.contains("proxy port: 8001"));
        assert!(body.contains("web interface port: 8002"));
        assert!(body.contains("block rules: 5"));
        assert!(body.contains("known devices: 3"));
    }
}
