//! MITM proxy server.
//!
//! Wires the decision engine into hudsucker: one handler clone per client
//! connection, a broadcast channel for shutdown, and a periodic sweep task
//! keeping the anti-scan guard bounded. Reload is the caller's job: shut the
//! server down, rebuild the engine from fresh config, start a new server.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use hudsucker::rustls::crypto::aws_lc_rs::default_provider;
use hudsucker::Proxy;
use tokio::sync::broadcast;

use blockproxy_core::Config;

use crate::ca::CaManager;
use crate::engine::DecisionEngine;
use crate::error::{ProxyError, Result};
use crate::handler::BlockHandler;

/// How often the anti-scan guard evicts stale records.
const SWEEP_INTERVAL: Duration = Duration::from_secs(60);

/// MITM proxy server for a single engine snapshot.
pub struct ProxyServer {
    addr: SocketAddr,
    ca_manager: CaManager,
    engine: Arc<DecisionEngine>,
}

impl ProxyServer {
    /// Creates a server, generating the root CA on first run.
    pub fn new(addr: SocketAddr, ca_manager: CaManager, engine: Arc<DecisionEngine>) -> Result<Self> {
        ca_manager.ensure_ca().map_err(ProxyError::Ca)?;
        Ok(Self {
            addr,
            ca_manager,
            engine,
        })
    }

    /// Builds the engine from a loaded config and binds on all interfaces at
    /// the configured proxy port.
    pub fn from_config(
        config: &Config,
        ca_dir: impl AsRef<std::path::Path>,
        local_mac: &str,
    ) -> Result<Self> {
        let engine = DecisionEngine::from_config(config, local_mac)?;
        let addr = SocketAddr::from(([0, 0, 0, 0], config.proxy_port));
        Self::new(addr, CaManager::new(ca_dir), Arc::new(engine))
    }

    /// Returns the address the proxy is configured to listen on.
    pub fn addr(&self) -> SocketAddr {
        self.addr
    }

    /// Returns the CA certificate path for client installation.
    pub fn ca_cert_path(&self) -> std::path::PathBuf {
        self.ca_manager.cert_path()
    }

    /// The engine snapshot this server decides with.
    pub fn engine(&self) -> &Arc<DecisionEngine> {
        &self.engine
    }

    /// Starts the proxy server in the background.
    ///
    /// Returns a handle that can be used to stop the server.
    pub fn start(self) -> Result<ProxyHandle> {
        let (shutdown_tx, _) = broadcast::channel::<()>(1);
        let shutdown_tx_clone = shutdown_tx.clone();
        let addr = self.addr;

        // Load CA authority before spawning
        let authority = self.ca_manager.ensure_ca().map_err(ProxyError::Ca)?;

        let engine = self.engine.clone();
        let mut sweep_shutdown = shutdown_tx.subscribe();
        let sweep_engine = engine.clone();
        let sweeper = tokio::spawn(async move {
            let mut interval = tokio::time::interval(SWEEP_INTERVAL);
            loop {
                tokio::select! {
                    _ = interval.tick() => sweep_engine.guard().sweep(),
                    _ = sweep_shutdown.recv() => break,
                }
            }
        });

        tracing::info!("Starting MITM proxy on {}", addr);
        tracing::info!("CA certificate: {:?}", self.ca_cert_path());

        let handle = tokio::spawn(async move {
            let handler = BlockHandler::new(engine);

            let proxy = match Proxy::builder()
                .with_addr(addr)
                .with_ca(authority)
                .with_rustls_connector(default_provider())
                .with_http_handler(handler.clone())
                .with_websocket_handler(handler)
                .build()
            {
                Ok(p) => p,
                Err(e) => {
                    tracing::error!("Failed to build proxy: {}", e);
                    return;
                }
            };

            let mut shutdown_rx = shutdown_tx.subscribe();

            tokio::select! {
                result = proxy.start() => {
                    if let Err(e) = result {
                        tracing::error!("Proxy error: {}", e);
                    }
                }
                _ = shutdown_rx.recv() => {
                    tracing::info!("Proxy shutdown signal received");
                }
            };
        });

        Ok(ProxyHandle {
            shutdown_tx: shutdown_tx_clone,
            addr,
            handle,
            sweeper,
        })
    }
}

/// Handle for controlling a running proxy server.
pub struct ProxyHandle {
    shutdown_tx: broadcast::Sender<()>,
    addr: SocketAddr,
    handle: tokio::task::JoinHandle<()>,
    sweeper: tokio::task::JoinHandle<()>,
}

impl ProxyHandle {
    /// Returns the address the proxy is listening on.
    pub fn addr(&self) -> SocketAddr {
        self.addr
    }

    /// Signals the proxy to shut down.
    pub fn shutdown(&self) {
        let _ = self.shutdown_tx.send(());
    }

    /// Waits for the proxy to finish.
    pub async fn wait(self) {
        let _ = self.handle.await;
        let _ = self.sweeper.await;
    }

    /// Shuts down the proxy and waits for it to finish.
    pub async fn stop(self) {
        self.shutdown();
        self.wait().await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn test_server(temp_dir: &TempDir) -> ProxyServer {
        let config = Config::default();
        let engine = DecisionEngine::from_config(&config, "f4:6b:8c:90:29:05").unwrap();
        ProxyServer::new(
            SocketAddr::from(([127, 0, 0, 1], 0)),
            CaManager::new(temp_dir.path().join("ca")),
            Arc::new(engine),
        )
        .unwrap()
    }

    #[test]
    fn server_generates_ca_on_construction() {
        let temp_dir = TempDir::new().unwrap();
        let server = test_server(&temp_dir);
        assert!(server.ca_cert_path().exists());
    }

    #[tokio::test]
    async fn proxy_handle_shutdown() {
        let temp_dir = TempDir::new().unwrap();
        let server = test_server(&temp_dir);

        let handle = server.start().unwrap();

        // Give it a moment to start
        tokio::time::sleep(Duration::from_millis(100)).await;

        handle.stop().await;
    }
}
