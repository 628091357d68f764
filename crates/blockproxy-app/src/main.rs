//! blockproxy - filtering MITM proxy for home LANs.
//!
//! Loads the shared JSON config, runs the proxy, and watches the config's
//! `progress_time_stamp` marker. When the administrative backend bumps it,
//! the proxy is stopped, a short grace period lets in-flight connections
//! drain, and everything is rebuilt from the fresh config so no request is
//! ever evaluated against a half-updated rule set.

use std::path::PathBuf;
use std::time::Duration;

use anyhow::Context;
use clap::Parser;
use tracing_subscriber::EnvFilter;

use blockproxy_core::Config;
use blockproxy_proxy::ProxyServer;

/// How often the config file is polled for a reload marker change.
const RELOAD_POLL_INTERVAL: Duration = Duration::from_secs(2);

/// Drain window between shutting the listener down and rebinding.
const RELOAD_GRACE: Duration = Duration::from_secs(1);

/// blockproxy - filtering MITM proxy for home LANs
#[derive(Parser, Debug)]
#[command(name = "blockproxy", version, about)]
struct Args {
    /// Path to the shared JSON config file
    #[arg(long, default_value = "config.json")]
    config: PathBuf,

    /// Directory holding the root CA certificate and key
    #[arg(long, default_value = "ca")]
    ca_dir: PathBuf,

    /// Override the proxy port from the config file
    #[arg(long)]
    port: Option<u16>,

    /// MAC address of the local interface, reported for loopback clients
    #[arg(long, default_value = "")]
    local_mac: String,

    /// Enable debug logging
    #[arg(long)]
    debug: bool,

    /// Set log level (error, warn, info, debug, trace)
    #[arg(long, default_value = "info")]
    log_level: String,
}

fn init_logging(args: &Args) {
    let log_level = if args.debug { "debug" } else { &args.log_level };
    let env_filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(format!("blockproxy={log_level},warn")));
    tracing_subscriber::fmt().with_env_filter(env_filter).init();
}

fn load_config(args: &Args) -> anyhow::Result<Config> {
    let mut config = Config::load(&args.config)
        .with_context(|| format!("failed to load config {:?}", args.config))?;
    if let Some(port) = args.port {
        config.proxy_port = port;
    }
    Ok(config)
}

/// Why the watch loop returned.
enum Exit {
    /// The reload marker moved; rebuild and rebind.
    Reload,
    /// ctrl-c; shut down for good.
    Shutdown,
}

/// Waits until the config's reload marker changes or the process is
/// interrupted. A file that disappears or turns malformed mid-poll is left
/// alone; the running snapshot stays in force until a readable config shows
/// a new marker.
async fn watch_for_reload(args: &Args, current_marker: &str) -> Exit {
    let mut interval = tokio::time::interval(RELOAD_POLL_INTERVAL);
    interval.tick().await;
    loop {
        tokio::select! {
            _ = interval.tick() => {
                match Config::load(&args.config) {
                    Ok(config) if config.progress_time_stamp != current_marker => {
                        tracing::info!(
                            "Config marker moved ({:?} -> {:?}), reloading",
                            current_marker,
                            config.progress_time_stamp
                        );
                        return Exit::Reload;
                    }
                    Ok(_) => {}
                    Err(e) => tracing::warn!("Config unreadable during poll: {}", e),
                }
            }
            _ = tokio::signal::ctrl_c() => {
                tracing::info!("Interrupt received, shutting down");
                return Exit::Shutdown;
            }
        }
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();
    init_logging(&args);

    loop {
        let config = load_config(&args)?;
        let marker = config.progress_time_stamp.clone();

        let server = ProxyServer::from_config(&config, &args.ca_dir, &args.local_mac)
            .context("failed to start proxy")?;
        tracing::info!(
            "blockproxy {} listening on {} ({} rules, {} devices)",
            env!("CARGO_PKG_VERSION"),
            server.addr(),
            config.block_hosts.len(),
            config.devices.len()
        );
        let handle = server.start()?;

        let exit = watch_for_reload(&args, &marker).await;
        handle.stop().await;

        match exit {
            Exit::Reload => tokio::time::sleep(RELOAD_GRACE).await,
            Exit::Shutdown => break,
        }
    }

    Ok(())
}
