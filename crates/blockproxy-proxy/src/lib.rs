//! Blockproxy Proxy - MITM traffic controller.
//!
//! A filtering forward proxy for home LANs: plain HTTP proxying plus HTTPS
//! via CONNECT with selective TLS dissection. Each connection walks the same
//! phase pipeline:
//!
//! ```text
//! CONNECT (HTTPS) → auth → tunnel or dissect
//! request         → self-loopback guard → auth (HTTP) → block rules
//!                   → rewrite rules → relay/pass through
//! response        → rewrite rules
//! error           → classify → synthesize 404/502 or recover via the
//!                   tolerant fallback client
//! ```
//!
//! Policy lives in [`engine::DecisionEngine`] with all stores injected at
//! construction; [`handler::BlockHandler`] adapts it to hudsucker's hooks.

mod ca;
mod error;
mod handler;
mod relay;
mod server;
mod status;

pub mod engine;
pub mod fallback;
pub mod rewrite;

pub use ca::{CaManager, CaManagerError};
pub use engine::{classify, ConnectDecision, DecisionEngine, ErrorClass, RequestDecision};
pub use error::{ProxyError, Result};
pub use fallback::{FallbackRequest, FallbackResponse};
pub use handler::BlockHandler;
pub use relay::DebugRelay;
pub use rewrite::{Hook, RequestCtx, RewriteRegistry, SyntheticResponse};
pub use server::{ProxyHandle, ProxyServer};
pub use status::StatusPage;
