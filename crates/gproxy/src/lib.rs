//! gproxy - forward HTTP/HTTPS proxy with a pluggable middleware pipeline.
//!
//! Plain HTTP requests are forwarded; HTTPS goes through CONNECT tunnels that
//! are either relayed untouched or, with MITM enabled, terminated with a
//! locally trusted CA so middleware can see the plaintext.
//!
//! ## Architecture
//!
//! ```text
//! Client ─→ Engine (hudsucker) ─→ CONNECT?  ──yes──→ TlsPolicy: tunnel / intercept / reject
//!                                    │ no
//!                                    ▼
//!                              Proxy form? ──no──→ TrafficRouter (/, /ssl, /health, 500)
//!                                    │ yes
//!                                    ▼
//!                      MiddlewareChain::dispatch_request ──response──→ Client
//!                                    │ request
//!                                    ▼
//!                                Upstream
//!                                    │
//!                                    ▼
//!                      MiddlewareChain::dispatch_response ─→ Client
//! ```
//!
//! ## Example
//!
//! ```no_run
//! use gproxy::{ProxyOptions, ProxyServer, TrafficLogger};
//!
//! #[tokio::main]
//! async fn main() {
//!     let mut server = ProxyServer::new(ProxyOptions {
//!         mitm: true,
//!         ..Default::default()
//!     });
//!     server.add_middleware(TrafficLogger::new());
//!     server.listen_and_serve().await.unwrap();
//! }
//! ```

mod ca;
mod config;
mod context;
mod error;
mod handler;
mod middleware;
mod middlewares;
mod proxy;
mod router;

#[cfg(test)]
mod test_support;

pub use ca::{check_validity, CaSource, CertificateAuthority, ConnectAction, PolicyAuthority, TlsPolicy};
pub use config::{ProxyOptions, ServerTimeouts, DEFAULT_ADDR, DEFAULT_LOG_LEVEL};
pub use context::{ServerInfo, TransactionContext};
pub use error::{CaError, ProxyError, Result};
pub use handler::ProxyHandler;
pub use middleware::{BaseMiddleware, Middleware, MiddlewareChain};
pub use middlewares::TrafficLogger;
pub use proxy::{ProxyHandle, ProxyServer};
pub use router::{bundled_assets_dir, Endpoint, StaticAssets, TrafficRouter, DEFAULT_DOWNLOAD_PATH};

/// Types middleware implementations work with.
pub use hudsucker::{Body, RequestOrResponse};
