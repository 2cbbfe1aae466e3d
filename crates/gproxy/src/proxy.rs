//! Proxy server: wires the CA, middleware chain and router into the engine.

use std::future::Future;
use std::net::SocketAddr;
use std::sync::Arc;

use hudsucker::rustls::crypto::aws_lc_rs::default_provider;
use hudsucker::Proxy;
use hyper_util::rt::{TokioExecutor, TokioTimer};
use hyper_util::server::conn::auto;
use tokio::net::TcpListener;
use tokio::sync::broadcast;
use tracing::{error, info};

use crate::ca::{CaSource, CertificateAuthority, ConnectAction, TlsPolicy};
use crate::config::{ProxyOptions, ServerTimeouts};
use crate::context::ServerInfo;
use crate::error::{CaError, ProxyError, Result};
use crate::handler::ProxyHandler;
use crate::middleware::{Middleware, MiddlewareChain};
use crate::router::TrafficRouter;

/// Forward proxy server.
///
/// Middleware can only be added before the server is started: starting
/// consumes the server and freezes the chain.
pub struct ProxyServer {
    options: ProxyOptions,
    middlewares: MiddlewareChain,
}

impl ProxyServer {
    /// Creates a server; blank options are filled with defaults.
    pub fn new(options: ProxyOptions) -> Self {
        Self {
            options: options.normalized(),
            middlewares: MiddlewareChain::new(),
        }
    }

    /// Creates a server with default options.
    pub fn with_defaults() -> Self {
        Self::new(ProxyOptions::default())
    }

    /// Appends a middleware to the chain.
    pub fn add_middleware<M: Middleware>(&mut self, unit: M) -> &mut Self {
        self.middlewares.register(unit);
        self
    }

    /// The effective options.
    pub fn options(&self) -> &ProxyOptions {
        &self.options
    }

    /// Number of registered middleware units.
    pub fn middleware_count(&self) -> usize {
        self.middlewares.len()
    }

    /// Runs the proxy until Ctrl-C.
    ///
    /// Fails before binding if MITM is requested and the CA cannot be used;
    /// the server never falls back to passing HTTPS through.
    pub async fn listen_and_serve(self) -> Result<()> {
        let (engine, listener) = self.launch().await?;

        engine
            .serve(listener, async {
                let _ = tokio::signal::ctrl_c().await;
                info!("Shutdown signal received");
            })
            .await
    }

    /// Starts the proxy in the background.
    ///
    /// CA validation and binding happen before this returns.
    pub async fn start(self) -> Result<ProxyHandle> {
        let (engine, listener) = self.launch().await?;
        let addr = engine.server.addr();

        let (shutdown_tx, _) = broadcast::channel::<()>(1);
        let mut shutdown_rx = shutdown_tx.subscribe();

        let handle = tokio::spawn(async move {
            let shutdown = async move {
                let _ = shutdown_rx.recv().await;
                info!("Proxy shutdown signal received");
            };
            if let Err(e) = engine.serve(listener, shutdown).await {
                error!(err = %e, "Proxy stopped with error");
            }
        });

        Ok(ProxyHandle {
            shutdown_tx,
            addr,
            handle,
        })
    }

    async fn launch(self) -> Result<(Engine, TcpListener)> {
        let authority = match self.resolve_authority() {
            Ok(authority) => authority,
            Err(e) => {
                error!(err = %e, "Error to set CA");
                return Err(e.into());
            }
        };

        // The engine always needs a signing authority, even when CONNECT
        // tunnels are passed through untouched.
        let policy = match &authority {
            Some(ca) => ca.build_interception_policy()?,
            None => CertificateAuthority::load_default()?
                .build_interception_policy()?
                .with_connect_action(ConnectAction::Accept),
        };

        let listener = bind(&self.options.addr).await?;
        let addr = listener.local_addr()?;

        let mut server = ServerInfo::new(addr);
        if let Some(ca) = &authority {
            server = server.with_interception(Arc::clone(ca), policy.connect_action());
        }
        let server = Arc::new(server);

        let router = TrafficRouter::new(self.options.assets(), authority)
            .with_download_path(self.options.download_path.clone());
        let handler = ProxyHandler::new(
            self.middlewares,
            router,
            Arc::clone(&server),
            self.options.timeouts.write,
        );

        Ok((
            Engine {
                handler,
                policy,
                server,
                timeouts: self.options.timeouts,
            },
            listener,
        ))
    }

    fn resolve_authority(&self) -> std::result::Result<Option<Arc<CertificateAuthority>>, CaError> {
        if !self.options.mitm {
            info!(
                cert_path = ?self.options.cert_path,
                key_path = ?self.options.key_path,
                "MITM for HTTPS not started"
            );
            return Ok(None);
        }

        let ca = match self.options.ca_paths() {
            Some((key_path, cert_path)) => CertificateAuthority::load(key_path, cert_path)?,
            None => CertificateAuthority::load_default()?,
        };

        match ca.source() {
            CaSource::Files {
                cert_path,
                key_path,
            } => info!(?cert_path, ?key_path, not_after = %ca.not_after(), "Started HTTPS MITM"),
            CaSource::Embedded => {
                info!(not_after = %ca.not_after(), "Started HTTPS MITM with the embedded default CA")
            }
        }

        Ok(Some(Arc::new(ca)))
    }
}

impl std::fmt::Debug for ProxyServer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ProxyServer")
            .field("options", &self.options)
            .field("middlewares", &self.middlewares)
            .finish()
    }
}

impl Default for ProxyServer {
    fn default() -> Self {
        Self::with_defaults()
    }
}

/// Everything the engine needs, resolved and validated.
struct Engine {
    handler: ProxyHandler,
    policy: TlsPolicy,
    server: Arc<ServerInfo>,
    timeouts: ServerTimeouts,
}

impl Engine {
    async fn serve<F>(self, listener: TcpListener, shutdown: F) -> Result<()>
    where
        F: Future<Output = ()> + Send + 'static,
    {
        let proxy = Proxy::builder()
            .with_listener(listener)
            .with_ca(self.policy.authority())
            .with_rustls_connector(default_provider())
            .with_http_handler(self.handler)
            .with_server(server_builder(&self.timeouts))
            .with_graceful_shutdown(shutdown)
            .build()
            .map_err(|e| ProxyError::Engine(e.to_string()))?;

        info!(addr = %self.server.addr(), mitm = self.server.mitm_enabled(), "Starting proxy");

        proxy
            .start()
            .await
            .map_err(|e| ProxyError::Engine(e.to_string()))?;

        info!("Proxy server stopped");
        Ok(())
    }
}

async fn bind(addr: &str) -> Result<TcpListener> {
    match TcpListener::bind(addr).await {
        Ok(listener) => Ok(listener),
        Err(e) => {
            error!(addr, err = %e, "Start proxy failed");
            Err(ProxyError::Listen {
                addr: addr.to_string(),
                reason: e.to_string(),
            })
        }
    }
}

/// Connection-level limits: slow request heads and idle HTTP/2 connections.
fn server_builder(timeouts: &ServerTimeouts) -> auto::Builder<TokioExecutor> {
    let mut server = auto::Builder::new(TokioExecutor::new());
    server
        .http1()
        .timer(TokioTimer::new())
        .header_read_timeout(timeouts.read)
        .keep_alive(true);
    server
        .http2()
        .timer(TokioTimer::new())
        .keep_alive_interval(timeouts.idle)
        .keep_alive_timeout(timeouts.idle);
    server
}

/// Handle for controlling a running proxy server.
pub struct ProxyHandle {
    shutdown_tx: broadcast::Sender<()>,
    addr: SocketAddr,
    handle: tokio::task::JoinHandle<()>,
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
    }

    /// Shuts down the proxy and waits for it to finish.
    pub async fn stop(self) {
        self.shutdown();
        self.wait().await;
    }
}
