//! Tunnel engine hooks.
//!
//! Bridges hudsucker's per-request callbacks to the middleware chain, the
//! CONNECT policy and the direct-access router.

use std::any::Any;
use std::future::Future;
use std::net::SocketAddr;
use std::panic::AssertUnwindSafe;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use futures::FutureExt;
use hudsucker::{
    hyper::{Method, Request, Response, StatusCode},
    Body, HttpContext, HttpHandler, RequestOrResponse,
};
use tracing::{debug, error, info, warn};

use crate::ca::ConnectAction;
use crate::context::{ServerInfo, TransactionContext};
use crate::middleware::MiddlewareChain;
use crate::router::{text_response, TrafficRouter};

/// State shared by every clone of the handler.
struct Shared {
    chain: MiddlewareChain,
    router: TrafficRouter,
    server: Arc<ServerInfo>,
    sessions: AtomicU64,
    hook_timeout: Duration,
}

/// HTTP handler installed into the tunnel engine.
///
/// The engine clones the handler for each exchange; the clone carries the
/// transaction context from the request hook to the response hook.
#[derive(Clone)]
pub struct ProxyHandler {
    shared: Arc<Shared>,
    txn: Option<TransactionContext>,
}

impl ProxyHandler {
    /// Creates a handler. The chain is frozen from here on.
    pub fn new(
        chain: MiddlewareChain,
        router: TrafficRouter,
        server: Arc<ServerInfo>,
        hook_timeout: Duration,
    ) -> Self {
        Self {
            shared: Arc::new(Shared {
                chain,
                router,
                server,
                sessions: AtomicU64::new(0),
                hook_timeout,
            }),
            txn: None,
        }
    }

    /// A request in origin form (no scheme, no authority) was sent to the
    /// proxy as if it were the destination server.
    fn is_non_proxy(req: &Request<Body>) -> bool {
        req.method() != Method::CONNECT
            && req.uri().scheme().is_none()
            && req.uri().authority().is_none()
    }

    fn next_session(&self) -> u64 {
        self.shared.sessions.fetch_add(1, Ordering::Relaxed) + 1
    }

    fn handle_connect(&self, req: Request<Body>) -> RequestOrResponse {
        match self.shared.server.connect_action() {
            ConnectAction::Reject => {
                info!(destination = %req.uri(), "Rejected CONNECT");
                RequestOrResponse::Response(text_response(
                    StatusCode::BAD_GATEWAY,
                    "CONNECT rejected by proxy policy.\n",
                ))
            }
            action => {
                debug!(destination = %req.uri(), ?action, "Accepted CONNECT");
                RequestOrResponse::Request(req)
            }
        }
    }

    /// Runs one hook phase, bounded by the hook timeout, with panics contained.
    async fn guarded<F, T>(&self, phase: &'static str, session: u64, fut: F) -> Result<T, Response<Body>>
    where
        F: Future<Output = T> + Send,
    {
        let bounded = tokio::time::timeout(
            self.shared.hook_timeout,
            AssertUnwindSafe(fut).catch_unwind(),
        );

        match bounded.await {
            Ok(Ok(value)) => Ok(value),
            Ok(Err(payload)) => {
                error!(
                    session,
                    phase,
                    panic = panic_message(payload.as_ref()),
                    "Hook panicked, failing transaction"
                );
                Err(text_response(
                    StatusCode::BAD_GATEWAY,
                    "Proxy middleware failed.\n",
                ))
            }
            Err(_) => {
                warn!(
                    session,
                    phase,
                    timeout = ?self.shared.hook_timeout,
                    "Hook timed out, failing transaction"
                );
                Err(text_response(
                    StatusCode::GATEWAY_TIMEOUT,
                    "Proxy middleware timed out.\n",
                ))
            }
        }
    }

    /// Request hook for a client at `client_addr`.
    pub async fn process_request(
        &mut self,
        client_addr: SocketAddr,
        req: Request<Body>,
    ) -> RequestOrResponse {
        self.txn = None;

        if req.method() == Method::CONNECT {
            return self.handle_connect(req);
        }

        // Direct hits are not transactions and carry session 0.
        if Self::is_non_proxy(&req) {
            let res = match self
                .guarded("router", 0, self.shared.router.route(&req, client_addr))
                .await
            {
                Ok(res) | Err(res) => res,
            };
            return RequestOrResponse::Response(res);
        }

        let txn = TransactionContext::new(
            self.next_session(),
            client_addr,
            req.method().clone(),
            req.uri().clone(),
            Arc::clone(&self.shared.server),
        );

        let outcome = match self
            .guarded(
                "request",
                txn.session(),
                self.shared.chain.dispatch_request(req, &txn),
            )
            .await
        {
            Ok(outcome) => outcome,
            Err(failure) => return RequestOrResponse::Response(failure),
        };

        if let RequestOrResponse::Request(_) = &outcome {
            self.txn = Some(txn);
        }
        outcome
    }

    /// Response hook for the exchange started by the last [`Self::process_request`].
    pub async fn process_response(&mut self, res: Response<Body>) -> Response<Body> {
        let Some(txn) = self.txn.take() else {
            return res;
        };

        match self
            .guarded(
                "response",
                txn.session(),
                self.shared.chain.dispatch_response(res, &txn),
            )
            .await
        {
            Ok(res) => res,
            Err(failure) => failure,
        }
    }
}

impl std::fmt::Debug for ProxyHandler {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ProxyHandler")
            .field("chain", &self.shared.chain)
            .field("server", &self.shared.server)
            .field("txn", &self.txn.as_ref().map(TransactionContext::session))
            .finish()
    }
}

impl HttpHandler for ProxyHandler {
    async fn handle_request(&mut self, ctx: &HttpContext, req: Request<Body>) -> RequestOrResponse {
        self.process_request(ctx.client_addr, req).await
    }

    async fn handle_response(&mut self, _ctx: &HttpContext, res: Response<Body>) -> Response<Body> {
        self.process_response(res).await
    }

    async fn should_intercept(&mut self, _ctx: &HttpContext, _req: &Request<Body>) -> bool {
        self.shared.server.mitm_enabled()
    }
}

fn panic_message(payload: &(dyn Any + Send)) -> &str {
    if let Some(message) = payload.downcast_ref::<&'static str>() {
        message
    } else if let Some(message) = payload.downcast_ref::<String>() {
        message
    } else {
        "unknown panic"
    }
}
