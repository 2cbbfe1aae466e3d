//! Middleware contract and the ordered chain that runs it.
//!
//! Each unit gates itself: the chain asks `request_condition` before calling
//! `on_request`, and `response_condition` before calling `on_response`. Units
//! run in registration order. A unit that answers a request with a response
//! short-circuits the rest of the request phase and the upstream call.

use async_trait::async_trait;
use hudsucker::{
    hyper::{Request, Response},
    Body, RequestOrResponse,
};

use crate::context::TransactionContext;

/// A self-contained observer/mutator attached to a proxied transaction.
///
/// Every method has a no-op default, so implementors override only what they
/// need. Hooks must not panic; the proxy contains a panic to the transaction
/// that caused it and answers that client with `502 Bad Gateway`.
#[async_trait]
pub trait Middleware: Send + Sync + 'static {
    /// Name used in log output.
    fn name(&self) -> &str {
        std::any::type_name::<Self>()
    }

    /// Whether [`Middleware::on_request`] should run for this request.
    fn request_condition(&self, _req: &Request<Body>, _ctx: &TransactionContext) -> bool {
        false
    }

    /// Inspects or rewrites a request before it is forwarded.
    ///
    /// Returning [`RequestOrResponse::Response`] answers the client directly;
    /// the request is never sent upstream.
    async fn on_request(&self, req: Request<Body>, _ctx: &TransactionContext) -> RequestOrResponse {
        RequestOrResponse::Request(req)
    }

    /// Whether [`Middleware::on_response`] should run for this response.
    fn response_condition(&self, _res: &Response<Body>, _ctx: &TransactionContext) -> bool {
        false
    }

    /// Inspects or rewrites an upstream response before it reaches the client.
    async fn on_response(&self, res: Response<Body>, _ctx: &TransactionContext) -> Response<Body> {
        res
    }
}

/// The canonical no-op unit: never applies, changes nothing.
///
/// Useful as a placeholder, or as a field other units delegate to.
#[derive(Debug, Clone, Copy, Default)]
pub struct BaseMiddleware;

impl Middleware for BaseMiddleware {}

/// Ordered registry of middleware units.
///
/// Insertion order is evaluation order. The chain is only mutable while the
/// server that owns it has not started; once serving, it is frozen behind an
/// `Arc` and read concurrently without locks.
#[derive(Default)]
pub struct MiddlewareChain {
    units: Vec<Box<dyn Middleware>>,
}

impl MiddlewareChain {
    /// Creates an empty chain.
    pub fn new() -> Self {
        Self::default()
    }

    /// Appends a unit. The same type may be registered more than once.
    pub fn register<M: Middleware>(&mut self, unit: M) {
        tracing::debug!(middleware = unit.name(), "Registered middleware");
        self.units.push(Box::new(unit));
    }

    /// Number of registered units.
    pub fn len(&self) -> usize {
        self.units.len()
    }

    /// Returns true if no units are registered.
    pub fn is_empty(&self) -> bool {
        self.units.is_empty()
    }

    /// Runs the request phase.
    ///
    /// Stops at the first unit that returns a response.
    pub async fn dispatch_request(
        &self,
        mut req: Request<Body>,
        ctx: &TransactionContext,
    ) -> RequestOrResponse {
        for unit in &self.units {
            if !unit.request_condition(&req, ctx) {
                continue;
            }

            match unit.on_request(req, ctx).await {
                RequestOrResponse::Request(next) => req = next,
                RequestOrResponse::Response(res) => {
                    tracing::debug!(
                        session = ctx.session(),
                        middleware = unit.name(),
                        status = res.status().as_u16(),
                        "Request short-circuited"
                    );
                    return RequestOrResponse::Response(res);
                }
            }
        }

        RequestOrResponse::Request(req)
    }

    /// Runs the response phase. Every matching unit runs.
    pub async fn dispatch_response(
        &self,
        mut res: Response<Body>,
        ctx: &TransactionContext,
    ) -> Response<Body> {
        for unit in &self.units {
            if unit.response_condition(&res, ctx) {
                res = unit.on_response(res, ctx).await;
            }
        }
        res
    }
}

impl std::fmt::Debug for MiddlewareChain {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_list()
            .entries(self.units.iter().map(|unit| unit.name()))
            .finish()
    }
}
