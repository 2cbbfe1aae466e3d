//! Built-in middleware.

use async_trait::async_trait;
use http_body_util::{BodyExt, Full};
use hudsucker::{hyper::Response, Body};
use tracing::{debug, info, warn};

use crate::context::TransactionContext;
use crate::middleware::Middleware;

/// Logs every upstream response, optionally with its body.
///
/// Register it last to see responses as the client will, first to see them
/// as upstream sent them.
#[derive(Debug, Clone, Copy, Default)]
pub struct TrafficLogger {
    capture_bodies: bool,
}

impl TrafficLogger {
    /// Logs request line and status only.
    pub fn new() -> Self {
        Self::default()
    }

    /// Also buffers and logs bodies of responses from intercepted TLS tunnels.
    pub fn with_bodies(mut self) -> Self {
        self.capture_bodies = true;
        self
    }
}

#[async_trait]
impl Middleware for TrafficLogger {
    fn name(&self) -> &str {
        "traffic-logger"
    }

    fn response_condition(&self, _res: &Response<Body>, _ctx: &TransactionContext) -> bool {
        true
    }

    async fn on_response(&self, res: Response<Body>, ctx: &TransactionContext) -> Response<Body> {
        info!(
            session = ctx.session(),
            client = %ctx.client_addr(),
            method = %ctx.method(),
            url = %ctx.uri(),
            status = res.status().as_u16(),
            "Intercepted response"
        );

        if !self.capture_bodies || !ctx.is_tls() {
            return res;
        }

        let (parts, body) = res.into_parts();
        let bytes = match body.collect().await {
            Ok(collected) => collected.to_bytes(),
            Err(e) => {
                warn!(session = ctx.session(), err = %e, "Failed to read response body");
                return Response::from_parts(parts, Body::empty());
            }
        };

        info!(session = ctx.session(), bytes = bytes.len(), "Captured response body");
        debug!(session = ctx.session(), body = %String::from_utf8_lossy(&bytes));

        Response::from_parts(parts, Body::from(Full::new(bytes)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::SocketAddr;
    use std::sync::Arc;

    use hudsucker::hyper::{body::Bytes, Method, StatusCode};

    use crate::context::ServerInfo;

    fn ctx(uri: &str) -> TransactionContext {
        TransactionContext::new(
            3,
            SocketAddr::from(([127, 0, 0, 1], 40001)),
            Method::GET,
            uri.parse().unwrap(),
            Arc::new(ServerInfo::new(SocketAddr::from(([127, 0, 0, 1], 8080)))),
        )
    }

    fn response(body: &'static str) -> Response<Body> {
        Response::builder()
            .status(StatusCode::OK)
            .header("x-upstream", "yes")
            .body(Body::from(Full::new(Bytes::from_static(body.as_bytes()))))
            .unwrap()
    }

    #[test]
    fn applies_to_every_response() {
        let logger = TrafficLogger::new();
        assert!(logger.response_condition(&response(""), &ctx("http://example.com/")));
        assert!(!logger.request_condition(
            &hudsucker::hyper::Request::new(Body::empty()),
            &ctx("http://example.com/")
        ));
    }

    #[tokio::test]
    async fn captured_body_is_restored() {
        let logger = TrafficLogger::new().with_bodies();
        let res = logger
            .on_response(response("hello world"), &ctx("https://example.com/"))
            .await;

        assert_eq!(res.status(), StatusCode::OK);
        assert_eq!(res.headers().get("x-upstream").unwrap(), "yes");
        let body = res.into_body().collect().await.unwrap().to_bytes();
        assert_eq!(body, "hello world");
    }

    #[tokio::test]
    async fn plain_http_body_left_alone() {
        let logger = TrafficLogger::new().with_bodies();
        let res = logger
            .on_response(response("untouched"), &ctx("http://example.com/"))
            .await;

        let body = res.into_body().collect().await.unwrap().to_bytes();
        assert_eq!(body, "untouched");
    }

    #[test]
    fn name_is_stable() {
        assert_eq!(TrafficLogger::new().name(), "traffic-logger");
    }
}
