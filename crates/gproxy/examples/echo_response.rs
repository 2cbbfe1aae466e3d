//! Prints the body of every intercepted HTTPS response.
//!
//! ```text
//! cargo run -p gproxy --example echo_response
//! curl -k -x http://127.0.0.1:8080 https://example.com/
//! ```

use async_trait::async_trait;
use gproxy::{Body, Middleware, ProxyOptions, ProxyServer, TransactionContext};
use http_body_util::{BodyExt, Full};
use hyper::Response;

struct EchoResponse;

#[async_trait]
impl Middleware for EchoResponse {
    fn response_condition(&self, _res: &Response<Body>, _ctx: &TransactionContext) -> bool {
        true
    }

    async fn on_response(&self, res: Response<Body>, ctx: &TransactionContext) -> Response<Body> {
        println!("Intercepted a request: {}", ctx.uri());
        if !ctx.is_tls() {
            return res;
        }

        let (parts, body) = res.into_parts();
        let bytes = match body.collect().await {
            Ok(collected) => collected.to_bytes(),
            Err(e) => {
                eprintln!("failed to read body: {e}");
                return Response::from_parts(parts, Body::empty());
            }
        };
        println!("{}", String::from_utf8_lossy(&bytes));

        Response::from_parts(parts, Body::from(Full::new(bytes)))
    }
}

#[tokio::main]
async fn main() {
    tracing_subscriber::fmt().with_env_filter("gproxy=info").init();

    let mut server = ProxyServer::new(ProxyOptions {
        addr: "127.0.0.1:8080".to_string(),
        mitm: true,
        ..Default::default()
    });
    server.add_middleware(EchoResponse);

    if let Err(e) = server.listen_and_serve().await {
        eprintln!("proxy failed: {e}");
        std::process::exit(1);
    }
}
