//! Handling of requests sent directly to the proxy rather than through it.
//!
//! A client that talks to the proxy's address as if it were an origin server
//! is almost always misconfigured, so every such hit is logged with its URL,
//! peer address and headers before it is answered. A small fixed set of
//! administrative endpoints is served; everything else gets an error page.

use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use http::header::{HeaderValue, CONTENT_DISPOSITION, CONTENT_TYPE};
use http_body_util::Full;
use hudsucker::{
    hyper::{body::Bytes, Method, Request, Response, StatusCode},
    Body,
};
use tracing::{error, info};

use crate::ca::CertificateAuthority;

/// Default path the CA certificate is downloadable from.
pub const DEFAULT_DOWNLOAD_PATH: &str = "/ssl";

/// File name offered to browsers downloading the CA.
const CERT_FILENAME_DISPOSITION: &str = "attachment;filename=gproxyCA.crt";

/// Plain-text body used when the error page cannot be read.
const NON_PROXY_FALLBACK: &str = "This server only responds to proxy requests.\n";

const INDEX_FILENAME: &str = "index.html";
const NON_PROXY_FILENAME: &str = "non_proxy.html";

/// Direct-access endpoints. Adding a route means adding a variant.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Endpoint {
    /// Landing page.
    Index,
    /// CA certificate download.
    CertificateDownload,
    /// Liveness probe.
    Health,
    /// Anything else.
    NotFound,
}

impl Endpoint {
    /// Classifies a direct request by method and path.
    pub fn classify(method: &Method, path: &str, download_path: &str) -> Self {
        if *method != Method::GET {
            return Endpoint::NotFound;
        }

        match path {
            "/" | "/index.html" => Endpoint::Index,
            "/health" => Endpoint::Health,
            p if p == download_path => Endpoint::CertificateDownload,
            _ => Endpoint::NotFound,
        }
    }
}

/// Locations of the static HTML pages.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StaticAssets {
    index: PathBuf,
    non_proxy: PathBuf,
}

impl StaticAssets {
    /// Pages found under `dir`.
    pub fn from_dir(dir: impl AsRef<Path>) -> Self {
        let dir = dir.as_ref();
        Self {
            index: dir.join(INDEX_FILENAME),
            non_proxy: dir.join(NON_PROXY_FILENAME),
        }
    }

    /// The pages shipped with this crate.
    pub fn bundled() -> Self {
        Self::from_dir(bundled_assets_dir())
    }

    /// Path of the landing page.
    pub fn index_path(&self) -> &Path {
        &self.index
    }

    /// Path of the "proxy requests only" page.
    pub fn non_proxy_path(&self) -> &Path {
        &self.non_proxy
    }
}

impl Default for StaticAssets {
    fn default() -> Self {
        Self::bundled()
    }
}

/// Directory of the HTML pages shipped with this crate.
pub fn bundled_assets_dir() -> PathBuf {
    Path::new(env!("CARGO_MANIFEST_DIR")).join("assets").join("html")
}

/// Serves direct (non-proxy) requests.
#[derive(Debug, Clone)]
pub struct TrafficRouter {
    assets: StaticAssets,
    authority: Option<Arc<CertificateAuthority>>,
    download_path: String,
}

impl TrafficRouter {
    /// Creates a router serving `assets` and, if present, `authority`'s certificate.
    pub fn new(assets: StaticAssets, authority: Option<Arc<CertificateAuthority>>) -> Self {
        Self {
            assets,
            authority,
            download_path: DEFAULT_DOWNLOAD_PATH.to_string(),
        }
    }

    /// Serves the certificate from `path` instead of `/ssl`.
    pub fn with_download_path(mut self, path: impl Into<String>) -> Self {
        self.download_path = path.into();
        self
    }

    /// Logs and answers one direct request.
    pub async fn route(&self, req: &Request<Body>, remote_addr: SocketAddr) -> Response<Body> {
        info!(
            url = %req.uri(),
            remote_addr = %remote_addr,
            headers = ?req.headers(),
            "Received non-proxy request"
        );

        match Endpoint::classify(req.method(), req.uri().path(), &self.download_path) {
            Endpoint::Index => self.index().await,
            Endpoint::CertificateDownload => self.certificate(),
            Endpoint::Health => text_response(StatusCode::OK, "OK"),
            Endpoint::NotFound => self.non_proxy().await,
        }
    }

    async fn index(&self) -> Response<Body> {
        match tokio::fs::read(self.assets.index_path()).await {
            Ok(body) => html_response(StatusCode::OK, body),
            Err(e) => {
                error!(err = %e, path = ?self.assets.index_path(), "Failed to read index html");
                empty_response(StatusCode::NOT_FOUND)
            }
        }
    }

    fn certificate(&self) -> Response<Body> {
        let Some(authority) = &self.authority else {
            error!("Certificate download requested but no CA is loaded");
            return text_response(StatusCode::INTERNAL_SERVER_ERROR, "Certificate Not Found!\n");
        };

        let mut res = bytes_response(
            StatusCode::OK,
            Bytes::copy_from_slice(authority.export_certificate_bytes()),
        );
        let headers = res.headers_mut();
        headers.insert(
            CONTENT_TYPE,
            HeaderValue::from_static("application/octet-stream"),
        );
        headers.insert(
            CONTENT_DISPOSITION,
            HeaderValue::from_static(CERT_FILENAME_DISPOSITION),
        );
        res
    }

    async fn non_proxy(&self) -> Response<Body> {
        match tokio::fs::read(self.assets.non_proxy_path()).await {
            Ok(body) => html_response(StatusCode::INTERNAL_SERVER_ERROR, body),
            Err(e) => {
                error!(err = %e, path = ?self.assets.non_proxy_path(), "Failed to read non-proxy html");
                text_response(StatusCode::INTERNAL_SERVER_ERROR, NON_PROXY_FALLBACK)
            }
        }
    }
}

fn bytes_response(status: StatusCode, body: Bytes) -> Response<Body> {
    let mut res = Response::new(Body::from(Full::new(body)));
    *res.status_mut() = status;
    res
}

fn empty_response(status: StatusCode) -> Response<Body> {
    let mut res = Response::new(Body::empty());
    *res.status_mut() = status;
    res
}

fn html_response(status: StatusCode, body: Vec<u8>) -> Response<Body> {
    let mut res = bytes_response(status, Bytes::from(body));
    res.headers_mut()
        .insert(CONTENT_TYPE, HeaderValue::from_static("text/html"));
    res
}

/// Builds a plain-text response.
pub(crate) fn text_response(status: StatusCode, body: &'static str) -> Response<Body> {
    let mut res = bytes_response(status, Bytes::from_static(body.as_bytes()));
    res.headers_mut().insert(
        CONTENT_TYPE,
        HeaderValue::from_static("text/plain; charset=utf-8"),
    );
    res
}

#[cfg(test)]
mod tests {
    use super::*;
    use http_body_util::BodyExt;
    use tempfile::TempDir;

    use crate::test_support::{write_ca, CaWindow};

    fn remote() -> SocketAddr {
        SocketAddr::from(([192, 168, 1, 20], 51000))
    }

    fn get(path: &str) -> Request<Body> {
        Request::builder().uri(path).body(Body::empty()).unwrap()
    }

    async fn body_bytes(res: Response<Body>) -> Bytes {
        res.into_body().collect().await.unwrap().to_bytes()
    }

    fn router_with_default_ca() -> TrafficRouter {
        let ca = CertificateAuthority::load_default().unwrap();
        TrafficRouter::new(StaticAssets::bundled(), Some(Arc::new(ca)))
    }

    #[test]
    fn classify_fixed_routes() {
        let ssl = DEFAULT_DOWNLOAD_PATH;
        assert_eq!(Endpoint::classify(&Method::GET, "/", ssl), Endpoint::Index);
        assert_eq!(
            Endpoint::classify(&Method::GET, "/index.html", ssl),
            Endpoint::Index
        );
        assert_eq!(
            Endpoint::classify(&Method::GET, "/ssl", ssl),
            Endpoint::CertificateDownload
        );
        assert_eq!(
            Endpoint::classify(&Method::GET, "/health", ssl),
            Endpoint::Health
        );
        assert_eq!(
            Endpoint::classify(&Method::GET, "/admin", ssl),
            Endpoint::NotFound
        );
    }

    #[test]
    fn classify_non_get_is_not_found() {
        for method in [Method::POST, Method::PUT, Method::DELETE, Method::HEAD] {
            assert_eq!(
                Endpoint::classify(&method, "/health", DEFAULT_DOWNLOAD_PATH),
                Endpoint::NotFound
            );
        }
    }

    #[test]
    fn classify_custom_download_path() {
        assert_eq!(
            Endpoint::classify(&Method::GET, "/ca.crt", "/ca.crt"),
            Endpoint::CertificateDownload
        );
        assert_eq!(
            Endpoint::classify(&Method::GET, "/ssl", "/ca.crt"),
            Endpoint::NotFound
        );
    }

    #[tokio::test]
    async fn health_ignores_query_and_headers() {
        let router = router_with_default_ca();
        let req = Request::builder()
            .uri("/health?probe=1")
            .header("x-anything", "value")
            .body(Body::empty())
            .unwrap();

        let res = router.route(&req, remote()).await;
        assert_eq!(res.status(), StatusCode::OK);
        assert_eq!(body_bytes(res).await, "OK");
    }

    #[tokio::test]
    async fn index_serves_landing_page() {
        let router = router_with_default_ca();
        for path in ["/", "/index.html"] {
            let res = router.route(&get(path), remote()).await;
            assert_eq!(res.status(), StatusCode::OK);
            assert_eq!(res.headers().get(CONTENT_TYPE).unwrap(), "text/html");
            let body = body_bytes(res).await;
            assert_eq!(
                body,
                std::fs::read(StaticAssets::bundled().index_path()).unwrap()
            );
        }
    }

    #[tokio::test]
    async fn missing_index_is_404() {
        let temp_dir = TempDir::new().unwrap();
        let router = TrafficRouter::new(StaticAssets::from_dir(temp_dir.path()), None);

        let res = router.route(&get("/"), remote()).await;
        assert_eq!(res.status(), StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn certificate_download_is_byte_identical_and_repeatable() {
        let temp_dir = TempDir::new().unwrap();
        let (key_path, cert_path) = write_ca(temp_dir.path(), CaWindow::Current);
        let ca = CertificateAuthority::load(&key_path, &cert_path).unwrap();
        let router = TrafficRouter::new(StaticAssets::bundled(), Some(Arc::new(ca)));
        let on_disk = std::fs::read(&cert_path).unwrap();

        for _ in 0..2 {
            let res = router.route(&get("/ssl"), remote()).await;
            assert_eq!(res.status(), StatusCode::OK);
            assert_eq!(
                res.headers().get(CONTENT_TYPE).unwrap(),
                "application/octet-stream"
            );
            assert_eq!(
                res.headers().get(CONTENT_DISPOSITION).unwrap(),
                "attachment;filename=gproxyCA.crt"
            );
            assert_eq!(body_bytes(res).await, on_disk);
        }
    }

    #[tokio::test]
    async fn certificate_download_without_ca_is_500() {
        let router = TrafficRouter::new(StaticAssets::bundled(), None);
        let res = router.route(&get("/ssl"), remote()).await;
        assert_eq!(res.status(), StatusCode::INTERNAL_SERVER_ERROR);
        assert_eq!(body_bytes(res).await, "Certificate Not Found!\n");
    }

    #[tokio::test]
    async fn custom_download_path() {
        let router = router_with_default_ca().with_download_path("/ca.crt");

        let res = router.route(&get("/ca.crt"), remote()).await;
        assert_eq!(res.status(), StatusCode::OK);

        let res = router.route(&get("/ssl"), remote()).await;
        assert_eq!(res.status(), StatusCode::INTERNAL_SERVER_ERROR);
    }

    #[tokio::test]
    async fn unknown_routes_get_error_page() {
        let router = router_with_default_ca();
        let page = std::fs::read(StaticAssets::bundled().non_proxy_path()).unwrap();

        let post = Request::builder()
            .method(Method::POST)
            .uri("/health")
            .body(Body::empty())
            .unwrap();
        for req in [get("/nope"), get("/ssl/extra"), post] {
            let res = router.route(&req, remote()).await;
            assert_eq!(res.status(), StatusCode::INTERNAL_SERVER_ERROR);
            assert_eq!(res.headers().get(CONTENT_TYPE).unwrap(), "text/html");
            assert_eq!(body_bytes(res).await, page);
        }
    }

    #[tokio::test]
    async fn unknown_routes_fall_back_to_text() {
        let temp_dir = TempDir::new().unwrap();
        let router = TrafficRouter::new(StaticAssets::from_dir(temp_dir.path()), None);

        let res = router.route(&get("/nope"), remote()).await;
        assert_eq!(res.status(), StatusCode::INTERNAL_SERVER_ERROR);
        assert_eq!(
            res.headers().get(CONTENT_TYPE).unwrap(),
            "text/plain; charset=utf-8"
        );
        assert_eq!(body_bytes(res).await, NON_PROXY_FALLBACK);
    }

    #[test]
    fn assets_from_dir() {
        let assets = StaticAssets::from_dir("/srv/gproxy");
        assert_eq!(assets.index_path(), Path::new("/srv/gproxy/index.html"));
        assert_eq!(
            assets.non_proxy_path(),
            Path::new("/srv/gproxy/non_proxy.html")
        );
    }
}
