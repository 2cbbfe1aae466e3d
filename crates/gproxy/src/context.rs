//! Per-transaction context handed to middleware.

use std::net::SocketAddr;
use std::sync::Arc;

use http::uri::Scheme;
use hudsucker::hyper::{Method, Uri};

use crate::ca::{CertificateAuthority, ConnectAction};

/// Read-only facts about the server that owns a transaction.
#[derive(Debug, Clone)]
pub struct ServerInfo {
    addr: SocketAddr,
    connect_action: ConnectAction,
    authority: Option<Arc<CertificateAuthority>>,
}

impl ServerInfo {
    /// Describes a server at `addr` that passes CONNECT tunnels through.
    pub fn new(addr: SocketAddr) -> Self {
        Self {
            addr,
            connect_action: ConnectAction::Accept,
            authority: None,
        }
    }

    /// Records the CA in use and the action applied to CONNECT requests.
    pub fn with_interception(
        mut self,
        authority: Arc<CertificateAuthority>,
        connect_action: ConnectAction,
    ) -> Self {
        self.authority = Some(authority);
        self.connect_action = connect_action;
        self
    }

    /// Address the server is bound to.
    pub fn addr(&self) -> SocketAddr {
        self.addr
    }

    /// Whether HTTPS tunnels are intercepted.
    pub fn mitm_enabled(&self) -> bool {
        self.authority.is_some() && self.connect_action.intercepts()
    }

    /// The action applied to CONNECT requests.
    pub fn connect_action(&self) -> ConnectAction {
        self.connect_action
    }

    /// The CA used for interception, if MITM is enabled.
    pub fn authority(&self) -> Option<&CertificateAuthority> {
        self.authority.as_deref()
    }
}

/// Scratch record for one proxied request/response exchange.
///
/// Created when the request hook fires and dropped once the response hook
/// has run. Middleware must not hold on to it past that point.
#[derive(Debug, Clone)]
pub struct TransactionContext {
    session: u64,
    client_addr: SocketAddr,
    method: Method,
    uri: Uri,
    server: Arc<ServerInfo>,
}

impl TransactionContext {
    /// Creates a context for a request arriving from `client_addr`.
    pub fn new(
        session: u64,
        client_addr: SocketAddr,
        method: Method,
        uri: Uri,
        server: Arc<ServerInfo>,
    ) -> Self {
        Self {
            session,
            client_addr,
            method,
            uri,
            server,
        }
    }

    /// Server-wide transaction counter value for this exchange.
    pub fn session(&self) -> u64 {
        self.session
    }

    /// Address of the client that sent the request.
    pub fn client_addr(&self) -> SocketAddr {
        self.client_addr
    }

    /// Method of the original request.
    pub fn method(&self) -> &Method {
        &self.method
    }

    /// URI of the original request, as seen before any middleware ran.
    pub fn uri(&self) -> &Uri {
        &self.uri
    }

    /// Whether the request arrived through an intercepted TLS tunnel.
    pub fn is_tls(&self) -> bool {
        self.uri.scheme() == Some(&Scheme::HTTPS)
    }

    /// The owning server.
    pub fn server(&self) -> &ServerInfo {
        &self.server
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn addr() -> SocketAddr {
        SocketAddr::from(([127, 0, 0, 1], 8080))
    }

    #[test]
    fn server_info_defaults_to_passthrough() {
        let info = ServerInfo::new(addr());
        assert!(!info.mitm_enabled());
        assert_eq!(info.connect_action(), ConnectAction::Accept);
        assert!(info.authority().is_none());
    }

    #[test]
    fn server_info_with_interception() {
        let ca = Arc::new(CertificateAuthority::load_default().unwrap());
        let info = ServerInfo::new(addr()).with_interception(ca, ConnectAction::Mitm);
        assert!(info.mitm_enabled());
        assert!(info.authority().is_some());
    }

    #[test]
    fn context_reports_tls() {
        let server = Arc::new(ServerInfo::new(addr()));
        let client = SocketAddr::from(([10, 0, 0, 2], 50000));

        let https = TransactionContext::new(
            1,
            client,
            Method::GET,
            "https://example.com/".parse().unwrap(),
            server.clone(),
        );
        assert!(https.is_tls());
        assert_eq!(https.session(), 1);
        assert_eq!(https.client_addr(), client);

        let http = TransactionContext::new(
            2,
            client,
            Method::POST,
            "http://example.com/submit".parse().unwrap(),
            server,
        );
        assert!(!http.is_tls());
        assert_eq!(http.method(), &Method::POST);
        assert_eq!(http.server().addr(), addr());
    }
}
