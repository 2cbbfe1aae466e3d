//! Certificate Authority loading and the TLS interception policy derived from it.
//!
//! The authority is either read from operator supplied PEM files or taken from
//! the pair compiled into the binary. Either way it is checked against its
//! validity window before anything is allowed to use it.

use std::fmt;
use std::fs;
use std::future::Future;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use chrono::{DateTime, Utc};
use http::uri::Authority;
use hudsucker::certificate_authority::{CertificateAuthority as EngineAuthority, RcgenAuthority};
use hudsucker::rcgen::{Issuer, KeyPair, PublicKeyData};
use hudsucker::rustls::crypto::aws_lc_rs::default_provider;
use hudsucker::rustls::ServerConfig;
use x509_parser::pem::{parse_x509_pem, Pem};

use crate::error::CaError;

/// Embedded default CA certificate (PEM).
const DEFAULT_CERT_PEM: &str = include_str!("../assets/cert/ca.crt");
/// Embedded default CA private key (PKCS#8 PEM).
const DEFAULT_KEY_PEM: &str = include_str!("../assets/cert/ca.key");

/// Where the authority's key material came from.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CaSource {
    /// Operator supplied files.
    Files { cert_path: PathBuf, key_path: PathBuf },
    /// The pair compiled into the binary.
    Embedded,
}

impl CaSource {
    fn key_path(&self) -> PathBuf {
        match self {
            CaSource::Files { key_path, .. } => key_path.clone(),
            CaSource::Embedded => PathBuf::from("<embedded>"),
        }
    }
}

/// A validated root CA used to sign per-host certificates on the fly.
///
/// Immutable once constructed. There is no renewal path: new material means
/// a restart.
pub struct CertificateAuthority {
    /// Certificate exactly as read from its source.
    cert_bytes: Vec<u8>,
    cert_der: Vec<u8>,
    key_pem: String,
    not_before: DateTime<Utc>,
    not_after: DateTime<Utc>,
    source: CaSource,
}

impl CertificateAuthority {
    /// Loads a CA from a PEM private key and a PEM certificate on disk.
    pub fn load(key_path: impl AsRef<Path>, cert_path: impl AsRef<Path>) -> Result<Self, CaError> {
        let key_path = key_path.as_ref();
        let cert_path = cert_path.as_ref();

        let key_pem = fs::read_to_string(key_path).map_err(|e| CaError::KeyLoad {
            path: key_path.to_path_buf(),
            reason: e.to_string(),
        })?;
        let cert_bytes = fs::read(cert_path).map_err(|e| CaError::KeyLoad {
            path: cert_path.to_path_buf(),
            reason: e.to_string(),
        })?;

        Self::from_pem(
            cert_bytes,
            key_pem,
            CaSource::Files {
                cert_path: cert_path.to_path_buf(),
                key_path: key_path.to_path_buf(),
            },
        )
    }

    /// Returns the authority built from the embedded default pair.
    ///
    /// The embedded pair is held to the same validity check as operator
    /// material, hence the `Result`.
    pub fn load_default() -> Result<Self, CaError> {
        Self::from_pem(
            DEFAULT_CERT_PEM.as_bytes().to_vec(),
            DEFAULT_KEY_PEM.to_string(),
            CaSource::Embedded,
        )
    }

    fn from_pem(cert_bytes: Vec<u8>, key_pem: String, source: CaSource) -> Result<Self, CaError> {
        let key_pair = KeyPair::from_pem(&key_pem).map_err(|e| CaError::KeyLoad {
            path: source.key_path(),
            reason: e.to_string(),
        })?;

        // The certificate bytes are served verbatim on the download endpoint.
        if contains_private_key(&cert_bytes) {
            return Err(CaError::Parse(
                "certificate file also contains a private key".to_string(),
            ));
        }

        let (_, pem) = parse_x509_pem(&cert_bytes).map_err(|e| CaError::Parse(e.to_string()))?;
        let cert = pem
            .parse_x509()
            .map_err(|e| CaError::Parse(e.to_string()))?;

        if key_pair.subject_public_key_info().as_slice() != cert.tbs_certificate.subject_pki.raw {
            return Err(CaError::KeyLoad {
                path: source.key_path(),
                reason: "private key does not match the certificate's public key".to_string(),
            });
        }

        let not_before = asn1_to_utc(cert.validity().not_before.timestamp())?;
        let not_after = asn1_to_utc(cert.validity().not_after.timestamp())?;
        check_validity(not_before, not_after, Utc::now())?;

        let cert_der = pem.contents.clone();

        Ok(Self {
            cert_bytes,
            cert_der,
            key_pem,
            not_before,
            not_after,
            source,
        })
    }

    /// Returns the certificate bytes exactly as they were read. Never the key.
    pub fn export_certificate_bytes(&self) -> &[u8] {
        &self.cert_bytes
    }

    /// Returns the DER encoded certificate.
    pub fn certificate_der(&self) -> &[u8] {
        &self.cert_der
    }

    /// Start of the validity window.
    pub fn not_before(&self) -> DateTime<Utc> {
        self.not_before
    }

    /// End of the validity window.
    pub fn not_after(&self) -> DateTime<Utc> {
        self.not_after
    }

    /// Where the key material came from.
    pub fn source(&self) -> &CaSource {
        &self.source
    }

    /// Derives the interception policy handed to the tunnel engine.
    ///
    /// The returned policy intercepts every CONNECT until told otherwise with
    /// [`TlsPolicy::with_connect_action`].
    pub fn build_interception_policy(&self) -> Result<TlsPolicy, CaError> {
        let key_pair =
            KeyPair::from_pem(&self.key_pem).map_err(|e| CaError::Policy(e.to_string()))?;
        let cert_pem =
            std::str::from_utf8(&self.cert_bytes).map_err(|e| CaError::Policy(e.to_string()))?;

        let issuer = Issuer::from_ca_cert_pem(cert_pem, key_pair)
            .map_err(|e| CaError::Policy(e.to_string()))?;
        let authority = RcgenAuthority::new(issuer, 1_000, default_provider());

        Ok(TlsPolicy {
            authority: Arc::new(authority),
            on_connect: ConnectAction::Mitm,
        })
    }
}

impl fmt::Debug for CertificateAuthority {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CertificateAuthority")
            .field("source", &self.source)
            .field("not_before", &self.not_before)
            .field("not_after", &self.not_after)
            .field("key", &"<REDACTED>")
            .finish()
    }
}

fn contains_private_key(pem_bytes: &[u8]) -> bool {
    Pem::iter_from_buffer(pem_bytes)
        .map_while(|block| block.ok())
        .any(|block| block.label.ends_with("PRIVATE KEY"))
}

fn asn1_to_utc(timestamp: i64) -> Result<DateTime<Utc>, CaError> {
    DateTime::from_timestamp(timestamp, 0)
        .ok_or_else(|| CaError::Parse(format!("validity timestamp out of range: {}", timestamp)))
}

/// Checks `not_before <= now <= not_after`.
pub fn check_validity(
    not_before: DateTime<Utc>,
    not_after: DateTime<Utc>,
    now: DateTime<Utc>,
) -> Result<(), CaError> {
    if now < not_before || now > not_after {
        return Err(CaError::ExpiredOrNotYetValid {
            now,
            not_before,
            not_after,
        });
    }
    Ok(())
}

/// What the engine does with a CONNECT request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ConnectAction {
    /// Open the tunnel and relay bytes untouched.
    Accept,
    /// Terminate TLS with a forged leaf certificate and inspect the plaintext.
    #[default]
    Mitm,
    /// Treat the tunnel as plain HTTP and inspect it.
    HttpMitm,
    /// Refuse the tunnel.
    Reject,
}

impl ConnectAction {
    /// Whether the tunnel's contents are handed to the middleware pipeline.
    ///
    /// The engine sniffs TLS vs. plain HTTP itself, so `Mitm` and `HttpMitm`
    /// behave the same from here.
    pub fn intercepts(self) -> bool {
        matches!(self, ConnectAction::Mitm | ConnectAction::HttpMitm)
    }
}

/// TLS interception policy for one proxy instance.
///
/// Owns the signing authority and the action applied to every CONNECT. Each
/// server gets its own value, so two proxies in one process never share a
/// trust root.
#[derive(Clone)]
pub struct TlsPolicy {
    authority: Arc<RcgenAuthority>,
    on_connect: ConnectAction,
}

impl TlsPolicy {
    /// Sets the action applied to every CONNECT.
    pub fn with_connect_action(mut self, action: ConnectAction) -> Self {
        self.on_connect = action;
        self
    }

    /// The action applied to every CONNECT.
    pub fn connect_action(&self) -> ConnectAction {
        self.on_connect
    }

    /// The signing authority in the form the engine consumes.
    pub fn authority(&self) -> PolicyAuthority {
        PolicyAuthority(Arc::clone(&self.authority))
    }
}

impl fmt::Debug for TlsPolicy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TlsPolicy")
            .field("authority", &"RcgenAuthority")
            .field("on_connect", &self.on_connect)
            .finish()
    }
}

/// Shared handle to a policy's signing authority.
#[derive(Clone)]
pub struct PolicyAuthority(Arc<RcgenAuthority>);

impl EngineAuthority for PolicyAuthority {
    fn gen_server_config(
        &self,
        authority: &Authority,
    ) -> impl Future<Output = Arc<ServerConfig>> + Send {
        self.0.gen_server_config(authority)
    }
}
