//! Error types for the proxy.

use std::path::PathBuf;

use chrono::{DateTime, Utc};
use thiserror::Error;

/// Proxy error type.
#[derive(Debug, Error)]
pub enum ProxyError {
    /// CA material was requested for MITM but could not be used.
    #[error("configuration error: {0}")]
    Configuration(#[from] CaError),

    /// Failed to bind the listener.
    #[error("failed to listen on {addr}: {reason}")]
    Listen {
        /// Address that was requested.
        addr: String,
        /// Underlying failure.
        reason: String,
    },

    /// The tunnel engine failed to build or stopped with an error.
    #[error("proxy engine error: {0}")]
    Engine(String),

    /// IO error.
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Certificate authority error type.
#[derive(Debug, Error)]
pub enum CaError {
    /// Key or certificate file missing, unreadable, or the key is not a usable private key.
    #[error("failed to load CA key pair from {path:?}: {reason}")]
    KeyLoad {
        /// File that failed.
        path: PathBuf,
        /// Underlying failure.
        reason: String,
    },

    /// Certificate could not be decoded.
    #[error("failed to parse CA certificate: {0}")]
    Parse(String),

    /// Certificate is outside its validity window.
    #[error(
        "certificate is not valid. Current time: {now}, valid from: {not_before} to {not_after}"
    )]
    ExpiredOrNotYetValid {
        /// Clock reading the check was made against.
        now: DateTime<Utc>,
        /// Certificate `notBefore`.
        not_before: DateTime<Utc>,
        /// Certificate `notAfter`.
        not_after: DateTime<Utc>,
    },

    /// Failed to turn the key material into an interception authority.
    #[error("failed to build TLS policy: {0}")]
    Policy(String),
}

/// Result type for proxy operations.
pub type Result<T> = std::result::Result<T, ProxyError>;
