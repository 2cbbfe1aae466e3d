//! Proxy configuration.

use std::path::PathBuf;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::router::{bundled_assets_dir, StaticAssets, DEFAULT_DOWNLOAD_PATH};

/// Default listen address.
pub const DEFAULT_ADDR: &str = "0.0.0.0:8080";

/// Default log level.
pub const DEFAULT_LOG_LEVEL: &str = "INFO";

/// Connection timeouts applied by the listener.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerTimeouts {
    /// Limit on reading a request head.
    #[serde(with = "secs")]
    pub read: Duration,
    /// Limit on producing the answer to one transaction's hook phase.
    #[serde(with = "secs")]
    pub write: Duration,
    /// Limit on an idle keep-alive connection.
    #[serde(with = "secs")]
    pub idle: Duration,
}

impl Default for ServerTimeouts {
    fn default() -> Self {
        Self {
            read: Duration::from_secs(10),
            write: Duration::from_secs(10),
            idle: Duration::from_secs(30),
        }
    }
}

/// Options for a [`crate::ProxyServer`].
///
/// Fully determined before the server is built; never changed afterwards.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ProxyOptions {
    /// `host:port` to listen on.
    pub addr: String,
    /// PEM certificate of the interception CA.
    pub cert_path: Option<PathBuf>,
    /// PEM private key of the interception CA.
    pub key_path: Option<PathBuf>,
    /// Log level name; stored uppercased.
    pub log_level: String,
    /// Intercept HTTPS CONNECT tunnels.
    pub mitm: bool,
    /// Directory holding `index.html` and `non_proxy.html`.
    pub assets_dir: Option<PathBuf>,
    /// Path the CA certificate can be downloaded from.
    pub download_path: String,
    /// Listener timeouts.
    pub timeouts: ServerTimeouts,
}

impl Default for ProxyOptions {
    fn default() -> Self {
        Self {
            addr: DEFAULT_ADDR.to_string(),
            cert_path: None,
            key_path: None,
            log_level: DEFAULT_LOG_LEVEL.to_string(),
            mitm: false,
            assets_dir: None,
            download_path: DEFAULT_DOWNLOAD_PATH.to_string(),
            timeouts: ServerTimeouts::default(),
        }
    }
}

impl ProxyOptions {
    /// Fills in blanks with defaults and uppercases the log level.
    pub fn normalized(mut self) -> Self {
        if self.addr.trim().is_empty() {
            self.addr = DEFAULT_ADDR.to_string();
        }
        if self.log_level.trim().is_empty() {
            self.log_level = DEFAULT_LOG_LEVEL.to_string();
        }
        self.log_level = self.log_level.trim().to_uppercase();
        if self.download_path.is_empty() {
            self.download_path = DEFAULT_DOWNLOAD_PATH.to_string();
        } else if !self.download_path.starts_with('/') {
            self.download_path = format!("/{}", self.download_path);
        }
        self
    }

    /// Both CA paths, if the operator supplied both.
    pub fn ca_paths(&self) -> Option<(&PathBuf, &PathBuf)> {
        match (&self.key_path, &self.cert_path) {
            (Some(key), Some(cert)) => Some((key, cert)),
            _ => None,
        }
    }

    /// Whether engine-level tracing should be switched on.
    pub fn is_debug(&self) -> bool {
        matches!(self.log_level.as_str(), "DEBUG" | "TRACE")
    }

    /// `tracing` filter directives matching the configured level.
    pub fn log_directives(&self) -> String {
        let level = match self.log_level.as_str() {
            "TRACE" => "trace",
            "DEBUG" => "debug",
            "WARN" | "WARNING" => "warn",
            "ERROR" | "FATAL" | "PANIC" => "error",
            _ => "info",
        };
        let engine = if self.is_debug() { level } else { "warn" };
        format!("gproxy={level},gproxy_app={level},hudsucker={engine},warn")
    }

    /// Static pages to serve on direct access.
    pub fn assets(&self) -> StaticAssets {
        StaticAssets::from_dir(
            self.assets_dir
                .clone()
                .unwrap_or_else(bundled_assets_dir),
        )
    }
}

mod secs {
    use std::time::Duration;

    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(value: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_u64(value.as_secs())
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
        u64::deserialize(deserializer).map(Duration::from_secs)
    }
}
