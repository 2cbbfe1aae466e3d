//! gproxy - forward HTTP/HTTPS proxy.
//!
//! Runs a [`gproxy::ProxyServer`] configured from a TOML file, CLI flags and
//! `GPROXY_*` environment variables until Ctrl-C.

use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::Context;
use clap::Parser;
use gproxy::{ProxyOptions, ProxyServer, TrafficLogger};
use tracing_appender::rolling::{RollingFileAppender, Rotation};
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

/// gproxy - forward HTTP/HTTPS proxy with optional MITM
#[derive(Parser, Debug, Default)]
#[command(name = "gproxy", version, about)]
struct Args {
    /// TOML file with proxy options; flags override its values
    #[arg(long, env = "GPROXY_CONFIG")]
    config: Option<PathBuf>,

    /// Address to listen on (host:port)
    #[arg(long, env = "GPROXY_ADDR")]
    addr: Option<String>,

    /// CA certificate (PEM) used for interception
    #[arg(long, env = "GPROXY_CERT")]
    cert: Option<PathBuf>,

    /// CA private key (PEM) used for interception
    #[arg(long, env = "GPROXY_KEY")]
    key: Option<PathBuf>,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, env = "GPROXY_LOG_LEVEL")]
    log_level: Option<String>,

    /// Shorthand for --log-level debug
    #[arg(long)]
    debug: bool,

    /// Intercept HTTPS tunnels
    #[arg(long, env = "GPROXY_MITM")]
    mitm: bool,

    /// Directory with index.html and non_proxy.html
    #[arg(long, env = "GPROXY_ASSETS_DIR")]
    assets_dir: Option<PathBuf>,

    /// Path the CA certificate is downloadable from
    #[arg(long, env = "GPROXY_DOWNLOAD_PATH")]
    download_path: Option<String>,

    /// Request header read timeout, in seconds
    #[arg(long, env = "GPROXY_READ_TIMEOUT")]
    read_timeout: Option<u64>,

    /// Per-transaction middleware timeout, in seconds
    #[arg(long, env = "GPROXY_WRITE_TIMEOUT")]
    write_timeout: Option<u64>,

    /// Idle keep-alive timeout, in seconds
    #[arg(long, env = "GPROXY_IDLE_TIMEOUT")]
    idle_timeout: Option<u64>,

    /// Also write logs to daily-rotated files in this directory
    #[arg(long, env = "GPROXY_LOG_DIR")]
    log_dir: Option<PathBuf>,

    /// Log every proxied response
    #[arg(long)]
    log_traffic: bool,

    /// With --log-traffic, also log bodies of intercepted HTTPS responses
    #[arg(long, requires = "log_traffic")]
    capture_bodies: bool,
}

/// Reads the config file, if any, and lays the flags over it.
fn load_options(args: &Args) -> anyhow::Result<ProxyOptions> {
    let mut options = match &args.config {
        Some(path) => {
            let raw = std::fs::read_to_string(path)
                .with_context(|| format!("reading config {}", path.display()))?;
            toml::from_str::<ProxyOptions>(&raw)
                .with_context(|| format!("parsing config {}", path.display()))?
        }
        None => ProxyOptions::default(),
    };

    if let Some(addr) = &args.addr {
        options.addr = addr.clone();
    }
    if let Some(cert) = &args.cert {
        options.cert_path = Some(cert.clone());
    }
    if let Some(key) = &args.key {
        options.key_path = Some(key.clone());
    }
    if let Some(level) = &args.log_level {
        options.log_level = level.clone();
    }
    if args.debug {
        options.log_level = "DEBUG".to_string();
    }
    if args.mitm {
        options.mitm = true;
    }
    if let Some(dir) = &args.assets_dir {
        options.assets_dir = Some(dir.clone());
    }
    if let Some(path) = &args.download_path {
        options.download_path = path.clone();
    }
    if let Some(secs) = args.read_timeout {
        options.timeouts.read = Duration::from_secs(secs);
    }
    if let Some(secs) = args.write_timeout {
        options.timeouts.write = Duration::from_secs(secs);
    }
    if let Some(secs) = args.idle_timeout {
        options.timeouts.idle = Duration::from_secs(secs);
    }

    Ok(options.normalized())
}

/// Initialize logging, with file rotation when a directory is given.
fn init_logging(
    options: &ProxyOptions,
    log_dir: Option<&Path>,
) -> Option<tracing_appender::non_blocking::WorkerGuard> {
    let env_filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(options.log_directives()));

    if let Some(log_dir) = log_dir {
        if std::fs::create_dir_all(log_dir).is_ok() {
            let file_appender = RollingFileAppender::builder()
                .rotation(Rotation::DAILY)
                .max_log_files(7)
                .filename_prefix("gproxy")
                .filename_suffix("log")
                .build(log_dir)
                .ok();

            if let Some(appender) = file_appender {
                let (non_blocking, guard) = tracing_appender::non_blocking(appender);
                tracing_subscriber::registry()
                    .with(env_filter)
                    .with(fmt::layer().with_writer(std::io::stdout))
                    .with(fmt::layer().with_writer(non_blocking).with_ansi(false))
                    .init();

                tracing::info!("Logging to {:?}", log_dir);
                return Some(guard);
            }
        }

        tracing_subscriber::fmt().with_env_filter(env_filter).init();
        tracing::warn!("File logging unavailable, using console only");
        return None;
    }

    tracing_subscriber::fmt().with_env_filter(env_filter).init();
    None
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();
    let options = load_options(&args)?;

    let _log_guard = init_logging(&options, args.log_dir.as_deref());

    tracing::info!(
        addr = %options.addr,
        mitm = options.mitm,
        log_level = %options.log_level,
        "Starting gproxy"
    );

    let mut server = ProxyServer::new(options);
    if args.log_traffic {
        let logger = if args.capture_bodies {
            TrafficLogger::new().with_bodies()
        } else {
            TrafficLogger::new()
        };
        server.add_middleware(logger);
    }

    server.listen_and_serve().await?;

    tracing::info!("gproxy stopped");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn no_flags_gives_defaults() {
        let options = load_options(&Args::default()).unwrap();
        assert_eq!(options, ProxyOptions::default());
    }

    #[test]
    fn flags_are_parsed() {
        let args = Args::try_parse_from([
            "gproxy",
            "--addr",
            "127.0.0.1:9090",
            "--mitm",
            "--cert",
            "/etc/gproxy/ca.crt",
            "--key",
            "/etc/gproxy/ca.key",
            "--log-traffic",
            "--capture-bodies",
        ])
        .unwrap();

        let options = load_options(&args).unwrap();
        assert_eq!(options.addr, "127.0.0.1:9090");
        assert!(options.mitm);
        assert_eq!(options.cert_path, Some(PathBuf::from("/etc/gproxy/ca.crt")));
        assert_eq!(options.key_path, Some(PathBuf::from("/etc/gproxy/ca.key")));
        assert!(args.log_traffic);
        assert!(args.capture_bodies);
    }

    #[test]
    fn capture_bodies_requires_log_traffic() {
        assert!(Args::try_parse_from(["gproxy", "--capture-bodies"]).is_err());
    }

    #[test]
    fn flags_override_config_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("gproxy.toml");
        std::fs::write(
            &path,
            r#"
addr = "0.0.0.0:3128"
log_level = "warn"
mitm = true
download_path = "ca"

[timeouts]
read = 5
idle = 60
"#,
        )
        .unwrap();

        let args = Args {
            config: Some(path),
            addr: Some("127.0.0.1:8888".to_string()),
            write_timeout: Some(20),
            ..Default::default()
        };
        let options = load_options(&args).unwrap();

        assert_eq!(options.addr, "127.0.0.1:8888");
        assert_eq!(options.log_level, "WARN");
        assert!(options.mitm);
        assert_eq!(options.download_path, "/ca");
        assert_eq!(options.timeouts.read, Duration::from_secs(5));
        assert_eq!(options.timeouts.write, Duration::from_secs(20));
        assert_eq!(options.timeouts.idle, Duration::from_secs(60));
    }

    #[test]
    fn debug_flag_wins_over_level() {
        let args = Args {
            log_level: Some("error".to_string()),
            debug: true,
            ..Default::default()
        };
        let options = load_options(&args).unwrap();
        assert_eq!(options.log_level, "DEBUG");
        assert!(options.is_debug());
    }

    #[test]
    fn unreadable_config_is_an_error() {
        let args = Args {
            config: Some(PathBuf::from("/nonexistent/gproxy.toml")),
            ..Default::default()
        };
        assert!(load_options(&args).is_err());
    }

    #[test]
    fn malformed_config_is_an_error() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("gproxy.toml");
        std::fs::write(&path, "addr = [").unwrap();

        let args = Args {
            config: Some(path),
            ..Default::default()
        };
        assert!(load_options(&args).is_err());
    }
}
