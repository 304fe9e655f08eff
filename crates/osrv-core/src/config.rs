//! Server configuration and environment resolution.
//!
//! Configuration is resolved once at server construction, from (in precedence
//! order): explicit options, the captured environment snapshot, built-in
//! defaults.

use std::collections::HashMap;
use std::time::Duration;

use crate::logging::LogConfig;
use crate::runtime::Protocol;

/// Default listen port.
pub const DEFAULT_PORT: u16 = 3000;
/// Default bind hostname.
pub const DEFAULT_HOSTNAME: &str = "0.0.0.0";
/// Default maximum request body size: 10 MiB.
pub const DEFAULT_MAX_REQUEST_BODY_BYTES: u64 = 10 * 1024 * 1024;
/// Default idle/request timeout: 30 seconds.
pub const DEFAULT_REQUEST_TIMEOUT: Duration = Duration::from_secs(30);
/// Default header-read timeout: 15 seconds.
pub const DEFAULT_HEADERS_TIMEOUT: Duration = Duration::from_secs(15);
/// Default graceful-close drain timeout: 10 seconds.
pub const DEFAULT_GRACEFUL_TIMEOUT: Duration = Duration::from_secs(10);
/// Default forced-close timeout: 30 seconds.
pub const DEFAULT_FORCE_TIMEOUT: Duration = Duration::from_secs(30);
/// Default WebSocket frame size limit: 1 MiB.
pub const DEFAULT_WS_MAX_FRAME_BYTES: u64 = 1024 * 1024;
/// Default WebSocket idle timeout: 60 seconds.
pub const DEFAULT_WS_IDLE_TIMEOUT: Duration = Duration::from_secs(60);
/// Default WebSocket pre-open buffer limit: 8 MiB.
pub const DEFAULT_WS_MAX_BUFFERED_BYTES: u64 = 8 * 1024 * 1024;

/// Parse a boolish environment value.
///
/// `1|true|yes|on` parse true, `0|false|no|off` parse false; any other value
/// is unspecified.
#[must_use]
pub fn parse_boolish(value: &str) -> Option<bool> {
    match value.trim().to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Some(true),
        "0" | "false" | "no" | "off" => Some(false),
        _ => None,
    }
}

/// TLS material, provided either as inline PEM text or a file path.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PemSource {
    /// Inline PEM text.
    Inline(String),
    /// Path to a PEM file.
    Path(String),
}

impl PemSource {
    /// Heuristic used for environment-provided values: PEM text contains a
    /// `-----BEGIN` marker, anything else is treated as a path.
    #[must_use]
    pub fn from_env_value(value: &str) -> Self {
        if value.contains("-----BEGIN") {
            Self::Inline(value.to_string())
        } else {
            Self::Path(value.to_string())
        }
    }
}

/// TLS configuration.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TlsConfig {
    /// Certificate chain.
    pub cert: PemSource,
    /// Private key.
    pub key: PemSource,
    /// Key passphrase. Recorded for completeness; encrypted keys are rejected
    /// at load time with an explanatory error.
    pub passphrase: Option<String>,
}

/// Request-facing resource limits.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServerSecurityLimits {
    /// Maximum request body size in bytes.
    pub max_request_body_bytes: u64,
    /// Idle-connection / request timeout.
    pub request_timeout: Duration,
    /// Header-read timeout.
    pub headers_timeout: Duration,
}

impl Default for ServerSecurityLimits {
    fn default() -> Self {
        Self {
            max_request_body_bytes: DEFAULT_MAX_REQUEST_BODY_BYTES,
            request_timeout: DEFAULT_REQUEST_TIMEOUT,
            headers_timeout: DEFAULT_HEADERS_TIMEOUT,
        }
    }
}

/// Graceful shutdown timing.
///
/// `graceful_timeout` here is the authoritative bound for the background-task
/// drain performed by `close(force = false)`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GracefulShutdownOptions {
    /// Bound on waiting for in-flight requests and background tasks.
    pub graceful_timeout: Duration,
    /// Bound on the subsequent forced close.
    pub force_timeout: Duration,
}

impl Default for GracefulShutdownOptions {
    fn default() -> Self {
        Self {
            graceful_timeout: DEFAULT_GRACEFUL_TIMEOUT,
            force_timeout: DEFAULT_FORCE_TIMEOUT,
        }
    }
}

/// WebSocket resource limits.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WebSocketLimits {
    /// Maximum frame payload in either direction; violations close 1009.
    pub max_frame_bytes: u64,
    /// Idle timeout; pings go out every `max(1s, idle/2)`.
    pub idle_timeout: Duration,
    /// Bound on frames buffered before the open handshake completes.
    pub max_buffered_bytes: u64,
}

impl WebSocketLimits {
    /// The ping cadence derived from the idle timeout.
    #[must_use]
    pub fn ping_interval(&self) -> Duration {
        std::cmp::max(Duration::from_millis(1000), self.idle_timeout / 2)
    }
}

impl Default for WebSocketLimits {
    fn default() -> Self {
        Self {
            max_frame_bytes: DEFAULT_WS_MAX_FRAME_BYTES,
            idle_timeout: DEFAULT_WS_IDLE_TIMEOUT,
            max_buffered_bytes: DEFAULT_WS_MAX_BUFFERED_BYTES,
        }
    }
}

/// Explicit server options, all optional; unset fields fall back to the
/// environment snapshot and then to defaults.
#[derive(Debug, Clone, Default)]
pub struct ServerOptions {
    /// Listen port.
    pub port: Option<u16>,
    /// Bind hostname.
    pub hostname: Option<String>,
    /// Wire protocol; derived from TLS configuration when unset.
    pub protocol: Option<Protocol>,
    /// TLS material.
    pub tls: Option<TlsConfig>,
    /// Enable `SO_REUSEPORT` where the OS supports it.
    pub reuse_port: bool,
    /// Trust `x-forwarded-for` for client IP resolution.
    pub trust_proxy: bool,
    /// Enable or disable HTTP/2 on TLS listeners.
    pub http2: Option<bool>,
    /// Production-mode override.
    pub production: Option<bool>,
    /// Request-facing limits.
    pub limits: Option<ServerSecurityLimits>,
    /// Shutdown timing.
    pub shutdown: Option<GracefulShutdownOptions>,
    /// WebSocket limits.
    pub websocket: Option<WebSocketLimits>,
    /// Logger configuration.
    pub log: Option<LogConfig>,
}

/// Fully resolved configuration, immutable after construction.
#[derive(Debug, Clone)]
pub struct ResolvedConfig {
    /// Listen port.
    pub port: u16,
    /// Bind hostname.
    pub hostname: String,
    /// Wire protocol.
    pub protocol: Protocol,
    /// TLS material, present iff protocol is https.
    pub tls: Option<TlsConfig>,
    /// `SO_REUSEPORT` requested.
    pub reuse_port: bool,
    /// Trust `x-forwarded-for`.
    pub trust_proxy: bool,
    /// HTTP/2 enabled on TLS listeners.
    pub http2: bool,
    /// Production mode.
    pub production: bool,
    /// Request-facing limits.
    pub limits: ServerSecurityLimits,
    /// Shutdown timing.
    pub shutdown: GracefulShutdownOptions,
    /// WebSocket limits.
    pub websocket: WebSocketLimits,
    /// Logger configuration.
    pub log: LogConfig,
    /// The environment snapshot the config was resolved from.
    pub env: HashMap<String, String>,
}

impl ResolvedConfig {
    /// Resolve configuration from explicit options and an environment
    /// snapshot.
    #[must_use]
    pub fn resolve(options: ServerOptions, env: HashMap<String, String>) -> Self {
        let get = |keys: &[&str]| -> Option<String> {
            keys.iter()
                .find_map(|k| env.get(*k).filter(|v| !v.is_empty()).cloned())
        };

        let port = options.port.or_else(|| {
            get(&["OSRV_PORT", "PORT"]).and_then(|v| v.trim().parse().ok())
        });
        let hostname = options
            .hostname
            .or_else(|| get(&["OSRV_HOSTNAME", "HOSTNAME"]));

        let tls = options.tls.or_else(|| {
            let cert = get(&["OSRV_TLS_CERT", "TLS_CERT"])?;
            let key = get(&["OSRV_TLS_KEY", "TLS_KEY"])?;
            Some(TlsConfig {
                cert: PemSource::from_env_value(&cert),
                key: PemSource::from_env_value(&key),
                passphrase: get(&["OSRV_TLS_PASSPHRASE", "TLS_PASSPHRASE"]),
            })
        });

        let env_tls_flag = get(&["OSRV_TLS"]).and_then(|v| parse_boolish(&v));
        let protocol = options
            .protocol
            .or_else(|| get(&["OSRV_PROTOCOL"]).and_then(|v| Protocol::parse(&v)))
            .unwrap_or_else(|| {
                let wants_tls = env_tls_flag.unwrap_or(false) || tls.is_some();
                if wants_tls {
                    Protocol::Https
                } else {
                    Protocol::Http
                }
            });

        let http2 = options
            .http2
            .or_else(|| get(&["OSRV_HTTP2"]).and_then(|v| parse_boolish(&v)))
            .unwrap_or(true);

        let production = options.production.unwrap_or_else(|| {
            get(&["OSRV_ENV", "ENV", "NODE_ENV"])
                .map(|v| {
                    let v = v.trim().to_ascii_lowercase();
                    v == "prod" || v == "production"
                })
                .unwrap_or(false)
        });

        Self {
            port: port.unwrap_or(DEFAULT_PORT),
            hostname: hostname.unwrap_or_else(|| DEFAULT_HOSTNAME.to_string()),
            tls: if protocol.is_tls() { tls } else { None },
            protocol,
            reuse_port: options.reuse_port,
            trust_proxy: options.trust_proxy,
            http2,
            production,
            limits: options.limits.unwrap_or_default(),
            shutdown: options.shutdown.unwrap_or_default(),
            websocket: options.websocket.unwrap_or_default(),
            log: options.log.unwrap_or_default(),
            env,
        }
    }

    /// Capture the process environment as a snapshot.
    #[must_use]
    pub fn capture_env() -> HashMap<String, String> {
        std::env::vars().collect()
    }

    /// The bind address string `hostname:port`.
    #[must_use]
    pub fn bind_addr(&self) -> String {
        if self.hostname.contains(':') && !self.hostname.starts_with('[') {
            format!("[{}]:{}", self.hostname, self.port)
        } else {
            format!("{}:{}", self.hostname, self.port)
        }
    }

    /// The hostname to advertise in assembled URLs: the configured hostname,
    /// unless bound to a wildcard address, in which case `localhost`.
    #[must_use]
    pub fn public_hostname(&self) -> &str {
        match self.hostname.as_str() {
            "0.0.0.0" | "::" | "[::]" => "localhost",
            other => other,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn env(pairs: &[(&str, &str)]) -> HashMap<String, String> {
        pairs
            .iter()
            .map(|(k, v)| ((*k).to_string(), (*v).to_string()))
            .collect()
    }

    #[test]
    fn boolish_parsing() {
        for v in ["1", "true", "YES", "On"] {
            assert_eq!(parse_boolish(v), Some(true), "{v}");
        }
        for v in ["0", "false", "NO", "off"] {
            assert_eq!(parse_boolish(v), Some(false), "{v}");
        }
        for v in ["", "2", "maybe"] {
            assert_eq!(parse_boolish(v), None, "{v}");
        }
    }

    #[test]
    fn defaults_when_nothing_set() {
        let cfg = ResolvedConfig::resolve(ServerOptions::default(), HashMap::new());
        assert_eq!(cfg.port, 3000);
        assert_eq!(cfg.hostname, "0.0.0.0");
        assert_eq!(cfg.protocol, Protocol::Http);
        assert!(cfg.http2);
        assert!(!cfg.production);
        assert_eq!(cfg.limits.max_request_body_bytes, 10 * 1024 * 1024);
        assert_eq!(cfg.shutdown.graceful_timeout, Duration::from_secs(10));
        assert_eq!(cfg.websocket.max_frame_bytes, 1024 * 1024);
    }

    #[test]
    fn explicit_options_beat_env() {
        let cfg = ResolvedConfig::resolve(
            ServerOptions {
                port: Some(8080),
                ..ServerOptions::default()
            },
            env(&[("PORT", "9999"), ("OSRV_PORT", "7777")]),
        );
        assert_eq!(cfg.port, 8080);
    }

    #[test]
    fn osrv_port_beats_plain_port() {
        let cfg = ResolvedConfig::resolve(
            ServerOptions::default(),
            env(&[("PORT", "9999"), ("OSRV_PORT", "7777")]),
        );
        assert_eq!(cfg.port, 7777);
    }

    #[test]
    fn protocol_derived_from_tls_material() {
        let cfg = ResolvedConfig::resolve(
            ServerOptions::default(),
            env(&[("TLS_CERT", "/etc/cert.pem"), ("TLS_KEY", "/etc/key.pem")]),
        );
        assert_eq!(cfg.protocol, Protocol::Https);
        let tls = cfg.tls.expect("tls config");
        assert_eq!(tls.cert, PemSource::Path("/etc/cert.pem".to_string()));
    }

    #[test]
    fn inline_pem_detected() {
        let src = PemSource::from_env_value("-----BEGIN CERTIFICATE-----\nabc\n");
        assert!(matches!(src, PemSource::Inline(_)));
    }

    #[test]
    fn production_from_env_names() {
        for key in ["OSRV_ENV", "ENV", "NODE_ENV"] {
            let cfg = ResolvedConfig::resolve(ServerOptions::default(), env(&[(key, "production")]));
            assert!(cfg.production, "{key}");
        }
        let cfg = ResolvedConfig::resolve(ServerOptions::default(), env(&[("NODE_ENV", "prod")]));
        assert!(cfg.production);
        let cfg = ResolvedConfig::resolve(ServerOptions::default(), env(&[("NODE_ENV", "dev")]));
        assert!(!cfg.production);
    }

    #[test]
    fn http2_env_toggle() {
        let cfg = ResolvedConfig::resolve(ServerOptions::default(), env(&[("OSRV_HTTP2", "off")]));
        assert!(!cfg.http2);
        let cfg =
            ResolvedConfig::resolve(ServerOptions::default(), env(&[("OSRV_HTTP2", "weird")]));
        assert!(cfg.http2, "unspecified boolish keeps the default");
    }

    #[test]
    fn bind_addr_brackets_ipv6() {
        let cfg = ResolvedConfig::resolve(
            ServerOptions {
                hostname: Some("::1".to_string()),
                port: Some(8080),
                ..ServerOptions::default()
            },
            HashMap::new(),
        );
        assert_eq!(cfg.bind_addr(), "[::1]:8080");
    }

    #[test]
    fn public_hostname_substitutes_wildcard() {
        let cfg = ResolvedConfig::resolve(ServerOptions::default(), HashMap::new());
        assert_eq!(cfg.public_hostname(), "localhost");

        let cfg = ResolvedConfig::resolve(
            ServerOptions {
                hostname: Some("api.example.com".to_string()),
                ..ServerOptions::default()
            },
            HashMap::new(),
        );
        assert_eq!(cfg.public_hostname(), "api.example.com");
    }

    #[test]
    fn ping_interval_floor() {
        let ws = WebSocketLimits {
            idle_timeout: Duration::from_millis(500),
            ..WebSocketLimits::default()
        };
        assert_eq!(ws.ping_interval(), Duration::from_millis(1000));

        let ws = WebSocketLimits::default();
        assert_eq!(ws.ping_interval(), Duration::from_secs(30));
    }
}
