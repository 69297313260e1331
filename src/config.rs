use std::{collections::HashMap, fs, path::PathBuf, sync::Arc, time::Duration};

use config::Config;
use rustls_pemfile::{certs, pkcs8_private_keys};
use serde::Deserialize;
use rustls::{Certificate, PrivateKey, ServerConfig as RustlsServerConfig};
use tokio_rustls::TlsAcceptor;
use url::Url;

use crate::utils::error::WebSocketError;
use crate::utils::rate_limit::Limit;

/// Upper bound accepted for `max_connections`.
const MAX_CONNECTIONS_CEILING: usize = 100_000;

/// Which algorithm enforces per-client message limits.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum RateLimitStrategy {
    #[default]
    TokenBucket,
    SlidingWindow,
}

/// Configuration settings for the WebSocket server.
#[derive(Debug, Deserialize, Clone)]
#[serde(default)]
pub struct ServerConfig {
    /// Interface to bind.
    pub host: String,
    /// The port on which the server will listen. `0` picks a free port.
    pub port: u16,
    /// Request path that is upgraded; other paths get a 404.
    pub path: String,
    /// Origins allowed to connect. Empty or `*` allows any origin.
    pub allowed_origins: Vec<String>,
    /// Reject handshakes the authenticator does not accept.
    pub auth_required: bool,
    /// The maximum number of simultaneous connections allowed.
    pub max_connections: usize,
    /// Per-client inbound messages per second. `0` disables message limiting.
    pub message_rate_limit: u32,
    /// Burst allowance for the token bucket.
    pub message_rate_burst: u32,
    pub rate_limit_strategy: RateLimitStrategy,
    /// Window length used by the sliding window strategy.
    pub rate_limit_window_ms: u64,
    /// New connections per second accepted from one IP. `0` disables the check.
    pub connection_rate_limit: u32,
    /// Whether binary payloads are deflate-compressed.
    pub enable_compression: bool,
    /// Whether TLS is enabled for secure communication.
    pub enable_tls: bool,
    /// Path to the TLS certificate file.
    pub tls_cert_path: PathBuf,
    /// Path to the TLS private key file.
    pub tls_key_path: PathBuf,
    /// Serve `/metrics` and `/health` over HTTP.
    pub metrics_enabled: bool,
    pub metrics_port: u16,
    pub shutdown_timeout_ms: u64,
    pub ping_interval_ms: u64,
    /// Read deadline; extended whenever a frame arrives.
    pub pong_timeout_ms: u64,
    pub write_timeout_ms: u64,
    /// Capacity of each client's send queue.
    pub queue_size: usize,
    /// Largest accepted message in bytes.
    pub max_message_size: usize,
    /// Capacity of the hub's event queue.
    pub hub_queue_size: usize,
    /// Handle `join_room` / `leave_room` / `room_message` frames on the server.
    pub room_commands_enabled: bool,
    pub limiter_cleanup_interval_ms: u64,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: "0.0.0.0".into(),
            port: 8080,
            path: "/ws".into(),
            allowed_origins: Vec::new(),
            auth_required: false,
            max_connections: 10_000,
            message_rate_limit: 100,
            message_rate_burst: 200,
            rate_limit_strategy: RateLimitStrategy::TokenBucket,
            rate_limit_window_ms: 1_000,
            connection_rate_limit: 50,
            enable_compression: false,
            enable_tls: false,
            tls_cert_path: PathBuf::from("certs/cert.pem"),
            tls_key_path: PathBuf::from("certs/key.pem"),
            metrics_enabled: false,
            metrics_port: 9080,
            shutdown_timeout_ms: 10_000,
            ping_interval_ms: 30_000,
            pong_timeout_ms: 60_000,
            write_timeout_ms: 10_000,
            queue_size: 256,
            max_message_size: 1 << 20,
            hub_queue_size: 1_024,
            room_commands_enabled: true,
            limiter_cleanup_interval_ms: 60_000,
        }
    }
}

impl ServerConfig {
    /// Loads the server configuration from environment variables.
    ///
    /// Environment variables should be prefixed with `WS_`; `WS_ALLOWED_ORIGINS` is a
    /// comma separated list.
    ///
    /// # Errors
    /// Returns a `WebSocketError::ConfigurationError` if the configuration cannot be loaded.
    pub fn from_env() -> Result<Self, WebSocketError> {
        Config::builder()
            .add_source(
                config::Environment::with_prefix("WS")
                    .try_parsing(true)
                    .list_separator(",")
                    .with_list_parse_key("allowed_origins"),
            )
            .build()
            .map_err(|e| WebSocketError::ConfigurationError(e.to_string()))?
            .try_deserialize()
            .map_err(|e| WebSocketError::ConfigurationError(e.to_string()))
    }

    /// Validates the configuration settings.
    ///
    /// Ensures that required TLS files exist if TLS is enabled, that limits are
    /// positive, and that the read deadline outlasts the ping interval.
    ///
    /// # Errors
    /// Returns a `WebSocketError::ConfigurationError` if validation fails.
    pub fn validate(&self) -> Result<(), WebSocketError> {
        if self.max_connections == 0 {
            return Err(WebSocketError::ConfigurationError(
                "max_connections must be greater than 0".into(),
            ));
        }

        if self.max_connections > MAX_CONNECTIONS_CEILING {
            return Err(WebSocketError::ConfigurationError(format!(
                "max_connections cannot exceed {MAX_CONNECTIONS_CEILING}"
            )));
        }

        if !self.path.starts_with('/') {
            return Err(WebSocketError::ConfigurationError(format!(
                "path must start with '/': {}",
                self.path
            )));
        }

        if self.queue_size == 0 || self.hub_queue_size == 0 {
            return Err(WebSocketError::ConfigurationError(
                "queue_size and hub_queue_size must be greater than 0".into(),
            ));
        }

        validate_heartbeat(self.ping_interval_ms, self.pong_timeout_ms)?;

        if self.message_rate_limit > 0 {
            self.message_limit().into_limiter()?;
        }

        if self.enable_tls {
            if !self.tls_cert_path.exists() {
                return Err(WebSocketError::ConfigurationError(format!(
                    "Certificate file not found: {:?}",
                    self.tls_cert_path
                )));
            }

            if !self.tls_key_path.exists() {
                return Err(WebSocketError::ConfigurationError(format!(
                    "Key file not found: {:?}",
                    self.tls_key_path
                )));
            }
        }

        Ok(())
    }

    /// Per-client inbound limit derived from the rate settings.
    pub fn message_limit(&self) -> Limit {
        if self.message_rate_limit == 0 {
            return Limit::Unlimited;
        }
        match self.rate_limit_strategy {
            RateLimitStrategy::TokenBucket => Limit::TokenBucket {
                rate: f64::from(self.message_rate_limit),
                burst: self.message_rate_burst.max(1),
            },
            RateLimitStrategy::SlidingWindow => Limit::SlidingWindow {
                window: Duration::from_millis(self.rate_limit_window_ms),
                max_requests: self.message_rate_limit,
            },
        }
    }

    pub fn bind_address(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }

    pub fn ping_interval(&self) -> Duration {
        Duration::from_millis(self.ping_interval_ms)
    }

    pub fn pong_timeout(&self) -> Duration {
        Duration::from_millis(self.pong_timeout_ms)
    }

    pub fn write_timeout(&self) -> Duration {
        Duration::from_millis(self.write_timeout_ms)
    }

    pub fn shutdown_timeout(&self) -> Duration {
        Duration::from_millis(self.shutdown_timeout_ms)
    }

    pub fn limiter_cleanup_interval(&self) -> Duration {
        Duration::from_millis(self.limiter_cleanup_interval_ms)
    }

    /// Whether `origin` may open a connection.
    pub fn origin_allowed(&self, origin: Option<&str>) -> bool {
        if self.allowed_origins.is_empty() || self.allowed_origins.iter().any(|o| o == "*") {
            return true;
        }
        origin.map_or(false, |origin| {
            self.allowed_origins
                .iter()
                .any(|allowed| allowed.eq_ignore_ascii_case(origin))
        })
    }

    /// Creates a TLS acceptor for secure WebSocket connections.
    ///
    /// If TLS is disabled, returns `None`. Otherwise, loads the TLS certificate and private key,
    /// and initializes a Rustls TLS acceptor.
    ///
    /// # Errors
    /// Returns a `WebSocketError::ConfigurationError` if any part of the TLS setup fails.
    pub fn create_tls_acceptor(&self) -> Result<Option<Arc<TlsAcceptor>>, WebSocketError> {
        if !self.enable_tls {
            return Ok(None);
        }

        let cert_chain = fs::read(&self.tls_cert_path).map_err(|e| {
            WebSocketError::ConfigurationError(format!(
                "Certificate error: {} (path: {:?})",
                e, self.tls_cert_path
            ))
        })?;

        let key_der = fs::read(&self.tls_key_path).map_err(|e| {
            WebSocketError::ConfigurationError(format!(
                "Key error: {} (path: {:?})",
                e, self.tls_key_path
            ))
        })?;

        let certs = certs(&mut cert_chain.as_slice())
            .map_err(|e| WebSocketError::ConfigurationError(format!("Cert parse error: {}", e)))?;

        let mut keys = pkcs8_private_keys(&mut key_der.as_slice())
            .map_err(|e| WebSocketError::ConfigurationError(format!("Key parse error: {}", e)))?;

        if keys.is_empty() {
            return Err(WebSocketError::ConfigurationError(format!(
                "No PKCS#8 private key in {:?}",
                self.tls_key_path
            )));
        }

        let config = RustlsServerConfig::builder()
            .with_safe_defaults()
            .with_no_client_auth()
            .with_single_cert(
                certs.into_iter().map(Certificate).collect(),
                PrivateKey(keys.swap_remove(0)),
            )
            .map_err(|e| WebSocketError::ConfigurationError(format!("TLS config error: {}", e)))?;

        Ok(Some(Arc::new(TlsAcceptor::from(Arc::new(config)))))
    }
}

/// Configuration settings for the connecting side.
#[derive(Debug, Deserialize, Clone)]
#[serde(default)]
pub struct ClientConfig {
    /// `ws://` or `wss://` endpoint.
    pub url: String,
    /// Extra handshake headers.
    pub headers: HashMap<String, String>,
    pub subprotocols: Vec<String>,
    pub auto_reconnect: bool,
    /// Base delay before a reconnect attempt.
    pub reconnect_interval_ms: u64,
    /// Attempts before giving up. `0` retries forever.
    pub max_reconnect_attempts: u32,
    /// Added to the base delay once per previous failed attempt, up to ten times.
    pub reconnect_backoff_ms: u64,
    pub ping_interval_ms: u64,
    pub pong_timeout_ms: u64,
    /// Deadline for each inbound frame. `0` disables it.
    pub read_timeout_ms: u64,
    pub write_timeout_ms: u64,
    pub handshake_timeout_ms: u64,
    pub queue_size: usize,
    pub max_message_size: usize,
    /// Outbound messages per second. `0` disables limiting.
    pub rate_limit: u32,
    pub rate_burst: u32,
    pub enable_compression: bool,
    pub auth_token: Option<String>,
    /// Header carrying `auth_token`.
    pub auth_header: String,
    /// HTTP proxy tunnelled through with `CONNECT`.
    pub proxy_url: Option<String>,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            url: "ws://127.0.0.1:8080/ws".into(),
            headers: HashMap::new(),
            subprotocols: Vec::new(),
            auto_reconnect: true,
            reconnect_interval_ms: 1_000,
            max_reconnect_attempts: 10,
            reconnect_backoff_ms: 1_000,
            ping_interval_ms: 30_000,
            pong_timeout_ms: 60_000,
            read_timeout_ms: 90_000,
            write_timeout_ms: 10_000,
            handshake_timeout_ms: 10_000,
            queue_size: 256,
            max_message_size: 1 << 20,
            rate_limit: 0,
            rate_burst: 0,
            enable_compression: false,
            auth_token: None,
            auth_header: "Authorization".into(),
            proxy_url: None,
        }
    }
}

impl ClientConfig {
    pub fn new(url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            ..Default::default()
        }
    }

    /// Loads client settings from `WS_CLIENT_*` environment variables.
    pub fn from_env() -> Result<Self, WebSocketError> {
        Config::builder()
            .add_source(
                config::Environment::with_prefix("WS_CLIENT")
                    .try_parsing(true)
                    .list_separator(",")
                    .with_list_parse_key("subprotocols"),
            )
            .build()
            .map_err(|e| WebSocketError::ConfigurationError(e.to_string()))?
            .try_deserialize()
            .map_err(|e| WebSocketError::ConfigurationError(e.to_string()))
    }

    pub fn validate(&self) -> Result<(), WebSocketError> {
        let url = Url::parse(&self.url)?;
        if !matches!(url.scheme(), "ws" | "wss") {
            return Err(WebSocketError::InvalidUrl(format!(
                "unsupported scheme {:?}",
                url.scheme()
            )));
        }

        if let Some(proxy) = &self.proxy_url {
            let proxy = Url::parse(proxy)?;
            if proxy.scheme() != "http" || proxy.host_str().is_none() {
                return Err(WebSocketError::InvalidUrl(format!(
                    "proxy must be an http:// URL with a host: {proxy}"
                )));
            }
        }

        if self.queue_size == 0 {
            return Err(WebSocketError::ConfigurationError(
                "queue_size must be greater than 0".into(),
            ));
        }

        validate_heartbeat(self.ping_interval_ms, self.pong_timeout_ms)
    }

    /// Outbound limit applied by `send`.
    pub fn send_limit(&self) -> Limit {
        if self.rate_limit == 0 {
            return Limit::Unlimited;
        }
        Limit::TokenBucket {
            rate: f64::from(self.rate_limit),
            burst: if self.rate_burst == 0 { self.rate_limit } else { self.rate_burst },
        }
    }

    pub fn reconnect_interval(&self) -> Duration {
        Duration::from_millis(self.reconnect_interval_ms)
    }

    pub fn reconnect_backoff(&self) -> Duration {
        Duration::from_millis(self.reconnect_backoff_ms)
    }

    pub fn ping_interval(&self) -> Duration {
        Duration::from_millis(self.ping_interval_ms)
    }

    pub fn pong_timeout(&self) -> Duration {
        Duration::from_millis(self.pong_timeout_ms)
    }

    pub fn read_timeout(&self) -> Option<Duration> {
        (self.read_timeout_ms > 0).then(|| Duration::from_millis(self.read_timeout_ms))
    }

    pub fn write_timeout(&self) -> Duration {
        Duration::from_millis(self.write_timeout_ms)
    }

    pub fn handshake_timeout(&self) -> Duration {
        Duration::from_millis(self.handshake_timeout_ms)
    }
}

fn validate_heartbeat(ping_interval_ms: u64, pong_timeout_ms: u64) -> Result<(), WebSocketError> {
    if ping_interval_ms == 0 {
        return Err(WebSocketError::ConfigurationError(
            "ping_interval_ms must be greater than 0".into(),
        ));
    }
    if pong_timeout_ms <= ping_interval_ms {
        return Err(WebSocketError::ConfigurationError(format!(
            "pong_timeout_ms ({pong_timeout_ms}) must exceed ping_interval_ms ({ping_interval_ms})"
        )));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_validate() {
        ServerConfig::default().validate().unwrap();
        ClientConfig::default().validate().unwrap();
    }

    #[test]
    fn pong_timeout_must_exceed_ping_interval() {
        let config = ServerConfig {
            ping_interval_ms: 1_000,
            pong_timeout_ms: 1_000,
            ..Default::default()
        };
        assert!(matches!(
            config.validate(),
            Err(WebSocketError::ConfigurationError(_))
        ));
    }

    #[test]
    fn tls_requires_existing_files() {
        let config = ServerConfig {
            enable_tls: true,
            tls_cert_path: PathBuf::from("/nonexistent/cert.pem"),
            ..Default::default()
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn origin_policy() {
        let mut config = ServerConfig::default();
        assert!(config.origin_allowed(None));
        config.allowed_origins = vec!["https://example.com".into()];
        assert!(config.origin_allowed(Some("https://EXAMPLE.com")));
        assert!(!config.origin_allowed(Some("https://evil.test")));
        assert!(!config.origin_allowed(None));
    }

    #[test]
    fn message_limit_follows_strategy() {
        let mut config = ServerConfig {
            message_rate_limit: 3,
            rate_limit_strategy: RateLimitStrategy::SlidingWindow,
            ..Default::default()
        };
        assert_eq!(
            config.message_limit(),
            Limit::SlidingWindow { window: Duration::from_secs(1), max_requests: 3 }
        );
        config.message_rate_limit = 0;
        assert_eq!(config.message_limit(), Limit::Unlimited);
    }

    #[test]
    fn client_rejects_bad_urls() {
        assert!(ClientConfig::new("http://localhost").validate().is_err());
        assert!(ClientConfig::new("not a url").validate().is_err());
        let config = ClientConfig {
            proxy_url: Some("socks5://proxy:1080".into()),
            ..ClientConfig::new("ws://localhost/ws")
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn client_send_limit_defaults_burst_to_rate() {
        let config = ClientConfig {
            rate_limit: 5,
            ..Default::default()
        };
        assert_eq!(config.send_limit(), Limit::TokenBucket { rate: 5.0, burst: 5 });
    }
}
