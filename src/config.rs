//! Server configuration.
//!
//! A fluent builder that resolves every knob to a concrete default on
//! `build()`, rather than threading `Option<T>` through the runtime.

use std::time::Duration;

use once_cell::sync::Lazy;

use crate::grpc::Codec;

/// The codec set accepted by a server that doesn't explicitly narrow it.
static DEFAULT_SUPPORTED_CODECS: Lazy<Vec<Codec>> =
    Lazy::new(|| vec![Codec::Identity, Codec::Gzip, Codec::Deflate]);

/// TLS material for the server-side acceptor. Only
/// PEM-encoded bytes are carried here; parsing happens in [`crate::tls`].
#[derive(Clone)]
pub struct TlsConfig {
    pub cert_pem: Vec<u8>,
    pub key_pem: Vec<u8>,
}

impl TlsConfig {
    pub fn new(cert_pem: Vec<u8>, key_pem: Vec<u8>) -> Self {
        Self { cert_pem, key_pem }
    }
}

/// Every resolved knob the connection runtime and server lifecycle consult.
#[derive(Clone)]
pub struct ServerConfig {
    pub max_connections: usize,
    pub max_concurrent_streams: u32,
    pub max_concurrent_requests: usize,
    pub max_queued_requests: usize,
    pub max_message_size: usize,
    pub initial_window_size: u32,
    pub max_frame_size: u32,
    pub header_table_size: u32,
    pub keepalive_interval: Option<Duration>,
    pub keepalive_timeout: Duration,
    pub idle_timeout: Option<Duration>,
    pub drain_timeout: Duration,
    pub accept_backlog: usize,
    pub tls: Option<TlsConfig>,
    pub enable_health_check: bool,
    pub enable_reflection: bool,
    pub debug_mode: bool,
    pub compression_enabled: bool,
    pub compression_threshold: usize,
    pub supported_codecs: Vec<Codec>,
}

impl ServerConfig {
    pub fn builder() -> ServerConfigBuilder {
        ServerConfigBuilder::new()
    }
}

/// Fluent builder: one chainable setter per knob, each field an
/// `Option<T>` until `build()` fills in defaults.
pub struct ServerConfigBuilder {
    max_connections: Option<usize>,
    max_concurrent_streams: Option<u32>,
    max_concurrent_requests: Option<usize>,
    max_queued_requests: Option<usize>,
    max_message_size: Option<usize>,
    initial_window_size: Option<u32>,
    max_frame_size: Option<u32>,
    header_table_size: Option<u32>,
    keepalive_interval: Option<Duration>,
    keepalive_timeout: Option<Duration>,
    idle_timeout: Option<Duration>,
    drain_timeout: Option<Duration>,
    accept_backlog: Option<usize>,
    tls: Option<TlsConfig>,
    enable_health_check: Option<bool>,
    enable_reflection: Option<bool>,
    debug_mode: Option<bool>,
    compression_enabled: Option<bool>,
    compression_threshold: Option<usize>,
    supported_codecs: Option<Vec<Codec>>,
}

impl ServerConfigBuilder {
    pub fn new() -> Self {
        Self {
            max_connections: None,
            max_concurrent_streams: None,
            max_concurrent_requests: None,
            max_queued_requests: None,
            max_message_size: None,
            initial_window_size: None,
            max_frame_size: None,
            header_table_size: None,
            keepalive_interval: None,
            keepalive_timeout: None,
            idle_timeout: None,
            drain_timeout: None,
            accept_backlog: None,
            tls: None,
            enable_health_check: None,
            enable_reflection: None,
            debug_mode: None,
            compression_enabled: None,
            compression_threshold: None,
            supported_codecs: None,
        }
    }

    pub fn max_connections(mut self, n: usize) -> Self {
        self.max_connections = Some(n);
        self
    }

    pub fn max_concurrent_streams(mut self, n: u32) -> Self {
        self.max_concurrent_streams = Some(n);
        self
    }

    pub fn max_concurrent_requests(mut self, n: usize) -> Self {
        self.max_concurrent_requests = Some(n);
        self
    }

    pub fn max_queued_requests(mut self, n: usize) -> Self {
        self.max_queued_requests = Some(n);
        self
    }

    pub fn max_message_size(mut self, n: usize) -> Self {
        self.max_message_size = Some(n);
        self
    }

    pub fn initial_window_size(mut self, n: u32) -> Self {
        self.initial_window_size = Some(n);
        self
    }

    pub fn max_frame_size(mut self, n: u32) -> Self {
        self.max_frame_size = Some(n);
        self
    }

    pub fn header_table_size(mut self, n: u32) -> Self {
        self.header_table_size = Some(n);
        self
    }

    pub fn keepalive_interval(mut self, interval: Option<Duration>) -> Self {
        self.keepalive_interval = interval;
        self
    }

    pub fn keepalive_timeout(mut self, timeout: Duration) -> Self {
        self.keepalive_timeout = Some(timeout);
        self
    }

    pub fn idle_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.idle_timeout = timeout;
        self
    }

    pub fn drain_timeout(mut self, timeout: Duration) -> Self {
        self.drain_timeout = Some(timeout);
        self
    }

    pub fn accept_backlog(mut self, n: usize) -> Self {
        self.accept_backlog = Some(n);
        self
    }

    pub fn tls(mut self, tls: TlsConfig) -> Self {
        self.tls = Some(tls);
        self
    }

    pub fn enable_health_check(mut self, enable: bool) -> Self {
        self.enable_health_check = Some(enable);
        self
    }

    pub fn enable_reflection(mut self, enable: bool) -> Self {
        self.enable_reflection = Some(enable);
        self
    }

    pub fn debug_mode(mut self, enable: bool) -> Self {
        self.debug_mode = Some(enable);
        self
    }

    pub fn compression_enabled(mut self, enable: bool) -> Self {
        self.compression_enabled = Some(enable);
        self
    }

    pub fn compression_threshold(mut self, bytes: usize) -> Self {
        self.compression_threshold = Some(bytes);
        self
    }

    pub fn supported_codecs(mut self, codecs: Vec<Codec>) -> Self {
        self.supported_codecs = Some(codecs);
        self
    }

    pub fn build(self) -> ServerConfig {
        ServerConfig {
            max_connections: self.max_connections.unwrap_or(10_000),
            max_concurrent_streams: self.max_concurrent_streams.unwrap_or(100),
            max_concurrent_requests: self.max_concurrent_requests.unwrap_or(1_000),
            max_queued_requests: self.max_queued_requests.unwrap_or(256),
            max_message_size: self.max_message_size.unwrap_or(4 * 1024 * 1024),
            initial_window_size: self
                .initial_window_size
                .unwrap_or(crate::frame::DEFAULT_INITIAL_WINDOW_SIZE),
            max_frame_size: self.max_frame_size.unwrap_or(crate::frame::DEFAULT_MAX_FRAME_SIZE),
            header_table_size: self
                .header_table_size
                .unwrap_or(crate::frame::DEFAULT_SETTINGS_HEADER_TABLE_SIZE),
            keepalive_interval: self.keepalive_interval.or(Some(Duration::from_secs(60))),
            keepalive_timeout: self.keepalive_timeout.unwrap_or(Duration::from_secs(20)),
            idle_timeout: self.idle_timeout,
            drain_timeout: self.drain_timeout.unwrap_or(Duration::from_secs(30)),
            accept_backlog: self.accept_backlog.unwrap_or(1_024),
            tls: self.tls,
            enable_health_check: self.enable_health_check.unwrap_or(true),
            enable_reflection: self.enable_reflection.unwrap_or(true),
            debug_mode: self.debug_mode.unwrap_or(false),
            compression_enabled: self.compression_enabled.unwrap_or(true),
            compression_threshold: self.compression_threshold.unwrap_or(256),
            supported_codecs: self.supported_codecs.unwrap_or_else(|| DEFAULT_SUPPORTED_CODECS.clone()),
        }
    }
}

impl Default for ServerConfigBuilder {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_are_sane() {
        let config = ServerConfig::builder().build();
        assert_eq!(config.max_concurrent_streams, 100);
        assert!(config.enable_health_check);
        assert!(config.enable_reflection);
        assert!(config.tls.is_none());
        assert_eq!(config.supported_codecs.len(), 3);
    }

    #[test]
    fn builder_overrides_take_effect() {
        let config = ServerConfig::builder()
            .max_concurrent_streams(10)
            .enable_reflection(false)
            .debug_mode(true)
            .build();
        assert_eq!(config.max_concurrent_streams, 10);
        assert!(!config.enable_reflection);
        assert!(config.debug_mode);
    }
}
