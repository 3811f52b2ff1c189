//! Connection configuration and builder.
//!
//! # Example
//!
//! ```ignore
//! use std::time::Duration;
//! use iproto_client::Connection;
//!
//! let conn = Connection::builder()
//!     .host("127.0.0.1")
//!     .port(3301)
//!     .credentials("app", "secret")
//!     .request_timeout(Duration::from_secs(2))
//!     .connect()
//!     .await?;
//! ```

use std::path::PathBuf;
use std::time::Duration;

use crate::connection::Connection;
use crate::error::Result;
use crate::multiplexer::DEFAULT_DISCARD_RETENTION;
use crate::protocol::{DEFAULT_BUFFER_CAPACITY, DEFAULT_MAX_PAYLOAD_SIZE};
use crate::transport::Endpoint;
use crate::writer::WriterConfig;

/// Default server port.
pub const DEFAULT_PORT: u16 = 3301;

/// Default time allowed for socket connect plus greeting.
pub const DEFAULT_CONNECT_TIMEOUT: Duration = Duration::from_secs(60);

/// Default delay between reconnect attempts.
pub const DEFAULT_RECONNECT_TIMEOUT: Duration = Duration::from_millis(333);

/// Connection settings.
#[derive(Debug, Clone)]
pub struct Config {
    pub host: String,
    pub port: u16,
    /// When set, connect over this Unix socket instead of TCP.
    pub unix_socket: Option<PathBuf>,
    /// Authenticate as this user after the greeting; `None` stays guest.
    pub username: Option<String>,
    pub password: String,
    /// Covers socket connect and greeting.
    pub connect_timeout: Duration,
    /// Default per-request deadline; `None` waits indefinitely.
    pub request_timeout: Option<Duration>,
    /// Delay before each reconnect attempt.
    pub reconnect_timeout: Duration,
    pub auto_reconnect: bool,
    /// Fetch the schema after connecting.
    pub fetch_schema: bool,
    /// Refetch when a reply carries a newer schema version.
    pub auto_refetch_schema: bool,
    /// Resend a request once when the server rejects its schema version.
    pub retry_on_schema_change: bool,
    pub initial_read_buffer_size: usize,
    pub max_payload_size: u32,
    /// How long a timed-out id is remembered to drop its late reply.
    pub discard_retention: Duration,
    pub writer: WriterConfig,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            host: "127.0.0.1".to_string(),
            port: DEFAULT_PORT,
            unix_socket: None,
            username: None,
            password: String::new(),
            connect_timeout: DEFAULT_CONNECT_TIMEOUT,
            request_timeout: None,
            reconnect_timeout: DEFAULT_RECONNECT_TIMEOUT,
            auto_reconnect: true,
            fetch_schema: true,
            auto_refetch_schema: true,
            retry_on_schema_change: false,
            initial_read_buffer_size: DEFAULT_BUFFER_CAPACITY,
            max_payload_size: DEFAULT_MAX_PAYLOAD_SIZE,
            discard_retention: DEFAULT_DISCARD_RETENTION,
            writer: WriterConfig::default(),
        }
    }
}

impl Config {
    /// Endpoint derived from host/port or the Unix socket path.
    pub fn endpoint(&self) -> Endpoint {
        match &self.unix_socket {
            Some(path) => Endpoint::unix(path.clone()),
            None => Endpoint::tcp(self.host.clone(), self.port),
        }
    }
}

/// Fluent builder for [`Config`].
#[derive(Debug, Clone, Default)]
pub struct ConnectionBuilder {
    config: Config,
}

impl ConnectionBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn host(mut self, host: impl Into<String>) -> Self {
        self.config.host = host.into();
        self
    }

    pub fn port(mut self, port: u16) -> Self {
        self.config.port = port;
        self
    }

    /// Connect over a Unix domain socket.
    pub fn unix_socket(mut self, path: impl Into<PathBuf>) -> Self {
        self.config.unix_socket = Some(path.into());
        self
    }

    /// Authenticate with chap-sha1 after connecting.
    pub fn credentials(mut self, username: impl Into<String>, password: impl Into<String>) -> Self {
        self.config.username = Some(username.into());
        self.config.password = password.into();
        self
    }

    /// Default: 60 seconds
    pub fn connect_timeout(mut self, timeout: Duration) -> Self {
        self.config.connect_timeout = timeout;
        self
    }

    /// Default: none
    pub fn request_timeout(mut self, timeout: Duration) -> Self {
        self.config.request_timeout = Some(timeout);
        self
    }

    /// Default: 333 ms
    pub fn reconnect_timeout(mut self, timeout: Duration) -> Self {
        self.config.reconnect_timeout = timeout;
        self
    }

    pub fn auto_reconnect(mut self, enabled: bool) -> Self {
        self.config.auto_reconnect = enabled;
        self
    }

    pub fn fetch_schema(mut self, enabled: bool) -> Self {
        self.config.fetch_schema = enabled;
        self
    }

    pub fn auto_refetch_schema(mut self, enabled: bool) -> Self {
        self.config.auto_refetch_schema = enabled;
        self
    }

    pub fn retry_on_schema_change(mut self, enabled: bool) -> Self {
        self.config.retry_on_schema_change = enabled;
        self
    }

    /// Default: 64 KB
    pub fn initial_read_buffer_size(mut self, size: usize) -> Self {
        self.config.initial_read_buffer_size = size;
        self
    }

    /// Default: 1 GB
    pub fn max_payload_size(mut self, size: u32) -> Self {
        self.config.max_payload_size = size;
        self
    }

    /// Default: 60 seconds
    pub fn discard_retention(mut self, retention: Duration) -> Self {
        self.config.discard_retention = retention;
        self
    }

    /// Set the maximum pending frames for backpressure.
    ///
    /// Default: 1024
    pub fn max_pending_frames(mut self, limit: usize) -> Self {
        self.config.writer.max_pending_frames = limit;
        self
    }

    /// Default: 1024
    pub fn channel_capacity(mut self, capacity: usize) -> Self {
        self.config.writer.channel_capacity = capacity;
        self
    }

    /// Default: 5 seconds
    pub fn backpressure_timeout(mut self, timeout: Duration) -> Self {
        self.config.writer.backpressure_timeout = timeout;
        self
    }

    /// Finish without connecting.
    pub fn build(self) -> Config {
        self.config
    }

    /// Connect with the configured settings.
    pub async fn connect(self) -> Result<Connection> {
        Connection::connect(self.config).await
    }
}
