//! Processor configuration types.

use std::time::Duration;

use scgi_core::DEFAULT_MAX_CONNECTIONS;

/// Top-level configuration for an SCGI processor.
///
/// Immutable once handed to [`Processor::new`](super::Processor::new).
#[derive(Debug, Clone)]
pub struct ProcessorConfig {
    /// Bind address for the listening socket.
    pub host: String,
    /// Port to listen on. 0 means OS-assigned.
    pub port: u16,
    /// Connections above this count are answered with the busy redirect.
    pub max_connections: usize,
    /// Opaque environment tag handed to the application at startup.
    pub environment: String,
    /// Per-connection settings.
    pub connection: ConnectionConfig,
}

impl ProcessorConfig {
    /// The `host:port` string the listener binds to.
    #[must_use]
    pub fn bind_addr(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}

impl Default for ProcessorConfig {
    fn default() -> Self {
        Self {
            host: "127.0.0.1".to_string(),
            port: 9999,
            max_connections: DEFAULT_MAX_CONNECTIONS,
            environment: "production".to_string(),
            connection: ConnectionConfig::default(),
        }
    }
}

/// Per-connection configuration.
#[derive(Debug, Clone)]
pub struct ConnectionConfig {
    /// Upper bound on reading the header block and body of one request.
    /// `None` waits indefinitely. The application handler is not bounded.
    pub read_timeout: Option<Duration>,
}

impl Default for ConnectionConfig {
    fn default() -> Self {
        Self {
            read_timeout: Some(Duration::from_secs(30)),
        }
    }
}
