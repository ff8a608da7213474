//! Server and connection configuration.

use quill_runtime::ExecutorConfig;
use std::net::SocketAddr;
use std::time::Duration;

/// Per-connection timings and limits for the WebSocket transport.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConnectionConfig {
    /// Interval between keep-alive messages once initialized.
    pub keep_alive: Duration,
    /// Deadline for writing one frame while the connection is open.
    pub write_timeout: Duration,
    /// Deadline for each already-queued frame flushed during close.
    pub drain_timeout: Duration,
    /// How long to wait for the peer's close frame.
    pub close_timeout: Duration,
    /// Capacity of the outgoing frame queue.
    pub queue_capacity: usize,
}

impl Default for ConnectionConfig {
    fn default() -> Self {
        Self {
            keep_alive: Duration::from_secs(15),
            write_timeout: Duration::from_secs(5),
            drain_timeout: Duration::from_secs(1),
            close_timeout: Duration::from_secs(1),
            queue_capacity: 100,
        }
    }
}

impl ConnectionConfig {
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn keep_alive(mut self, interval: Duration) -> Self {
        self.keep_alive = interval;
        self
    }

    #[must_use]
    pub fn write_timeout(mut self, timeout: Duration) -> Self {
        self.write_timeout = timeout;
        self
    }

    #[must_use]
    pub fn drain_timeout(mut self, timeout: Duration) -> Self {
        self.drain_timeout = timeout;
        self
    }

    #[must_use]
    pub fn close_timeout(mut self, timeout: Duration) -> Self {
        self.close_timeout = timeout;
        self
    }

    /// Sets the outgoing queue capacity. Zero is treated as one.
    #[must_use]
    pub fn queue_capacity(mut self, capacity: usize) -> Self {
        self.queue_capacity = capacity.max(1);
        self
    }
}

/// Server configuration.
#[derive(Debug, Clone)]
pub struct ServerConfig {
    /// Host to bind to.
    pub host: String,
    /// Port to listen on. Zero picks a free port.
    pub port: u16,
    /// Path serving GraphQL over HTTP and WebSocket.
    pub path: String,
    /// Largest accepted `POST` body, in bytes.
    pub max_body_size: usize,
    pub executor: ExecutorConfig,
    pub connection: ConnectionConfig,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self::new()
    }
}

impl ServerConfig {
    pub fn new() -> Self {
        Self {
            host: "127.0.0.1".to_string(),
            port: 4000,
            path: "/graphql".to_string(),
            max_body_size: 1024 * 1024,
            executor: ExecutorConfig::default(),
            connection: ConnectionConfig::default(),
        }
    }

    #[must_use]
    pub fn host(mut self, host: impl Into<String>) -> Self {
        self.host = host.into();
        self
    }

    #[must_use]
    pub fn port(mut self, port: u16) -> Self {
        self.port = port;
        self
    }

    /// Sets the GraphQL path; a missing leading slash is added.
    #[must_use]
    pub fn path(mut self, path: impl Into<String>) -> Self {
        let path = path.into();
        self.path = if path.starts_with('/') {
            path
        } else {
            format!("/{path}")
        };
        self
    }

    #[must_use]
    pub fn max_body_size(mut self, bytes: usize) -> Self {
        self.max_body_size = bytes;
        self
    }

    #[must_use]
    pub fn executor(mut self, executor: ExecutorConfig) -> Self {
        self.executor = executor;
        self
    }

    #[must_use]
    pub fn connection(mut self, connection: ConnectionConfig) -> Self {
        self.connection = connection;
        self
    }

    /// The socket address to bind.
    pub fn socket_addr(&self) -> Result<SocketAddr, std::net::AddrParseError> {
        format!("{}:{}", self.host, self.port).parse()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = ServerConfig::default();
        assert_eq!(config.port, 4000);
        assert_eq!(config.path, "/graphql");
        assert_eq!(config.max_body_size, 1024 * 1024);
        assert_eq!(config.connection.keep_alive, Duration::from_secs(15));
        assert_eq!(config.connection.write_timeout, Duration::from_secs(5));
        assert_eq!(config.connection.drain_timeout, Duration::from_secs(1));
        assert_eq!(config.connection.close_timeout, Duration::from_secs(1));
        assert_eq!(config.connection.queue_capacity, 100);
    }

    #[test]
    fn test_builders() {
        let config = ServerConfig::new()
            .host("0.0.0.0")
            .port(8080)
            .path("api")
            .executor(ExecutorConfig::default().with_max_cost(50))
            .connection(ConnectionConfig::new().queue_capacity(0));
        assert_eq!(config.path, "/api");
        assert_eq!(config.executor.max_cost, Some(50));
        assert_eq!(config.connection.queue_capacity, 1);
        assert_eq!(config.socket_addr().unwrap().port(), 8080);
    }

    #[test]
    fn test_bad_host() {
        assert!(ServerConfig::new().host("not a host").socket_addr().is_err());
    }
}
