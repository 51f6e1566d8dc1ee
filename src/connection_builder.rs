//! Connection builder.
//!
//! Provides a fluent builder API for configuring client connections with
//! timeout, reconnect and prefetch settings.

use crate::{ClientConfig, Connection, Result, TransportPtr};
use std::time::Duration;

/// Builder for creating [`Connection`] instances.
///
/// Accepts a transport and allows overriding individual [`ClientConfig`]
/// settings. Unset values keep their defaults.
///
/// # Examples
///
/// ```
/// use mom_queue::{ConnectionBuilder, MemoryRouter, AckMode};
/// use std::time::Duration;
///
/// # fn example() -> mom_queue::Result<()> {
/// let router = MemoryRouter::new();
/// let connection = ConnectionBuilder::new(router.connect("client-a"))
///     .request_timeout(Duration::from_secs(5))
///     .prefetch_messages(50)
///     .build()?;
///
/// let session = connection.create_session(AckMode::Auto)?;
/// # let _ = session;
/// # Ok(())
/// # }
/// # example().unwrap();
/// ```
pub struct ConnectionBuilder {
    // ---
    transport: TransportPtr,
    config: ClientConfig,
}

impl ConnectionBuilder {
    /// Create a new connection builder over `transport`.
    pub fn new(transport: TransportPtr) -> Self {
        Self {
            transport,
            config: ClientConfig::default(),
        }
    }

    /// Replace the whole configuration.
    pub fn config(mut self, config: ClientConfig) -> Self {
        self.config = config;
        self
    }

    /// Set the request timeout.
    ///
    /// Default: 30s.
    pub fn request_timeout(mut self, timeout: Duration) -> Self {
        self.config.request_timeout = Some(timeout);
        self
    }

    /// Disable request deadlines altogether.
    pub fn no_request_timeout(mut self) -> Self {
        self.config.request_timeout = None;
        self
    }

    /// Whether resubmitted requests get a fresh deadline.
    ///
    /// Default: true.
    pub fn retry_timeout(mut self, enabled: bool) -> Self {
        self.config.retry_timeout_enabled = enabled;
        self
    }

    /// Whether a connection loss parks requests until reconnect.
    ///
    /// Default: true.
    pub fn reconnect(mut self, enabled: bool) -> Self {
        self.config.reconnect_enabled = enabled;
        self
    }

    /// Set the number of messages requested per refill.
    ///
    /// Default: 500.
    pub fn prefetch_messages(mut self, messages: usize) -> Self {
        self.config.prefetch_messages = messages;
        self
    }

    /// Cap the payload bytes requested per refill.
    pub fn prefetch_bytes(mut self, bytes: usize) -> Self {
        self.config.prefetch_bytes = Some(bytes);
        self
    }

    /// Set the duplicate window capacity; zero disables detection.
    ///
    /// Default: 2000.
    pub fn duplicate_window(mut self, capacity: usize) -> Self {
        self.config = self.config.with_duplicate_window(capacity);
        self
    }

    /// Set the timeout sweep period.
    ///
    /// Default: 500ms.
    pub fn sweep_interval(mut self, interval: Duration) -> Self {
        self.config.sweep_interval = interval;
        self
    }

    /// Set the grace period of the first `receive_no_wait`.
    ///
    /// Default: 100ms.
    pub fn receive_no_wait_grace(mut self, grace: Duration) -> Self {
        self.config.receive_no_wait_grace = grace;
        self
    }

    /// Validate the configuration and open the connection (consumes self).
    pub fn build(self) -> Result<Connection> {
        Connection::open(self.transport, self.config)
    }
}
