//! Public, transport-agnostic client configuration.
//!
//! This type intentionally contains no transport-specific concepts. Transport
//! implementations are configured on their own; this struct only governs the
//! correlation engine and the consumer pipeline.

use crate::{Result, RpcError};
use std::time::Duration;

/// Client runtime configuration.
///
/// # Example
///
/// ```
/// use mom_queue::ClientConfig;
/// use std::time::Duration;
///
/// let config = ClientConfig::default()
///     .with_request_timeout(Some(Duration::from_secs(5)))
///     .with_prefetch_messages(100);
/// assert!(config.validate().is_ok());
/// ```
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClientConfig {
    // ---
    /// Deadline applied to every request that waits for a reply.
    ///
    /// `None` disables timeout enforcement entirely.
    ///
    /// Default: 30 seconds
    pub request_timeout: Option<Duration>,

    /// Whether a request resubmitted after a reconnect gets a fresh deadline.
    /// When false, resubmitted requests wait without one.
    ///
    /// Default: true
    pub retry_timeout_enabled: bool,

    /// Whether a lost connection is expected to come back.
    ///
    /// When true, requests pending at the loss are parked and resubmitted on
    /// reconnect. When false, the loss fails them and invalidates the
    /// connection.
    ///
    /// Default: true
    pub reconnect_enabled: bool,

    /// Maximum number of messages requested per refill.
    ///
    /// Default: 500
    pub prefetch_messages: usize,

    /// Optional payload byte budget per refill.
    pub prefetch_bytes: Option<usize>,

    /// Capacity of the per-consumer duplicate-suppression window.
    ///
    /// Default: 2000
    pub duplicate_window: usize,

    /// Whether redelivered messages already seen by a consumer are dropped.
    ///
    /// Default: true
    pub duplicate_detection: bool,

    /// How long the first `receive_no_wait` on a consumer may wait for the
    /// initial refill to land.
    ///
    /// Default: 100 ms
    pub receive_no_wait_grace: Duration,

    /// Period of the timeout sweep.
    ///
    /// Default: 500 ms
    pub sweep_interval: Duration,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            request_timeout: Some(Duration::from_secs(30)),
            retry_timeout_enabled: true,
            reconnect_enabled: true,
            prefetch_messages: 500,
            prefetch_bytes: None,
            duplicate_window: 2000,
            duplicate_detection: true,
            receive_no_wait_grace: Duration::from_millis(100),
            sweep_interval: Duration::from_millis(500),
        }
    }
}

impl ClientConfig {
    /// Set (or with `None`, disable) the request timeout.
    pub fn with_request_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.request_timeout = timeout;
        self
    }

    pub fn with_retry_timeout(mut self, enabled: bool) -> Self {
        self.retry_timeout_enabled = enabled;
        self
    }

    pub fn with_reconnect(mut self, enabled: bool) -> Self {
        self.reconnect_enabled = enabled;
        self
    }

    pub fn with_prefetch_messages(mut self, messages: usize) -> Self {
        self.prefetch_messages = messages;
        self
    }

    pub fn with_prefetch_bytes(mut self, bytes: Option<usize>) -> Self {
        self.prefetch_bytes = bytes;
        self
    }

    /// Set the duplicate window capacity; a capacity of zero disables
    /// duplicate detection.
    pub fn with_duplicate_window(mut self, capacity: usize) -> Self {
        self.duplicate_window = capacity;
        self.duplicate_detection = capacity > 0;
        self
    }

    pub fn with_duplicate_detection(mut self, enabled: bool) -> Self {
        self.duplicate_detection = enabled;
        self
    }

    pub fn with_receive_no_wait_grace(mut self, grace: Duration) -> Self {
        self.receive_no_wait_grace = grace;
        self
    }

    pub fn with_sweep_interval(mut self, interval: Duration) -> Self {
        self.sweep_interval = interval;
        self
    }

    /// Check the settings for contradictions.
    ///
    /// # Errors
    ///
    /// [`RpcError::ConfigConflict`] for a zero prefetch window or byte
    /// budget, a zero duplicate window with detection enabled, or a zero
    /// sweep interval.
    pub fn validate(&self) -> Result<()> {
        // ---
        if self.prefetch_messages == 0 {
            return Err(RpcError::ConfigConflict(
                "prefetch_messages must be at least 1".into(),
            ));
        }
        if self.prefetch_bytes == Some(0) {
            return Err(RpcError::ConfigConflict(
                "prefetch_bytes must be positive when set".into(),
            ));
        }
        if self.duplicate_detection && self.duplicate_window == 0 {
            return Err(RpcError::ConfigConflict(
                "duplicate detection enabled with an empty window".into(),
            ));
        }
        if self.sweep_interval.is_zero() {
            return Err(RpcError::ConfigConflict(
                "sweep_interval must be positive".into(),
            ));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    // ---
    use super::*;

    #[test]
    fn test_defaults_are_valid() {
        // ---
        let config = ClientConfig::default();
        assert_eq!(config.request_timeout, Some(Duration::from_secs(30)));
        assert_eq!(config.prefetch_messages, 500);
        assert_eq!(config.duplicate_window, 2000);
        assert!(config.duplicate_detection);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_zero_window_disables_detection() {
        // ---
        let config = ClientConfig::default().with_duplicate_window(0);
        assert!(!config.duplicate_detection);
        assert!(config.validate().is_ok());

        let conflicting = config.with_duplicate_detection(true);
        assert!(matches!(
            conflicting.validate(),
            Err(RpcError::ConfigConflict(_))
        ));
    }

    #[test]
    fn test_rejects_empty_prefetch_and_sweep() {
        // ---
        assert!(ClientConfig::default()
            .with_prefetch_messages(0)
            .validate()
            .is_err());
        assert!(ClientConfig::default()
            .with_prefetch_bytes(Some(0))
            .validate()
            .is_err());
        assert!(ClientConfig::default()
            .with_sweep_interval(Duration::ZERO)
            .validate()
            .is_err());
    }
}
