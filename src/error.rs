use thiserror::Error;

/// Errors surfaced by the client runtime.
///
/// The correlation engine reports outcomes as data (see
/// [`Outcome`](crate::Outcome) and [`Reply`](crate::Reply)); the session,
/// consumer and producer APIs convert a failed reply into one of these
/// variants so that callers can tell a timeout from a lost connection, a
/// vetoed retry, or an explicit cancellation.
#[derive(Error, Debug)]
pub enum RpcError {
    /// The request exceeded its deadline. Timeouts are terminal and never retried.
    #[error("request timed out")]
    Timeout,

    /// The connection was lost while the request was pending.
    #[error("connection lost: {0}")]
    ConnectionLost(String),

    /// The connection was marked invalid after an unrecoverable loss; all
    /// further requests fail fast.
    #[error("connection is no longer valid: {0}")]
    ConnectionInvalid(String),

    /// The transport rejected a frame.
    #[error("transport error: {0}")]
    Transport(String),

    /// The router answered with a failure.
    #[error("remote failure ({kind}): {message}")]
    Remote {
        /// Failure class reported by the router.
        kind: String,
        /// Human-readable detail.
        message: String,
    },

    /// A retry validator refused to resubmit the request after a reconnect.
    #[error("retry vetoed: {0}")]
    Vetoed(String),

    /// The request was cancelled before a reply arrived.
    #[error("request cancelled")]
    Cancelled,

    /// The consumer, producer or session is closed.
    #[error("resource is closed")]
    Closed,

    /// The call is not valid in the current state (listener installed,
    /// wrong acknowledgment mode, ...).
    #[error("illegal state: {0}")]
    IllegalState(String),

    /// JSON serialization or deserialization failed
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// A required configuration value is missing.
    #[error("missing configuration: {0}")]
    MissingConfig(String),

    /// Configuration values contradict each other.
    #[error("configuration conflict: {0}")]
    ConfigConflict(String),
}

/// Result type alias for client runtime operations
pub type Result<T> = std::result::Result<T, RpcError>;
