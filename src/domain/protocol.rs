// src/domain/protocol.rs

//! Request and reply records exchanged with the router.
//!
//! [`ClientRequest`] is the body of every request the runtime issues on its
//! own behalf (refills, acknowledgments, consumer lifecycle, produce). It is
//! encoded as JSON into the opaque frame payload; the transport never looks
//! inside it.

use crate::{ConsumerId, Result, RpcError, SlotId};
use bytes::Bytes;
use serde::{Deserialize, Serialize};
use std::fmt;

/// Acknowledgment mode of a session and the consumers it creates.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AckMode {
    /// The router forgets a message as soon as it is pushed.
    None,
    /// The client acknowledges each message right after hand-off.
    Auto,
    /// The application acknowledges explicitly.
    Client,
    /// Messages are settled by session commit/rollback.
    Transacted,
}

impl AckMode {
    /// Whether the router must be told a message reached application code
    /// before it is settled ("in doubt" bookkeeping).
    pub fn requires_delivery_report(self) -> bool {
        matches!(self, AckMode::Client | AckMode::Transacted)
    }
}

/// What an acknowledgment covers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AckTarget {
    /// A single message.
    Index(u64),
    /// Every message delivered to the consumer so far.
    All,
}

/// Wire body of a runtime-issued request.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "op", rename_all = "snake_case")]
pub enum ClientRequest {
    CreateSession {
        session: u32,
        ack_mode: AckMode,
    },
    CloseSession {
        session: u32,
    },
    CreateConsumer {
        consumer: ConsumerId,
        destination: String,
        ack_mode: AckMode,
    },
    CloseConsumer {
        consumer: ConsumerId,
    },
    /// Ask the router to push up to `max_messages` (and at most `max_bytes`
    /// of payload) into the consumer cache.
    Refill {
        consumer: ConsumerId,
        max_messages: usize,
        max_bytes: Option<usize>,
    },
    DeliveryReport {
        consumer: ConsumerId,
        index: u64,
    },
    Acknowledge {
        consumer: ConsumerId,
        target: AckTarget,
    },
    Produce {
        destination: String,
        payload: Bytes,
    },
    Commit {
        session: u32,
    },
    Rollback {
        session: u32,
    },
}

impl ClientRequest {
    /// Encode into a frame payload.
    pub fn encode(&self) -> Result<Bytes> {
        Ok(Bytes::from(serde_json::to_vec(self)?))
    }

    /// Decode a frame payload.
    pub fn decode(payload: &[u8]) -> Result<Self> {
        Ok(serde_json::from_slice(payload)?)
    }

    /// Short operation name for log lines.
    pub fn name(&self) -> &'static str {
        match self {
            ClientRequest::CreateSession { .. } => "create_session",
            ClientRequest::CloseSession { .. } => "close_session",
            ClientRequest::CreateConsumer { .. } => "create_consumer",
            ClientRequest::CloseConsumer { .. } => "close_consumer",
            ClientRequest::Refill { .. } => "refill",
            ClientRequest::DeliveryReport { .. } => "delivery_report",
            ClientRequest::Acknowledge { .. } => "acknowledge",
            ClientRequest::Produce { .. } => "produce",
            ClientRequest::Commit { .. } => "commit",
            ClientRequest::Rollback { .. } => "rollback",
        }
    }
}

/// Classification of a failed reply.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FailureKind {
    /// Synthesised by the timeout sweep. Never retried.
    Timeout,
    /// Synthesised when the connection was lost without recovery.
    ConnectionLost,
    /// Supplied by a retry validator that refused resubmission.
    Vetoed,
    /// Reported by the router, with its own failure class.
    Remote(String),
}

impl fmt::Display for FailureKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FailureKind::Timeout => f.write_str("timeout"),
            FailureKind::ConnectionLost => f.write_str("connection_lost"),
            FailureKind::Vetoed => f.write_str("vetoed"),
            FailureKind::Remote(kind) => f.write_str(kind),
        }
    }
}

/// Failure payload: a kind plus a message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Failure {
    pub kind: FailureKind,
    pub message: String,
}

impl Failure {
    pub fn new(kind: FailureKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
        }
    }

    pub fn remote(kind: impl Into<String>, message: impl Into<String>) -> Self {
        Self::new(FailureKind::Remote(kind.into()), message)
    }
}

impl From<Failure> for RpcError {
    fn from(failure: Failure) -> Self {
        match failure.kind {
            FailureKind::Timeout => RpcError::Timeout,
            FailureKind::ConnectionLost => RpcError::ConnectionLost(failure.message),
            FailureKind::Vetoed => RpcError::Vetoed(failure.message),
            FailureKind::Remote(kind) => RpcError::Remote {
                kind,
                message: failure.message,
            },
        }
    }
}

/// Success payload or failure.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ReplyBody {
    Success(Bytes),
    Failure(Failure),
}

/// Outcome of a request, correlated by slot.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Reply {
    pub slot: SlotId,
    pub body: ReplyBody,
}

impl Reply {
    pub fn success(slot: SlotId, payload: Bytes) -> Self {
        Self {
            slot,
            body: ReplyBody::Success(payload),
        }
    }

    pub fn failure(slot: SlotId, failure: Failure) -> Self {
        Self {
            slot,
            body: ReplyBody::Failure(failure),
        }
    }

    /// Synthetic reply attached by the timeout sweep.
    pub fn timeout(slot: SlotId) -> Self {
        Self::failure(
            slot,
            Failure::new(FailureKind::Timeout, "request exceeded its deadline"),
        )
    }

    pub fn is_success(&self) -> bool {
        matches!(self.body, ReplyBody::Success(_))
    }

    /// True if this reply was synthesised because the deadline passed.
    pub fn is_timeout(&self) -> bool {
        matches!(
            &self.body,
            ReplyBody::Failure(Failure {
                kind: FailureKind::Timeout,
                ..
            })
        )
    }

    pub fn failure_ref(&self) -> Option<&Failure> {
        match &self.body {
            ReplyBody::Failure(failure) => Some(failure),
            ReplyBody::Success(_) => None,
        }
    }

    /// Convert into the success payload or the matching [`RpcError`].
    pub fn into_result(self) -> Result<Bytes> {
        match self.body {
            ReplyBody::Success(payload) => Ok(payload),
            ReplyBody::Failure(failure) => Err(failure.into()),
        }
    }
}
