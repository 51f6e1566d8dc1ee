//! Identifiers shared by the correlation engine, the consumer pipeline and
//! the transport boundary.

use serde::{Deserialize, Serialize};
use std::fmt;
use uuid::Uuid;

/// Correlation token of one in-flight request.
///
/// `index` is the dense slot number in the registry; `generation` is bumped
/// every time the slot is handed out again, so a late reply addressed to a
/// recycled slot can be told apart from the reply to its current occupant.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct SlotId {
    pub index: u32,
    pub generation: u32,
}

impl SlotId {
    pub fn new(index: u32, generation: u32) -> Self {
        Self { index, generation }
    }
}

impl fmt::Display for SlotId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}#{}", self.index, self.generation)
    }
}

/// Unique identifier of a physical connection, used in logs and by the
/// in-memory router to route replies and pushes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ConnectionId(Uuid);

impl ConnectionId {
    /// Generate a new unique connection ID.
    pub fn generate() -> Self {
        Self(Uuid::new_v4())
    }
}

impl fmt::Display for ConnectionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Connection-scoped consumer identifier carried on every push.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ConsumerId(pub u32);

impl fmt::Display for ConsumerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "consumer-{}", self.0)
    }
}

/// Opaque id pair naming the remote object a request addresses.
///
/// `dispatch` identifies the remote session (or `0` for connection-level
/// requests) and `object` an entity inside it, such as a consumer. A retry
/// validator may rewrite either half when the remote side renumbered its
/// objects across a reconnect.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct TargetSelector {
    pub dispatch: u32,
    pub object: u32,
}

impl TargetSelector {
    /// Selector for requests addressed to the connection itself.
    pub const CONNECTION: TargetSelector = TargetSelector {
        dispatch: 0,
        object: 0,
    };

    pub fn new(dispatch: u32, object: u32) -> Self {
        Self { dispatch, object }
    }
}

impl fmt::Display for TargetSelector {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.dispatch, self.object)
    }
}
