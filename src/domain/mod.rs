//! Domain layer public interface.
//!
//! This module defines domain-level abstractions that are independent of
//! transport implementations: the transport contract the runtime is driven
//! through, and the request/reply records that cross it.
//!
//! All domain consumers must import symbols via this module, not by
//! referencing individual files directly.

mod protocol;
mod transport;

// --- Protocol domain re-exports ---

pub use protocol::{
    //
    AckMode,
    AckTarget,
    ClientRequest,
    Failure,
    FailureKind,
    Reply,
    ReplyBody,
};

// --- Transport domain re-exports ---

pub use transport::{
    //
    DeliveryJob,
    Frame,
    Inbound,
    Push,
    Transport,
    TransportEvent,
    TransportListener,
    TransportPtr,
};
