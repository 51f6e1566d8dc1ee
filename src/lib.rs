//! Message-queue client runtime with request correlation, transparent retry
//! and a prefetching consumer pipeline
//!
//! This library provides the client side of a message router protocol. It
//! correlates requests with replies through generation-checked slots, parks
//! and resubmits requests across reconnects, and feeds consumers from a
//! prefetch cache with refill flow control and duplicate suppression.
//!

// Import all sub modules once...
mod macros;

mod client;
mod domain;
mod transport;

mod client_config;
mod connection_builder;

mod correlation;
mod error;
mod recent_set;
mod slot_table;

#[cfg(test)]
mod test_support;

pub(crate) use macros::{log_debug, log_error, log_info, log_warn};

// Re-export main types
pub use client::{
    // ---
    Connection,
    Consumer,
    ConsumerPhase,
    ConsumerStats,
    FlowHint,
    LinkState,
    ListenerError,
    Message,
    MessageListener,
    Outcome,
    Producer,
    Request,
    RequestHandle,
    RequestRegistry,
    RetryDecision,
    RetrySignal,
    RetryValidator,
    Session,
    TimeoutSweeper,
};

pub use client_config::ClientConfig;
pub use connection_builder::ConnectionBuilder;

pub use correlation::{ConnectionId, ConsumerId, SlotId, TargetSelector};
pub use error::{Result, RpcError};
pub use recent_set::RecentSet;
pub use slot_table::SlotTable;

pub use transport::{MemoryRouter, MemoryTransport};

// --- public re-exports
pub use domain::{
    //
    AckMode,
    AckTarget,
    ClientRequest,
    DeliveryJob,
    Failure,
    FailureKind,
    Frame,
    Inbound,
    Push,
    Reply,
    ReplyBody,
    Transport,
    TransportEvent,
    TransportListener,
    TransportPtr,
};
