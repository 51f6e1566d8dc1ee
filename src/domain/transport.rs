// src/domain/transport.rs

//! Transport domain abstractions.
//!
//! This module defines internal domain abstractions used by the client
//! runtime to exchange frames with a router. It intentionally avoids any
//! reference to concrete protocols, sockets, or TLS.
//!
//! The transport is responsible only for carrying opaque frames out and for
//! feeding inbound replies and pushes back in, from exactly one delivery
//! thread per physical connection. Higher-level semantics such as
//! correlation, retries, timeouts, prefetching and acknowledgment are handled
//! elsewhere.
//!
//! Concrete implementations of this interface live under `src/transport/`.

use crate::{ConsumerId, Reply, Result, SlotId, TargetSelector};
use bytes::Bytes;
use std::sync::{Arc, Weak};

/// One outbound request.
#[derive(Debug, Clone)]
pub struct Frame {
    /// Slot the reply must be correlated to; `None` when no reply is wanted.
    pub correlation: Option<SlotId>,

    /// Remote session/object the request addresses.
    pub target: TargetSelector,

    /// Encoded request body. Opaque to the transport.
    pub payload: Bytes,
}

/// A message pushed by the router into a consumer's prefetch cache.
///
/// Pushes are unsolicited: they are not replies to any pending request.
#[derive(Debug, Clone)]
pub struct Push {
    /// Consumer the message is destined for.
    pub consumer: ConsumerId,

    /// Router-assigned message index, used for acknowledgment and duplicate
    /// detection.
    pub index: u64,

    /// Set on the last message of a refill batch.
    pub requires_refill: bool,

    /// Message body.
    pub payload: Bytes,
}

/// Inbound traffic handed to the runtime by the delivery thread.
#[derive(Debug, Clone)]
pub enum Inbound {
    Reply(Reply),
    Push(Push),
}

/// Work posted onto the delivery thread via [`Transport::schedule`].
pub type DeliveryJob = Box<dyn FnOnce() + Send + 'static>;

/// Receiver of transport lifecycle and delivery callbacks.
///
/// One method per [`TransportEvent`] variant. All methods are invoked from
/// the transport's delivery thread, never concurrently with each other.
pub trait TransportListener: Send + Sync {
    /// A reply or push arrived.
    fn delivered(&self, inbound: Inbound);

    /// The physical connection dropped.
    fn lost(&self, reason: &str);

    /// The physical connection was re-established after a loss.
    fn reconnected(&self);
}

/// Tagged form of the listener callbacks, used by transports that queue
/// events before handing them to the delivery thread.
#[derive(Debug, Clone)]
pub enum TransportEvent {
    Delivered(Inbound),
    Lost(String),
    Reconnected,
}

impl TransportEvent {
    /// Invoke the listener method matching this variant.
    pub fn notify(self, listener: &dyn TransportListener) {
        // ---
        match self {
            TransportEvent::Delivered(inbound) => listener.delivered(inbound),
            TransportEvent::Lost(reason) => listener.lost(&reason),
            TransportEvent::Reconnected => listener.reconnected(),
        }
    }
}

/// Transport abstraction.
///
/// A `Transport` carries frames to the router and feeds replies, pushes and
/// connection lifecycle events back through a [`TransportListener`].
///
/// Implementations must ensure that:
/// - every listener callback and every scheduled [`DeliveryJob`] runs on a
///   single delivery thread, in submission order;
/// - `dispatch()` never blocks waiting for a reply and never invokes the
///   listener on the caller's thread;
/// - after `close()`, no further callbacks are made.
///
/// The in-memory transport serves as the reference implementation of these
/// semantics.
pub trait Transport: Send + Sync {
    // ---
    /// Identifier of this transport instance, used in log lines.
    fn transport_id(&self) -> &str;

    /// Register the listener and start delivering. The transport holds the
    /// listener weakly; callbacks stop once its owner is dropped.
    fn attach(&self, listener: Weak<dyn TransportListener>) -> Result<()>;

    /// Send a frame to the router.
    fn dispatch(&self, frame: Frame) -> Result<()>;

    /// Run `job` on the delivery thread after all previously queued events.
    fn schedule(&self, job: DeliveryJob) -> Result<()>;

    /// Close the transport and release any associated resources.
    fn close(&self) -> Result<()>;
}

/// Shared transport pointer.
///
/// This is an `Arc<dyn Transport>`, which means:
/// - `.clone()` is cheap (only increments a reference count)
/// - Multiple clones share the same underlying connection
/// - Used to erase concrete transport types behind a stable domain interface.
pub type TransportPtr = Arc<dyn Transport>;
