// src/transport/memory/mod.rs

//! In-memory transport implementation.
//!
//! This module provides a pure in-process implementation of the domain-level
//! `Transport` trait together with the router it talks to. It is intended
//! primarily for testing, local execution, and as a reference for transport
//! semantics.
//!
//! ## Reference Semantics
//!
//! The in-memory transport defines the **reference behavior** for the transport
//! layer. All other transport implementations are expected to approximate this
//! behavior as closely as their underlying systems allow and to document any
//! unavoidable deviations.
//!
//! In particular, the in-memory transport establishes the following expectations:
//!
//! - Replies, pushes, lifecycle events and scheduled jobs reach the client on
//!   one delivery thread per connection, in the order they were produced.
//! - A refill grants credit; the message that exhausts it carries
//!   `requires_refill`.
//! - Messages pushed but not yet acknowledged are redelivered, with their
//!   original index, when the consumer closes or its connection drops.
//!
//! ## Non-Goals
//!
//! This transport does not attempt to emulate persistence, network timing or
//! the wire format of any specific router. Connection loss exists only as
//! explicit fault injection.

mod router;
mod transport;

pub use router::MemoryRouter;
pub use transport::MemoryTransport;
