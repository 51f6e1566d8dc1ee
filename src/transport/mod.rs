//! Transport implementations.
//!
//! This module provides concrete implementations of the domain-level
//! `Transport` trait. Only the in-memory router ships with the crate; other
//! transports implement the same trait outside it.
//!
//! Domain code must not depend on transport-specific types.

mod memory;

pub use memory::{MemoryRouter, MemoryTransport};
