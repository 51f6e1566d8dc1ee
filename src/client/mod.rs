// src/client/mod.rs
//! Client runtime.
//!
//! # Architecture
//!
//! A [`Connection`] owns one [`RequestRegistry`] and is the listener of one
//! transport. Callers block in [`RequestRegistry::submit`] until the
//! transport's delivery thread hands the matching reply to
//! [`RequestRegistry::complete`]. Messages pushed by the router are routed by
//! consumer id into the consumer's prefetch cache, from where blocking
//! receivers or a registered listener pick them up.
//!
//! # Concurrency
//!
//! Arbitrary caller threads submit, receive and acknowledge; exactly one
//! delivery thread per connection completes requests and feeds consumers.
//! All waiting is done with condition variables; nothing here assumes an
//! async runtime.

mod connection;
mod consumer;
mod pending;
mod producer;
mod request;
mod retry;
mod session;
mod sweeper;

pub use connection::{Connection, LinkState};
pub use consumer::{
    // ---
    Consumer,
    ConsumerPhase,
    ConsumerStats,
    ListenerError,
    Message,
    MessageListener,
};
pub use pending::RequestRegistry;
pub use producer::{FlowHint, Producer};
pub use request::{Outcome, Request, RequestHandle};
pub use retry::{RetryDecision, RetrySignal, RetryValidator};
pub use session::Session;
pub use sweeper::TimeoutSweeper;

use std::cell::Cell;
use std::sync::{Condvar, Mutex, MutexGuard};

/// Acquire a mutex guard, intentionally ignoring poisoning.
///
/// Mutex poisoning indicates that another thread panicked while holding the
/// lock. Listener panics are caught before they can unwind through runtime
/// locks, so a poisoned lock here means a bug elsewhere; continuing with the
/// inner state is preferable to taking the delivery thread down with it.
pub(crate) fn lock_ignore_poison<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    match m.lock() {
        Ok(guard) => guard,
        Err(poisoned) => poisoned.into_inner(),
    }
}

/// Condition wait with the same poisoning policy as [`lock_ignore_poison`].
pub(crate) fn wait_ignore_poison<'a, T>(cv: &Condvar, guard: MutexGuard<'a, T>) -> MutexGuard<'a, T> {
    match cv.wait(guard) {
        Ok(guard) => guard,
        Err(poisoned) => poisoned.into_inner(),
    }
}

thread_local! {
    static IN_DELIVERY: Cell<bool> = const { Cell::new(false) };
}

/// Marks the current thread as a transport delivery thread while alive.
///
/// A reply-required request issued from the delivery thread could never be
/// completed (the thread that would deliver its reply is the one blocked),
/// so code that may run inside listener callbacks checks
/// [`on_delivery_thread`] and downgrades to fire-and-forget.
pub(crate) struct DeliveryScope {
    previous: bool,
}

impl DeliveryScope {
    pub(crate) fn enter() -> Self {
        Self {
            previous: IN_DELIVERY.with(|flag| flag.replace(true)),
        }
    }
}

impl Drop for DeliveryScope {
    fn drop(&mut self) {
        IN_DELIVERY.with(|flag| flag.set(self.previous));
    }
}

pub(crate) fn on_delivery_thread() -> bool {
    IN_DELIVERY.with(|flag| flag.get())
}
