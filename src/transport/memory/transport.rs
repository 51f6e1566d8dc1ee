// src/transport/memory/transport.rs

//! In-memory transport implementation.
//!
//! This file contains the concrete implementation of the domain-level
//! `Transport` trait on top of a [`MemoryRouter`].
//!
//! The memory transport is the **reference implementation** of transport
//! semantics. Other transports are expected to approximate this behavior
//! as closely as their underlying systems allow and to document any
//! unavoidable deviations.

use super::router::MemoryRouter;
use crate::client::lock_ignore_poison;
use crate::{
    // ---
    log_debug,
    DeliveryJob,
    Frame,
    Result,
    RpcError,
    Transport,
    TransportEvent,
    TransportListener,
};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc::{self, Receiver, Sender};
use std::sync::{Arc, Mutex, Weak};
use std::thread::{self, JoinHandle};

/// Work item for the delivery thread.
pub(super) enum Queued {
    Event(TransportEvent),
    Job(DeliveryJob),
    Stop,
}

/// In-memory transport.
///
/// One link into a [`MemoryRouter`], created by [`MemoryRouter::connect`].
///
/// ## Semantics
///
/// - `dispatch()` applies the frame to the router before it returns.
/// - Replies, pushes, lifecycle events and scheduled jobs run on one
///   delivery thread, started by `attach()`, strictly in order.
/// - Connection loss and reconnect are driven explicitly by
///   [`simulate_loss`](Self::simulate_loss) and
///   [`simulate_reconnect`](Self::simulate_reconnect).
///
/// ## Non-Goals
///
/// - Persistence or durability
/// - Network timing
/// - Exact emulation of any particular router's wire protocol
pub struct MemoryTransport {
    // ---
    name: String,
    link: u64,
    router: Arc<MemoryRouter>,
    outbox: Sender<Queued>,
    inbox: Mutex<Option<Receiver<Queued>>>,
    worker: Mutex<Option<JoinHandle<()>>>,
    closed: AtomicBool,
}

impl MemoryTransport {
    pub(super) fn open(router: Arc<MemoryRouter>, name: String) -> Arc<Self> {
        // ---
        let (outbox, inbox) = mpsc::channel();
        let link = router.register_link(&name, outbox.clone());
        Arc::new(Self {
            name,
            link,
            router,
            outbox,
            inbox: Mutex::new(Some(inbox)),
            worker: Mutex::new(None),
            closed: AtomicBool::new(false),
        })
    }

    /// Drop the connection. The router forgets this link's sessions and
    /// consumers and the listener is told the link is lost.
    pub fn simulate_loss(&self, reason: &str) {
        self.router.lose(self.link, reason);
    }

    /// Restore a lost connection; the listener is told it reconnected.
    pub fn simulate_reconnect(&self) {
        self.router.restore(self.link);
    }

    /// While set, the router applies requests but never answers them.
    pub fn set_reply_drop(&self, drop: bool) {
        self.router.set_reply_drop(self.link, drop);
    }

    fn ensure_open(&self) -> Result<()> {
        if self.closed.load(Ordering::Acquire) {
            return Err(RpcError::Transport(format!("{} is closed", self.name)));
        }
        Ok(())
    }
}

fn delivery_loop(name: String, inbox: Receiver<Queued>, listener: Weak<dyn TransportListener>) {
    // ---
    log_debug!("{name}: delivery thread started");
    while let Ok(queued) = inbox.recv() {
        match queued {
            Queued::Event(event) => {
                let Some(listener) = listener.upgrade() else {
                    break;
                };
                event.notify(listener.as_ref());
            }
            Queued::Job(job) => job(),
            Queued::Stop => break,
        }
    }
    log_debug!("{name}: delivery thread stopped");
}

impl Transport for MemoryTransport {
    fn transport_id(&self) -> &str {
        &self.name
    }

    fn attach(&self, listener: Weak<dyn TransportListener>) -> Result<()> {
        // ---
        self.ensure_open()?;
        let inbox = lock_ignore_poison(&self.inbox)
            .take()
            .ok_or_else(|| RpcError::IllegalState(format!("{} already attached", self.name)))?;

        let name = self.name.clone();
        let handle = thread::Builder::new()
            .name(format!("mom-queue-delivery-{}", self.name))
            .spawn(move || delivery_loop(name, inbox, listener))
            .map_err(|err| RpcError::Transport(format!("spawning delivery thread: {err}")))?;

        *lock_ignore_poison(&self.worker) = Some(handle);
        Ok(())
    }

    fn dispatch(&self, frame: Frame) -> Result<()> {
        self.ensure_open()?;
        self.router.handle(self.link, frame)
    }

    fn schedule(&self, job: DeliveryJob) -> Result<()> {
        // ---
        self.ensure_open()?;
        self.outbox
            .send(Queued::Job(job))
            .map_err(|_| RpcError::Transport(format!("{}: delivery thread stopped", self.name)))
    }

    fn close(&self) -> Result<()> {
        // ---
        if self.closed.swap(true, Ordering::AcqRel) {
            return Ok(());
        }
        self.router.disconnect(self.link);
        let _ = self.outbox.send(Queued::Stop);

        let worker = lock_ignore_poison(&self.worker).take();
        if let Some(worker) = worker {
            // Closing from inside a callback must not join its own thread.
            if worker.thread().id() != thread::current().id() {
                let _ = worker.join();
            }
        }
        Ok(())
    }
}

impl Drop for MemoryTransport {
    fn drop(&mut self) {
        let _ = self.close();
    }
}
