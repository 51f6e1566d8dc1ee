//! Message producer.

use super::session::SessionShared;
use crate::{log_debug, ClientRequest, Result, RpcError};
use bytes::Bytes;
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::Duration;

/// Source of the back-pressure delay applied after each send.
///
/// The router computes the delay from queue backlog and throughput; the
/// producer only sleeps on it.
pub trait FlowHint: Send + Sync {
    fn delay(&self) -> Duration;
}

/// A fixed delay.
impl FlowHint for Duration {
    fn delay(&self) -> Duration {
        *self
    }
}

/// Sends messages to one destination through its session.
pub struct Producer {
    // ---
    session: Arc<SessionShared>,
    destination: String,
    flow_hint: Option<Arc<dyn FlowHint>>,
    closed: AtomicBool,
}

impl Producer {
    pub(crate) fn new(session: Arc<SessionShared>, destination: String) -> Self {
        Self {
            session,
            destination,
            flow_hint: None,
            closed: AtomicBool::new(false),
        }
    }

    /// Install a flow hint provider consulted after every send.
    pub fn with_flow_hint(mut self, hint: Arc<dyn FlowHint>) -> Self {
        self.flow_hint = Some(hint);
        self
    }

    pub fn destination(&self) -> &str {
        &self.destination
    }

    /// Send `payload` and wait for the router to accept it, then sleep for
    /// the flow hint's delay, if any.
    pub fn send(&self, payload: impl Into<Bytes>) -> Result<()> {
        // ---
        if self.closed.load(Ordering::Acquire) {
            return Err(RpcError::Closed);
        }
        self.session.ensure_open()?;

        let body = ClientRequest::Produce {
            destination: self.destination.clone(),
            payload: payload.into(),
        };
        self.session.call(self.session.target(), &body)?;

        if let Some(hint) = &self.flow_hint {
            let delay = hint.delay();
            if !delay.is_zero() {
                log_debug!("producer on {}: flow control delay {delay:?}", self.destination);
                thread::sleep(delay);
            }
        }
        Ok(())
    }

    /// Mark the producer closed. Later sends fail with [`RpcError::Closed`].
    pub fn close(&self) {
        self.closed.store(true, Ordering::Release);
    }
}

impl fmt::Debug for Producer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Producer")
            .field("session", &self.session.id())
            .field("destination", &self.destination)
            .finish()
    }
}
