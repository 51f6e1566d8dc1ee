//! Request descriptor and its completion ticket.
//!
//! A [`Request`] is what a caller hands to
//! [`RequestRegistry::submit`](crate::RequestRegistry::submit). The ticket
//! inside it is the per-request waiter: the submitting thread blocks on it,
//! and the delivery thread, the timeout sweep, `cancel`, `fail_all` and
//! `retry_all` resolve or re-arm it.

use super::{lock_ignore_poison, wait_ignore_poison};
use crate::{ClientRequest, Reply, Result, RetryValidator, RpcError, SlotId, TargetSelector};
use bytes::Bytes;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Condvar, Mutex};

static NEXT_REQUEST_ID: AtomicU64 = AtomicU64::new(1);

/// Terminal result of [`RequestRegistry::submit`](crate::RequestRegistry::submit).
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Outcome {
    /// One-way request handed to the transport; no reply expected.
    Sent,
    /// A reply arrived, or was synthesised by the timeout sweep or by
    /// `fail_all`.
    Replied(Reply),
    /// A retry validator refused resubmission after a reconnect and supplied
    /// this synthetic reply instead.
    Vetoed(Reply),
    /// The request was cancelled; no reply will ever be attached.
    Cancelled,
}

impl Outcome {
    /// Collapse into the reply payload or the matching error.
    ///
    /// A vetoed request that the validator declared successful maps to `Ok`.
    pub fn into_result(self) -> Result<Bytes> {
        match self {
            Outcome::Sent => Ok(Bytes::new()),
            Outcome::Replied(reply) | Outcome::Vetoed(reply) => reply.into_result(),
            Outcome::Cancelled => Err(RpcError::Cancelled),
        }
    }

    pub fn reply(&self) -> Option<&Reply> {
        match self {
            Outcome::Replied(reply) | Outcome::Vetoed(reply) => Some(reply),
            Outcome::Sent | Outcome::Cancelled => None,
        }
    }
}

#[derive(Debug)]
pub(crate) enum TicketState {
    /// Not in the table: not yet submitted, or between a retry wake-up and
    /// resubmission.
    Idle,
    /// Occupying `SlotId` in the registry.
    Pending(SlotId),
    /// Pulled out of the table by `retry_all`; the submitter must re-arm.
    Retrying,
    /// Terminal outcome waiting to be picked up.
    Completed(Outcome),
    /// Terminal outcome already returned to the submitter.
    Consumed,
}

/// What woke the submitting thread.
pub(crate) enum Wake {
    Done(Outcome),
    Retry,
}

pub(crate) struct Ticket {
    pub(crate) id: u64,
    state: Mutex<TicketState>,
    cv: Condvar,
}

impl Ticket {
    fn new() -> Self {
        Self {
            id: NEXT_REQUEST_ID.fetch_add(1, Ordering::Relaxed),
            state: Mutex::new(TicketState::Idle),
            cv: Condvar::new(),
        }
    }

    pub(crate) fn lock(&self) -> std::sync::MutexGuard<'_, TicketState> {
        lock_ignore_poison(&self.state)
    }

    /// Attach a terminal outcome, unless one is already attached.
    pub(crate) fn resolve(&self, outcome: Outcome) -> bool {
        // ---
        let mut state = self.lock();
        match *state {
            TicketState::Completed(_) | TicketState::Consumed => false,
            _ => {
                *state = TicketState::Completed(outcome);
                self.cv.notify_all();
                true
            }
        }
    }

    pub(crate) fn mark_retry(&self) {
        let mut state = self.lock();
        if matches!(*state, TicketState::Pending(_)) {
            *state = TicketState::Retrying;
            self.cv.notify_all();
        }
    }

    pub(crate) fn notify(&self) {
        self.cv.notify_all();
    }

    /// Block until the ticket is resolved or flagged for retry.
    ///
    /// Spurious wake-ups re-enter the wait; only a state change releases the
    /// caller.
    pub(crate) fn wait(&self) -> Wake {
        // ---
        let mut state = self.lock();
        loop {
            match std::mem::replace(&mut *state, TicketState::Consumed) {
                TicketState::Completed(outcome) => return Wake::Done(outcome),
                TicketState::Retrying => {
                    *state = TicketState::Idle;
                    return Wake::Retry;
                }
                other => {
                    *state = other;
                    state = wait_ignore_poison(&self.cv, state);
                }
            }
        }
    }
}

/// Outbound request: target, payload, reply policy and retry hook.
pub struct Request {
    // ---
    pub(crate) target: TargetSelector,
    pub(crate) payload: Bytes,
    pub(crate) reply_required: bool,
    pub(crate) validator: Option<Arc<dyn RetryValidator>>,
    pub(crate) retried: bool,
    pub(crate) vetoed: bool,
    pub(crate) slot: Option<SlotId>,
    pub(crate) ticket: Arc<Ticket>,
}

impl Request {
    /// Create a request that waits for a reply.
    pub fn new(target: TargetSelector, payload: Bytes) -> Self {
        Self {
            target,
            payload,
            reply_required: true,
            validator: None,
            retried: false,
            vetoed: false,
            slot: None,
            ticket: Arc::new(Ticket::new()),
        }
    }

    /// Create a fire-and-forget request.
    pub fn one_way(target: TargetSelector, payload: Bytes) -> Self {
        Self::new(target, payload).with_reply(false)
    }

    /// Encode a runtime request body addressed to `target`.
    pub fn encode(target: TargetSelector, body: &ClientRequest) -> Result<Self> {
        Ok(Self::new(target, body.encode()?))
    }

    pub fn with_reply(mut self, reply_required: bool) -> Self {
        self.reply_required = reply_required;
        self
    }

    /// Install the hook consulted before this request is resubmitted after a
    /// reconnect.
    pub fn with_validator(mut self, validator: Arc<dyn RetryValidator>) -> Self {
        self.validator = Some(validator);
        self
    }

    /// Process-unique request id.
    pub fn id(&self) -> u64 {
        self.ticket.id
    }

    pub fn target(&self) -> TargetSelector {
        self.target
    }

    /// Rewrite the target, typically from a retry validator after the remote
    /// side renumbered its objects.
    pub fn set_target(&mut self, target: TargetSelector) {
        self.target = target;
    }

    pub fn payload(&self) -> &Bytes {
        &self.payload
    }

    pub fn reply_required(&self) -> bool {
        self.reply_required
    }

    /// True once the request has been flagged for retry at least once.
    pub fn was_retried(&self) -> bool {
        self.retried
    }

    /// True if a validator refused resubmission.
    pub fn was_vetoed(&self) -> bool {
        self.vetoed
    }

    /// Slot of the most recent submission.
    pub fn slot(&self) -> Option<SlotId> {
        self.slot
    }

    /// Handle through which another thread can cancel this request.
    pub fn handle(&self) -> RequestHandle {
        RequestHandle {
            ticket: self.ticket.clone(),
        }
    }
}

impl fmt::Debug for Request {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Request")
            .field("id", &self.ticket.id)
            .field("target", &self.target)
            .field("reply_required", &self.reply_required)
            .field("retried", &self.retried)
            .field("slot", &self.slot)
            .finish()
    }
}

/// Cloneable reference to a submitted request, used for
/// [`RequestRegistry::cancel`](crate::RequestRegistry::cancel).
#[derive(Clone)]
pub struct RequestHandle {
    pub(crate) ticket: Arc<Ticket>,
}

impl RequestHandle {
    pub fn id(&self) -> u64 {
        self.ticket.id
    }
}

impl fmt::Debug for RequestHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RequestHandle")
            .field("id", &self.ticket.id)
            .finish()
    }
}
