//! Correlation and retry engine.
//!
//! [`RequestRegistry`] tracks every request that waits for a reply. Each one
//! occupies a slot of a [`SlotTable`]; the slot id travels with the frame and
//! comes back on the reply, which is how the delivery thread finds the
//! blocked caller. Replies are matched by slot identity only, never by
//! arrival order.
//!
//! Every terminal path (reply, timeout sweep, cancel, `fail_all`, validator
//! veto) goes through the registry lock and re-reads slot occupancy before
//! mutating, so when two of them race for the same request the first one
//! wins and the others become no-ops.

use super::lock_ignore_poison;
use super::request::{Ticket, TicketState, Wake};
use crate::{
    // ---
    log_debug,
    log_info,
    log_warn,
    Failure,
    FailureKind,
    Frame,
    Outcome,
    Reply,
    Request,
    RequestHandle,
    Result,
    RetryDecision,
    RetrySignal,
    RpcError,
    SlotId,
    SlotTable,
    TransportPtr,
};
use bytes::Bytes;
use std::collections::HashSet;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::{Duration, Instant};

/// Per-slot bookkeeping of one in-flight request.
struct PendingEntry {
    ticket: Arc<Ticket>,
    deadline: Option<Instant>,
}

struct RegistryState {
    // ---
    slots: SlotTable<PendingEntry>,

    // Requests pulled out of the table by `retry_all` that have not yet
    // reached a terminal outcome.
    retrying: HashSet<u64>,
    retry_signals: Vec<RetrySignal>,

    // Set by `fail_all(.., true)`; new submissions fail fast until `reset`.
    invalid: Option<String>,

    // Connection lost, reconnect expected: dispatch failures keep requests
    // pending instead of failing them.
    suspended: bool,
}

impl RegistryState {
    /// Forget `id` as a retrying request; release waiting signals if it was
    /// the last one.
    fn settle_retry(&mut self, id: u64) {
        // ---
        if self.retrying.remove(&id) && self.retrying.is_empty() {
            for signal in self.retry_signals.drain(..) {
                signal.release();
            }
        }
    }

    fn finish(&mut self, entry: PendingEntry, outcome: Outcome) {
        self.settle_retry(entry.ticket.id);
        entry.ticket.resolve(outcome);
    }
}

enum Armed {
    Slot(SlotId),
    Finished(Outcome),
}

/// Registry of in-flight requests for one connection.
///
/// Owned by the connection that created it; there is no process-wide
/// instance.
pub struct RequestRegistry {
    // ---
    transport: TransportPtr,
    request_timeout: Option<Duration>,
    retry_timeout_enabled: bool,
    state: Mutex<RegistryState>,
}

impl RequestRegistry {
    /// Create a registry dispatching through `transport`.
    ///
    /// `request_timeout` of `None` disables deadline enforcement. When
    /// `retry_timeout_enabled` is false, resubmitted requests wait without a
    /// deadline.
    pub fn new(
        transport: TransportPtr,
        request_timeout: Option<Duration>,
        retry_timeout_enabled: bool,
    ) -> Self {
        Self {
            transport,
            request_timeout,
            retry_timeout_enabled,
            state: Mutex::new(RegistryState {
                slots: SlotTable::new(),
                retrying: HashSet::new(),
                retry_signals: Vec::new(),
                invalid: None,
                suspended: false,
            }),
        }
    }

    fn lock(&self) -> MutexGuard<'_, RegistryState> {
        lock_ignore_poison(&self.state)
    }

    /// Submit a request.
    ///
    /// One-way requests are dispatched and return [`Outcome::Sent`]
    /// immediately. Otherwise the calling thread blocks until exactly one of
    /// reply, timeout, cancellation, connection failure or validator veto
    /// occurs. A request caught by a reconnect is resubmitted transparently
    /// (after consulting its validator, if any) and the caller keeps waiting.
    ///
    /// # Errors
    ///
    /// Returns [`RpcError::ConnectionInvalid`] if the registry was
    /// invalidated by `fail_all`, or the transport error if the initial
    /// dispatch failed while no reconnect was in progress.
    pub fn submit(&self, mut request: Request) -> Result<Outcome> {
        // ---
        if !request.reply_required {
            if let Some(reason) = &self.lock().invalid {
                return Err(RpcError::ConnectionInvalid(reason.clone()));
            }
            self.transport.dispatch(Frame {
                correlation: None,
                target: request.target,
                payload: request.payload.clone(),
            })?;
            return Ok(Outcome::Sent);
        }

        let ticket = request.ticket.clone();

        loop {
            let slot = match self.arm(&mut request)? {
                Armed::Slot(slot) => slot,
                Armed::Finished(outcome) => return Ok(outcome),
            };

            let frame = Frame {
                correlation: Some(slot),
                target: request.target,
                payload: request.payload.clone(),
            };

            if let Err(err) = self.transport.dispatch(frame) {
                if !self.keep_after_dispatch_error(slot, &ticket, &err) {
                    return Err(err);
                }
            }

            match ticket.wait() {
                Wake::Done(outcome) => return Ok(outcome),
                Wake::Retry => {
                    request.retried = true;

                    let validator = request.validator.clone();
                    if let Some(validator) = validator {
                        if let RetryDecision::Veto(failure) = validator.validate(&mut request) {
                            return Ok(self.finish_vetoed(&mut request, failure));
                        }
                    }

                    log_debug!(
                        "request {} resubmitting to {} after reconnect",
                        ticket.id,
                        request.target
                    );
                }
            }
        }
    }

    /// Put the request into a slot, or decide it is already finished.
    fn arm(&self, request: &mut Request) -> Result<Armed> {
        // ---
        let mut state = self.lock();
        let id = request.ticket.id;
        let mut ticket_state = request.ticket.lock();

        if let TicketState::Completed(_) = &*ticket_state {
            // Cancelled before (re)submission.
            let outcome = match std::mem::replace(&mut *ticket_state, TicketState::Consumed) {
                TicketState::Completed(outcome) => outcome,
                _ => Outcome::Cancelled,
            };
            state.settle_retry(id);
            return Ok(Armed::Finished(outcome));
        }

        if let Some(reason) = state.invalid.clone() {
            if !request.retried {
                return Err(RpcError::ConnectionInvalid(reason));
            }
            *ticket_state = TicketState::Consumed;
            state.settle_retry(id);
            let slot = request.slot.unwrap_or_default();
            return Ok(Armed::Finished(Outcome::Replied(Reply::failure(
                slot,
                Failure::new(FailureKind::ConnectionLost, reason),
            ))));
        }

        let deadline = match self.request_timeout {
            Some(_) if request.retried && !self.retry_timeout_enabled => None,
            Some(timeout) => Some(Instant::now() + timeout),
            None => None,
        };

        let slot = state.slots.insert(PendingEntry {
            ticket: request.ticket.clone(),
            deadline,
        });
        *ticket_state = TicketState::Pending(slot);
        request.slot = Some(slot);

        log_debug!("request {id} armed in slot {slot}");
        Ok(Armed::Slot(slot))
    }

    /// Decide what to do after the transport refused a frame. Returns true
    /// if the caller should keep waiting.
    fn keep_after_dispatch_error(&self, slot: SlotId, ticket: &Arc<Ticket>, err: &RpcError) -> bool {
        // ---
        let mut state = self.lock();

        if state.suspended {
            log_debug!("dispatch of slot {slot} failed during reconnect, keeping it pending: {err}");
            return true;
        }

        match state.slots.remove(slot) {
            Some(entry) => {
                state.settle_retry(entry.ticket.id);
                *ticket.lock() = TicketState::Consumed;
                false
            }
            // Someone else already resolved or re-armed it.
            None => true,
        }
    }

    fn finish_vetoed(&self, request: &mut Request, failure: Option<Failure>) -> Outcome {
        // ---
        let mut state = self.lock();
        let id = request.ticket.id;
        state.settle_retry(id);

        let mut ticket_state = request.ticket.lock();
        if let TicketState::Completed(Outcome::Cancelled) = &*ticket_state {
            *ticket_state = TicketState::Consumed;
            return Outcome::Cancelled;
        }
        *ticket_state = TicketState::Consumed;

        request.vetoed = true;
        let slot = request.slot.unwrap_or_default();
        log_info!("request {id} retry vetoed by validator");

        let reply = match failure {
            Some(failure) => Reply::failure(slot, failure),
            None => Reply::success(slot, Bytes::new()),
        };
        Outcome::Vetoed(reply)
    }

    /// Match a reply to its pending request and wake the caller.
    ///
    /// Replies for unknown, freed or recycled slots are ignored; they are
    /// expected after a timeout or a retry already settled the request.
    /// Returns true if the reply was attached.
    pub fn complete(&self, reply: Reply) -> bool {
        // ---
        let mut state = self.lock();
        let slot = reply.slot;

        match state.slots.remove(slot) {
            Some(entry) => {
                state.finish(entry, Outcome::Replied(reply));
                true
            }
            None => {
                log_debug!("no pending request for slot {slot}, reply discarded");
                false
            }
        }
    }

    /// Cancel a request. The caller observes [`Outcome::Cancelled`].
    ///
    /// Returns false if the request already reached a terminal outcome.
    pub fn cancel(&self, handle: &RequestHandle) -> bool {
        // ---
        let mut state = self.lock();
        let ticket = &handle.ticket;
        let mut ticket_state = ticket.lock();

        match &*ticket_state {
            TicketState::Completed(_) | TicketState::Consumed => return false,
            TicketState::Pending(slot) => {
                let slot = *slot;
                state.slots.remove(slot);
            }
            TicketState::Idle | TicketState::Retrying => {}
        }

        *ticket_state = TicketState::Completed(Outcome::Cancelled);
        drop(ticket_state);
        ticket.notify();
        state.settle_retry(ticket.id);

        log_debug!("request {} cancelled", ticket.id);
        true
    }

    /// Fail every pending request with a connection-lost reply carrying
    /// `reason`. With `mark_invalid`, later submissions fail fast until
    /// [`reset`](Self::reset).
    ///
    /// Returns the number of requests failed.
    pub fn fail_all(&self, reason: &str, mark_invalid: bool) -> usize {
        // ---
        let mut state = self.lock();
        state.suspended = false;
        if mark_invalid {
            state.invalid = Some(reason.to_string());
        }

        let drained = state.slots.drain();
        let count = drained.len();
        for (slot, entry) in drained {
            let reply = Reply::failure(slot, Failure::new(FailureKind::ConnectionLost, reason));
            state.finish(entry, Outcome::Replied(reply));
        }

        // Requests between a retry wake-up and resubmission will observe
        // `invalid` (or resubmit) when they re-arm; the retry pass is over.
        state.retrying.clear();
        for signal in state.retry_signals.drain(..) {
            signal.release();
        }

        log_warn!("failed {count} pending requests: {reason}");
        count
    }

    /// Flag every pending request for retry and wake its caller.
    ///
    /// The flagged requests leave the slot table immediately and are tracked
    /// until each reaches a terminal outcome; `signal` is released once the
    /// last of them does (immediately if none were pending).
    ///
    /// Returns the number of requests flagged.
    pub fn retry_all(&self, signal: RetrySignal) -> usize {
        // ---
        let mut state = self.lock();
        state.suspended = false;

        let drained = state.slots.drain();
        let count = drained.len();
        for (_, entry) in drained {
            state.retrying.insert(entry.ticket.id);
            entry.ticket.mark_retry();
        }

        if state.retrying.is_empty() {
            signal.release();
        } else {
            state.retry_signals.push(signal);
        }

        log_info!("flagged {count} pending requests for retry");
        count
    }

    /// Synthesise a timeout reply for every request whose deadline is at or
    /// before `now`. Timed-out requests are never retried.
    ///
    /// Returns the number of requests timed out.
    pub fn sweep_timeouts(&self, now: Instant) -> usize {
        // ---
        let mut state = self.lock();
        let expired = state
            .slots
            .remove_where(|entry| entry.deadline.is_some_and(|deadline| deadline <= now));

        let count = expired.len();
        for (slot, entry) in expired {
            log_info!("request {} in slot {slot} timed out", entry.ticket.id);
            state.finish(entry, Outcome::Replied(Reply::timeout(slot)));
        }
        count
    }

    /// Mark the connection as lost with a reconnect expected. Pending
    /// requests stay pending until `retry_all` or `fail_all`.
    pub fn suspend(&self) {
        self.lock().suspended = true;
    }

    /// Clear the invalid mark left by `fail_all(.., true)`.
    pub fn reset(&self) {
        let mut state = self.lock();
        state.invalid = None;
        state.suspended = false;
    }

    /// Reason the registry was invalidated, if it was.
    pub fn invalid_reason(&self) -> Option<String> {
        self.lock().invalid.clone()
    }

    pub fn is_suspended(&self) -> bool {
        self.lock().suspended
    }

    /// Number of requests occupying a slot.
    pub fn pending_count(&self) -> usize {
        self.lock().slots.len()
    }

    /// Number of requests flagged by `retry_all` and not yet settled.
    pub fn retrying_count(&self) -> usize {
        self.lock().retrying.len()
    }

    pub fn transport(&self) -> &TransportPtr {
        &self.transport
    }
}

#[cfg(test)]
mod tests {
    // ---
    use super::*;
    use crate::test_support::ScriptedTransport;
    use crate::TargetSelector;
    use std::sync::Barrier;
    use std::thread;

    fn registry(timeout: Option<Duration>) -> (Arc<RequestRegistry>, Arc<ScriptedTransport>) {
        let transport = ScriptedTransport::new();
        let registry = Arc::new(RequestRegistry::new(transport.clone(), timeout, true));
        (registry, transport)
    }

    fn submit_in_thread(
        registry: &Arc<RequestRegistry>,
        request: Request,
    ) -> thread::JoinHandle<Result<Outcome>> {
        let registry = registry.clone();
        thread::spawn(move || registry.submit(request))
    }

    fn target() -> TargetSelector {
        TargetSelector::new(1, 1)
    }

    #[test]
    fn test_one_way_returns_immediately() {
        // ---
        let (registry, transport) = registry(None);
        let outcome = registry
            .submit(Request::one_way(target(), Bytes::from_static(b"x")))
            .unwrap();

        assert_eq!(outcome, Outcome::Sent);
        assert_eq!(transport.frames().len(), 1);
        assert!(transport.frames()[0].correlation.is_none());
        assert_eq!(registry.pending_count(), 0);
    }

    #[test]
    fn test_reply_wakes_caller() {
        // ---
        let (registry, transport) = registry(None);
        let caller = submit_in_thread(&registry, Request::new(target(), Bytes::new()));

        let slot = transport.wait_for_frame(0).correlation.unwrap();
        assert_eq!(slot, SlotId::new(0, 0));
        assert!(registry.complete(Reply::success(slot, Bytes::from_static(b"ok"))));

        let outcome = caller.join().unwrap().unwrap();
        assert_eq!(outcome.into_result().unwrap(), Bytes::from_static(b"ok"));
        assert_eq!(registry.pending_count(), 0);
    }

    #[test]
    fn test_concurrent_duplicate_reply_single_winner() {
        // ---
        let (registry, transport) = registry(None);
        let caller = submit_in_thread(&registry, Request::new(target(), Bytes::new()));
        let slot = transport.wait_for_frame(0).correlation.unwrap();

        let barrier = Arc::new(Barrier::new(2));
        let racers: Vec<_> = (0..2)
            .map(|_| {
                let registry = registry.clone();
                let barrier = barrier.clone();
                thread::spawn(move || {
                    barrier.wait();
                    registry.complete(Reply::success(slot, Bytes::new()))
                })
            })
            .collect();

        let wins: usize = racers
            .into_iter()
            .map(|racer| racer.join().unwrap() as usize)
            .sum();
        assert_eq!(wins, 1);
        assert!(matches!(caller.join().unwrap().unwrap(), Outcome::Replied(_)));
    }

    #[test]
    fn test_stale_reply_does_not_reach_reused_slot() {
        // ---
        let (registry, transport) = registry(None);

        let first = submit_in_thread(&registry, Request::new(target(), Bytes::new()));
        let old_slot = transport.wait_for_frame(0).correlation.unwrap();
        registry.complete(Reply::success(old_slot, Bytes::from_static(b"first")));
        first.join().unwrap().unwrap();

        let second = submit_in_thread(&registry, Request::new(target(), Bytes::new()));
        let new_slot = transport.wait_for_frame(1).correlation.unwrap();
        assert_eq!(new_slot.index, old_slot.index);

        // Late duplicate of the first reply.
        assert!(!registry.complete(Reply::success(old_slot, Bytes::from_static(b"stale"))));
        assert_eq!(registry.pending_count(), 1);

        registry.complete(Reply::success(new_slot, Bytes::from_static(b"second")));
        let payload = second.join().unwrap().unwrap().into_result().unwrap();
        assert_eq!(payload, Bytes::from_static(b"second"));
    }

    #[test]
    fn test_sweep_times_out_and_is_terminal() {
        // ---
        let (registry, transport) = registry(Some(Duration::from_secs(5)));
        let caller = submit_in_thread(&registry, Request::new(target(), Bytes::new()));
        let slot = transport.wait_for_frame(0).correlation.unwrap();

        assert_eq!(registry.sweep_timeouts(Instant::now()), 0);
        assert_eq!(
            registry.sweep_timeouts(Instant::now() + Duration::from_secs(10)),
            1
        );

        let outcome = caller.join().unwrap().unwrap();
        assert!(outcome.reply().unwrap().is_timeout());

        // The reply racing the sweep is a no-op, and a reconnect does not
        // resurrect the timed-out request.
        assert!(!registry.complete(Reply::success(slot, Bytes::new())));
        assert_eq!(registry.retry_all(RetrySignal::new()), 0);
        assert_eq!(transport.frames().len(), 1);
    }

    #[test]
    fn test_cancel_is_distinct_from_failure() {
        // ---
        let (registry, transport) = registry(None);
        let request = Request::new(target(), Bytes::new());
        let handle = request.handle();
        let caller = submit_in_thread(&registry, request);
        let slot = transport.wait_for_frame(0).correlation.unwrap();

        assert!(registry.cancel(&handle));
        assert!(!registry.cancel(&handle));
        assert_eq!(caller.join().unwrap().unwrap(), Outcome::Cancelled);
        assert!(!registry.complete(Reply::success(slot, Bytes::new())));
    }

    #[test]
    fn test_fail_all_unblocks_everyone_without_retry() {
        // ---
        let (registry, transport) = registry(None);
        let callers: Vec<_> = (0..3)
            .map(|_| submit_in_thread(&registry, Request::new(target(), Bytes::new())))
            .collect();
        transport.wait_for_frame(2);

        assert_eq!(registry.fail_all("connection reset", true), 3);

        for caller in callers {
            let err = caller.join().unwrap().unwrap().into_result().unwrap_err();
            assert!(matches!(err, RpcError::ConnectionLost(reason) if reason == "connection reset"));
        }
        assert_eq!(transport.frames().len(), 3);

        // Fail fast until reset.
        let err = registry
            .submit(Request::new(target(), Bytes::new()))
            .unwrap_err();
        assert!(matches!(err, RpcError::ConnectionInvalid(_)));

        registry.reset();
        assert!(registry.invalid_reason().is_none());
    }

    #[test]
    fn test_retry_without_validator_resubmits() {
        // ---
        let (registry, transport) = registry(None);
        let caller = submit_in_thread(&registry, Request::new(target(), Bytes::new()));
        let first = transport.wait_for_frame(0).correlation.unwrap();

        let signal = RetrySignal::new();
        assert_eq!(registry.retry_all(signal.clone()), 1);

        let second = transport.wait_for_frame(1).correlation.unwrap();
        assert_ne!(first, second);
        assert!(!signal.is_released());

        registry.complete(Reply::success(second, Bytes::new()));
        assert!(caller.join().unwrap().unwrap().reply().unwrap().is_success());
        assert!(signal.wait_timeout(Duration::from_secs(1)));
        assert_eq!(registry.retrying_count(), 0);
    }

    #[test]
    fn test_retry_with_veto_and_rewrite() {
        // ---
        let (registry, transport) = registry(None);

        let vetoing = Request::new(TargetSelector::new(7, 1), Bytes::from_static(b"veto"))
            .with_validator(Arc::new(|_: &mut Request| {
                RetryDecision::Veto(Some(Failure::new(FailureKind::Vetoed, "session gone")))
            }));
        let rewriting = Request::new(TargetSelector::new(7, 2), Bytes::from_static(b"rewrite"))
            .with_validator(Arc::new(|req: &mut Request| {
                req.set_target(TargetSelector::new(8, req.target().object));
                RetryDecision::Resubmit
            }));

        let vetoed = submit_in_thread(&registry, vetoing);
        let rewritten = submit_in_thread(&registry, rewriting);
        transport.wait_for_frame(1);

        let signal = RetrySignal::new();
        assert_eq!(registry.retry_all(signal.clone()), 2);

        // Only the rewriting request is dispatched again, to the new target.
        let resent = transport.wait_for_frame(2);
        assert_eq!(resent.target, TargetSelector::new(8, 2));
        assert_eq!(resent.payload, Bytes::from_static(b"rewrite"));

        let outcome = vetoed.join().unwrap().unwrap();
        assert!(matches!(outcome, Outcome::Vetoed(_)));
        assert!(matches!(outcome.into_result(), Err(RpcError::Vetoed(_))));
        assert!(!signal.is_released());

        registry.complete(Reply::success(resent.correlation.unwrap(), Bytes::new()));
        assert!(matches!(rewritten.join().unwrap().unwrap(), Outcome::Replied(_)));
        assert!(signal.wait_timeout(Duration::from_secs(1)));
        assert_eq!(transport.frames().len(), 3);
    }

    #[test]
    fn test_retry_all_with_nothing_pending_releases_signal() {
        // ---
        let (registry, _transport) = registry(None);
        let signal = RetrySignal::new();
        assert_eq!(registry.retry_all(signal.clone()), 0);
        assert!(signal.is_released());
    }

    #[test]
    fn test_dispatch_failure_during_reconnect_keeps_pending() {
        // ---
        let (registry, transport) = registry(None);
        transport.fail_dispatch(true);

        // Without a reconnect in progress the error surfaces.
        let err = registry
            .submit(Request::new(target(), Bytes::new()))
            .unwrap_err();
        assert!(matches!(err, RpcError::Transport(_)));
        assert_eq!(registry.pending_count(), 0);

        registry.suspend();
        let caller = submit_in_thread(&registry, Request::new(target(), Bytes::new()));
        transport.wait_for_attempts(2);
        assert_eq!(registry.pending_count(), 1);

        transport.fail_dispatch(false);
        registry.retry_all(RetrySignal::new());
        let slot = transport.wait_for_frame(0).correlation.unwrap();
        registry.complete(Reply::success(slot, Bytes::new()));

        assert!(matches!(caller.join().unwrap().unwrap(), Outcome::Replied(_)));
    }

    #[test]
    fn test_retry_without_deadline_when_retry_timeout_disabled() {
        // ---
        let transport = ScriptedTransport::new();
        let registry = Arc::new(RequestRegistry::new(
            transport.clone(),
            Some(Duration::from_millis(5)),
            false,
        ));

        let caller = submit_in_thread(&registry, Request::new(target(), Bytes::new()));
        transport.wait_for_frame(0);
        registry.retry_all(RetrySignal::new());
        let slot = transport.wait_for_frame(1).correlation.unwrap();

        assert_eq!(
            registry.sweep_timeouts(Instant::now() + Duration::from_secs(60)),
            0
        );
        registry.complete(Reply::success(slot, Bytes::new()));
        assert!(caller.join().unwrap().unwrap().reply().unwrap().is_success());
    }
}
