//! Consumer delivery pipeline.
//!
//! Every consumer owns a bounded prefetch cache that the router fills in
//! batches. The router marks the last message of each batch with
//! `requires_refill`; dequeuing that message issues the next refill, which
//! keeps a rolling window of at most one outstanding refill per consumer.
//!
//! Messages leave the cache either through a blocking receiver on a caller
//! thread or through a registered [`MessageListener`] invoked on the
//! transport's delivery thread. Both paths share the same hand-off step:
//! duplicate suppression, the delivery report for client-acknowledged and
//! transacted consumers, and the automatic acknowledgment in auto mode.
//!
//! All consumer state lives behind one mutex; phase changes are the only way
//! the pipeline mutates its flags.

use super::session::SessionShared;
use super::{lock_ignore_poison, on_delivery_thread, wait_ignore_poison, DeliveryScope};
use crate::{
    // ---
    log_debug,
    log_error,
    log_info,
    log_warn,
    AckMode,
    AckTarget,
    ClientConfig,
    ClientRequest,
    ConsumerId,
    Failure,
    FailureKind,
    Push,
    RecentSet,
    Request,
    RequestRegistry,
    Result,
    RetryDecision,
    RpcError,
    TargetSelector,
};
use bytes::Bytes;
use std::any::Any;
use std::collections::VecDeque;
use std::fmt;
use std::panic::{self, AssertUnwindSafe};
use std::sync::{Arc, Condvar, Mutex, MutexGuard, Weak};
use std::time::{Duration, Instant};

/// Lifecycle of a consumer.
///
/// `Created → Active ⇄ Refilling → Closing → Closed`; `Cancelled` is reached
/// directly from any non-terminal phase when the connection is lost for good.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConsumerPhase {
    /// No refill issued yet.
    Created,
    /// Started, no refill outstanding.
    Active,
    /// A refill is outstanding.
    Refilling,
    /// `close` is in progress.
    Closing,
    Closed,
    Cancelled,
}

impl ConsumerPhase {
    pub fn is_terminal(self) -> bool {
        matches!(self, ConsumerPhase::Closed | ConsumerPhase::Cancelled)
    }

    fn accepts_messages(self) -> bool {
        matches!(
            self,
            ConsumerPhase::Created | ConsumerPhase::Active | ConsumerPhase::Refilling
        )
    }
}

/// Per-consumer counters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ConsumerStats {
    /// Messages handed to a receiver or listener.
    pub delivered: u64,
    /// Messages dropped by the duplicate window.
    pub suppressed: u64,
    /// Refill requests issued.
    pub refills: u64,
    /// Automatic acknowledgments the router did not confirm.
    pub failed_acks: u64,
}

/// A message handed to application code.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Message {
    consumer: ConsumerId,
    index: u64,
    payload: Bytes,
}

impl Message {
    pub fn consumer(&self) -> ConsumerId {
        self.consumer
    }

    /// Router-assigned index, the value to pass to
    /// [`Consumer::acknowledge`] as [`AckTarget::Index`].
    pub fn index(&self) -> u64 {
        self.index
    }

    pub fn payload(&self) -> &Bytes {
        &self.payload
    }

    pub fn into_payload(self) -> Bytes {
        self.payload
    }

    pub fn ack_target(&self) -> AckTarget {
        AckTarget::Index(self.index)
    }
}

/// Error a listener may return to reject a message.
pub type ListenerError = Box<dyn std::error::Error + Send + Sync>;

/// Push-mode message handler.
///
/// Invoked on the transport's delivery thread, in arrival order. Returning
/// an error (or panicking) closes the consumer; the delivery thread and the
/// other consumers sharing it are unaffected.
pub trait MessageListener: Send + Sync {
    fn on_message(&self, message: Message) -> std::result::Result<(), ListenerError>;
}

impl<F> MessageListener for F
where
    F: Fn(Message) -> std::result::Result<(), ListenerError> + Send + Sync,
{
    fn on_message(&self, message: Message) -> std::result::Result<(), ListenerError> {
        self(message)
    }
}

/// Prefetch and duplicate-window settings, resolved from [`ClientConfig`].
#[derive(Debug, Clone)]
pub(crate) struct Prefetch {
    pub(crate) messages: usize,
    pub(crate) bytes: Option<usize>,
    /// `None` when duplicate detection is disabled.
    pub(crate) duplicate_window: Option<usize>,
    pub(crate) no_wait_grace: Duration,
}

impl Prefetch {
    pub(crate) fn from_config(config: &ClientConfig) -> Self {
        Self {
            messages: config.prefetch_messages,
            bytes: config.prefetch_bytes,
            duplicate_window: config
                .duplicate_detection
                .then_some(config.duplicate_window),
            no_wait_grace: config.receive_no_wait_grace,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
struct DuplicateKey {
    consumer: ConsumerId,
    index: u64,
}

struct CacheEntry {
    index: u64,
    payload: Bytes,
    requires_refill: bool,
}

struct ConsumerState {
    // ---
    phase: ConsumerPhase,
    cache: VecDeque<CacheEntry>,
    seen: Option<RecentSet<DuplicateKey>>,
    listener: Option<Arc<dyn MessageListener>>,

    // Threads currently inside a blocking receive.
    receivers: usize,
    // The first `receive_no_wait` grace period has been spent.
    grace_used: bool,
    // A backlog drain is queued on the delivery thread.
    drain_scheduled: bool,
    // Hand-offs taken off the cache so far; numbers the send turns.
    dequeued: u64,

    close_reason: Option<String>,
    stats: ConsumerStats,
}

/// Result of taking one entry off the cache, acted upon after the consumer
/// lock is released.
struct Handoff {
    turn: u64,
    message: Option<Message>,
    suppressed: Option<u64>,
    refill: Option<ClientRequest>,
}

/// Position of a hand-off in dequeue order. While held, no later hand-off
/// of the same consumer sends its delivery report or acknowledgment.
struct SendTurn<'a> {
    shared: &'a ConsumerShared,
}

impl Drop for SendTurn<'_> {
    fn drop(&mut self) {
        *lock_ignore_poison(&self.shared.send_turn) += 1;
        self.shared.turn_cv.notify_all();
    }
}

enum Wait {
    Forever,
    Until(Instant),
    Grace,
}

pub(crate) struct ConsumerShared {
    // ---
    id: ConsumerId,
    destination: String,
    ack_mode: AckMode,
    target: TargetSelector,
    prefetch: Prefetch,
    registry: Arc<RequestRegistry>,
    session: Weak<SessionShared>,
    state: Mutex<ConsumerState>,
    cv: Condvar,
    // Next hand-off allowed to send its side requests.
    send_turn: Mutex<u64>,
    turn_cv: Condvar,
}

impl ConsumerShared {
    pub(crate) fn new(
        id: ConsumerId,
        destination: String,
        ack_mode: AckMode,
        target: TargetSelector,
        prefetch: Prefetch,
        registry: Arc<RequestRegistry>,
        session: Weak<SessionShared>,
    ) -> Arc<Self> {
        // ---
        let seen = prefetch.duplicate_window.map(RecentSet::with_capacity);
        Arc::new(Self {
            id,
            destination,
            ack_mode,
            target,
            prefetch,
            registry,
            session,
            state: Mutex::new(ConsumerState {
                phase: ConsumerPhase::Created,
                cache: VecDeque::new(),
                seen,
                listener: None,
                receivers: 0,
                grace_used: false,
                drain_scheduled: false,
                dequeued: 0,
                close_reason: None,
                stats: ConsumerStats::default(),
            }),
            cv: Condvar::new(),
            send_turn: Mutex::new(0),
            turn_cv: Condvar::new(),
        })
    }

    pub(crate) fn id(&self) -> ConsumerId {
        self.id
    }

    fn lock(&self) -> MutexGuard<'_, ConsumerState> {
        lock_ignore_poison(&self.state)
    }

    /// Body of the request announcing this consumer to the router.
    pub(crate) fn create_request(&self) -> ClientRequest {
        ClientRequest::CreateConsumer {
            consumer: self.id,
            destination: self.destination.clone(),
            ack_mode: self.ack_mode,
        }
    }

    // ---------------------------------------------------------------------
    // Refill
    // ---------------------------------------------------------------------

    /// Move into `Refilling` and build the refill request, unless one is
    /// already outstanding or the consumer is shutting down.
    fn refill_request(&self, state: &mut ConsumerState) -> Option<ClientRequest> {
        // ---
        match state.phase {
            ConsumerPhase::Created | ConsumerPhase::Active => {
                state.phase = ConsumerPhase::Refilling;
                state.stats.refills += 1;
                Some(ClientRequest::Refill {
                    consumer: self.id,
                    max_messages: self.prefetch.messages,
                    max_bytes: self.prefetch.bytes,
                })
            }
            _ => None,
        }
    }

    /// Send a refill built by [`refill_request`](Self::refill_request).
    ///
    /// A refill that cannot be dispatched stays outstanding; the reconnect
    /// resync issues a fresh one.
    fn send_refill(&self, refill: Option<ClientRequest>) {
        if let Some(body) = refill {
            log_debug!("{}: requesting up to {} messages", self.id, self.prefetch.messages);
            if let Err(err) = self.send_one_way(&body) {
                log_warn!("{}: refill request not sent: {err}", self.id);
            }
        }
    }

    fn send_one_way(&self, body: &ClientRequest) -> Result<()> {
        let request = Request::encode(self.target, body)?.with_reply(false);
        self.registry.submit(request).map(|_| ())
    }

    // ---------------------------------------------------------------------
    // Hand-off
    // ---------------------------------------------------------------------

    fn take_next(&self, state: &mut ConsumerState) -> Option<Handoff> {
        // ---
        let entry = state.cache.pop_front()?;
        let turn = state.dequeued;
        state.dequeued += 1;
        let refill = if entry.requires_refill {
            self.refill_request(state)
        } else {
            None
        };

        if let Some(seen) = state.seen.as_mut() {
            let key = DuplicateKey {
                consumer: self.id,
                index: entry.index,
            };
            // Inserted before hand-off so a failing listener cannot see the
            // same message twice on this connection.
            if !seen.insert(key) {
                state.stats.suppressed += 1;
                log_debug!("{}: duplicate message {} suppressed", self.id, entry.index);
                return Some(Handoff {
                    turn,
                    message: None,
                    suppressed: Some(entry.index),
                    refill,
                });
            }
        }

        state.stats.delivered += 1;
        Some(Handoff {
            turn,
            message: Some(Message {
                consumer: self.id,
                index: entry.index,
                payload: entry.payload,
            }),
            suppressed: None,
            refill,
        })
    }

    /// Wait until every hand-off dequeued before `turn` has sent its side
    /// requests. Must be called without the consumer lock held.
    fn wait_turn(&self, turn: u64) -> SendTurn<'_> {
        // ---
        let mut next = lock_ignore_poison(&self.send_turn);
        while *next != turn {
            next = wait_ignore_poison(&self.turn_cv, next);
        }
        SendTurn { shared: self }
    }

    /// Issue the side requests of a hand-off and return the message to
    /// surface, if any.
    fn finish_handoff(&self, handoff: Handoff) -> Option<Message> {
        // ---
        self.send_refill(handoff.refill);

        if let Some(index) = handoff.suppressed {
            // The router redelivered something already processed here; in
            // auto mode settle it so it does not linger unacknowledged.
            self.auto_acknowledge(index);
            return None;
        }

        let message = handoff.message?;
        if self.ack_mode.requires_delivery_report() {
            let report = ClientRequest::DeliveryReport {
                consumer: self.id,
                index: message.index,
            };
            if let Err(err) = self.send_one_way(&report) {
                log_warn!("{}: delivery report for {} not sent: {err}", self.id, message.index);
            }
        }
        Some(message)
    }

    fn auto_acknowledge(&self, index: u64) {
        // ---
        if self.ack_mode != AckMode::Auto {
            return;
        }
        if let Err(err) = self.send_acknowledge(AckTarget::Index(index)) {
            log_warn!("{}: acknowledgment of {index} failed: {err}", self.id);
            self.lock().stats.failed_acks += 1;
        }
    }

    /// Send an acknowledgment and wait for the router to confirm it. On the
    /// delivery thread it goes out one-way instead.
    fn send_acknowledge(&self, target: AckTarget) -> Result<()> {
        // ---
        let body = ClientRequest::Acknowledge {
            consumer: self.id,
            target,
        };
        let request = Request::encode(self.target, &body)?;

        if on_delivery_thread() {
            return self.registry.submit(request.with_reply(false)).map(|_| ());
        }

        // Anything still unacknowledged at a reconnect is redelivered by the
        // router; acknowledging the old delivery would settle the wrong one.
        let request = request.with_validator(Arc::new(|_: &mut Request| {
            RetryDecision::Veto(Some(Failure::new(
                FailureKind::Vetoed,
                "messages were delivered on a previous connection",
            )))
        }));
        self.registry.submit(request)?.into_result().map(|_| ())
    }

    // ---------------------------------------------------------------------
    // Receive
    // ---------------------------------------------------------------------

    fn receive_with(&self, wait: Wait) -> Result<Option<Message>> {
        // ---
        let mut state = self.lock();
        if !state.phase.accepts_messages() {
            return Err(RpcError::Closed);
        }
        if state.listener.is_some() {
            return Err(RpcError::IllegalState(
                "receive called while a message listener is installed".into(),
            ));
        }

        let deadline = match wait {
            Wait::Forever => None,
            Wait::Until(deadline) => Some(deadline),
            Wait::Grace if state.grace_used => Some(Instant::now()),
            Wait::Grace => {
                state.grace_used = true;
                Some(Instant::now() + self.prefetch.no_wait_grace)
            }
        };

        state.receivers += 1;
        let received = loop {
            if !state.phase.accepts_messages() {
                break None;
            }

            if let Some(handoff) = self.take_next(&mut state) {
                drop(state);
                let message = {
                    let _turn = self.wait_turn(handoff.turn);
                    let message = self.finish_handoff(handoff);
                    if let Some(message) = &message {
                        self.auto_acknowledge(message.index);
                    }
                    message
                };
                state = self.lock();
                match message {
                    Some(message) => break Some(message),
                    None => continue,
                }
            }

            if let Some(refill) = self.refill_request(&mut state) {
                drop(state);
                self.send_refill(Some(refill));
                state = self.lock();
                continue;
            }

            state = match deadline {
                None => wait_ignore_poison(&self.cv, state),
                Some(deadline) => {
                    let now = Instant::now();
                    if now >= deadline {
                        break None;
                    }
                    match self.cv.wait_timeout(state, deadline - now) {
                        Ok((guard, _)) => guard,
                        Err(poisoned) => poisoned.into_inner().0,
                    }
                }
            };
        };
        state.receivers -= 1;
        Ok(received)
    }

    // ---------------------------------------------------------------------
    // Listener
    // ---------------------------------------------------------------------

    fn set_listener(self: &Arc<Self>, listener: Option<Arc<dyn MessageListener>>) -> Result<()> {
        // ---
        let mut state = self.lock();
        if !state.phase.accepts_messages() {
            return Err(RpcError::Closed);
        }
        if listener.is_some() && state.receivers > 0 {
            return Err(RpcError::IllegalState(
                "a blocking receive is in progress".into(),
            ));
        }

        state.listener = listener;
        if state.listener.is_none() {
            return Ok(());
        }

        let refill = if state.cache.is_empty() {
            self.refill_request(&mut state)
        } else {
            None
        };
        let schedule = !state.cache.is_empty() && !state.drain_scheduled;
        if schedule {
            state.drain_scheduled = true;
        }
        drop(state);

        self.send_refill(refill);

        if schedule {
            // The listener must run on the delivery thread, so the backlog
            // already in the cache is drained there too.
            let shared = Arc::clone(self);
            let job = Box::new(move || {
                let _scope = DeliveryScope::enter();
                shared.drain_to_listener();
            });
            if let Err(err) = self.registry.transport().schedule(job) {
                log_warn!("{}: backlog drain not scheduled: {err}", self.id);
                self.lock().drain_scheduled = false;
            }
        }
        Ok(())
    }

    /// Hand every cached message to the listener. Runs on the delivery
    /// thread.
    pub(crate) fn drain_to_listener(&self) {
        // ---
        loop {
            let mut state = self.lock();
            state.drain_scheduled = false;
            if !state.phase.accepts_messages() {
                return;
            }
            let Some(listener) = state.listener.clone() else {
                return;
            };
            let Some(handoff) = self.take_next(&mut state) else {
                return;
            };
            drop(state);

            let _turn = self.wait_turn(handoff.turn);
            let Some(message) = self.finish_handoff(handoff) else {
                continue;
            };
            let index = message.index;
            if !self.invoke(listener.as_ref(), message) {
                return;
            }
            self.auto_acknowledge(index);
        }
    }

    fn invoke(&self, listener: &dyn MessageListener, message: Message) -> bool {
        // ---
        let index = message.index;
        let failure = match panic::catch_unwind(AssertUnwindSafe(|| listener.on_message(message))) {
            Ok(Ok(())) => return true,
            Ok(Err(err)) => err.to_string(),
            Err(payload) => panic_message(payload.as_ref()),
        };

        log_error!("{}: listener failed on message {index}, closing consumer: {failure}", self.id);
        if let Err(err) = self.close(Some(failure)) {
            log_warn!("{}: close after listener failure: {err}", self.id);
        }
        false
    }

    // ---------------------------------------------------------------------
    // Inbound and lifecycle
    // ---------------------------------------------------------------------

    /// Store a pushed message and wake a receiver or run the listener.
    pub(crate) fn on_push(&self, push: Push) {
        // ---
        let mut state = self.lock();
        if !state.phase.accepts_messages() {
            log_debug!("{}: message {} arrived after close, dropped", self.id, push.index);
            return;
        }

        if push.requires_refill && state.phase == ConsumerPhase::Refilling {
            state.phase = ConsumerPhase::Active;
        }
        state.cache.push_back(CacheEntry {
            index: push.index,
            payload: push.payload,
            requires_refill: push.requires_refill,
        });

        if state.listener.is_none() {
            self.cv.notify_all();
            return;
        }
        drop(state);
        self.drain_to_listener();
    }

    pub(crate) fn close(&self, reason: Option<String>) -> Result<()> {
        // ---
        {
            let mut state = self.lock();
            if !state.phase.accepts_messages() {
                return Ok(());
            }
            state.phase = ConsumerPhase::Closing;
            state.close_reason = reason;
            state.listener = None;
            let discarded = state.cache.len();
            state.cache.clear();
            self.cv.notify_all();
            log_info!("{}: closing, {discarded} cached messages discarded", self.id);
        }

        let session = self.session.upgrade();
        // While suspended the router has already dropped this consumer with
        // the old link, and a close would only park until the reconnect.
        let remote = session.as_ref().is_some_and(|s| s.is_open())
            && self.registry.invalid_reason().is_none()
            && !self.registry.is_suspended();
        let result = if remote {
            self.send_close()
        } else {
            log_debug!("{}: session or link gone, close is local only", self.id);
            Ok(())
        };

        {
            let mut state = self.lock();
            if state.phase == ConsumerPhase::Closing {
                state.phase = ConsumerPhase::Closed;
            }
            self.cv.notify_all();
        }
        if let Some(session) = session {
            session.forget_consumer(self.id);
        }
        result
    }

    fn send_close(&self) -> Result<()> {
        // ---
        let body = ClientRequest::CloseConsumer { consumer: self.id };
        let request = Request::encode(self.target, &body)?;

        if on_delivery_thread() {
            return self.registry.submit(request.with_reply(false)).map(|_| ());
        }

        // After a reconnect the router no longer knows this consumer.
        let request = request.with_validator(Arc::new(|_: &mut Request| RetryDecision::Veto(None)));
        self.registry.submit(request)?.into_result().map(|_| ())
    }

    pub(crate) fn cancel(&self, reason: &str) {
        // ---
        let mut state = self.lock();
        if state.phase.is_terminal() {
            return;
        }
        state.phase = ConsumerPhase::Cancelled;
        state.close_reason = Some(reason.to_string());
        state.listener = None;
        state.cache.clear();
        self.cv.notify_all();
        log_info!("{}: cancelled: {reason}", self.id);
    }

    pub(crate) fn acknowledge(&self, target: AckTarget) -> Result<()> {
        // ---
        if self.ack_mode != AckMode::Client {
            return Err(RpcError::IllegalState(format!(
                "explicit acknowledgment needs client ack mode, consumer uses {:?}",
                self.ack_mode
            )));
        }
        if !self.lock().phase.accepts_messages() {
            return Err(RpcError::Closed);
        }
        self.send_acknowledge(target)
    }

    /// Rebuild router-side state after a reconnect: flush the cache (the
    /// router redelivers), announce the consumer again and restart the
    /// refill cycle if the consumer was started.
    pub(crate) fn resync(&self) {
        // ---
        let mut state = self.lock();
        if !state.phase.accepts_messages() {
            return;
        }

        let flushed = state.cache.len();
        state.cache.clear();
        let started = state.phase != ConsumerPhase::Created || state.listener.is_some();
        state.phase = if started {
            ConsumerPhase::Active
        } else {
            ConsumerPhase::Created
        };
        let refill = if started {
            self.refill_request(&mut state)
        } else {
            None
        };
        drop(state);

        log_info!("{}: resynchronised after reconnect, {flushed} cached messages flushed", self.id);
        if let Err(err) = self.send_one_way(&self.create_request()) {
            log_warn!("{}: consumer not re-announced: {err}", self.id);
        }
        self.send_refill(refill);
    }
}

fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(text) = payload.downcast_ref::<&str>() {
        (*text).to_string()
    } else if let Some(text) = payload.downcast_ref::<String>() {
        text.clone()
    } else {
        "listener panicked".to_string()
    }
}

/// Application handle of a consumer. Cheap to clone; clones share state.
#[derive(Clone)]
pub struct Consumer {
    shared: Arc<ConsumerShared>,
}

impl Consumer {
    pub(crate) fn new(shared: Arc<ConsumerShared>) -> Self {
        Self { shared }
    }

    pub fn id(&self) -> ConsumerId {
        self.shared.id
    }

    pub fn destination(&self) -> &str {
        &self.shared.destination
    }

    pub fn ack_mode(&self) -> AckMode {
        self.shared.ack_mode
    }

    pub fn phase(&self) -> ConsumerPhase {
        self.shared.lock().phase
    }

    /// True while a refill request is outstanding.
    pub fn fill_pending(&self) -> bool {
        self.phase() == ConsumerPhase::Refilling
    }

    /// Number of prefetched messages waiting in the cache.
    pub fn cached(&self) -> usize {
        self.shared.lock().cache.len()
    }

    pub fn stats(&self) -> ConsumerStats {
        self.shared.lock().stats
    }

    /// Why the consumer was closed or cancelled, when a reason was recorded.
    pub fn close_reason(&self) -> Option<String> {
        self.shared.lock().close_reason.clone()
    }

    /// Install (or with `None`, remove) the push-mode listener.
    ///
    /// # Errors
    ///
    /// [`RpcError::IllegalState`] if a blocking receive is in progress,
    /// [`RpcError::Closed`] if the consumer is closed.
    pub fn set_message_listener(&self, listener: Option<Arc<dyn MessageListener>>) -> Result<()> {
        self.shared.set_listener(listener)
    }

    /// Block until a message arrives or the consumer is closed.
    ///
    /// Returns `Ok(None)` when woken by `close` or `cancel`. In auto mode the
    /// message is returned once the router confirmed its acknowledgment; a
    /// refused acknowledgment is logged and counted in
    /// [`ConsumerStats::failed_acks`].
    pub fn receive(&self) -> Result<Option<Message>> {
        self.shared.receive_with(Wait::Forever)
    }

    /// Block for at most `timeout`; a zero timeout waits indefinitely.
    pub fn receive_timeout(&self, timeout: Duration) -> Result<Option<Message>> {
        if timeout.is_zero() {
            return self.receive();
        }
        self.shared
            .receive_with(Wait::Until(Instant::now() + timeout))
    }

    /// Return a cached message without blocking. The first call on a
    /// consumer waits up to the configured grace period for the initial
    /// refill to arrive.
    pub fn receive_no_wait(&self) -> Result<Option<Message>> {
        self.shared.receive_with(Wait::Grace)
    }

    /// Acknowledge one message or everything delivered so far. Blocks until
    /// the router confirms.
    ///
    /// Called from a listener, the acknowledgment is sent without waiting
    /// for confirmation.
    pub fn acknowledge(&self, target: AckTarget) -> Result<()> {
        self.shared.acknowledge(target)
    }

    /// Close the consumer. Idempotent. Unconsumed cached messages are
    /// discarded and blocked receivers return `Ok(None)`.
    pub fn close(&self) -> Result<()> {
        self.shared.close(None)
    }

    /// Local-only shutdown used when the connection is gone.
    pub fn cancel(&self) {
        self.shared.cancel("cancelled by application");
    }
}

impl fmt::Debug for Consumer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Consumer")
            .field("id", &self.shared.id)
            .field("destination", &self.shared.destination)
            .field("ack_mode", &self.shared.ack_mode)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    // ---
    use super::*;
    use crate::test_support::ScriptedTransport;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::thread;

    fn prefetch() -> Prefetch {
        Prefetch {
            messages: 3,
            bytes: None,
            duplicate_window: Some(16),
            no_wait_grace: Duration::from_millis(20),
        }
    }

    fn consumer_with(ack_mode: AckMode, prefetch: Prefetch) -> (Consumer, Arc<ScriptedTransport>) {
        answered_consumer(ack_mode, prefetch, None)
    }

    /// Consumer whose reply-required requests are answered at once, with
    /// `failure` if given.
    fn answered_consumer(
        ack_mode: AckMode,
        prefetch: Prefetch,
        failure: Option<Failure>,
    ) -> (Consumer, Arc<ScriptedTransport>) {
        // ---
        let transport = ScriptedTransport::new();
        let registry = Arc::new(RequestRegistry::new(transport.clone(), None, true));
        transport.answer_requests(&registry, failure);
        let shared = ConsumerShared::new(
            ConsumerId(1),
            "orders".into(),
            ack_mode,
            TargetSelector::new(1, 1),
            prefetch,
            registry,
            Weak::new(),
        );
        (Consumer::new(shared), transport)
    }

    fn consumer(ack_mode: AckMode) -> (Consumer, Arc<ScriptedTransport>) {
        consumer_with(ack_mode, prefetch())
    }

    fn push(consumer: &Consumer, index: u64, requires_refill: bool) {
        consumer.shared.on_push(Push {
            consumer: consumer.id(),
            index,
            requires_refill,
            payload: Bytes::from(format!("m{index}")),
        });
    }

    fn listener<F>(f: F) -> Option<Arc<dyn MessageListener>>
    where
        F: Fn(Message) -> std::result::Result<(), ListenerError> + Send + Sync + 'static,
    {
        Some(Arc::new(f))
    }

    fn sent(transport: &ScriptedTransport) -> Vec<ClientRequest> {
        transport
            .frames()
            .iter()
            .map(|frame| ClientRequest::decode(&frame.payload).unwrap())
            .collect()
    }

    fn acks(transport: &ScriptedTransport) -> Vec<(u64, bool)> {
        transport
            .frames()
            .iter()
            .filter_map(|frame| match ClientRequest::decode(&frame.payload).unwrap() {
                ClientRequest::Acknowledge {
                    target: AckTarget::Index(index),
                    ..
                } => Some((index, frame.correlation.is_some())),
                _ => None,
            })
            .collect()
    }

    fn refills(transport: &ScriptedTransport) -> usize {
        sent(transport)
            .iter()
            .filter(|req| matches!(req, ClientRequest::Refill { .. }))
            .count()
    }

    #[test]
    fn test_duplicate_in_window_is_not_surfaced() {
        // ---
        let (consumer, _transport) = consumer(AckMode::None);

        push(&consumer, 11, false);
        assert_eq!(consumer.receive().unwrap().unwrap().index(), 11);

        // 11 comes back after a redelivery, between 10 and 12.
        push(&consumer, 10, false);
        push(&consumer, 11, false);
        push(&consumer, 12, false);

        let mut seen = Vec::new();
        while let Some(message) = consumer.receive_timeout(Duration::from_millis(50)).unwrap() {
            seen.push(message.index());
        }
        assert_eq!(seen, vec![10, 12]);
        assert_eq!(consumer.stats().suppressed, 1);
        assert_eq!(consumer.stats().delivered, 3);
    }

    #[test]
    fn test_duplicates_pass_when_detection_disabled() {
        // ---
        let mut settings = prefetch();
        settings.duplicate_window = None;
        let (consumer, _transport) = consumer_with(AckMode::None, settings);

        push(&consumer, 5, false);
        push(&consumer, 5, false);
        assert_eq!(consumer.receive().unwrap().unwrap().index(), 5);
        assert_eq!(consumer.receive().unwrap().unwrap().index(), 5);
        assert_eq!(consumer.stats().suppressed, 0);
    }

    #[test]
    fn test_receive_timeout_leaves_exactly_one_refill() {
        // ---
        let (consumer, transport) = consumer(AckMode::Auto);

        let started = Instant::now();
        assert!(consumer
            .receive_timeout(Duration::from_millis(500))
            .unwrap()
            .is_none());
        assert!(started.elapsed() >= Duration::from_millis(500));

        assert!(consumer.fill_pending());
        assert_eq!(refills(&transport), 1);

        // A second empty receive does not duplicate the outstanding refill.
        assert!(consumer
            .receive_timeout(Duration::from_millis(20))
            .unwrap()
            .is_none());
        assert_eq!(refills(&transport), 1);
    }

    #[test]
    fn test_batch_end_issues_exactly_one_refill() {
        // ---
        let (consumer, transport) = consumer(AckMode::None);
        assert!(consumer.receive_no_wait().unwrap().is_none());
        assert_eq!(refills(&transport), 1);

        push(&consumer, 1, false);
        push(&consumer, 2, false);
        push(&consumer, 3, true);
        assert!(!consumer.fill_pending());

        let receivers: Vec<_> = (0..3)
            .map(|_| {
                let consumer = consumer.clone();
                thread::spawn(move || consumer.receive().unwrap().unwrap().index())
            })
            .collect();
        let mut indices: Vec<u64> = receivers.into_iter().map(|r| r.join().unwrap()).collect();
        indices.sort_unstable();

        assert_eq!(indices, vec![1, 2, 3]);
        assert_eq!(refills(&transport), 2);
        assert!(consumer.fill_pending());
        assert_eq!(consumer.stats().refills, 2);
    }

    #[test]
    fn test_receive_no_wait_grace_only_on_first_call() {
        // ---
        let mut settings = prefetch();
        settings.no_wait_grace = Duration::from_millis(200);
        let (consumer, _transport) = consumer_with(AckMode::None, settings);

        let first = {
            let consumer = consumer.clone();
            thread::spawn(move || consumer.receive_no_wait().unwrap())
        };
        thread::sleep(Duration::from_millis(30));
        push(&consumer, 1, true);
        assert_eq!(first.join().unwrap().unwrap().index(), 1);

        let started = Instant::now();
        assert!(consumer.receive_no_wait().unwrap().is_none());
        assert!(started.elapsed() < Duration::from_millis(150));
    }

    #[test]
    fn test_auto_mode_acknowledges_after_receive() {
        // ---
        let (consumer, transport) = consumer(AckMode::Auto);
        push(&consumer, 7, false);
        consumer.receive().unwrap().unwrap();

        // Confirmed by the router before receive returned.
        assert_eq!(acks(&transport), vec![(7, true)]);
        assert_eq!(consumer.stats().failed_acks, 0);
        assert!(matches!(
            consumer.acknowledge(AckTarget::All),
            Err(RpcError::IllegalState(_))
        ));
    }

    #[test]
    fn test_refused_auto_ack_still_returns_message() {
        // ---
        let refusal = Failure::remote("no_such_message", "index 4 is not outstanding");
        let (consumer, transport) = answered_consumer(AckMode::Auto, prefetch(), Some(refusal));
        push(&consumer, 4, false);

        assert_eq!(consumer.receive().unwrap().unwrap().index(), 4);
        assert_eq!(acks(&transport), vec![(4, true)]);
        assert_eq!(consumer.stats().failed_acks, 1);
    }

    #[test]
    fn test_listener_auto_ack_is_one_way() {
        // ---
        let (consumer, transport) = consumer(AckMode::Auto);
        consumer.set_message_listener(listener(|_| Ok(()))).unwrap();

        let _scope = DeliveryScope::enter();
        push(&consumer, 2, false);

        assert_eq!(acks(&transport), vec![(2, false)]);
    }

    #[test]
    fn test_concurrent_receivers_acknowledge_in_dequeue_order() {
        // ---
        let mut settings = prefetch();
        settings.messages = 400;
        let (consumer, transport) = consumer_with(AckMode::Auto, settings);
        for index in 1..=400 {
            push(&consumer, index, false);
        }

        let receivers: Vec<_> = (0..8)
            .map(|_| {
                let consumer = consumer.clone();
                thread::spawn(move || {
                    let mut count = 0;
                    while consumer
                        .receive_timeout(Duration::from_millis(50))
                        .unwrap()
                        .is_some()
                    {
                        count += 1;
                    }
                    count
                })
            })
            .collect();
        let received: usize = receivers.into_iter().map(|r| r.join().unwrap()).sum();

        assert_eq!(received, 400);
        let acked: Vec<u64> = acks(&transport).into_iter().map(|(index, _)| index).collect();
        assert_eq!(acked, (1..=400).collect::<Vec<u64>>());
    }

    #[test]
    fn test_client_mode_reports_delivery_before_handoff() {
        // ---
        let (consumer, transport) = consumer(AckMode::Client);
        push(&consumer, 3, false);
        consumer.receive().unwrap().unwrap();

        let requests = sent(&transport);
        assert!(requests.contains(&ClientRequest::DeliveryReport {
            consumer: ConsumerId(1),
            index: 3,
        }));
        assert!(!requests
            .iter()
            .any(|req| matches!(req, ClientRequest::Acknowledge { .. })));
    }

    #[test]
    fn test_listener_and_receive_are_exclusive() {
        // ---
        let (consumer, _transport) = consumer(AckMode::None);
        consumer.set_message_listener(listener(|_| Ok(()))).unwrap();
        assert!(matches!(consumer.receive_no_wait(), Err(RpcError::IllegalState(_))));

        consumer.set_message_listener(None).unwrap();
        let blocked = {
            let consumer = consumer.clone();
            thread::spawn(move || consumer.receive())
        };
        thread::sleep(Duration::from_millis(30));
        assert!(matches!(
            consumer.set_message_listener(listener(|_| Ok(()))),
            Err(RpcError::IllegalState(_))
        ));

        consumer.close().unwrap();
        assert!(blocked.join().unwrap().unwrap().is_none());
    }

    #[test]
    fn test_listener_receives_in_order_and_backlog_is_scheduled() {
        // ---
        let (consumer, transport) = consumer(AckMode::None);
        push(&consumer, 1, false);
        push(&consumer, 2, false);

        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = seen.clone();
        consumer
            .set_message_listener(listener(move |m| {
                sink.lock().unwrap().push(m.index());
                Ok(())
            }))
            .unwrap();

        // Nothing runs on the caller's thread.
        assert!(seen.lock().unwrap().is_empty());
        transport.run_jobs();
        push(&consumer, 3, false);

        assert_eq!(*seen.lock().unwrap(), vec![1, 2, 3]);
    }

    #[test]
    fn test_listener_error_closes_consumer() {
        // ---
        let (consumer, _transport) = consumer(AckMode::None);
        let calls = Arc::new(AtomicUsize::new(0));
        let counter = calls.clone();
        consumer
            .set_message_listener(listener(move |_| {
                counter.fetch_add(1, Ordering::SeqCst);
                Err("bad payload".into())
            }))
            .unwrap();

        push(&consumer, 1, false);
        push(&consumer, 2, false);

        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert_eq!(consumer.phase(), ConsumerPhase::Closed);
        assert_eq!(consumer.close_reason().as_deref(), Some("bad payload"));
    }

    #[test]
    fn test_listener_panic_closes_consumer() {
        // ---
        let (consumer, _transport) = consumer(AckMode::None);
        consumer
            .set_message_listener(listener(|_| panic!("listener blew up")))
            .unwrap();

        push(&consumer, 1, false);
        assert_eq!(consumer.phase(), ConsumerPhase::Closed);
        assert_eq!(consumer.close_reason().as_deref(), Some("listener blew up"));
    }

    #[test]
    fn test_close_wakes_receiver_and_is_idempotent() {
        // ---
        let (consumer, _transport) = consumer(AckMode::None);
        let blocked = {
            let consumer = consumer.clone();
            thread::spawn(move || consumer.receive())
        };
        thread::sleep(Duration::from_millis(30));

        consumer.close().unwrap();
        consumer.close().unwrap();
        assert!(blocked.join().unwrap().unwrap().is_none());
        assert!(matches!(consumer.receive_no_wait(), Err(RpcError::Closed)));
    }

    #[test]
    fn test_cancel_sends_nothing() {
        // ---
        let (consumer, transport) = consumer(AckMode::Auto);
        push(&consumer, 1, false);
        consumer.shared.cancel("connection reset");

        assert_eq!(consumer.phase(), ConsumerPhase::Cancelled);
        assert_eq!(consumer.cached(), 0);
        assert!(transport.frames().is_empty());

        // Cancelled is terminal: a later close changes nothing.
        consumer.close().unwrap();
        assert_eq!(consumer.phase(), ConsumerPhase::Cancelled);
    }

    #[test]
    fn test_resync_flushes_cache_and_restarts_refill() {
        // ---
        let (consumer, transport) = consumer(AckMode::None);
        assert!(consumer.receive_no_wait().unwrap().is_none());
        push(&consumer, 1, false);
        push(&consumer, 2, false);
        assert_eq!(consumer.receive().unwrap().unwrap().index(), 1);

        consumer.shared.resync();

        assert_eq!(consumer.cached(), 0);
        assert!(consumer.fill_pending());
        let requests = sent(&transport);
        assert!(matches!(requests[requests.len() - 2], ClientRequest::CreateConsumer { .. }));
        assert!(matches!(requests[requests.len() - 1], ClientRequest::Refill { .. }));

        // The window survives the reconnect: redelivered 1 is absorbed,
        // flushed 2 comes through.
        push(&consumer, 1, false);
        push(&consumer, 2, false);
        assert_eq!(consumer.receive().unwrap().unwrap().index(), 2);
        assert_eq!(consumer.stats().suppressed, 1);
    }

    #[test]
    fn test_resync_of_unstarted_consumer_does_not_refill() {
        // ---
        let (consumer, transport) = consumer(AckMode::None);
        consumer.shared.resync();

        assert_eq!(consumer.phase(), ConsumerPhase::Created);
        assert_eq!(refills(&transport), 0);
    }
}
