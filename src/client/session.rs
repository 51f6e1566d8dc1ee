//! Sessions: the remote dispatch scope consumers and producers live in.

use super::connection::ConnectionCore;
use super::consumer::{ConsumerShared, Prefetch};
use super::{lock_ignore_poison, on_delivery_thread};
use crate::{
    // ---
    log_debug,
    log_info,
    log_warn,
    AckMode,
    ClientRequest,
    Consumer,
    ConsumerId,
    Failure,
    FailureKind,
    Outcome,
    Producer,
    Request,
    Result,
    RetryDecision,
    RetryValidator,
    RpcError,
    TargetSelector,
};
use bytes::Bytes;
use std::collections::HashMap;
use std::fmt;
use std::sync::{Arc, Mutex, MutexGuard, Weak};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum SessionPhase {
    Open,
    Closing,
    Closed,
}

struct SessionState {
    phase: SessionPhase,
    consumers: HashMap<ConsumerId, Arc<ConsumerShared>>,
}

pub(crate) struct SessionShared {
    // ---
    id: u32,
    ack_mode: AckMode,
    core: Arc<ConnectionCore>,
    state: Mutex<SessionState>,
}

/// Vetoes the retry of session-scoped requests once the session is gone.
struct SessionValidator {
    session: Weak<SessionShared>,
}

impl RetryValidator for SessionValidator {
    fn validate(&self, _request: &mut Request) -> RetryDecision {
        match self.session.upgrade() {
            Some(session) if session.is_open() => RetryDecision::Resubmit,
            _ => RetryDecision::Veto(Some(Failure::new(FailureKind::Vetoed, "session closed"))),
        }
    }
}

impl SessionShared {
    fn lock(&self) -> MutexGuard<'_, SessionState> {
        lock_ignore_poison(&self.state)
    }

    pub(crate) fn id(&self) -> u32 {
        self.id
    }

    pub(crate) fn core(&self) -> &Arc<ConnectionCore> {
        &self.core
    }

    /// True until the close request has been issued. Children closing while
    /// the session itself closes still talk to the router.
    pub(crate) fn is_open(&self) -> bool {
        self.lock().phase != SessionPhase::Closed
    }

    pub(crate) fn ensure_open(&self) -> Result<()> {
        // ---
        self.core.ensure_usable()?;
        match self.lock().phase {
            SessionPhase::Open => Ok(()),
            _ => Err(RpcError::Closed),
        }
    }

    pub(crate) fn target(&self) -> TargetSelector {
        TargetSelector::new(self.id, 0)
    }

    /// Submit a session-scoped request and wait for the router's answer.
    ///
    /// On the delivery thread the request is sent without waiting, since
    /// its reply could only be delivered by the blocked thread itself.
    pub(crate) fn call(self: &Arc<Self>, target: TargetSelector, body: &ClientRequest) -> Result<Bytes> {
        // ---
        let request = Request::encode(target, body)?;
        let registry = self.core.registry();

        if on_delivery_thread() {
            log_debug!("session {}: {} sent one-way from delivery thread", self.id, body.name());
            return registry.submit(request.with_reply(false)).map(|_| Bytes::new());
        }

        let request = request.with_validator(Arc::new(SessionValidator {
            session: Arc::downgrade(self),
        }));
        registry.submit(request).and_then(Outcome::into_result)
    }

    pub(crate) fn forget_consumer(&self, consumer: ConsumerId) {
        self.lock().consumers.remove(&consumer);
        self.core.unroute_consumer(consumer);
    }

    /// Re-announce the session after a reconnect.
    pub(crate) fn resync(&self) {
        // ---
        if !self.is_open() {
            return;
        }
        let body = ClientRequest::CreateSession {
            session: self.id,
            ack_mode: self.ack_mode,
        };
        let sent = Request::encode(TargetSelector::CONNECTION, &body)
            .and_then(|request| self.core.registry().submit(request.with_reply(false)));
        if let Err(err) = sent {
            log_warn!("session {}: not re-announced after reconnect: {err}", self.id);
        }
    }

    pub(crate) fn close(self: &Arc<Self>) -> Result<()> {
        // ---
        let consumers: Vec<_> = {
            let mut state = self.lock();
            if state.phase != SessionPhase::Open {
                return Ok(());
            }
            state.phase = SessionPhase::Closing;
            state.consumers.values().cloned().collect()
        };

        for consumer in consumers {
            if let Err(err) = consumer.close(None) {
                log_warn!("session {}: closing {}: {err}", self.id, consumer.id());
            }
        }

        {
            let mut state = self.lock();
            state.phase = SessionPhase::Closed;
            state.consumers.clear();
        }
        self.core.forget_session(self.id);

        let registry = self.core.registry();
        if registry.invalid_reason().is_some() || registry.is_suspended() {
            log_debug!("session {}: connection gone, close is local only", self.id);
            return Ok(());
        }

        let body = ClientRequest::CloseSession { session: self.id };
        let request = Request::encode(self.target(), &body)?;
        let result = if on_delivery_thread() {
            registry.submit(request.with_reply(false)).map(|_| ())
        } else {
            // After a reconnect the router has no such session left to close.
            let request = request.with_validator(Arc::new(|_: &mut Request| RetryDecision::Veto(None)));
            registry.submit(request).and_then(Outcome::into_result).map(|_| ())
        };

        log_info!("session {} closed", self.id);
        result
    }
}

/// Application handle of a session.
///
/// A session owns a remote dispatch id and an acknowledgment mode that every
/// consumer it creates inherits.
#[derive(Clone)]
pub struct Session {
    shared: Arc<SessionShared>,
}

impl Session {
    /// Allocate a session id and announce it to the router.
    pub(crate) fn open(core: &Arc<ConnectionCore>, ack_mode: AckMode) -> Result<Self> {
        // ---
        core.ensure_usable()?;

        let shared = Arc::new(SessionShared {
            id: core.next_session_id(),
            ack_mode,
            core: core.clone(),
            state: Mutex::new(SessionState {
                phase: SessionPhase::Open,
                consumers: HashMap::new(),
            }),
        });
        core.track_session(&shared);

        let body = ClientRequest::CreateSession {
            session: shared.id,
            ack_mode,
        };
        if let Err(err) = shared.call(TargetSelector::CONNECTION, &body) {
            core.forget_session(shared.id);
            return Err(err);
        }

        log_debug!("session {} open, ack mode {ack_mode:?}", shared.id);
        Ok(Self { shared })
    }

    pub fn id(&self) -> u32 {
        self.shared.id
    }

    pub fn ack_mode(&self) -> AckMode {
        self.shared.ack_mode
    }

    pub fn is_open(&self) -> bool {
        self.shared.lock().phase == SessionPhase::Open
    }

    /// Open a consumer on `destination`. Nothing is prefetched until the
    /// first receive or until a listener is installed.
    pub fn create_consumer(&self, destination: &str) -> Result<Consumer> {
        // ---
        let shared = &self.shared;
        shared.ensure_open()?;

        let core = shared.core();
        let id = core.next_consumer_id();
        let consumer = ConsumerShared::new(
            id,
            destination.to_string(),
            shared.ack_mode,
            TargetSelector::new(shared.id, id.0),
            Prefetch::from_config(core.config()),
            core.registry().clone(),
            Arc::downgrade(shared),
        );

        {
            let mut state = shared.lock();
            if state.phase != SessionPhase::Open {
                return Err(RpcError::Closed);
            }
            state.consumers.insert(id, consumer.clone());
        }
        // Routed before the router learns about it, so no push is lost.
        core.route_consumer(&consumer);

        if let Err(err) = shared.call(shared.target(), &consumer.create_request()) {
            shared.forget_consumer(id);
            return Err(err);
        }

        log_debug!("session {}: {id} open on {destination}", shared.id);
        Ok(Consumer::new(consumer))
    }

    pub fn create_producer(&self, destination: &str) -> Result<Producer> {
        self.shared.ensure_open()?;
        Ok(Producer::new(self.shared.clone(), destination.to_string()))
    }

    /// Commit the current transaction. Transacted sessions only.
    pub fn commit(&self) -> Result<()> {
        self.transaction(ClientRequest::Commit {
            session: self.shared.id,
        })
    }

    /// Roll back the current transaction; the router redelivers what was
    /// consumed in it. Transacted sessions only.
    pub fn rollback(&self) -> Result<()> {
        self.transaction(ClientRequest::Rollback {
            session: self.shared.id,
        })
    }

    fn transaction(&self, body: ClientRequest) -> Result<()> {
        // ---
        if self.shared.ack_mode != AckMode::Transacted {
            return Err(RpcError::IllegalState(format!(
                "{} needs a transacted session",
                body.name()
            )));
        }
        self.shared.ensure_open()?;
        self.shared.call(self.shared.target(), &body).map(|_| ())
    }

    /// Close every consumer of the session, then the session itself.
    /// Idempotent.
    pub fn close(&self) -> Result<()> {
        self.shared.close()
    }
}

impl fmt::Debug for Session {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Session")
            .field("id", &self.shared.id)
            .field("ack_mode", &self.shared.ack_mode)
            .finish()
    }
}
