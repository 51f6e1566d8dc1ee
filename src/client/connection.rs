//! Connection: owner of the correlation engine and listener of the
//! transport.
//!
//! The registry is an explicit instance owned here, created with the
//! connection and failed with it; nothing is process-global. Transport
//! callbacks arrive on the delivery thread and are mapped onto the engine:
//!
//! - `delivered`: replies go to [`RequestRegistry::complete`], pushes to the
//!   addressed consumer;
//! - `lost`: with reconnect enabled the registry is suspended and pending
//!   requests stay parked, otherwise everything pending is failed and every
//!   consumer cancelled;
//! - `reconnected`: sessions and consumers are re-announced, then parked
//!   requests are flagged for retry.

use super::consumer::ConsumerShared;
use super::session::SessionShared;
use super::{lock_ignore_poison, DeliveryScope};
use crate::{
    // ---
    log_debug,
    log_error,
    log_info,
    log_warn,
    AckMode,
    ClientConfig,
    ConnectionId,
    ConsumerId,
    Inbound,
    RequestRegistry,
    Result,
    RetrySignal,
    RpcError,
    Session,
    TimeoutSweeper,
    TransportListener,
    TransportPtr,
};
use std::collections::HashMap;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex, Weak};

/// State of the physical link as seen by the connection.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LinkState {
    Connected,
    /// Lost with a reconnect expected; requests are parked.
    Reconnecting(String),
    /// Lost for good; the connection is invalid.
    Failed(String),
    Closed,
}

#[derive(Default)]
struct Routes {
    consumers: HashMap<ConsumerId, Weak<ConsumerShared>>,
    sessions: HashMap<u32, Weak<SessionShared>>,
}

pub(crate) struct ConnectionCore {
    // ---
    id: ConnectionId,
    config: ClientConfig,
    registry: Arc<RequestRegistry>,
    routes: Mutex<Routes>,
    link: Mutex<LinkState>,
    last_retry: Mutex<Option<RetrySignal>>,
    next_session: AtomicU32,
    next_consumer: AtomicU32,
}

impl ConnectionCore {
    pub(crate) fn registry(&self) -> &Arc<RequestRegistry> {
        &self.registry
    }

    pub(crate) fn config(&self) -> &ClientConfig {
        &self.config
    }

    pub(crate) fn next_session_id(&self) -> u32 {
        self.next_session.fetch_add(1, Ordering::Relaxed)
    }

    pub(crate) fn next_consumer_id(&self) -> ConsumerId {
        ConsumerId(self.next_consumer.fetch_add(1, Ordering::Relaxed))
    }

    pub(crate) fn ensure_usable(&self) -> Result<()> {
        // ---
        match &*lock_ignore_poison(&self.link) {
            LinkState::Closed => Err(RpcError::Closed),
            LinkState::Failed(reason) => Err(RpcError::ConnectionInvalid(reason.clone())),
            LinkState::Connected | LinkState::Reconnecting(_) => Ok(()),
        }
    }

    pub(crate) fn track_session(&self, session: &Arc<SessionShared>) {
        lock_ignore_poison(&self.routes)
            .sessions
            .insert(session.id(), Arc::downgrade(session));
    }

    pub(crate) fn forget_session(&self, session: u32) {
        lock_ignore_poison(&self.routes).sessions.remove(&session);
    }

    pub(crate) fn route_consumer(&self, consumer: &Arc<ConsumerShared>) {
        lock_ignore_poison(&self.routes)
            .consumers
            .insert(consumer.id(), Arc::downgrade(consumer));
    }

    pub(crate) fn unroute_consumer(&self, consumer: ConsumerId) {
        lock_ignore_poison(&self.routes).consumers.remove(&consumer);
    }

    fn live_sessions(&self) -> Vec<Arc<SessionShared>> {
        let mut sessions: Vec<_> = lock_ignore_poison(&self.routes)
            .sessions
            .values()
            .filter_map(Weak::upgrade)
            .collect();
        sessions.sort_by_key(|session| session.id());
        sessions
    }

    fn live_consumers(&self) -> Vec<Arc<ConsumerShared>> {
        let mut consumers: Vec<_> = lock_ignore_poison(&self.routes)
            .consumers
            .values()
            .filter_map(Weak::upgrade)
            .collect();
        consumers.sort_by_key(|consumer| consumer.id());
        consumers
    }

    /// Local teardown shared by `close` and drop.
    fn shut_down(&self, reason: &str) {
        // ---
        *lock_ignore_poison(&self.link) = LinkState::Closed;
        self.registry.fail_all(reason, true);
        for consumer in self.live_consumers() {
            consumer.cancel(reason);
        }
        if let Err(err) = self.registry.transport().close() {
            log_warn!("connection {}: transport close failed: {err}", self.id);
        }
    }
}

impl TransportListener for ConnectionCore {
    fn delivered(&self, inbound: Inbound) {
        // ---
        let _scope = DeliveryScope::enter();
        match inbound {
            Inbound::Reply(reply) => {
                self.registry.complete(reply);
            }
            Inbound::Push(push) => {
                let consumer = lock_ignore_poison(&self.routes)
                    .consumers
                    .get(&push.consumer)
                    .and_then(Weak::upgrade);
                match consumer {
                    Some(consumer) => consumer.on_push(push),
                    None => log_debug!(
                        "connection {}: message {} for unknown {} dropped",
                        self.id,
                        push.index,
                        push.consumer
                    ),
                }
            }
        }
    }

    fn lost(&self, reason: &str) {
        // ---
        let _scope = DeliveryScope::enter();
        {
            let mut link = lock_ignore_poison(&self.link);
            if matches!(*link, LinkState::Closed | LinkState::Failed(_)) {
                return;
            }
            *link = if self.config.reconnect_enabled {
                LinkState::Reconnecting(reason.to_string())
            } else {
                LinkState::Failed(reason.to_string())
            };
        }

        if self.config.reconnect_enabled {
            log_warn!("connection {} lost, awaiting reconnect: {reason}", self.id);
            self.registry.suspend();
            return;
        }

        log_error!("connection {} lost: {reason}", self.id);
        self.registry.fail_all(reason, true);
        for consumer in self.live_consumers() {
            consumer.cancel(reason);
        }
    }

    fn reconnected(&self) {
        // ---
        let _scope = DeliveryScope::enter();
        {
            let mut link = lock_ignore_poison(&self.link);
            if !matches!(*link, LinkState::Reconnecting(_)) {
                log_debug!("connection {}: reconnect ignored in state {:?}", self.id, *link);
                return;
            }
            *link = LinkState::Connected;
        }

        // Router-side state is rebuilt before parked requests go out again.
        for session in self.live_sessions() {
            session.resync();
        }
        for consumer in self.live_consumers() {
            consumer.resync();
        }

        let signal = RetrySignal::new();
        *lock_ignore_poison(&self.last_retry) = Some(signal.clone());
        let count = self.registry.retry_all(signal);
        log_info!("connection {} reconnected, {count} requests resubmitting", self.id);
    }
}

/// A client connection over one transport.
///
/// Created by [`ConnectionBuilder`](crate::ConnectionBuilder).
pub struct Connection {
    core: Arc<ConnectionCore>,
    sweeper: Mutex<Option<TimeoutSweeper>>,
}

impl Connection {
    /// Validate `config`, attach to `transport` and start the timeout sweep.
    pub(crate) fn open(transport: TransportPtr, config: ClientConfig) -> Result<Self> {
        // ---
        config.validate()?;

        let registry = Arc::new(RequestRegistry::new(
            transport.clone(),
            config.request_timeout,
            config.retry_timeout_enabled,
        ));
        let core = Arc::new(ConnectionCore {
            id: ConnectionId::generate(),
            config,
            registry,
            routes: Mutex::new(Routes::default()),
            link: Mutex::new(LinkState::Connected),
            last_retry: Mutex::new(None),
            next_session: AtomicU32::new(1),
            next_consumer: AtomicU32::new(1),
        });

        let listener: Weak<dyn TransportListener> = Arc::downgrade(&core) as Weak<dyn TransportListener>;
        transport.attach(listener)?;

        let sweeper = core
            .config
            .request_timeout
            .map(|_| TimeoutSweeper::spawn(Arc::downgrade(&core.registry), core.config.sweep_interval));

        log_info!(
            "connection {} open on transport {}",
            core.id,
            transport.transport_id()
        );
        Ok(Self {
            core,
            sweeper: Mutex::new(sweeper),
        })
    }

    pub fn id(&self) -> ConnectionId {
        self.core.id
    }

    pub fn config(&self) -> &ClientConfig {
        &self.core.config
    }

    /// The connection's correlation engine.
    pub fn registry(&self) -> &Arc<RequestRegistry> {
        &self.core.registry
    }

    pub fn link_state(&self) -> LinkState {
        lock_ignore_poison(&self.core.link).clone()
    }

    pub fn is_connected(&self) -> bool {
        self.link_state() == LinkState::Connected
    }

    /// Completion signal of the most recent reconnect; released once every
    /// request resubmitted by it has settled.
    pub fn retry_signal(&self) -> Option<RetrySignal> {
        lock_ignore_poison(&self.core.last_retry).clone()
    }

    /// Open a session with the given acknowledgment mode.
    pub fn create_session(&self, ack_mode: AckMode) -> Result<Session> {
        Session::open(&self.core, ack_mode)
    }

    /// Close every session, stop the sweep and close the transport.
    /// Idempotent.
    pub fn close(&self) -> Result<()> {
        // ---
        if lock_ignore_poison(&self.core.link).clone() == LinkState::Closed {
            return Ok(());
        }

        let mut first_error = None;
        if self.core.ensure_usable().is_ok() {
            for session in self.core.live_sessions() {
                if let Err(err) = session.close() {
                    log_warn!("connection {}: closing session {}: {err}", self.core.id, session.id());
                    first_error.get_or_insert(err);
                }
            }
        }

        if let Some(mut sweeper) = lock_ignore_poison(&self.sweeper).take() {
            sweeper.stop();
        }
        self.core.shut_down("connection closed");
        log_info!("connection {} closed", self.core.id);

        match first_error {
            Some(err) => Err(err),
            None => Ok(()),
        }
    }
}

impl Drop for Connection {
    fn drop(&mut self) {
        if lock_ignore_poison(&self.core.link).clone() != LinkState::Closed {
            self.core.shut_down("connection dropped");
        }
    }
}

#[cfg(test)]
mod tests {
    // ---
    use super::*;
    use crate::test_support::ScriptedTransport;
    use crate::{Push, Reply};
    use bytes::Bytes;
    use std::thread;
    use std::time::Duration;

    fn open(transport: &Arc<ScriptedTransport>) -> Connection {
        let config = ClientConfig::default().with_request_timeout(None);
        Connection::open(transport.clone(), config).unwrap()
    }

    /// Answer frame `index` with an empty success once it is dispatched.
    fn answer(transport: &Arc<ScriptedTransport>, index: usize) -> thread::JoinHandle<()> {
        let transport = transport.clone();
        thread::spawn(move || {
            let frame = transport.wait_for_frame(index);
            let slot = frame.correlation.unwrap();
            transport.emit_inbound(Inbound::Reply(Reply::success(slot, Bytes::new())));
        })
    }

    #[test]
    fn test_push_is_routed_by_consumer_id() {
        // ---
        let transport = ScriptedTransport::new();
        let connection = open(&transport);

        let replier = answer(&transport, 0);
        let session = connection.create_session(AckMode::None).unwrap();
        replier.join().unwrap();

        let replier = answer(&transport, 1);
        let consumer = session.create_consumer("orders").unwrap();
        replier.join().unwrap();

        transport.emit_inbound(Inbound::Push(Push {
            consumer: ConsumerId(99),
            index: 1,
            requires_refill: false,
            payload: Bytes::from_static(b"stray"),
        }));
        transport.emit_inbound(Inbound::Push(Push {
            consumer: consumer.id(),
            index: 7,
            requires_refill: false,
            payload: Bytes::from_static(b"hello"),
        }));

        let message = consumer.receive_timeout(Duration::from_secs(2)).unwrap().unwrap();
        assert_eq!(message.index(), 7);
        assert_eq!(message.payload().as_ref(), b"hello");
        assert_eq!(consumer.cached(), 0);
    }

    #[test]
    fn test_unmatched_reply_is_ignored() {
        // ---
        let transport = ScriptedTransport::new();
        let connection = open(&transport);

        transport.emit_inbound(Inbound::Reply(Reply::success(
            crate::SlotId::new(3, 1),
            Bytes::new(),
        )));
        assert_eq!(connection.registry().pending_count(), 0);
        assert!(connection.is_connected());
    }

    #[test]
    fn test_close_is_idempotent() {
        // ---
        let transport = ScriptedTransport::new();
        let connection = open(&transport);

        connection.close().unwrap();
        connection.close().unwrap();

        assert_eq!(connection.link_state(), LinkState::Closed);
        assert!(!transport.has_listener());
        assert!(matches!(
            connection.create_session(AckMode::Auto),
            Err(RpcError::Closed)
        ));
    }

    #[test]
    fn test_reconnect_ignored_unless_reconnecting() {
        // ---
        let transport = ScriptedTransport::new();
        let connection = open(&transport);

        transport.emit_reconnected();
        assert!(connection.retry_signal().is_none());
        assert_eq!(connection.link_state(), LinkState::Connected);
    }
}
