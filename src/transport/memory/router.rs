// src/transport/memory/router.rs

//! In-process router hosting named queues.
//!
//! Every [`MemoryTransport`] is one link into the router. Requests are
//! applied synchronously inside `dispatch`; replies and pushes are queued to
//! the link's delivery thread and never touch the caller's thread.

use super::transport::{MemoryTransport, Queued};
use crate::client::lock_ignore_poison;
use crate::{
    // ---
    log_debug,
    log_info,
    AckMode,
    AckTarget,
    ClientRequest,
    ConsumerId,
    Failure,
    Frame,
    Inbound,
    Push,
    Reply,
    Result,
    RpcError,
    TargetSelector,
    TransportEvent,
};
use bytes::Bytes;
use std::collections::{BTreeMap, HashMap, VecDeque};
use std::sync::mpsc::Sender;
use std::sync::{Arc, Mutex, MutexGuard};

type Outcome = std::result::Result<(), Failure>;

#[derive(Debug, Clone)]
struct Stored {
    index: u64,
    payload: Bytes,
}

struct SessionRec {
    ack_mode: AckMode,
    // Produces of a transacted session, published on commit.
    staged: Vec<(String, Bytes)>,
}

struct ConsumerRec {
    session: u32,
    destination: String,
    ack_mode: AckMode,
    credit: usize,
    byte_credit: Option<usize>,
    unacked: Vec<Stored>,
}

struct Link {
    name: String,
    outbox: Sender<Queued>,
    connected: bool,
    drop_replies: bool,
    sessions: HashMap<u32, SessionRec>,
    consumers: BTreeMap<ConsumerId, ConsumerRec>,
}

impl Link {
    fn post(&self, event: TransportEvent) {
        // A closed outbox only means the transport is shutting down.
        let _ = self.outbox.send(Queued::Event(event));
    }

    fn consumer_mut(&mut self, consumer: ConsumerId) -> std::result::Result<&mut ConsumerRec, Failure> {
        self.consumers
            .get_mut(&consumer)
            .ok_or_else(|| Failure::remote("no_such_consumer", consumer.to_string()))
    }

    fn session_mut(&mut self, session: u32) -> std::result::Result<&mut SessionRec, Failure> {
        self.sessions
            .get_mut(&session)
            .ok_or_else(|| Failure::remote("no_such_session", format!("session {session}")))
    }

    fn consumers_of(&self, session: u32) -> Vec<ConsumerId> {
        self.consumers
            .iter()
            .filter(|(_, rec)| rec.session == session)
            .map(|(id, _)| *id)
            .collect()
    }
}

#[derive(Default)]
struct RouterState {
    queues: HashMap<String, VecDeque<Stored>>,
    links: BTreeMap<u64, Link>,
    next_link: u64,
    next_index: u64,
}

impl RouterState {
    fn link_mut(&mut self, link: u64) -> std::result::Result<&mut Link, Failure> {
        self.links
            .get_mut(&link)
            .ok_or_else(|| Failure::remote("no_such_link", format!("link {link}")))
    }

    fn enqueue(&mut self, destination: &str, payload: Bytes) -> u64 {
        self.next_index += 1;
        let index = self.next_index;
        self.queues
            .entry(destination.to_string())
            .or_default()
            .push_back(Stored { index, payload });
        index
    }

    /// Put messages back at the head of their queue, in their original order.
    fn requeue(&mut self, destination: &str, messages: Vec<Stored>) {
        let queue = self.queues.entry(destination.to_string()).or_default();
        for message in messages.into_iter().rev() {
            queue.push_front(message);
        }
    }

    /// Push queued messages to every consumer of `destination` holding
    /// credit, in link and consumer order.
    fn pump(&mut self, destination: &str) {
        // ---
        let Some(queue) = self.queues.get_mut(destination) else {
            return;
        };

        for link in self.links.values_mut() {
            if !link.connected {
                continue;
            }
            for (id, consumer) in link.consumers.iter_mut() {
                if consumer.destination != destination {
                    continue;
                }
                while consumer.credit > 0 {
                    let Some(message) = queue.pop_front() else {
                        return;
                    };

                    consumer.credit -= 1;
                    if let Some(budget) = consumer.byte_credit.as_mut() {
                        *budget = budget.saturating_sub(message.payload.len());
                        if *budget == 0 {
                            consumer.credit = 0;
                        }
                    }
                    if consumer.ack_mode != AckMode::None {
                        consumer.unacked.push(message.clone());
                    }

                    let _ = link.outbox.send(Queued::Event(TransportEvent::Delivered(Inbound::Push(
                        Push {
                            consumer: *id,
                            index: message.index,
                            requires_refill: consumer.credit == 0,
                            payload: message.payload,
                        },
                    ))));
                }
            }
        }
    }

    fn remove_consumer(&mut self, link: u64, consumer: ConsumerId) {
        // ---
        let removed = self
            .links
            .get_mut(&link)
            .and_then(|link| link.consumers.remove(&consumer));
        if let Some(rec) = removed {
            let redelivered = rec.unacked.len();
            self.requeue(&rec.destination, rec.unacked);
            self.pump(&rec.destination);
            log_debug!("router: {consumer} removed, {redelivered} messages redelivered");
        }
    }

    fn apply(&mut self, link_id: u64, target: TargetSelector, request: ClientRequest) -> Outcome {
        // ---
        match request {
            ClientRequest::CreateSession { session, ack_mode } => {
                self.link_mut(link_id)?
                    .sessions
                    .entry(session)
                    .or_insert_with(|| SessionRec {
                        ack_mode,
                        staged: Vec::new(),
                    });
            }

            ClientRequest::CloseSession { session } => {
                let consumers = self.link_mut(link_id)?.consumers_of(session);
                for consumer in consumers {
                    self.remove_consumer(link_id, consumer);
                }
                self.link_mut(link_id)?.sessions.remove(&session);
            }

            ClientRequest::CreateConsumer {
                consumer,
                destination,
                ack_mode,
            } => {
                let link = self.link_mut(link_id)?;
                link.session_mut(target.dispatch)?;
                link.consumers.entry(consumer).or_insert_with(|| ConsumerRec {
                    session: target.dispatch,
                    destination: destination.clone(),
                    ack_mode,
                    credit: 0,
                    byte_credit: None,
                    unacked: Vec::new(),
                });
                self.queues.entry(destination).or_default();
            }

            ClientRequest::CloseConsumer { consumer } => {
                self.remove_consumer(link_id, consumer);
            }

            ClientRequest::Refill {
                consumer,
                max_messages,
                max_bytes,
            } => {
                let rec = self.link_mut(link_id)?.consumer_mut(consumer)?;
                rec.credit = max_messages;
                rec.byte_credit = max_bytes;
                let destination = rec.destination.clone();
                self.pump(&destination);
            }

            ClientRequest::DeliveryReport { consumer, index } => {
                self.link_mut(link_id)?.consumer_mut(consumer)?;
                log_debug!("router: {consumer} has message {index} in doubt");
            }

            ClientRequest::Acknowledge { consumer, target } => {
                let rec = self.link_mut(link_id)?.consumer_mut(consumer)?;
                match target {
                    AckTarget::All => rec.unacked.clear(),
                    AckTarget::Index(index) => {
                        let position = rec
                            .unacked
                            .iter()
                            .position(|message| message.index == index)
                            .ok_or_else(|| {
                                Failure::remote("no_such_message", format!("{consumer} index {index}"))
                            })?;
                        rec.unacked.remove(position);
                    }
                }
            }

            ClientRequest::Produce {
                destination,
                payload,
            } => {
                let session = self.link_mut(link_id)?.session_mut(target.dispatch)?;
                if session.ack_mode == AckMode::Transacted {
                    session.staged.push((destination, payload));
                } else {
                    self.enqueue(&destination, payload);
                    self.pump(&destination);
                }
            }

            ClientRequest::Commit { session } => {
                let link = self.link_mut(link_id)?;
                let staged = std::mem::take(&mut link.session_mut(session)?.staged);
                for consumer in link.consumers_of(session) {
                    if let Some(rec) = link.consumers.get_mut(&consumer) {
                        rec.unacked.clear();
                    }
                }
                for (destination, payload) in staged {
                    self.enqueue(&destination, payload);
                    self.pump(&destination);
                }
            }

            ClientRequest::Rollback { session } => {
                let link = self.link_mut(link_id)?;
                link.session_mut(session)?.staged.clear();

                let mut returned = Vec::new();
                for consumer in link.consumers_of(session) {
                    if let Some(rec) = link.consumers.get_mut(&consumer) {
                        returned.push((rec.destination.clone(), std::mem::take(&mut rec.unacked)));
                    }
                }

                // Rolled-back messages count as never consumed and get new
                // indices, so duplicate windows do not swallow them.
                for (destination, messages) in returned {
                    let restamped = messages
                        .into_iter()
                        .map(|message| {
                            self.next_index += 1;
                            Stored {
                                index: self.next_index,
                                payload: message.payload,
                            }
                        })
                        .collect();
                    self.requeue(&destination, restamped);
                    self.pump(&destination);
                }
            }
        }
        Ok(())
    }
}

/// Shared in-process router.
///
/// All [`MemoryTransport`] instances connected to the same router see the
/// same queues, exactly as clients connected to a real router would. Use one
/// router per test for isolation.
#[derive(Default)]
pub struct MemoryRouter {
    state: Mutex<RouterState>,
}

impl MemoryRouter {
    /// Create a new, empty router.
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    fn lock(&self) -> MutexGuard<'_, RouterState> {
        lock_ignore_poison(&self.state)
    }

    /// Open a new link into the router.
    pub fn connect(self: &Arc<Self>, name: impl Into<String>) -> Arc<MemoryTransport> {
        MemoryTransport::open(self.clone(), name.into())
    }

    pub(super) fn register_link(&self, name: &str, outbox: Sender<Queued>) -> u64 {
        // ---
        let mut state = self.lock();
        state.next_link += 1;
        let id = state.next_link;
        state.links.insert(
            id,
            Link {
                name: name.to_string(),
                outbox,
                connected: true,
                drop_replies: false,
                sessions: HashMap::new(),
                consumers: BTreeMap::new(),
            },
        );
        log_debug!("router: link {id} ({name}) connected");
        id
    }

    /// Enqueue a message from outside any connection. Returns its index.
    pub fn send(&self, destination: &str, payload: impl Into<Bytes>) -> u64 {
        let mut state = self.lock();
        let index = state.enqueue(destination, payload.into());
        state.pump(destination);
        index
    }

    /// Messages waiting in `destination`, not yet pushed to any consumer.
    pub fn queue_depth(&self, destination: &str) -> usize {
        self.lock().queues.get(destination).map_or(0, VecDeque::len)
    }

    /// Messages of `destination` pushed to a consumer and not yet settled.
    pub fn unacked_count(&self, destination: &str) -> usize {
        self.lock()
            .links
            .values()
            .flat_map(|link| link.consumers.values())
            .filter(|rec| rec.destination == destination)
            .map(|rec| rec.unacked.len())
            .sum()
    }

    /// Apply one frame from `link`.
    pub(super) fn handle(&self, link_id: u64, frame: Frame) -> Result<()> {
        // ---
        let mut state = self.lock();
        let (name, connected) = match state.links.get(&link_id) {
            Some(link) => (link.name.clone(), link.connected),
            None => return Err(RpcError::Transport(format!("link {link_id} is closed"))),
        };
        if !connected {
            return Err(RpcError::Transport(format!("{name}: connection lost")));
        }

        let request = ClientRequest::decode(&frame.payload)?;
        let op = request.name();
        log_debug!("router: {op} from {name} to {}", frame.target);

        let outcome = state.apply(link_id, frame.target, request);

        match (frame.correlation, outcome) {
            (Some(slot), outcome) => {
                let Some(link) = state.links.get(&link_id) else {
                    return Ok(());
                };
                if link.drop_replies {
                    log_debug!("router: reply to {op} for slot {slot} dropped");
                    return Ok(());
                }
                let reply = match outcome {
                    Ok(()) => Reply::success(slot, Bytes::new()),
                    Err(failure) => Reply::failure(slot, failure),
                };
                link.post(TransportEvent::Delivered(Inbound::Reply(reply)));
            }
            (None, Err(failure)) => {
                log_debug!("router: one-way {op} from {name} failed: {}", failure.message);
            }
            (None, Ok(())) => {}
        }
        Ok(())
    }

    /// Drop the link's connection: the router forgets its sessions and
    /// consumers and redelivers their unacknowledged messages.
    pub(super) fn lose(&self, link_id: u64, reason: &str) {
        // ---
        let mut state = self.lock();
        let Some(link) = state.links.get_mut(&link_id) else {
            return;
        };
        if !link.connected {
            return;
        }
        link.connected = false;
        link.sessions.clear();
        let consumers = std::mem::take(&mut link.consumers);
        link.post(TransportEvent::Lost(reason.to_string()));
        log_info!("router: link {link_id} lost: {reason}");

        for rec in consumers.into_values() {
            state.requeue(&rec.destination, rec.unacked);
            state.pump(&rec.destination);
        }
    }

    pub(super) fn restore(&self, link_id: u64) {
        // ---
        let mut state = self.lock();
        if let Some(link) = state.links.get_mut(&link_id) {
            if !link.connected {
                link.connected = true;
                link.post(TransportEvent::Reconnected);
                log_info!("router: link {link_id} reconnected");
            }
        }
    }

    pub(super) fn set_reply_drop(&self, link_id: u64, drop: bool) {
        if let Some(link) = self.lock().links.get_mut(&link_id) {
            link.drop_replies = drop;
        }
    }

    pub(super) fn disconnect(&self, link_id: u64) {
        // ---
        let mut state = self.lock();
        let Some(link) = state.links.remove(&link_id) else {
            return;
        };
        for rec in link.consumers.into_values() {
            state.requeue(&rec.destination, rec.unacked);
            state.pump(&rec.destination);
        }
        log_debug!("router: link {link_id} ({}) closed", link.name);
    }
}
