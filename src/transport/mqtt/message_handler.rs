//! Message routing for MQTT events
//!
//! Pure routing decisions ([`route_mqtt_event`], [`topic_matches`]) plus the
//! two pieces of bookkeeping the supervisor drives from those decisions:
//! the [`SubscriptionRegistry`] that fans inbound messages out to callbacks
//! and the [`AckTracker`] that completes waiting publishers.

use crate::transport::{Message, MessageCallback, QoS, SubscriptionFilters, TransportError};
use rumqttc::{Event, Outgoing, Packet, SubscribeReasonCode};
use std::collections::{HashMap, HashSet, VecDeque};
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError, RwLock};
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, error, warn};

/// Routing decisions for MQTT events
#[derive(Debug, Clone, PartialEq)]
pub enum EventRoute {
    /// Broker accepted the connection
    ConnectionAcknowledged { session_present: bool },
    /// Message received on a subscribed topic
    MessageReceived(Message),
    /// A PUBLISH left the client
    PublishSent { pkid: u16 },
    /// Final acknowledgement for a publish (PUBACK or PUBCOMP)
    PublishAcknowledged { pkid: u16 },
    /// SUBACK with the number of rejected filters
    SubscriptionAcknowledged { pkid: u16, rejected: usize },
    PingSent,
    PingAnswered,
    /// Our DISCONNECT was written; the session is ending
    DisconnectSent,
    /// Broker sent DISCONNECT
    BrokerDisconnected,
    /// Other protocol traffic handled by the transport itself
    InfrastructureEvent(String),
    /// Other outgoing traffic
    OutgoingEvent,
}

/// Route an MQTT event to the appropriate handler (pure routing decision)
pub fn route_mqtt_event(event: &Event) -> EventRoute {
    match event {
        Event::Incoming(packet) => match packet {
            Packet::ConnAck(connack) => EventRoute::ConnectionAcknowledged {
                session_present: connack.session_present,
            },
            Packet::Publish(publish) => EventRoute::MessageReceived(Message::new(
                publish.topic.clone(),
                publish.payload.clone(),
            )),
            Packet::PubAck(puback) => EventRoute::PublishAcknowledged { pkid: puback.pkid },
            Packet::PubComp(pubcomp) => EventRoute::PublishAcknowledged { pkid: pubcomp.pkid },
            Packet::SubAck(suback) => EventRoute::SubscriptionAcknowledged {
                pkid: suback.pkid,
                rejected: suback
                    .return_codes
                    .iter()
                    .filter(|code| matches!(code, SubscribeReasonCode::Failure))
                    .count(),
            },
            Packet::PingResp => EventRoute::PingAnswered,
            Packet::Disconnect => EventRoute::BrokerDisconnected,
            other => EventRoute::InfrastructureEvent(format!("{other:?}")),
        },
        Event::Outgoing(outgoing) => match outgoing {
            Outgoing::Publish(pkid) => EventRoute::PublishSent { pkid: *pkid },
            Outgoing::PingReq => EventRoute::PingSent,
            Outgoing::Disconnect => EventRoute::DisconnectSent,
            _ => EventRoute::OutgoingEvent,
        },
    }
}

/// MQTT topic filter matching.
///
/// `+` matches exactly one level, a trailing `#` matches the parent level
/// and everything below it. Filters starting with a wildcard never match
/// topics starting with `$`.
pub fn topic_matches(filter: &str, topic: &str) -> bool {
    if filter.is_empty() || topic.is_empty() {
        return false;
    }
    if topic.starts_with('$') && (filter.starts_with('+') || filter.starts_with('#')) {
        return false;
    }

    let mut filter_levels = filter.split('/');
    let mut topic_levels = topic.split('/');

    loop {
        match (filter_levels.next(), topic_levels.next()) {
            (Some("#"), _) => return filter_levels.next().is_none(),
            (Some("+"), Some(_)) => {}
            (Some(f), Some(t)) if f == t => {}
            (None, None) => return true,
            _ => return false,
        }
    }
}

/// One callback and its lazily started delivery worker
struct Handler {
    id: u64,
    callback: MessageCallback,
    depth: usize,
    sender: Mutex<Option<mpsc::Sender<Message>>>,
}

impl Handler {
    fn sender(&self) -> mpsc::Sender<Message> {
        let mut guard = self.sender.lock().unwrap_or_else(PoisonError::into_inner);
        guard
            .get_or_insert_with(|| {
                let (tx, rx) = mpsc::channel(self.depth.max(1));
                tokio::spawn(run_delivery_worker(self.id, rx, self.callback.clone()));
                tx
            })
            .clone()
    }
}

/// Invoke the callback for each message in arrival order
async fn run_delivery_worker(
    handler_id: u64,
    mut messages: mpsc::Receiver<Message>,
    callback: MessageCallback,
) {
    while let Some(message) = messages.recv().await {
        let topic = message.topic().to_string();
        if catch_unwind(AssertUnwindSafe(|| callback(message))).is_err() {
            error!(handler_id, topic = %topic, "Subscription callback panicked");
        }
    }
    debug!(handler_id, "Delivery worker stopped");
}

struct Route {
    qos: QoS,
    handler: Arc<Handler>,
}

/// Topic filter to callback registrations scoped to one session.
///
/// Each registration owns a bounded queue and a worker task, so callbacks
/// of one registration run one at a time in arrival order while different
/// registrations run concurrently.
pub struct SubscriptionRegistry {
    routes: RwLock<HashMap<String, Route>>,
    next_id: AtomicU64,
    depth: usize,
}

impl SubscriptionRegistry {
    pub fn new(depth: usize) -> Self {
        Self {
            routes: RwLock::new(HashMap::new()),
            next_id: AtomicU64::new(1),
            depth,
        }
    }

    /// Register one callback for every filter in the set.
    ///
    /// Re-registering a filter replaces its previous callback.
    pub fn register(&self, filters: &SubscriptionFilters, callback: MessageCallback) {
        let handler = Arc::new(Handler {
            id: self.next_id.fetch_add(1, Ordering::Relaxed),
            callback,
            depth: self.depth,
            sender: Mutex::new(None),
        });

        let mut routes = self.routes.write().unwrap_or_else(PoisonError::into_inner);
        for (filter, qos) in filters {
            routes.insert(
                filter.clone(),
                Route {
                    qos: *qos,
                    handler: handler.clone(),
                },
            );
        }
    }

    /// Remove the given filters; returns the ones that were registered
    pub fn remove(&self, filters: &[&str]) -> Vec<String> {
        let mut routes = self.routes.write().unwrap_or_else(PoisonError::into_inner);
        filters
            .iter()
            .filter_map(|filter| routes.remove(*filter).map(|_| filter.to_string()))
            .collect()
    }

    /// Every registered filter with its QoS
    pub fn filters(&self) -> Vec<(String, QoS)> {
        let routes = self.routes.read().unwrap_or_else(PoisonError::into_inner);
        routes
            .iter()
            .map(|(filter, route)| (filter.clone(), route.qos))
            .collect()
    }

    pub fn len(&self) -> usize {
        self.routes
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Drop all registrations, which stops their workers
    pub fn clear(&self) {
        self.routes
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .clear();
    }

    /// Distinct handlers whose filters match the topic
    fn matching_handlers(&self, topic: &str) -> Vec<Arc<Handler>> {
        let routes = self.routes.read().unwrap_or_else(PoisonError::into_inner);
        let mut seen = HashSet::new();
        routes
            .iter()
            .filter(|(filter, _)| topic_matches(filter, topic))
            .filter(|(_, route)| seen.insert(route.handler.id))
            .map(|(_, route)| route.handler.clone())
            .collect()
    }

    /// Queue the message for every matching registration.
    ///
    /// A registration reached through several filters receives the message
    /// once. Waits when a registration's queue is full. Returns the number
    /// of registrations the message was queued for.
    pub async fn dispatch(&self, message: Message) -> usize {
        let handlers = self.matching_handlers(message.topic());
        if handlers.is_empty() {
            debug!(topic = %message.topic(), "No subscription matches inbound message");
            return 0;
        }

        let mut delivered = 0;
        for handler in handlers {
            if handler.sender().send(message.clone()).await.is_ok() {
                delivered += 1;
            } else {
                warn!(
                    handler_id = handler.id,
                    topic = %message.topic(),
                    "Delivery worker is gone, dropping message"
                );
            }
        }
        delivered
    }
}

type AckSender = oneshot::Sender<Result<(), TransportError>>;

/// Receiver side of a publish acknowledgement
pub type AckReceiver = oneshot::Receiver<Result<(), TransportError>>;

/// Identifies one publish inside the [`AckTracker`]
pub type AckId = u64;

struct AckSlot {
    id: AckId,
    qos: QoS,
    tx: AckSender,
}

/// Matches outgoing publishes and their acknowledgements to waiting callers.
///
/// Publishes are queued in the order they are handed to the transport;
/// the transport reports them leaving in that same order, at which point
/// the packet identifier becomes known. Callers address their own slot by
/// the [`AckId`] returned from [`enqueue`](Self::enqueue).
#[derive(Default)]
pub struct AckTracker {
    next_id: AckId,
    queued: VecDeque<AckSlot>,
    inflight: HashMap<u16, AckSlot>,
}

impl AckTracker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Reserve a slot for a publish about to be handed to the transport
    pub fn enqueue(&mut self, qos: QoS) -> (AckId, AckReceiver) {
        let id = self.next_id;
        self.next_id = self.next_id.wrapping_add(1);
        let (tx, rx) = oneshot::channel();
        self.queued.push_back(AckSlot { id, qos, tx });
        (id, rx)
    }

    /// Remove a slot whose publish never reached the transport
    pub fn discard(&mut self, id: AckId) -> bool {
        match self.queued.iter().position(|slot| slot.id == id) {
            Some(index) => {
                self.queued.remove(index);
                true
            }
            None => false,
        }
    }

    /// The caller stopped waiting for this publish.
    ///
    /// An in-flight slot is released at once. A queued slot keeps its place
    /// because the transport still holds the request and will report it
    /// leaving; its outcome is simply dropped then.
    pub fn abandon(&mut self, id: AckId) {
        let pkid = self
            .inflight
            .iter()
            .find_map(|(pkid, slot)| (slot.id == id).then_some(*pkid));
        if let Some(pkid) = pkid {
            self.inflight.remove(&pkid);
            debug!(pkid, "Publisher stopped waiting for acknowledgement");
        }
    }

    /// A PUBLISH left the client with the given packet identifier
    pub fn on_publish_sent(&mut self, pkid: u16) {
        if pkid != 0 && self.inflight.contains_key(&pkid) {
            debug!(pkid, "Retransmitted publish");
            return;
        }

        match self.queued.pop_front() {
            Some(slot) if slot.qos == QoS::AtMostOnce => {
                let _ = slot.tx.send(Ok(()));
            }
            Some(slot) => {
                if let Some(stale) = self.inflight.insert(pkid, slot) {
                    warn!(pkid, slot = stale.id, "Packet identifier reused before acknowledgement");
                }
            }
            None => debug!(pkid, "Outgoing publish without a waiting caller"),
        }
    }

    /// PUBACK or PUBCOMP received
    pub fn on_acknowledged(&mut self, pkid: u16) {
        match self.inflight.remove(&pkid) {
            Some(slot) => {
                let _ = slot.tx.send(Ok(()));
            }
            None => debug!(pkid, "Acknowledgement for unknown publish"),
        }
    }

    /// Fail every waiting publisher
    pub fn fail_all(&mut self, error: TransportError) {
        for slot in self.queued.drain(..) {
            let _ = slot.tx.send(Err(error.clone()));
        }
        for (_, slot) in self.inflight.drain() {
            let _ = slot.tx.send(Err(error.clone()));
        }
    }

    /// Publishes still waiting to leave or to be acknowledged
    pub fn pending(&self) -> usize {
        self.queued.len() + self.inflight.len()
    }
}
