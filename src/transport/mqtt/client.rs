//! Impure I/O operations for the MQTT session
//!
//! [`MqttSession`] owns the `rumqttc` client and event loop. `connect`
//! spawns a supervisor task that drives the event loop, reconnects with
//! exponential backoff, resumes subscriptions and completes publish
//! acknowledgements. All decisions are delegated to the pure modules next
//! to this one.

use super::connection::{publish_packet_size, to_mqtt_qos, SessionOptions};
use super::health_monitor::{ConnectionEvent, HealthMonitor, PingTracker, ReconnectPolicy};
use super::message_handler::{
    route_mqtt_event, AckId, AckReceiver, AckTracker, EventRoute, SubscriptionRegistry,
};
use crate::config::ConfigError;
use crate::transport::{
    ConnectionState, MessageCallback, QoS, SessionClient, SubscriptionFilters, TransportError,
};
use async_trait::async_trait;
use bytes::Bytes;
use rumqttc::{AsyncClient, ClientError, ConnectionError, Event, EventLoop, SubscribeFilter};
use std::fmt;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::{Duration, Instant};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn, Instrument};

/// How long `disconnect` waits for the supervisor before aborting it
const DISCONNECT_GRACE: Duration = Duration::from_secs(2);

/// Invoked every time the broker accepts a connection
pub type ConnectCallback = Arc<dyn Fn() + Send + Sync>;

/// Invoked every time an established connection drops
pub type ConnectionLostCallback = Arc<dyn Fn(&TransportError) + Send + Sync>;

/// Optional lifecycle hooks; unset hooks are no-ops
#[derive(Clone, Default)]
pub struct SessionCallbacks {
    pub on_connect: Option<ConnectCallback>,
    pub on_connection_lost: Option<ConnectionLostCallback>,
}

impl SessionCallbacks {
    fn connected(&self) {
        if let Some(callback) = &self.on_connect {
            callback();
        }
    }

    fn connection_lost(&self, error: &TransportError) {
        if let Some(callback) = &self.on_connection_lost {
            callback(error);
        }
    }
}

impl fmt::Debug for SessionCallbacks {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SessionCallbacks")
            .field("on_connect", &self.on_connect.is_some())
            .field("on_connection_lost", &self.on_connection_lost.is_some())
            .finish()
    }
}

/// State shared between the session handle and its supervisor
struct SharedState {
    registry: SubscriptionRegistry,
    acks: Mutex<AckTracker>,
    state_tx: watch::Sender<ConnectionState>,
    callbacks: SessionCallbacks,
}

impl SharedState {
    fn state(&self) -> ConnectionState {
        self.state_tx.borrow().clone()
    }

    fn acks(&self) -> MutexGuard<'_, AckTracker> {
        self.acks.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn transition(&self, event: &ConnectionEvent) -> ConnectionState {
        let mut previous = None;
        self.state_tx.send_if_modified(|state| {
            let next = HealthMonitor::determine_next_state(state, event);
            if *state == next {
                return false;
            }
            previous = Some(std::mem::replace(state, next));
            true
        });

        let current = self.state();
        if let Some(previous) = previous {
            HealthMonitor::log_state_transition(&previous, &current);
        }
        current
    }

    /// Enter the terminal state and release everything waiting on it
    fn close(&self) {
        self.transition(&ConnectionEvent::ShutdownCompleted);
        self.acks().fail_all(TransportError::SessionClosed);
        self.registry.clear();
    }
}

/// Why a poll of the event loop did not produce an event
#[derive(Debug)]
enum PollFailure {
    Connection(ConnectionError),
    ConnectTimeout(Duration),
    PingTimeout,
}

impl PollFailure {
    fn to_transport_error(&self) -> TransportError {
        match self {
            PollFailure::Connection(e) => TransportError::ConnectionLost(e.to_string()),
            PollFailure::ConnectTimeout(timeout) => TransportError::ConnectTimeout(*timeout),
            PollFailure::PingTimeout => {
                TransportError::ConnectionLost("no PINGRESP within ping timeout".to_string())
            }
        }
    }
}

/// Persistent MQTT session implementing [`SessionClient`]
pub struct MqttSession {
    options: SessionOptions,
    client: AsyncClient,
    event_loop: Mutex<Option<EventLoop>>,
    shared: Arc<SharedState>,
    shutdown_tx: watch::Sender<bool>,
    send_lock: tokio::sync::Mutex<()>,
    supervisor: Mutex<Option<JoinHandle<()>>>,
}

impl MqttSession {
    /// Create an unstarted session; nothing touches the network until
    /// [`connect`](SessionClient::connect)
    pub fn new(options: SessionOptions, callbacks: SessionCallbacks) -> Result<Self, ConfigError> {
        let mqtt_options = options.to_mqtt_options()?;
        let (client, mut event_loop) =
            AsyncClient::new(mqtt_options, options.message_channel_depth);
        event_loop.set_network_options(options.network_options());
        let (state_tx, _) = watch::channel(ConnectionState::Disconnected);
        let (shutdown_tx, _) = watch::channel(false);

        let shared = Arc::new(SharedState {
            registry: SubscriptionRegistry::new(options.message_channel_depth),
            acks: Mutex::new(AckTracker::new()),
            state_tx,
            callbacks,
        });

        Ok(Self {
            options,
            client,
            event_loop: Mutex::new(Some(event_loop)),
            shared,
            shutdown_tx,
            send_lock: tokio::sync::Mutex::new(()),
            supervisor: Mutex::new(None),
        })
    }

    /// Options this session was built with
    pub fn options(&self) -> &SessionOptions {
        &self.options
    }

    /// Registered filters with their QoS
    pub fn subscriptions(&self) -> Vec<(String, QoS)> {
        self.shared.registry.filters()
    }

    fn supervisor_handle(&self) -> MutexGuard<'_, Option<JoinHandle<()>>> {
        self.supervisor.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn is_started(&self) -> bool {
        self.supervisor_handle().is_some()
    }

    /// Spawn the supervisor unless it is already running
    fn start_supervisor(&self) {
        let mut handle = self.supervisor_handle();
        if handle.is_some() {
            return;
        }
        let Some(event_loop) = self
            .event_loop
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take()
        else {
            return;
        };

        let span = crate::mqtt_span!(operation = "supervisor", client_id = %self.options.client_id);
        let supervisor = Supervisor::new(
            self.client.clone(),
            self.options.clone(),
            self.shared.clone(),
        );
        let shutdown_rx = self.shutdown_tx.subscribe();
        *handle = Some(tokio::spawn(
            supervisor.run(event_loop, shutdown_rx).instrument(span),
        ));
    }

    /// Wait until the session reports `Connected`
    async fn wait_for_connection_confirmation(
        mut state_rx: watch::Receiver<ConnectionState>,
        timeout: Duration,
    ) -> Result<(), TransportError> {
        let wait = async {
            loop {
                match *state_rx.borrow_and_update() {
                    ConnectionState::Connected => return Ok(()),
                    ConnectionState::Closed => return Err(TransportError::SessionClosed),
                    ConnectionState::Connecting | ConnectionState::Disconnected => {}
                }
                if state_rx.changed().await.is_err() {
                    return Err(TransportError::SessionClosed);
                }
            }
        };

        tokio::time::timeout(timeout, wait)
            .await
            .map_err(|_| TransportError::ConnectTimeout(timeout))?
    }

    /// Hand a publish to the transport and reserve its acknowledgement slot
    async fn enqueue_publish(
        &self,
        topic: &str,
        payload: Bytes,
        qos: QoS,
        retain: bool,
    ) -> Result<(AckId, AckReceiver), TransportError> {
        // Slots must be reserved in the order requests enter the queue
        let _ordering = self.send_lock.lock().await;
        let (slot, receiver) = PendingAck::reserve(&self.shared, qos);

        self.client
            .publish_bytes(topic, to_mqtt_qos(qos), retain, payload)
            .await
            .map_err(request_error)?;

        Ok((slot.commit(), receiver))
    }
}

/// Acknowledgement slot that is released again unless committed
struct PendingAck<'a> {
    shared: &'a SharedState,
    id: AckId,
    armed: bool,
}

impl<'a> PendingAck<'a> {
    fn reserve(shared: &'a SharedState, qos: QoS) -> (Self, AckReceiver) {
        let (id, receiver) = shared.acks().enqueue(qos);
        (
            Self {
                shared,
                id,
                armed: true,
            },
            receiver,
        )
    }

    /// The request reached the transport queue; keep the slot
    fn commit(mut self) -> AckId {
        self.armed = false;
        self.id
    }
}

impl Drop for PendingAck<'_> {
    fn drop(&mut self) {
        if self.armed {
            self.shared.acks().discard(self.id);
        }
    }
}

fn request_error(error: ClientError) -> TransportError {
    match error {
        ClientError::TryRequest(_) => TransportError::QueueFull,
        ClientError::Request(_) => TransportError::RequestFailed(error.to_string()),
    }
}

#[async_trait]
impl SessionClient for MqttSession {
    async fn connect(&self) -> Result<(), TransportError> {
        if self.shared.state() == ConnectionState::Closed {
            return Err(TransportError::SessionClosed);
        }

        let state_rx = self.shared.state_tx.subscribe();
        self.start_supervisor();
        info!(
            client_id = %self.options.client_id,
            broker = %self.options.broker_uri(),
            "Connecting to MQTT broker"
        );
        Self::wait_for_connection_confirmation(state_rx, self.options.connect_timeout).await
    }

    async fn publish(
        &self,
        topic: &str,
        payload: Bytes,
        qos: QoS,
        retain: bool,
    ) -> Result<(), TransportError> {
        if !HealthMonitor::can_publish(&self.shared.state()) {
            return Err(TransportError::SessionClosed);
        }
        if !self.is_started() {
            return Err(TransportError::NotStarted);
        }
        // The transport drops the whole connection on an oversized packet
        if !self.options.publish_fits(topic, payload.len(), qos) {
            return Err(TransportError::PayloadTooLarge {
                topic: topic.to_string(),
                size: publish_packet_size(topic, payload.len(), qos),
                max: self.options.max_packet_size,
            });
        }

        let timeout = self.options.write_timeout;
        let ack_timeout = || TransportError::AckTimeout {
            topic: topic.to_string(),
            timeout,
        };
        let deadline = tokio::time::Instant::now() + timeout;

        let (id, ack) =
            tokio::time::timeout_at(deadline, self.enqueue_publish(topic, payload, qos, retain))
                .await
                .map_err(|_| ack_timeout())??;

        let outcome = match tokio::time::timeout_at(deadline, ack).await {
            Ok(outcome) => outcome,
            Err(_) => {
                self.shared.acks().abandon(id);
                return Err(ack_timeout());
            }
        };

        match outcome {
            Ok(result) => result,
            Err(_) => Err(TransportError::SessionClosed),
        }
    }

    fn subscribe(&self, filters: SubscriptionFilters, callback: MessageCallback) {
        if filters.is_empty() {
            return;
        }
        if self.shared.state() == ConnectionState::Closed {
            warn!(
                filters = ?filters.keys().collect::<Vec<_>>(),
                "Ignoring subscription on closed session"
            );
            return;
        }

        self.shared.registry.register(&filters, callback);

        let requests: Vec<SubscribeFilter> = filters
            .iter()
            .map(|(filter, qos)| SubscribeFilter::new(filter.clone(), to_mqtt_qos(*qos)))
            .collect();
        match self.client.try_subscribe_many(requests) {
            Ok(()) => debug!(filters = ?filters, "Subscription queued"),
            Err(e) => {
                let error = request_error(e);
                error!(filters = ?filters, error = %error, "Failed to queue subscription");
            }
        }
    }

    fn unsubscribe(&self, filters: &[&str]) {
        let removed = self.shared.registry.remove(filters);
        debug!(filters = ?removed, "Removed subscriptions");

        for filter in filters {
            if let Err(e) = self.client.try_unsubscribe(*filter) {
                let error = request_error(e);
                error!(filter = %filter, error = %error, "Failed to queue unsubscribe");
            }
        }
    }

    async fn disconnect(&self) -> Result<(), TransportError> {
        let handle = self.supervisor_handle().take();
        self.event_loop
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();

        let Some(mut handle) = handle else {
            self.shared.close();
            return Ok(());
        };

        if self.shared.state() == ConnectionState::Connected {
            if let Err(e) = self.client.try_disconnect() {
                debug!(error = %e, "Could not queue DISCONNECT, stopping supervisor directly");
                self.shutdown_tx.send_replace(true);
            }
        } else {
            self.shutdown_tx.send_replace(true);
        }

        match tokio::time::timeout(DISCONNECT_GRACE, &mut handle).await {
            Ok(Ok(())) => info!("MQTT session shut down gracefully"),
            Ok(Err(e)) if !e.is_cancelled() => warn!(error = %e, "MQTT supervisor ended with error"),
            Ok(Err(_)) => {}
            Err(_) => {
                warn!("MQTT supervisor did not stop in time, aborting");
                self.shutdown_tx.send_replace(true);
                handle.abort();
            }
        }

        self.shared.close();
        info!(client_id = %self.options.client_id, "MQTT session disconnected");
        Ok(())
    }

    fn client_id(&self) -> &str {
        &self.options.client_id
    }

    fn connection_state(&self) -> ConnectionState {
        self.shared.state()
    }
}

impl Drop for MqttSession {
    fn drop(&mut self) {
        // Background work cannot be awaited here; call disconnect() for a
        // graceful shutdown
        self.shutdown_tx.send_replace(true);
        if let Some(handle) = self.supervisor_handle().take() {
            handle.abort();
        }
    }
}

impl fmt::Debug for MqttSession {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MqttSession")
            .field("client_id", &self.options.client_id)
            .field("broker", &self.options.broker_uri())
            .field("state", &self.shared.state())
            .finish()
    }
}

/// Background task driving the event loop
struct Supervisor {
    client: AsyncClient,
    options: SessionOptions,
    shared: Arc<SharedState>,
    policy: ReconnectPolicy,
    ping: PingTracker,
    has_connected: bool,
}

impl Supervisor {
    fn new(client: AsyncClient, options: SessionOptions, shared: Arc<SharedState>) -> Self {
        let policy = ReconnectPolicy::new(options.max_reconnect_interval);
        Self {
            client,
            options,
            shared,
            policy,
            ping: PingTracker::default(),
            has_connected: false,
        }
    }

    async fn run(mut self, mut event_loop: EventLoop, mut shutdown_rx: watch::Receiver<bool>) {
        info!(client_id = %self.options.client_id, "Starting MQTT supervisor");
        self.shared.transition(&ConnectionEvent::ConnectStarted);

        loop {
            let poll_timeout = match self.shared.state() {
                ConnectionState::Connected => None,
                _ => Some(self.options.connect_timeout),
            };
            let ping_deadline = self.ping.deadline();

            let outcome = tokio::select! {
                changed = shutdown_rx.changed() => {
                    if changed.is_err() || *shutdown_rx.borrow() {
                        info!("Shutdown signal received, stopping MQTT supervisor");
                        break;
                    }
                    continue;
                }
                _ = sleep_until(ping_deadline) => Err(PollFailure::PingTimeout),
                result = poll_event(&mut event_loop, poll_timeout) => result,
            };

            let keep_running = match outcome {
                Ok(event) => self.process_event_route(route_mqtt_event(&event)).await,
                Err(failure) => {
                    self.handle_poll_failure(failure, &mut event_loop, shutdown_rx.clone())
                        .await
                }
            };
            if !keep_running {
                break;
            }
        }

        self.shared.close();
        info!(client_id = %self.options.client_id, "MQTT supervisor stopped");
    }

    /// Apply a routed event; returns false when the session is ending
    async fn process_event_route(&mut self, route: EventRoute) -> bool {
        match route {
            EventRoute::ConnectionAcknowledged { session_present } => {
                self.policy.reset();
                self.ping.clear();
                self.shared.transition(&ConnectionEvent::ConnAckReceived);
                info!(
                    client_id = %self.options.client_id,
                    session_present,
                    "MQTT broker accepted connection"
                );

                if self.has_connected && !session_present && self.options.resume_subscriptions {
                    self.resubscribe();
                }
                self.has_connected = true;
                self.shared.callbacks.connected();
                true
            }
            EventRoute::MessageReceived(message) => {
                debug!(topic = %message.topic(), bytes = message.payload().len(), "Received MQTT message");
                self.shared.registry.dispatch(message).await;
                true
            }
            EventRoute::PublishSent { pkid } => {
                self.shared.acks().on_publish_sent(pkid);
                true
            }
            EventRoute::PublishAcknowledged { pkid } => {
                self.shared.acks().on_acknowledged(pkid);
                true
            }
            EventRoute::SubscriptionAcknowledged { pkid, rejected } => {
                if rejected > 0 {
                    warn!(pkid, rejected, "Broker rejected subscription filters");
                } else {
                    debug!(pkid, "Subscription confirmed");
                }
                true
            }
            EventRoute::PingSent => {
                self.ping.ping_sent(Instant::now(), self.options.ping_timeout);
                true
            }
            EventRoute::PingAnswered => {
                self.ping.pong_received();
                true
            }
            EventRoute::DisconnectSent => {
                info!("DISCONNECT sent, ending MQTT session");
                false
            }
            EventRoute::BrokerDisconnected => {
                warn!("MQTT broker sent DISCONNECT");
                true
            }
            EventRoute::InfrastructureEvent(event) => {
                debug!(target: "mqtt_transport", "MQTT event: {}", event);
                true
            }
            EventRoute::OutgoingEvent => true,
        }
    }

    /// Report the failure and back off; returns false on shutdown
    async fn handle_poll_failure(
        &mut self,
        failure: PollFailure,
        event_loop: &mut EventLoop,
        shutdown_rx: watch::Receiver<bool>,
    ) -> bool {
        if let PollFailure::Connection(ConnectionError::RequestsDone) = failure {
            debug!("Request channel closed, stopping MQTT supervisor");
            return false;
        }
        if matches!(
            failure,
            PollFailure::PingTimeout | PollFailure::ConnectTimeout(_)
        ) {
            event_loop.clean();
        }
        self.ping.clear();

        let error = failure.to_transport_error();
        if self.shared.state() == ConnectionState::Connected {
            self.shared
                .transition(&ConnectionEvent::ConnectionLost(error.to_string()));
            error!(client_id = %self.options.client_id, error = %error, "MQTT connection lost");
            self.shared.callbacks.connection_lost(&error);
        } else {
            self.shared
                .transition(&ConnectionEvent::ConnectFailed(error.to_string()));
            warn!(client_id = %self.options.client_id, error = %error, "MQTT connection attempt failed");
        }

        let delay = self.policy.next_delay();
        info!(
            attempt = self.policy.attempts(),
            delay_ms = delay.as_millis() as u64,
            "Reconnecting to MQTT broker"
        );
        if !interruptible_sleep(shutdown_rx, delay).await {
            return false;
        }

        self.shared.transition(&ConnectionEvent::ConnectStarted);
        true
    }

    /// Re-issue every registered filter after the broker lost our session
    fn resubscribe(&self) {
        let filters = self.shared.registry.filters();
        if filters.is_empty() {
            return;
        }

        info!(count = filters.len(), "Broker has no stored session, resubscribing");
        let requests: Vec<SubscribeFilter> = filters
            .into_iter()
            .map(|(filter, qos)| SubscribeFilter::new(filter, to_mqtt_qos(qos)))
            .collect();
        if let Err(e) = self.client.try_subscribe_many(requests) {
            let error = request_error(e);
            error!(error = %error, "Failed to queue resubscription");
        }
    }
}

async fn poll_event(
    event_loop: &mut EventLoop,
    timeout: Option<Duration>,
) -> Result<Event, PollFailure> {
    match timeout {
        Some(timeout) => match tokio::time::timeout(timeout, event_loop.poll()).await {
            Ok(result) => result.map_err(PollFailure::Connection),
            Err(_) => Err(PollFailure::ConnectTimeout(timeout)),
        },
        None => event_loop.poll().await.map_err(PollFailure::Connection),
    }
}

async fn sleep_until(deadline: Option<Instant>) {
    match deadline {
        Some(deadline) => tokio::time::sleep_until(tokio::time::Instant::from_std(deadline)).await,
        None => std::future::pending().await,
    }
}

/// Sleep unless shutdown is requested first.
/// Returns true if the sleep completed, false if shutdown was requested.
async fn interruptible_sleep(mut shutdown_rx: watch::Receiver<bool>, delay: Duration) -> bool {
    if *shutdown_rx.borrow() {
        return false;
    }
    tokio::select! {
        changed = shutdown_rx.changed() => {
            if changed.is_err() || *shutdown_rx.borrow() {
                info!("Shutdown signal received during reconnect delay");
                return false;
            }
            true
        }
        _ = tokio::time::sleep(delay) => true,
    }
}
