//! Mock implementations for testing
//!
//! [`MockSession`] implements [`SessionClient`] in memory so the messenger
//! and anything built on it can be tested without a broker.

use crate::transport::mqtt::topic_matches;
use crate::transport::{
    ConnectionState, Message, MessageCallback, QoS, SessionClient, SubscriptionFilters,
    TransportError,
};
use async_trait::async_trait;
use bytes::Bytes;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Mutex, MutexGuard, PoisonError};

/// A publish recorded by [`MockSession`]
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PublishedMessage {
    pub topic: String,
    pub payload: Bytes,
    pub qos: QoS,
    pub retain: bool,
}

struct Registration {
    filters: SubscriptionFilters,
    callback: MessageCallback,
}

/// In-memory session for testing
pub struct MockSession {
    client_id: String,
    ack_failure: Option<TransportError>,
    state: Mutex<ConnectionState>,
    published: Mutex<Vec<PublishedMessage>>,
    registrations: Mutex<Vec<Registration>>,
    unsubscribed: Mutex<Vec<String>>,
    publish_calls: AtomicUsize,
    subscription_calls: AtomicUsize,
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

impl MockSession {
    pub fn new(client_id: impl Into<String>) -> Self {
        Self {
            client_id: client_id.into(),
            ack_failure: None,
            state: Mutex::new(ConnectionState::Disconnected),
            published: Mutex::new(Vec::new()),
            registrations: Mutex::new(Vec::new()),
            unsubscribed: Mutex::new(Vec::new()),
            publish_calls: AtomicUsize::new(0),
            subscription_calls: AtomicUsize::new(0),
        }
    }

    /// Every publish fails with the given error, as if the ack never came
    pub fn with_ack_failure(mut self, error: TransportError) -> Self {
        self.ack_failure = Some(error);
        self
    }

    pub fn published(&self) -> Vec<PublishedMessage> {
        lock(&self.published).clone()
    }

    /// Number of publish calls that reached the session, failed or not
    pub fn publish_calls(&self) -> usize {
        self.publish_calls.load(Ordering::SeqCst)
    }

    pub fn subscription_calls(&self) -> usize {
        self.subscription_calls.load(Ordering::SeqCst)
    }

    /// Every filter currently registered, sorted by filter
    pub fn subscribed_filters(&self) -> Vec<(String, QoS)> {
        let mut filters: Vec<(String, QoS)> = lock(&self.registrations)
            .iter()
            .flat_map(|registration| {
                registration
                    .filters
                    .iter()
                    .map(|(filter, qos)| (filter.clone(), *qos))
            })
            .collect();
        filters.sort();
        filters
    }

    pub fn unsubscribed(&self) -> Vec<String> {
        lock(&self.unsubscribed).clone()
    }

    /// Simulate an inbound message; returns how many callbacks ran.
    ///
    /// Each registration is invoked at most once even when several of its
    /// filters match.
    pub fn deliver(&self, topic: &str, payload: impl Into<Bytes>) -> usize {
        let message = Message::new(topic, payload);
        let callbacks: Vec<MessageCallback> = lock(&self.registrations)
            .iter()
            .filter(|registration| {
                registration
                    .filters
                    .keys()
                    .any(|filter| topic_matches(filter, topic))
            })
            .map(|registration| registration.callback.clone())
            .collect();

        for callback in &callbacks {
            callback(message.clone());
        }
        callbacks.len()
    }
}

#[async_trait]
impl SessionClient for MockSession {
    async fn connect(&self) -> Result<(), TransportError> {
        let mut state = lock(&self.state);
        if *state == ConnectionState::Closed {
            return Err(TransportError::SessionClosed);
        }
        *state = ConnectionState::Connected;
        Ok(())
    }

    async fn publish(
        &self,
        topic: &str,
        payload: Bytes,
        qos: QoS,
        retain: bool,
    ) -> Result<(), TransportError> {
        self.publish_calls.fetch_add(1, Ordering::SeqCst);
        if let Some(error) = &self.ack_failure {
            return Err(error.clone());
        }

        lock(&self.published).push(PublishedMessage {
            topic: topic.to_string(),
            payload,
            qos,
            retain,
        });
        Ok(())
    }

    fn subscribe(&self, filters: SubscriptionFilters, callback: MessageCallback) {
        self.subscription_calls.fetch_add(1, Ordering::SeqCst);
        let mut registrations = lock(&self.registrations);
        for registration in registrations.iter_mut() {
            registration
                .filters
                .retain(|filter, _| !filters.contains_key(filter));
        }
        registrations.retain(|registration| !registration.filters.is_empty());
        registrations.push(Registration { filters, callback });
    }

    fn unsubscribe(&self, filters: &[&str]) {
        let mut registrations = lock(&self.registrations);
        for registration in registrations.iter_mut() {
            registration
                .filters
                .retain(|filter, _| !filters.contains(&filter.as_str()));
        }
        registrations.retain(|registration| !registration.filters.is_empty());
        lock(&self.unsubscribed).extend(filters.iter().map(|f| f.to_string()));
    }

    async fn disconnect(&self) -> Result<(), TransportError> {
        *lock(&self.state) = ConnectionState::Closed;
        Ok(())
    }

    fn client_id(&self) -> &str {
        &self.client_id
    }

    fn connection_state(&self) -> ConnectionState {
        lock(&self.state).clone()
    }
}
