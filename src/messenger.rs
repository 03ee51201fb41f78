//! Capability-oriented publish/subscribe facade
//!
//! Application code depends on [`Publisher`], [`Subscriber`] or
//! [`PublishSubscriber`] and never sees the session, its reconnect
//! handling or the wire protocol.

use crate::error::{MessagingError, MessagingResult};
use crate::transport::{MessageCallback, QoS, SessionClient, SubscriptionFilters};
use async_trait::async_trait;
use bytes::Bytes;
use std::sync::Arc;
use tracing::debug;

/// Capability to publish messages
#[async_trait]
pub trait Publisher: Send + Sync {
    /// Publish and wait for the delivery acknowledgement.
    ///
    /// Failures are returned to the caller and never retried.
    async fn publish(
        &self,
        topic: &str,
        payload: &[u8],
        qos: QoS,
        retain: bool,
    ) -> MessagingResult<()>;
}

/// Capability to receive messages
pub trait Subscriber: Send + Sync {
    /// Register a callback for one topic filter
    fn subscribe(&self, filter: &str, qos: QoS, callback: MessageCallback);

    /// Register one callback for a whole set of filters at once
    fn subscribe_multiple(&self, filters: SubscriptionFilters, callback: MessageCallback);

    /// Remove interest in the given filters; messages already in flight
    /// may still reach the callback
    fn unsubscribe(&self, filters: &[&str]);
}

/// Both capabilities
pub trait PublishSubscriber: Publisher + Subscriber {}

impl<T: Publisher + Subscriber> PublishSubscriber for T {}

/// Facade over a shared session
pub struct Messenger<C: SessionClient> {
    client: Arc<C>,
}

impl<C: SessionClient> Messenger<C> {
    pub fn new(client: Arc<C>) -> Self {
        Self { client }
    }

    /// The session this messenger publishes through
    pub fn client(&self) -> &Arc<C> {
        &self.client
    }
}

impl<C: SessionClient> Clone for Messenger<C> {
    fn clone(&self) -> Self {
        Self {
            client: self.client.clone(),
        }
    }
}

#[async_trait]
impl<C: SessionClient + 'static> Publisher for Messenger<C> {
    async fn publish(
        &self,
        topic: &str,
        payload: &[u8],
        qos: QoS,
        retain: bool,
    ) -> MessagingResult<()> {
        if topic.is_empty() {
            return Err(MessagingError::invalid_argument("topic must not be empty"));
        }

        self.client
            .publish(topic, Bytes::copy_from_slice(payload), qos, retain)
            .await?;
        debug!(topic, qos = %qos, retain, bytes = payload.len(), "Published message");
        Ok(())
    }
}

impl<C: SessionClient + 'static> Subscriber for Messenger<C> {
    fn subscribe(&self, filter: &str, qos: QoS, callback: MessageCallback) {
        let filters = SubscriptionFilters::from([(filter.to_string(), qos)]);
        self.client.subscribe(filters, callback);
    }

    fn subscribe_multiple(&self, filters: SubscriptionFilters, callback: MessageCallback) {
        self.client.subscribe(filters, callback);
    }

    fn unsubscribe(&self, filters: &[&str]) {
        self.client.unsubscribe(filters);
    }
}
