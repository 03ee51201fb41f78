//! Transport capability layer
//!
//! This module defines the narrow capability interface the session factory
//! and the messenger depend on, plus the boundary types that cross it.
//! The concrete MQTT implementation lives in [`mqtt`].

use crate::error::MessagingError;
use bytes::Bytes;
use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;

pub mod mqtt;

/// Delivery guarantee for a publish or a subscription
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Default)]
pub enum QoS {
    /// Fire and forget
    #[default]
    AtMostOnce = 0,
    /// Acknowledged delivery, duplicates possible
    AtLeastOnce = 1,
    /// Four-way handshake delivery
    ExactlyOnce = 2,
}

impl QoS {
    pub fn as_u8(self) -> u8 {
        self as u8
    }
}

impl TryFrom<u8> for QoS {
    type Error = MessagingError;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        match value {
            0 => Ok(QoS::AtMostOnce),
            1 => Ok(QoS::AtLeastOnce),
            2 => Ok(QoS::ExactlyOnce),
            other => Err(MessagingError::invalid_argument(format!(
                "QoS must be 0, 1 or 2, got {other}"
            ))),
        }
    }
}

impl fmt::Display for QoS {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_u8())
    }
}

/// Inbound message handed to subscriber callbacks.
///
/// Only the topic and payload cross this boundary; QoS, retain flag and
/// packet identifiers stay inside the transport.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Message {
    topic: String,
    payload: Bytes,
}

impl Message {
    pub fn new(topic: impl Into<String>, payload: impl Into<Bytes>) -> Self {
        Self {
            topic: topic.into(),
            payload: payload.into(),
        }
    }

    pub fn topic(&self) -> &str {
        &self.topic
    }

    pub fn payload(&self) -> &[u8] {
        &self.payload
    }
}

/// Callback invoked once per matching inbound message
pub type MessageCallback = Arc<dyn Fn(Message) + Send + Sync>;

/// Topic filter to QoS mapping registered in one call
pub type SubscriptionFilters = HashMap<String, QoS>;

/// Lifecycle of the underlying network session
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConnectionState {
    /// Not connected; the initial state and the state after a loss
    Disconnected,
    /// Connection attempt in progress
    Connecting,
    /// CONNACK received, traffic flows
    Connected,
    /// Explicitly shut down; terminal
    Closed,
}

/// Runtime transport failures
///
/// Cloneable so a single failure can be fanned out to every waiting publisher.
#[derive(Debug, Clone, Error, PartialEq)]
pub enum TransportError {
    #[error("Session has not been started")]
    NotStarted,
    #[error("Session is closed")]
    SessionClosed,
    #[error("Request queue is full")]
    QueueFull,
    #[error("Request could not be queued: {0}")]
    RequestFailed(String),
    #[error("No acknowledgement for publish on '{topic}' within {timeout:?}")]
    AckTimeout { topic: String, timeout: Duration },
    #[error("Timed out after {0:?} waiting for the broker to accept the connection")]
    ConnectTimeout(Duration),
    #[error("Connection lost: {0}")]
    ConnectionLost(String),
    #[error("Publish on '{topic}' is {size} bytes, over the {max} byte packet limit")]
    PayloadTooLarge {
        topic: String,
        size: usize,
        max: usize,
    },
}

/// Narrow capability interface over a live messaging session.
///
/// Implementations own the network session and its background work;
/// callers only see connect/publish/subscribe/unsubscribe/disconnect.
#[async_trait::async_trait]
pub trait SessionClient: Send + Sync {
    /// Start the session and wait for the first successful connection
    async fn connect(&self) -> Result<(), TransportError>;

    /// Publish and wait for the delivery acknowledgement
    async fn publish(
        &self,
        topic: &str,
        payload: Bytes,
        qos: QoS,
        retain: bool,
    ) -> Result<(), TransportError>;

    /// Register interest in a set of filters without waiting on the network
    fn subscribe(&self, filters: SubscriptionFilters, callback: MessageCallback);

    /// Remove interest in the given filters without waiting on the network
    fn unsubscribe(&self, filters: &[&str]);

    /// Close the session; terminal
    async fn disconnect(&self) -> Result<(), TransportError>;

    /// Client identifier presented to the broker
    fn client_id(&self) -> &str;

    /// Current lifecycle state
    fn connection_state(&self) -> ConnectionState;
}
