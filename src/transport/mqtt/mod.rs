//! MQTT implementation of the session capability interface
//!
//! This module separates pure functions from I/O operations for
//! testability.
//!
//! # Architecture
//!
//! - [`connection`] - Pure session options and their conversion to `rumqttc`
//! - [`message_handler`] - Event routing, topic matching, delivery and ack bookkeeping
//! - [`health_monitor`] - Pure state transitions, backoff and ping tracking
//! - [`client`] - Impure I/O operations and coordination
//!
//! # Usage
//!
//! ```rust,no_run
//! use mqtt_messenger::transport::mqtt::{MqttSession, SessionCallbacks, SessionOptions};
//! use mqtt_messenger::transport::SessionClient;
//!
//! # tokio_test::block_on(async {
//! let options = SessionOptions::new("sensor-7", "localhost", 1883);
//! let session = MqttSession::new(options, SessionCallbacks::default())?;
//! session.connect().await?;
//! # Ok::<(), Box<dyn std::error::Error>>(())
//! # });
//! ```

pub mod client;
pub mod connection;
pub mod health_monitor;
pub mod message_handler;

pub use client::{ConnectCallback, ConnectionLostCallback, MqttSession, SessionCallbacks};
pub use connection::{
    LastWillOptions, SessionOptions, DEFAULT_TCP_PORT, DEFAULT_TLS_PORT, MQTT_MAX_PACKET_SIZE,
};
pub use health_monitor::{ConnectionEvent, HealthMonitor, ReconnectPolicy};
pub use message_handler::{topic_matches, AckId, AckTracker, EventRoute, SubscriptionRegistry};
