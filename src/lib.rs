//! MQTT Messenger
//!
//! A persistent MQTT session factory and a capability-oriented
//! publish/subscribe facade. Application code talks to [`Publisher`],
//! [`Subscriber`] or [`PublishSubscriber`]; session setup, TLS material,
//! reconnects and subscription resumption stay behind them.
//!
//! # Overview
//!
//! - [`identity`] - Random client identifiers
//! - [`security`] - TLS trust roots and client certificates
//! - [`session`] - Persistent session factory
//! - [`messenger`] - Publish/subscribe facade
//! - [`transport`] - Session capability interface and its MQTT implementation
//!
//! # Quick Start
//!
//! ```rust,no_run
//! use mqtt_messenger::{
//!     new_persistent_session, ClientConfig, Message, Messenger, Publisher, QoS, SessionClient,
//!     SessionSettings, Subscriber,
//! };
//! use std::sync::Arc;
//!
//! # tokio_test::block_on(async {
//! let config = ClientConfig::default().with_will("devices/7/status", "offline", QoS::AtLeastOnce, true);
//! let session = Arc::new(new_persistent_session(config, &SessionSettings::default())?);
//! session.connect().await?;
//!
//! let messenger = Messenger::new(session.clone());
//! messenger.subscribe("devices/+/status", QoS::AtLeastOnce, Arc::new(|message: Message| {
//!     println!("{} -> {:?}", message.topic(), message.payload());
//! }));
//! messenger.publish("devices/7/status", b"online", QoS::AtLeastOnce, true).await?;
//!
//! session.disconnect().await?;
//! # Ok::<(), Box<dyn std::error::Error>>(())
//! # });
//! ```

pub mod config;
pub mod error;
pub mod identity;
pub mod messenger;
pub mod observability;
pub mod security;
pub mod session;
pub mod testing;
pub mod transport;
pub mod version;

pub use config::{BrokerAddress, ConfigError, MessengerConfig, SessionSettings};
pub use error::{MessagingError, MessagingResult};
pub use identity::new_identifier;
pub use messenger::{Messenger, PublishSubscriber, Publisher, Subscriber};
pub use security::{build_security_context, SecurityContext};
pub use session::{new_persistent_session, ClientConfig};
pub use transport::mqtt::MqttSession;
pub use transport::{
    ConnectionState, Message, MessageCallback, QoS, SessionClient, SubscriptionFilters,
    TransportError,
};
