//! Pure connection option handling for the MQTT session
//!
//! [`SessionOptions`] is the immutable description of one logical
//! connection. Converting it into `rumqttc` options is a pure function so
//! the factory output can be inspected without touching the network.

use crate::config::{validate_keepalive, ConfigError};
use crate::security::SecurityContext;
use crate::transport::QoS;
use bytes::Bytes;
use rumqttc::{LastWill, MqttOptions, NetworkOptions, TlsConfiguration, Transport};
use std::sync::Arc;
use std::time::Duration;
use tracing::warn;

/// Default port for plain TCP brokers
pub const DEFAULT_TCP_PORT: u16 = 1883;
/// Default port for TLS brokers
pub const DEFAULT_TLS_PORT: u16 = 8883;
/// Bound on queued requests and on each delivery worker's backlog
pub const DEFAULT_MESSAGE_CHANNEL_DEPTH: usize = 100;
/// MQTT 3.1.1
pub const PROTOCOL_VERSION: u8 = 4;
/// Largest remaining length the MQTT fixed header can encode (256 MiB)
pub const MQTT_MAX_PACKET_SIZE: usize = 268_435_455;

/// Message the broker publishes on our behalf if we vanish
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LastWillOptions {
    pub topic: String,
    pub payload: Bytes,
    pub qos: QoS,
    pub retain: bool,
}

/// Immutable options for one persistent session
#[derive(Debug, Clone)]
pub struct SessionOptions {
    pub client_id: String,
    pub host: String,
    pub port: u16,
    pub tls: bool,
    pub clean_session: bool,
    pub auto_reconnect: bool,
    pub resume_subscriptions: bool,
    pub message_channel_depth: usize,
    pub protocol_version: u8,
    /// When false, callbacks for different subscriptions may run concurrently
    pub order_matters: bool,
    pub connect_timeout: Duration,
    pub keep_alive: Duration,
    pub max_reconnect_interval: Duration,
    pub ping_timeout: Duration,
    pub write_timeout: Duration,
    /// Limit applied to packets in both directions
    pub max_packet_size: usize,
    pub last_will: Option<LastWillOptions>,
    pub username: Option<String>,
    pub password: Option<String>,
    pub security: Option<Arc<SecurityContext>>,
}

impl SessionOptions {
    /// Options with persistent-session defaults for a plain TCP broker
    pub fn new(client_id: impl Into<String>, host: impl Into<String>, port: u16) -> Self {
        Self {
            client_id: client_id.into(),
            host: host.into(),
            port,
            tls: false,
            clean_session: false,
            auto_reconnect: true,
            resume_subscriptions: true,
            message_channel_depth: DEFAULT_MESSAGE_CHANNEL_DEPTH,
            protocol_version: PROTOCOL_VERSION,
            order_matters: false,
            connect_timeout: Duration::from_secs(10),
            keep_alive: Duration::from_secs(30),
            max_reconnect_interval: Duration::from_secs(120),
            ping_timeout: Duration::from_secs(10),
            write_timeout: Duration::from_secs(5),
            max_packet_size: MQTT_MAX_PACKET_SIZE,
            last_will: None,
            username: None,
            password: None,
            security: None,
        }
    }

    /// Broker URI in `tcp://host:port` or `ssl://host:port` form
    pub fn broker_uri(&self) -> String {
        let scheme = if self.tls { "ssl" } else { "tcp" };
        if self.host.contains(':') {
            format!("{scheme}://[{}]:{}", self.host, self.port)
        } else {
            format!("{scheme}://{}:{}", self.host, self.port)
        }
    }

    /// Build the `rumqttc` options for this session (pure apart from
    /// loading system trust roots when TLS has no explicit CA)
    pub fn to_mqtt_options(&self) -> Result<MqttOptions, ConfigError> {
        let mut options = MqttOptions::new(self.client_id.clone(), self.host.clone(), self.port);
        options.set_clean_session(self.clean_session);
        options.set_keep_alive(validate_keepalive(self.keep_alive)?);
        options.set_max_packet_size(self.max_packet_size, self.max_packet_size);

        if let Some(will) = &self.last_will {
            options.set_last_will(LastWill::new(
                will.topic.clone(),
                will.payload.to_vec(),
                to_mqtt_qos(will.qos),
                will.retain,
            ));
        }

        match (&self.username, &self.password) {
            (Some(username), password) => {
                options.set_credentials(username.clone(), password.clone().unwrap_or_default());
            }
            (None, Some(_)) => {
                warn!("MQTT password configured without a username, ignoring credentials");
            }
            (None, None) => {}
        }

        if self.tls {
            let transport = match &self.security {
                Some(context) if !context.is_empty() => Transport::tls_with_config(
                    TlsConfiguration::Rustls(Arc::new(context.client_config()?)),
                ),
                _ => Transport::tls_with_default_config(),
            };
            options.set_transport(transport);
        }

        Ok(options)
    }

    /// Socket options for the event loop. The connect timeout covers the
    /// TCP/TLS handshake and the wait for CONNACK.
    pub fn network_options(&self) -> NetworkOptions {
        let mut network = NetworkOptions::new();
        network.set_connection_timeout(whole_seconds(self.connect_timeout));
        network
    }

    /// Whether a PUBLISH with this topic and payload fits within `max_packet_size`
    pub fn publish_fits(&self, topic: &str, payload_len: usize, qos: QoS) -> bool {
        publish_packet_size(topic, payload_len, qos) <= self.max_packet_size
    }
}

/// Round up to whole seconds, never below one
fn whole_seconds(duration: Duration) -> u64 {
    let secs = duration.as_secs() + u64::from(duration.subsec_nanos() > 0);
    secs.max(1)
}

/// Encoded size of a PUBLISH packet, fixed header included
pub fn publish_packet_size(topic: &str, payload_len: usize, qos: QoS) -> usize {
    let packet_id = if qos == QoS::AtMostOnce { 0 } else { 2 };
    let remaining = 2 + topic.len() + packet_id + payload_len;
    let length_bytes = match remaining {
        0..=127 => 1,
        128..=16_383 => 2,
        16_384..=2_097_151 => 3,
        _ => 4,
    };
    1 + length_bytes + remaining
}

/// Convert to the transport's QoS type
pub fn to_mqtt_qos(qos: QoS) -> rumqttc::QoS {
    match qos {
        QoS::AtMostOnce => rumqttc::QoS::AtMostOnce,
        QoS::AtLeastOnce => rumqttc::QoS::AtLeastOnce,
        QoS::ExactlyOnce => rumqttc::QoS::ExactlyOnce,
    }
}
