//! Persistent session factory
//!
//! Assembles [`SessionOptions`] from caller-owned [`ClientConfig`] and
//! externally sourced [`SessionSettings`], then hands back an unstarted
//! [`MqttSession`]. Only TLS material can make construction fail.

use crate::config::{validate_keepalive, ConfigError, SessionSettings};
use crate::identity::new_identifier;
use crate::security::build_security_context;
use crate::transport::mqtt::{
    ConnectCallback, ConnectionLostCallback, LastWillOptions, MqttSession, SessionCallbacks,
    SessionOptions, DEFAULT_TCP_PORT, DEFAULT_TLS_PORT,
};
use crate::transport::QoS;
use bytes::Bytes;
use std::fmt;
use std::sync::Arc;
use tracing::{debug, info};

/// Caller-owned identity, last will and lifecycle hooks
#[derive(Clone, Default)]
pub struct ClientConfig {
    /// Empty means "generate one"
    pub client_id: String,
    /// Empty means "no last will"
    pub will_topic: String,
    pub will_payload: Bytes,
    pub will_qos: QoS,
    pub will_retain: bool,
    pub on_connect: Option<ConnectCallback>,
    pub on_connection_lost: Option<ConnectionLostCallback>,
}

impl ClientConfig {
    pub fn new(client_id: impl Into<String>) -> Self {
        Self {
            client_id: client_id.into(),
            ..Default::default()
        }
    }

    /// Attach a last-will message
    pub fn with_will(
        mut self,
        topic: impl Into<String>,
        payload: impl Into<Bytes>,
        qos: QoS,
        retain: bool,
    ) -> Self {
        self.will_topic = topic.into();
        self.will_payload = payload.into();
        self.will_qos = qos;
        self.will_retain = retain;
        self
    }

    pub fn on_connect<F>(mut self, callback: F) -> Self
    where
        F: Fn() + Send + Sync + 'static,
    {
        self.on_connect = Some(Arc::new(callback));
        self
    }

    pub fn on_connection_lost<F>(mut self, callback: F) -> Self
    where
        F: Fn(&crate::transport::TransportError) + Send + Sync + 'static,
    {
        self.on_connection_lost = Some(Arc::new(callback));
        self
    }
}

impl fmt::Debug for ClientConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ClientConfig")
            .field("client_id", &self.client_id)
            .field("will_topic", &self.will_topic)
            .field("will_payload_len", &self.will_payload.len())
            .field("will_qos", &self.will_qos)
            .field("will_retain", &self.will_retain)
            .field("on_connect", &self.on_connect.is_some())
            .field("on_connection_lost", &self.on_connection_lost.is_some())
            .finish()
    }
}

/// Derive the full session options (pure apart from reading TLS files)
pub fn build_session_options(
    config: &ClientConfig,
    settings: &SessionSettings,
) -> Result<SessionOptions, ConfigError> {
    let client_id = if config.client_id.is_empty() {
        let generated = new_identifier();
        debug!(client_id = %generated, "Generated MQTT client identifier");
        generated
    } else {
        config.client_id.clone()
    };

    let default_port = if settings.tls {
        DEFAULT_TLS_PORT
    } else {
        DEFAULT_TCP_PORT
    };
    let mut options = SessionOptions::new(
        client_id,
        settings.address.host(),
        settings.address.port_or(default_port),
    );

    options.connect_timeout = settings.connection_timeout;
    options.keep_alive = validate_keepalive(settings.keepalive)?;
    options.max_reconnect_interval = settings.max_reconnect_interval;
    options.ping_timeout = settings.ping_timeout;
    options.write_timeout = settings.write_timeout;

    if !config.will_topic.is_empty() {
        options.last_will = Some(LastWillOptions {
            topic: config.will_topic.clone(),
            payload: config.will_payload.clone(),
            qos: config.will_qos,
            retain: config.will_retain,
        });
    }

    options.username = settings.username().map(str::to_string);
    options.password = settings.password().map(str::to_string);

    if settings.tls {
        let context = build_security_context(
            settings.ca_path(),
            settings.cert_path(),
            settings.key_path(),
        )?;
        options.tls = true;
        options.security = Some(Arc::new(context));
    }

    Ok(options)
}

/// Build an unstarted persistent session.
///
/// The session is always non-clean, reconnects automatically and resumes
/// its subscriptions. Nothing touches the network until `connect`.
pub fn new_persistent_session(
    config: ClientConfig,
    settings: &SessionSettings,
) -> Result<MqttSession, ConfigError> {
    let options = build_session_options(&config, settings)?;
    info!(
        client_id = %options.client_id,
        broker = %options.broker_uri(),
        will = options.last_will.is_some(),
        "Created persistent MQTT session"
    );

    let callbacks = SessionCallbacks {
        on_connect: config.on_connect,
        on_connection_lost: config.on_connection_lost,
    };
    MqttSession::new(options, callbacks)
}
