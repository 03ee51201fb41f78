//! Pure health monitoring and reconnection logic for the MQTT session
//!
//! State transitions and backoff delays are computed here without any I/O
//! so the supervisor in [`super::client`] stays a thin coordinator.

use crate::transport::ConnectionState;
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};

/// First reconnect delay
pub const INITIAL_RECONNECT_DELAY: Duration = Duration::from_secs(1);

/// Exponential backoff between reconnect attempts.
///
/// Starts at one second, doubles after every failed attempt and never
/// exceeds the configured maximum. Attempts are unlimited.
#[derive(Debug, Clone)]
pub struct ReconnectPolicy {
    initial: Duration,
    max: Duration,
    current: Duration,
    attempts: u32,
}

impl ReconnectPolicy {
    pub fn new(max: Duration) -> Self {
        let initial = INITIAL_RECONNECT_DELAY.min(max);
        Self {
            initial,
            max,
            current: initial,
            attempts: 0,
        }
    }

    /// Delay before the next attempt; advances the backoff
    pub fn next_delay(&mut self) -> Duration {
        let delay = self.current;
        self.current = self.current.saturating_mul(2).min(self.max);
        self.attempts = self.attempts.saturating_add(1);
        delay
    }

    /// Called once the broker accepts a connection
    pub fn reset(&mut self) {
        self.current = self.initial;
        self.attempts = 0;
    }

    /// Failed attempts since the last successful connection
    pub fn attempts(&self) -> u32 {
        self.attempts
    }
}

/// Events that drive the session state machine
#[derive(Debug, Clone, PartialEq)]
pub enum ConnectionEvent {
    /// A network connection attempt started
    ConnectStarted,
    /// CONNACK received
    ConnAckReceived,
    /// An attempt failed before CONNACK
    ConnectFailed(String),
    /// An established connection dropped
    ConnectionLost(String),
    /// The session was shut down
    ShutdownCompleted,
}

/// Pure state transition and liveness logic
pub struct HealthMonitor;

impl HealthMonitor {
    /// Determine the next state after an event (pure function).
    ///
    /// `Closed` is terminal: no event leaves it.
    pub fn determine_next_state(
        current: &ConnectionState,
        event: &ConnectionEvent,
    ) -> ConnectionState {
        if *current == ConnectionState::Closed {
            return ConnectionState::Closed;
        }

        match event {
            ConnectionEvent::ConnectStarted => ConnectionState::Connecting,
            ConnectionEvent::ConnAckReceived => ConnectionState::Connected,
            ConnectionEvent::ConnectFailed(_) | ConnectionEvent::ConnectionLost(_) => {
                ConnectionState::Disconnected
            }
            ConnectionEvent::ShutdownCompleted => ConnectionState::Closed,
        }
    }

    /// Publishing is accepted in every state but `Closed`; requests made
    /// while disconnected are queued and flushed after reconnecting
    pub fn can_publish(state: &ConnectionState) -> bool {
        !matches!(state, ConnectionState::Closed)
    }

    /// Log a state transition
    pub fn log_state_transition(from: &ConnectionState, to: &ConnectionState) {
        match (from, to) {
            (ConnectionState::Connecting, ConnectionState::Connected) => {
                info!("MQTT connection established");
            }
            (ConnectionState::Connected, ConnectionState::Disconnected) => {
                warn!("MQTT connection lost");
            }
            (_, ConnectionState::Closed) => {
                info!("MQTT session closed");
            }
            _ => {
                debug!("MQTT connection state: {:?} -> {:?}", from, to);
            }
        }
    }
}

/// Outstanding PINGREQ bookkeeping
#[derive(Debug, Clone, Default)]
pub struct PingTracker {
    deadline: Option<Instant>,
}

impl PingTracker {
    /// A PINGREQ went out; the response is due within `timeout`
    pub fn ping_sent(&mut self, now: Instant, timeout: Duration) {
        if self.deadline.is_none() {
            self.deadline = Some(now + timeout);
        }
    }

    pub fn pong_received(&mut self) {
        self.deadline = None;
    }

    pub fn deadline(&self) -> Option<Instant> {
        self.deadline
    }

    pub fn is_expired(&self, now: Instant) -> bool {
        self.deadline.is_some_and(|deadline| now >= deadline)
    }

    pub fn clear(&mut self) {
        self.deadline = None;
    }
}
