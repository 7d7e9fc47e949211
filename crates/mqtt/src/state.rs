//! Connection state of a device session.
//!
//! The session owner publishes this through a `tokio::sync::watch` channel so
//! application code can observe transitions without polling.

use std::fmt;

/// Current state of the device's MQTT session.
///
/// Lifecycle:
/// - `Disconnected` -> `Connecting` (connect loop started)
/// - `Connecting` -> `Connected` (CONNACK received)
/// - `Connecting` -> `Disconnected` (timeout, retries exhausted, cancelled)
/// - `Connected` -> `Disconnected` (network failure, broker or local disconnect)
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConnectionState {
    /// No session. The `String` holds the reason of the last transition.
    Disconnected(String),

    /// The connect loop is running.
    Connecting,

    /// CONNACK received, publishes and subscriptions are live.
    Connected,
}

impl ConnectionState {
    /// Short static name of the state.
    pub fn as_str(&self) -> &'static str {
        match self {
            ConnectionState::Disconnected(_) => "Disconnected",
            ConnectionState::Connecting => "Connecting",
            ConnectionState::Connected => "Connected",
        }
    }

    /// Disconnect reason, empty for the other states.
    pub fn details(&self) -> &str {
        match self {
            ConnectionState::Disconnected(reason) => reason,
            _ => "",
        }
    }

    pub fn is_connected(&self) -> bool {
        matches!(self, ConnectionState::Connected)
    }

    pub fn is_connecting(&self) -> bool {
        matches!(self, ConnectionState::Connecting)
    }
}

impl Default for ConnectionState {
    fn default() -> Self {
        ConnectionState::Disconnected("not connected yet".into())
    }
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())?;
        let details = self.details();
        if !details.is_empty() {
            write!(f, " ({details})")?;
        }
        Ok(())
    }
}
