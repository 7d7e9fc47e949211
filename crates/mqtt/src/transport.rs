//! The seam between a device session and the MQTT library.
//!
//! A session owner drives a [`Transport`] from its foreground thread and
//! receives asynchronous notifications through an [`EventSink`] that it
//! registers when the transport is constructed. Notifications arrive on the
//! transport's network thread, one at a time, concurrently with foreground
//! calls.

use std::fmt;

pub use rumqttc::QoS;

use super::error::TransferError;

/// Broker address for one connect attempt.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Endpoint {
    pub host: String,
    pub port: u16,
}

impl Endpoint {
    pub fn new(host: impl Into<String>, port: u16) -> Self {
        Self {
            host: host.into(),
            port,
        }
    }
}

impl fmt::Display for Endpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.host, self.port)
    }
}

/// Callbacks invoked by a transport's network thread.
pub trait EventSink: Send + Sync {
    /// Session established. `result` describes the CONNACK outcome.
    fn on_connect(&self, result: &str);

    /// Session lost. `from_server` is true when the broker sent DISCONNECT.
    fn on_disconnect(&self, reason: &str, from_server: bool);

    /// Inbound PUBLISH on a subscribed topic.
    fn on_message(&self, topic: &str, payload: &[u8]);

    /// Outbound QoS 1 publish acknowledged.
    fn on_publish(&self, _pkid: u16) {}
}

/// An MQTT session as seen by the foreground thread.
pub trait Transport: Send {
    /// Opens a session. `Ok` means the broker accepted the transport
    /// connection; [`Transport::is_connected`] reports when the session is
    /// usable.
    fn connect(&mut self, endpoint: &Endpoint) -> Result<(), TransferError>;

    /// Live session state, read from the network side.
    fn is_connected(&self) -> bool;

    /// Closes the session. Closing an idle transport is not an error.
    fn disconnect(&mut self) -> Result<(), TransferError>;

    /// Queues a publish. Returns once the request is handed to the network
    /// thread.
    fn publish(&self, topic: &str, qos: QoS, payload: Vec<u8>) -> Result<(), TransferError>;

    /// Subscribes and remembers the subscription for later reconnects.
    fn subscribe(&mut self, topic: &str, qos: QoS) -> Result<(), TransferError>;
}
