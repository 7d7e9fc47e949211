//! MQTT transport for device sessions.
//!
//! This crate hides rumqttc behind a small blocking seam so a device session
//! can be driven from an ordinary thread:
//!
//! * `transport`: the [`Transport`] and [`EventSink`] traits plus [`Endpoint`].
//! * `connection`: [`MqttTransport`], the rumqttc implementation with its own
//!   network thread, automatic reconnects and subscription restore.
//! * `client`: X.509 device identity and rumqttc client construction.
//! * `backoff`: exponential reconnect backoff and jittered connect pauses.
//! * `state`: [`ConnectionState`] as observed by session owners.
//! * `error`: [`TransferError`], the single error type of this crate.

pub mod backoff;
pub mod client;
pub mod connection;
pub mod error;
pub mod state;
pub mod transport;

pub use backoff::{Backoff, Jitter};
pub use client::{ClientBuilder, TlsIdentity};
pub use connection::{MqttTransport, TransportSettings};
pub use error::TransferError;
pub use state::ConnectionState;
pub use transport::{Endpoint, EventSink, QoS, Transport};
