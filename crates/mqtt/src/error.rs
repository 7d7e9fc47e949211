//! Error handling for the MQTT transport.
//!
//! `TransferError` is the single error type returned by every operation of
//! this crate. The variants fall into three groups:
//!
//! **Setup errors** (raised before any network traffic):
//! - `ClientSetup`: TLS identity could not be loaded or assembled
//! - `Io`: certificate files could not be read, runtime could not start
//!
//! **Connect errors** (raised by a single connect attempt):
//! - `ClientConnection`: TCP, DNS, TLS or CONNACK failure
//! - `HandshakeTimeout`: the broker did not answer within the configured time
//!
//! **Runtime errors** (raised while a session is up):
//! - `ClientTransfer`: the request could not be queued to the network task
//! - `NotConnected`: publish/subscribe requested without a live session
//!
//! Connect errors are expected to be retried by the caller's connect loop;
//! setup errors are not.

use std::time::Duration;

use thiserror::Error;

/// The unified error type for MQTT transport operations.
#[derive(Debug, Error)]
pub enum TransferError {
    /// The client could not be assembled.
    ///
    /// Typical causes:
    /// - certificate file has no PEM certificate in it
    /// - key file has no private key in it
    /// - rustls rejected the certificate/key pair
    #[error("Client setup error: {0}")]
    ClientSetup(String),

    /// The request could not be handed over to the network task.
    ///
    /// Usually means the network task already stopped (after a disconnect or
    /// a fatal error). Reconnect before retrying.
    #[error("Client transfer error: {0}")]
    ClientTransfer(#[from] rumqttc::ClientError),

    /// The broker could not be reached or refused the session.
    ///
    /// Boxed, `ConnectionError` is large.
    #[error("Client connection error: {0}")]
    ClientConnection(#[from] Box<rumqttc::ConnectionError>),

    /// No CONNACK arrived within the handshake window.
    #[error("Connection handshake timed out after {0:?}")]
    HandshakeTimeout(Duration),

    /// The first event of a fresh session was not a CONNACK.
    #[error("Unexpected handshake event: {0}")]
    UnexpectedHandshake(String),

    /// Operation requires a live session.
    #[error("Not connected")]
    NotConnected,

    /// File or runtime I/O failure.
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Boxes rumqttc's `ConnectionError` so `?` works on `EventLoop::poll` results.
impl From<rumqttc::ConnectionError> for TransferError {
    fn from(err: rumqttc::ConnectionError) -> Self {
        TransferError::ClientConnection(Box::new(err))
    }
}
