use iotc_mqtt::TransferError;
use thiserror::Error;

use super::{c2d::C2dError, telemetry::TelemetryError};
use crate::config::ConfigError;

/// Top-level error of the device client.
///
/// - `Configuration` is raised while building a session and is never
///   retried internally.
/// - `Transport` comes from a single MQTT operation; connect failures are
///   absorbed by the connect loop and only show up as a disconnected state.
/// - `Validation` rejects telemetry before anything is sent.
/// - `ProtocolParse` describes a malformed inbound message. The dispatcher
///   logs and drops these, they never reach callers of the session.
#[derive(Debug, Error)]
pub enum IotcError {
    #[error(transparent)]
    Configuration(#[from] ConfigError),

    #[error("MQTT transport error: {0}")]
    Transport(#[from] TransferError),

    #[error("Telemetry validation error: {0}")]
    Validation(#[from] TelemetryError),

    #[error("C2D protocol error: {0}")]
    ProtocolParse(#[from] C2dError),
}
