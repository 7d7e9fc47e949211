//! iotc-lite: device-side client for the IoTConnect platform
//!
//! The crate resolves a device's broker and topics through the REST
//! discovery protocol, keeps a TLS MQTT session alive, publishes telemetry
//! and routes cloud-to-device messages to application callbacks.
//!
//! ## Modules
//!
//! * `config`: device configuration, connection settings, logger and demo
//!   application config loaded from TOML and validated with `validator`.
//!
//! * `core`: the client itself:
//!   - Discovery and identity resolution
//!   - Session manager with the connect-with-backoff loop
//!   - Telemetry encoding
//!   - C2D message classification and dispatch
//!
//! * `logger`: `tracing` subscriber setup with console output (compact,
//!   pretty, JSON) and optional systemd journald.
//!
//! * `protocol`: serde types of the REST and MQTT wire messages.
//!
//! The MQTT transport lives in the `iotc-mqtt` workspace crate.
//!
//! ## Example
//!
//! ```no_run
//! use iotc_lite::{
//!     config::{device::{DeviceConfig, Platform}, settings::ClientSettings},
//!     core::{Callbacks, SessionManager, TelemetryValues},
//! };
//!
//! # fn main() -> Result<(), iotc_lite::core::IotcError> {
//! let device = DeviceConfig::new(
//!     Platform::Aws,
//!     "poc",
//!     "ABCDEFG123456",
//!     "my-device",
//!     "device-cert.pem",
//!     "device-pkey.pem",
//! )?;
//! let callbacks = Callbacks::new().on_command(|command| println!("command: {}", command.raw));
//! let mut session = SessionManager::from_device_config(&device, callbacks, ClientSettings::default())?;
//!
//! session.connect();
//! let mut values = TelemetryValues::new();
//! values.insert("temperature", 21.5);
//! session.send_telemetry(values, None)?;
//! # Ok(())
//! # }
//! ```

pub mod config;
pub mod core;
pub mod logger;
pub mod protocol;
