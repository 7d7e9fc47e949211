//! Device client core.
//!
//! * `discovery`: REST discovery and identity resolution into
//!   [`SessionParameters`].
//! * `session`: [`SessionManager`], the MQTT connect loop, telemetry and
//!   acknowledgements.
//! * `telemetry`: telemetry values and the `{"d":[...]}` encoder.
//! * `c2d`: classification and dispatch of cloud-to-device messages.
//! * `error`: [`IotcError`], aggregating the module errors.

pub mod c2d;
pub mod discovery;
pub mod error;
pub mod session;
pub mod telemetry;

pub use c2d::{C2dCommand, C2dDispatcher, C2dEvent, C2dMessage, C2dOta, Callbacks, MessageKind, OtaUrl};
pub use discovery::{DiscoveryResolver, HttpFetch, HyperFetcher, SessionParameters, SessionTopics};
pub use error::IotcError;
pub use session::{CommandAckStatus, OtaAckStatus, PublishReceipt, SessionManager, TokenWaiter, Waiter};
pub use telemetry::{
    timestamp_now, Primitive, TelemetryCodec, TelemetryError, TelemetryRecord, TelemetryValue, TelemetryValues,
};
