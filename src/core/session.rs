//! Device session: connect loop, telemetry and acknowledgements.
//!
//! [`SessionManager`] drives a [`Transport`] from the caller's thread. The
//! transport reports back through a [`SessionSink`], which runs on the
//! transport's network thread, keeps the [`ConnectionState`] channel current
//! and hands inbound messages to the [`C2dDispatcher`].
//!
//! `connect()` blocks. It must not be called from inside an async runtime.

use std::{
    sync::Arc,
    time::{Duration, Instant},
};

use iotc_mqtt::{
    ConnectionState, Endpoint, EventSink, MqttTransport, QoS, TlsIdentity, TransferError, Transport,
    TransportSettings,
};
use time::OffsetDateTime;
use tokio::{runtime::Runtime, sync::watch};
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use super::{
    c2d::{C2dCommand, C2dDispatcher, C2dOta, Callbacks},
    discovery::{DiscoveryResolver, SessionParameters},
    error::IotcError,
    telemetry::{TelemetryCodec, TelemetryError, TelemetryRecord, TelemetryValues},
};
use crate::{
    config::{device::DeviceConfig, settings::ClientSettings, ConfigError},
    protocol::d2c::{AckData, AckMessage, ACK_TYPE_COMMAND, ACK_TYPE_OTA},
};

/// Broker port, MQTT over TLS.
pub const MQTT_PORT: u16 = 8883;

const CONNECTED_POLL_INTERVAL: Duration = Duration::from_millis(500);

/// Logs at info when verbose, at debug otherwise.
macro_rules! chatter {
    ($verbose:expr, $($arg:tt)+) => {
        if $verbose {
            tracing::info!($($arg)+)
        } else {
            tracing::debug!($($arg)+)
        }
    };
}

/// Status reported back for a command.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CommandAckStatus {
    Failed = 1,
    SuccessWithAck = 2,
}

/// Progress reported back for an OTA update.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OtaAckStatus {
    Failed = 1,
    Downloading = 2,
    DownloadDone = 3,
    DownloadFailed = 4,
}

/// A publish handed to the transport.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PublishReceipt {
    pub topic: String,
    /// Payload size in bytes.
    pub bytes: usize,
}

/// Interruptible pause used by the connect loop.
pub trait Waiter: Send + Sync {
    /// Sleeps for `duration`. Returns `false` if woken by cancellation.
    fn wait(&self, duration: Duration) -> bool;

    fn is_cancelled(&self) -> bool;
}

/// [`Waiter`] backed by a [`CancellationToken`].
pub struct TokenWaiter {
    token: CancellationToken,
    runtime: Runtime,
}

impl TokenWaiter {
    pub fn new(token: CancellationToken) -> std::io::Result<Self> {
        let runtime = tokio::runtime::Builder::new_current_thread().enable_time().build()?;
        Ok(Self { token, runtime })
    }
}

impl Waiter for TokenWaiter {
    fn wait(&self, duration: Duration) -> bool {
        if self.token.is_cancelled() {
            return false;
        }
        self.runtime.block_on(async {
            tokio::select! {
                _ = self.token.cancelled() => false,
                _ = tokio::time::sleep(duration) => true,
            }
        })
    }

    fn is_cancelled(&self) -> bool {
        self.token.is_cancelled()
    }
}

enum WaitOutcome {
    Connected,
    TimedOut,
    Cancelled,
}

/// Receives transport notifications on the network thread.
struct SessionSink {
    dispatcher: C2dDispatcher,
    callbacks: Arc<Callbacks>,
    state: Arc<watch::Sender<ConnectionState>>,
    verbose: bool,
}

impl EventSink for SessionSink {
    fn on_connect(&self, result: &str) {
        chatter!(self.verbose, "Connected. Reason Code: {}", result);
        self.state.send_replace(ConnectionState::Connected);
    }

    fn on_disconnect(&self, reason: &str, from_server: bool) {
        self.state
            .send_replace(ConnectionState::Disconnected(reason.to_string()));
        match &self.callbacks.disconnected {
            Some(callback) => callback(reason, from_server),
            None => warn!(
                "Disconnected. Reason: {}. From server: {}",
                reason, from_server
            ),
        }
    }

    fn on_message(&self, topic: &str, payload: &[u8]) {
        chatter!(
            self.verbose,
            "{} {}",
            topic,
            String::from_utf8_lossy(payload)
        );
        self.dispatcher.dispatch(payload);
    }
}

/// A device's MQTT session.
pub struct SessionManager<T: Transport = MqttTransport> {
    params: SessionParameters,
    settings: ClientSettings,
    transport: T,
    waiter: Box<dyn Waiter>,
    state: Arc<watch::Sender<ConnectionState>>,
}

impl SessionManager<MqttTransport> {
    /// Resolves the device through discovery and prepares a session.
    ///
    /// # Errors
    /// `IotcError::Configuration` if the settings are invalid, discovery
    /// fails or the TLS identity cannot be loaded.
    pub fn from_device_config(
        device: &DeviceConfig,
        callbacks: Callbacks,
        settings: ClientSettings,
    ) -> Result<Self, IotcError> {
        let settings = settings.validated()?;
        let params = DiscoveryResolver::new().resolve_blocking(device)?;
        Self::new(params, device, callbacks, settings)
    }

    /// Prepares a session for already resolved parameters.
    pub fn new(
        params: SessionParameters,
        device: &DeviceConfig,
        callbacks: Callbacks,
        settings: ClientSettings,
    ) -> Result<Self, IotcError> {
        let identity = TlsIdentity::new(
            &device.device_cert_path,
            &device.device_pkey_path,
            device.server_ca_cert_path.as_ref(),
        );
        identity
            .client_config()
            .map_err(|e| ConfigError::Certificate(e.to_string()))?;

        let transport_settings = TransportSettings::new(&params.client_id, &params.username)
            .with_tls(identity)
            .handshake_timeout(settings.connect_timeout());

        Self::with_transport(params, callbacks, settings, |sink| {
            MqttTransport::new(transport_settings, sink)
        })
    }
}

impl<T: Transport> SessionManager<T> {
    /// Builds a session around a transport created by `make_transport`,
    /// which receives the session's event sink.
    pub fn with_transport<F>(
        params: SessionParameters,
        callbacks: Callbacks,
        settings: ClientSettings,
        make_transport: F,
    ) -> Result<Self, IotcError>
    where
        F: FnOnce(Arc<dyn EventSink>) -> Result<T, TransferError>,
    {
        let settings = settings.validated()?;
        let (state, _) = watch::channel(ConnectionState::default());
        let state = Arc::new(state);
        let callbacks = Arc::new(callbacks);

        let sink = Arc::new(SessionSink {
            dispatcher: C2dDispatcher::new(Arc::clone(&callbacks)),
            callbacks,
            state: Arc::clone(&state),
            verbose: settings.verbose,
        });
        let transport = make_transport(sink)?;
        let waiter = TokenWaiter::new(CancellationToken::new()).map_err(ConfigError::from)?;

        Ok(Self {
            params,
            settings,
            transport,
            waiter: Box::new(waiter),
            state,
        })
    }

    /// Makes connect pauses and polls stop early once `token` is cancelled.
    pub fn with_cancellation(self, token: CancellationToken) -> Result<Self, IotcError> {
        let waiter = TokenWaiter::new(token).map_err(ConfigError::from)?;
        Ok(self.with_waiter(waiter))
    }

    pub fn with_waiter(mut self, waiter: impl Waiter + 'static) -> Self {
        self.waiter = Box::new(waiter);
        self
    }

    pub fn parameters(&self) -> &SessionParameters {
        &self.params
    }

    /// Latest connection state.
    pub fn state(&self) -> ConnectionState {
        self.state.borrow().clone()
    }

    /// Watches connection state transitions.
    pub fn subscribe_state(&self) -> watch::Receiver<ConnectionState> {
        self.state.subscribe()
    }

    pub fn is_connected(&self) -> bool {
        self.transport.is_connected()
    }

    /// Connects to the broker, retrying with a random pause between
    /// attempts, then subscribes to the C2D topic.
    ///
    /// Returns immediately if already connected. The subscription is made
    /// even when every attempt failed, so it is restored as soon as the
    /// transport comes up; a cancelled connect returns without subscribing.
    pub fn connect(&mut self) -> ConnectionState {
        if self.transport.is_connected() {
            return ConnectionState::Connected;
        }
        self.state.send_replace(ConnectionState::Connecting);

        let endpoint = Endpoint::new(&self.params.host, MQTT_PORT);
        let jitter = self.settings.connect_jitter();
        let tries = self.settings.connect_tries;
        let mut connected = false;

        for attempt in 1..=tries {
            if self.waiter.is_cancelled() {
                return self.cancel_connect();
            }

            let started = Instant::now();
            match self.transport.connect(&endpoint) {
                Ok(()) => {
                    info!("Awaiting MQTT connection establishment...");
                    match self.wait_for_connection() {
                        WaitOutcome::Connected => {
                            chatter!(
                                self.settings.verbose,
                                "Connected in {}ms",
                                started.elapsed().as_millis()
                            );
                            connected = true;
                            break;
                        }
                        WaitOutcome::TimedOut => {
                            warn!("Timed out.");
                            if let Err(e) = self.disconnect() {
                                warn!("Failed to close timed out connection: {}", e);
                            }
                        }
                        WaitOutcome::Cancelled => return self.cancel_connect(),
                    }
                }
                Err(e) => warn!(
                    "Failed to connect to host {}. Error: {}",
                    self.params.host, e
                ),
            }

            if attempt == tries {
                break;
            }
            let backoff = jitter.next_sleep();
            warn!(
                "Retrying connection... Backing off for {} ms.",
                backoff.as_millis()
            );
            if !self.waiter.wait(backoff) {
                return self.cancel_connect();
            }
        }

        if let Err(e) = self
            .transport
            .subscribe(&self.params.topics.c2d, QoS::AtLeastOnce)
        {
            warn!(
                "Failed to subscribe to {}: {}",
                self.params.topics.c2d, e
            );
        }

        if connected {
            self.state.send_replace(ConnectionState::Connected);
        } else {
            error!("Unable to connect after {} attempts", tries);
            self.state.send_replace(ConnectionState::Disconnected(format!(
                "no connection after {tries} attempts"
            )));
        }
        self.state()
    }

    /// Polls the transport until the session is up or the connect timeout
    /// elapses.
    fn wait_for_connection(&self) -> WaitOutcome {
        chatter!(self.settings.verbose, "waiting to connect...");
        let polls = self.settings.connect_timeout().as_millis() / CONNECTED_POLL_INTERVAL.as_millis();
        for _ in 0..polls.max(1) {
            if self.transport.is_connected() {
                chatter!(self.settings.verbose, "MQTT connected");
                return WaitOutcome::Connected;
            }
            if !self.waiter.wait(CONNECTED_POLL_INTERVAL) {
                return WaitOutcome::Cancelled;
            }
        }
        if self.transport.is_connected() {
            return WaitOutcome::Connected;
        }
        WaitOutcome::TimedOut
    }

    fn cancel_connect(&mut self) -> ConnectionState {
        info!("Connect cancelled");
        if let Err(e) = self.transport.disconnect() {
            warn!("Failed to close connection: {}", e);
        }
        self.state
            .send_replace(ConnectionState::Disconnected("connect cancelled".into()));
        self.state()
    }

    /// Closes the session.
    pub fn disconnect(&mut self) -> Result<(), IotcError> {
        let result = self.transport.disconnect();
        info!("Disconnected.");
        if !self.transport.is_connected() && !self.state.borrow().is_connecting() {
            self.state
                .send_replace(ConnectionState::Disconnected("Normal disconnection".into()));
        }
        Ok(result?)
    }

    /// Publishes records in one message on the report topic.
    ///
    /// Returns `Ok(None)` without publishing when not connected.
    pub fn send_telemetry_records(
        &self,
        records: &[TelemetryRecord],
    ) -> Result<Option<PublishReceipt>, IotcError> {
        if !self.is_connected() {
            warn!("Message NOT sent. Not connected!");
            return Ok(None);
        }
        let payload = TelemetryCodec::encode(records)?;
        self.publish(&self.params.topics.rpt, payload).map(Some)
    }

    /// Publishes a single value set, optionally timestamped.
    pub fn send_telemetry(
        &self,
        values: TelemetryValues,
        timestamp: Option<OffsetDateTime>,
    ) -> Result<Option<PublishReceipt>, IotcError> {
        let mut record = TelemetryRecord::new(values);
        record.timestamp = timestamp;
        self.send_telemetry_records(&[record])
    }

    /// Acknowledges a command. Commands without an ack id are skipped.
    pub fn send_command_ack(
        &self,
        command: &C2dCommand,
        status: CommandAckStatus,
        message: &str,
    ) -> Result<Option<PublishReceipt>, IotcError> {
        self.send_ack(
            command.ack_id.as_deref(),
            ACK_TYPE_COMMAND,
            status as i64,
            message,
        )
    }

    /// Reports OTA progress. Updates without an ack id are skipped.
    pub fn send_ota_ack(
        &self,
        ota: &C2dOta,
        status: OtaAckStatus,
        message: &str,
    ) -> Result<Option<PublishReceipt>, IotcError> {
        self.send_ack(ota.ack_id.as_deref(), ACK_TYPE_OTA, status as i64, message)
    }

    fn send_ack(
        &self,
        ack_id: Option<&str>,
        kind: i64,
        status: i64,
        message: &str,
    ) -> Result<Option<PublishReceipt>, IotcError> {
        let Some(ack_id) = ack_id.filter(|id| !id.is_empty()) else {
            warn!("Message has no ack ID. Not acknowledging.");
            return Ok(None);
        };
        if !self.is_connected() {
            warn!("Message NOT sent. Not connected!");
            return Ok(None);
        }

        let ack = AckMessage {
            d: AckData {
                ack: ack_id,
                kind,
                st: status,
                msg: message,
            },
        };
        let payload = serde_json::to_string(&ack).map_err(TelemetryError::from)?;
        let topic = self
            .params
            .topics
            .ack
            .as_deref()
            .unwrap_or(&self.params.topics.rpt);
        self.publish(topic, payload).map(Some)
    }

    fn publish(&self, topic: &str, payload: String) -> Result<PublishReceipt, IotcError> {
        chatter!(self.settings.verbose, "> {}", payload);
        let bytes = payload.len();
        self.transport
            .publish(topic, QoS::AtLeastOnce, payload.into_bytes())?;
        Ok(PublishReceipt {
            topic: topic.to_string(),
            bytes,
        })
    }
}
