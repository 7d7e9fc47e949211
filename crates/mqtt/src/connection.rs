//! rumqttc-backed [`Transport`] with a background network task.
//!
//! This module provides two types:
//! - `MqttTransport`: the foreground handle. Each `connect` builds a fresh
//!   client, drives the TLS + MQTT handshake to its CONNACK, then hands the
//!   event loop to a kernel task.
//! - `ConnectionKernel`: runs on the transport's own one-worker runtime,
//!   pumps the event loop, forwards events to the registered [`EventSink`],
//!   and reconnects transient failures with exponential backoff.
//!
//! # Architecture
//!
//! ```text
//! SessionManager (foreground thread)
//!     ↓ connect / publish / subscribe / disconnect
//! MqttTransport
//!     ↓ spawn
//! ConnectionKernel (network thread) ──→ EventSink callbacks
//!     ↓
//! rumqttc AsyncClient & EventLoop
//!     ↓
//! Network (TLS)
//! ```

use std::{
    ops::ControlFlow,
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc, Mutex,
    },
    time::Duration,
};

use rumqttc::{AsyncClient, ConnectReturnCode, ConnectionError, Event, EventLoop, Outgoing, Packet, QoS};
use tokio::{runtime::Runtime, task::JoinHandle};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, trace, warn};

use super::{
    backoff::Backoff,
    client::{ClientBuilder, TlsIdentity},
    error::TransferError,
    transport::{Endpoint, EventSink, Transport},
};

/// Time granted to the network task to flush DISCONNECT.
const DISCONNECT_FLUSH: Duration = Duration::from_millis(500);

type Subscriptions = Arc<Mutex<Vec<(String, QoS)>>>;

/// Session parameters that stay fixed across connect attempts.
#[derive(Debug, Clone)]
pub struct TransportSettings {
    pub client_id: String,
    pub username: String,
    pub tls: Option<TlsIdentity>,
    pub keep_alive: Duration,
    /// Capacity of the client's request channel.
    pub request_capacity: usize,
    /// Upper bound for TLS + CONNECT + CONNACK of one attempt.
    pub handshake_timeout: Duration,
    /// Pacing of the network task's own reconnects.
    pub reconnect_backoff: Backoff,
}

impl TransportSettings {
    pub fn new(client_id: impl Into<String>, username: impl Into<String>) -> Self {
        Self {
            client_id: client_id.into(),
            username: username.into(),
            tls: None,
            keep_alive: Duration::from_secs(60),
            request_capacity: 10,
            handshake_timeout: Duration::from_secs(30),
            reconnect_backoff: Backoff::default(),
        }
    }

    pub fn with_tls(mut self, identity: TlsIdentity) -> Self {
        self.tls = Some(identity);
        self
    }

    /// Sets the handshake timeout and derives the reconnect backoff cap
    /// from it.
    pub fn handshake_timeout(mut self, timeout: Duration) -> Self {
        self.handshake_timeout = timeout;
        self.reconnect_backoff = Backoff::for_connect_timeout(timeout);
        self
    }
}

/// Foreground handle of a rumqttc session.
pub struct MqttTransport {
    settings: TransportSettings,
    sink: Arc<dyn EventSink>,
    runtime: Runtime,
    client: Option<AsyncClient>,
    kernel: Option<(CancellationToken, JoinHandle<()>)>,
    is_connected: Arc<AtomicBool>,
    subscriptions: Subscriptions,
}

impl MqttTransport {
    /// Creates an idle transport and its network thread.
    ///
    /// # Errors
    /// `TransferError::Io` if the runtime cannot be started.
    pub fn new(settings: TransportSettings, sink: Arc<dyn EventSink>) -> Result<Self, TransferError> {
        let runtime = tokio::runtime::Builder::new_multi_thread()
            .worker_threads(1)
            .thread_name("iotc-mqtt-net")
            .enable_all()
            .build()?;

        Ok(Self {
            settings,
            sink,
            runtime,
            client: None,
            kernel: None,
            is_connected: Arc::new(AtomicBool::new(false)),
            subscriptions: Arc::new(Mutex::new(Vec::new())),
        })
    }

    /// Topics that will be restored after a clean-session reconnect.
    pub fn subscriptions(&self) -> Vec<(String, QoS)> {
        snapshot(&self.subscriptions)
    }

    fn stop_kernel(&mut self) {
        if let Some((cancel, _handle)) = self.kernel.take() {
            cancel.cancel();
        }
        self.client = None;
    }
}

impl Transport for MqttTransport {
    fn connect(&mut self, endpoint: &Endpoint) -> Result<(), TransferError> {
        self.stop_kernel();

        let mut builder = ClientBuilder::new(
            self.settings.client_id.as_str(),
            endpoint.host.as_str(),
            endpoint.port,
            self.settings.request_capacity,
        )
        .credentials(self.settings.username.as_str())
        .keep_alive(self.settings.keep_alive);
        if let Some(identity) = &self.settings.tls {
            builder = builder.with_tls(identity.clone());
        }
        let (client, mut event_loop) = builder.build()?;

        debug!("Opening MQTT session to {}", endpoint);
        let timeout = self.settings.handshake_timeout;
        let first = self
            .runtime
            .block_on(async { tokio::time::timeout(timeout, event_loop.poll()).await })
            .map_err(|_| TransferError::HandshakeTimeout(timeout))??;

        let Event::Incoming(Packet::ConnAck(ack)) = first else {
            return Err(TransferError::UnexpectedHandshake(format!("{first:?}")));
        };

        self.is_connected.store(true, Ordering::Release);
        self.sink.on_connect(&format!("{:?}", ack.code));

        let cancel = CancellationToken::new();
        let kernel = ConnectionKernel {
            client: client.clone(),
            event_loop,
            sink: Arc::clone(&self.sink),
            is_connected: Arc::clone(&self.is_connected),
            subscriptions: Arc::clone(&self.subscriptions),
            backoff: self.settings.reconnect_backoff.clone(),
            cancel: cancel.clone(),
        };
        let handle = self.runtime.spawn(kernel.run());

        self.client = Some(client);
        self.kernel = Some((cancel, handle));
        Ok(())
    }

    fn is_connected(&self) -> bool {
        self.is_connected.load(Ordering::Acquire)
    }

    fn disconnect(&mut self) -> Result<(), TransferError> {
        let Some(client) = self.client.take() else {
            return Ok(());
        };

        let result = client.try_disconnect().map_err(TransferError::from);

        if let Some((cancel, handle)) = self.kernel.take() {
            let flushed = self
                .runtime
                .block_on(async { tokio::time::timeout(DISCONNECT_FLUSH, handle).await });
            if flushed.is_err() {
                debug!("Network task did not finish within {:?}", DISCONNECT_FLUSH);
            }
            cancel.cancel();
        }

        if self.is_connected.swap(false, Ordering::AcqRel) {
            self.sink.on_disconnect("Normal disconnection", false);
        }

        result
    }

    fn publish(&self, topic: &str, qos: QoS, payload: Vec<u8>) -> Result<(), TransferError> {
        let client = self.client.as_ref().ok_or(TransferError::NotConnected)?;
        if !self.is_connected() {
            return Err(TransferError::NotConnected);
        }
        client.try_publish(topic, qos, false, payload)?;
        Ok(())
    }

    fn subscribe(&mut self, topic: &str, qos: QoS) -> Result<(), TransferError> {
        remember(&self.subscriptions, topic, qos);

        let client = self.client.as_ref().ok_or(TransferError::NotConnected)?;
        if !self.is_connected() {
            return Err(TransferError::NotConnected);
        }
        client.try_subscribe(topic, qos)?;
        debug!("Subscribed to {}", topic);
        Ok(())
    }
}

impl Drop for MqttTransport {
    fn drop(&mut self) {
        self.stop_kernel();
    }
}

fn snapshot(subscriptions: &Subscriptions) -> Vec<(String, QoS)> {
    match subscriptions.lock() {
        Ok(guard) => guard.clone(),
        Err(poisoned) => poisoned.into_inner().clone(),
    }
}

fn remember(subscriptions: &Subscriptions, topic: &str, qos: QoS) {
    let mut guard = match subscriptions.lock() {
        Ok(guard) => guard,
        Err(poisoned) => poisoned.into_inner(),
    };
    match guard.iter_mut().find(|(t, _)| t == topic) {
        Some(entry) => entry.1 = qos,
        None => guard.push((topic.to_string(), qos)),
    }
}

/// Drives one session's event loop on the network thread.
///
/// Ends on cancellation, after sending DISCONNECT, or on a fatal error.
/// `EventLoop` is not `Sync`: no `&self` may be held across an await in
/// `run`, or the task is not `Send`.
struct ConnectionKernel {
    client: AsyncClient,
    event_loop: EventLoop,
    sink: Arc<dyn EventSink>,
    is_connected: Arc<AtomicBool>,
    subscriptions: Subscriptions,
    backoff: Backoff,
    cancel: CancellationToken,
}

impl ConnectionKernel {
    async fn run(mut self) {
        debug!("Network task started");
        loop {
            tokio::select! {
                _ = self.cancel.cancelled() => {
                    debug!("Network task cancelled");
                    break;
                }

                event = self.event_loop.poll() => match event {
                    Ok(event) => {
                        if self.handle_event(event).is_break() {
                            break;
                        }
                    }
                    Err(e) => {
                        if self.handle_error(&e).is_break() {
                            break;
                        }
                        let delay = self.backoff.next_sleep();
                        warn!(
                            "Reconnecting in {:.2} seconds due to error: {}",
                            delay.as_secs_f64(),
                            get_error_message(&e)
                        );
                        if !pause(&self.cancel, delay).await {
                            break;
                        }
                    }
                }
            }
        }
        debug!("Network task stopped");
    }

    fn handle_event(&mut self, event: Event) -> ControlFlow<()> {
        match event {
            Event::Incoming(Packet::ConnAck(ack)) => {
                info!("MQTT session re-established ({:?})", ack.code);
                self.is_connected.store(true, Ordering::Release);
                self.backoff.reset();
                self.sink.on_connect(&format!("{:?}", ack.code));
                if !ack.session_present {
                    self.resubscribe();
                }
            }
            Event::Incoming(Packet::Publish(publish)) => {
                trace!("Received publish on topic {}", publish.topic);
                self.sink.on_message(&publish.topic, &publish.payload);
            }
            Event::Incoming(Packet::PubAck(ack)) => {
                self.sink.on_publish(ack.pkid);
            }
            Event::Incoming(Packet::Disconnect) => {
                warn!("Disconnected by broker");
                if self.is_connected.swap(false, Ordering::AcqRel) {
                    self.sink.on_disconnect("Disconnected by broker", true);
                }
            }
            Event::Outgoing(Outgoing::Disconnect) => {
                debug!("DISCONNECT sent, network task stopping");
                return ControlFlow::Break(());
            }
            Event::Incoming(packet) => trace!("Incoming packet: {:?}", packet),
            Event::Outgoing(outgoing) => trace!("Outgoing packet: {:?}", outgoing),
        }
        ControlFlow::Continue(())
    }

    /// Reports the loss and decides whether reconnecting makes sense.
    fn handle_error(&mut self, err: &ConnectionError) -> ControlFlow<()> {
        let reason = get_error_message(err);
        if self.is_connected.swap(false, Ordering::AcqRel) {
            self.sink.on_disconnect(&reason, false);
        }

        match classify_connection_error(err) {
            Disposition::Fatal => {
                error!("Fatal connection error, network task stopping: {}", reason);
                ControlFlow::Break(())
            }
            Disposition::Reconnect => ControlFlow::Continue(()),
        }
    }

    fn resubscribe(&self) {
        for (topic, qos) in snapshot(&self.subscriptions) {
            match self.client.try_subscribe(topic.as_str(), qos) {
                Ok(()) => debug!("Restored subscription to {}", topic),
                Err(e) => warn!("Failed to restore subscription to {}: {}", topic, e),
            }
        }
    }
}

/// Sleeps unless cancelled first. Returns false on cancellation.
async fn pause(cancel: &CancellationToken, delay: Duration) -> bool {
    tokio::select! {
        _ = cancel.cancelled() => false,
        _ = tokio::time::sleep(delay) => true,
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Disposition {
    // Retrying cannot help
    Fatal,
    Reconnect,
}

fn classify_connection_error(err: &ConnectionError) -> Disposition {
    use Disposition::*;

    match err {
        // Certificates or crypto setup
        ConnectionError::Tls(_) => Fatal,
        ConnectionError::NotConnAck(_) => Fatal,
        // Client handle dropped
        ConnectionError::RequestsDone => Fatal,

        ConnectionError::Io(e) => match e.kind() {
            std::io::ErrorKind::AddrInUse
            | std::io::ErrorKind::PermissionDenied
            | std::io::ErrorKind::InvalidInput
            | std::io::ErrorKind::InvalidData => Fatal,
            _ => Reconnect,
        },

        // Includes missed PINGRESP
        ConnectionError::MqttState(_) => Reconnect,
        ConnectionError::NetworkTimeout | ConnectionError::FlushTimeout => Reconnect,

        ConnectionError::ConnectionRefused(code) => match code {
            ConnectReturnCode::RefusedProtocolVersion
            | ConnectReturnCode::BadClientId
            | ConnectReturnCode::BadUserNamePassword
            | ConnectReturnCode::NotAuthorized => Fatal,
            _ => Reconnect,
        },

        #[allow(unreachable_patterns)]
        _ => Reconnect,
    }
}

/// Root cause message of an error chain, without surrounding quotes.
pub(crate) fn get_error_message(e: &dyn std::error::Error) -> String {
    let mut current = e;
    while let Some(source) = current.source() {
        current = source;
    }
    current.to_string().trim_matches('"').to_string()
}
