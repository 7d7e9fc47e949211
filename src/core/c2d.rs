//! Cloud-to-device message classification and dispatch.
//!
//! Every inbound payload is classified by its `ct` type code into a
//! [`C2dMessage`] and routed to at most one user callback:
//!
//! 1. a generic handler registered for that exact code, which pre-empts
//!    everything else;
//! 2. the command callback (`ct` 0) or the OTA callback (`ct` 1);
//! 3. otherwise a log line describing what the device is expected to do.
//!
//! Payloads that are not JSON are logged and dropped. JSON whose fields do
//! not fit its type still reaches a generic handler registered for its
//! `ct`; without one it is logged and dropped too. A bad message never
//! reaches the session.

use std::{collections::HashMap, fmt, sync::Arc};

use serde::Deserialize;
use serde_json::Value;
use thiserror::Error;
use tracing::{debug, error, info, warn};

use crate::protocol::c2d::{C2dCommandJson, C2dEnvelope, C2dOtaJson};

/// Code used when a message carries no `ct` at all.
pub const UNDEFINED_CODE: i64 = 0xFFFF;

#[derive(Debug, Error)]
pub enum C2dError {
    /// Not JSON at all.
    #[error("Incoming message not parseable: {0}")]
    Malformed(#[source] serde_json::Error),

    /// Well-formed JSON with a field of the wrong type.
    #[error("Incoming {kind} message has an unexpected shape: {source}")]
    UnexpectedShape {
        kind: MessageKind,
        #[source]
        source: serde_json::Error,
    },
}

/// Type code of an inbound message.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MessageKind {
    Command,
    Ota,
    ModuleCommand,
    StartHeartbeat,
    RefreshAttribute,
    RefreshSetting,
    RefreshEdgeRule,
    RefreshChildDevice,
    DataFrequencyChange,
    DeviceDeleted,
    DeviceDisabled,
    DeviceReleased,
    StopOperation,
    StopHeartbeat,
    /// Any code this client does not know about.
    Unknown(i64),
}

/// Every known type code. Both directions of the code mapping read this
/// table.
const KNOWN_KINDS: [(i64, MessageKind); 14] = [
    (0, MessageKind::Command),
    (1, MessageKind::Ota),
    (2, MessageKind::ModuleCommand),
    (100, MessageKind::StartHeartbeat),
    (101, MessageKind::RefreshAttribute),
    (102, MessageKind::RefreshSetting),
    (103, MessageKind::RefreshEdgeRule),
    (104, MessageKind::RefreshChildDevice),
    (105, MessageKind::DataFrequencyChange),
    (106, MessageKind::DeviceDeleted),
    (107, MessageKind::DeviceDisabled),
    (108, MessageKind::DeviceReleased),
    (109, MessageKind::StopOperation),
    (111, MessageKind::StopHeartbeat),
];

impl MessageKind {
    pub fn from_code(code: i64) -> Self {
        KNOWN_KINDS
            .iter()
            .find(|(known, _)| *known == code)
            .map_or(MessageKind::Unknown(code), |(_, kind)| *kind)
    }

    pub fn code(&self) -> i64 {
        match self {
            MessageKind::Unknown(code) => *code,
            kind => KNOWN_KINDS
                .iter()
                .find(|(_, known)| known == kind)
                .map_or(UNDEFINED_CODE, |(code, _)| *code),
        }
    }

    /// Human readable name for logs.
    pub fn description(&self) -> &'static str {
        match self {
            MessageKind::Command => "Command",
            MessageKind::Ota => "OTA Update",
            MessageKind::ModuleCommand => "Module Command",
            MessageKind::StartHeartbeat => "Start Heartbeat",
            MessageKind::RefreshAttribute => "Refresh Attribute",
            MessageKind::RefreshSetting => "Refresh Setting (Twin/Shadow))",
            MessageKind::RefreshEdgeRule => "Refresh Edge Rule",
            MessageKind::RefreshChildDevice => "Refresh Child Device",
            MessageKind::DataFrequencyChange => "Data Frequency Changed",
            MessageKind::DeviceDeleted => "Device Deleted",
            MessageKind::DeviceDisabled => "Device Disabled",
            MessageKind::DeviceReleased => "Device Released",
            MessageKind::StopOperation => "Stop Operation",
            MessageKind::StopHeartbeat => "Stop Heartbeat",
            MessageKind::Unknown(_) => "<Unknown Command Received>",
        }
    }

    /// The device should stop operating.
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            MessageKind::DeviceDeleted
                | MessageKind::DeviceDisabled
                | MessageKind::DeviceReleased
                | MessageKind::StopOperation
        )
    }

    /// The device should reload its configuration.
    pub fn needs_refresh(&self) -> bool {
        matches!(
            self,
            MessageKind::RefreshAttribute
                | MessageKind::RefreshSetting
                | MessageKind::RefreshEdgeRule
                | MessageKind::RefreshChildDevice
                | MessageKind::DataFrequencyChange
        )
    }

    /// `Some(true)` to start heartbeats, `Some(false)` to stop them.
    pub fn heartbeat_operation(&self) -> Option<bool> {
        match self {
            MessageKind::StartHeartbeat => Some(true),
            MessageKind::StopHeartbeat => Some(false),
            _ => None,
        }
    }
}

impl fmt::Display for MessageKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.description())
    }
}

/// A command sent from the platform, `cmd` split on whitespace.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct C2dCommand {
    /// First token of `cmd`; empty when the message had no command text.
    pub name: String,
    pub args: Vec<String>,
    /// `cmd` as received.
    pub raw: String,
    /// Present when the platform expects an acknowledgement.
    pub ack_id: Option<String>,
}

impl C2dCommand {
    fn parse(cmd: Option<String>, ack_id: Option<String>) -> Self {
        let raw = cmd.unwrap_or_default();
        let mut tokens = raw.split_whitespace().map(str::to_string);
        let name = tokens.next().unwrap_or_default();
        let args = tokens.collect();
        C2dCommand {
            name,
            args,
            raw,
            ack_id,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct OtaUrl {
    pub url: String,
    pub file_name: String,
}

/// Firmware update notice. Downloading is up to the application.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct C2dOta {
    pub version: Option<String>,
    pub hardware_version: Option<String>,
    pub ack_id: Option<String>,
    pub urls: Vec<OtaUrl>,
    /// The `cmd` text accompanying the update, if any.
    pub command: Option<C2dCommand>,
}

/// Lifecycle or control event without a dedicated callback.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct C2dEvent {
    pub kind: MessageKind,
    pub ack_id: Option<String>,
    /// Heartbeat (`f`) or data (`df`) frequency in seconds.
    pub frequency: Option<i64>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum C2dMessage {
    Command(C2dCommand),
    Ota(C2dOta),
    Event(C2dEvent),
}

impl C2dMessage {
    pub fn kind(&self) -> MessageKind {
        match self {
            C2dMessage::Command(_) => MessageKind::Command,
            C2dMessage::Ota(_) => MessageKind::Ota,
            C2dMessage::Event(event) => event.kind,
        }
    }

    pub fn ack_id(&self) -> Option<&str> {
        match self {
            C2dMessage::Command(c) => c.ack_id.as_deref(),
            C2dMessage::Ota(o) => o.ack_id.as_deref(),
            C2dMessage::Event(e) => e.ack_id.as_deref(),
        }
    }

    /// Parses a payload into the classified message, the raw `ct` and the
    /// JSON document.
    pub fn parse(payload: &[u8]) -> Result<(Self, Option<i64>, Value), C2dError> {
        let document: Value = serde_json::from_slice(payload).map_err(C2dError::Malformed)?;
        let (message, ct) = Self::classify(&document)?;
        Ok((message, ct, document))
    }

    /// Classifies an already decoded document by its `ct`.
    pub fn classify(document: &Value) -> Result<(Self, Option<i64>), C2dError> {
        let envelope = C2dEnvelope::deserialize(document).map_err(|source| C2dError::UnexpectedShape {
            kind: MessageKind::Unknown(UNDEFINED_CODE),
            source,
        })?;
        let kind = MessageKind::from_code(envelope.ct.unwrap_or(UNDEFINED_CODE));
        let shape_error = |source| C2dError::UnexpectedShape { kind, source };

        let message = match kind {
            MessageKind::Command => {
                let json = C2dCommandJson::deserialize(document).map_err(shape_error)?;
                C2dMessage::Command(C2dCommand::parse(json.cmd, json.ack))
            }
            MessageKind::Ota => {
                let json = C2dOtaJson::deserialize(document).map_err(shape_error)?;
                C2dMessage::Ota(C2dOta {
                    version: json.sw,
                    hardware_version: json.hw,
                    urls: json
                        .urls
                        .unwrap_or_default()
                        .into_iter()
                        .map(|u| OtaUrl {
                            url: u.url.unwrap_or_default(),
                            file_name: u.file_name.unwrap_or_default(),
                        })
                        .collect(),
                    command: json.cmd.map(|cmd| C2dCommand::parse(Some(cmd), json.ack.clone())),
                    ack_id: json.ack,
                })
            }
            kind => C2dMessage::Event(C2dEvent {
                kind,
                ack_id: envelope.ack,
                frequency: envelope.f.or(envelope.df),
            }),
        };

        Ok((message, envelope.ct))
    }
}

pub type CommandCallback = Box<dyn Fn(&C2dCommand) + Send + Sync>;
pub type OtaCallback = Box<dyn Fn(&C2dOta) + Send + Sync>;
/// Receives the disconnect reason and whether the broker initiated it.
pub type DisconnectedCallback = Box<dyn Fn(&str, bool) + Send + Sync>;
pub type GenericCallback = Box<dyn Fn(&C2dMessage, &Value) + Send + Sync>;

/// User callbacks, registered once when the session is built.
#[derive(Default)]
pub struct Callbacks {
    pub(crate) command: Option<CommandCallback>,
    pub(crate) ota: Option<OtaCallback>,
    pub(crate) disconnected: Option<DisconnectedCallback>,
    pub(crate) generic: HashMap<i64, GenericCallback>,
}

impl Callbacks {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn on_command(mut self, f: impl Fn(&C2dCommand) + Send + Sync + 'static) -> Self {
        self.command = Some(Box::new(f));
        self
    }

    pub fn on_ota(mut self, f: impl Fn(&C2dOta) + Send + Sync + 'static) -> Self {
        self.ota = Some(Box::new(f));
        self
    }

    pub fn on_disconnected(mut self, f: impl Fn(&str, bool) + Send + Sync + 'static) -> Self {
        self.disconnected = Some(Box::new(f));
        self
    }

    /// Handles every message with this raw `ct`, bypassing built-in
    /// handling.
    pub fn on_message_type(
        mut self,
        code: i64,
        f: impl Fn(&C2dMessage, &Value) + Send + Sync + 'static,
    ) -> Self {
        self.generic.insert(code, Box::new(f));
        self
    }
}

impl fmt::Debug for Callbacks {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Callbacks")
            .field("command", &self.command.is_some())
            .field("ota", &self.ota.is_some())
            .field("disconnected", &self.disconnected.is_some())
            .field("generic", &self.generic.keys().collect::<Vec<_>>())
            .finish()
    }
}

/// Routes inbound payloads to [`Callbacks`].
#[derive(Debug, Clone)]
pub struct C2dDispatcher {
    callbacks: Arc<Callbacks>,
}

impl C2dDispatcher {
    pub fn new(callbacks: Arc<Callbacks>) -> Self {
        C2dDispatcher { callbacks }
    }

    /// Classifies and routes one payload. Never fails; problems are logged.
    ///
    /// A generic handler only needs the raw `ct`, so it also receives
    /// messages whose body does not fit the shape of their type.
    pub fn dispatch(&self, payload: &[u8]) {
        let document: Value = match serde_json::from_slice(payload) {
            Ok(document) => document,
            Err(e) => {
                self.drop_unparseable(payload, &C2dError::Malformed(e));
                return;
            }
        };
        let ct = document.get("ct").and_then(Value::as_i64);
        let classified = C2dMessage::classify(&document);

        let generic = ct.and_then(|code| self.callbacks.generic.get(&code).map(|handler| (code, handler)));
        if let Some((code, handler)) = generic {
            let message = match classified {
                Ok((message, _)) => message,
                Err(e) => {
                    debug!("Passing raw message to generic handler: {}", e);
                    C2dMessage::Event(C2dEvent {
                        kind: MessageKind::from_code(code),
                        ack_id: document.get("ack").and_then(Value::as_str).map(str::to_string),
                        frequency: None,
                    })
                }
            };
            handler(&message, &document);
            return;
        }

        let message = match classified {
            Ok((message, _)) => message,
            Err(e) => {
                self.drop_unparseable(payload, &e);
                return;
            }
        };

        match &message {
            C2dMessage::Command(command) => match &self.callbacks.command {
                Some(callback) => callback(command),
                None => info!(
                    "Received command \"{}\" but no command callback is registered",
                    command.raw
                ),
            },
            C2dMessage::Ota(ota) if ota.urls.is_empty() => {
                error!("Got OTA, but URLs list is empty!");
            }
            C2dMessage::Ota(ota) => match &self.callbacks.ota {
                Some(callback) => callback(ota),
                None => info!(
                    "Received OTA update {} but no OTA callback is registered",
                    ota.version.as_deref().unwrap_or("(no version)")
                ),
            },
            C2dMessage::Event(event) => self.log_event(event, ct, payload),
        }
    }

    fn drop_unparseable(&self, payload: &[u8], err: &C2dError) {
        error!(
            "Incoming message not parseable: \"{}\"",
            String::from_utf8_lossy(payload)
        );
        debug!("{}", err);
    }

    fn log_event(&self, event: &C2dEvent, ct: Option<i64>, payload: &[u8]) {
        let kind = event.kind;
        if kind.is_fatal() {
            warn!(
                "Received C2D message {} from backend. Device should stop operation.",
                kind
            );
        } else if kind.needs_refresh() {
            info!(
                "Received C2D message {} from backend. Device should re-initialize the application.",
                kind
            );
        } else if let Some(start) = kind.heartbeat_operation() {
            info!(
                "Received C2D message {} from backend. Device should {} heartbeat messages.",
                kind,
                if start { "start" } else { "stop" }
            );
        } else {
            let code = ct.map_or_else(|| "(none)".to_string(), |c| c.to_string());
            warn!(
                "C2D Message parsing for message type {} is not supported by this client. Message was: {}",
                code,
                String::from_utf8_lossy(payload)
            );
        }
    }
}
