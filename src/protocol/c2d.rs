//! Inbound cloud-to-device messages.
//!
//! Every message is first read as a [`C2dEnvelope`] to learn its type code,
//! then re-read as the shape matching that code.

use serde::Deserialize;

#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct C2dEnvelope {
    /// Message type code.
    pub ct: Option<i64>,
    pub ack: Option<String>,
    /// Data frequency.
    pub df: Option<i64>,
    /// Heartbeat frequency.
    pub f: Option<i64>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct C2dCommandJson {
    pub ct: Option<i64>,
    pub cmd: Option<String>,
    pub ack: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct C2dOtaUrlJson {
    pub url: Option<String>,
    #[serde(rename = "fileName")]
    pub file_name: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct C2dOtaJson {
    pub ct: Option<i64>,
    pub cmd: Option<String>,
    /// Software version.
    pub sw: Option<String>,
    /// Hardware version.
    pub hw: Option<String>,
    pub ack: Option<String>,
    pub urls: Option<Vec<C2dOtaUrlJson>>,
}
