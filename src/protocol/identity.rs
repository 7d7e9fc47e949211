//! `GET {bu}/uid/{duid}` response.

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
#[serde(default)]
pub struct IdentityResponse {
    pub d: Option<IdentityData>,
    #[serde(deserialize_with = "super::null_as_default")]
    pub status: i64,
    pub message: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
#[serde(default)]
pub struct IdentityData {
    #[serde(deserialize_with = "super::null_as_default")]
    pub ec: i64,
    pub ct: Option<i64>,
    #[serde(deserialize_with = "super::null_as_default")]
    pub meta: IdentityMeta,
    #[serde(deserialize_with = "super::null_as_default")]
    pub has: IdentityHas,
    #[serde(deserialize_with = "super::null_as_default")]
    pub p: MqttParams,
    pub dt: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
#[serde(default)]
pub struct IdentityMeta {
    pub at: Option<i64>,
    /// Data frequency in seconds.
    pub df: Option<i64>,
    pub cd: Option<String>,
    pub gtw: Option<i64>,
    pub edge: Option<i64>,
    /// Numeric platform code.
    pub pf: Option<i64>,
    #[serde(deserialize_with = "super::null_as_default")]
    pub hwv: String,
    #[serde(deserialize_with = "super::null_as_default")]
    pub swv: String,
    /// Protocol version.
    #[serde(deserialize_with = "super::null_as_default")]
    pub v: f64,
}

/// Feature flags of the device template.
#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
#[serde(default)]
pub struct IdentityHas {
    #[serde(deserialize_with = "super::null_as_default")]
    pub d: i64,
    #[serde(deserialize_with = "super::null_as_default")]
    pub attr: i64,
    #[serde(deserialize_with = "super::null_as_default")]
    pub set: i64,
    #[serde(deserialize_with = "super::null_as_default")]
    pub r: i64,
    #[serde(deserialize_with = "super::null_as_default")]
    pub ota: i64,
}

#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
#[serde(default)]
pub struct MqttParams {
    /// Protocol name, "mqtt".
    pub n: Option<String>,
    pub h: Option<String>,
    #[serde(rename = "p")]
    pub port: Option<u16>,
    pub id: Option<String>,
    pub un: Option<String>,
    #[serde(deserialize_with = "super::null_as_default")]
    pub topics: Topics,
}

#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
#[serde(default)]
pub struct Topics {
    pub rpt: Option<String>,
    pub flt: Option<String>,
    pub od: Option<String>,
    pub hb: Option<String>,
    pub ack: Option<String>,
    pub dl: Option<String>,
    pub di: Option<String>,
    pub c2d: Option<String>,
    #[serde(deserialize_with = "super::null_as_default")]
    pub set: SetTopics,
}

/// Twin (Azure) or shadow (AWS) topics.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SetTopics {
    #[serde(rename = "pub")]
    pub publish: Option<String>,
    #[serde(rename = "sub")]
    pub subscribe: Option<String>,
    #[serde(rename = "pubForAll")]
    pub publish_for_all: Option<String>,
    #[serde(rename = "subForAll")]
    pub subscribe_for_all: Option<String>,
}
