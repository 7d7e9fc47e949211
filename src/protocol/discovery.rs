//! `GET {discovery}/api/v2.1/dsdk/cpId/{cpid}/env/{env}` response.

use serde::Deserialize;

#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
#[serde(default)]
pub struct DiscoveryResponse {
    pub d: Option<DiscoveryData>,
    #[serde(deserialize_with = "super::null_as_default")]
    pub status: i64,
    pub message: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
#[serde(default)]
pub struct DiscoveryData {
    /// Error code, 0 on success.
    #[serde(deserialize_with = "super::null_as_default")]
    pub ec: i64,
    /// Base URL of the identity service.
    pub bu: Option<String>,
    /// Platform, "aws" or "az".
    pub pf: Option<String>,
    pub dip: Option<i64>,
    #[serde(rename = "errorMsg")]
    pub error_msg: Option<String>,
}
