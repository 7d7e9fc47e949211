//! Outbound device-to-cloud messages.

use serde::Serialize;

/// `{"d":[entry, ...]}` published on the report topic.
#[derive(Debug, Serialize)]
pub struct TelemetryMessage<'a, V> {
    pub d: Vec<TelemetryEntry<'a, V>>,
}

#[derive(Debug, Serialize)]
pub struct TelemetryEntry<'a, V> {
    pub d: &'a V,
    /// `YYYY-MM-DDTHH:MM:SS.000Z`
    #[serde(skip_serializing_if = "Option::is_none")]
    pub dt: Option<String>,
    /// Unique id of a gateway child.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub id: Option<&'a str>,
    /// Tag of a gateway child.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tg: Option<&'a str>,
}

pub const ACK_TYPE_COMMAND: i64 = 0;
pub const ACK_TYPE_OTA: i64 = 1;

/// `{"d":{"ack":..,"type":..,"st":..,"msg":..}}` published on the ack topic.
#[derive(Debug, Serialize)]
pub struct AckMessage<'a> {
    pub d: AckData<'a>,
}

#[derive(Debug, Serialize)]
pub struct AckData<'a> {
    pub ack: &'a str,
    #[serde(rename = "type")]
    pub kind: i64,
    pub st: i64,
    pub msg: &'a str,
}

#[cfg(test)]
mod tests {
    use std::collections::BTreeMap;

    use super::*;

    #[test]
    fn test_entry_omits_absent_fields() {
        let values = BTreeMap::from([("temperature", 21)]);
        let message = TelemetryMessage {
            d: vec![TelemetryEntry {
                d: &values,
                dt: None,
                id: None,
                tg: Some("child"),
            }],
        };
        assert_eq!(
            serde_json::to_string(&message).unwrap(),
            r#"{"d":[{"d":{"temperature":21},"tg":"child"}]}"#
        );
    }

    #[test]
    fn test_ack_shape() {
        let ack = AckMessage {
            d: AckData {
                ack: "a1",
                kind: ACK_TYPE_OTA,
                st: 3,
                msg: "done",
            },
        };
        assert_eq!(
            serde_json::to_string(&ack).unwrap(),
            r#"{"d":{"ack":"a1","type":1,"st":3,"msg":"done"}}"#
        );
    }
}
