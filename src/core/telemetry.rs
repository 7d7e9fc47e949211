//! Telemetry values, records and their wire encoding.
//!
//! A value is a primitive (null, bool, number, string), a
//! `[latitude, longitude]` pair, or a one-level object of primitives. The
//! shape is enforced when values are built, so an encoded message never
//! carries deeper nesting.
//!
//! ```ignore
//! let mut values = TelemetryValues::new();
//! values.insert("temperature", 21.5);
//! values.insert("location", Primitive::geo(44.787197, 20.457273).unwrap());
//!
//! let record = TelemetryRecord::new(values).apply_timestamp();
//! let payload = TelemetryCodec::encode(&[record])?;
//! ```

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use serde_json::{Number, Value};
use thiserror::Error;
use time::{macros::format_description, OffsetDateTime, UtcOffset};

use crate::protocol::d2c::{TelemetryEntry, TelemetryMessage};

#[derive(Debug, Error)]
pub enum TelemetryError {
    #[error("Telemetry values must be a JSON object")]
    NotAnObject,

    /// An object value contains another object.
    #[error("Telemetry value \"{key}\" nests objects more than one level deep")]
    TooDeep { key: String },

    /// An array that is not two numbers.
    #[error("Telemetry value \"{key}\" is not a [latitude, longitude] pair of numbers")]
    InvalidGeo { key: String },

    #[error("Telemetry serialization failed: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Telemetry timestamp formatting failed: {0}")]
    Timestamp(#[from] time::error::Format),
}

/// Leaf telemetry value.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Primitive {
    Null,
    Bool(bool),
    Number(Number),
    String(String),
    /// Latitude then longitude, signed decimal degrees.
    Geo([Number; 2]),
}

impl Primitive {
    /// Geocoordinate; `None` if a coordinate is not finite.
    pub fn geo(lat: f64, lon: f64) -> Option<Self> {
        Some(Primitive::Geo([Number::from_f64(lat)?, Number::from_f64(lon)?]))
    }

    fn from_json(key: &str, value: Value) -> Result<Self, TelemetryError> {
        match value {
            Value::Null => Ok(Primitive::Null),
            Value::Bool(b) => Ok(Primitive::Bool(b)),
            Value::Number(n) => Ok(Primitive::Number(n)),
            Value::String(s) => Ok(Primitive::String(s)),
            Value::Array(items) => match <[Value; 2]>::try_from(items) {
                Ok([Value::Number(lat), Value::Number(lon)]) => Ok(Primitive::Geo([lat, lon])),
                _ => Err(TelemetryError::InvalidGeo { key: key.to_string() }),
            },
            Value::Object(_) => Err(TelemetryError::TooDeep { key: key.to_string() }),
        }
    }
}

impl From<bool> for Primitive {
    fn from(v: bool) -> Self {
        Primitive::Bool(v)
    }
}

impl From<&str> for Primitive {
    fn from(v: &str) -> Self {
        Primitive::String(v.to_string())
    }
}

impl From<String> for Primitive {
    fn from(v: String) -> Self {
        Primitive::String(v)
    }
}

/// Non-finite floats become null, like `serde_json::Value`.
impl From<f64> for Primitive {
    fn from(v: f64) -> Self {
        Number::from_f64(v).map_or(Primitive::Null, Primitive::Number)
    }
}

impl<T: Into<Primitive>> From<Option<T>> for Primitive {
    fn from(v: Option<T>) -> Self {
        v.map_or(Primitive::Null, Into::into)
    }
}

macro_rules! primitive_from_int {
    ($($t:ty),*) => {
        $(impl From<$t> for Primitive {
            fn from(v: $t) -> Self {
                Primitive::Number(Number::from(v))
            }
        })*
    };
}

primitive_from_int!(i8, i16, i32, i64, u8, u16, u32, u64);

/// Value of one telemetry attribute.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum TelemetryValue {
    Primitive(Primitive),
    Object(BTreeMap<String, Primitive>),
}

impl TelemetryValue {
    pub fn object<K, V>(fields: impl IntoIterator<Item = (K, V)>) -> Self
    where
        K: Into<String>,
        V: Into<Primitive>,
    {
        TelemetryValue::Object(fields.into_iter().map(|(k, v)| (k.into(), v.into())).collect())
    }

    fn from_json(key: &str, value: Value) -> Result<Self, TelemetryError> {
        match value {
            Value::Object(fields) => {
                let mut object = BTreeMap::new();
                for (name, inner) in fields {
                    let primitive = Primitive::from_json(&format!("{key}.{name}"), inner)?;
                    object.insert(name, primitive);
                }
                Ok(TelemetryValue::Object(object))
            }
            other => Primitive::from_json(key, other).map(TelemetryValue::Primitive),
        }
    }
}

macro_rules! value_from_primitive {
    ($($t:ty),*) => {
        $(impl From<$t> for TelemetryValue {
            fn from(v: $t) -> Self {
                TelemetryValue::Primitive(v.into())
            }
        })*
    };
}

value_from_primitive!(Primitive, bool, &str, String, f64, i8, i16, i32, i64, u8, u16, u32, u64);

impl<T: Into<Primitive>> From<Option<T>> for TelemetryValue {
    fn from(v: Option<T>) -> Self {
        TelemetryValue::Primitive(v.into())
    }
}

/// Named telemetry values of one record.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct TelemetryValues(BTreeMap<String, TelemetryValue>);

impl TelemetryValues {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, name: impl Into<String>, value: impl Into<TelemetryValue>) -> &mut Self {
        self.0.insert(name.into(), value.into());
        self
    }

    pub fn get(&self, name: &str) -> Option<&TelemetryValue> {
        self.0.get(name)
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// Validates any serializable struct or map as telemetry values.
    pub fn from_serializable<T: Serialize + ?Sized>(value: &T) -> Result<Self, TelemetryError> {
        Self::try_from(serde_json::to_value(value)?)
    }
}

impl TryFrom<Value> for TelemetryValues {
    type Error = TelemetryError;

    fn try_from(value: Value) -> Result<Self, Self::Error> {
        let Value::Object(fields) = value else {
            return Err(TelemetryError::NotAnObject);
        };
        let mut values = BTreeMap::new();
        for (name, inner) in fields {
            let value = TelemetryValue::from_json(&name, inner)?;
            values.insert(name, value);
        }
        Ok(TelemetryValues(values))
    }
}

impl<K: Into<String>, V: Into<TelemetryValue>> FromIterator<(K, V)> for TelemetryValues {
    fn from_iter<I: IntoIterator<Item = (K, V)>>(iter: I) -> Self {
        TelemetryValues(iter.into_iter().map(|(k, v)| (k.into(), v.into())).collect())
    }
}

/// One sample set, optionally timestamped and attributed to a gateway child.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct TelemetryRecord {
    pub values: TelemetryValues,
    /// Without a timestamp the server applies its receipt time.
    pub timestamp: Option<OffsetDateTime>,
    pub unique_id: Option<String>,
    pub tag: Option<String>,
}

impl TelemetryRecord {
    pub fn new(values: TelemetryValues) -> Self {
        TelemetryRecord {
            values,
            ..Default::default()
        }
    }

    pub fn with_timestamp(mut self, timestamp: OffsetDateTime) -> Self {
        self.timestamp = Some(timestamp);
        self
    }

    /// Stamps the record with the current UTC time.
    pub fn apply_timestamp(self) -> Self {
        self.with_timestamp(timestamp_now())
    }

    pub fn with_unique_id(mut self, unique_id: impl Into<String>) -> Self {
        self.unique_id = Some(unique_id.into());
        self
    }

    pub fn with_tag(mut self, tag: impl Into<String>) -> Self {
        self.tag = Some(tag.into());
        self
    }
}

/// Current UTC time, suitable for [`TelemetryRecord::with_timestamp`].
pub fn timestamp_now() -> OffsetDateTime {
    OffsetDateTime::now_utc()
}

pub struct TelemetryCodec;

impl TelemetryCodec {
    /// Encodes records into one compact `{"d":[...]}` message, keeping
    /// their order.
    pub fn encode(records: &[TelemetryRecord]) -> Result<String, TelemetryError> {
        let mut entries = Vec::with_capacity(records.len());
        for record in records {
            entries.push(TelemetryEntry {
                d: &record.values,
                dt: record.timestamp.map(Self::format_timestamp).transpose()?,
                id: record.unique_id.as_deref(),
                tg: record.tag.as_deref(),
            });
        }
        Ok(serde_json::to_string(&TelemetryMessage { d: entries })?)
    }

    /// Validates and encodes a single untimestamped value set.
    pub fn encode_value(value: &Value) -> Result<String, TelemetryError> {
        let values = TelemetryValues::try_from(value.clone())?;
        Self::encode(&[TelemetryRecord::new(values)])
    }

    /// `YYYY-MM-DDTHH:MM:SS.000Z` in UTC; sub-second precision is dropped.
    pub fn format_timestamp(timestamp: OffsetDateTime) -> Result<String, TelemetryError> {
        let format = format_description!("[year]-[month]-[day]T[hour]:[minute]:[second].000Z");
        Ok(timestamp.to_offset(UtcOffset::UTC).format(&format)?)
    }
}
