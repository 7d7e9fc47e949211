//! JSON wire formats of the platform's device protocol 2.1.
//!
//! Plain serde records with no behavior. Inbound documents ignore unknown
//! keys and default missing or `null` ones; outbound documents omit absent
//! optional fields.

use serde::{Deserialize, Deserializer};

pub mod c2d;
pub mod d2c;
pub mod discovery;
pub mod identity;

/// Reads `null` as `T::default()`. The REST API sends `null` for blocks it
/// has no data for, such as `meta`, `has` and `p` of an unknown device.
pub(crate) fn null_as_default<'de, D, T>(deserializer: D) -> Result<T, D::Error>
where
    D: Deserializer<'de>,
    T: Default + Deserialize<'de>,
{
    Ok(Option::<T>::deserialize(deserializer)?.unwrap_or_default())
}
