//! JSON value manipulation utilities shared across the crate.

use serde::Deserialize;
pub use serde_json_bytes::ByteString;
pub use serde_json_bytes::Map as JsonMap;
pub use serde_json_bytes::Value;

/// A JSON object whose keys preserve insertion order.
pub type Object = JsonMap<ByteString, Value>;

// NOTE: this deserialize helper is used to transform `null` to Default::default()
pub(crate) fn deserialize_null_default<'de, D, T: Default + Deserialize<'de>>(
    deserializer: D,
) -> Result<T, D::Error>
where
    D: serde::Deserializer<'de>,
{
    <Option<T>>::deserialize(deserializer).map(|x| x.unwrap_or_default())
}
