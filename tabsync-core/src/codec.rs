//! JSON text codec for persisted values.
//!
//! Values are stored under their plain key name as JSON text. No envelope,
//! version tag or checksum is added, so other writers sharing the backend can
//! read and write the same entries.

use serde_json::Value;

use crate::error::CodecError;

/// Encode a value to the persisted text form.
///
/// The absent marker (`None`) encodes as JSON `null`, which is what a plain
/// JSON serializer produces for a missing value.
pub fn encode(key: &str, value: Option<&Value>) -> Result<String, CodecError> {
    serde_json::to_string(&value).map_err(|e| CodecError::Serialization {
        key: key.to_string(),
        reason: e.to_string(),
    })
}

/// Decode persisted text into a value.
pub fn decode(key: &str, raw: &str) -> Result<Value, CodecError> {
    serde_json::from_str(raw).map_err(|e| CodecError::Deserialization {
        key: key.to_string(),
        reason: e.to_string(),
    })
}
