use std::fmt;

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};

use crate::error::{ErrorCode, Result, SagaError};

/// Opaque serialized business data threaded through a saga.
///
/// The engine stores and forwards payloads verbatim; only saga definitions
/// and step functions interpret them.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Payload(String);

impl Payload {
    /// An empty JSON object.
    #[must_use]
    pub fn empty() -> Self {
        Self(String::from("{}"))
    }

    #[must_use]
    pub fn from_raw(raw: impl Into<String>) -> Self {
        Self(raw.into())
    }

    /// Serializes `value` as JSON.
    ///
    /// # Errors
    ///
    /// Returns `SerializationFailed` if `value` cannot be represented as JSON.
    pub fn encode<T: Serialize + ?Sized>(value: &T) -> Result<Self> {
        serde_json::to_string(value).map(Self).map_err(|e| {
            SagaError::new(ErrorCode::SerializationFailed, "failed to encode payload")
                .with_source(e)
        })
    }

    /// Deserializes the payload into `T`.
    ///
    /// # Errors
    ///
    /// Returns `DeserializationFailed` if the payload does not match `T`.
    pub fn decode<T: DeserializeOwned>(&self) -> Result<T> {
        serde_json::from_str(&self.0).map_err(|e| {
            SagaError::new(ErrorCode::DeserializationFailed, "failed to decode payload")
                .with_source(e)
        })
    }

    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }

    #[must_use]
    pub fn into_string(self) -> String {
        self.0
    }

    /// Shallow-merges the top-level keys of `other` into `self`.
    ///
    /// When either side is not a JSON object `self` is returned unchanged.
    ///
    /// # Errors
    ///
    /// Returns `DeserializationFailed` if either payload is not valid JSON.
    pub fn merged_with(&self, other: &Payload) -> Result<Self> {
        let base: serde_json::Value = self.decode()?;
        let update: serde_json::Value = other.decode()?;
        match (base, update) {
            (serde_json::Value::Object(mut base), serde_json::Value::Object(update)) => {
                base.extend(update);
                Self::encode(&base)
            }
            _ => Ok(self.clone()),
        }
    }
}

impl Default for Payload {
    fn default() -> Self {
        Self::empty()
    }
}

impl fmt::Display for Payload {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

#[cfg(test)]
mod tests {
    use serde::Deserialize;

    use super::*;

    #[derive(Debug, PartialEq, Serialize, Deserialize)]
    struct Upload {
        file_name: String,
        size: u64,
    }

    #[test]
    fn raw_payload_is_kept_verbatim() {
        let raw = r#"{ "z": 1,   "a": [true] }"#;
        let payload = Payload::from_raw(raw);
        assert_eq!(payload.as_str(), raw);
    }

    #[test]
    fn decode_into_wrong_shape_reports_deserialization_failure() {
        let payload = Payload::from_raw(r#"{"file_name": 3}"#);
        let err = payload.decode::<Upload>().expect_err("shape mismatch");
        assert_eq!(err.code(), ErrorCode::DeserializationFailed);
    }

    #[test]
    fn merge_overrides_and_adds_top_level_keys() -> anyhow::Result<()> {
        let base = Payload::from_raw(r#"{"file_name":"a.txt","size":1}"#);
        let update = Payload::from_raw(r#"{"size":10,"storage_key":"blob-1"}"#);

        let merged: serde_json::Value = base.merged_with(&update)?.decode()?;

        assert_eq!(merged["file_name"], "a.txt");
        assert_eq!(merged["size"], 10);
        assert_eq!(merged["storage_key"], "blob-1");
        Ok(())
    }

    #[test]
    fn merge_with_non_object_leaves_base_untouched() -> anyhow::Result<()> {
        let base = Payload::from_raw(r#"{"a":1}"#);
        let merged = base.merged_with(&Payload::from_raw("42"))?;
        assert_eq!(merged, base);
        Ok(())
    }
}
