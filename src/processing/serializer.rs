// src/processing/serializer.rs
//! Compact JSON encoding of event maps
//!
//! Map keys are emitted in sorted order, so equal maps always serialize to
//! identical bytes.

use crate::events::EventMap;
use crate::utils::errors::{EngineError, Result};
use serde_json::Value;

pub struct Serializer;

impl Serializer {
    /// Serialize to compact JSON text
    pub fn serialize(map: &EventMap) -> Result<String> {
        serde_json::to_string(map)
            .map_err(|e| EngineError::SerializationFailed(format!("Failed to serialize: {}", e)))
    }

    /// Parse JSON bytes back into an event map
    pub fn deserialize(data: &[u8]) -> Result<EventMap> {
        match serde_json::from_slice::<Value>(data) {
            Ok(Value::Object(map)) => Ok(map),
            Ok(other) => Err(EngineError::SerializationFailed(format!(
                "Expected a JSON object, found {}",
                json_type(&other)
            ))),
            Err(e) => Err(EngineError::SerializationFailed(format!(
                "Failed to deserialize: {}",
                e
            ))),
        }
    }
}

fn json_type(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "boolean",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Array(_) => "array",
        Value::Object(_) => "object",
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_compact_and_deterministic() {
        let a = json!({"b": 1, "a": [1, 2], "c": {"z": null, "y": "ü"}});
        let b = json!({"c": {"y": "ü", "z": null}, "a": [1, 2], "b": 1});

        let a = Serializer::serialize(a.as_object().unwrap()).unwrap();
        let b = Serializer::serialize(b.as_object().unwrap()).unwrap();

        assert_eq!(a, b);
        assert_eq!(a, r#"{"a":[1,2],"b":1,"c":{"y":"ü","z":null}}"#);
    }

    #[test]
    fn test_deserialize_rejects_non_objects() {
        assert!(Serializer::deserialize(b"[1,2,3]").is_err());
        assert!(Serializer::deserialize(b"not json").is_err());
        assert!(Serializer::deserialize(br#"{"ok":true}"#).is_ok());
    }
}
