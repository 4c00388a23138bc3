//! Context encoding for handing accumulated scenario results to worker
//! processes.
//!
//! The context is the `results: map<Name, ScenarioResult>` the test
//! runner has observed so far, serialized as base64-of-UTF8-JSON so it
//! survives being passed as a single command-line argument to a worker
//! command (`run-test`, `run-scenario`, `run-user`).

use base64::Engine;
use base64::engine::general_purpose::STANDARD;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ContextError {
    #[error("context is not valid base64: {0}")]
    Base64(#[from] base64::DecodeError),
    #[error("context is not valid UTF-8: {0}")]
    Utf8(#[from] std::string::FromUtf8Error),
    #[error("context is not valid JSON: {0}")]
    Json(#[from] serde_json::Error),
}

/// Encode an arbitrary JSON-serializable value as base64(UTF8(JSON(value))).
pub fn encode_context<T: serde::Serialize>(value: &T) -> String {
    let json = serde_json::to_string(value).expect("context values are always serializable");
    STANDARD.encode(json)
}

/// Decode a context string produced by [`encode_context`].
pub fn decode_context<T: serde::de::DeserializeOwned>(encoded: &str) -> Result<T, ContextError> {
    let bytes = STANDARD.decode(encoded)?;
    let json = String::from_utf8(bytes)?;
    Ok(serde_json::from_str(&json)?)
}

/// The default, empty context: base64 of `{}`.
pub fn empty_context() -> String {
    encode_context(&serde_json::json!({}))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    #[test]
    fn round_trips_arbitrary_json() {
        let mut map = HashMap::new();
        map.insert("a".to_string(), serde_json::json!({"output": 42}));
        map.insert("b".to_string(), serde_json::json!({"output": "hi", "failed": 0}));

        let encoded = encode_context(&map);
        let decoded: HashMap<String, serde_json::Value> = decode_context(&encoded).unwrap();

        assert_eq!(decoded, map);
    }

    #[test]
    fn empty_context_decodes_to_empty_object() {
        let decoded: serde_json::Value = decode_context(&empty_context()).unwrap();
        assert_eq!(decoded, serde_json::json!({}));
    }

    #[test]
    fn rejects_invalid_base64() {
        let err = decode_context::<serde_json::Value>("not valid base64!!!").unwrap_err();
        assert!(matches!(err, ContextError::Base64(_)));
    }
}
