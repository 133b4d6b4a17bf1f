//! Adaptor contract

use crate::error::{Error, Result};
use crate::sink::ResponseSink;
use crate::types::{RawResponse, RelayMeta};
use async_trait::async_trait;
use bytes::Bytes;
use quota_ledger::Usage;

/// Translates one attempt to and from a provider's wire format
///
/// A fresh adaptor is created for every attempt, so implementations may
/// keep per-request state between calls.
#[async_trait]
pub trait Adaptor: Send + Sync {
    /// Adaptor name (for logs)
    fn name(&self) -> &str;

    /// Prepare for an attempt
    fn init(&mut self, meta: &RelayMeta);

    /// Convert the client body into the provider's payload
    fn convert_request(&mut self, meta: &RelayMeta, request: &Bytes) -> Result<Bytes>;

    /// Send the payload; any status is returned as a response
    async fn send_request(&self, meta: &RelayMeta, payload: Bytes) -> Result<RawResponse>;

    /// Write the client-facing body into `sink` and report usage
    async fn convert_response(
        &self,
        meta: &RelayMeta,
        response: RawResponse,
        sink: &mut dyn ResponseSink,
    ) -> Result<Usage>;
}

/// Creates adaptors for one provider family
pub trait AdaptorFactory: Send + Sync {
    /// New adaptor for one attempt
    fn create(&self) -> Box<dyn Adaptor>;
}

/// Merge channel parameter overrides into a JSON payload
pub fn apply_param_override(
    payload: Bytes,
    overrides: &serde_json::Map<String, serde_json::Value>,
) -> Result<Bytes> {
    if overrides.is_empty() {
        return Ok(payload);
    }
    let mut value: serde_json::Value = serde_json::from_slice(&payload)?;
    let object = value
        .as_object_mut()
        .ok_or_else(|| Error::InvalidRequest("param override needs a JSON object body".to_string()))?;
    for (key, override_value) in overrides {
        object.insert(key.clone(), override_value.clone());
    }
    Ok(Bytes::from(serde_json::to_vec(&value)?))
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_param_override_replaces_top_level_keys() {
        let payload = Bytes::from(json!({"model": "m", "temperature": 1.0}).to_string());
        let mut overrides = serde_json::Map::new();
        overrides.insert("temperature".into(), json!(0.2));
        overrides.insert("top_p".into(), json!(0.9));

        let out = apply_param_override(payload, &overrides).unwrap();
        let value: serde_json::Value = serde_json::from_slice(&out).unwrap();
        assert_eq!(value["temperature"], json!(0.2));
        assert_eq!(value["top_p"], json!(0.9));
        assert_eq!(value["model"], json!("m"));
    }

    #[test]
    fn test_empty_override_keeps_bytes() {
        let payload = Bytes::from_static(b"not json");
        let out = apply_param_override(payload.clone(), &serde_json::Map::new()).unwrap();
        assert_eq!(out, payload);
    }

    #[test]
    fn test_override_rejects_non_object() {
        let mut overrides = serde_json::Map::new();
        overrides.insert("a".into(), json!(1));
        let err = apply_param_override(Bytes::from_static(b"[1]"), &overrides).unwrap_err();
        assert!(err.is_local());
    }
}
