//! Wire payload encoding.
//!
//! Payloads are JSON on the wire. Plain JSON-compatible values pass through
//! unchanged; binary payloads use a reserved two-key wrapper object,
//! `{"__class__":"bytes","__value__":"<base64>"}`, which is the only escape
//! mechanism and must round-trip bit-exactly on both peers.

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine as _;
use serde::de::Error as _;
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use serde_json::{json, Value};

use crate::error::{QrpcError, Result};

const BYTES_CLASS_KEY: &str = "__class__";
const BYTES_VALUE_KEY: &str = "__value__";
const BYTES_CLASS: &str = "bytes";

/// A message body: either an arbitrary JSON value or an opaque byte blob.
///
/// The variant is decided at the boundary when decoding, never inferred
/// downstream.
#[derive(Debug, Clone, PartialEq)]
pub enum Body {
    Json(Value),
    Bytes(Vec<u8>),
}

impl Body {
    pub fn text(s: impl Into<String>) -> Self {
        Body::Json(Value::String(s.into()))
    }

    /// Serializes the body to its JSON wire form.
    pub fn encode(&self) -> Result<Vec<u8>> {
        Ok(serde_json::to_vec(self)?)
    }

    /// Parses a wire payload back into a body.
    pub fn decode(data: &[u8]) -> Result<Body> {
        let value: Value =
            serde_json::from_slice(data).map_err(|e| QrpcError::Envelope(e.to_string()))?;
        Body::from_value(value)
    }

    fn from_value(value: Value) -> Result<Body> {
        if let Some(obj) = value.as_object() {
            if obj.get(BYTES_CLASS_KEY).and_then(Value::as_str) == Some(BYTES_CLASS) {
                let encoded = obj
                    .get(BYTES_VALUE_KEY)
                    .and_then(Value::as_str)
                    .ok_or_else(|| {
                        QrpcError::Envelope("bytes wrapper missing __value__".to_string())
                    })?;
                let raw = BASE64
                    .decode(encoded.trim())
                    .map_err(|e| QrpcError::Envelope(format!("invalid base64 payload: {e}")))?;
                return Ok(Body::Bytes(raw));
            }
        }
        Ok(Body::Json(value))
    }

    fn to_value(&self) -> Value {
        match self {
            Body::Json(value) => value.clone(),
            Body::Bytes(raw) => json!({
                BYTES_CLASS_KEY: BYTES_CLASS,
                BYTES_VALUE_KEY: BASE64.encode(raw),
            }),
        }
    }
}

impl Serialize for Body {
    fn serialize<S: Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
        self.to_value().serialize(serializer)
    }
}

impl<'de> Deserialize<'de> for Body {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> std::result::Result<Self, D::Error> {
        let value = Value::deserialize(deserializer)?;
        Body::from_value(value).map_err(D::Error::custom)
    }
}

/// Serde helper for byte fields carried inside a JSON document using the
/// bytes wrapper (a bare string is also accepted when decoding, for
/// synthetic replies whose body is plain text).
pub mod wrapped_bytes {
    use super::*;

    pub fn serialize<S: Serializer>(
        bytes: &[u8],
        serializer: S,
    ) -> std::result::Result<S::Ok, S::Error> {
        Body::Bytes(bytes.to_vec()).serialize(serializer)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(
        deserializer: D,
    ) -> std::result::Result<Vec<u8>, D::Error> {
        match Body::deserialize(deserializer)? {
            Body::Bytes(raw) => Ok(raw),
            Body::Json(Value::String(s)) => Ok(s.into_bytes()),
            Body::Json(other) => Err(D::Error::custom(format!(
                "expected bytes wrapper or string, got {other}"
            ))),
        }
    }
}

/// One broker message: an already-encoded payload plus the routing metadata
/// the RPC layer cares about.
#[derive(Debug, Clone, PartialEq)]
pub struct Envelope {
    pub payload: Vec<u8>,
    pub correlation_id: Option<String>,
    pub reply_to: Option<String>,
    /// AMQP delivery mode; 1 = non-persistent.
    pub delivery_mode: u8,
}

impl Envelope {
    pub fn new(payload: Vec<u8>) -> Self {
        Self {
            payload,
            correlation_id: None,
            reply_to: None,
            delivery_mode: 1,
        }
    }

    pub fn with_correlation_id(mut self, id: impl Into<String>) -> Self {
        self.correlation_id = Some(id.into());
        self
    }

    pub fn with_reply_to(mut self, queue: impl Into<String>) -> Self {
        self.reply_to = Some(queue.into());
        self
    }
}
