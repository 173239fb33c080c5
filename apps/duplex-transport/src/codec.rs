//! Frame Codec
//!
//! Text frames carry JSON. A frame is either a single message object or a
//! batch (a top-level array), which is split into its elements in order.

use serde::Serialize;
use serde::de::DeserializeOwned;
use serde_json::Value;

/// Codec errors.
#[derive(Debug, thiserror::Error)]
pub enum CodecError {
    /// JSON encoding/decoding failed.
    #[error("JSON codec error: {0}")]
    Json(#[from] serde_json::Error),

    /// Batch frame with no messages in it.
    #[error("empty message array")]
    EmptyArray,

    /// Frame is valid JSON but not a message.
    #[error("invalid message format: {0}")]
    InvalidFormat(String),
}

/// JSON codec for channel frames.
#[derive(Debug, Default, Clone, Copy)]
pub struct JsonCodec;

impl JsonCodec {
    /// Decode a text frame into the messages it carries.
    ///
    /// # Errors
    ///
    /// Returns an error if the frame is not JSON, is an empty batch, or
    /// is a bare scalar.
    pub fn decode(text: &str) -> Result<Vec<Value>, CodecError> {
        match serde_json::from_str::<Value>(text.trim())? {
            Value::Array(items) if items.is_empty() => Err(CodecError::EmptyArray),
            Value::Array(items) => Ok(items),
            message @ Value::Object(_) => Ok(vec![message]),
            other => Err(CodecError::InvalidFormat(format!(
                "expected object or array, got {other}"
            ))),
        }
    }

    /// Decode a single message into a typed value.
    ///
    /// # Errors
    ///
    /// Returns an error if the value does not match `T`.
    pub fn decode_as<T: DeserializeOwned>(message: Value) -> Result<T, CodecError> {
        Ok(serde_json::from_value(message)?)
    }

    /// Encode a message into a text frame.
    ///
    /// # Errors
    ///
    /// Returns an error if serialization fails.
    pub fn encode<T: Serialize + ?Sized>(message: &T) -> Result<String, CodecError> {
        Ok(serde_json::to_string(message)?)
    }
}
