//! Schema validation and decoding.
//!
//! Decoding is two steps: serde checks shape (required fields, literal
//! sets) and [`Validate`] checks values. The `decode` helpers always run
//! both, so a message that made it through one is safe to route.

use rust_decimal::Decimal;
use serde::Serialize;
use serde::de::DeserializeOwned;
use serde_json::Value;

/// Malformed message.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum SchemaError {
    /// Structure did not match: missing field, wrong type or unknown literal.
    #[error("malformed message: {0}")]
    Malformed(String),

    /// A field held a value outside its allowed range.
    #[error("invalid {field}: {message}")]
    InvalidField {
        /// Offending field.
        field: &'static str,
        /// What is wrong with it.
        message: String,
    },
}

impl SchemaError {
    /// Build an [`SchemaError::InvalidField`].
    #[must_use]
    pub fn invalid(field: &'static str, message: impl Into<String>) -> Self {
        Self::InvalidField {
            field,
            message: message.into(),
        }
    }
}

impl From<serde_json::Error> for SchemaError {
    fn from(err: serde_json::Error) -> Self {
        Self::Malformed(err.to_string())
    }
}

/// Value-level checks run after a message is decoded or before it is sent.
pub trait Validate {
    /// Check every field constraint.
    ///
    /// # Errors
    ///
    /// Returns the first violated constraint.
    fn validate(&self) -> Result<(), SchemaError>;
}

/// Decode and validate a message from a text frame.
///
/// # Errors
///
/// Returns [`SchemaError`] if the frame is not the expected message.
pub fn decode<T: DeserializeOwned + Validate>(text: &str) -> Result<T, SchemaError> {
    let message: T = serde_json::from_str(text)?;
    message.validate()?;
    Ok(message)
}

/// Decode and validate a message from parsed JSON.
///
/// # Errors
///
/// Returns [`SchemaError`] if the value is not the expected message.
pub fn from_value<T: DeserializeOwned + Validate>(value: Value) -> Result<T, SchemaError> {
    let message: T = serde_json::from_value(value)?;
    message.validate()?;
    Ok(message)
}

/// Encode a message as JSON.
///
/// # Errors
///
/// Returns [`SchemaError::Malformed`] if serialization fails.
pub fn to_value<T: Serialize>(message: &T) -> Result<Value, SchemaError> {
    Ok(serde_json::to_value(message)?)
}

pub(crate) fn require_text(field: &'static str, value: &str) -> Result<(), SchemaError> {
    if value.trim().is_empty() {
        return Err(SchemaError::invalid(field, "must not be empty"));
    }
    Ok(())
}

pub(crate) fn require_non_negative(field: &'static str, value: Decimal) -> Result<(), SchemaError> {
    if value.is_sign_negative() && !value.is_zero() {
        return Err(SchemaError::invalid(field, format!("must not be negative, got {value}")));
    }
    Ok(())
}
