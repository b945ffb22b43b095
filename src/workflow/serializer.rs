//! Variable Serialization
//!
//! Variables are stored as strings. Plain strings are kept verbatim, every
//! other value is written as JSON text.

use serde_json::Value;

use crate::error::VariableConversionError;

/// Converts variable values to and from their stored string form.
pub trait VariableSerializer: Send + Sync {
    /// Renders a value for storage.
    fn to_string(&self, name: &str, value: Value) -> Result<String, VariableConversionError>;

    /// Reads a stored string back into a value.
    fn from_string(&self, name: &str, raw: &str) -> Result<Value, VariableConversionError>;
}

/// JSON backed [`VariableSerializer`].
#[derive(Debug, Clone, Copy, Default)]
pub struct JsonVariableSerializer;

impl VariableSerializer for JsonVariableSerializer {
    fn to_string(&self, name: &str, value: Value) -> Result<String, VariableConversionError> {
        match value {
            Value::String(s) => Ok(s),
            other => serde_json::to_string(&other)
                .map_err(|e| VariableConversionError::new(name, e)),
        }
    }

    fn from_string(&self, _name: &str, raw: &str) -> Result<Value, VariableConversionError> {
        // Anything that isn't JSON was stored as a plain string
        Ok(serde_json::from_str(raw).unwrap_or_else(|_| Value::String(raw.to_string())))
    }
}
