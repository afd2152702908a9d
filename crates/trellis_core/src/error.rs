//! Error types for trellis_core

use thiserror::Error;

/// Errors raised by the schema engine and property type registry
#[derive(Error, Debug, Clone, PartialEq)]
pub enum CoreError {
    /// A property type with this name is already registered
    #[error("Property type `{0}` is already registered")]
    DuplicatePropertyType(String),

    /// A constrained string property received a value outside its `one_of` set
    #[error("Invalid value `{value}` for property `{property}`; expected one of: {}", allowed.join(", "))]
    InvalidEnumValue {
        property: String,
        value: String,
        allowed: Vec<String>,
    },

    /// Schema declaration could not be interpreted
    #[error("Invalid schema: {0}")]
    InvalidSchema(String),
}

/// Result type for trellis_core operations
pub type Result<T> = std::result::Result<T, CoreError>;
