//! Error types for the codec crate.

use thiserror::Error;

/// Result type for codec operations.
pub type CodecResult<T> = Result<T, CodecError>;

/// Errors that can occur while encoding or decoding primitive values.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum CodecError {
    /// The value does not match the declared type.
    #[error("type mismatch: expected {expected}, found {found}")]
    TypeMismatch {
        /// Declared type.
        expected: String,
        /// What was actually supplied.
        found: String,
    },

    /// The value is outside the range of the declared type.
    #[error("value {value} is out of range for {kind}")]
    OutOfRange {
        /// Declared type.
        kind: String,
        /// Offending value, rendered as text.
        value: String,
    },

    /// A textual literal could not be parsed.
    #[error("invalid {kind} literal: {message}")]
    InvalidLiteral {
        /// Declared type.
        kind: String,
        /// Description of the problem.
        message: String,
    },

    /// A type expression could not be resolved.
    #[error("unknown type expression: {expression}")]
    UnknownType {
        /// The unresolved expression.
        expression: String,
    },

    /// A complex value carries a field its type does not declare.
    #[error("type {type_name} has no field {field}")]
    UnknownField {
        /// Complex type name.
        type_name: String,
        /// Undeclared field.
        field: String,
    },
}

impl CodecError {
    /// Creates a type mismatch error.
    pub fn type_mismatch(expected: impl Into<String>, found: impl Into<String>) -> Self {
        Self::TypeMismatch {
            expected: expected.into(),
            found: found.into(),
        }
    }

    /// Creates an out-of-range error.
    pub fn out_of_range(kind: impl Into<String>, value: impl ToString) -> Self {
        Self::OutOfRange {
            kind: kind.into(),
            value: value.to_string(),
        }
    }

    /// Creates an invalid literal error.
    pub fn invalid_literal(kind: impl Into<String>, message: impl Into<String>) -> Self {
        Self::InvalidLiteral {
            kind: kind.into(),
            message: message.into(),
        }
    }

    /// Creates an unknown type error.
    pub fn unknown_type(expression: impl Into<String>) -> Self {
        Self::UnknownType {
            expression: expression.into(),
        }
    }
}
