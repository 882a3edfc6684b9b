//! Error types for schema storage, compilation, transport and the model layer.
//!
//! Validation failures are not Rust errors: they are [`ValidationError`] values
//! collected into a result. The enums here cover programmer errors and I/O.

use std::fmt;
use std::path::PathBuf;

use serde::{Serialize, Serializer};
use serde_json::{Map, Value};
use thiserror::Error;

/// Stable numeric codes for validation errors.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[repr(u16)]
pub enum ErrorCode {
    InvalidType = 0,
    EnumMismatch = 1,
    AnyOfMissing = 10,
    OneOfMissing = 11,
    OneOfMultiple = 12,
    NotPassed = 13,
    NumberMultipleOf = 100,
    NumberMinimum = 101,
    NumberMinimumExclusive = 102,
    NumberMaximum = 103,
    NumberMaximumExclusive = 104,
    StringLengthShort = 200,
    StringLengthLong = 201,
    StringPattern = 202,
    ObjectPropertiesMinimum = 300,
    ObjectPropertiesMaximum = 301,
    ObjectRequired = 302,
    ObjectAdditionalProperties = 303,
    ObjectDependencyKey = 304,
    ArrayLengthShort = 400,
    ArrayLengthLong = 401,
    ArrayUnique = 402,
    ArrayAdditionalItems = 403,
    FormatCustom = 500,
    KeywordCustom = 501,
    CircularReference = 600,
    SchemaMissing = 601,
    SchemaFetchError = 602,
    DocumentFetchError = 603,
    UnknownProperty = 1000,
}

impl ErrorCode {
    /// Numeric value of the code.
    pub fn as_u16(self) -> u16 {
        self as u16
    }

    /// Upper-case identifier, e.g. `"ONE_OF_MISSING"`.
    pub fn name(self) -> &'static str {
        match self {
            ErrorCode::InvalidType => "INVALID_TYPE",
            ErrorCode::EnumMismatch => "ENUM_MISMATCH",
            ErrorCode::AnyOfMissing => "ANY_OF_MISSING",
            ErrorCode::OneOfMissing => "ONE_OF_MISSING",
            ErrorCode::OneOfMultiple => "ONE_OF_MULTIPLE",
            ErrorCode::NotPassed => "NOT_PASSED",
            ErrorCode::NumberMultipleOf => "NUMBER_MULTIPLE_OF",
            ErrorCode::NumberMinimum => "NUMBER_MINIMUM",
            ErrorCode::NumberMinimumExclusive => "NUMBER_MINIMUM_EXCLUSIVE",
            ErrorCode::NumberMaximum => "NUMBER_MAXIMUM",
            ErrorCode::NumberMaximumExclusive => "NUMBER_MAXIMUM_EXCLUSIVE",
            ErrorCode::StringLengthShort => "STRING_LENGTH_SHORT",
            ErrorCode::StringLengthLong => "STRING_LENGTH_LONG",
            ErrorCode::StringPattern => "STRING_PATTERN",
            ErrorCode::ObjectPropertiesMinimum => "OBJECT_PROPERTIES_MINIMUM",
            ErrorCode::ObjectPropertiesMaximum => "OBJECT_PROPERTIES_MAXIMUM",
            ErrorCode::ObjectRequired => "OBJECT_REQUIRED",
            ErrorCode::ObjectAdditionalProperties => "OBJECT_ADDITIONAL_PROPERTIES",
            ErrorCode::ObjectDependencyKey => "OBJECT_DEPENDENCY_KEY",
            ErrorCode::ArrayLengthShort => "ARRAY_LENGTH_SHORT",
            ErrorCode::ArrayLengthLong => "ARRAY_LENGTH_LONG",
            ErrorCode::ArrayUnique => "ARRAY_UNIQUE",
            ErrorCode::ArrayAdditionalItems => "ARRAY_ADDITIONAL_ITEMS",
            ErrorCode::FormatCustom => "FORMAT_CUSTOM",
            ErrorCode::KeywordCustom => "KEYWORD_CUSTOM",
            ErrorCode::CircularReference => "CIRCULAR_REFERENCE",
            ErrorCode::SchemaMissing => "SCHEMA_MISSING",
            ErrorCode::SchemaFetchError => "SCHEMA_FETCH_ERROR",
            ErrorCode::DocumentFetchError => "DOCUMENT_FETCH_ERROR",
            ErrorCode::UnknownProperty => "UNKNOWN_PROPERTY",
        }
    }
}

impl fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} ({})", self.name(), self.as_u16())
    }
}

impl Serialize for ErrorCode {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_u16(self.as_u16())
    }
}

/// Parameters attached to a validation error.
///
/// `errors` is only populated for `anyOf`/`oneOf` failures: one inner list per
/// branch, in branch order.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct ErrorParams {
    #[serde(flatten)]
    pub values: Map<String, Value>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub errors: Vec<Vec<ValidationError>>,
}

impl ErrorParams {
    pub fn get(&self, key: &str) -> Option<&Value> {
        self.values.get(key)
    }

    pub(crate) fn with(mut self, key: &str, value: impl Into<Value>) -> Self {
        self.values.insert(key.to_string(), value.into());
        self
    }
}

/// One keyword violation.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ValidationError {
    pub code: ErrorCode,
    pub params: ErrorParams,
    /// JSON Pointer (RFC 6901) to the offending value.
    pub path: String,
    /// Schema URI whose keyword produced the error.
    pub schema: String,
}

impl ValidationError {
    pub(crate) fn new(code: ErrorCode, path: &str, schema: &str) -> Self {
        Self {
            code,
            params: ErrorParams::default(),
            path: path.to_string(),
            schema: schema.to_string(),
        }
    }

    pub(crate) fn param(mut self, key: &str, value: impl Into<Value>) -> Self {
        self.params = self.params.with(key, value);
        self
    }

    pub(crate) fn branches(mut self, errors: Vec<Vec<ValidationError>>) -> Self {
        self.params.errors = errors;
        self
    }
}

impl fmt::Display for ValidationError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let path = if self.path.is_empty() { "/" } else { &self.path };
        write!(f, "{}: {} (schema {})", path, self.code.name(), self.schema)
    }
}

/// Errors raised while resolving schema documents.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum StoreError {
    #[error("circular $ref chain: {}", chain.join(" -> "))]
    CircularReference { chain: Vec<String> },
}

/// Errors raised by the validator compiler.
#[derive(Debug, Error)]
pub enum CompileError {
    #[error("schema {uri} has already been compiled")]
    AlreadyCompiled { uri: String },

    #[error("invalid regular expression {pattern:?} in {uri}: {source}")]
    InvalidPattern {
        uri: String,
        pattern: String,
        #[source]
        source: regex::Error,
    },
}

/// Errors produced by a [`Transport`](crate::Transport) implementation.
#[derive(Debug, Error)]
pub enum TransportError {
    #[error("no document at {url}")]
    NotFound { url: String },

    #[error("{url} returned HTTP status {status}")]
    Status { url: String, status: u16 },

    #[error("cannot read {path}: {source}")]
    ReadError {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[cfg(feature = "remote")]
    #[error("failed to fetch {url}: {source}")]
    NetworkError {
        url: String,
        #[source]
        source: reqwest::Error,
    },

    #[error("invalid JSON from {url}: {source}")]
    InvalidJson {
        url: String,
        #[source]
        source: serde_json::Error,
    },

    #[error("unsupported request to {url}: {message}")]
    Unsupported { url: String, message: String },
}

impl TransportError {
    /// Whether retrying the same request could plausibly succeed.
    pub fn is_transient(&self) -> bool {
        match self {
            TransportError::Status { status, .. } => *status >= 500,
            #[cfg(feature = "remote")]
            TransportError::NetworkError { .. } => true,
            _ => false,
        }
    }
}

/// Errors from the reactive model and model cache.
#[derive(Debug, Error)]
pub enum ModelError {
    #[error(transparent)]
    Compile(#[from] CompileError),

    #[error("failed to load document {url}: {source}")]
    Document {
        url: String,
        #[source]
        source: TransportError,
    },
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn error_codes_are_stable() {
        assert_eq!(ErrorCode::InvalidType.as_u16(), 0);
        assert_eq!(ErrorCode::OneOfMultiple.as_u16(), 12);
        assert_eq!(ErrorCode::ArrayUnique.as_u16(), 402);
        assert_eq!(ErrorCode::CircularReference.as_u16(), 600);
        assert_eq!(ErrorCode::UnknownProperty.as_u16(), 1000);
        assert_eq!(ErrorCode::SchemaFetchError.name(), "SCHEMA_FETCH_ERROR");
    }

    #[test]
    fn validation_error_display() {
        let err = ValidationError::new(ErrorCode::ObjectRequired, "/buyer", "/schemas/order")
            .param("key", "email");
        assert_eq!(
            err.to_string(),
            "/buyer: OBJECT_REQUIRED (schema /schemas/order)"
        );
        assert_eq!(err.params.get("key"), Some(&Value::from("email")));
    }

    #[test]
    fn validation_error_serializes_numeric_code() {
        let err = ValidationError::new(ErrorCode::AnyOfMissing, "", "s")
            .branches(vec![vec![], vec![ValidationError::new(ErrorCode::InvalidType, "", "s#/anyOf/1")]]);
        let json = serde_json::to_value(&err).unwrap();
        assert_eq!(json["code"], 10);
        assert_eq!(json["params"]["errors"].as_array().unwrap().len(), 2);
        assert_eq!(json["params"]["errors"][1][0]["code"], 0);
    }

    #[test]
    fn transport_error_transience() {
        let err = TransportError::Status {
            url: "http://x".into(),
            status: 503,
        };
        assert!(err.is_transient());
        let err = TransportError::NotFound { url: "x".into() };
        assert!(!err.is_transient());
    }
}
