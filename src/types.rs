//! Core types shared by the compiler and the model layer.

use std::collections::BTreeMap;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::ValidationError;

/// Returns the JSON type name for error messages.
pub fn json_type_name(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "boolean",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Array(_) => "array",
        Value::Object(_) => "object",
    }
}

/// Deep equality where numbers compare by value (`1 == 1.0`).
pub fn json_equal(a: &Value, b: &Value) -> bool {
    match (a, b) {
        (Value::Number(x), Value::Number(y)) => match (x.as_f64(), y.as_f64()) {
            (Some(x), Some(y)) => x == y,
            _ => x == y,
        },
        (Value::Array(x), Value::Array(y)) => {
            x.len() == y.len() && x.iter().zip(y).all(|(a, b)| json_equal(a, b))
        }
        (Value::Object(x), Value::Object(y)) => {
            x.len() == y.len()
                && x.iter()
                    .all(|(k, v)| y.get(k).is_some_and(|other| json_equal(v, other)))
        }
        _ => a == b,
    }
}

/// Hyper-schema link resolved for a value.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Link {
    pub href: String,
    pub rel: String,
    pub method: String,
}

/// Pointer path → entries, ordered by path.
pub type PathMap<T> = BTreeMap<String, Vec<T>>;

/// Outcome of running validators over a value.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct ValidationResult {
    pub valid: bool,
    pub errors: Vec<ValidationError>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub schemas: Option<PathMap<String>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub links: Option<PathMap<Link>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub missing: Option<PathMap<String>>,
}

/// Options for the validator compiler.
///
/// The assignment flags decide which accumulators compiled units fill in
/// besides the error list.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct GeneratorOptions {
    /// Record which schema URIs matched at each path.
    pub assign_schemas: bool,
    /// Record hyper-schema links reachable at each path.
    pub assign_links: bool,
    /// Record references skipped because their schema was absent.
    pub track_missing: bool,
    /// Count string length in code points (`true`) or UTF-16 units.
    pub unicode_length: bool,
}

impl Default for GeneratorOptions {
    fn default() -> Self {
        Self {
            assign_schemas: false,
            assign_links: false,
            track_missing: false,
            unicode_length: true,
        }
    }
}

impl GeneratorOptions {
    pub fn new() -> Self {
        Self::default()
    }

    /// All accumulators on, as used by the reactive model.
    pub fn tracking() -> Self {
        Self::default()
            .assign_schemas(true)
            .assign_links(true)
            .track_missing(true)
    }

    pub fn assign_schemas(mut self, enabled: bool) -> Self {
        self.assign_schemas = enabled;
        self
    }

    pub fn assign_links(mut self, enabled: bool) -> Self {
        self.assign_links = enabled;
        self
    }

    pub fn track_missing(mut self, enabled: bool) -> Self {
        self.track_missing = enabled;
        self
    }

    pub fn unicode_length(mut self, enabled: bool) -> Self {
        self.unicode_length = enabled;
        self
    }
}

/// Options for the model cache.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ModelOptions {
    /// Idle time after which a cached model is dropped.
    #[serde(with = "duration_ms")]
    pub ttl: Duration,
}

impl Default for ModelOptions {
    fn default() -> Self {
        Self {
            ttl: Duration::from_secs(60),
        }
    }
}

impl ModelOptions {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn ttl(mut self, ttl: Duration) -> Self {
        self.ttl = ttl;
        self
    }
}

mod duration_ms {
    use std::time::Duration;

    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(d: &Duration, s: S) -> Result<S::Ok, S::Error> {
        s.serialize_u64(d.as_millis() as u64)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Duration, D::Error> {
        u64::deserialize(d).map(Duration::from_millis)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn numbers_compare_by_value() {
        assert!(json_equal(&json!(1), &json!(1.0)));
        assert!(json_equal(&json!({"a": [1, 2.0]}), &json!({"a": [1.0, 2]})));
        assert!(!json_equal(&json!({"a": 1}), &json!({"a": 1, "b": 2})));
        assert!(!json_equal(&json!("1"), &json!(1)));
    }

    #[test]
    fn generator_options_builder() {
        let opts = GeneratorOptions::tracking().unicode_length(false);
        assert!(opts.assign_schemas && opts.assign_links && opts.track_missing);
        assert!(!opts.unicode_length);
        assert!(GeneratorOptions::default().unicode_length);
    }

    #[test]
    fn options_deserialize_with_defaults() {
        let opts: GeneratorOptions = serde_json::from_value(json!({"assign_links": true})).unwrap();
        assert!(opts.assign_links);
        assert!(!opts.assign_schemas);

        let opts: ModelOptions = serde_json::from_value(json!({"ttl": 1500})).unwrap();
        assert_eq!(opts.ttl, Duration::from_millis(1500));
    }
}
