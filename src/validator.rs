//! One-shot validation against a standalone schema document.

use serde_json::Value;

use crate::compiler::Generator;
use crate::error::CompileError;
use crate::types::{GeneratorOptions, ValidationResult};

/// URI used for a schema that does not declare its own `id`.
pub const INLINE_SCHEMA_URI: &str = "urn:json-model:inline";

/// Validate `value` against `schema`.
///
/// Compiles into a throwaway generator. `$ref`s to other documents are
/// treated as missing and impose no constraint.
///
/// # Errors
///
/// Returns `CompileError` if the schema cannot be compiled.
pub fn validate(schema: &Value, value: &Value) -> Result<ValidationResult, CompileError> {
    validate_with_options(schema, value, &GeneratorOptions::default())
}

/// Like [`validate`], with explicit accumulator options.
pub fn validate_with_options(
    schema: &Value,
    value: &Value,
    options: &GeneratorOptions,
) -> Result<ValidationResult, CompileError> {
    let uri = schema
        .get("id")
        .and_then(Value::as_str)
        .unwrap_or(INLINE_SCHEMA_URI)
        .to_string();
    let mut generator = Generator::new(options.clone());
    generator.add_schema(&uri, Some(schema.clone()), None)?;
    let validators = generator.compile()?;
    Ok(validators.validate(&uri, value))
}
