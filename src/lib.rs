//! JSON Model
//!
//! JSON Schema validator compiler and reactive JSON data model.
//!
//! Schema documents (draft-4 style, with hyper-schema `links`) are compiled
//! once per URI into reusable validation units. Documents may reference each
//! other, recursively, and may arrive lazily: the [`Context`] fetch loop pulls
//! missing schemas through a pluggable [`Transport`] and recompiles until
//! nothing is missing.
//!
//! # Example
//!
//! ```
//! use json_model::{Generator, GeneratorOptions};
//! use serde_json::json;
//!
//! let mut generator = Generator::new(GeneratorOptions::default());
//! generator
//!     .add_schema(
//!         "/schemas/item",
//!         Some(json!({
//!             "type": "object",
//!             "properties": { "id": { "type": "integer" } },
//!             "required": ["id"]
//!         })),
//!         None,
//!     )
//!     .unwrap();
//! let validators = generator.compile().unwrap();
//!
//! assert!(validators.validate("/schemas/item", &json!({ "id": 5 })).valid);
//! assert!(!validators.validate("/schemas/item", &json!({ "id": "5" })).valid);
//! ```
//!
//! # Reactive models
//!
//! A [`RootModel`] owns a JSON value and re-runs its schemas after every
//! write. [`Model`] handles address paths inside it and receive
//! [`ModelEvent`]s:
//!
//! | Event | Delivered to |
//! |-------|--------------|
//! | `Change { path }` | the written path and each ancestor, with the path relative to the handle |
//! | `Change { path: "" }` | every handle below the written path |
//! | `SchemaChange { added, removed }` | every handle whose applicable schemas changed |
//!
//! # Error codes
//!
//! Validation failures carry a stable numeric [`ErrorCode`], e.g.
//! `INVALID_TYPE` (0), `ONE_OF_MISSING` (11), `OBJECT_REQUIRED` (302).
//! `anyOf`/`oneOf` failures nest each branch's errors in `params.errors`.

mod cache;
mod compiler;
mod error;
mod fetch;
mod keywords;
mod model;
pub mod pointer;
mod store;
pub mod template;
mod transport;
mod types;
pub mod uri;
mod validator;

pub use cache::{described_by, ModelCache};
pub use compiler::{Generator, ValidationState, ValidationUnit, Validators};
pub use error::{
    CompileError, ErrorCode, ErrorParams, ModelError, StoreError, TransportError, ValidationError,
};
pub use fetch::Context;
pub use keywords::FormatFn;
pub use model::{ErrorFilter, Model, ModelEvent, RootModel, Subscription};
pub use store::{Resolved, SchemaStore};
pub use template::{TemplateSubject, UriTemplate};
pub use transport::{
    Body, DirTransport, FetchRequest, FetchResponse, Headers, MemoryTransport, Transport,
};
pub use types::{
    json_equal, json_type_name, GeneratorOptions, Link, ModelOptions, PathMap, ValidationResult,
};
pub use validator::{validate, validate_with_options, INLINE_SCHEMA_URI};

#[cfg(feature = "remote")]
pub use transport::HttpTransport;
