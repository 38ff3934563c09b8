//! `docform-model` defines the core in-memory data structures of a docform schema.
//!
//! The crate is intentionally self-contained so it can be reused by:
//! - the computation core (formulas, control rules, overrides, undo)
//! - persistence and document adapters via `serde` (JSON-safe schema)

mod field;
mod schema;
pub mod serde_defaults;
mod value;

pub use field::{FieldDefinition, FieldId, FieldType};
pub use schema::{Schema, SchemaError};
pub use value::Value;
