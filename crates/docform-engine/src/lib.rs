#![forbid(unsafe_code)]
#![deny(unreachable_patterns)]

//! Computation core for schema-driven document generation.
//!
//! Given user-entered field values the engine derives computed fields from declarative formulas,
//! propagates control effects between fields (auto-set values, visibility, enablement, option
//! filtering), arbitrates between system values and edits reported back from generated documents
//! (overrides), and keeps a command-based undo history.
//!
//! Every mutation runs through one pipeline in [`Engine`]: store the input, recompute dependent
//! formulas in dependency order, run the control chain, recompute what the chain changed, refresh
//! override system values and notify listeners. Undo and redo replay commands through the same
//! pipeline, so derived state is always recomputed rather than restored.
//!
//! Formulas use `{{field_id}}` references and a closed set of functions:
//!
//! ```
//! use docform_engine::{evaluate, parse_formula};
//! use docform_model::{FieldId, Value};
//! use std::collections::HashMap;
//!
//! let formula = parse_formula("round({{price}} * {{qty}}, 2)").unwrap();
//! let mut values = HashMap::new();
//! values.insert(FieldId::from("price"), Value::Number(2.345));
//! values.insert(FieldId::from("qty"), Value::Number(2.0));
//! assert_eq!(evaluate(&formula, &values), Ok(Value::Number(4.69)));
//! ```

pub mod control;
pub mod error;
pub mod eval;
pub mod functions;
pub mod graph;
pub mod notify;
pub mod overrides;
pub mod parser;
pub mod settings;
pub mod snapshot;
pub mod store;
pub mod undo;
pub mod validation;

mod ast;
mod engine;

pub use ast::{BinaryOp, Expr, Formula, UnaryOp};
pub use control::{
    evaluate_chain, evaluate_chain_from, evaluate_single, ChainEvaluation, ChainWave, ControlError,
    ControlRule, ControlRules, EffectResult, EffectType, Mapping, MatchValue, MAX_CHAIN_DEPTH,
};
pub use engine::Engine;
pub use error::{CoreError, CoreResult};
pub use eval::{evaluate, FormulaError, ValueResolver};
pub use functions::{Function, FunctionSpec};
pub use graph::{CycleError, DependencyGraph};
pub use notify::{FieldChange, SubscriptionId};
pub use overrides::{detect_conflict, Conflict, Override, OverrideError, OverrideState};
pub use parser::ParseError;
pub use settings::{EngineSettings, SettingsError};
pub use snapshot::Snapshot;
pub use store::FieldUiState;
pub use undo::{Clock, ManualClock, SystemClock, UndoCommand, UndoStack};
pub use validation::{SchemaValidator, ValidationResult, Validator};

/// Parses formula text into a [`Formula`] with its dependency set.
pub fn parse_formula(source: &str) -> Result<Formula, ParseError> {
    Formula::parse(source)
}
