use docform_model::{FieldId, SchemaError};

use crate::control::ControlError;
use crate::graph::CycleError;
use crate::overrides::OverrideError;
use crate::parser::ParseError;

#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum CoreError {
    #[error("unknown field `{0}`")]
    UnknownField(FieldId),
    #[error("`{0}` is a formula field and cannot be written directly")]
    FormulaField(FieldId),
    #[error("formula for `{field}`: {source}")]
    Parse {
        field: FieldId,
        #[source]
        source: ParseError,
    },
    #[error(transparent)]
    Cycle(#[from] CycleError),
    #[error(transparent)]
    Control(#[from] ControlError),
    #[error(transparent)]
    Override(#[from] OverrideError),
    #[error(transparent)]
    Schema(#[from] SchemaError),
}

pub type CoreResult<T> = Result<T, CoreError>;
