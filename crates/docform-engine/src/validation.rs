use docform_model::{FieldDefinition, FieldType, Value};
use serde::{Deserialize, Serialize};

use crate::store::FieldUiState;

#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct ValidationResult {
    pub errors: Vec<String>,
}

impl ValidationResult {
    pub fn valid() -> Self {
        Self::default()
    }

    pub fn is_valid(&self) -> bool {
        self.errors.is_empty()
    }

    pub fn push(&mut self, message: impl Into<String>) {
        self.errors.push(message.into());
    }

    /// All messages joined for single-line display.
    pub fn message(&self) -> String {
        self.errors.join("; ")
    }
}

/// Field-level validation hook.
///
/// The engine calls it for [`Engine::get_validation_state`](crate::Engine::get_validation_state)
/// and before an override is accepted.
pub trait Validator: Send {
    fn validate(&self, field: &FieldDefinition, value: &Value, ui: &FieldUiState)
        -> ValidationResult;
}

/// Checks requiredness, value shape and option membership from the schema alone.
#[derive(Debug, Clone, Copy, Default)]
pub struct SchemaValidator;

impl Validator for SchemaValidator {
    fn validate(
        &self,
        field: &FieldDefinition,
        value: &Value,
        ui: &FieldUiState,
    ) -> ValidationResult {
        let mut result = ValidationResult::valid();

        // Hidden fields are not asked for, so they cannot be missing.
        if field.required && ui.visible && value.is_empty() {
            result.push(format!("{} is required", display_name(field)));
            return result;
        }
        if !field.field_type.accepts(value) {
            result.push(format!(
                "{} expects {}, got {}",
                display_name(field),
                type_label(field.field_type),
                value.type_name()
            ));
            return result;
        }

        let allowed = ui.options.as_deref().unwrap_or(&field.options);
        if allowed.is_empty() {
            return result;
        }
        let mut check = |option: &str| {
            if !allowed.iter().any(|a| a == option) {
                result.push(format!("`{option}` is not an allowed option"));
            }
        };
        match (field.field_type, value) {
            (FieldType::Choice, Value::Text(s)) if !s.is_empty() => check(s.as_str()),
            (FieldType::MultiChoice, Value::List(items)) => {
                for item in items {
                    if let Value::Text(s) = item {
                        check(s.as_str());
                    }
                }
            }
            _ => {}
        }
        result
    }
}

fn display_name(field: &FieldDefinition) -> &str {
    if field.label.is_empty() {
        field.id.as_str()
    } else {
        &field.label
    }
}

fn type_label(field_type: FieldType) -> &'static str {
    match field_type {
        FieldType::Text | FieldType::Choice => "text",
        FieldType::Number => "a number",
        FieldType::Boolean => "a boolean",
        FieldType::Date => "a date",
        FieldType::MultiChoice => "a list of options",
    }
}
