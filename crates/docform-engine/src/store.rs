use docform_model::{FieldDefinition, FieldId, Schema, Value};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

use crate::eval::FormulaError;

/// UI-facing state driven by terminal control effects.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FieldUiState {
    pub visible: bool,
    pub enabled: bool,
    /// Allowed options after an `OPTIONS_FILTER` effect; `None` means the schema's full list.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub options: Option<Vec<String>>,
}

impl Default for FieldUiState {
    fn default() -> Self {
        Self {
            visible: true,
            enabled: true,
            options: None,
        }
    }
}

impl FieldUiState {
    pub fn from_definition(def: &FieldDefinition) -> Self {
        Self {
            visible: def.visible,
            enabled: def.enabled,
            options: None,
        }
    }
}

/// Per-field storage.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct FieldSlot {
    pub raw: Value,
    /// Cached formula result; `Some` only for formula fields.
    pub computed: Option<Value>,
    /// Error from the last evaluation of this field's formula.
    pub formula_error: Option<FormulaError>,
    pub ui: FieldUiState,
}

/// Arena of field slots keyed by id.
#[derive(Debug, Clone, Default)]
pub struct FieldValueStore {
    slots: BTreeMap<FieldId, FieldSlot>,
}

impl FieldValueStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// One empty slot per schema field, with the schema's initial UI state.
    pub fn from_schema(schema: &Schema) -> Self {
        let slots = schema
            .fields()
            .map(|def| {
                let slot = FieldSlot {
                    ui: FieldUiState::from_definition(def),
                    ..FieldSlot::default()
                };
                (def.id.clone(), slot)
            })
            .collect();
        Self { slots }
    }

    pub fn contains(&self, field: &str) -> bool {
        self.slots.contains_key(field)
    }

    pub fn slot(&self, field: &str) -> Option<&FieldSlot> {
        self.slots.get(field)
    }

    pub fn raw(&self, field: &str) -> Option<&Value> {
        self.slots.get(field).map(|s| &s.raw)
    }

    /// Stores a raw value and returns the previous one. Unknown fields are ignored.
    pub fn set_raw(&mut self, field: &str, value: Value) -> Option<Value> {
        let slot = self.slots.get_mut(field)?;
        Some(std::mem::replace(&mut slot.raw, value))
    }

    pub fn computed(&self, field: &str) -> Option<&Value> {
        self.slots.get(field).and_then(|s| s.computed.as_ref())
    }

    /// Caches a formula result. An error caches `Null` and keeps the error for diagnostics.
    pub fn set_computed(&mut self, field: &str, result: Result<Value, FormulaError>) {
        let Some(slot) = self.slots.get_mut(field) else {
            return;
        };
        match result {
            Ok(value) => {
                slot.computed = Some(value);
                slot.formula_error = None;
            }
            Err(err) => {
                slot.computed = Some(Value::Null);
                slot.formula_error = Some(err);
            }
        }
    }

    pub fn clear_computed(&mut self, field: &str) {
        if let Some(slot) = self.slots.get_mut(field) {
            slot.computed = None;
            slot.formula_error = None;
        }
    }

    pub fn formula_error(&self, field: &str) -> Option<&FormulaError> {
        self.slots.get(field).and_then(|s| s.formula_error.as_ref())
    }

    pub fn ui(&self, field: &str) -> Option<&FieldUiState> {
        self.slots.get(field).map(|s| &s.ui)
    }

    pub fn ui_mut(&mut self, field: &str) -> Option<&mut FieldUiState> {
        self.slots.get_mut(field).map(|s| &mut s.ui)
    }

    /// Raw values of every field that has one, sorted by id.
    pub fn raw_values(&self) -> BTreeMap<FieldId, Value> {
        self.slots
            .iter()
            .filter(|(_, slot)| !slot.raw.is_null())
            .map(|(id, slot)| (id.clone(), slot.raw.clone()))
            .collect()
    }

    /// Forgets every value and restores the schema's initial UI state.
    pub fn reset(&mut self, schema: &Schema) {
        *self = Self::from_schema(schema);
    }

    pub fn len(&self) -> usize {
        self.slots.len()
    }

    pub fn is_empty(&self) -> bool {
        self.slots.is_empty()
    }
}
